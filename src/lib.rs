//! sportswire-sync - Resilient sports-news ingestion
//!
//! Pulls content from a token-authenticated sports-wire API, matches items to
//! tracked entities, and upserts them idempotently into a local store. OAuth
//! credentials for analytics and social providers renew themselves, and new
//! records can be pushed to connected social accounts.

pub mod cancel;
pub mod config;
pub mod content;
pub mod database;
pub mod error;
pub mod http;
pub mod models;
pub mod oauth;
pub mod publish;
pub mod server;
pub mod sync;
pub mod telemetry;

//! Database layer for sportswire-sync
//!
//! This module defines the persistence traits and their SQLite implementation.

pub mod migrations;
pub mod sqlite;

pub use sqlite::SqliteDatabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DbError;
use crate::models::{Credential, ErrorLogEntry, Provider, SyncRunResult};

/// Durable per-provider credential storage
///
/// Callers receive copies; the stored row is only changed through `put` and
/// `clear`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Get the credential for a provider
    async fn get_credential(&self, provider: Provider) -> Result<Option<Credential>, DbError>;

    /// Insert or replace the credential for `credential.provider`
    async fn put_credential(&self, credential: &Credential) -> Result<(), DbError>;

    /// Remove a provider's credential
    ///
    /// Returns whether a credential existed
    async fn clear_credential(&self, provider: Provider) -> Result<bool, DbError>;

    /// List every stored credential
    async fn list_credentials(&self) -> Result<Vec<Credential>, DbError>;
}

/// Cutoff and run history of the sync engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Start time of the last completed full run
    async fn get_cutoff(&self) -> Result<Option<DateTime<Utc>>, DbError>;

    /// Advance the cutoff
    async fn set_cutoff(&self, cutoff: DateTime<Utc>) -> Result<(), DbError>;

    /// Append a run result, evicting the oldest beyond capacity
    async fn record_run(&self, result: &SyncRunResult) -> Result<(), DbError>;

    /// Most recent run results, newest first
    async fn recent_runs(&self, limit: u32) -> Result<Vec<SyncRunResult>, DbError>;
}

/// Bounded operator-facing error log
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ErrorLog: Send + Sync {
    /// Append an entry, evicting the oldest beyond capacity
    async fn record_error(&self, entry: &ErrorLogEntry) -> Result<(), DbError>;

    /// Most recent entries, newest first
    async fn recent_errors(&self, limit: u32) -> Result<Vec<ErrorLogEntry>, DbError>;
}

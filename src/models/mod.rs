//! Domain models for sportswire-sync
//!
//! This module contains the core domain models used throughout the application.

pub mod content;
pub mod credential;
pub mod sync;

// Re-export commonly used types
pub use content::{
    ContentRecord, ContentWindow, ContentWindowQuery, EntityId, EntityKey, ImageDescriptor,
    LeagueId, RawContentItem, RecordId, RejectedItem, TrackedEntity,
};
pub use credential::{
    expiry_after, Credential, CredentialStatus, FacebookPage, Provider, ProviderPayload,
    TokenResponse, MAX_TOKEN_LIFETIME_SECS,
};
pub use sync::{
    BoundedLog, ErrorLogEntry, LogLevel, PreviewSummary, RunKind, RunLogEntry, SkipReason,
    SyncAction, SyncDecision, SyncRunResult,
};

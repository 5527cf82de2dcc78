//! Application error types for sportswire-sync
//!
//! Each layer has its own error enum. Retryable conditions never leave the
//! HTTP layer except as a single terminal [`HttpError`] after the retry budget
//! is spent. All error types use `thiserror` for ergonomic error handling.

use std::time::Duration;

use thiserror::Error;

use crate::models::Provider;

/// Failure of a single HTTP attempt, before the retry decision is made
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AttemptError {
    /// Request timed out
    #[error("Network timeout")]
    Timeout,

    /// Could not establish a connection (DNS, TLS, refused)
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Connection dropped or body could not be read
    #[error("Network error: {0}")]
    Network(String),

    /// HTTP 429, with the parsed Retry-After hint if any
    #[error("Rate limited")]
    RateLimited {
        /// Server-supplied delay hint
        retry_after: Option<Duration>,
    },

    /// HTTP 5xx
    #[error("Server error: HTTP {0}")]
    ServerError(u16),

    /// HTTP 4xx other than 429 (or any other non-success status)
    #[error("Client error: HTTP {status}")]
    ClientError {
        /// Response status
        status: u16,
        /// Truncated response body
        body: String,
    },

    /// The request itself could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl AttemptError {
    /// Server hint carried by this failure, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AttemptError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Trait for determining if an error is retryable
pub trait RetryableError {
    /// Returns true if the error is retryable
    fn is_retryable(&self) -> bool;
}

impl RetryableError for AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            // Retryable errors
            AttemptError::Timeout => true,
            AttemptError::Connect(_) => true,
            AttemptError::Network(_) => true,
            AttemptError::RateLimited { .. } => true,
            AttemptError::ServerError(_) => true,

            // Non-retryable errors
            AttemptError::ClientError { .. } => false,
            AttemptError::InvalidRequest(_) => false,
        }
    }
}

/// Terminal outcome of a resilient HTTP call
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HttpError {
    /// Transport failures on every attempt
    #[error("Network failure for {url} after {attempts} attempts: {message}")]
    NetworkExhausted {
        url: String,
        attempts: u32,
        message: String,
    },

    /// HTTP 429 on every attempt
    #[error("Rate limited by {url} after {attempts} attempts")]
    RateLimitExhausted { url: String, attempts: u32 },

    /// HTTP 5xx on every attempt
    #[error("Server error HTTP {status} from {url} after {attempts} attempts")]
    ServerErrorExhausted {
        url: String,
        status: u16,
        attempts: u32,
    },

    /// Non-retryable 4xx
    #[error("Client error HTTP {status} from {url}: {body}")]
    ClientError {
        url: String,
        status: u16,
        body: String,
    },

    /// 2xx response whose body could not be decoded
    #[error("Invalid response from {url}: {message}")]
    Decode { url: String, message: String },

    /// Request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Call abandoned at a backoff boundary
    #[error("Request to {url} cancelled")]
    Cancelled { url: String },
}

impl HttpError {
    /// Last HTTP status observed, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::RateLimitExhausted { .. } => Some(429),
            HttpError::ServerErrorExhausted { status, .. } => Some(*status),
            HttpError::ClientError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Response body excerpt for client errors
    pub fn body(&self) -> Option<&str> {
        match self {
            HttpError::ClientError { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DbError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Async connection error
    #[error("Database connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    /// Record not found
    #[error("Record not found")]
    NotFound,

    /// Stored value could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Credential-layer errors
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No credential stored for the provider
    #[error("{0} is not connected")]
    NotConnected(Provider),

    /// Provider rejected the stored grant; a new consent flow is needed
    #[error("{0} requires re-authorization")]
    ReauthRequired(Provider),

    /// Provider has no OAuth configuration
    #[error("{0} is not configured")]
    NotConfigured(Provider),

    /// Callback could not be accepted (state mismatch, provider error)
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// Token endpoint failed after retries
    #[error("Token request failed: {0}")]
    Http(#[from] HttpError),

    /// Credential storage failed
    #[error("Credential storage error: {0}")]
    Store(#[from] DbError),
}

impl CredentialError {
    /// True when progress requires an operator to reconnect the provider
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            CredentialError::NotConnected(_)
                | CredentialError::ReauthRequired(_)
                | CredentialError::NotConfigured(_)
        )
    }
}

/// Content source errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    /// Bearer token could not be obtained
    #[error("Content API authentication failed: {0}")]
    AuthFailed(HttpError),

    /// Content endpoint failed after retries
    #[error("Content API request failed: {0}")]
    UpstreamError(HttpError),

    /// Payload could not be decoded
    #[error("Invalid content payload: {0}")]
    InvalidData(String),
}

/// Per-item storage errors raised by an upsert sink
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UpsertError {
    /// Storage collaborator failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Record to update disappeared
    #[error("Record {0} not found")]
    NotFound(i64),
}

impl From<DbError> for UpsertError {
    fn from(err: DbError) -> Self {
        UpsertError::Storage(err.to_string())
    }
}

/// Outbound publishing errors
#[derive(Debug, Error)]
pub enum PublishError {
    /// Token could not be obtained
    #[error("Publisher credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Publishing call failed
    #[error("Publish request failed: {0}")]
    Http(#[from] HttpError),

    /// Publisher is not usable with the current configuration
    #[error("Publisher not configured: {0}")]
    NotConfigured(String),
}

impl PublishError {
    /// True when retrying within the same run cannot succeed
    pub fn disables_publisher(&self) -> bool {
        match self {
            PublishError::Credential(err) => err.requires_operator(),
            PublishError::NotConfigured(_) => true,
            PublishError::Http(_) => false,
        }
    }
}

/// Run-level synchronization errors
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another run holds the single-flight lock
    #[error("A sync run is already in progress")]
    AlreadyRunning,

    /// Run aborted on a credential failure
    #[error("Sync aborted: {0}")]
    Credential(#[from] CredentialError),

    /// Run aborted on a fetch failure
    #[error("Sync aborted: {0}")]
    Fetch(#[from] FetchError),

    /// Sync state could not be read or written
    #[error("Sync state error: {0}")]
    State(#[from] DbError),

    /// Record lookup failed while classifying
    #[error("Record storage error: {0}")]
    Storage(#[from] UpsertError),

    /// Entity key is not configured
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    /// Scheduler is not accepting requests
    #[error("Scheduler not running")]
    SchedulerUnavailable,

    /// Run exceeded the scheduler timeout
    #[error("Sync timed out after {0} seconds")]
    Timeout(u64),
}

/// Application-level error type
///
/// Aggregates all domain-specific error types.
#[derive(Debug, Error)]
pub enum AppError {
    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    /// Credential error
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Fetch error
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Sync error
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

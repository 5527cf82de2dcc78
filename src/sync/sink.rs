//! Idempotent upsert target for imported content
//!
//! The sink owns record storage. Lookup by external id is the only
//! idempotency mechanism: the engine updates when a record exists and creates
//! otherwise.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::UpsertError;
use crate::models::{ContentRecord, RecordId};

/// Storage for content records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpsertSink: Send + Sync {
    /// Record id for an external id, if one was imported before
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<RecordId>, UpsertError>;

    /// Store a new record
    async fn create_record(&self, record: &ContentRecord) -> Result<RecordId, UpsertError>;

    /// Overwrite an existing record
    async fn update_record(&self, id: RecordId, record: &ContentRecord) -> Result<(), UpsertError>;
}

/// Result of one upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "id", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created(RecordId),
    Updated(RecordId),
}

impl UpsertOutcome {
    pub fn id(&self) -> RecordId {
        match self {
            UpsertOutcome::Created(id) | UpsertOutcome::Updated(id) => *id,
        }
    }
}

//! Content synchronization
//!
//! # Components
//!
//! - [`engine`]: fetch, match, and idempotent upsert runs
//! - [`sink`]: storage seam for content records
//! - [`scheduler`]: periodic full runs with jitter and manual triggers
//!
//! # Example
//!
//! ```ignore
//! use sportswire_sync::sync::SyncEngine;
//!
//! let engine = SyncEngine::new(&config, source, db.clone(), db.clone(), db);
//! let result = engine.run_full(None).await?;
//! println!("{}", result.summary());
//! ```

pub mod engine;
pub mod scheduler;
pub mod sink;

pub use engine::{EngineStatus, SyncEngine};
pub use scheduler::{ManualSyncHandle, SchedulerStatus, SyncScheduler, Syncable};
pub use sink::{UpsertOutcome, UpsertSink};

//! Periodic full-run scheduler
//!
//! Triggers a full sync run at a fixed interval with random jitter, and
//! serves manual trigger requests between ticks.

use crate::config::SchedulerConfig;
use crate::error::SyncError;
use crate::models::SyncRunResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use super::engine::SyncEngine;

/// Something the scheduler can run
#[async_trait]
pub trait Syncable: Send + Sync {
    async fn sync(&self) -> Result<SyncRunResult, SyncError>;

    /// Stop an in-flight run; called when a run exceeds the timeout
    ///
    /// The scheduler keeps awaiting the run afterwards so it can wind down
    /// and record its partial result.
    fn cancel(&self) {}
}

#[async_trait]
impl Syncable for SyncEngine {
    async fn sync(&self) -> Result<SyncRunResult, SyncError> {
        self.run_full(None).await
    }

    fn cancel(&self) {
        SyncEngine::cancel(self);
    }
}

/// Scheduler view of the runs it triggered
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub last_run: Option<DateTime<Utc>>,

    /// Run summary, or the error message
    pub last_outcome: Option<Result<String, String>>,

    pub next_run: Option<DateTime<Utc>>,
    pub in_progress: bool,
}

struct ManualSyncRequest {
    response: oneshot::Sender<Result<SyncRunResult, SyncError>>,
}

/// Interval-driven trigger for full runs
pub struct SyncScheduler {
    config: SchedulerConfig,
    target: Arc<dyn Syncable>,
    status: Arc<RwLock<SchedulerStatus>>,
    shutdown_rx: broadcast::Receiver<()>,
    manual_sync_rx: mpsc::Receiver<ManualSyncRequest>,
    manual_sync_tx: mpsc::Sender<ManualSyncRequest>,
}

impl SyncScheduler {
    pub fn new(
        config: SchedulerConfig,
        target: Arc<dyn Syncable>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (manual_sync_tx, manual_sync_rx) = mpsc::channel(8);

        Self {
            config,
            target,
            status: Arc::new(RwLock::new(SchedulerStatus::default())),
            shutdown_rx,
            manual_sync_rx,
            manual_sync_tx,
        }
    }

    /// Handle for triggering runs from the HTTP surface
    pub fn manual_sync_handle(&self) -> ManualSyncHandle {
        ManualSyncHandle {
            tx: self.manual_sync_tx.clone(),
        }
    }

    /// Shared status, readable while the scheduler runs
    pub fn status_handle(&self) -> Arc<RwLock<SchedulerStatus>> {
        self.status.clone()
    }

    /// Run until the shutdown signal
    pub async fn run(mut self) {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        info!(
            enabled = self.config.enabled,
            interval_secs = interval.as_secs(),
            "Starting sync scheduler"
        );

        let first = Instant::now() + Duration::from_secs(self.config.initial_delay_secs);
        let mut timer = interval_at(first, interval);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping sync scheduler");
                    break;
                }
                Some(request) = self.manual_sync_rx.recv() => {
                    info!("Manual sync triggered");
                    let result = Self::perform_sync(&self.target, &self.status, &self.config).await;
                    let _ = request.response.send(result);
                }
                _ = timer.tick(), if self.config.enabled => {
                    let jitter = if self.config.jitter_secs > 0 {
                        rand::thread_rng().gen_range(0..self.config.jitter_secs)
                    } else {
                        0
                    };
                    if jitter > 0 {
                        debug!(jitter_secs = jitter, "Delaying scheduled sync");
                        tokio::time::sleep(Duration::from_secs(jitter)).await;
                    }

                    info!("Performing scheduled sync");
                    let _ = Self::perform_sync(&self.target, &self.status, &self.config).await;
                    self.status.write().await.next_run = Some(
                        Utc::now() + chrono::Duration::seconds(interval.as_secs() as i64),
                    );
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    async fn perform_sync(
        target: &Arc<dyn Syncable>,
        status: &Arc<RwLock<SchedulerStatus>>,
        config: &SchedulerConfig,
    ) -> Result<SyncRunResult, SyncError> {
        status.write().await.in_progress = true;

        let mut run = target.sync();
        let result = tokio::select! {
            result = &mut run => result,
            _ = tokio::time::sleep(Duration::from_secs(config.sync_timeout_secs)) => {
                warn!(timeout_secs = config.sync_timeout_secs, "Sync exceeded timeout, cancelling");
                target.cancel();
                match run.await {
                    Ok(partial) => info!(summary = %partial.summary(), "Timed out sync wound down"),
                    Err(err) => warn!(error = %err, "Timed out sync failed while winding down"),
                }
                Err(SyncError::Timeout(config.sync_timeout_secs))
            }
        };

        let mut s = status.write().await;
        s.in_progress = false;
        s.last_run = Some(Utc::now());
        s.last_outcome = Some(match &result {
            Ok(run) => {
                info!(summary = %run.summary(), "Scheduled sync completed");
                Ok(run.summary())
            }
            Err(SyncError::AlreadyRunning) => {
                debug!("Sync skipped, a run is already in progress");
                Err(SyncError::AlreadyRunning.to_string())
            }
            Err(err @ SyncError::Timeout(_)) => {
                error!(timeout_secs = config.sync_timeout_secs, "Sync timed out");
                Err(err.to_string())
            }
            Err(err) => {
                warn!(error = %err, "Sync failed");
                Err(err.to_string())
            }
        });

        result
    }
}

/// Sender side of manual trigger requests
#[derive(Clone)]
pub struct ManualSyncHandle {
    tx: mpsc::Sender<ManualSyncRequest>,
}

impl ManualSyncHandle {
    /// Run a full sync through the scheduler and wait for its result
    pub async fn trigger_sync(&self) -> Result<SyncRunResult, SyncError> {
        let (response, response_rx) = oneshot::channel();

        self.tx
            .send(ManualSyncRequest { response })
            .await
            .map_err(|_| SyncError::SchedulerUnavailable)?;

        response_rx
            .await
            .map_err(|_| SyncError::SchedulerUnavailable)?
    }
}

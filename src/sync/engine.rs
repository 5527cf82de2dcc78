//! Sync engine
//!
//! Pulls content windows league by league, attributes each item to a tracked
//! entity, and upserts the matches. Runs are single-flight; previews are not
//! and never write.
//!
//! # Cutoff
//!
//! A full run fetches everything updated after the stored cutoff (or
//! everything, when there is none). The cutoff advances to the run's start
//! time only when every league was fetched and the run was neither cancelled
//! nor aborted. Preview, selective, and entity runs read the cutoff but never
//! advance it; without one they look back `lookback_hours`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::content::{match_item, ContentSource};
use crate::database::{ErrorLog, SyncStateStore};
use crate::error::{FetchError, SyncError, UpsertError};
use crate::models::{
    BoundedLog, ContentRecord, ContentWindowQuery, EntityKey, ErrorLogEntry, LeagueId,
    RawContentItem, RunKind, RunLogEntry, SkipReason, SyncDecision, SyncRunResult,
    TrackedEntity,
};
use crate::publish::SocialPublisher;
use crate::telemetry::SyncMetrics;

use super::sink::{UpsertOutcome, UpsertSink};

/// Which fetched items a run commits
#[derive(Debug, Clone)]
enum ItemFilter {
    All,
    Ids(HashSet<String>),
    Entity(EntityKey),
}

impl ItemFilter {
    fn selects_id(&self, external_id: &str) -> bool {
        match self {
            ItemFilter::Ids(ids) => ids.contains(external_id),
            _ => true,
        }
    }

    /// Whether an undecodable element counts against this run
    fn counts_reject(&self, external_id: Option<&str>) -> bool {
        match self {
            ItemFilter::All => true,
            ItemFilter::Ids(ids) => external_id.is_some_and(|id| ids.contains(id)),
            ItemFilter::Entity(_) => false,
        }
    }
}

/// Snapshot reported by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub cutoff: Option<DateTime<Utc>>,
    pub last_result: Option<SyncRunResult>,
}

/// Mutable state of one run
struct RunState {
    result: SyncRunResult,
    log: BoundedLog<RunLogEntry>,
    disabled_publishers: HashSet<&'static str>,
    all_fetched: bool,
}

impl RunState {
    fn note(&mut self, message: impl Into<String>) {
        self.log.push(RunLogEntry::new(message));
    }
}

/// Holds the cancel token in its running state for the life of one run
struct RunScope<'a>(&'a CancelToken);

impl<'a> RunScope<'a> {
    fn begin(token: &'a CancelToken) -> Self {
        token.begin_run();
        Self(token)
    }
}

impl Drop for RunScope<'_> {
    fn drop(&mut self) {
        self.0.end_run();
    }
}

/// Orchestrates fetch, match, and upsert
pub struct SyncEngine {
    entities: Vec<TrackedEntity>,
    default_leagues: Vec<LeagueId>,
    allowed_content_types: Vec<String>,
    inter_league_pause: Duration,
    lookback: chrono::Duration,
    run_log_capacity: usize,
    import_source: String,
    source: Arc<dyn ContentSource>,
    sink: Arc<dyn UpsertSink>,
    state: Arc<dyn SyncStateStore>,
    errors: Arc<dyn ErrorLog>,
    publishers: Vec<Arc<dyn SocialPublisher>>,
    cancel: CancelToken,
    run_lock: Mutex<()>,
    last_result: RwLock<Option<SyncRunResult>>,
    metrics: Option<Arc<SyncMetrics>>,
}

impl SyncEngine {
    pub fn new(
        config: &Config,
        source: Arc<dyn ContentSource>,
        sink: Arc<dyn UpsertSink>,
        state: Arc<dyn SyncStateStore>,
        errors: Arc<dyn ErrorLog>,
    ) -> Self {
        Self {
            entities: config.enabled_entities(),
            default_leagues: config.sync_leagues(),
            allowed_content_types: config.content_api.allowed_content_types.clone(),
            inter_league_pause: Duration::from_millis(config.sync.inter_league_pause_ms),
            lookback: chrono::Duration::hours(config.sync.lookback_hours as i64),
            run_log_capacity: config.sync.run_log_capacity,
            import_source: config.sync.import_source.clone(),
            source,
            sink,
            state,
            errors,
            publishers: Vec::new(),
            cancel: CancelToken::new(),
            run_lock: Mutex::new(()),
            last_result: RwLock::new(None),
            metrics: None,
        }
    }

    pub fn with_publishers(mut self, publishers: Vec<Arc<dyn SocialPublisher>>) -> Self {
        self.publishers = publishers;
        self
    }

    /// Share a cancellation token, e.g. with the content client's HTTP client
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Request the in-flight run to stop at the next item boundary
    ///
    /// Returns `false` when no run is in progress; nothing is remembered for
    /// later runs or previews.
    pub fn cancel(&self) -> bool {
        let cancelled = self.cancel.cancel_run();
        if cancelled {
            info!("Sync cancellation requested");
        } else {
            debug!("Cancellation requested with no run in progress");
        }
        cancelled
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    pub async fn last_result(&self) -> Option<SyncRunResult> {
        self.last_result.read().await.clone()
    }

    pub async fn status(&self) -> Result<EngineStatus, SyncError> {
        Ok(EngineStatus {
            running: self.is_running(),
            cutoff: self.state.get_cutoff().await?,
            last_result: self.last_result().await,
        })
    }

    /// Fetch, classify, and upsert every league since the stored cutoff
    ///
    /// `None` syncs the configured leagues.
    pub async fn run_full(
        &self,
        leagues: Option<Vec<LeagueId>>,
    ) -> Result<SyncRunResult, SyncError> {
        let _guard = self.run_lock.try_lock().map_err(|_| SyncError::AlreadyRunning)?;
        let cutoff = self.state.get_cutoff().await?;
        let leagues = leagues.unwrap_or_else(|| self.default_leagues.clone());
        self.execute(RunKind::Full, &leagues, cutoff, ItemFilter::All)
            .await
    }

    /// Classify the current window without writing anything
    pub async fn run_preview(
        &self,
        leagues: Option<Vec<LeagueId>>,
    ) -> Result<Vec<SyncDecision>, SyncError> {
        let cutoff = self.window_cutoff().await?;
        let leagues = leagues.unwrap_or_else(|| self.default_leagues.clone());

        let mut decisions = Vec::new();
        for league in league_filters(&leagues) {
            let window = self
                .source
                .fetch(&ContentWindowQuery::new(league, cutoff))
                .await?;
            for item in window.items {
                decisions.push(self.preview_decision(item).await?);
            }
        }

        debug!(decisions = decisions.len(), "Preview classified window");
        Ok(decisions)
    }

    /// Re-fetch the window and commit only the listed external ids
    ///
    /// Items outside the set are neither committed nor counted.
    pub async fn run_selective(&self, external_ids: &[String]) -> Result<SyncRunResult, SyncError> {
        let _guard = self.run_lock.try_lock().map_err(|_| SyncError::AlreadyRunning)?;
        let cutoff = self.window_cutoff().await?;
        let ids: HashSet<String> = external_ids.iter().cloned().collect();
        let leagues = self.default_leagues.clone();
        self.execute(RunKind::Selective, &leagues, cutoff, ItemFilter::Ids(ids))
            .await
    }

    /// Fetch the entity's league window and commit only its items
    pub async fn run_for_entity(&self, key: &EntityKey) -> Result<SyncRunResult, SyncError> {
        let entity = self
            .entities
            .iter()
            .find(|e| &e.key == key)
            .ok_or_else(|| SyncError::UnknownEntity(key.to_string()))?;

        let _guard = self.run_lock.try_lock().map_err(|_| SyncError::AlreadyRunning)?;
        let cutoff = self.window_cutoff().await?;
        let leagues = match entity.league_id {
            Some(league) => vec![league],
            None => self.default_leagues.clone(),
        };
        self.execute(
            RunKind::Entity,
            &leagues,
            cutoff,
            ItemFilter::Entity(key.clone()),
        )
        .await
    }

    /// Create or update the record for an item
    ///
    /// Lookup by external id is the only idempotency mechanism.
    pub async fn upsert(
        &self,
        item: &RawContentItem,
        entity_key: &EntityKey,
    ) -> Result<UpsertOutcome, UpsertError> {
        let record = ContentRecord::from_item(item, entity_key, &self.import_source, Utc::now());
        match self.sink.find_by_external_id(&item.external_id).await? {
            Some(id) => {
                self.sink.update_record(id, &record).await?;
                Ok(UpsertOutcome::Updated(id))
            }
            None => {
                let id = self.sink.create_record(&record).await?;
                Ok(UpsertOutcome::Created(id))
            }
        }
    }

    async fn window_cutoff(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        let stored = self.state.get_cutoff().await?;
        Ok(Some(stored.unwrap_or_else(|| Utc::now() - self.lookback)))
    }

    fn allows_content_type(&self, content_type: &str) -> bool {
        self.allowed_content_types.is_empty()
            || self
                .allowed_content_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(content_type))
    }

    /// Entity and skip reason for an item, without touching storage
    fn classify(&self, item: &RawContentItem) -> (Option<EntityKey>, Option<SkipReason>) {
        match match_item(item, &self.entities) {
            None => (None, Some(SkipReason::NoMatch)),
            Some(key) if !self.allows_content_type(&item.content_type) => {
                (Some(key), Some(SkipReason::ContentTypeFiltered))
            }
            Some(key) => (Some(key), None),
        }
    }

    async fn preview_decision(&self, item: RawContentItem) -> Result<SyncDecision, SyncError> {
        let (key, skip) = self.classify(&item);
        match (key, skip) {
            (key, Some(reason)) => Ok(SyncDecision::skip(item, key, reason)),
            (Some(key), None) => match self.sink.find_by_external_id(&item.external_id).await? {
                Some(id) => Ok(SyncDecision::update(item, key, id)),
                None => Ok(SyncDecision::create(item, key)),
            },
            (None, None) => Ok(SyncDecision::skip(item, None, SkipReason::NoMatch)),
        }
    }

    async fn execute(
        &self,
        kind: RunKind,
        leagues: &[LeagueId],
        cutoff: Option<DateTime<Utc>>,
        filter: ItemFilter,
    ) -> Result<SyncRunResult, SyncError> {
        let _scope = RunScope::begin(&self.cancel);
        let started_at = Utc::now();
        let mut run = RunState {
            result: SyncRunResult::new(kind, started_at),
            log: BoundedLog::new(self.run_log_capacity),
            disabled_publishers: HashSet::new(),
            all_fetched: true,
        };

        info!(kind = %kind, leagues = ?leagues, cutoff = ?cutoff, "Sync run started");
        run.note(format!(
            "{} sync started, cutoff {}",
            kind,
            cutoff.map_or_else(|| "none".to_string(), |c| c.to_rfc3339())
        ));

        'leagues: for (index, league) in league_filters(leagues).into_iter().enumerate() {
            if index > 0 && !self.pause_between_leagues().await {
                run.result.cancelled = true;
                break;
            }
            if self.cancel.is_cancelled() {
                run.result.cancelled = true;
                break;
            }

            let window = match self.source.fetch(&ContentWindowQuery::new(league, cutoff)).await {
                Ok(window) => window,
                Err(err @ FetchError::AuthFailed(_)) => {
                    error!(league = ?league, error = %err, "Sync aborted");
                    run.note(format!("aborted: {}", err));
                    run.result.aborted = Some(err.to_string());
                    run.all_fetched = false;
                    self.log_error(
                        ErrorLogEntry::error("sync.fetch", err.to_string())
                            .with_data(serde_json::json!({ "league": league, "fatal": true })),
                    )
                    .await;
                    break;
                }
                Err(err) => {
                    warn!(league = ?league, error = %err, "League fetch failed, continuing");
                    run.note(format!("league {:?} fetch failed: {}", league, err));
                    run.all_fetched = false;
                    self.log_error(
                        ErrorLogEntry::error("sync.fetch", err.to_string())
                            .with_data(serde_json::json!({ "league": league })),
                    )
                    .await;
                    continue;
                }
            };

            let before = (
                run.result.created,
                run.result.updated,
                run.result.skipped,
                run.result.errored,
            );
            for rejected in window.rejected {
                if filter.counts_reject(rejected.external_id.as_deref()) {
                    run.result.errored += 1;
                }
                run.note(format!(
                    "undecodable item {} in league {:?}: {}",
                    rejected.external_id.as_deref().unwrap_or("<no id>"),
                    league,
                    rejected.reason
                ));
                let data = serde_json::json!({
                    "league": league,
                    "external_id": rejected.external_id,
                });
                self.log_error(ErrorLogEntry::error("sync.decode", rejected.reason).with_data(data))
                    .await;
            }
            for item in window.items {
                if self.cancel.is_cancelled() {
                    run.result.cancelled = true;
                    break 'leagues;
                }
                self.process_item(&mut run, &filter, item).await;
            }

            info!(
                league = ?league,
                created = run.result.created - before.0,
                updated = run.result.updated - before.1,
                skipped = run.result.skipped - before.2,
                errored = run.result.errored - before.3,
                "League synced"
            );
        }

        if run.result.cancelled {
            info!(kind = %kind, "Sync run cancelled");
            run.note("cancelled");
        }

        if kind == RunKind::Full && run.all_fetched && run.result.is_complete() {
            match self.state.set_cutoff(started_at).await {
                Ok(()) => {
                    debug!(cutoff = %started_at, "Cutoff advanced");
                    run.note(format!("cutoff advanced to {}", started_at.to_rfc3339()));
                }
                Err(err) => {
                    error!(error = %err, "Failed to advance cutoff");
                    self.log_error(ErrorLogEntry::error("sync.cutoff", err.to_string()))
                        .await;
                }
            }
        }

        run.result.finished_at = Utc::now();
        run.note(run.result.summary());
        let RunState { mut result, log, .. } = run;
        result.log = log.into_vec();

        info!(
            kind = %kind,
            created = result.created,
            updated = result.updated,
            skipped = result.skipped,
            errored = result.errored,
            cancelled = result.cancelled,
            aborted = result.aborted.is_some(),
            "Sync run finished"
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_run(&result);
        }
        if let Err(err) = self.state.record_run(&result).await {
            error!(error = %err, "Failed to persist run result");
        }
        *self.last_result.write().await = Some(result.clone());

        Ok(result)
    }

    /// Sleep between leagues; false when cancelled meanwhile
    async fn pause_between_leagues(&self) -> bool {
        if self.inter_league_pause.is_zero() {
            return !self.cancel.is_cancelled();
        }
        self.cancel.sleep(self.inter_league_pause).await
    }

    async fn process_item(&self, run: &mut RunState, filter: &ItemFilter, item: RawContentItem) {
        if !filter.selects_id(&item.external_id) {
            return;
        }

        let (key, skip) = self.classify(&item);
        if let ItemFilter::Entity(wanted) = filter {
            if key.as_ref() != Some(wanted) {
                return;
            }
        }

        let key = match (key, skip) {
            (Some(key), None) => key,
            (_, reason) => {
                debug!(external_id = %item.external_id, reason = ?reason, "Item skipped");
                run.result.skipped += 1;
                return;
            }
        };

        match self.upsert(&item, &key).await {
            Ok(UpsertOutcome::Updated(id)) => {
                debug!(external_id = %item.external_id, record_id = id, "Record updated");
                run.result.updated += 1;
            }
            Ok(UpsertOutcome::Created(id)) => {
                debug!(external_id = %item.external_id, record_id = id, "Record created");
                run.result.created += 1;
                run.note(format!("created {} for {}", item.external_id, key));
                let record = ContentRecord::from_item(&item, &key, &self.import_source, Utc::now());
                self.publish(run, &record, id).await;
            }
            Err(err) => {
                warn!(external_id = %item.external_id, entity = %key, error = %err, "Upsert failed");
                run.result.errored += 1;
                run.note(format!("upsert of {} failed: {}", item.external_id, err));
                let data = serde_json::json!({
                    "external_id": item.external_id,
                    "entity": key.as_str(),
                    "league": item.league_id,
                });
                self.log_error(ErrorLogEntry::error("sync.upsert", err.to_string()).with_data(data))
                    .await;
            }
        }
    }

    async fn publish(&self, run: &mut RunState, record: &ContentRecord, id: i64) {
        for publisher in &self.publishers {
            let name = publisher.name();
            if run.disabled_publishers.contains(name) {
                continue;
            }

            if let Err(err) = publisher.publish(record, id).await {
                warn!(publisher = name, record_id = id, error = %err, "Publish failed");
                self.log_error(
                    ErrorLogEntry::error(format!("publish.{}", name), err.to_string()).with_data(
                        serde_json::json!({ "record_id": id, "external_id": record.external_id }),
                    ),
                )
                .await;

                if err.disables_publisher() {
                    run.disabled_publishers.insert(name);
                    run.note(format!("{} publishing disabled for this run: {}", name, err));
                }
            }
        }
    }

    async fn log_error(&self, entry: ErrorLogEntry) {
        if let Err(err) = self.errors.record_error(&entry).await {
            warn!(error = %err, "Failed to write error log entry");
        }
    }
}

/// One fetch per league; no leagues means a single unfiltered fetch
fn league_filters(leagues: &[LeagueId]) -> Vec<Option<LeagueId>> {
    if leagues.is_empty() {
        vec![None]
    } else {
        leagues.iter().copied().map(Some).collect()
    }
}

//! Sync run models
//!
//! Per-item decisions, run results, and the operator-facing log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use super::content::{EntityKey, RawContentItem, RecordId};

/// What a run does with one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Create,
    Update,
    Skip,
}

/// Why an item was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoMatch,
    ContentTypeFiltered,
}

/// Classification of one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDecision {
    pub item: RawContentItem,
    pub entity_key: Option<EntityKey>,
    pub action: SyncAction,

    /// Existing record, present iff the action is update
    pub existing_record: Option<RecordId>,

    /// Present iff the action is skip
    pub skip_reason: Option<SkipReason>,
}

impl SyncDecision {
    pub fn create(item: RawContentItem, entity_key: EntityKey) -> Self {
        Self {
            item,
            entity_key: Some(entity_key),
            action: SyncAction::Create,
            existing_record: None,
            skip_reason: None,
        }
    }

    pub fn update(item: RawContentItem, entity_key: EntityKey, existing: RecordId) -> Self {
        Self {
            item,
            entity_key: Some(entity_key),
            action: SyncAction::Update,
            existing_record: Some(existing),
            skip_reason: None,
        }
    }

    pub fn skip(item: RawContentItem, entity_key: Option<EntityKey>, reason: SkipReason) -> Self {
        Self {
            item,
            entity_key,
            action: SyncAction::Skip,
            existing_record: None,
            skip_reason: Some(reason),
        }
    }
}

/// Counts of a preview, by action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewSummary {
    pub creates: u64,
    pub updates: u64,
    pub skips: u64,
}

impl PreviewSummary {
    pub fn from_decisions(decisions: &[SyncDecision]) -> Self {
        let mut summary = Self::default();
        for decision in decisions {
            match decision.action {
                SyncAction::Create => summary.creates += 1,
                SyncAction::Update => summary.updates += 1,
                SyncAction::Skip => summary.skips += 1,
            }
        }
        summary
    }
}

/// Which operation produced a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Full,
    Entity,
    Selective,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunKind::Full => "full",
            RunKind::Entity => "entity",
            RunKind::Selective => "selective",
        };
        f.write_str(s)
    }
}

/// Human-readable line of a run log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl RunLogEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

/// Outcome of a full, entity, or selective run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunResult {
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errored: u64,

    /// Stopped early by a cancellation request
    pub cancelled: bool,

    /// Reason the run stopped on a fatal error
    pub aborted: Option<String>,

    /// Newest first, capped
    pub log: Vec<RunLogEntry>,
}

impl SyncRunResult {
    pub fn new(kind: RunKind, started_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            started_at,
            finished_at: started_at,
            created: 0,
            updated: 0,
            skipped: 0,
            errored: 0,
            cancelled: false,
            aborted: None,
            log: Vec::new(),
        }
    }

    /// Items that reached a decision
    pub fn total(&self) -> u64 {
        self.created + self.updated + self.skipped + self.errored
    }

    /// One-line summary with all four counters
    pub fn summary(&self) -> String {
        format!(
            "{} sync: created={} updated={} skipped={} errored={}",
            self.kind, self.created, self.updated, self.skipped, self.errored
        )
    }

    /// Completed without being cancelled or aborted
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.aborted.is_none()
    }
}

/// Severity of an error log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// Operator-facing record of a failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub level: LogLevel,

    /// Subsystem tag, e.g. `sync` or `oauth.twitter`
    pub context: String,

    pub message: String,

    /// Structured details
    pub data: serde_json::Value,

    pub timestamp: DateTime<Utc>,
}

impl ErrorLogEntry {
    pub fn new(level: LogLevel, context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            context: context.into(),
            message: message.into(),
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn error(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, context, message)
    }

    pub fn warning(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, context, message)
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Newest-first log that drops its oldest entries past a capacity
#[derive(Debug, Clone)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedLog<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, entry: T) {
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.entries.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: Decision constructors uphold action invariants
    #[test]
    fn test_decision_constructors() {
        let item = RawContentItem::new("x", "Headline");

        let create = SyncDecision::create(item.clone(), EntityKey::from("a"));
        assert_eq!(create.action, SyncAction::Create);
        assert_eq!(create.existing_record, None);
        assert_eq!(create.skip_reason, None);

        let update = SyncDecision::update(item.clone(), EntityKey::from("a"), 7);
        assert_eq!(update.action, SyncAction::Update);
        assert_eq!(update.existing_record, Some(7));

        let skip = SyncDecision::skip(item, None, SkipReason::NoMatch);
        assert_eq!(skip.action, SyncAction::Skip);
        assert_eq!(skip.entity_key, None);
        assert_eq!(skip.skip_reason, Some(SkipReason::NoMatch));
    }

    // Test 2: Preview summary counts by action
    #[test]
    fn test_preview_summary() {
        let item = RawContentItem::new("x", "Headline");
        let decisions = vec![
            SyncDecision::create(item.clone(), EntityKey::from("a")),
            SyncDecision::update(item.clone(), EntityKey::from("a"), 1),
            SyncDecision::skip(item.clone(), None, SkipReason::NoMatch),
            SyncDecision::skip(item, Some(EntityKey::from("a")), SkipReason::ContentTypeFiltered),
        ];

        let summary = PreviewSummary::from_decisions(&decisions);
        assert_eq!(
            summary,
            PreviewSummary {
                creates: 1,
                updates: 1,
                skips: 2
            }
        );
    }

    // Test 3: Bounded log keeps the newest entries first
    #[test]
    fn test_bounded_log_eviction() {
        let mut log = BoundedLog::new(3);
        for i in 1..=5 {
            log.push(i);
        }

        assert_eq!(log.len(), 3);
        assert_eq!(log.into_vec(), vec![5, 4, 3]);
    }

    // Test 4: Zero capacity keeps nothing
    #[test]
    fn test_bounded_log_zero_capacity() {
        let mut log = BoundedLog::new(0);
        log.push("entry");
        assert!(log.is_empty());
    }

    // Test 5: Run summary carries all counters
    #[test]
    fn test_run_result_summary() {
        let mut result = SyncRunResult::new(RunKind::Full, Utc::now());
        result.created = 2;
        result.skipped = 1;
        result.errored = 1;

        assert_eq!(result.total(), 4);
        assert_eq!(
            result.summary(),
            "full sync: created=2 updated=0 skipped=1 errored=1"
        );
        assert!(result.is_complete());

        result.cancelled = true;
        assert!(!result.is_complete());
    }

    // Test 6: Log level string forms
    #[test]
    fn test_log_level_parse() {
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert!("fatal".parse::<LogLevel>().is_err());
        assert_eq!(
            serde_json::to_string(&LogLevel::Error).unwrap(),
            "\"error\""
        );
        assert!(LogLevel::Error > LogLevel::Info);
    }
}

//! Database migrations for sportswire-sync
//!
//! This module contains SQL migrations for the SQLite database schema.

/// SQL statement to create the initial database schema
pub const CREATE_SCHEMA: &str = r#"
-- OAuth credentials, one row per provider
CREATE TABLE IF NOT EXISTS credentials (
    provider TEXT PRIMARY KEY,
    access_token TEXT NOT NULL,
    refresh_token TEXT,
    expires_at TEXT NOT NULL,
    scope TEXT,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Key/value sync state (last successful cutoff)
CREATE TABLE IF NOT EXISTS sync_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Recent run results, newest has the highest id
CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    errored INTEGER NOT NULL DEFAULT 0,
    cancelled INTEGER NOT NULL DEFAULT 0,
    aborted TEXT,
    log TEXT NOT NULL
);

-- Operator-facing error log
CREATE TABLE IF NOT EXISTS error_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    level TEXT NOT NULL,
    context TEXT NOT NULL,
    message TEXT NOT NULL,
    data TEXT,
    timestamp TEXT NOT NULL
);

-- Imported content records
CREATE TABLE IF NOT EXISTS content_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL UNIQUE,
    entity_key TEXT NOT NULL,
    league_id INTEGER,
    headline TEXT NOT NULL,
    body TEXT NOT NULL,
    byline TEXT,
    content_type TEXT NOT NULL,
    image TEXT,
    source_updated_at TEXT NOT NULL,
    imported_at TEXT NOT NULL,
    import_source TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_entity ON content_records(entity_key);
"#;

/// Get the migration version
pub fn migration_version() -> i32 {
    1
}

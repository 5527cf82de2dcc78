//! SQLite implementation of the persistence traits
//!
//! This module provides a SQLite-based implementation of the credential store,
//! sync state store, error log, and content upsert sink using rusqlite and
//! tokio-rusqlite for async operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

use super::migrations::{migration_version, CREATE_SCHEMA};
use super::{CredentialStore, ErrorLog, SyncStateStore};
use crate::error::{DbError, UpsertError};
use crate::models::{
    ContentRecord, Credential, EntityKey, ErrorLogEntry, ImageDescriptor, LogLevel, Provider,
    ProviderPayload, RecordId, RunKind, RunLogEntry, SyncRunResult,
};
use crate::sync::UpsertSink;

const CUTOFF_KEY: &str = "last_successful_cutoff";

const DEFAULT_RUN_CAPACITY: usize = 500;
const DEFAULT_ERROR_CAPACITY: usize = 200;

/// SQLite database implementation
pub struct SqliteDatabase {
    conn: Connection,
    run_capacity: usize,
    error_capacity: usize,
}

impl SqliteDatabase {
    /// Create a new SQLite database connection
    ///
    /// Use `:memory:` for in-memory database or a file path for persistent storage.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let conn = Connection::open(path).await?;

        let version = migration_version();
        conn.call(move |conn| {
            conn.execute_batch(CREATE_SCHEMA)?;
            conn.pragma_update(None, "user_version", version)?;
            Ok(())
        })
        .await?;

        Ok(Self {
            conn,
            run_capacity: DEFAULT_RUN_CAPACITY,
            error_capacity: DEFAULT_ERROR_CAPACITY,
        })
    }

    /// Create a new in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self, DbError> {
        Self::new(":memory:").await
    }

    /// Set how many run results and error entries are kept
    pub fn with_capacities(mut self, runs: usize, errors: usize) -> Self {
        self.run_capacity = runs;
        self.error_capacity = errors;
        self
    }

    /// Get a content record by id
    pub async fn get_record(&self, id: RecordId) -> Result<Option<ContentRecord>, DbError> {
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        r#"
                        SELECT external_id, entity_key, league_id, headline, body, byline,
                               content_type, image, source_updated_at, imported_at, import_source
                        FROM content_records
                        WHERE id = ?1
                        "#,
                        [id],
                        |row| {
                            Ok(RecordRow {
                                external_id: row.get(0)?,
                                entity_key: row.get(1)?,
                                league_id: row.get(2)?,
                                headline: row.get(3)?,
                                body: row.get(4)?,
                                byline: row.get(5)?,
                                content_type: row.get(6)?,
                                image: row.get(7)?,
                                source_updated_at: row.get(8)?,
                                imported_at: row.get(9)?,
                                import_source: row.get(10)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        row.map(RecordRow::into_record).transpose()
    }

    /// Number of stored content records
    pub async fn count_records(&self) -> Result<u64, DbError> {
        self.conn
            .call(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM content_records", [], |row| row.get(0))?;
                Ok(count as u64)
            })
            .await
            .map_err(Into::into)
    }
}

// =========================================================================
// Credential store
// =========================================================================

#[async_trait]
impl CredentialStore for SqliteDatabase {
    async fn get_credential(&self, provider: Provider) -> Result<Option<Credential>, DbError> {
        let key = provider.as_str();

        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        r#"
                        SELECT provider, access_token, refresh_token, expires_at, scope, payload, updated_at
                        FROM credentials
                        WHERE provider = ?1
                        "#,
                        [key],
                        CredentialRow::from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        row.map(CredentialRow::into_credential).transpose()
    }

    async fn put_credential(&self, credential: &Credential) -> Result<(), DbError> {
        let provider = credential.provider.as_str();
        let access_token = credential.access_token.clone();
        let refresh_token = credential.refresh_token.clone();
        let expires_at = credential.expires_at.to_rfc3339();
        let scope = credential.scope.clone();
        let payload = serde_json::to_string(&credential.payload)
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        let updated_at = credential.updated_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT OR REPLACE INTO credentials
                    (provider, access_token, refresh_token, expires_at, scope, payload, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    rusqlite::params![
                        provider,
                        access_token,
                        refresh_token,
                        expires_at,
                        scope,
                        payload,
                        updated_at
                    ],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    async fn clear_credential(&self, provider: Provider) -> Result<bool, DbError> {
        let key = provider.as_str();

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute("DELETE FROM credentials WHERE provider = ?1", [key])?;
                Ok(count)
            })
            .await?;

        Ok(rows_affected > 0)
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>, DbError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT provider, access_token, refresh_token, expires_at, scope, payload, updated_at
                    FROM credentials
                    ORDER BY provider
                    "#,
                )?;
                let rows = stmt
                    .query_map([], CredentialRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(CredentialRow::into_credential).collect()
    }
}

// =========================================================================
// Sync state
// =========================================================================

#[async_trait]
impl SyncStateStore for SqliteDatabase {
    async fn get_cutoff(&self) -> Result<Option<DateTime<Utc>>, DbError> {
        let value = self
            .conn
            .call(|conn| {
                let value: Option<String> = conn
                    .query_row(
                        "SELECT value FROM sync_state WHERE key = ?1",
                        [CUTOFF_KEY],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await?;

        Ok(parse_datetime(value))
    }

    async fn set_cutoff(&self, cutoff: DateTime<Utc>) -> Result<(), DbError> {
        let value = cutoff.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO sync_state (key, value) VALUES (?1, ?2)",
                    rusqlite::params![CUTOFF_KEY, value],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    async fn record_run(&self, result: &SyncRunResult) -> Result<(), DbError> {
        let kind = result.kind.to_string();
        let started_at = result.started_at.to_rfc3339();
        let finished_at = result.finished_at.to_rfc3339();
        let counts = [
            result.created as i64,
            result.updated as i64,
            result.skipped as i64,
            result.errored as i64,
        ];
        let cancelled = result.cancelled;
        let aborted = result.aborted.clone();
        let log = serde_json::to_string(&result.log)
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        let capacity = self.run_capacity as i64;

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    r#"
                    INSERT INTO sync_runs
                    (kind, started_at, finished_at, created, updated, skipped, errored, cancelled, aborted, log)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    "#,
                    rusqlite::params![
                        kind,
                        started_at,
                        finished_at,
                        counts[0],
                        counts[1],
                        counts[2],
                        counts[3],
                        cancelled,
                        aborted,
                        log
                    ],
                )?;
                tx.execute(
                    "DELETE FROM sync_runs WHERE id NOT IN (SELECT id FROM sync_runs ORDER BY id DESC LIMIT ?1)",
                    [capacity],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    async fn recent_runs(&self, limit: u32) -> Result<Vec<SyncRunResult>, DbError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT kind, started_at, finished_at, created, updated, skipped, errored,
                           cancelled, aborted, log
                    FROM sync_runs
                    ORDER BY id DESC
                    LIMIT ?1
                    "#,
                )?;
                let rows = stmt
                    .query_map([limit], |row| {
                        Ok(RunRow {
                            kind: row.get(0)?,
                            started_at: row.get(1)?,
                            finished_at: row.get(2)?,
                            created: row.get(3)?,
                            updated: row.get(4)?,
                            skipped: row.get(5)?,
                            errored: row.get(6)?,
                            cancelled: row.get(7)?,
                            aborted: row.get(8)?,
                            log: row.get(9)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(RunRow::into_result).collect()
    }
}

// =========================================================================
// Error log
// =========================================================================

#[async_trait]
impl ErrorLog for SqliteDatabase {
    async fn record_error(&self, entry: &ErrorLogEntry) -> Result<(), DbError> {
        let level = entry.level.as_str();
        let context = entry.context.clone();
        let message = entry.message.clone();
        let data = if entry.data.is_null() {
            None
        } else {
            Some(entry.data.to_string())
        };
        let timestamp = entry.timestamp.to_rfc3339();
        let capacity = self.error_capacity as i64;

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    r#"
                    INSERT INTO error_log (level, context, message, data, timestamp)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                    rusqlite::params![level, context, message, data, timestamp],
                )?;
                tx.execute(
                    "DELETE FROM error_log WHERE id NOT IN (SELECT id FROM error_log ORDER BY id DESC LIMIT ?1)",
                    [capacity],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    async fn recent_errors(&self, limit: u32) -> Result<Vec<ErrorLogEntry>, DbError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT level, context, message, data, timestamp
                    FROM error_log
                    ORDER BY id DESC
                    LIMIT ?1
                    "#,
                )?;
                let rows = stmt
                    .query_map([limit], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(level, context, message, data, timestamp)| {
                Ok(ErrorLogEntry {
                    level: level.parse().unwrap_or(LogLevel::Error),
                    context,
                    message,
                    data: data
                        .map(|d| serde_json::from_str(&d))
                        .transpose()
                        .map_err(|e| DbError::Serialization(e.to_string()))?
                        .unwrap_or(serde_json::Value::Null),
                    timestamp: parse_datetime(Some(timestamp)).unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }
}

// =========================================================================
// Content records
// =========================================================================

#[async_trait]
impl UpsertSink for SqliteDatabase {
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<RecordId>, UpsertError> {
        let external_id = external_id.to_string();

        self.conn
            .call(move |conn| {
                let id: Option<RecordId> = conn
                    .query_row(
                        "SELECT id FROM content_records WHERE external_id = ?1",
                        [&external_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(id)
            })
            .await
            .map_err(|e| DbError::from(e).into())
    }

    async fn create_record(&self, record: &ContentRecord) -> Result<RecordId, UpsertError> {
        let values = RecordValues::from_record(record)?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO content_records
                    (external_id, entity_key, league_id, headline, body, byline, content_type,
                     image, source_updated_at, imported_at, import_source)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                    "#,
                    rusqlite::params![
                        values.external_id,
                        values.entity_key,
                        values.league_id,
                        values.headline,
                        values.body,
                        values.byline,
                        values.content_type,
                        values.image,
                        values.source_updated_at,
                        values.imported_at,
                        values.import_source
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(|e| DbError::from(e).into())
    }

    async fn update_record(&self, id: RecordId, record: &ContentRecord) -> Result<(), UpsertError> {
        let values = RecordValues::from_record(record)?;

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    r#"
                    UPDATE content_records
                    SET external_id = ?1, entity_key = ?2, league_id = ?3, headline = ?4,
                        body = ?5, byline = ?6, content_type = ?7, image = ?8,
                        source_updated_at = ?9, imported_at = ?10, import_source = ?11
                    WHERE id = ?12
                    "#,
                    rusqlite::params![
                        values.external_id,
                        values.entity_key,
                        values.league_id,
                        values.headline,
                        values.body,
                        values.byline,
                        values.content_type,
                        values.image,
                        values.source_updated_at,
                        values.imported_at,
                        values.import_source,
                        id
                    ],
                )?;
                Ok(count)
            })
            .await
            .map_err(DbError::from)?;

        if rows_affected == 0 {
            return Err(UpsertError::NotFound(id));
        }

        Ok(())
    }
}

// =========================================================================
// Row conversions
// =========================================================================

struct CredentialRow {
    provider: String,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: String,
    scope: Option<String>,
    payload: String,
    updated_at: String,
}

impl CredentialRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            provider: row.get(0)?,
            access_token: row.get(1)?,
            refresh_token: row.get(2)?,
            expires_at: row.get(3)?,
            scope: row.get(4)?,
            payload: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_credential(self) -> Result<Credential, DbError> {
        let provider: Provider = self.provider.parse().map_err(DbError::Serialization)?;
        let payload: ProviderPayload = serde_json::from_str(&self.payload)
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        let expires_at = parse_datetime(Some(self.expires_at)).ok_or_else(|| {
            DbError::Serialization(format!("invalid expiry for {}", provider))
        })?;

        Ok(Credential {
            provider,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            scope: self.scope,
            payload,
            updated_at: parse_datetime(Some(self.updated_at)).unwrap_or(expires_at),
        })
    }
}

struct RunRow {
    kind: String,
    started_at: String,
    finished_at: String,
    created: i64,
    updated: i64,
    skipped: i64,
    errored: i64,
    cancelled: bool,
    aborted: Option<String>,
    log: String,
}

impl RunRow {
    fn into_result(self) -> Result<SyncRunResult, DbError> {
        let kind = match self.kind.as_str() {
            "full" => RunKind::Full,
            "entity" => RunKind::Entity,
            "selective" => RunKind::Selective,
            other => return Err(DbError::Serialization(format!("unknown run kind: {}", other))),
        };
        let log: Vec<RunLogEntry> =
            serde_json::from_str(&self.log).map_err(|e| DbError::Serialization(e.to_string()))?;
        let started_at = parse_datetime(Some(self.started_at)).unwrap_or_else(Utc::now);

        Ok(SyncRunResult {
            kind,
            started_at,
            finished_at: parse_datetime(Some(self.finished_at)).unwrap_or(started_at),
            created: self.created as u64,
            updated: self.updated as u64,
            skipped: self.skipped as u64,
            errored: self.errored as u64,
            cancelled: self.cancelled,
            aborted: self.aborted,
            log,
        })
    }
}

struct RecordRow {
    external_id: String,
    entity_key: String,
    league_id: Option<i64>,
    headline: String,
    body: String,
    byline: Option<String>,
    content_type: String,
    image: Option<String>,
    source_updated_at: String,
    imported_at: String,
    import_source: String,
}

impl RecordRow {
    fn into_record(self) -> Result<ContentRecord, DbError> {
        let image: Option<ImageDescriptor> = self
            .image
            .map(|i| serde_json::from_str(&i))
            .transpose()
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        let source_updated_at = parse_datetime(Some(self.source_updated_at))
            .ok_or_else(|| DbError::Serialization("invalid source_updated_at".to_string()))?;

        Ok(ContentRecord {
            external_id: self.external_id,
            entity_key: EntityKey(self.entity_key),
            league_id: self.league_id.map(|l| l as u64),
            headline: self.headline,
            body: self.body,
            byline: self.byline,
            content_type: self.content_type,
            image,
            source_updated_at,
            imported_at: parse_datetime(Some(self.imported_at)).unwrap_or(source_updated_at),
            import_source: self.import_source,
        })
    }
}

/// Owned column values of a record, ready to move into a connection call
struct RecordValues {
    external_id: String,
    entity_key: String,
    league_id: Option<i64>,
    headline: String,
    body: String,
    byline: Option<String>,
    content_type: String,
    image: Option<String>,
    source_updated_at: String,
    imported_at: String,
    import_source: String,
}

impl RecordValues {
    fn from_record(record: &ContentRecord) -> Result<Self, UpsertError> {
        let image = record
            .image
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| UpsertError::Storage(e.to_string()))?;

        Ok(Self {
            external_id: record.external_id.clone(),
            entity_key: record.entity_key.as_str().to_string(),
            league_id: record.league_id.map(|l| l as i64),
            headline: record.headline.clone(),
            body: record.body.clone(),
            byline: record.byline.clone(),
            content_type: record.content_type.clone(),
            image,
            source_updated_at: record.source_updated_at.to_rfc3339(),
            imported_at: record.imported_at.to_rfc3339(),
            import_source: record.import_source.clone(),
        })
    }
}

/// Parse a datetime string to DateTime<Utc>
fn parse_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| {
                // Try parsing SQLite's datetime format
                chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|dt| dt.and_utc())
            })
    })
}

//! SQLite persistence via sqlx.
//!
//! Pool setup mirrors an unattended single-writer workload: WAL journal
//! mode, a generous busy timeout, and schema applied idempotently at
//! startup.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};

use crate::event::IngestedEvent;
use crate::stats::StreamStats;
use crate::storage::{EventStore, MergeOutcome, StateStore, StoreError, StoreResult};
use crate::Result;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Default connection pool size.
const DEFAULT_POOL_SIZE: u32 = 5;

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Initialize the connection pool with WAL mode.
pub async fn init_pool(database_url: &str) -> Result<DbPool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        .create_if_missing(true)
        .foreign_keys(true);

    // An in-memory database exists per connection, so the pool must not
    // open a second one.
    let max_connections = if database_url.contains(":memory:") || database_url.contains("mode=memory")
    {
        1
    } else {
        DEFAULT_POOL_SIZE
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Apply the schema. Safe to run on every startup.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_events (
            message_id   TEXT PRIMARY KEY,
            stream_id    TEXT NOT NULL,
            author_id    TEXT NOT NULL,
            kind         TEXT NOT NULL,
            published_at TEXT,
            payload      TEXT NOT NULL,
            recorded_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chat_events_stream ON chat_events(stream_id, published_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stats_snapshots (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            stream_id          TEXT NOT NULL,
            observed_at        TEXT NOT NULL,
            broadcast_status   TEXT NOT NULL,
            actual_end_time    TEXT,
            concurrent_viewers INTEGER,
            view_count         INTEGER,
            like_count         INTEGER,
            comment_count      INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS worker_state (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// SQLite-backed implementation of both store traits.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

/// Classify an sqlx error: pool/connection trouble means the whole batch
/// should be requeued, anything else is a per-event rejection.
fn classify(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StoreError::Unavailable(e.to_string()),
        other => StoreError::Rejected(other.to_string()),
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn merge_event(
        &self,
        event: &IngestedEvent,
        stream_id: &str,
    ) -> StoreResult<MergeOutcome> {
        let payload = serde_json::to_string(&event.raw)
            .map_err(|e| StoreError::Rejected(format!("unserializable payload: {e}")))?;

        let result = sqlx::query(
            r#"
            INSERT INTO chat_events (message_id, stream_id, author_id, kind, published_at, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(message_id) DO NOTHING
            "#,
        )
        .bind(&event.id)
        .bind(stream_id)
        .bind(&event.author_id)
        .bind(event.kind.as_str())
        .bind(event.published_at.map(|dt| dt.to_rfc3339()))
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        if result.rows_affected() == 0 {
            Ok(MergeOutcome::Skipped)
        } else {
            Ok(MergeOutcome::Inserted)
        }
    }

    async fn insert_snapshot(&self, stats: &StreamStats, stream_id: &str) -> StoreResult<()> {
        let status = format!("{:?}", stats.status).to_lowercase();

        sqlx::query(
            r#"
            INSERT INTO stats_snapshots
                (stream_id, observed_at, broadcast_status, actual_end_time,
                 concurrent_viewers, view_count, like_count, comment_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(stream_id)
        .bind(stats.observed_at.to_rfc3339())
        .bind(status)
        .bind(stats.actual_end_time.map(|dt| dt.to_rfc3339()))
        .bind(stats.concurrent_viewers.map(|v| v as i64))
        .bind(stats.view_count.map(|v| v as i64))
        .bind(stats.like_count.map(|v| v as i64))
        .bind(stats.comment_count.map(|v| v as i64))
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM worker_state WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;
        Ok(row.map(|(v,)| v))
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_state (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }
}

//! SQLite-backed persistence implementation.

use std::path::Path;
use std::time::Instant;

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::CoreError;
use crate::graph::{GraphSnapshot, SNAPSHOT_TYPE};
use crate::model::{GraphEvent, encode_event};

use super::{
    EventRecord, PersistenceProvider, SnapshotRecord, decode_event_rows, decode_snapshot_record,
    encode_snapshot, warn_if_slow,
};

/// SQLite-backed journal and snapshot store.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
    snapshot_interval: u64,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool, snapshot_interval: u64) -> Self {
        Self {
            pool,
            snapshot_interval,
        }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed,
    /// connects with sensible defaults, and runs all migrations.
    pub async fn from_path(
        path: impl AsRef<Path>,
        snapshot_interval: u64,
    ) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::PersistenceFailed {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::PersistenceFailed {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::PersistenceFailed {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self::new(pool, snapshot_interval))
    }
}

#[async_trait::async_trait]
impl PersistenceProvider for SqlitePersistence {
    fn snapshot_interval(&self) -> u64 {
        self.snapshot_interval
    }

    async fn persist_event(
        &self,
        actor_name: &str,
        event_index: u64,
        event: &GraphEvent,
    ) -> Result<(), CoreError> {
        let (event_type, payload) = encode_event(event)?;

        let started = Instant::now();
        sqlx::query(
            r#"
            INSERT INTO events (actor_name, event_index, event_type, event)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(actor_name, event_index) DO UPDATE SET
                event_type=excluded.event_type,
                event=excluded.event
            "#,
        )
        .bind(actor_name)
        .bind(event_index as i64)
        .bind(event_type)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        warn_if_slow(actor_name, "persist_event", started);

        Ok(())
    }

    async fn get_events(
        &self,
        actor_name: &str,
        from_index: u64,
    ) -> Result<Vec<(u64, GraphEvent)>, CoreError> {
        let started = Instant::now();
        let rows = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT actor_name, event_index, event_type, event
            FROM events
            WHERE actor_name = ? AND event_index >= ?
            ORDER BY event_index ASC
            "#,
        )
        .bind(actor_name)
        .bind(from_index as i64)
        .fetch_all(&self.pool)
        .await?;
        warn_if_slow(actor_name, "get_events", started);

        decode_event_rows(actor_name, rows)
    }

    async fn persist_snapshot(
        &self,
        actor_name: &str,
        event_index: u64,
        snapshot: &GraphSnapshot,
    ) -> Result<(), CoreError> {
        let payload = encode_snapshot(snapshot)?;

        let started = Instant::now();
        sqlx::query(
            r#"
            INSERT INTO snapshots (actor_name, snapshot_type, event_index, snapshot)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(actor_name) DO UPDATE SET
                snapshot_type=excluded.snapshot_type,
                event_index=excluded.event_index,
                snapshot=excluded.snapshot
            "#,
        )
        .bind(actor_name)
        .bind(SNAPSHOT_TYPE)
        .bind(event_index as i64)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        warn_if_slow(actor_name, "persist_snapshot", started);

        Ok(())
    }

    async fn get_snapshot(
        &self,
        actor_name: &str,
    ) -> Result<Option<(GraphSnapshot, u64)>, CoreError> {
        let started = Instant::now();
        let record = sqlx::query_as::<_, SnapshotRecord>(
            r#"
            SELECT actor_name, snapshot_type, event_index, snapshot
            FROM snapshots
            WHERE actor_name = ?
            "#,
        )
        .bind(actor_name)
        .fetch_optional(&self.pool)
        .await?;
        warn_if_slow(actor_name, "get_snapshot", started);

        record
            .map(|r| decode_snapshot_record(actor_name, r))
            .transpose()
    }

    async fn journal_exists(&self, actor_name: &str) -> Result<bool, CoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM events WHERE actor_name = ? LIMIT 1")
                .bind(actor_name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }
}

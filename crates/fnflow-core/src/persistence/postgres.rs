//! PostgreSQL-backed persistence implementation.

use std::time::Instant;

use sqlx::PgPool;

use crate::error::CoreError;
use crate::graph::{GraphSnapshot, SNAPSHOT_TYPE};
use crate::model::{GraphEvent, encode_event};

use super::{
    EventRecord, PersistenceProvider, SnapshotRecord, decode_event_rows, decode_snapshot_record,
    encode_snapshot, warn_if_slow,
};

/// PostgreSQL-backed journal and snapshot store.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
    snapshot_interval: u64,
}

impl PostgresPersistence {
    /// Create a new PostgreSQL persistence provider from an existing pool.
    pub fn new(pool: PgPool, snapshot_interval: u64) -> Self {
        Self {
            pool,
            snapshot_interval,
        }
    }
}

#[async_trait::async_trait]
impl PersistenceProvider for PostgresPersistence {
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
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (actor_name, event_index) DO UPDATE SET
                event_type = EXCLUDED.event_type,
                event = EXCLUDED.event
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
            WHERE actor_name = $1 AND event_index >= $2
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
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (actor_name) DO UPDATE SET
                snapshot_type = EXCLUDED.snapshot_type,
                event_index = EXCLUDED.event_index,
                snapshot = EXCLUDED.snapshot
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
            WHERE actor_name = $1
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
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM events WHERE actor_name = $1 LIMIT 1")
                .bind(actor_name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }
}

//! Persistence interfaces and backends for fnflow-core.
//!
//! The provider is a pure value store for two things keyed by actor
//! identity: an append-only event journal and a single replaceable
//! snapshot. It never interprets events beyond running them through
//! the decoder registry; writes are upserts on their primary keys so
//! crash-replays of the same command are harmless.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::warn;

use crate::error::CoreError;
use crate::graph::{GraphSnapshot, SNAPSHOT_TYPE};
use crate::model::{GraphEvent, decode_event, stage_shape_error};

/// Queries slower than this produce a warning. They never block.
pub const SLOW_QUERY_THRESHOLD: Duration = Duration::from_secs(30);

/// Raw journal row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRecord {
    /// Actor the event belongs to.
    pub actor_name: String,
    /// Dense per-actor index, starting at 1.
    pub event_index: i64,
    /// Stable symbolic tag resolving to a decoder.
    pub event_type: String,
    /// Serialized event payload.
    pub event: Vec<u8>,
}

/// Raw snapshot row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SnapshotRecord {
    /// Actor the snapshot belongs to.
    pub actor_name: String,
    /// Stable symbolic tag resolving to a decoder.
    pub snapshot_type: String,
    /// Index of the last event folded into this snapshot.
    pub event_index: i64,
    /// Serialized snapshot payload.
    pub snapshot: Vec<u8>,
}

/// Journal and snapshot store shared by all graph actors.
#[async_trait]
pub trait PersistenceProvider: Send + Sync {
    /// Actors checkpoint a snapshot every this many applied events.
    fn snapshot_interval(&self) -> u64;

    /// Durably write one event. Idempotent on `(actor_name, event_index)`.
    async fn persist_event(
        &self,
        actor_name: &str,
        event_index: u64,
        event: &GraphEvent,
    ) -> Result<(), CoreError>;

    /// All events for an actor with index >= `from_index`, in strict
    /// ascending index order. A row that fails to decode is fatal for
    /// the actor: its journal is corrupt.
    async fn get_events(
        &self,
        actor_name: &str,
        from_index: u64,
    ) -> Result<Vec<(u64, GraphEvent)>, CoreError>;

    /// Replace the actor's snapshot.
    async fn persist_snapshot(
        &self,
        actor_name: &str,
        event_index: u64,
        snapshot: &GraphSnapshot,
    ) -> Result<(), CoreError>;

    /// The actor's snapshot and the index it was taken at, if any.
    async fn get_snapshot(
        &self,
        actor_name: &str,
    ) -> Result<Option<(GraphSnapshot, u64)>, CoreError>;

    /// Whether any event has ever been journaled for this actor.
    async fn journal_exists(&self, actor_name: &str) -> Result<bool, CoreError>;
}

/// Decode raw journal rows, verifying each tag against the registry.
pub(crate) fn decode_event_rows(
    actor_name: &str,
    rows: Vec<EventRecord>,
) -> Result<Vec<(u64, GraphEvent)>, CoreError> {
    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let event = decode_event(actor_name, &row.event_type, &row.event)?;
        events.push((row.event_index as u64, event));
    }
    Ok(events)
}

/// Decode a raw snapshot row, verifying its type tag.
pub(crate) fn decode_snapshot_record(
    actor_name: &str,
    record: SnapshotRecord,
) -> Result<(GraphSnapshot, u64), CoreError> {
    if record.snapshot_type != SNAPSHOT_TYPE {
        return Err(CoreError::CorruptJournal {
            actor_name: actor_name.to_string(),
            details: format!("unknown snapshot type '{}'", record.snapshot_type),
        });
    }
    let snapshot: GraphSnapshot =
        serde_json::from_slice(&record.snapshot).map_err(|e| CoreError::CorruptJournal {
            actor_name: actor_name.to_string(),
            details: format!("undecodable snapshot: {e}"),
        })?;

    // Snapshots must satisfy the same per-operation field shape the
    // journal decoder enforces.
    for stage in &snapshot.stages {
        if let Some(problem) = stage_shape_error(
            stage.operation,
            stage.closure.is_some(),
            stage.delay_deadline.is_some(),
            stage.target_function.is_some(),
        ) {
            return Err(CoreError::CorruptJournal {
                actor_name: actor_name.to_string(),
                details: format!("malformed snapshot stage '{}': {}", stage.stage_id, problem),
            });
        }
    }

    Ok((snapshot, record.event_index as u64))
}

pub(crate) fn encode_snapshot(snapshot: &GraphSnapshot) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(snapshot).map_err(|e| CoreError::PersistenceFailed {
        operation: "encode_snapshot".to_string(),
        details: e.to_string(),
    })
}

/// Emit a warning for queries past [`SLOW_QUERY_THRESHOLD`].
pub(crate) fn warn_if_slow(actor_name: &str, operation: &str, started: Instant) {
    let elapsed = started.elapsed();
    if elapsed >= SLOW_QUERY_THRESHOLD {
        warn!(
            actor_name = %actor_name,
            operation = %operation,
            query_sec = elapsed.as_secs_f64(),
            "Slow persistence query"
        );
    }
}

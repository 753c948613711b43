// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fnflow-core.
//!
//! Provides the closed taxonomy surfaced on command replies, plus the
//! internal kinds the engine itself needs (persistence failures, corrupt
//! journals, dropped replies).

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while processing graph commands.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// No graph with the given id exists in memory or storage.
    GraphNotFound {
        /// The graph id that was not found.
        graph_id: String,
    },

    /// A graph with the given id already exists (duplicate create).
    GraphAlreadyExists {
        /// The graph id that already exists.
        graph_id: String,
    },

    /// The graph has no stage with the given id.
    StageNotFound {
        /// The graph id.
        graph_id: String,
        /// The stage id that was not found.
        stage_id: String,
    },

    /// The requested operation is malformed (bad dependency count,
    /// missing closure, wrong stage kind, ...).
    InvalidOperation {
        /// The graph id.
        graph_id: String,
        /// Why the operation was rejected.
        reason: String,
    },

    /// A mutation was attempted on a terminal graph.
    GraphCompleted {
        /// The graph id.
        graph_id: String,
    },

    /// A `GetStageResult` long-poll exceeded its deadline.
    StageTimeout {
        /// The graph id.
        graph_id: String,
        /// The stage id being polled.
        stage_id: String,
    },

    /// The caller's deadline expired before the graph actor replied.
    /// The command may still take effect; in-flight work continues.
    RequestTimeout,

    /// The engine is shutting down and no longer accepts commands.
    EngineStopped,

    /// A durable write or read against the journal store failed.
    PersistenceFailed {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// The journal for an actor could not be decoded. The affected
    /// graph is parked; the process survives.
    CorruptJournal {
        /// The actor whose journal is unreadable.
        actor_name: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Stable error code string for this error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::GraphNotFound { .. } => "GRAPH_NOT_FOUND",
            Self::GraphAlreadyExists { .. } => "GRAPH_ALREADY_EXISTS",
            Self::StageNotFound { .. } => "STAGE_NOT_FOUND",
            Self::InvalidOperation { .. } => "INVALID_OPERATION",
            Self::GraphCompleted { .. } => "GRAPH_COMPLETED",
            Self::StageTimeout { .. } => "STAGE_TIMEOUT",
            Self::RequestTimeout => "REQUEST_TIMEOUT",
            Self::EngineStopped => "ENGINE_STOPPED",
            Self::PersistenceFailed { .. } => "PERSISTENCE_FAILED",
            Self::CorruptJournal { .. } => "CORRUPT_JOURNAL",
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GraphNotFound { graph_id } => {
                write!(f, "Graph '{}' not found", graph_id)
            }
            Self::GraphAlreadyExists { graph_id } => {
                write!(f, "Graph '{}' already exists", graph_id)
            }
            Self::StageNotFound { graph_id, stage_id } => {
                write!(f, "Stage '{}' not found in graph '{}'", stage_id, graph_id)
            }
            Self::InvalidOperation { graph_id, reason } => {
                write!(f, "Invalid operation on graph '{}': {}", graph_id, reason)
            }
            Self::GraphCompleted { graph_id } => {
                write!(f, "Graph '{}' is already completed", graph_id)
            }
            Self::StageTimeout { graph_id, stage_id } => {
                write!(
                    f,
                    "Timed out waiting for stage '{}' of graph '{}'",
                    stage_id, graph_id
                )
            }
            Self::RequestTimeout => {
                write!(f, "Request timed out before the graph actor replied")
            }
            Self::EngineStopped => {
                write!(f, "Engine is stopped")
            }
            Self::PersistenceFailed { operation, details } => {
                write!(f, "Persistence failure during '{}': {}", operation, details)
            }
            Self::CorruptJournal {
                actor_name,
                details,
            } => {
                write!(f, "Corrupt journal for actor '{}': {}", actor_name, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::PersistenceFailed {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain model: stage operations, statuses, journal events, and the
//! command/reply surface.
//!
//! Everything persisted to the journal lives here. Events serialize as
//! JSON with an internal `event` tag; the [`decode_event`] registry
//! resolves the stable `event_type` column back to a decoder and treats
//! unknown tags as journal corruption.

use chrono::{DateTime, Utc};
use fnflow_protocol::CompletionResult;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Opaque client-allocated graph identifier.
pub type GraphId = String;
/// Stage identifier, the stage's position index rendered as a decimal string.
pub type StageId = String;
/// Identifier of a function deployed on the runtime.
pub type FunctionId = String;

/// Closed set of stage operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageOperation {
    Supply,
    ThenApply,
    ThenCompose,
    ThenAccept,
    ThenRun,
    ThenCombine,
    WhenComplete,
    AcceptEither,
    ApplyToEither,
    ThenAcceptBoth,
    AllOf,
    AnyOf,
    Exceptionally,
    ExceptionallyCompose,
    Handle,
    Delay,
    InvokeFunction,
    ExternalCompletion,
    CompletedValue,
}

/// How many dependencies an operation takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyArity {
    /// No dependencies at all.
    None,
    /// Exactly one.
    One,
    /// Exactly two.
    Two,
    /// One or more.
    Many,
}

impl StageOperation {
    /// Wire/journal token for this operation.
    pub fn as_token(&self) -> &'static str {
        match self {
            Self::Supply => "supply",
            Self::ThenApply => "thenApply",
            Self::ThenCompose => "thenCompose",
            Self::ThenAccept => "thenAccept",
            Self::ThenRun => "thenRun",
            Self::ThenCombine => "thenCombine",
            Self::WhenComplete => "whenComplete",
            Self::AcceptEither => "acceptEither",
            Self::ApplyToEither => "applyToEither",
            Self::ThenAcceptBoth => "thenAcceptBoth",
            Self::AllOf => "allOf",
            Self::AnyOf => "anyOf",
            Self::Exceptionally => "exceptionally",
            Self::ExceptionallyCompose => "exceptionallyCompose",
            Self::Handle => "handle",
            Self::Delay => "delay",
            Self::InvokeFunction => "invokeFunction",
            Self::ExternalCompletion => "externalCompletion",
            Self::CompletedValue => "completedValue",
        }
    }

    /// Dependency count this operation requires.
    pub fn dependency_arity(&self) -> DependencyArity {
        match self {
            Self::Supply
            | Self::Delay
            | Self::InvokeFunction
            | Self::ExternalCompletion
            | Self::CompletedValue => DependencyArity::None,
            Self::ThenApply
            | Self::ThenCompose
            | Self::ThenAccept
            | Self::ThenRun
            | Self::WhenComplete
            | Self::Handle
            | Self::Exceptionally
            | Self::ExceptionallyCompose => DependencyArity::One,
            Self::ThenCombine
            | Self::ThenAcceptBoth
            | Self::AcceptEither
            | Self::ApplyToEither => DependencyArity::Two,
            Self::AllOf | Self::AnyOf => DependencyArity::Many,
        }
    }

    /// Whether a stage of this operation carries a closure blob.
    pub fn requires_closure(&self) -> bool {
        !matches!(
            self,
            Self::ExternalCompletion | Self::AllOf | Self::AnyOf | Self::Delay | Self::CompletedValue
        )
    }

    /// Whether this operation accepts an upstream failure as input
    /// instead of short-circuiting.
    pub fn consumes_failure(&self) -> bool {
        matches!(
            self,
            Self::WhenComplete | Self::Handle | Self::Exceptionally | Self::ExceptionallyCompose
        )
    }

    /// Whether a successful closure result is a stage reference the
    /// outer stage adopts.
    pub fn is_compose(&self) -> bool {
        matches!(self, Self::ThenCompose | Self::ExceptionallyCompose)
    }

    /// Whether this operation discards the closure's return value and
    /// completes with an empty datum.
    pub fn discards_value(&self) -> bool {
        matches!(
            self,
            Self::ThenAccept | Self::ThenRun | Self::ThenAcceptBoth | Self::AcceptEither
        )
    }
}

/// Per-stage execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StageStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Graph lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphState {
    Active,
    Committed,
    Completed,
    Failed,
}

impl GraphState {
    /// Completed and Failed are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// An opaque serialized function body plus its media type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closure {
    pub content_type: String,
    pub data: Vec<u8>,
}

/// One persisted journal event.
///
/// Every observable state change of a graph corresponds to exactly one
/// of these, persisted before it is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GraphEvent {
    GraphCreated {
        graph_id: GraphId,
        function_id: FunctionId,
        created_at: DateTime<Utc>,
    },
    StageAdded {
        stage_id: StageId,
        operation: StageOperation,
        dependencies: Vec<StageId>,
        closure: Option<Closure>,
        /// Absolute deadline for `Delay` stages, so timers survive restarts.
        delay_deadline: Option<DateTime<Utc>>,
        /// Target function for `InvokeFunction` stages.
        target_function: Option<FunctionId>,
        added_at: DateTime<Utc>,
    },
    /// A compose-style stage adopted an inner stage; its terminal
    /// status now tracks the inner stage.
    StageComposed {
        stage_id: StageId,
        composed_stage_id: StageId,
        composed_at: DateTime<Utc>,
    },
    StageCompleted {
        stage_id: StageId,
        result: CompletionResult,
        completed_at: DateTime<Utc>,
    },
    StageFailed {
        stage_id: StageId,
        result: CompletionResult,
        failed_at: DateTime<Utc>,
    },
    /// Dispatch audit: the executor was handed this stage.
    FaasInvocationStarted {
        stage_id: StageId,
        started_at: DateTime<Utc>,
    },
    /// Dispatch audit: the executor reported an outcome.
    FaasInvocationCompleted {
        stage_id: StageId,
        successful: bool,
        completed_at: DateTime<Utc>,
    },
    GraphCommitted {
        committed_at: DateTime<Utc>,
    },
    GraphCompleted {
        failed: bool,
        completed_at: DateTime<Utc>,
    },
}

impl GraphEvent {
    /// Stable symbolic tag stored in the journal's `event_type` column.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::GraphCreated { .. } => "graph_created",
            Self::StageAdded { .. } => "stage_added",
            Self::StageComposed { .. } => "stage_composed",
            Self::StageCompleted { .. } => "stage_completed",
            Self::StageFailed { .. } => "stage_failed",
            Self::FaasInvocationStarted { .. } => "faas_invocation_started",
            Self::FaasInvocationCompleted { .. } => "faas_invocation_completed",
            Self::GraphCommitted { .. } => "graph_committed",
            Self::GraphCompleted { .. } => "graph_completed",
        }
    }
}

/// Every tag the decoder registry knows about. Reading any other tag
/// from the journal is fatal for the affected graph.
pub const KNOWN_EVENT_TYPES: &[&str] = &[
    "graph_created",
    "stage_added",
    "stage_composed",
    "stage_completed",
    "stage_failed",
    "faas_invocation_started",
    "faas_invocation_completed",
    "graph_committed",
    "graph_completed",
];

/// Serialize an event to its `(event_type, payload)` journal form.
pub fn encode_event(event: &GraphEvent) -> Result<(&'static str, Vec<u8>), CoreError> {
    let payload = serde_json::to_vec(event).map_err(|e| CoreError::PersistenceFailed {
        operation: "encode_event".to_string(),
        details: e.to_string(),
    })?;
    Ok((event.event_type(), payload))
}

/// Decode a journal row back into an event.
///
/// The tag is looked up in the registry first; an unknown tag or a
/// payload that does not match its tag means the journal is corrupt.
pub fn decode_event(actor_name: &str, event_type: &str, payload: &[u8]) -> Result<GraphEvent, CoreError> {
    if !KNOWN_EVENT_TYPES.contains(&event_type) {
        return Err(CoreError::CorruptJournal {
            actor_name: actor_name.to_string(),
            details: format!("unknown event type '{event_type}'"),
        });
    }

    let event: GraphEvent =
        serde_json::from_slice(payload).map_err(|e| CoreError::CorruptJournal {
            actor_name: actor_name.to_string(),
            details: format!("undecodable '{event_type}' payload: {e}"),
        })?;

    if event.event_type() != event_type {
        return Err(CoreError::CorruptJournal {
            actor_name: actor_name.to_string(),
            details: format!(
                "payload tag '{}' does not match column tag '{}'",
                event.event_type(),
                event_type
            ),
        });
    }

    if let GraphEvent::StageAdded {
        stage_id,
        operation,
        closure,
        delay_deadline,
        target_function,
        ..
    } = &event
    {
        if let Some(problem) = stage_shape_error(
            *operation,
            closure.is_some(),
            delay_deadline.is_some(),
            target_function.is_some(),
        ) {
            return Err(CoreError::CorruptJournal {
                actor_name: actor_name.to_string(),
                details: format!("malformed stage_added for stage '{stage_id}': {problem}"),
            });
        }
    }

    Ok(event)
}

/// The optional fields a stage of each operation must and must not
/// carry. Command validation enforces this shape before anything is
/// persisted; journal and snapshot decoding re-check it so a corrupt
/// record parks the graph instead of wedging its actor.
pub(crate) fn stage_shape_error(
    operation: StageOperation,
    has_closure: bool,
    has_delay_deadline: bool,
    has_target_function: bool,
) -> Option<String> {
    if operation.requires_closure() != has_closure {
        return Some(format!(
            "a '{}' stage {} a closure",
            operation.as_token(),
            if operation.requires_closure() {
                "is missing"
            } else {
                "must not carry"
            }
        ));
    }
    if (operation == StageOperation::Delay) != has_delay_deadline {
        return Some(format!(
            "a '{}' stage {} a delay deadline",
            operation.as_token(),
            if operation == StageOperation::Delay {
                "is missing"
            } else {
                "must not carry"
            }
        ));
    }
    if (operation == StageOperation::InvokeFunction) != has_target_function {
        return Some(format!(
            "a '{}' stage {} a target function",
            operation.as_token(),
            if operation == StageOperation::InvokeFunction {
                "is missing"
            } else {
                "must not carry"
            }
        ));
    }
    None
}

/// Client request to append a stage to a graph.
#[derive(Debug, Clone)]
pub struct AddStageSpec {
    pub operation: StageOperation,
    pub dependencies: Vec<StageId>,
    pub closure: Option<Closure>,
    /// Delay in milliseconds, `Delay` stages only.
    pub delay_ms: Option<u64>,
    /// Function to call, `InvokeFunction` stages only.
    pub target_function: Option<FunctionId>,
    /// Pre-supplied outcome, `CompletedValue` stages only.
    pub value: Option<CompletionResult>,
}

impl AddStageSpec {
    /// A bare spec for the given operation; callers fill in the rest.
    pub fn new(operation: StageOperation) -> Self {
        Self {
            operation,
            dependencies: Vec::new(),
            closure: None,
            delay_ms: None,
            target_function: None,
            value: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<StageId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_closure(mut self, closure: Closure) -> Self {
        self.closure = Some(closure);
        self
    }
}

/// Reply to `CreateGraph`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateGraphReply {
    pub graph_id: GraphId,
}

/// Reply to `AddStage`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddStageReply {
    pub graph_id: GraphId,
    pub stage_id: StageId,
}

/// Reply to `GetStageResult`.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResultReply {
    pub graph_id: GraphId,
    pub stage_id: StageId,
    pub status: StageStatus,
    pub result: CompletionResult,
}

/// Reply to `CompleteStageExternally`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteExternallyReply {
    /// False when the stage was already terminal (idempotent redelivery).
    pub newly_completed: bool,
}

/// Reply to `CommitGraph`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReply {
    pub graph_id: GraphId,
    pub state: GraphState,
}

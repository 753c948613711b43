// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The graph state machine.
//!
//! [`Graph`] owns all per-graph state and is deliberately pure: command
//! validation produces journal events without mutating anything, and
//! [`Graph::apply`] is the only mutation path. The actor layer persists
//! each event before applying it, so replaying the journal through
//! `apply` reconstructs the exact live state.
//!
//! Stage ids are position indices rendered as decimal strings; a
//! stage's dependencies therefore always refer to earlier stages.

use chrono::{DateTime, Utc};
use fnflow_protocol::{CompletionResult, Datum, ErrorKind};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::{
    AddStageSpec, Closure, DependencyArity, FunctionId, GraphEvent, GraphId, GraphState, StageId,
    StageOperation, StageStatus,
};

/// Snapshot type tag stored alongside serialized snapshots.
pub const SNAPSHOT_TYPE: &str = "graph_snapshot";

/// One node of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub stage_id: StageId,
    pub operation: StageOperation,
    pub dependencies: Vec<StageId>,
    pub closure: Option<Closure>,
    pub status: StageStatus,
    /// Present iff status is Succeeded or Failed.
    pub result: Option<CompletionResult>,
    /// For compose-style stages, the stage this one's result tracks.
    pub result_ref: Option<StageId>,
    /// Absolute deadline for Delay stages.
    pub delay_deadline: Option<DateTime<Utc>>,
    /// Target function for InvokeFunction stages.
    pub target_function: Option<FunctionId>,
    pub added_at: DateTime<Utc>,
}

/// What the actor should do for a stage whose trigger condition holds.
#[derive(Debug, Clone, PartialEq)]
pub enum StageDecision {
    /// Send the stage's closure and argument list to the runtime.
    Dispatch {
        stage_id: StageId,
        closure: Closure,
        args: Vec<Datum>,
    },
    /// Relay an HTTP request to another function on the runtime.
    Invoke {
        stage_id: StageId,
        function_id: FunctionId,
        request: Closure,
    },
    /// Complete the stage locally, without dispatching.
    CompleteNow {
        stage_id: StageId,
        result: CompletionResult,
    },
}

impl StageDecision {
    /// Stage this decision acts on.
    pub fn stage_id(&self) -> &StageId {
        match self {
            Self::Dispatch { stage_id, .. }
            | Self::Invoke { stage_id, .. }
            | Self::CompleteNow { stage_id, .. } => stage_id,
        }
    }
}

/// Serialized form of a graph, written as a snapshot every N events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub graph_id: GraphId,
    pub function_id: FunctionId,
    pub stages: Vec<Stage>,
    pub committed: bool,
    pub state: GraphState,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A client-owned DAG of stages. See the module docs for the purity
/// contract between command validation and [`Graph::apply`].
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    graph_id: GraphId,
    function_id: FunctionId,
    stages: Vec<Stage>,
    committed: bool,
    state: GraphState,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl Graph {
    /// Fresh graph, as constructed from a `GraphCreated` event.
    pub fn new(graph_id: GraphId, function_id: FunctionId, created_at: DateTime<Utc>) -> Self {
        Self {
            graph_id,
            function_id,
            stages: Vec::new(),
            committed: false,
            state: GraphState::Active,
            created_at,
            completed_at: None,
        }
    }

    /// Rebuild a graph from its `GraphCreated` event.
    pub fn from_created_event(event: &GraphEvent) -> Result<Self, CoreError> {
        match event {
            GraphEvent::GraphCreated {
                graph_id,
                function_id,
                created_at,
            } => Ok(Self::new(graph_id.clone(), function_id.clone(), *created_at)),
            other => Err(CoreError::CorruptJournal {
                actor_name: String::new(),
                details: format!("journal does not start with graph_created: {}", other.event_type()),
            }),
        }
    }

    pub fn graph_id(&self) -> &GraphId {
        &self.graph_id
    }

    pub fn function_id(&self) -> &FunctionId {
        &self.function_id
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Look up a stage by id.
    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        stage_id
            .parse::<usize>()
            .ok()
            .and_then(|i| self.stages.get(i))
    }

    fn stage_mut(&mut self, stage_id: &str) -> Option<&mut Stage> {
        stage_id
            .parse::<usize>()
            .ok()
            .and_then(|i| self.stages.get_mut(i))
    }

    /// Id the next added stage will receive.
    pub fn next_stage_id(&self) -> StageId {
        self.stages.len().to_string()
    }

    // ------------------------------------------------------------------
    // Command validation: produce events, mutate nothing
    // ------------------------------------------------------------------

    /// Validate an `AddStage` request and produce its events.
    ///
    /// `CompletedValue` stages complete in the same breath, so they
    /// yield a completion event right behind their `StageAdded`.
    pub fn add_stage_events(
        &self,
        spec: &AddStageSpec,
        now: DateTime<Utc>,
    ) -> Result<Vec<GraphEvent>, CoreError> {
        if self.state.is_terminal() {
            return Err(CoreError::GraphCompleted {
                graph_id: self.graph_id.clone(),
            });
        }
        if self.committed && spec.dependencies.is_empty() {
            return Err(self.invalid(
                "graph is committed; only continuations of existing stages may be added",
            ));
        }

        let arity_ok = match spec.operation.dependency_arity() {
            DependencyArity::None => spec.dependencies.is_empty(),
            DependencyArity::One => spec.dependencies.len() == 1,
            DependencyArity::Two => spec.dependencies.len() == 2,
            // An empty join is almost always a client bug; reject it.
            DependencyArity::Many => !spec.dependencies.is_empty(),
        };
        if !arity_ok {
            return Err(self.invalid(format!(
                "operation '{}' cannot take {} dependencies",
                spec.operation.as_token(),
                spec.dependencies.len()
            )));
        }

        for dep in &spec.dependencies {
            if self.stage(dep).is_none() {
                return Err(CoreError::StageNotFound {
                    graph_id: self.graph_id.clone(),
                    stage_id: dep.clone(),
                });
            }
        }

        if spec.operation.requires_closure() != spec.closure.is_some() {
            return Err(self.invalid(format!(
                "operation '{}' {} a closure",
                spec.operation.as_token(),
                if spec.operation.requires_closure() {
                    "requires"
                } else {
                    "does not take"
                }
            )));
        }

        if (spec.operation == StageOperation::Delay) != spec.delay_ms.is_some() {
            return Err(self.invalid("delay_ms is required for delay stages and only for them"));
        }
        if (spec.operation == StageOperation::InvokeFunction) != spec.target_function.is_some() {
            return Err(self.invalid(
                "target_function is required for invokeFunction stages and only for them",
            ));
        }
        if (spec.operation == StageOperation::CompletedValue) != spec.value.is_some() {
            return Err(self.invalid(
                "a value is required for completedValue stages and only for them",
            ));
        }

        let stage_id = self.next_stage_id();
        let delay_deadline = spec
            .delay_ms
            .map(|ms| now + chrono::Duration::milliseconds(ms as i64));

        let mut events = vec![GraphEvent::StageAdded {
            stage_id: stage_id.clone(),
            operation: spec.operation,
            dependencies: spec.dependencies.clone(),
            closure: spec.closure.clone(),
            delay_deadline,
            target_function: spec.target_function.clone(),
            added_at: now,
        }];

        if let Some(value) = &spec.value {
            events.push(stage_outcome_event(&stage_id, value.clone(), now));
        }

        Ok(events)
    }

    /// Validate an external completion and produce its event.
    ///
    /// Returns `Ok(None)` when the stage is already terminal, making
    /// redelivery of the same completion a no-op.
    pub fn complete_externally_events(
        &self,
        stage_id: &str,
        result: CompletionResult,
        now: DateTime<Utc>,
    ) -> Result<Option<GraphEvent>, CoreError> {
        if self.state.is_terminal() {
            return Err(CoreError::GraphCompleted {
                graph_id: self.graph_id.clone(),
            });
        }
        let stage = self.stage(stage_id).ok_or_else(|| CoreError::StageNotFound {
            graph_id: self.graph_id.clone(),
            stage_id: stage_id.to_string(),
        })?;
        if stage.operation != StageOperation::ExternalCompletion {
            return Err(self.invalid(format!(
                "stage '{}' is a '{}' stage and cannot be completed externally",
                stage_id,
                stage.operation.as_token()
            )));
        }
        if stage.status.is_terminal() {
            return Ok(None);
        }
        Ok(Some(stage_outcome_event(stage_id, result, now)))
    }

    /// Validate a commit and produce its event. Committing twice is a
    /// no-op.
    pub fn commit_events(&self, now: DateTime<Utc>) -> Result<Vec<GraphEvent>, CoreError> {
        if self.state.is_terminal() {
            return Err(CoreError::GraphCompleted {
                graph_id: self.graph_id.clone(),
            });
        }
        if self.committed {
            return Ok(Vec::new());
        }
        Ok(vec![GraphEvent::GraphCommitted { committed_at: now }])
    }

    /// Translate an executor outcome into events.
    ///
    /// A reply for a stage that is not Running (stale redelivery after
    /// recovery) produces no events.
    pub fn invocation_result_events(
        &self,
        stage_id: &str,
        incoming: CompletionResult,
        now: DateTime<Utc>,
    ) -> Vec<GraphEvent> {
        let Some(stage) = self.stage(stage_id) else {
            return Vec::new();
        };
        if stage.status != StageStatus::Running || stage.result_ref.is_some() {
            return Vec::new();
        }

        let mut events = vec![GraphEvent::FaasInvocationCompleted {
            stage_id: stage_id.to_string(),
            successful: incoming.successful,
            completed_at: now,
        }];

        if stage.operation.is_compose() && incoming.successful {
            events.push(self.compose_outcome(stage, incoming, now));
            return events;
        }

        let outcome = if !incoming.successful {
            incoming
        } else if stage.operation.discards_value() {
            CompletionResult::success(Datum::Empty)
        } else if stage.operation == StageOperation::WhenComplete {
            // whenComplete observes the upstream outcome and passes it
            // through untouched.
            self.dependency_result(stage, 0)
        } else {
            incoming
        };

        events.push(stage_outcome_event(stage_id, outcome, now));
        events
    }

    fn compose_outcome(
        &self,
        stage: &Stage,
        incoming: CompletionResult,
        now: DateTime<Utc>,
    ) -> GraphEvent {
        let fail = |message: String| {
            stage_outcome_event(
                &stage.stage_id,
                CompletionResult::from_error(ErrorKind::InvalidStageResponse, message),
                now,
            )
        };

        let Datum::StageRef { stage_id: inner } = &incoming.datum else {
            return fail(format!(
                "compose stage '{}' returned a {} datum instead of a stage reference",
                stage.stage_id,
                incoming.datum.type_token()
            ));
        };
        if self.stage(inner).is_none() {
            return fail(format!(
                "compose stage '{}' referenced unknown stage '{}'",
                stage.stage_id, inner
            ));
        }
        if self.creates_compose_cycle(&stage.stage_id, inner) {
            return fail(format!(
                "compose stage '{}' referenced stage '{}' which closes a reference cycle",
                stage.stage_id, inner
            ));
        }

        GraphEvent::StageComposed {
            stage_id: stage.stage_id.clone(),
            composed_stage_id: inner.clone(),
            composed_at: now,
        }
    }

    /// Whether making `outer` track `inner` would close a reference
    /// cycle: `inner` must not transitively reference `outer`.
    fn creates_compose_cycle(&self, outer: &str, inner: &str) -> bool {
        let mut current = Some(inner.to_string());
        let mut hops = 0usize;
        while let Some(id) = current {
            if id == outer {
                return true;
            }
            // A reference chain can never be longer than the stage list.
            hops += 1;
            if hops > self.stages.len() {
                return true;
            }
            current = self.stage(&id).and_then(|s| s.result_ref.clone());
        }
        false
    }

    /// Translate a fired delay timer into events. A no-op unless the
    /// stage is a pending Delay.
    pub fn delay_fired_events(&self, stage_id: &str, now: DateTime<Utc>) -> Vec<GraphEvent> {
        match self.stage(stage_id) {
            Some(stage)
                if stage.operation == StageOperation::Delay
                    && stage.status == StageStatus::Pending
                    && !self.state.is_terminal() =>
            {
                vec![stage_outcome_event(
                    stage_id,
                    CompletionResult::success(Datum::Empty),
                    now,
                )]
            }
            _ => Vec::new(),
        }
    }

    /// The `GraphCompleted` event, once commit has happened and every
    /// stage is terminal.
    pub fn completion_event(&self, now: DateTime<Utc>) -> Option<GraphEvent> {
        if self.state.is_terminal() || !self.committed {
            return None;
        }
        if !self.stages.iter().all(|s| s.status.is_terminal()) {
            return None;
        }
        Some(GraphEvent::GraphCompleted {
            failed: self.has_unhandled_failure(),
            completed_at: now,
        })
    }

    /// A failure is unhandled when no downstream stage consumes it.
    fn has_unhandled_failure(&self) -> bool {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Failed)
            .any(|failed| {
                !self.stages.iter().any(|candidate| {
                    candidate.operation.consumes_failure()
                        && candidate.dependencies.contains(&failed.stage_id)
                })
            })
    }

    // ------------------------------------------------------------------
    // Trigger evaluation
    // ------------------------------------------------------------------

    /// Decisions for every stage whose trigger condition currently
    /// holds, in insertion order.
    ///
    /// Acting on a decision (persisting its events) removes the stage
    /// from the next evaluation, so the actor loops this to a fixpoint.
    pub fn pending_decisions(&self) -> Vec<StageDecision> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        let mut decisions = Vec::new();
        for stage in &self.stages {
            match stage.status {
                StageStatus::Pending => {
                    if let Some(decision) = self.evaluate_pending(stage) {
                        decisions.push(decision);
                    }
                }
                StageStatus::Running => {
                    // A composed stage adopts its inner stage's outcome.
                    if let Some(inner_id) = &stage.result_ref {
                        if let Some(decision) = self.evaluate_adoption(stage, inner_id) {
                            decisions.push(decision);
                        }
                    }
                }
                _ => {}
            }
        }
        decisions
    }

    /// Decisions to re-issue for stages caught mid-dispatch by a crash.
    ///
    /// A Running stage without an adopted inner stage was handed to the
    /// executor but never reported back; recovery re-derives its
    /// dispatch from the (terminal, therefore stable) dependency
    /// results. At-least-once delivery to the runtime is acceptable.
    pub(crate) fn redispatch_decisions(&self) -> Vec<StageDecision> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Running && s.result_ref.is_none())
            .filter_map(|s| self.evaluate_pending(s))
            .collect()
    }

    fn evaluate_adoption(&self, stage: &Stage, inner_id: &str) -> Option<StageDecision> {
        let inner = self.stage(inner_id)?;
        if !inner.status.is_terminal() {
            return None;
        }
        let result = match &inner.result {
            Some(result) => result.clone(),
            // Cancelled stages carry no result.
            None => CompletionResult::from_error(
                ErrorKind::StageLost,
                format!("composed stage '{inner_id}' was cancelled"),
            ),
        };
        Some(StageDecision::CompleteNow {
            stage_id: stage.stage_id.clone(),
            result,
        })
    }

    fn evaluate_pending(&self, stage: &Stage) -> Option<StageDecision> {
        use StageOperation::*;

        match stage.operation {
            // Timer- and client-driven stages never trigger from here.
            Delay | ExternalCompletion | CompletedValue => None,

            Supply => Some(self.dispatch(stage, Vec::new())),

            InvokeFunction => match &stage.closure {
                Some(request) => Some(StageDecision::Invoke {
                    stage_id: stage.stage_id.clone(),
                    function_id: stage
                        .target_function
                        .clone()
                        .unwrap_or_else(|| self.function_id.clone()),
                    request: request.clone(),
                }),
                None => Some(self.lost_closure(stage)),
            },

            ThenApply | ThenAccept | ThenCompose => {
                let dep = self.terminal_dependency(stage, 0)?;
                match &dep.result {
                    Some(r) if r.successful => {
                        Some(self.dispatch(stage, vec![r.datum.clone()]))
                    }
                    _ => Some(self.propagate_dependency_failure(stage, dep)),
                }
            }

            ThenRun => {
                let dep = self.terminal_dependency(stage, 0)?;
                match &dep.result {
                    Some(r) if r.successful => Some(self.dispatch(stage, Vec::new())),
                    _ => Some(self.propagate_dependency_failure(stage, dep)),
                }
            }

            Exceptionally | ExceptionallyCompose => {
                let dep = self.terminal_dependency(stage, 0)?;
                match &dep.result {
                    Some(r) if r.successful => Some(StageDecision::CompleteNow {
                        stage_id: stage.stage_id.clone(),
                        result: r.clone(),
                    }),
                    _ => Some(self.dispatch(stage, vec![self.dependency_result(stage, 0).datum])),
                }
            }

            WhenComplete | Handle => {
                self.terminal_dependency(stage, 0)?;
                let outcome = self.dependency_result(stage, 0);
                let args = if outcome.successful {
                    vec![outcome.datum, Datum::Empty]
                } else {
                    vec![Datum::Empty, outcome.datum]
                };
                Some(self.dispatch(stage, args))
            }

            ThenCombine | ThenAcceptBoth => {
                // Fail fast on the first failed dependency, in
                // dependency order.
                if let Some(failed) = self.first_failed_dependency(stage) {
                    return Some(self.propagate_dependency_failure(stage, failed));
                }
                if !self.all_dependencies_terminal(stage) {
                    return None;
                }
                let args = stage
                    .dependencies
                    .iter()
                    .enumerate()
                    .map(|(i, _)| self.dependency_result(stage, i).datum)
                    .collect();
                Some(self.dispatch(stage, args))
            }

            AcceptEither | ApplyToEither => {
                let winner = self.first_terminal_dependency(stage)?;
                match &winner.result {
                    Some(r) if r.successful => {
                        Some(self.dispatch(stage, vec![r.datum.clone()]))
                    }
                    _ => Some(self.propagate_dependency_failure(stage, winner)),
                }
            }

            AllOf => {
                if let Some(failed) = self.first_failed_dependency(stage) {
                    return Some(self.propagate_dependency_failure(stage, failed));
                }
                if !self.all_dependencies_terminal(stage) {
                    return None;
                }
                Some(StageDecision::CompleteNow {
                    stage_id: stage.stage_id.clone(),
                    result: CompletionResult::success(Datum::Empty),
                })
            }

            AnyOf => {
                let winner = self.first_terminal_dependency(stage)?;
                Some(StageDecision::CompleteNow {
                    stage_id: stage.stage_id.clone(),
                    result: self.terminal_result_of(winner),
                })
            }
        }
    }

    fn dispatch(&self, stage: &Stage, args: Vec<Datum>) -> StageDecision {
        match &stage.closure {
            Some(closure) => StageDecision::Dispatch {
                stage_id: stage.stage_id.clone(),
                closure: closure.clone(),
                args,
            },
            None => self.lost_closure(stage),
        }
    }

    /// Journal and snapshot decoding reject stages without their
    /// closure; trigger evaluation still must not panic on one. The
    /// stage fails, the actor keeps running.
    fn lost_closure(&self, stage: &Stage) -> StageDecision {
        StageDecision::CompleteNow {
            stage_id: stage.stage_id.clone(),
            result: CompletionResult::from_error(
                ErrorKind::StageLost,
                format!("stage '{}' has no closure to dispatch", stage.stage_id),
            ),
        }
    }

    fn propagate_dependency_failure(&self, stage: &Stage, dep: &Stage) -> StageDecision {
        StageDecision::CompleteNow {
            stage_id: stage.stage_id.clone(),
            result: self.terminal_result_of(dep),
        }
    }

    fn terminal_result_of(&self, stage: &Stage) -> CompletionResult {
        match &stage.result {
            Some(result) => result.clone(),
            None => CompletionResult::from_error(
                ErrorKind::StageLost,
                format!("stage '{}' was cancelled", stage.stage_id),
            ),
        }
    }

    fn dependency(&self, stage: &Stage, index: usize) -> Option<&Stage> {
        stage.dependencies.get(index).and_then(|id| self.stage(id))
    }

    fn terminal_dependency(&self, stage: &Stage, index: usize) -> Option<&Stage> {
        self.dependency(stage, index)
            .filter(|dep| dep.status.is_terminal())
    }

    fn dependency_result(&self, stage: &Stage, index: usize) -> CompletionResult {
        match self.dependency(stage, index) {
            Some(dep) => self.terminal_result_of(dep),
            None => CompletionResult::from_error(
                ErrorKind::StageLost,
                "dependency disappeared".to_string(),
            ),
        }
    }

    fn first_failed_dependency(&self, stage: &Stage) -> Option<&Stage> {
        stage
            .dependencies
            .iter()
            .filter_map(|id| self.stage(id))
            .find(|dep| dep.status == StageStatus::Failed)
    }

    fn first_terminal_dependency(&self, stage: &Stage) -> Option<&Stage> {
        stage
            .dependencies
            .iter()
            .filter_map(|id| self.stage(id))
            .find(|dep| dep.status.is_terminal())
    }

    fn all_dependencies_terminal(&self, stage: &Stage) -> bool {
        stage
            .dependencies
            .iter()
            .all(|id| self.stage(id).is_some_and(|dep| dep.status.is_terminal()))
    }

    // ------------------------------------------------------------------
    // Event application
    // ------------------------------------------------------------------

    /// Apply one event. Deterministic, and a no-op wherever monotonicity
    /// demands it (terminal stages never change again).
    pub fn apply(&mut self, event: &GraphEvent) {
        match event {
            GraphEvent::GraphCreated { .. } => {
                // Consumed by the constructor; replaying it is a no-op.
            }
            GraphEvent::StageAdded {
                stage_id,
                operation,
                dependencies,
                closure,
                delay_deadline,
                target_function,
                added_at,
            } => {
                self.stages.push(Stage {
                    stage_id: stage_id.clone(),
                    operation: *operation,
                    dependencies: dependencies.clone(),
                    closure: closure.clone(),
                    status: StageStatus::Pending,
                    result: None,
                    result_ref: None,
                    delay_deadline: *delay_deadline,
                    target_function: target_function.clone(),
                    added_at: *added_at,
                });
            }
            GraphEvent::FaasInvocationStarted { stage_id, .. } => {
                if let Some(stage) = self.stage_mut(stage_id) {
                    if stage.status == StageStatus::Pending {
                        stage.status = StageStatus::Running;
                    }
                }
            }
            GraphEvent::FaasInvocationCompleted { .. } => {
                // Audit only; the outcome event right behind it carries
                // the state change.
            }
            GraphEvent::StageComposed {
                stage_id,
                composed_stage_id,
                ..
            } => {
                if let Some(stage) = self.stage_mut(stage_id) {
                    if stage.status == StageStatus::Running && stage.result_ref.is_none() {
                        stage.result_ref = Some(composed_stage_id.clone());
                    }
                }
            }
            GraphEvent::StageCompleted {
                stage_id, result, ..
            } => {
                if let Some(stage) = self.stage_mut(stage_id) {
                    if !stage.status.is_terminal() {
                        stage.status = StageStatus::Succeeded;
                        stage.result = Some(result.clone());
                    }
                }
            }
            GraphEvent::StageFailed {
                stage_id, result, ..
            } => {
                if let Some(stage) = self.stage_mut(stage_id) {
                    if !stage.status.is_terminal() {
                        stage.status = StageStatus::Failed;
                        stage.result = Some(result.clone());
                    }
                }
            }
            GraphEvent::GraphCommitted { .. } => {
                if !self.state.is_terminal() {
                    self.committed = true;
                    if self.state == GraphState::Active {
                        self.state = GraphState::Committed;
                    }
                }
            }
            GraphEvent::GraphCompleted {
                failed,
                completed_at,
            } => {
                if !self.state.is_terminal() {
                    self.state = if *failed {
                        GraphState::Failed
                    } else {
                        GraphState::Completed
                    };
                    self.completed_at = Some(*completed_at);
                    for stage in &mut self.stages {
                        if !stage.status.is_terminal() {
                            stage.status = StageStatus::Cancelled;
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub fn to_snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            graph_id: self.graph_id.clone(),
            function_id: self.function_id.clone(),
            stages: self.stages.clone(),
            committed: self.committed,
            state: self.state,
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }

    pub fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        Self {
            graph_id: snapshot.graph_id,
            function_id: snapshot.function_id,
            stages: snapshot.stages,
            committed: snapshot.committed,
            state: snapshot.state,
            created_at: snapshot.created_at,
            completed_at: snapshot.completed_at,
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> CoreError {
        CoreError::InvalidOperation {
            graph_id: self.graph_id.clone(),
            reason: reason.into(),
        }
    }
}

/// Success yields `StageCompleted`, failure yields `StageFailed`.
pub(crate) fn stage_outcome_event(
    stage_id: &str,
    result: CompletionResult,
    now: DateTime<Utc>,
) -> GraphEvent {
    if result.successful {
        GraphEvent::StageCompleted {
            stage_id: stage_id.to_string(),
            result,
            completed_at: now,
        }
    } else {
        GraphEvent::StageFailed {
            stage_id: stage_id.to_string(),
            result,
            failed_at: now,
        }
    }
}

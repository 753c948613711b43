// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The per-graph actor.
//!
//! One actor owns one graph. Its mailbox serializes every mutation:
//! client commands, executor outcomes, and delay timers. The actor
//! persists each event before applying it and before replying, then
//! evaluates triggers to a fixpoint, dispatching newly ready stages in
//! insertion order.
//!
//! A persistence failure stops the actor; the supervisor hydrates a
//! fresh one from the journal on the next command. An actor with no
//! in-flight work passivates after the configured idle window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fnflow_protocol::{CompletionResult, ErrorKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::CoreError;
use crate::executor::{DispatchKind, DispatchRequest, ExecutorHandle};
use crate::graph::{Graph, StageDecision, stage_outcome_event};
use crate::model::{
    AddStageReply, CommitReply, CompleteExternallyReply, FunctionId, GraphEvent, GraphId, StageId,
    StageResultReply, StageStatus,
};
use crate::persistence::PersistenceProvider;
use crate::stream::{EventStream, LifecycleEvent};

use super::{GraphMsg, GraphRequest};

/// Journal identity of a graph's actor.
pub fn actor_name(graph_id: &str) -> String {
    format!("graph-{graph_id}")
}

/// Everything a graph actor needs besides its own state.
#[derive(Clone)]
pub struct ActorDeps {
    pub provider: Arc<dyn PersistenceProvider>,
    pub executor: ExecutorHandle,
    pub stream: EventStream,
    /// Passivate after this long without mailbox traffic.
    pub idle_window: Duration,
}

/// How an actor's run loop ended. The supervisor counts `Failed` exits
/// against its one-for-one restart budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorExit {
    /// Passivated or shut down; respawning is routine.
    Clean,
    /// Stopped after a persistence failure.
    Failed,
}

/// Mailbox depth per graph actor.
const MAILBOX_CAPACITY: usize = 64;

pub(crate) struct GraphActor {
    actor_name: String,
    graph: Graph,
    event_index: u64,
    events_since_snapshot: u64,
    deps: ActorDeps,
    rx: mpsc::Receiver<GraphMsg>,
    self_tx: mpsc::Sender<GraphMsg>,
    waiters: HashMap<StageId, Vec<tokio::sync::oneshot::Sender<Result<StageResultReply, CoreError>>>>,
    delay_tasks: HashMap<StageId, JoinHandle<()>>,
    in_flight: usize,
}

/// A spawned actor: its mailbox plus the run-loop join handle.
pub(crate) struct SpawnedActor {
    pub tx: mpsc::Sender<GraphMsg>,
    pub join: JoinHandle<ActorExit>,
}

impl GraphActor {
    /// Spawn the actor for a brand-new graph.
    ///
    /// The `GraphCreated` event is durably journaled before this
    /// returns, so a duplicate create observed after a crash still
    /// finds the journal.
    pub(crate) async fn spawn_create(
        graph_id: GraphId,
        function_id: FunctionId,
        deps: ActorDeps,
    ) -> Result<SpawnedActor, CoreError> {
        let name = actor_name(&graph_id);
        let now = Utc::now();
        let created = GraphEvent::GraphCreated {
            graph_id: graph_id.clone(),
            function_id: function_id.clone(),
            created_at: now,
        };
        deps.provider.persist_event(&name, 1, &created).await?;

        deps.stream.publish(LifecycleEvent::GraphCreated {
            graph_id: graph_id.clone(),
            function_id: function_id.clone(),
        });
        info!(graph_id = %graph_id, function_id = %function_id, "graph created");

        let graph = Graph::new(graph_id, function_id, now);
        Ok(Self::spawn(name, graph, 1, deps))
    }

    /// Spawn an actor rehydrated from snapshot plus journal.
    pub(crate) async fn spawn_recover(
        graph_id: GraphId,
        deps: ActorDeps,
    ) -> Result<SpawnedActor, CoreError> {
        let name = actor_name(&graph_id);

        // Latest snapshot first, then the journal tail past it. With no
        // snapshot the tail is the whole journal, whose first event
        // must be the creation.
        let (mut graph, mut event_index) = match deps.provider.get_snapshot(&name).await? {
            Some((snapshot, index)) => (Graph::from_snapshot(snapshot), index),
            None => {
                let events = deps.provider.get_events(&name, 1).await?;
                let Some((first_index, first)) = events.first() else {
                    return Err(CoreError::GraphNotFound { graph_id });
                };
                if *first_index != 1 {
                    return Err(CoreError::CorruptJournal {
                        actor_name: name,
                        details: format!("journal starts at index {first_index}, expected 1"),
                    });
                }
                let mut graph =
                    Graph::from_created_event(first).map_err(|_| CoreError::CorruptJournal {
                        actor_name: name.clone(),
                        details: "journal does not start with graph_created".to_string(),
                    })?;
                let mut index = 1;
                for (i, event) in &events[1..] {
                    if *i != index + 1 {
                        return Err(CoreError::CorruptJournal {
                            actor_name: name,
                            details: format!("journal gap: index {i} after {index}"),
                        });
                    }
                    graph.apply(event);
                    index = *i;
                }
                (graph, index)
            }
        };

        for (i, event) in deps.provider.get_events(&name, event_index + 1).await? {
            if i != event_index + 1 {
                return Err(CoreError::CorruptJournal {
                    actor_name: name,
                    details: format!("journal gap: index {i} after {event_index}"),
                });
            }
            graph.apply(&event);
            event_index = i;
        }

        info!(
            actor_name = %name,
            event_index,
            stages = graph.stages().len(),
            "graph rehydrated"
        );
        Ok(Self::spawn(name, graph, event_index, deps))
    }

    fn spawn(actor_name: String, graph: Graph, event_index: u64, deps: ActorDeps) -> SpawnedActor {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let actor = GraphActor {
            actor_name,
            graph,
            event_index,
            events_since_snapshot: 0,
            deps,
            rx,
            self_tx: tx.clone(),
            waiters: HashMap::new(),
            delay_tasks: HashMap::new(),
            in_flight: 0,
        };
        let join = tokio::spawn(actor.run());
        SpawnedActor { tx, join }
    }

    async fn run(mut self) -> ActorExit {
        if let Err(e) = self.resume().await {
            error!(actor_name = %self.actor_name, error = %e, "graph actor failed during resume");
            return ActorExit::Failed;
        }

        loop {
            match tokio::time::timeout(self.deps.idle_window, self.rx.recv()).await {
                Err(_) => {
                    if self.can_passivate() {
                        debug!(actor_name = %self.actor_name, "passivating idle graph actor");
                        return ActorExit::Clean;
                    }
                }
                Ok(None) => return ActorExit::Clean,
                Ok(Some(msg)) => {
                    if let Err(e) = self.handle(msg).await {
                        error!(
                            actor_name = %self.actor_name,
                            error = %e,
                            "graph actor stopping after persistence failure"
                        );
                        return ActorExit::Failed;
                    }
                }
            }
        }
    }

    /// Work owed after (re)spawn: re-arm delay timers, re-dispatch
    /// anything caught mid-flight, and re-derive the ready set.
    async fn resume(&mut self) -> Result<(), CoreError> {
        let delays: Vec<StageId> = self
            .graph
            .stages()
            .iter()
            .filter(|s| s.delay_deadline.is_some() && s.status == StageStatus::Pending)
            .map(|s| s.stage_id.clone())
            .collect();
        for stage_id in delays {
            if let Some(deadline) = self.graph.stage(&stage_id).and_then(|s| s.delay_deadline) {
                self.schedule_delay(stage_id, deadline);
            }
        }

        for decision in self.graph.redispatch_decisions() {
            match decision {
                StageDecision::Dispatch { stage_id, closure, args } => {
                    let function_id = self.graph.function_id().clone();
                    self.send_dispatch(stage_id, function_id, DispatchKind::Closure { closure, args })
                        .await;
                }
                StageDecision::Invoke { stage_id, function_id, request } => {
                    self.send_dispatch(stage_id, function_id, DispatchKind::HttpInvoke { request })
                        .await;
                }
                StageDecision::CompleteNow { stage_id, result } => {
                    self.persist_and_apply(vec![stage_outcome_event(&stage_id, result, Utc::now())])
                        .await?;
                }
            }
        }

        self.run_triggers().await
    }

    fn can_passivate(&self) -> bool {
        self.in_flight == 0 && self.waiters.is_empty() && self.delay_tasks.is_empty()
    }

    async fn handle(&mut self, msg: GraphMsg) -> Result<(), CoreError> {
        match msg {
            GraphMsg::Request(request) => self.handle_request(request).await,
            GraphMsg::StageResult { stage_id, result } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                let events = self
                    .graph
                    .invocation_result_events(&stage_id, result, Utc::now());
                self.process_events(events).await
            }
            GraphMsg::DelayFired { stage_id } => {
                self.delay_tasks.remove(&stage_id);
                let events = self.graph.delay_fired_events(&stage_id, Utc::now());
                self.process_events(events).await
            }
        }
    }

    async fn handle_request(&mut self, request: GraphRequest) -> Result<(), CoreError> {
        match request {
            GraphRequest::AddStage { spec, reply } => {
                match self.graph.add_stage_events(&spec, Utc::now()) {
                    Err(error) => {
                        let _ = reply.send(Err(error));
                        Ok(())
                    }
                    Ok(events) => {
                        let stage_id = self.graph.next_stage_id();
                        self.process_events(events).await?;
                        let _ = reply.send(Ok(AddStageReply {
                            graph_id: self.graph.graph_id().clone(),
                            stage_id,
                        }));
                        Ok(())
                    }
                }
            }

            GraphRequest::GetStageResult { stage_id, reply } => {
                if self.graph.stage(&stage_id).is_none() {
                    let _ = reply.send(Err(CoreError::StageNotFound {
                        graph_id: self.graph.graph_id().clone(),
                        stage_id,
                    }));
                    return Ok(());
                }
                match self.terminal_reply(&stage_id) {
                    Some(result) => {
                        let _ = reply.send(Ok(result));
                    }
                    None => {
                        // Long-poll: park the caller until the stage
                        // terminates. The caller's own timeout drops
                        // the receiving end.
                        self.waiters.entry(stage_id).or_default().push(reply);
                    }
                }
                Ok(())
            }

            GraphRequest::CompleteExternally { stage_id, result, reply } => {
                match self
                    .graph
                    .complete_externally_events(&stage_id, result, Utc::now())
                {
                    Err(error) => {
                        let _ = reply.send(Err(error));
                        Ok(())
                    }
                    Ok(None) => {
                        let _ = reply.send(Ok(CompleteExternallyReply {
                            newly_completed: false,
                        }));
                        Ok(())
                    }
                    Ok(Some(event)) => {
                        self.process_events(vec![event]).await?;
                        let _ = reply.send(Ok(CompleteExternallyReply {
                            newly_completed: true,
                        }));
                        Ok(())
                    }
                }
            }

            GraphRequest::Commit { reply } => match self.graph.commit_events(Utc::now()) {
                Err(error) => {
                    let _ = reply.send(Err(error));
                    Ok(())
                }
                Ok(events) => {
                    self.process_events(events).await?;
                    let _ = reply.send(Ok(CommitReply {
                        graph_id: self.graph.graph_id().clone(),
                        state: self.graph.state(),
                    }));
                    Ok(())
                }
            },
        }
    }

    /// Persist and apply a batch of events, then chase triggers to a
    /// fixpoint.
    async fn process_events(&mut self, events: Vec<GraphEvent>) -> Result<(), CoreError> {
        self.persist_and_apply(events).await?;
        self.run_triggers().await
    }

    async fn persist_and_apply(&mut self, events: Vec<GraphEvent>) -> Result<(), CoreError> {
        for event in events {
            let index = self.event_index + 1;
            self.deps
                .provider
                .persist_event(&self.actor_name, index, &event)
                .await?;
            self.event_index = index;
            self.graph.apply(&event);
            self.post_apply(&event);

            self.events_since_snapshot += 1;
            if self.events_since_snapshot >= self.deps.provider.snapshot_interval() {
                self.deps
                    .provider
                    .persist_snapshot(&self.actor_name, self.event_index, &self.graph.to_snapshot())
                    .await?;
                self.events_since_snapshot = 0;
            }
        }
        Ok(())
    }

    /// Evaluate ready stages until nothing new triggers. Dispatch order
    /// within one pass follows stage insertion order.
    async fn run_triggers(&mut self) -> Result<(), CoreError> {
        loop {
            let decisions = self.graph.pending_decisions();
            if decisions.is_empty() {
                match self.graph.completion_event(Utc::now()) {
                    Some(event) => {
                        self.persist_and_apply(vec![event]).await?;
                        continue;
                    }
                    None => break,
                }
            }

            for decision in decisions {
                match decision {
                    StageDecision::CompleteNow { stage_id, result } => {
                        self.persist_and_apply(vec![stage_outcome_event(
                            &stage_id,
                            result,
                            Utc::now(),
                        )])
                        .await?;
                    }
                    StageDecision::Dispatch { stage_id, closure, args } => {
                        self.persist_and_apply(vec![GraphEvent::FaasInvocationStarted {
                            stage_id: stage_id.clone(),
                            started_at: Utc::now(),
                        }])
                        .await?;
                        let function_id = self.graph.function_id().clone();
                        self.send_dispatch(
                            stage_id,
                            function_id,
                            DispatchKind::Closure { closure, args },
                        )
                        .await;
                    }
                    StageDecision::Invoke { stage_id, function_id, request } => {
                        self.persist_and_apply(vec![GraphEvent::FaasInvocationStarted {
                            stage_id: stage_id.clone(),
                            started_at: Utc::now(),
                        }])
                        .await?;
                        self.send_dispatch(
                            stage_id,
                            function_id,
                            DispatchKind::HttpInvoke { request },
                        )
                        .await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn send_dispatch(&mut self, stage_id: StageId, function_id: FunctionId, kind: DispatchKind) {
        self.in_flight += 1;
        let request = DispatchRequest {
            graph_id: self.graph.graph_id().clone(),
            stage_id: stage_id.clone(),
            function_id,
            kind,
            reply_to: self.self_tx.clone(),
        };
        if self.deps.executor.dispatch(request).await.is_err() {
            warn!(
                actor_name = %self.actor_name,
                stage_id = %stage_id,
                "executor unavailable; failing stage dispatch"
            );
            let outcome = GraphMsg::StageResult {
                stage_id,
                result: CompletionResult::from_error(
                    ErrorKind::FunctionInvokeFailed,
                    "executor unavailable",
                ),
            };
            let _ = self.self_tx.try_send(outcome);
        }
    }

    /// Side effects owed after applying an event: waiters, timers, and
    /// the process-wide stream.
    fn post_apply(&mut self, event: &GraphEvent) {
        match event {
            GraphEvent::StageAdded {
                stage_id,
                operation,
                delay_deadline,
                ..
            } => {
                self.deps.stream.publish(LifecycleEvent::StageAdded {
                    graph_id: self.graph.graph_id().clone(),
                    stage_id: stage_id.clone(),
                    operation: *operation,
                });
                if let Some(deadline) = delay_deadline {
                    self.schedule_delay(stage_id.clone(), *deadline);
                }
            }
            GraphEvent::StageCompleted { stage_id, .. }
            | GraphEvent::StageFailed { stage_id, .. } => {
                if let Some(task) = self.delay_tasks.remove(stage_id) {
                    task.abort();
                }
                let status = self
                    .graph
                    .stage(stage_id)
                    .map(|s| s.status)
                    .unwrap_or(StageStatus::Failed);
                self.deps.stream.publish(LifecycleEvent::StageCompleted {
                    graph_id: self.graph.graph_id().clone(),
                    stage_id: stage_id.clone(),
                    status,
                });
                self.fire_waiters(stage_id);
            }
            GraphEvent::GraphCompleted { .. } => {
                for (_, task) in self.delay_tasks.drain() {
                    task.abort();
                }
                self.deps.stream.publish(LifecycleEvent::GraphCompleted {
                    graph_id: self.graph.graph_id().clone(),
                    state: self.graph.state(),
                });
                // Every stage is terminal or cancelled now; nobody
                // stays parked.
                let parked: Vec<StageId> = self.waiters.keys().cloned().collect();
                for stage_id in parked {
                    self.fire_waiters(&stage_id);
                }
            }
            _ => {}
        }
    }

    fn fire_waiters(&mut self, stage_id: &StageId) {
        let Some(waiters) = self.waiters.remove(stage_id) else {
            return;
        };
        let reply = match self.terminal_reply(stage_id) {
            Some(reply) => Ok(reply),
            None => Err(CoreError::StageNotFound {
                graph_id: self.graph.graph_id().clone(),
                stage_id: stage_id.clone(),
            }),
        };
        for waiter in waiters {
            let _ = waiter.send(reply.clone());
        }
    }

    /// The reply a terminal stage yields, or `None` while it is open.
    fn terminal_reply(&self, stage_id: &StageId) -> Option<StageResultReply> {
        let stage = self.graph.stage(stage_id)?;
        if !stage.status.is_terminal() {
            return None;
        }
        let result = match &stage.result {
            Some(result) => result.clone(),
            None => CompletionResult::from_error(
                ErrorKind::StageLost,
                format!("stage '{stage_id}' was cancelled when the graph terminated"),
            ),
        };
        Some(StageResultReply {
            graph_id: self.graph.graph_id().clone(),
            stage_id: stage_id.clone(),
            status: stage.status,
            result,
        })
    }

    fn schedule_delay(&mut self, stage_id: StageId, deadline: chrono::DateTime<Utc>) {
        let tx = self.self_tx.clone();
        // Past deadlines (recovery after a long outage) fire at once.
        let delay = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let id = stage_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(GraphMsg::DelayFired { stage_id: id }).await;
        });
        self.delay_tasks.insert(stage_id, task);
    }
}

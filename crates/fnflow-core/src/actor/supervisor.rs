// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command routing and child lifecycle.
//!
//! The supervisor owns the `graph_id -> actor` map. Commands for a
//! graph without a live actor spawn one: fresh graphs journal their
//! creation, known graphs rehydrate from snapshot plus journal before
//! the first command is processed.
//!
//! Supervision is one-for-one: a failed child is simply dropped and the
//! next command respawns it from persistence. A graph that keeps
//! failing (10 failures inside 1000 ms) is stopped permanently and its
//! commands answered with an error.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::CoreError;
use crate::model::{CreateGraphReply, FunctionId, GraphId};

use super::graph_actor::{ActorDeps, ActorExit, GraphActor, SpawnedActor, actor_name};
use super::{GraphMsg, GraphRequest};

/// Failures tolerated inside [`RESTART_WINDOW`] before a graph is
/// stopped permanently.
const MAX_FAILURES: u32 = 10;
const RESTART_WINDOW: Duration = Duration::from_millis(1000);

/// Inbound supervisor messages.
pub enum SupervisorRequest {
    CreateGraph {
        graph_id: GraphId,
        function_id: FunctionId,
        reply: oneshot::Sender<Result<CreateGraphReply, CoreError>>,
    },
    /// Any per-graph command, routed to the owning actor.
    GraphCommand {
        graph_id: GraphId,
        request: GraphRequest,
    },
    /// Internal: a child's run loop ended.
    ChildExited {
        graph_id: GraphId,
        generation: u64,
        exit: ActorExit,
    },
}

/// Cheap handle for submitting supervisor requests.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorRequest>,
}

impl SupervisorHandle {
    /// Submit a request. Fails only when the engine has shut down.
    pub async fn send(&self, request: SupervisorRequest) -> Result<(), CoreError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| CoreError::EngineStopped)
    }
}

struct Child {
    tx: mpsc::Sender<GraphMsg>,
    generation: u64,
}

#[derive(Default)]
struct RestartStats {
    window_start: Option<Instant>,
    failures: u32,
    poisoned: bool,
}

impl RestartStats {
    /// Record one failure; returns true when the budget is exhausted.
    fn note_failure(&mut self, now: Instant) -> bool {
        match self.window_start {
            Some(start) if now.duration_since(start) <= RESTART_WINDOW => {
                self.failures += 1;
            }
            _ => {
                self.window_start = Some(now);
                self.failures = 1;
            }
        }
        if self.failures >= MAX_FAILURES {
            self.poisoned = true;
        }
        self.poisoned
    }
}

/// The routing actor. Spawn with [`spawn_supervisor`].
pub struct Supervisor {
    rx: mpsc::Receiver<SupervisorRequest>,
    self_tx: mpsc::Sender<SupervisorRequest>,
    deps: ActorDeps,
    children: HashMap<GraphId, Child>,
    restarts: HashMap<GraphId, RestartStats>,
    generation: u64,
    shutdown: watch::Receiver<bool>,
}

/// Spawn the supervisor task.
pub fn spawn_supervisor(
    deps: ActorDeps,
    shutdown: watch::Receiver<bool>,
) -> (SupervisorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(256);
    let supervisor = Supervisor {
        rx,
        self_tx: tx.clone(),
        deps,
        children: HashMap::new(),
        restarts: HashMap::new(),
        generation: 0,
        shutdown,
    };
    let join = tokio::spawn(supervisor.run());
    (SupervisorHandle { tx }, join)
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        debug!("supervisor shutting down");
                        break;
                    }
                }
                request = self.rx.recv() => match request {
                    None => break,
                    Some(request) => self.handle(request).await,
                }
            }
        }
        // Dropping the children closes their mailboxes; each actor
        // finishes its current message and exits.
        self.children.clear();
    }

    async fn handle(&mut self, request: SupervisorRequest) {
        match request {
            SupervisorRequest::CreateGraph {
                graph_id,
                function_id,
                reply,
            } => {
                let _ = reply.send(self.create_graph(graph_id, function_id).await);
            }
            SupervisorRequest::GraphCommand { graph_id, request } => {
                self.route(graph_id, request).await;
            }
            SupervisorRequest::ChildExited {
                graph_id,
                generation,
                exit,
            } => {
                self.child_exited(graph_id, generation, exit);
            }
        }
    }

    async fn create_graph(
        &mut self,
        graph_id: GraphId,
        function_id: FunctionId,
    ) -> Result<CreateGraphReply, CoreError> {
        if let Some(child) = self.children.get(&graph_id) {
            if !child.tx.is_closed() {
                return Err(CoreError::GraphAlreadyExists { graph_id });
            }
            self.children.remove(&graph_id);
        }
        if self.deps.provider.journal_exists(&actor_name(&graph_id)).await? {
            return Err(CoreError::GraphAlreadyExists { graph_id });
        }

        let spawned =
            GraphActor::spawn_create(graph_id.clone(), function_id, self.deps.clone()).await?;
        self.register(graph_id.clone(), spawned);
        Ok(CreateGraphReply { graph_id })
    }

    async fn route(&mut self, graph_id: GraphId, request: GraphRequest) {
        if self
            .restarts
            .get(&graph_id)
            .is_some_and(|stats| stats.poisoned)
        {
            request.reply_err(CoreError::PersistenceFailed {
                operation: "supervise".to_string(),
                details: format!("graph '{graph_id}' stopped permanently after repeated failures"),
            });
            return;
        }

        // Fast path: a live child.
        let request = if let Some(child) = self.children.get(&graph_id) {
            match child.tx.send(GraphMsg::Request(request)).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(msg)) => {
                    // The child passivated or died since we last looked;
                    // recover the command and fall through to respawn.
                    self.children.remove(&graph_id);
                    match msg {
                        GraphMsg::Request(request) => request,
                        // Only requests are routed through here.
                        _ => return,
                    }
                }
            }
        } else {
            request
        };

        // Slow path: hydrate from persistence.
        match self.deps.provider.journal_exists(&actor_name(&graph_id)).await {
            Ok(true) => {}
            Ok(false) => {
                request.reply_err(CoreError::GraphNotFound {
                    graph_id: graph_id.clone(),
                });
                return;
            }
            Err(error) => {
                request.reply_err(error);
                return;
            }
        }

        match GraphActor::spawn_recover(graph_id.clone(), self.deps.clone()).await {
            Ok(spawned) => {
                let tx = spawned.tx.clone();
                self.register(graph_id, spawned);
                if let Err(mpsc::error::SendError(msg)) = tx.send(GraphMsg::Request(request)).await
                {
                    if let GraphMsg::Request(request) = msg {
                        request.reply_err(CoreError::PersistenceFailed {
                            operation: "route".to_string(),
                            details: "graph actor stopped before accepting the command".to_string(),
                        });
                    }
                }
            }
            Err(error) => {
                // Journal read or decode failure parks this graph only;
                // the process survives.
                error!(graph_id = %graph_id, error = %error, "failed to rehydrate graph");
                request.reply_err(error);
            }
        }
    }

    fn register(&mut self, graph_id: GraphId, spawned: SpawnedActor) {
        self.generation += 1;
        let generation = self.generation;
        self.children.insert(
            graph_id.clone(),
            Child {
                tx: spawned.tx,
                generation,
            },
        );

        let supervisor = self.self_tx.clone();
        tokio::spawn(async move {
            // A panicked child counts as a failure.
            let exit = spawned.join.await.unwrap_or(ActorExit::Failed);
            let _ = supervisor
                .send(SupervisorRequest::ChildExited {
                    graph_id,
                    generation,
                    exit,
                })
                .await;
        });
    }

    fn child_exited(&mut self, graph_id: GraphId, generation: u64, exit: ActorExit) {
        let current = self
            .children
            .get(&graph_id)
            .is_some_and(|child| child.generation == generation);
        if current {
            self.children.remove(&graph_id);
        }

        match exit {
            ActorExit::Clean => {
                debug!(graph_id = %graph_id, "graph actor passivated");
            }
            ActorExit::Failed => {
                let poisoned = self
                    .restarts
                    .entry(graph_id.clone())
                    .or_default()
                    .note_failure(Instant::now());
                if poisoned {
                    error!(
                        graph_id = %graph_id,
                        "graph actor stopped permanently after repeated failures"
                    );
                } else {
                    warn!(
                        graph_id = %graph_id,
                        "graph actor failed; it will rehydrate on the next command"
                    );
                }
            }
        }
    }
}

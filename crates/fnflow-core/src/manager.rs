// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for fnflow-core.
//!
//! [`FlowRuntime`] wires persistence, executor, supervisor, and the
//! lifecycle stream into a running engine, for the service binary and
//! for tests that embed the core directly. [`GraphManager`] is the
//! typed front door the API server mounts on: every graph operation,
//! each with a caller-supplied timeout.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use fnflow_core::manager::FlowRuntime;
//! use fnflow_core::executor::ExecutorConfig;
//! use fnflow_core::persistence::SqlitePersistence;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path(".data/flow.db", 100).await?);
//!
//!     let runtime = FlowRuntime::builder()
//!         .persistence(persistence)
//!         .executor(ExecutorConfig {
//!             base_url: "http://localhost:8080/r".to_string(),
//!             max_attempts: 3,
//!             base_backoff: Duration::from_millis(50),
//!         })
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let manager = runtime.manager().clone();
//!     manager.create_graph("g1", "my-fn", Duration::from_secs(5)).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use fnflow_protocol::CompletionResult;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::actor::{ActorDeps, GraphRequest, SupervisorHandle, SupervisorRequest, spawn_supervisor};
use crate::error::CoreError;
use crate::executor::{ExecutorConfig, spawn_executor};
use crate::model::{
    AddStageReply, AddStageSpec, CommitReply, CompleteExternallyReply, CreateGraphReply,
    StageResultReply,
};
use crate::persistence::PersistenceProvider;
use crate::stream::{DEFAULT_STREAM_CAPACITY, EventStream, GraphSubscription, LifecycleEvent};

/// Builder for a [`FlowRuntime`].
pub struct FlowRuntimeBuilder {
    provider: Option<Arc<dyn PersistenceProvider>>,
    executor: Option<ExecutorConfig>,
    idle_window: Duration,
    stream_capacity: usize,
}

impl std::fmt::Debug for FlowRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRuntimeBuilder")
            .field("provider", &self.provider.as_ref().map(|_| "..."))
            .field("executor", &self.executor)
            .field("idle_window", &self.idle_window)
            .field("stream_capacity", &self.stream_capacity)
            .finish()
    }
}

impl Default for FlowRuntimeBuilder {
    fn default() -> Self {
        Self {
            provider: None,
            executor: None,
            idle_window: Duration::from_secs(300),
            stream_capacity: DEFAULT_STREAM_CAPACITY,
        }
    }
}

impl FlowRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, provider: Arc<dyn PersistenceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the executor configuration (required).
    pub fn executor(mut self, config: ExecutorConfig) -> Self {
        self.executor = Some(config);
        self
    }

    /// Set the actor passivation window.
    ///
    /// Default: 300 seconds.
    pub fn idle_window(mut self, window: Duration) -> Self {
        self.idle_window = window;
        self
    }

    /// Set the lifecycle stream's per-subscriber buffer.
    pub fn stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = capacity;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> anyhow::Result<FlowRuntimeConfig> {
        let provider = self
            .provider
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let executor = self
            .executor
            .ok_or_else(|| anyhow::anyhow!("executor configuration is required"))?;

        Ok(FlowRuntimeConfig {
            provider,
            executor,
            idle_window: self.idle_window,
            stream_capacity: self.stream_capacity,
        })
    }
}

/// Configuration for a [`FlowRuntime`].
pub struct FlowRuntimeConfig {
    provider: Arc<dyn PersistenceProvider>,
    executor: ExecutorConfig,
    idle_window: Duration,
    stream_capacity: usize,
}

impl FlowRuntimeConfig {
    /// Start the runtime: executor task, supervisor task, and stream.
    pub async fn start(self) -> anyhow::Result<FlowRuntime> {
        let stream = EventStream::new(self.stream_capacity);
        let executor = spawn_executor(self.executor);
        let deps = ActorDeps {
            provider: self.provider,
            executor,
            stream: stream.clone(),
            idle_window: self.idle_window,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (supervisor, supervisor_join) = spawn_supervisor(deps, shutdown_rx);

        info!("FlowRuntime started");

        Ok(FlowRuntime {
            manager: GraphManager { supervisor, stream },
            shutdown_tx,
            supervisor_join,
        })
    }
}

/// A running fnflow engine that can be embedded in an application.
pub struct FlowRuntime {
    manager: GraphManager,
    shutdown_tx: watch::Sender<bool>,
    supervisor_join: JoinHandle<()>,
}

impl FlowRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> FlowRuntimeBuilder {
        FlowRuntimeBuilder::new()
    }

    /// The typed command surface.
    pub fn manager(&self) -> &GraphManager {
        &self.manager
    }

    /// Gracefully shut down the runtime.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!("FlowRuntime shutting down...");
        let _ = self.shutdown_tx.send(true);
        self.supervisor_join
            .await
            .map_err(|e| anyhow::anyhow!("supervisor task panicked: {e}"))?;
        info!("FlowRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.supervisor_join.is_finished()
    }
}

/// Typed handle over the supervisor: all graph operations, each with a
/// caller-supplied timeout. Cloneable and cheap to share.
#[derive(Clone)]
pub struct GraphManager {
    supervisor: SupervisorHandle,
    stream: EventStream,
}

impl GraphManager {
    /// Allocate a new graph.
    pub async fn create_graph(
        &self,
        graph_id: impl Into<String>,
        function_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<CreateGraphReply, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.supervisor
            .send(SupervisorRequest::CreateGraph {
                graph_id: graph_id.into(),
                function_id: function_id.into(),
                reply,
            })
            .await?;
        await_reply(rx, timeout, CoreError::RequestTimeout).await
    }

    /// Append a stage to a graph.
    pub async fn add_stage(
        &self,
        graph_id: impl Into<String>,
        spec: AddStageSpec,
        timeout: Duration,
    ) -> Result<AddStageReply, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.supervisor
            .send(SupervisorRequest::GraphCommand {
                graph_id: graph_id.into(),
                request: GraphRequest::AddStage { spec, reply },
            })
            .await?;
        await_reply(rx, timeout, CoreError::RequestTimeout).await
    }

    /// Long-poll a stage's result. Times out with `StageTimeout`
    /// without affecting the stage.
    pub async fn get_stage_result(
        &self,
        graph_id: impl Into<String>,
        stage_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<StageResultReply, CoreError> {
        let graph_id = graph_id.into();
        let stage_id = stage_id.into();
        let (reply, rx) = oneshot::channel();
        self.supervisor
            .send(SupervisorRequest::GraphCommand {
                graph_id: graph_id.clone(),
                request: GraphRequest::GetStageResult {
                    stage_id: stage_id.clone(),
                    reply,
                },
            })
            .await?;
        await_reply(rx, timeout, CoreError::StageTimeout { graph_id, stage_id }).await
    }

    /// Complete an `externalCompletion` stage from outside the graph.
    pub async fn complete_stage_externally(
        &self,
        graph_id: impl Into<String>,
        stage_id: impl Into<String>,
        result: CompletionResult,
        timeout: Duration,
    ) -> Result<CompleteExternallyReply, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.supervisor
            .send(SupervisorRequest::GraphCommand {
                graph_id: graph_id.into(),
                request: GraphRequest::CompleteExternally {
                    stage_id: stage_id.into(),
                    result,
                    reply,
                },
            })
            .await?;
        await_reply(rx, timeout, CoreError::RequestTimeout).await
    }

    /// Declare that no further root-level stages will be added.
    pub async fn commit(
        &self,
        graph_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<CommitReply, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.supervisor
            .send(SupervisorRequest::GraphCommand {
                graph_id: graph_id.into(),
                request: GraphRequest::Commit { reply },
            })
            .await?;
        await_reply(rx, timeout, CoreError::RequestTimeout).await
    }

    /// Subscribe to every graph's lifecycle events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LifecycleEvent> {
        self.stream.subscribe()
    }

    /// Subscribe to one graph's lifecycle events.
    pub fn subscribe_graph(&self, graph_id: impl Into<String>) -> GraphSubscription {
        self.stream.subscribe_graph(graph_id)
    }
}

/// Await a reply oneshot under the caller's deadline. Timing out drops
/// the receiver; the actor's eventual send becomes a no-op while the
/// in-flight work continues.
async fn await_reply<T>(
    rx: oneshot::Receiver<Result<T, CoreError>>,
    timeout: Duration,
    timeout_error: CoreError,
) -> Result<T, CoreError> {
    match tokio::time::timeout(timeout, rx).await {
        Err(_) => Err(timeout_error),
        Ok(Err(_)) => Err(CoreError::PersistenceFailed {
            operation: "reply".to_string(),
            details: "graph actor stopped before replying".to_string(),
        }),
        Ok(Ok(result)) => result,
    }
}

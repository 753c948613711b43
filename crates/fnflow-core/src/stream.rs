// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-wide lifecycle event stream.
//!
//! Graph actors publish coarse lifecycle events here; the API layer
//! subscribes to satisfy long-poll clients. The channel is a bounded
//! broadcast: a subscriber that falls behind loses the oldest events
//! rather than blocking publishers.

use tokio::sync::broadcast;

use crate::model::{GraphId, GraphState, StageId, StageOperation, StageStatus};

/// Default per-subscriber buffer size.
pub const DEFAULT_STREAM_CAPACITY: usize = 256;

/// Coarse lifecycle notifications, one per graph milestone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    GraphCreated {
        graph_id: GraphId,
        function_id: String,
    },
    StageAdded {
        graph_id: GraphId,
        stage_id: StageId,
        operation: StageOperation,
    },
    StageCompleted {
        graph_id: GraphId,
        stage_id: StageId,
        status: StageStatus,
    },
    GraphCompleted {
        graph_id: GraphId,
        state: GraphState,
    },
}

impl LifecycleEvent {
    /// Graph this event belongs to.
    pub fn graph_id(&self) -> &GraphId {
        match self {
            Self::GraphCreated { graph_id, .. }
            | Self::StageAdded { graph_id, .. }
            | Self::StageCompleted { graph_id, .. }
            | Self::GraphCompleted { graph_id, .. } => graph_id,
        }
    }
}

/// Handle for publishing and subscribing to lifecycle events.
#[derive(Clone)]
pub struct EventStream {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_CAPACITY)
    }
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to every graph's events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Subscribe to a single graph's events.
    pub fn subscribe_graph(&self, graph_id: impl Into<GraphId>) -> GraphSubscription {
        GraphSubscription {
            graph_id: graph_id.into(),
            rx: self.tx.subscribe(),
        }
    }
}

/// A subscription filtered to one graph id.
pub struct GraphSubscription {
    graph_id: GraphId,
    rx: broadcast::Receiver<LifecycleEvent>,
}

impl GraphSubscription {
    /// Next event for the subscribed graph.
    ///
    /// Events for other graphs are skipped, and lagging past the buffer
    /// silently drops the oldest events. Returns `None` once the stream
    /// is closed.
    pub async fn next(&mut self) -> Option<LifecycleEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.graph_id() == &self.graph_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

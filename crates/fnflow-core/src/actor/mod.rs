// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The actor fabric: one graph actor per graph, a supervisor routing
//! commands and owning child lifecycles.
//!
//! All graph mutation is serialized through a graph actor's mailbox;
//! the only shared mutable resource is the persistence provider, whose
//! keys are unique per actor. Executor replies and delay timers are
//! ordinary mailbox messages, so they interleave with client commands
//! in one total order per graph.

pub mod graph_actor;
pub mod supervisor;

pub use graph_actor::{ActorDeps, actor_name};
pub use supervisor::{Supervisor, SupervisorHandle, SupervisorRequest, spawn_supervisor};

use fnflow_protocol::CompletionResult;
use tokio::sync::oneshot;

use crate::error::CoreError;
use crate::model::{
    AddStageReply, AddStageSpec, CommitReply, CompleteExternallyReply, StageId, StageResultReply,
};

/// Messages delivered to a graph actor's mailbox.
pub enum GraphMsg {
    /// A routed client command.
    Request(GraphRequest),
    /// An executor outcome for a dispatched stage.
    StageResult {
        stage_id: StageId,
        result: CompletionResult,
    },
    /// A delay stage's timer elapsed.
    DelayFired { stage_id: StageId },
}

/// Client commands, each carrying its reply channel.
///
/// Replies are oneshots: if the caller's deadline expires first the
/// receiver is dropped and the send is a no-op, exactly the
/// drop-the-reply semantics clients expect from a timed-out request.
pub enum GraphRequest {
    AddStage {
        spec: AddStageSpec,
        reply: oneshot::Sender<Result<AddStageReply, CoreError>>,
    },
    GetStageResult {
        stage_id: StageId,
        reply: oneshot::Sender<Result<StageResultReply, CoreError>>,
    },
    CompleteExternally {
        stage_id: StageId,
        result: CompletionResult,
        reply: oneshot::Sender<Result<CompleteExternallyReply, CoreError>>,
    },
    Commit {
        reply: oneshot::Sender<Result<CommitReply, CoreError>>,
    },
}

impl GraphRequest {
    /// Answer this request with an error, consuming it.
    pub(crate) fn reply_err(self, error: CoreError) {
        match self {
            Self::AddStage { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::GetStageResult { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::CompleteExternally { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::Commit { reply } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

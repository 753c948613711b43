// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fnflow Core - Cloud-Functions Completion Engine
//!
//! This crate is the execution core of a cloud-functions completion
//! service: short-lived function invocations build directed acyclic
//! graphs of asynchronous computations whose individual stages are
//! themselves function invocations. The core persists every decision,
//! dispatches ready stages to the function runtime over HTTP, and
//! replays the same trajectory after a crash or failover.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        API Server                               │
//! │              (out of scope; mounts on GraphManager)             │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │ commands + lifecycle stream
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Supervisor ── one-for-one ──► Graph Actor (one per graph)      │
//! │    routes commands              owns state, journals events,    │
//! │    spawns / rehydrates          schedules continuations         │
//! └───────────┬───────────────────────────────┬─────────────────────┘
//!             │                               │ dispatch / outcome
//!             ▼                               ▼
//! ┌───────────────────────┐       ┌────────────────────────────────┐
//! │  Persistence Provider │       │  Executor                      │
//! │  events + snapshots   │       │  POST <runtime>/r/<function>   │
//! │  (SQLite/PostgreSQL)  │       │  Datum wire format, retries    │
//! └───────────────────────┘       └────────────────────────────────┘
//! ```
//!
//! # Event sourcing
//!
//! Every observable state change of a graph corresponds to exactly one
//! journaled event, persisted before it is applied and before the
//! client sees a reply. Actors snapshot their full state every N
//! events; recovery loads the latest snapshot, replays the journal tail
//! and re-derives the ready set, re-dispatching anything that was in
//! flight (delivery to the runtime is at-least-once, graph state
//! changes are exactly-once).
//!
//! # Graph state machine
//!
//! ```text
//! Stage:  Pending --(deps satisfied)--> Running --success--> Succeeded
//!                                              \--failure--> Failed
//!         Pending --graph-fail--> Cancelled
//!
//! Graph:  Active --commit--> Committed --all stages terminal-->
//!             Completed | Failed (unhandled stage failure)
//! ```
//!
//! # Modules
//!
//! - [`config`]: Service configuration from environment variables
//! - [`error`]: Error taxonomy with stable error codes
//! - [`model`]: Operations, statuses, journal events, command surface
//! - [`graph`]: The pure graph state machine
//! - [`persistence`]: Journal + snapshot providers (SQLite, PostgreSQL)
//! - [`actor`]: Graph actors and the supervisor
//! - [`executor`]: HTTP dispatcher with retry/backoff
//! - [`stream`]: Process-wide lifecycle broadcast
//! - [`manager`]: Embeddable runtime and the typed `GraphManager`
//! - [`migrations`]: Embedded database migrations

pub mod actor;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod manager;
pub mod migrations;
pub mod model;
pub mod persistence;
pub mod stream;

pub use error::CoreError;
pub use manager::{FlowRuntime, FlowRuntimeBuilder, GraphManager};

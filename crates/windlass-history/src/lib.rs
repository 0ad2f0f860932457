// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Windlass History - the sharded workflow history engine
//!
//! This crate is the core of windlass: the per-workflow state machine, its
//! transactional mutable-state layer, the transfer/timer task queues that
//! materialize side effects, and the cross-datacenter replication stack.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Shard Controller                          │
//! │        range-ID fencing · task ID allocation · ack levels        │
//! └──────────────────────────────────────────────────────────────────┘
//!        │                    │                        │
//!        ▼                    ▼                        ▼
//! ┌──────────────┐   ┌─────────────────┐   ┌──────────────────────┐
//! │ HistoryEngine │   │ Transfer/Timer  │   │ Replication stack    │
//! │  API surface  │   │ queue processors│   │ ack mgr · DLQ · nDC  │
//! └──────┬───────┘   │ active/standby  │   └──────────┬───────────┘
//!        │           └────────┬────────┘              │
//!        ▼                    ▼                        ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │           History Cache (per-run lock) + Event Cache             │
//! │                     Mutable State + Context                      │
//! └──────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                 ExecutionStore · HistoryStore
//! ```
//!
//! # Ordering guarantees
//!
//! - Within one run, all mutations are totally ordered by the context lock.
//! - Within one shard, transfer-task enqueue order equals task-ID order;
//!   processing order equals task-ID order modulo retries.
//! - Across clusters, ordering is per-run and enforced by version
//!   histories, never wall-clock time.

#![deny(missing_docs)]

/// Bounded caches for workflow contexts and events.
pub mod cache;

/// Contracts of remote collaborators (matching, visibility, re-replication).
pub mod clients;

/// Workflow execution context: load and persist mutable state.
pub mod context;

/// The history engine API surface.
pub mod engine;

/// Per-run mutable state and its transaction machinery.
pub mod mutable_state;

/// nDC transaction manager: applying remote history batches.
pub mod ndc;

/// Replication ack manager and DLQ.
pub mod replication;

/// Shard controller: ownership, fencing, ack levels.
pub mod shard;

/// Active transfer-task executor.
pub mod transfer_active;

/// Transfer queue processor and executor contract.
pub mod transfer_queue;

/// Standby transfer-task executor.
pub mod transfer_standby;

/// Timer queue processor and both timer executors.
pub mod timer_queue;

pub use engine::{Decision, HistoryEngine, StartWorkflowRequest};
pub use mutable_state::{ActivityParams, MutableState, StartWorkflowParams, TransactionPolicy};
pub use shard::{ShardContext, ShardController};

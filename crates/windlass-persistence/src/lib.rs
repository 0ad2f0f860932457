// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Windlass Persistence - data model and storage contracts
//!
//! This crate defines what the history service persists and the contracts a
//! storage driver must honor. Drivers themselves live outside this
//! repository; the [`memory`] module provides an in-memory implementation
//! with the full fencing/CAS semantics for tests and embedded use.
//!
//! # Contracts
//!
//! | Trait | Responsibility |
//! |-------|----------------|
//! | [`store::ShardStore`] | Shard rows with range-ID fencing |
//! | [`store::ExecutionStore`] | Workflow snapshots, current-run pointer, transfer/timer/replication task tables |
//! | [`store::HistoryStore`] | Append-only event branches with forking |
//!
//! Every write carries the owning shard's range ID; a write stamped with a
//! stale range ID fails with `ShardOwnershipLost` and the shard shuts down.

pub mod memory;
pub mod store;
pub mod types;
pub mod version_history;

pub use store::{ExecutionStore, HistoryStore, ShardStore};
pub use types::*;
pub use version_history::{VersionHistories, VersionHistory, VersionHistoryItem};

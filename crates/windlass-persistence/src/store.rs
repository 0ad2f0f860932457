// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence contracts for the history service.
//!
//! Drivers must honor the fencing rules exactly: every write carries a
//! [`ShardCondition`] and fails with `ShardOwnershipLost` when the stored
//! range ID has moved past the caller's. Conditional state writes fail with
//! `ConditionalUpdateFailed` when the stored `next_event_id` no longer
//! matches the caller's condition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use windlass_common::error::Result;

use crate::types::{
    BranchToken, CreateWorkflowMode, CurrentExecution, CurrentWorkflowCas, HistoryEvent,
    ReplicationTask, ShardCondition, ShardInfo, TimerTask, TransferTask, UpdateWorkflowMode,
    WorkflowSnapshot, WorkflowTransaction,
};

/// Shard rows with range-ID fencing.
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Read the shard row, creating it at range 0 on first contact.
    async fn get_or_create_shard(&self, shard_id: i32) -> Result<ShardInfo>;

    /// Write the shard row iff the stored range ID equals
    /// `expected_range_id`. Acquisition bumps the range; routine ack-level
    /// updates keep it.
    async fn update_shard(&self, info: ShardInfo, expected_range_id: i64) -> Result<()>;
}

/// Workflow snapshots, the current-run pointer, and the task tables.
///
/// `create_workflow` and `update_workflow` are atomic: the snapshot and
/// every attached task become visible together or not at all.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a new run.
    async fn create_workflow(
        &self,
        shard: ShardCondition,
        mode: CreateWorkflowMode,
        txn: WorkflowTransaction,
    ) -> Result<()>;

    /// Update an existing run, optionally CAS-ing the current-run pointer.
    async fn update_workflow(
        &self,
        shard: ShardCondition,
        mode: UpdateWorkflowMode,
        current_cas: Option<CurrentWorkflowCas>,
        txn: WorkflowTransaction,
    ) -> Result<()>;

    /// Load one run's snapshot.
    async fn get_workflow(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<Option<WorkflowSnapshot>>;

    /// Read the current-run pointer.
    async fn get_current_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
    ) -> Result<Option<CurrentExecution>>;

    /// Delete one run and its tasks (retention).
    async fn delete_workflow(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<()>;

    /// Transfer tasks with `min_task_id < task_id <= max_task_id`, in ID
    /// order, at most `batch` of them.
    async fn get_transfer_tasks(
        &self,
        shard_id: i32,
        min_task_id: i64,
        max_task_id: i64,
        batch: usize,
    ) -> Result<Vec<TransferTask>>;

    /// Remove one processed transfer task.
    async fn complete_transfer_task(&self, shard_id: i32, task_id: i64) -> Result<()>;

    /// Remove all transfer tasks with `task_id <= up_to_task_id`.
    async fn range_complete_transfer_tasks(&self, shard_id: i32, up_to_task_id: i64) -> Result<()>;

    /// Timer tasks due in `[min_timestamp, max_timestamp)`, ordered by
    /// `(visibility_timestamp, task_id)`, at most `batch` of them.
    async fn get_timer_tasks(
        &self,
        shard_id: i32,
        min_timestamp: DateTime<Utc>,
        max_timestamp: DateTime<Utc>,
        batch: usize,
    ) -> Result<Vec<TimerTask>>;

    /// Remove one processed timer task.
    async fn complete_timer_task(
        &self,
        shard_id: i32,
        visibility_timestamp: DateTime<Utc>,
        task_id: i64,
    ) -> Result<()>;

    /// Replication tasks with `task_id > min_task_id`, in ID order.
    async fn get_replication_tasks(
        &self,
        shard_id: i32,
        min_task_id: i64,
        batch: usize,
    ) -> Result<Vec<ReplicationTask>>;

    /// Remove one shipped replication task.
    async fn complete_replication_task(&self, shard_id: i32, task_id: i64) -> Result<()>;
}

/// Append-only event branches with forking.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append `events` to `branch`. `txn_id` deduplicates replays of the
    /// same transaction.
    async fn append_history_events(
        &self,
        branch: &BranchToken,
        events: &[HistoryEvent],
        txn_id: i64,
    ) -> Result<()>;

    /// Events with `min_event_id <= event_id < max_event_id` on `branch`.
    async fn read_history_events(
        &self,
        branch: &BranchToken,
        min_event_id: i64,
        max_event_id: i64,
    ) -> Result<Vec<HistoryEvent>>;

    /// Fork a branch: the new branch shares events with IDs below
    /// `fork_event_id` and diverges from there.
    async fn fork_history_branch(
        &self,
        parent: &BranchToken,
        fork_event_id: i64,
    ) -> Result<BranchToken>;

    /// Delete one branch (retention).
    async fn delete_history_branch(&self, branch: &BranchToken) -> Result<()>;
}

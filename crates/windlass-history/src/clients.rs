// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contracts of the history service's remote collaborators.
//!
//! The matching service, the visibility sink, remote front-ends, and the
//! cross-cluster re-replicator all live outside this repository. Queue
//! processors and the replication stack talk to them exclusively through
//! these traits.

use async_trait::async_trait;
use serde_json::Value;

use windlass_common::error::Result;

/// Matching service surface used by the transfer queue.
///
/// Both calls are idempotent on `schedule_id`; re-dispatching an already
/// delivered task is harmless.
#[async_trait]
pub trait MatchingClient: Send + Sync {
    /// Offer a decision task to pollers of `task_list`.
    async fn add_decision_task(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
        schedule_id: i64,
        task_list: &str,
        schedule_to_start_seconds: i32,
    ) -> Result<()>;

    /// Offer an activity task to pollers of `task_list`.
    async fn add_activity_task(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
        schedule_id: i64,
        task_list: &str,
        schedule_to_start_seconds: i32,
    ) -> Result<()>;
}

/// Visibility sink: records open/closed executions for listing.
#[async_trait]
pub trait VisibilityClient: Send + Sync {
    /// Record a started execution.
    async fn record_workflow_started(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
        workflow_type: &str,
        start_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<()>;

    /// Record a closed execution.
    async fn record_workflow_closed(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
        workflow_type: &str,
        close_status: windlass_persistence::CloseStatus,
        close_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<()>;

    /// Push updated search attributes.
    async fn upsert_search_attributes(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
        attributes: &std::collections::HashMap<String, Value>,
    ) -> Result<()>;
}

/// History-service surface of other workflows, local or remote: child
/// starts, cross-workflow cancels and signals, parent close notification.
#[async_trait]
pub trait RemoteWorkflowClient: Send + Sync {
    /// Start a child workflow. Returns the child's run ID.
    async fn start_workflow(
        &self,
        domain_id: &str,
        workflow_id: &str,
        workflow_type: &str,
        task_list: &str,
        input: Option<Value>,
    ) -> Result<String>;

    /// Request cancellation of a workflow.
    async fn request_cancel(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<()>;

    /// Deliver a signal to a workflow.
    async fn signal(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
        signal_name: &str,
        input: Option<Value>,
    ) -> Result<()>;

    /// Tell a parent that one of its children closed.
    async fn record_child_completed(
        &self,
        parent_domain_id: &str,
        parent_workflow_id: &str,
        parent_run_id: &str,
        initiated_id: i64,
        child_run_id: &str,
    ) -> Result<()>;
}

/// Cross-cluster history pull, used by standby processors and the
/// replication ack manager to close event gaps.
#[async_trait]
pub trait HistoryRereplicator: Send + Sync {
    /// Fetch events `[begin_event_id, end_event_id)` of the given run range
    /// from the active cluster and apply them locally.
    #[allow(clippy::too_many_arguments)]
    async fn send_multi_workflow_history(
        &self,
        domain_id: &str,
        workflow_id: &str,
        begin_run_id: &str,
        begin_event_id: i64,
        end_run_id: &str,
        end_event_id: i64,
    ) -> Result<()>;
}

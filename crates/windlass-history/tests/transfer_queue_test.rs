// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transfer queue end-to-end tests: active dispatch, standby deferral,
//! standby re-replication.

mod common;

use chrono::Utc;
use common::{replicated_activity_events, TestContext};
use windlass_common::cluster::test_fixtures::{TEST_ALTERNATIVE_CLUSTER, TEST_CURRENT_CLUSTER};
use windlass_common::domain::test_fixtures::global_domain;
use windlass_common::END_EVENT_ID;
use windlass_history::engine::{Decision, StartWorkflowRequest};
use windlass_history::mutable_state::ActivityParams;
use windlass_history::transfer_queue::TransferTaskExecutor;
use windlass_persistence::{
    ReplicationBatch, TransferTask, TransferTaskKind, VersionHistoryItem, WorkflowKey,
};

fn active_domain() -> windlass_common::domain::DomainEntry {
    global_domain(
        "d-orders",
        "orders",
        TEST_CURRENT_CLUSTER,
        &[TEST_CURRENT_CLUSTER, TEST_ALTERNATIVE_CLUSTER],
        1,
    )
}

fn standby_domain() -> windlass_common::domain::DomainEntry {
    global_domain(
        "d-billing",
        "billing",
        TEST_ALTERNATIVE_CLUSTER,
        &[TEST_CURRENT_CLUSTER, TEST_ALTERNATIVE_CLUSTER],
        2,
    )
}

/// Start a workflow and complete its first decision scheduling one
/// activity. Returns the run key; the activity's scheduled event is 5.
async fn start_and_schedule_activity(ctx: &TestContext) -> WorkflowKey {
    let run_id = ctx
        .engine
        .start_workflow_execution(StartWorkflowRequest {
            domain_id: "d-orders".to_string(),
            workflow_id: "order-w1".to_string(),
            workflow_type: "order-processing".to_string(),
            task_list: "order-tl".to_string(),
            input: None,
            execution_timeout_seconds: 600,
            decision_timeout_seconds: 10,
        })
        .await
        .unwrap();
    let key = WorkflowKey::new("d-orders", "order-w1", run_id);

    let started_id = ctx
        .engine
        .record_decision_task_started(&key, 2, "worker-1", "req-1")
        .await
        .unwrap();
    ctx.engine
        .respond_decision_task_completed(
            &key,
            2,
            started_id,
            "worker-1",
            vec![Decision::ScheduleActivity(ActivityParams {
                activity_id: "activity-1".to_string(),
                activity_type: "charge-card".to_string(),
                task_list: String::new(),
                input: None,
                schedule_to_start_seconds: 60,
                schedule_to_close_seconds: 120,
                start_to_close_seconds: 60,
                heartbeat_seconds: 0,
            })],
        )
        .await
        .unwrap();
    key
}

// S1: active activity dispatch. One transfer task of type Activity with
// schedule_id 5; processing produces exactly one matching dispatch and the
// ack level advances past the task.
#[tokio::test]
async fn test_active_activity_dispatch() {
    let ctx = TestContext::new(vec![active_domain()]).await;
    let key = start_and_schedule_activity(&ctx).await;

    let tasks = ctx.transfer_tasks().await;
    let activity_task = tasks
        .iter()
        .find(|t| matches!(t.kind, TransferTaskKind::Activity { .. }))
        .expect("activity transfer task persisted");
    assert_eq!(activity_task.kind.schedule_id(), Some(5));
    let max_task_id = tasks.iter().map(|t| t.task_id).max().unwrap();

    let processor = ctx.active_transfer_processor();
    processor.poll_once().await.unwrap();

    let dispatches = ctx.matching.activity_calls.lock().await;
    assert_eq!(dispatches.len(), 1);
    assert_eq!(
        *dispatches.first().unwrap(),
        (
            "d-orders".to_string(),
            key.run_id.clone(),
            5,
            "order-tl".to_string()
        )
    );
    drop(dispatches);

    // cursor passed every task, including the one that dispatched
    let ack = ctx
        .shard
        .cluster_transfer_ack_level(TEST_CURRENT_CLUSTER)
        .await;
    assert_eq!(ack, max_task_id);
    assert!(ctx.transfer_tasks().await.is_empty());

    // the decision task was already completed, so no decision dispatch
    assert!(ctx.matching.decision_calls.lock().await.is_empty());
    // the started execution reached visibility
    assert_eq!(ctx.visibility.started.lock().await.len(), 1);
}

// S2: standby activity pending. The first attempt defers; once the
// observed standby-cluster clock passes the delay, the task is pushed to
// matching for pre-failover stickiness.
#[tokio::test]
async fn test_standby_activity_pending_then_push_to_matching() {
    let ctx = TestContext::new(vec![standby_domain()]).await;
    let run_id = "billing-run-1";

    ctx.engine
        .ndc()
        .apply_events(ReplicationBatch {
            source_cluster: TEST_ALTERNATIVE_CLUSTER.to_string(),
            domain_id: "d-billing".to_string(),
            workflow_id: "billing-w1".to_string(),
            run_id: run_id.to_string(),
            first_event_id: 1,
            next_event_id: 6,
            events: replicated_activity_events(2, "billing-tl"),
            version_history: vec![VersionHistoryItem::new(5, 2)],
        })
        .await
        .unwrap();

    let tasks = ctx.transfer_tasks().await;
    let activity_task = tasks
        .iter()
        .find(|t| matches!(t.kind, TransferTaskKind::Activity { .. }))
        .expect("replicated activity transfer task");

    let (_, executor) = ctx.standby_transfer_processor(TEST_ALTERNATIVE_CLUSTER);

    // replication has not proven the remote clock past the delay yet
    let err = executor.process(activity_task).await.unwrap_err();
    assert_eq!(err.error_code(), "TASK_RETRY");
    assert!(ctx.matching.activity_calls.lock().await.is_empty());

    let delay = ctx.shard.config().standby_cluster_delay;
    ctx.shard
        .set_current_time(TEST_ALTERNATIVE_CLUSTER, Utc::now() + delay * 5)
        .await;

    executor.process(activity_task).await.unwrap();
    let dispatches = ctx.matching.activity_calls.lock().await;
    assert_eq!(dispatches.len(), 1);
    assert_eq!(
        *dispatches.first().unwrap(),
        (
            "d-billing".to_string(),
            run_id.to_string(),
            5,
            "billing-tl".to_string()
        )
    );
}

// S3: standby signal task whose initiated event has not replicated. First
// attempt defers; past the delay, the re-replicator pulls from the missing
// event to the end of history and the task is discarded.
#[tokio::test]
async fn test_standby_signal_rereplicates_then_discards() {
    let ctx = TestContext::new(vec![standby_domain()]).await;
    let run_id = "billing-run-2";

    ctx.engine
        .ndc()
        .apply_events(ReplicationBatch {
            source_cluster: TEST_ALTERNATIVE_CLUSTER.to_string(),
            domain_id: "d-billing".to_string(),
            workflow_id: "billing-w2".to_string(),
            run_id: run_id.to_string(),
            first_event_id: 1,
            next_event_id: 6,
            events: replicated_activity_events(2, "billing-tl"),
            version_history: vec![VersionHistoryItem::new(5, 2)],
        })
        .await
        .unwrap();

    // the signal-initiated event (7) is beyond the locally replicated
    // history (events 1-5)
    let signal_task = TransferTask {
        task_id: 9999,
        domain_id: "d-billing".to_string(),
        workflow_id: "billing-w2".to_string(),
        run_id: run_id.to_string(),
        visibility_timestamp: Utc::now(),
        version: 2,
        kind: TransferTaskKind::SignalExecution {
            target_domain_id: "d-other".to_string(),
            target_workflow_id: "other-w".to_string(),
            target_run_id: String::new(),
            initiated_id: 7,
        },
    };

    let (_, executor) = ctx.standby_transfer_processor(TEST_ALTERNATIVE_CLUSTER);

    let err = executor.process(&signal_task).await.unwrap_err();
    assert_eq!(err.error_code(), "TASK_RETRY");
    assert!(ctx.rereplicator.calls.lock().await.is_empty());

    let delay = ctx.shard.config().standby_cluster_delay;
    ctx.shard
        .set_current_time(TEST_ALTERNATIVE_CLUSTER, Utc::now() + delay * 5)
        .await;

    let err = executor.process(&signal_task).await.unwrap_err();
    assert_eq!(err.error_code(), "TASK_DISCARDED");

    let calls = ctx.rereplicator.calls.lock().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(
        *calls.first().unwrap(),
        (
            "d-billing".to_string(),
            "billing-w2".to_string(),
            run_id.to_string(),
            7,
            END_EVENT_ID
        )
    );
}

// A full standby poll past the delay handles every replicated task and
// advances the cluster ack level.
#[tokio::test]
async fn test_standby_poll_advances_ack() {
    let ctx = TestContext::new(vec![standby_domain()]).await;

    ctx.engine
        .ndc()
        .apply_events(ReplicationBatch {
            source_cluster: TEST_ALTERNATIVE_CLUSTER.to_string(),
            domain_id: "d-billing".to_string(),
            workflow_id: "billing-w3".to_string(),
            run_id: "billing-run-3".to_string(),
            first_event_id: 1,
            next_event_id: 6,
            events: replicated_activity_events(2, "billing-tl"),
            version_history: vec![VersionHistoryItem::new(5, 2)],
        })
        .await
        .unwrap();

    let delay = ctx.shard.config().standby_cluster_delay;
    ctx.shard
        .set_current_time(TEST_ALTERNATIVE_CLUSTER, Utc::now() + delay * 5)
        .await;

    let (processor, _) = ctx.standby_transfer_processor(TEST_ALTERNATIVE_CLUSTER);
    processor.poll_once().await.unwrap();

    let ack = ctx
        .shard
        .cluster_transfer_ack_level(TEST_ALTERNATIVE_CLUSTER)
        .await;
    let remaining = ctx
        .transfer_tasks()
        .await
        .into_iter()
        .filter(|t| t.task_id <= ack)
        .count();
    assert_eq!(remaining, 0, "acked tasks must be completed");
    assert!(ack > 0);
}

// Closing a run records visibility and notifies the parent workflow.
#[tokio::test]
async fn test_close_execution_records_visibility() {
    let ctx = TestContext::new(vec![active_domain()]).await;
    let key = start_and_schedule_activity(&ctx).await;

    // drain the start-time tasks first
    let processor = ctx.active_transfer_processor();
    processor.poll_once().await.unwrap();

    ctx.engine
        .terminate_workflow_execution("d-orders", "order-w1", "test cleanup", "admin")
        .await
        .unwrap();
    processor.poll_once().await.unwrap();

    let closed = ctx.visibility.closed.lock().await;
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].1, key.run_id);
    assert_eq!(closed[0].2, windlass_persistence::CloseStatus::Terminated);
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timer queue tests: user timers, attempt-guarded activity timeouts,
//! decision timeouts, workflow timeout, retention deletion, standby
//! deferral.

mod common;

use chrono::Utc;
use common::{replicated_activity_events, TestContext};
use windlass_common::cluster::test_fixtures::{TEST_ALTERNATIVE_CLUSTER, TEST_CURRENT_CLUSTER};
use windlass_common::domain::test_fixtures::global_domain;
use windlass_history::engine::{Decision, StartWorkflowRequest};
use windlass_history::mutable_state::ActivityParams;
use windlass_history::timer_queue::{
    ActiveTimerExecutor, StandbyTimerExecutor, TimerTaskExecutor,
};
use windlass_persistence::{
    CloseStatus, ExecutionStore, ReplicationBatch, TimeoutType, TimerTask, TimerTaskKind,
    VersionHistoryItem, WorkflowKey, WorkflowState,
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

async fn start_workflow(ctx: &TestContext) -> WorkflowKey {
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
    WorkflowKey::new("d-orders", "order-w1", run_id)
}

async fn timer_tasks(ctx: &TestContext) -> Vec<TimerTask> {
    ctx.store
        .get_timer_tasks(
            common::TEST_SHARD_ID,
            chrono::DateTime::<Utc>::MIN_UTC,
            Utc::now() + chrono::Duration::days(365),
            1000,
        )
        .await
        .unwrap()
}

fn active_executor(ctx: &TestContext) -> std::sync::Arc<ActiveTimerExecutor> {
    ActiveTimerExecutor::new(ctx.engine.clone(), ctx.store.clone())
}

#[tokio::test]
async fn test_user_timer_fires_and_schedules_decision() {
    let ctx = TestContext::new(vec![active_domain()]).await;
    let key = start_workflow(&ctx).await;

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
            vec![Decision::StartTimer {
                timer_id: "wait-for-settlement".to_string(),
                fire_seconds: 60,
            }],
        )
        .await
        .unwrap();

    let user_timer = timer_tasks(&ctx)
        .await
        .into_iter()
        .find(|t| matches!(t.kind, TimerTaskKind::UserTimer { .. }))
        .expect("user timer task persisted");

    active_executor(&ctx).process(&user_timer).await.unwrap();

    let snapshot = ctx
        .store
        .get_workflow("d-orders", "order-w1", &key.run_id)
        .await
        .unwrap()
        .unwrap();
    assert!(snapshot.timers.is_empty());
    // firing wakes the workflow with a fresh decision
    assert!(snapshot.execution.decision_schedule_id > 0);

    // a second fire of the same timer is a clean no-op
    active_executor(&ctx).process(&user_timer).await.unwrap();
}

#[tokio::test]
async fn test_activity_timeout_ignores_stale_attempt() {
    let ctx = TestContext::new(vec![active_domain()]).await;
    let key = start_workflow(&ctx).await;

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

    // a timer armed for a later attempt must not fire against attempt 0
    let stale = TimerTask {
        visibility_timestamp: Utc::now(),
        task_id: 9999,
        domain_id: key.domain_id.clone(),
        workflow_id: key.workflow_id.clone(),
        run_id: key.run_id.clone(),
        version: 1,
        kind: TimerTaskKind::ActivityTimeout {
            schedule_id: 5,
            timeout_type: TimeoutType::ScheduleToStart,
            attempt: 3,
        },
    };
    active_executor(&ctx).process(&stale).await.unwrap();
    let snapshot = ctx
        .store
        .get_workflow("d-orders", "order-w1", &key.run_id)
        .await
        .unwrap()
        .unwrap();
    assert!(snapshot.activities.contains_key(&5), "activity survives stale timer");

    // the armed attempt fires, removes the activity, schedules a decision
    let armed = TimerTask {
        kind: TimerTaskKind::ActivityTimeout {
            schedule_id: 5,
            timeout_type: TimeoutType::ScheduleToStart,
            attempt: 0,
        },
        ..stale
    };
    active_executor(&ctx).process(&armed).await.unwrap();
    let snapshot = ctx
        .store
        .get_workflow("d-orders", "order-w1", &key.run_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!snapshot.activities.contains_key(&5));
    assert!(snapshot.execution.decision_schedule_id > 0);
}

#[tokio::test]
async fn test_decision_timeout_reschedules_with_bumped_attempt() {
    let ctx = TestContext::new(vec![active_domain()]).await;
    let key = start_workflow(&ctx).await;
    ctx.engine
        .record_decision_task_started(&key, 2, "worker-1", "req-1")
        .await
        .unwrap();

    let decision_timeout = timer_tasks(&ctx)
        .await
        .into_iter()
        .find(|t| matches!(t.kind, TimerTaskKind::DecisionTimeout { .. }))
        .expect("decision timeout armed on start");

    active_executor(&ctx).process(&decision_timeout).await.unwrap();

    let snapshot = ctx
        .store
        .get_workflow("d-orders", "order-w1", &key.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.execution.decision_attempt, 1);
    assert!(snapshot.execution.decision_schedule_id > 2);
    assert_eq!(snapshot.execution.decision_started_id, 0);
}

#[tokio::test]
async fn test_workflow_timeout_closes_run() {
    let ctx = TestContext::new(vec![active_domain()]).await;
    let key = start_workflow(&ctx).await;

    let workflow_timeout = timer_tasks(&ctx)
        .await
        .into_iter()
        .find(|t| matches!(t.kind, TimerTaskKind::WorkflowTimeout))
        .expect("workflow timeout armed on start");

    active_executor(&ctx).process(&workflow_timeout).await.unwrap();

    let current = ctx
        .store
        .get_current_execution("d-orders", "order-w1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.state, WorkflowState::Completed);
    assert_eq!(current.close_status, CloseStatus::TimedOut);
    let _ = key;
}

#[tokio::test]
async fn test_retention_deletes_closed_run() {
    let ctx = TestContext::new(vec![active_domain()]).await;
    let key = start_workflow(&ctx).await;

    ctx.engine
        .terminate_workflow_execution("d-orders", "order-w1", "cleanup", "admin")
        .await
        .unwrap();

    let delete_task = timer_tasks(&ctx)
        .await
        .into_iter()
        .find(|t| matches!(t.kind, TimerTaskKind::DeleteHistoryEvent))
        .expect("retention timer armed on close");

    active_executor(&ctx).process(&delete_task).await.unwrap();

    let gone = ctx
        .store
        .get_workflow("d-orders", "order-w1", &key.run_id)
        .await
        .unwrap();
    assert!(gone.is_none());
    let pointer = ctx
        .store
        .get_current_execution("d-orders", "order-w1")
        .await
        .unwrap();
    assert!(pointer.is_none());
}

// Standby: an armed timer whose resolution has not replicated defers, then
// pulls history and discards once the delay elapses.
#[tokio::test]
async fn test_standby_timer_defers_then_rereplicates() {
    let ctx = TestContext::new(vec![standby_domain()]).await;

    ctx.engine
        .ndc()
        .apply_events(ReplicationBatch {
            source_cluster: TEST_ALTERNATIVE_CLUSTER.to_string(),
            domain_id: "d-billing".to_string(),
            workflow_id: "billing-w1".to_string(),
            run_id: "billing-run-1".to_string(),
            first_event_id: 1,
            next_event_id: 6,
            events: replicated_activity_events(2, "billing-tl"),
            version_history: vec![VersionHistoryItem::new(5, 2)],
        })
        .await
        .unwrap();

    let activity_timeout = timer_tasks(&ctx)
        .await
        .into_iter()
        .find(|t| {
            matches!(
                t.kind,
                TimerTaskKind::ActivityTimeout {
                    schedule_id: 5,
                    ..
                }
            )
        })
        .expect("replicated activity timeout timer");

    let executor = StandbyTimerExecutor::new(
        TEST_ALTERNATIVE_CLUSTER,
        ctx.shard.clone(),
        ctx.history_cache(),
        ctx.rereplicator.clone(),
    );

    let err = executor.process(&activity_timeout).await.unwrap_err();
    assert_eq!(err.error_code(), "TASK_RETRY");

    let delay = ctx.shard.config().standby_cluster_delay;
    ctx.shard
        .set_current_time(TEST_ALTERNATIVE_CLUSTER, Utc::now() + delay * 5)
        .await;

    let err = executor.process(&activity_timeout).await.unwrap_err();
    assert_eq!(err.error_code(), "TASK_DISCARDED");
    assert_eq!(ctx.rereplicator.calls.lock().await.len(), 1);
}

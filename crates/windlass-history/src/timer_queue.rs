// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timer queue processor: fires timeouts in `(visibility_timestamp,
//! task_id)` order.
//!
//! The read level advances to `now - safety_margin` per cluster, where
//! `now` is the local clock for the active variant and the shard's
//! observed remote clock for standby variants. On fire, the owning run's
//! state is loaded and the timer is verified still armed at the expected
//! attempt; activity restarts bump the attempt counter, so a stale timer
//! from an earlier attempt becomes a no-op.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, error, info, warn};

use windlass_common::error::{EngineError, Result};
use windlass_common::retry::{with_retries, RetryPolicy};
use windlass_common::END_EVENT_ID;
use windlass_persistence::{ExecutionStore, HistoryStore, TimerTask, TimerTaskKind, WorkflowKey};

use crate::cache::HistoryCache;
use crate::clients::HistoryRereplicator;
use crate::engine::HistoryEngine;
use crate::mutable_state::MutableState;
use crate::shard::ShardContext;

/// One timer-processing strategy (active or standby).
#[async_trait::async_trait]
pub trait TimerTaskExecutor: Send + Sync {
    /// Apply the timeout semantics, or classify the task for deferral.
    async fn process(&self, task: &TimerTask) -> Result<()>;

    /// Executor name for logs.
    fn name(&self) -> &'static str;
}

/// Cursor + ack bookkeeping over one shard's timer tasks for one cluster.
pub struct TimerQueueProcessor {
    shard: Arc<ShardContext>,
    execution_store: Arc<dyn ExecutionStore>,
    executor: Arc<dyn TimerTaskExecutor>,
    cluster: String,
}

impl TimerQueueProcessor {
    /// Create a processor advancing `cluster`'s timer ack level.
    pub fn new(
        shard: Arc<ShardContext>,
        execution_store: Arc<dyn ExecutionStore>,
        executor: Arc<dyn TimerTaskExecutor>,
        cluster: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shard,
            execution_store,
            executor,
            cluster: cluster.into(),
        })
    }

    /// Process one due timer. `Ok(())` lets the cursor advance.
    pub async fn process_one(&self, task: &TimerTask) -> Result<()> {
        let deadline = self.shard.config().task_process_timeout;
        let result = tokio::time::timeout(deadline, self.executor.process(task))
            .await
            .unwrap_or(Err(EngineError::TaskRetry));

        match result {
            Ok(()) => {
                self.execution_store
                    .complete_timer_task(
                        self.shard.shard_id(),
                        task.visibility_timestamp,
                        task.task_id,
                    )
                    .await?;
                Ok(())
            }
            Err(EngineError::TaskDiscarded) => {
                warn!(
                    task_id = task.task_id,
                    run_id = %task.run_id,
                    executor = self.executor.name(),
                    "Timer task discarded"
                );
                self.execution_store
                    .complete_timer_task(
                        self.shard.shard_id(),
                        task.visibility_timestamp,
                        task.task_id,
                    )
                    .await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// One poll: read timers due up to the cluster's read level, fire in
    /// order, stop at the first deferral, then advance the ack level.
    pub async fn poll_once(&self) -> Result<usize> {
        let ack = self.shard.cluster_timer_ack_level(&self.cluster).await;
        let safety = Duration::from_std(self.shard.config().timer_safety_margin)
            .unwrap_or_else(|_| Duration::milliseconds(100));
        let read_level = self.shard.current_time_for(&self.cluster).await - safety;
        if read_level <= ack {
            return Ok(0);
        }

        let tasks = with_retries(&RetryPolicy::default(), "get_timer_tasks", || {
            self.execution_store.get_timer_tasks(
                self.shard.shard_id(),
                ack,
                read_level,
                self.shard.config().timer_batch_size,
            )
        })
        .await?;

        let mut new_ack = ack;
        let mut processed = 0;
        for task in &tasks {
            match self.process_one(task).await {
                Ok(()) => {
                    new_ack = task.visibility_timestamp;
                    processed += 1;
                }
                Err(EngineError::TaskRetry) => {
                    debug!(
                        task_id = task.task_id,
                        run_id = %task.run_id,
                        "Timer task deferred"
                    );
                    break;
                }
                Err(err) if matches!(err, EngineError::ShardOwnershipLost { .. }) => {
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        task_id = task.task_id,
                        run_id = %task.run_id,
                        error = %err,
                        "Timer task failed, will retry"
                    );
                    break;
                }
            }
        }

        if new_ack > ack {
            self.shard
                .update_cluster_timer_ack_level(&self.cluster, new_ack)
                .await?;
        }
        Ok(processed)
    }

    /// Background loop: poll on an interval until the shard shuts down.
    pub async fn run(self: Arc<Self>) {
        let shutdown = self.shard.shutdown_token();
        let interval = self.shard.config().queue_poll_interval;
        info!(
            shard_id = self.shard.shard_id(),
            cluster = %self.cluster,
            executor = self.executor.name(),
            "Timer queue processor started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(
                        shard_id = self.shard.shard_id(),
                        cluster = %self.cluster,
                        "Timer queue processor shutting down"
                    );
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    match self.poll_once().await {
                        Ok(0) => {}
                        Ok(count) => {
                            debug!(count, cluster = %self.cluster, "Fired timer tasks");
                        }
                        Err(err) if matches!(err, EngineError::ShardOwnershipLost { .. }) => {
                            error!(error = %err, "Timer queue lost shard ownership");
                            break;
                        }
                        Err(err) => {
                            error!(error = %err, "Timer queue poll failed");
                        }
                    }
                }
            }
        }
    }
}

/// Active timer executor: applies timeout semantics immediately.
pub struct ActiveTimerExecutor {
    engine: Arc<HistoryEngine>,
    history_store: Arc<dyn HistoryStore>,
}

impl ActiveTimerExecutor {
    /// Create an active timer executor.
    pub fn new(engine: Arc<HistoryEngine>, history_store: Arc<dyn HistoryStore>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            history_store,
        })
    }

    fn task_key(task: &TimerTask) -> WorkflowKey {
        WorkflowKey::new(&task.domain_id, &task.workflow_id, &task.run_id)
    }

    /// Retention elapsed: remove the run and its history branch.
    async fn delete_history(&self, task: &TimerTask) -> Result<()> {
        let key = Self::task_key(task);
        let branch = {
            let mut guard = self.engine.history_cache().acquire(key.clone()).await?;
            match guard.load_if_exists().await? {
                None => return Ok(()),
                Some(state) if state.is_open() => {
                    // reset or conflict rewind reopened the run
                    return Ok(());
                }
                Some(state) => {
                    let branch = state.execution.branch_token.clone();
                    guard.clear();
                    branch
                }
            }
        };
        info!(run_id = %key.run_id, "Retention elapsed, deleting run");
        self.engine
            .execution_store()
            .delete_workflow(&key.domain_id, &key.workflow_id, &key.run_id)
            .await?;
        self.history_store.delete_history_branch(&branch).await
    }
}

#[async_trait::async_trait]
impl TimerTaskExecutor for ActiveTimerExecutor {
    async fn process(&self, task: &TimerTask) -> Result<()> {
        let key = Self::task_key(task);
        match &task.kind {
            TimerTaskKind::UserTimer { timer_id } => {
                self.engine.fire_user_timer(&key, timer_id).await
            }
            TimerTaskKind::ActivityTimeout {
                schedule_id,
                timeout_type,
                attempt,
            } => {
                self.engine
                    .timeout_activity(&key, *schedule_id, *timeout_type, *attempt)
                    .await
            }
            TimerTaskKind::DecisionTimeout {
                schedule_id,
                attempt,
            } => {
                self.engine
                    .timeout_decision(&key, *schedule_id, *attempt)
                    .await
            }
            TimerTaskKind::WorkflowTimeout => self.engine.timeout_workflow(&key).await,
            TimerTaskKind::DeleteHistoryEvent => self.delete_history(task).await,
        }
    }

    fn name(&self) -> &'static str {
        "timer-active"
    }
}

/// Standby timer executor: mirrors the transfer standby two-phase rule,
/// keyed on event replication.
pub struct StandbyTimerExecutor {
    cluster: String,
    shard: Arc<ShardContext>,
    history_cache: Arc<HistoryCache>,
    rereplicator: Arc<dyn HistoryRereplicator>,
}

impl StandbyTimerExecutor {
    /// Create a standby timer executor for `cluster`.
    pub fn new(
        cluster: impl Into<String>,
        shard: Arc<ShardContext>,
        history_cache: Arc<HistoryCache>,
        rereplicator: Arc<dyn HistoryRereplicator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster: cluster.into(),
            shard,
            history_cache,
            rereplicator,
        })
    }

    /// Whether the timer's referenced state still awaits the active
    /// cluster's resolution.
    fn still_armed(state: &MutableState, task: &TimerTask) -> bool {
        match &task.kind {
            TimerTaskKind::UserTimer { timer_id } => state.timers.contains_key(timer_id),
            TimerTaskKind::ActivityTimeout {
                schedule_id,
                attempt,
                ..
            } => state
                .activities
                .get(schedule_id)
                .map(|info| info.attempt == *attempt)
                .unwrap_or(false),
            TimerTaskKind::DecisionTimeout {
                schedule_id,
                attempt,
            } => {
                state.execution.decision_schedule_id == *schedule_id
                    && state.execution.decision_attempt == *attempt
            }
            TimerTaskKind::WorkflowTimeout => state.is_open(),
            TimerTaskKind::DeleteHistoryEvent => false,
        }
    }
}

#[async_trait::async_trait]
impl TimerTaskExecutor for StandbyTimerExecutor {
    async fn process(&self, task: &TimerTask) -> Result<()> {
        // retention cleanup runs on every cluster; handled by the active
        // executor's machinery, standby just acks it locally once the run
        // is gone
        let key = WorkflowKey::new(&task.domain_id, &task.workflow_id, &task.run_id);
        let (armed, next_event_id) = {
            let mut guard = self.history_cache.acquire(key).await?;
            match guard.load_if_exists().await? {
                None => return Ok(()),
                Some(state) => (Self::still_armed(state, task), state.next_event_id()),
            }
        };
        if !armed {
            return Ok(());
        }

        // the active cluster must have resolved this timeout; its outcome
        // has not replicated yet
        let delay = Duration::from_std(self.shard.config().standby_cluster_delay)
            .unwrap_or_else(|_| Duration::seconds(300));
        let observed_now = self.shard.current_time_for(&self.cluster).await;
        if observed_now < task.visibility_timestamp + delay {
            return Err(EngineError::TaskRetry);
        }
        info!(
            task_id = task.task_id,
            run_id = %task.run_id,
            "Standby timer overdue, pulling history from active cluster"
        );
        self.rereplicator
            .send_multi_workflow_history(
                &task.domain_id,
                &task.workflow_id,
                &task.run_id,
                next_event_id,
                &task.run_id,
                END_EVENT_ID,
            )
            .await?;
        Err(EngineError::TaskDiscarded)
    }

    fn name(&self) -> &'static str {
        "timer-standby"
    }
}

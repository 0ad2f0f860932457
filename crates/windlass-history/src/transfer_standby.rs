// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Standby transfer-task executor: two-phase verification against
//! replicated state.
//!
//! A standby cluster never executes a side effect the active cluster owns.
//! For each task it verifies the referenced state against the locally
//! replicated history:
//!
//! 1. Still pending and within the standby delay: `TaskRetry`, the cursor
//!    waits for replication to catch up.
//! 2. Still pending past the delay (measured against the shard's observed
//!    clock for the task's cluster): pull the missing events through the
//!    re-replicator and `TaskDiscarded`; the active cluster re-emits the
//!    equivalent task once caught up.
//! 3. Activity/decision dispatch tasks are the exception: once the delay
//!    elapses they are pushed to local matching, warming stickiness ahead
//!    of a failover.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info};

use windlass_common::error::{EngineError, Result};
use windlass_common::{EMPTY_EVENT_ID, END_EVENT_ID};
use windlass_persistence::{TransferTask, TransferTaskKind, WorkflowKey};

use crate::cache::HistoryCache;
use crate::clients::{HistoryRereplicator, MatchingClient, VisibilityClient};
use crate::mutable_state::MutableState;
use crate::shard::ShardContext;
use crate::transfer_queue::TransferTaskExecutor;

/// What standby verification concluded about a task.
enum Verdict {
    /// The active cluster's handling is already replicated; nothing to do.
    Done,
    /// Referenced state is still pending locally; defer, then re-replicate
    /// from `begin_event_id` and discard once the delay elapses.
    Pending {
        /// First event to pull when re-replicating.
        begin_event_id: i64,
    },
    /// Dispatchable to local matching once the delay elapses.
    PushToMatching {
        /// Task list to dispatch to.
        task_list: String,
        /// Scheduled event ID.
        schedule_id: i64,
        /// Schedule-to-start budget to forward, seconds.
        schedule_to_start_seconds: i32,
        /// True for decisions, false for activities.
        is_decision: bool,
    },
    /// Record the (already replicated) execution in local visibility.
    RecordVisibility(VisibilityRecord),
}

enum VisibilityRecord {
    Started {
        workflow_type: String,
        start_time: chrono::DateTime<chrono::Utc>,
    },
    Closed {
        workflow_type: String,
        close_status: windlass_persistence::CloseStatus,
        close_time: chrono::DateTime<chrono::Utc>,
    },
    Upsert(std::collections::HashMap<String, serde_json::Value>),
}

/// Standby-side transfer executor for one remote cluster.
pub struct StandbyTransferExecutor {
    /// The cluster this shard is standby for.
    cluster: String,
    shard: Arc<ShardContext>,
    history_cache: Arc<HistoryCache>,
    matching: Arc<dyn MatchingClient>,
    visibility: Arc<dyn VisibilityClient>,
    rereplicator: Arc<dyn HistoryRereplicator>,
}

impl StandbyTransferExecutor {
    /// Create a standby executor for `cluster`.
    pub fn new(
        cluster: impl Into<String>,
        shard: Arc<ShardContext>,
        history_cache: Arc<HistoryCache>,
        matching: Arc<dyn MatchingClient>,
        visibility: Arc<dyn VisibilityClient>,
        rereplicator: Arc<dyn HistoryRereplicator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster: cluster.into(),
            shard,
            history_cache,
            matching,
            visibility,
            rereplicator,
        })
    }

    /// Whether the standby delay has elapsed for `task`, judged against the
    /// observed clock of the task's source cluster.
    async fn delay_elapsed(&self, task: &TransferTask) -> bool {
        let delay = Duration::from_std(self.shard.config().standby_cluster_delay)
            .unwrap_or_else(|_| Duration::seconds(300));
        let observed_now = self.shard.current_time_for(&self.cluster).await;
        observed_now >= task.visibility_timestamp + delay
    }

    /// Defer, or pull the missing events and discard.
    async fn handle_pending(&self, task: &TransferTask, begin_event_id: i64) -> Result<()> {
        if !self.delay_elapsed(task).await {
            return Err(EngineError::TaskRetry);
        }
        info!(
            task_id = task.task_id,
            run_id = %task.run_id,
            begin_event_id,
            "Standby task overdue, pulling history from active cluster"
        );
        self.rereplicator
            .send_multi_workflow_history(
                &task.domain_id,
                &task.workflow_id,
                &task.run_id,
                begin_event_id,
                &task.run_id,
                END_EVENT_ID,
            )
            .await?;
        Err(EngineError::TaskDiscarded)
    }

    fn verify(state: &MutableState, task: &TransferTask) -> Verdict {
        match &task.kind {
            TransferTaskKind::Activity {
                task_list,
                schedule_id,
            } => match state.activities.get(schedule_id) {
                Some(info) if info.started_id == EMPTY_EVENT_ID => Verdict::PushToMatching {
                    task_list: task_list.clone(),
                    schedule_id: *schedule_id,
                    schedule_to_start_seconds: info.schedule_to_start_seconds,
                    is_decision: false,
                },
                Some(_) => Verdict::Done,
                None if *schedule_id >= state.next_event_id() => Verdict::Pending {
                    begin_event_id: *schedule_id,
                },
                None => Verdict::Done,
            },
            TransferTaskKind::Decision {
                task_list,
                schedule_id,
            } => {
                if state.execution.decision_schedule_id == *schedule_id
                    && !state.has_in_flight_decision()
                {
                    Verdict::PushToMatching {
                        task_list: task_list.clone(),
                        schedule_id: *schedule_id,
                        schedule_to_start_seconds: state.execution.decision_timeout_seconds,
                        is_decision: true,
                    }
                } else if *schedule_id >= state.next_event_id() {
                    Verdict::Pending {
                        begin_event_id: *schedule_id,
                    }
                } else {
                    Verdict::Done
                }
            }
            TransferTaskKind::CloseExecution => {
                if state.is_open() {
                    Verdict::Pending {
                        begin_event_id: state.next_event_id(),
                    }
                } else {
                    Verdict::RecordVisibility(VisibilityRecord::Closed {
                        workflow_type: state.execution.workflow_type.clone(),
                        close_status: state.execution.close_status,
                        close_time: state.execution.close_time.unwrap_or_else(chrono::Utc::now),
                    })
                }
            }
            TransferTaskKind::CancelExecution { initiated_id, .. } => {
                if state.request_cancels.contains_key(initiated_id) {
                    Verdict::Pending {
                        begin_event_id: state.next_event_id(),
                    }
                } else if *initiated_id >= state.next_event_id() {
                    Verdict::Pending {
                        begin_event_id: *initiated_id,
                    }
                } else {
                    Verdict::Done
                }
            }
            TransferTaskKind::SignalExecution { initiated_id, .. } => {
                if state.signals.contains_key(initiated_id) {
                    Verdict::Pending {
                        begin_event_id: state.next_event_id(),
                    }
                } else if *initiated_id >= state.next_event_id() {
                    Verdict::Pending {
                        begin_event_id: *initiated_id,
                    }
                } else {
                    Verdict::Done
                }
            }
            TransferTaskKind::StartChildExecution { initiated_id, .. } => {
                match state.children.get(initiated_id) {
                    Some(info) if info.started_id == EMPTY_EVENT_ID => Verdict::Pending {
                        begin_event_id: state.next_event_id(),
                    },
                    Some(_) => Verdict::Done,
                    None if *initiated_id >= state.next_event_id() => Verdict::Pending {
                        begin_event_id: *initiated_id,
                    },
                    None => Verdict::Done,
                }
            }
            TransferTaskKind::RecordWorkflowStarted => {
                Verdict::RecordVisibility(VisibilityRecord::Started {
                    workflow_type: state.execution.workflow_type.clone(),
                    start_time: state.execution.start_time,
                })
            }
            TransferTaskKind::UpsertSearchAttributes => Verdict::RecordVisibility(
                VisibilityRecord::Upsert(state.execution.search_attributes.clone()),
            ),
            TransferTaskKind::ResetWorkflow => Verdict::Done,
        }
    }
}

#[async_trait::async_trait]
impl TransferTaskExecutor for StandbyTransferExecutor {
    async fn process(&self, task: &TransferTask) -> Result<()> {
        let key = WorkflowKey::new(&task.domain_id, &task.workflow_id, &task.run_id);
        let verdict = {
            let mut guard = self.history_cache.acquire(key).await?;
            match guard.load_if_exists().await? {
                // the run itself has not replicated yet
                None => Verdict::Pending {
                    begin_event_id: windlass_common::FIRST_EVENT_ID,
                },
                Some(state) => Self::verify(state, task),
            }
        };

        match verdict {
            Verdict::Done => Ok(()),
            Verdict::Pending { begin_event_id } => self.handle_pending(task, begin_event_id).await,
            Verdict::PushToMatching {
                task_list,
                schedule_id,
                schedule_to_start_seconds,
                is_decision,
            } => {
                if !self.delay_elapsed(task).await {
                    return Err(EngineError::TaskRetry);
                }
                debug!(
                    task_id = task.task_id,
                    run_id = %task.run_id,
                    schedule_id,
                    "Standby dispatching to matching for pre-failover stickiness"
                );
                if is_decision {
                    self.matching
                        .add_decision_task(
                            &task.domain_id,
                            &task.workflow_id,
                            &task.run_id,
                            schedule_id,
                            &task_list,
                            schedule_to_start_seconds,
                        )
                        .await
                } else {
                    self.matching
                        .add_activity_task(
                            &task.domain_id,
                            &task.workflow_id,
                            &task.run_id,
                            schedule_id,
                            &task_list,
                            schedule_to_start_seconds,
                        )
                        .await
                }
            }
            Verdict::RecordVisibility(record) => match record {
                VisibilityRecord::Started {
                    workflow_type,
                    start_time,
                } => {
                    self.visibility
                        .record_workflow_started(
                            &task.domain_id,
                            &task.workflow_id,
                            &task.run_id,
                            &workflow_type,
                            start_time,
                        )
                        .await
                }
                VisibilityRecord::Closed {
                    workflow_type,
                    close_status,
                    close_time,
                } => {
                    self.visibility
                        .record_workflow_closed(
                            &task.domain_id,
                            &task.workflow_id,
                            &task.run_id,
                            &workflow_type,
                            close_status,
                            close_time,
                        )
                        .await
                }
                VisibilityRecord::Upsert(attributes) => {
                    self.visibility
                        .upsert_search_attributes(
                            &task.domain_id,
                            &task.workflow_id,
                            &task.run_id,
                            &attributes,
                        )
                        .await
                }
            },
        }
    }

    fn name(&self) -> &'static str {
        "transfer-standby"
    }
}

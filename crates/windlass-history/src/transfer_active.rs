// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Active transfer-task executor: performs side effects immediately.
//!
//! Each task is checked for relevance before acting: the scheduled event
//! must still exist, must not have been processed, and must carry the
//! version the task was stamped with. Irrelevant tasks (superseded by a
//! conflict rewind, already handled, or targeting a deleted run) complete
//! without side effects.

use std::sync::Arc;

use tracing::debug;

use windlass_common::error::{EngineError, Result};
use windlass_common::EMPTY_EVENT_ID;
use windlass_persistence::{TransferTask, TransferTaskKind, WorkflowKey};

use crate::clients::{MatchingClient, RemoteWorkflowClient, VisibilityClient};
use crate::engine::HistoryEngine;
use crate::transfer_queue::TransferTaskExecutor;

/// Executes side effects for the cluster the domain is active in.
pub struct ActiveTransferExecutor {
    engine: Arc<HistoryEngine>,
    matching: Arc<dyn MatchingClient>,
    visibility: Arc<dyn VisibilityClient>,
    remote: Arc<dyn RemoteWorkflowClient>,
}

/// What the relevance check found for a task.
enum Relevance<T> {
    /// Still actionable; carries what the side effect needs.
    Actionable(T),
    /// Superseded or already handled; complete without acting.
    Stale,
}

impl ActiveTransferExecutor {
    /// Create an active executor.
    pub fn new(
        engine: Arc<HistoryEngine>,
        matching: Arc<dyn MatchingClient>,
        visibility: Arc<dyn VisibilityClient>,
        remote: Arc<dyn RemoteWorkflowClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            matching,
            visibility,
            remote,
        })
    }

    fn task_key(task: &TransferTask) -> WorkflowKey {
        WorkflowKey::new(&task.domain_id, &task.workflow_id, &task.run_id)
    }

    /// Load the run and evaluate `check` under its lock.
    async fn check_relevance<T, F>(&self, task: &TransferTask, check: F) -> Result<Relevance<T>>
    where
        F: FnOnce(&crate::mutable_state::MutableState) -> Relevance<T>,
    {
        let key = Self::task_key(task);
        let mut guard = self.engine.history_cache().acquire(key).await?;
        match guard.load_if_exists().await? {
            None => Ok(Relevance::Stale),
            Some(state) => Ok(check(state)),
        }
    }

    async fn process_activity(
        &self,
        task: &TransferTask,
        task_list: &str,
        schedule_id: i64,
    ) -> Result<()> {
        let relevance = self
            .check_relevance(task, |state| {
                match state.activities.get(&schedule_id) {
                    Some(info)
                        if info.started_id == EMPTY_EVENT_ID && info.version == task.version =>
                    {
                        Relevance::Actionable(info.schedule_to_start_seconds)
                    }
                    _ => Relevance::Stale,
                }
            })
            .await?;
        match relevance {
            Relevance::Stale => Ok(()),
            Relevance::Actionable(schedule_to_start) => {
                self.matching
                    .add_activity_task(
                        &task.domain_id,
                        &task.workflow_id,
                        &task.run_id,
                        schedule_id,
                        task_list,
                        schedule_to_start,
                    )
                    .await
            }
        }
    }

    async fn process_decision(
        &self,
        task: &TransferTask,
        task_list: &str,
        schedule_id: i64,
    ) -> Result<()> {
        let relevance = self
            .check_relevance(task, |state| {
                if state.execution.decision_schedule_id == schedule_id
                    && !state.has_in_flight_decision()
                {
                    Relevance::Actionable(state.execution.decision_timeout_seconds)
                } else {
                    Relevance::Stale
                }
            })
            .await?;
        match relevance {
            Relevance::Stale => Ok(()),
            Relevance::Actionable(timeout) => {
                self.matching
                    .add_decision_task(
                        &task.domain_id,
                        &task.workflow_id,
                        &task.run_id,
                        schedule_id,
                        task_list,
                        timeout,
                    )
                    .await
            }
        }
    }

    async fn process_close(&self, task: &TransferTask) -> Result<()> {
        struct CloseFacts {
            workflow_type: String,
            close_status: windlass_persistence::CloseStatus,
            close_time: chrono::DateTime<chrono::Utc>,
            parent: Option<(WorkflowKey, i64)>,
        }

        let relevance = self
            .check_relevance(task, |state| {
                if state.is_open() {
                    return Relevance::Stale;
                }
                Relevance::Actionable(CloseFacts {
                    workflow_type: state.execution.workflow_type.clone(),
                    close_status: state.execution.close_status,
                    close_time: state.execution.close_time.unwrap_or_else(chrono::Utc::now),
                    parent: state
                        .execution
                        .parent
                        .as_ref()
                        .map(|p| (p.parent.clone(), p.initiated_id)),
                })
            })
            .await?;

        match relevance {
            Relevance::Stale => Ok(()),
            Relevance::Actionable(facts) => {
                self.visibility
                    .record_workflow_closed(
                        &task.domain_id,
                        &task.workflow_id,
                        &task.run_id,
                        &facts.workflow_type,
                        facts.close_status,
                        facts.close_time,
                    )
                    .await?;
                if let Some((parent, initiated_id)) = facts.parent {
                    // best effort: the parent may itself be gone
                    let result = self
                        .remote
                        .record_child_completed(
                            &parent.domain_id,
                            &parent.workflow_id,
                            &parent.run_id,
                            initiated_id,
                            &task.run_id,
                        )
                        .await;
                    if let Err(EngineError::EntityNotExists { .. }) = result {
                        debug!(run_id = %task.run_id, "Parent gone, close notification dropped");
                    } else {
                        result?;
                    }
                }
                Ok(())
            }
        }
    }

    async fn process_cancel(
        &self,
        task: &TransferTask,
        target_domain_id: &str,
        target_workflow_id: &str,
        target_run_id: &str,
        initiated_id: i64,
    ) -> Result<()> {
        let relevance = self
            .check_relevance(task, |state| {
                match state.request_cancels.get(&initiated_id) {
                    Some(info) if info.version == task.version => Relevance::Actionable(()),
                    _ => Relevance::Stale,
                }
            })
            .await?;
        if matches!(relevance, Relevance::Stale) {
            return Ok(());
        }

        let delivered = match self
            .remote
            .request_cancel(target_domain_id, target_workflow_id, target_run_id)
            .await
        {
            Ok(()) => true,
            Err(EngineError::EntityNotExists { .. }) => false,
            Err(err) => return Err(err),
        };
        self.engine
            .record_external_cancel_result(&Self::task_key(task), initiated_id, delivered)
            .await
    }

    async fn process_signal(&self, task: &TransferTask, initiated_id: i64) -> Result<()> {
        let relevance = self
            .check_relevance(task, |state| match state.signals.get(&initiated_id) {
                Some(info) if info.version == task.version => Relevance::Actionable((
                    info.target_domain_id.clone(),
                    info.target_workflow_id.clone(),
                    info.target_run_id.clone(),
                    info.signal_name.clone(),
                    info.input.clone(),
                )),
                _ => Relevance::Stale,
            })
            .await?;
        let (domain_id, workflow_id, run_id, signal_name, input) = match relevance {
            Relevance::Stale => return Ok(()),
            Relevance::Actionable(target) => target,
        };

        let delivered = match self
            .remote
            .signal(&domain_id, &workflow_id, &run_id, &signal_name, input)
            .await
        {
            Ok(()) => true,
            Err(EngineError::EntityNotExists { .. }) => false,
            Err(err) => return Err(err),
        };
        self.engine
            .record_external_signal_result(&Self::task_key(task), initiated_id, delivered)
            .await
    }

    async fn process_start_child(&self, task: &TransferTask, initiated_id: i64) -> Result<()> {
        let relevance = self
            .check_relevance(task, |state| match state.children.get(&initiated_id) {
                Some(info)
                    if info.started_id == EMPTY_EVENT_ID && info.version == task.version =>
                {
                    Relevance::Actionable((
                        info.domain.clone(),
                        info.workflow_id.clone(),
                        info.workflow_type.clone(),
                        info.task_list.clone(),
                    ))
                }
                _ => Relevance::Stale,
            })
            .await?;
        let (domain, workflow_id, workflow_type, task_list) = match relevance {
            Relevance::Stale => return Ok(()),
            Relevance::Actionable(child) => child,
        };

        let parent = Self::task_key(task);
        match self
            .remote
            .start_workflow(&domain, &workflow_id, &workflow_type, &task_list, None)
            .await
        {
            Ok(child_run_id) => {
                self.engine
                    .record_child_started(&parent, initiated_id, Some(&child_run_id))
                    .await
            }
            Err(EngineError::WorkflowExecutionAlreadyStarted { .. }) => {
                self.engine
                    .record_child_started(&parent, initiated_id, None)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    async fn process_record_started(&self, task: &TransferTask) -> Result<()> {
        let relevance = self
            .check_relevance(task, |state| {
                Relevance::Actionable((
                    state.execution.workflow_type.clone(),
                    state.execution.start_time,
                ))
            })
            .await?;
        match relevance {
            Relevance::Stale => Ok(()),
            Relevance::Actionable((workflow_type, start_time)) => {
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
        }
    }

    async fn process_upsert(&self, task: &TransferTask) -> Result<()> {
        let relevance = self
            .check_relevance(task, |state| {
                Relevance::Actionable(state.execution.search_attributes.clone())
            })
            .await?;
        match relevance {
            Relevance::Stale => Ok(()),
            Relevance::Actionable(attributes) => {
                self.visibility
                    .upsert_search_attributes(
                        &task.domain_id,
                        &task.workflow_id,
                        &task.run_id,
                        &attributes,
                    )
                    .await
            }
        }
    }

    /// A reset run re-drives its outstanding work by scheduling a fresh
    /// decision.
    async fn process_reset(&self, task: &TransferTask) -> Result<()> {
        let relevance = self
            .check_relevance(task, |state| {
                if state.is_open() && !state.has_pending_decision() {
                    Relevance::Actionable(())
                } else {
                    Relevance::Stale
                }
            })
            .await?;
        match relevance {
            Relevance::Stale => Ok(()),
            Relevance::Actionable(()) => {
                self.engine
                    .schedule_decision_for_reset(&Self::task_key(task))
                    .await
            }
        }
    }
}

#[async_trait::async_trait]
impl TransferTaskExecutor for ActiveTransferExecutor {
    async fn process(&self, task: &TransferTask) -> Result<()> {
        match &task.kind {
            TransferTaskKind::Activity {
                task_list,
                schedule_id,
            } => self.process_activity(task, task_list, *schedule_id).await,
            TransferTaskKind::Decision {
                task_list,
                schedule_id,
            } => self.process_decision(task, task_list, *schedule_id).await,
            TransferTaskKind::CloseExecution => self.process_close(task).await,
            TransferTaskKind::CancelExecution {
                target_domain_id,
                target_workflow_id,
                target_run_id,
                initiated_id,
            } => {
                self.process_cancel(
                    task,
                    target_domain_id,
                    target_workflow_id,
                    target_run_id,
                    *initiated_id,
                )
                .await
            }
            TransferTaskKind::SignalExecution { initiated_id, .. } => {
                self.process_signal(task, *initiated_id).await
            }
            TransferTaskKind::StartChildExecution { initiated_id, .. } => {
                self.process_start_child(task, *initiated_id).await
            }
            TransferTaskKind::RecordWorkflowStarted => self.process_record_started(task).await,
            TransferTaskKind::UpsertSearchAttributes => self.process_upsert(task).await,
            TransferTaskKind::ResetWorkflow => self.process_reset(task).await,
        }
    }

    fn name(&self) -> &'static str {
        "transfer-active"
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-run mutable state: the authoritative in-memory snapshot of one
//! workflow run between persistence transactions.
//!
//! All history mutation funnels through here. Operations append events,
//! maintain the pending collections, and accumulate the transfer/timer/
//! replication tasks that must persist atomically with the state change.
//! A transaction is drained with [`MutableState::close_transaction`].
//!
//! Decision rules enforced here: at most one outstanding decision per run;
//! externally-driven events arriving while a decision is in flight are
//! buffered and flushed into history only when that decision completes,
//! with their event IDs allocated at flush time.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use windlass_common::error::{EngineError, Result};
use windlass_common::{EMPTY_EVENT_ID, EMPTY_VERSION, FIRST_EVENT_ID};
use windlass_persistence::{
    ActivityInfo, BranchToken, ChildExecutionInfo, CloseStatus, EventAttributes, HistoryEvent,
    ParentExecutionInfo, ReplicationState, ReplicationTask, RequestCancelInfo, SignalInfo,
    TimeoutType, TimerInfo, TimerTask, TimerTaskKind, TransferTask, TransferTaskKind,
    VersionHistories, VersionHistory, VersionHistoryItem, WorkflowExecutionInfo, WorkflowKey,
    WorkflowSnapshot, WorkflowState, WorkflowTransaction,
};

use crate::shard::ShardContext;

/// Whether a transaction runs on the active or a standby cluster.
///
/// Both policies persist the transfer/timer tasks derived from the events
/// (standby processors need them to take over after failover); only the
/// active policy emits replication tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPolicy {
    /// This cluster owns the domain; emit replication tasks.
    Active,
    /// Replication apply on a standby cluster; no replication tasks.
    Passive,
}

/// A drained transaction, ready to persist.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Branch the events append to.
    pub branch_token: BranchToken,
    /// Events appended during the transaction.
    pub events: Vec<HistoryEvent>,
    /// Snapshot plus tasks for the execution store.
    pub txn: WorkflowTransaction,
    /// `last_write_version` before this transaction; expected value for the
    /// current-run pointer CAS.
    pub previous_last_write_version: i64,
}

/// Parameters for scheduling an activity.
#[derive(Debug, Clone)]
pub struct ActivityParams {
    /// Caller-chosen activity ID.
    pub activity_id: String,
    /// Activity type name.
    pub activity_type: String,
    /// Task list; the run's default applies when empty.
    pub task_list: String,
    /// Activity input.
    pub input: Option<Value>,
    /// Schedule-to-start timeout, seconds.
    pub schedule_to_start_seconds: i32,
    /// Schedule-to-close timeout, seconds.
    pub schedule_to_close_seconds: i32,
    /// Start-to-close timeout, seconds.
    pub start_to_close_seconds: i32,
    /// Heartbeat timeout, seconds; 0 disables it.
    pub heartbeat_seconds: i32,
}

/// Parameters for starting a run.
#[derive(Debug, Clone)]
pub struct StartWorkflowParams {
    /// Workflow type name.
    pub workflow_type: String,
    /// Default task list.
    pub task_list: String,
    /// Start input.
    pub input: Option<Value>,
    /// Execution timeout, seconds.
    pub execution_timeout_seconds: i32,
    /// Decision start-to-close timeout, seconds.
    pub decision_timeout_seconds: i32,
    /// Parent linkage for child workflows.
    pub parent: Option<ParentExecutionInfo>,
    /// Run this one continues from, if continued-as-new.
    pub continued_from_run_id: Option<String>,
}

/// The authoritative in-memory state of one run.
pub struct MutableState {
    /// Execution metadata.
    pub execution: WorkflowExecutionInfo,
    /// Linear replication bookkeeping.
    pub replication_state: ReplicationState,
    /// Branch set for conflict resolution.
    pub version_histories: VersionHistories,
    /// Pending activities by scheduled event ID.
    pub activities: HashMap<i64, ActivityInfo>,
    /// Pending user timers by timer ID.
    pub timers: HashMap<String, TimerInfo>,
    /// Pending children by initiated event ID.
    pub children: HashMap<i64, ChildExecutionInfo>,
    /// Pending external cancels by initiated event ID.
    pub request_cancels: HashMap<i64, RequestCancelInfo>,
    /// Pending external signals by initiated event ID.
    pub signals: HashMap<i64, SignalInfo>,
    /// Persisted buffered events waiting for decision completion.
    buffered_events: Vec<HistoryEvent>,

    // -- transaction scratch, drained by close_transaction --
    pending_events: Vec<HistoryEvent>,
    transfer_tasks: Vec<TransferTask>,
    timer_tasks: Vec<TimerTask>,
    pub(crate) condition: i64,
    pub(crate) previous_last_write_version: i64,

    /// True while this lock hold has proven the run current (created it
    /// current, or completed an update-current write). Resets on load.
    pub current_guaranteed: bool,
}

impl MutableState {
    /// Fresh state for a new run. The started event is appended by
    /// [`add_workflow_execution_started`](Self::add_workflow_execution_started).
    pub fn new(key: WorkflowKey, branch_token: BranchToken, start_version: i64) -> Self {
        let execution = WorkflowExecutionInfo {
            key,
            workflow_type: String::new(),
            task_list: String::new(),
            parent: None,
            execution_timeout_seconds: 0,
            decision_timeout_seconds: 0,
            state: WorkflowState::Created,
            close_status: CloseStatus::None,
            next_event_id: FIRST_EVENT_ID,
            last_processed_event_id: EMPTY_EVENT_ID,
            start_time: Utc::now(),
            close_time: None,
            decision_schedule_id: EMPTY_EVENT_ID,
            decision_started_id: EMPTY_EVENT_ID,
            decision_attempt: 0,
            branch_token: branch_token.clone(),
            search_attributes: HashMap::new(),
        };
        Self {
            execution,
            replication_state: ReplicationState {
                current_version: start_version,
                start_version,
                last_write_version: start_version,
                last_write_event_id: EMPTY_EVENT_ID,
                last_event_task_id: 0,
            },
            version_histories: VersionHistories::new(VersionHistory::new(branch_token)),
            activities: HashMap::new(),
            timers: HashMap::new(),
            children: HashMap::new(),
            request_cancels: HashMap::new(),
            signals: HashMap::new(),
            buffered_events: Vec::new(),
            pending_events: Vec::new(),
            transfer_tasks: Vec::new(),
            timer_tasks: Vec::new(),
            condition: FIRST_EVENT_ID,
            previous_last_write_version: start_version,
            current_guaranteed: false,
        }
    }

    /// Rehydrate from a persisted snapshot.
    pub fn from_snapshot(snapshot: WorkflowSnapshot) -> Self {
        let condition = snapshot.execution.next_event_id;
        let previous_last_write_version = snapshot.replication_state.last_write_version;
        Self {
            execution: snapshot.execution,
            replication_state: snapshot.replication_state,
            version_histories: snapshot.version_histories,
            activities: snapshot.activities,
            timers: snapshot.timers,
            children: snapshot.children,
            request_cancels: snapshot.request_cancels,
            signals: snapshot.signals,
            buffered_events: snapshot.buffered_events,
            pending_events: Vec::new(),
            transfer_tasks: Vec::new(),
            timer_tasks: Vec::new(),
            condition,
            previous_last_write_version,
            current_guaranteed: false,
        }
    }

    /// Rebuild state by replaying a full event sequence (reset and
    /// replication conflict rewinds).
    pub fn rebuild(
        key: WorkflowKey,
        branch_token: BranchToken,
        events: &[HistoryEvent],
    ) -> Result<Self> {
        let start_version = events.first().map(|e| e.version).unwrap_or(EMPTY_VERSION);
        let mut state = Self::new(key, branch_token, start_version);
        for event in events {
            state.replay_event(event)?;
        }
        state.condition = state.execution.next_event_id;
        state.previous_last_write_version = state.replication_state.last_write_version;
        // rebuild replays history; tasks were already materialized by the
        // transactions that wrote these events
        state.pending_events.clear();
        state.transfer_tasks.clear();
        state.timer_tasks.clear();
        Ok(state)
    }

    /// Current snapshot of the state.
    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            execution: self.execution.clone(),
            replication_state: self.replication_state.clone(),
            version_histories: self.version_histories.clone(),
            activities: self.activities.clone(),
            timers: self.timers.clone(),
            children: self.children.clone(),
            request_cancels: self.request_cancels.clone(),
            signals: self.signals.clone(),
            buffered_events: self.buffered_events.clone(),
        }
    }

    /// Run identity.
    pub fn key(&self) -> &WorkflowKey {
        &self.execution.key
    }

    /// Whether the run is still open.
    pub fn is_open(&self) -> bool {
        self.execution.state != WorkflowState::Completed
    }

    /// Whether a decision is scheduled (started or not).
    pub fn has_pending_decision(&self) -> bool {
        self.execution.decision_schedule_id != EMPTY_EVENT_ID
    }

    /// Whether a decision is started and not yet completed.
    pub fn has_in_flight_decision(&self) -> bool {
        self.execution.decision_started_id != EMPTY_EVENT_ID
    }

    /// Whether the domain replicates across clusters. Global domains carry
    /// nonzero failover versions from the first write.
    pub fn is_global_domain(&self) -> bool {
        self.replication_state.start_version != EMPTY_VERSION
    }

    /// Next event ID to allocate.
    pub fn next_event_id(&self) -> i64 {
        self.execution.next_event_id
    }

    /// Bump the version new events are stamped with (failover observed).
    pub fn update_current_version(&mut self, version: i64) -> Result<()> {
        if version < self.replication_state.current_version {
            return Err(EngineError::Internal {
                details: format!(
                    "current version cannot regress: {} -> {}",
                    self.replication_state.current_version, version
                ),
            });
        }
        self.replication_state.current_version = version;
        Ok(())
    }

    // ========================================================================
    // Event append primitives
    // ========================================================================

    fn append(&mut self, attributes: EventAttributes) -> Result<HistoryEvent> {
        let event = HistoryEvent {
            event_id: self.execution.next_event_id,
            version: self.replication_state.current_version,
            timestamp: Utc::now(),
            attributes,
        };
        self.execution.next_event_id += 1;
        self.version_histories
            .current_mut()
            .add_or_update_item(VersionHistoryItem::new(event.event_id, event.version))?;
        self.pending_events.push(event.clone());
        Ok(event)
    }

    fn buffer(&mut self, attributes: EventAttributes) {
        self.buffered_events.push(HistoryEvent {
            event_id: EMPTY_EVENT_ID,
            version: self.replication_state.current_version,
            timestamp: Utc::now(),
            attributes,
        });
    }

    /// Append directly, or buffer when a decision is in flight.
    fn append_or_buffer(&mut self, attributes: EventAttributes) -> Result<Option<HistoryEvent>> {
        if self.has_in_flight_decision() {
            self.buffer(attributes);
            Ok(None)
        } else {
            self.append(attributes).map(Some)
        }
    }

    /// Flush buffered events into history, allocating their IDs now.
    fn flush_buffered_events(&mut self) -> Result<bool> {
        if self.buffered_events.is_empty() {
            return Ok(false);
        }
        let buffered = std::mem::take(&mut self.buffered_events);
        for event in buffered {
            self.append(event.attributes)?;
        }
        Ok(true)
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.is_open() {
            return Err(EngineError::EntityNotExists {
                entity: format!("open workflow run '{}'", self.execution.key.run_id),
            });
        }
        Ok(())
    }

    fn push_transfer(&mut self, kind: TransferTaskKind) {
        self.transfer_tasks.push(TransferTask {
            task_id: 0,
            domain_id: self.execution.key.domain_id.clone(),
            workflow_id: self.execution.key.workflow_id.clone(),
            run_id: self.execution.key.run_id.clone(),
            visibility_timestamp: Utc::now(),
            version: self.replication_state.current_version,
            kind,
        });
    }

    fn push_timer(&mut self, fire_at: DateTime<Utc>, kind: TimerTaskKind) {
        self.timer_tasks.push(TimerTask {
            visibility_timestamp: fire_at,
            task_id: 0,
            domain_id: self.execution.key.domain_id.clone(),
            workflow_id: self.execution.key.workflow_id.clone(),
            run_id: self.execution.key.run_id.clone(),
            version: self.replication_state.current_version,
            kind,
        });
    }

    // ========================================================================
    // Workflow lifecycle
    // ========================================================================

    /// Append the started event and arm the workflow timeout.
    pub fn add_workflow_execution_started(
        &mut self,
        params: StartWorkflowParams,
    ) -> Result<HistoryEvent> {
        if self.execution.next_event_id != FIRST_EVENT_ID {
            return Err(EngineError::Internal {
                details: "started event must be the first event".to_string(),
            });
        }
        self.execution.workflow_type = params.workflow_type.clone();
        self.execution.task_list = params.task_list.clone();
        self.execution.parent = params.parent.clone();
        self.execution.execution_timeout_seconds = params.execution_timeout_seconds;
        self.execution.decision_timeout_seconds = params.decision_timeout_seconds;
        self.execution.state = WorkflowState::Running;
        self.execution.start_time = Utc::now();

        let event = self.append(EventAttributes::WorkflowExecutionStarted {
            workflow_type: params.workflow_type,
            task_list: params.task_list,
            input: params.input,
            execution_timeout_seconds: params.execution_timeout_seconds,
            decision_timeout_seconds: params.decision_timeout_seconds,
            parent: params.parent,
            continued_from_run_id: params.continued_from_run_id,
        })?;

        self.push_transfer(TransferTaskKind::RecordWorkflowStarted);
        self.push_timer(
            Utc::now() + Duration::seconds(params.execution_timeout_seconds as i64),
            TimerTaskKind::WorkflowTimeout,
        );
        Ok(event)
    }

    /// Record an external cancellation request. Buffered behind an
    /// in-flight decision.
    pub fn add_cancel_requested(
        &mut self,
        cause: impl Into<String>,
        identity: impl Into<String>,
        external_initiated_id: Option<i64>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.append_or_buffer(EventAttributes::WorkflowExecutionCancelRequested {
            cause: cause.into(),
            external_initiated_id,
            identity: identity.into(),
        })?;
        Ok(())
    }

    /// Record a signal. Buffered behind an in-flight decision.
    pub fn add_signal_event(
        &mut self,
        signal_name: impl Into<String>,
        input: Option<Value>,
        identity: impl Into<String>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.append_or_buffer(EventAttributes::WorkflowExecutionSignaled {
            signal_name: signal_name.into(),
            input,
            identity: identity.into(),
        })?;
        Ok(())
    }

    fn close(&mut self, close_status: CloseStatus, retention: Duration) {
        self.execution.state = WorkflowState::Completed;
        self.execution.close_status = close_status;
        self.execution.close_time = Some(Utc::now());
        self.execution.decision_schedule_id = EMPTY_EVENT_ID;
        self.execution.decision_started_id = EMPTY_EVENT_ID;
        self.push_transfer(TransferTaskKind::CloseExecution);
        self.push_timer(Utc::now() + retention, TimerTaskKind::DeleteHistoryEvent);
    }

    /// Close the run as completed.
    pub fn add_workflow_execution_completed(
        &mut self,
        decision_completed_id: i64,
        result: Option<Value>,
        retention: Duration,
    ) -> Result<HistoryEvent> {
        self.ensure_open()?;
        let event = self.append(EventAttributes::WorkflowExecutionCompleted {
            decision_completed_id,
            result,
        })?;
        self.close(CloseStatus::Completed, retention);
        Ok(event)
    }

    /// Close the run as failed.
    pub fn add_workflow_execution_failed(
        &mut self,
        decision_completed_id: i64,
        reason: impl Into<String>,
        details: Option<Value>,
        retention: Duration,
    ) -> Result<HistoryEvent> {
        self.ensure_open()?;
        let event = self.append(EventAttributes::WorkflowExecutionFailed {
            decision_completed_id,
            reason: reason.into(),
            details,
        })?;
        self.close(CloseStatus::Failed, retention);
        Ok(event)
    }

    /// Close the run as canceled.
    pub fn add_workflow_execution_canceled(
        &mut self,
        decision_completed_id: i64,
        details: Option<Value>,
        retention: Duration,
    ) -> Result<HistoryEvent> {
        self.ensure_open()?;
        let event = self.append(EventAttributes::WorkflowExecutionCanceled {
            decision_completed_id,
            details,
        })?;
        self.close(CloseStatus::Canceled, retention);
        Ok(event)
    }

    /// Close the run as terminated. No decision involvement.
    pub fn add_workflow_execution_terminated(
        &mut self,
        reason: impl Into<String>,
        identity: impl Into<String>,
        retention: Duration,
    ) -> Result<HistoryEvent> {
        self.ensure_open()?;
        let event = self.append(EventAttributes::WorkflowExecutionTerminated {
            reason: reason.into(),
            identity: identity.into(),
        })?;
        self.close(CloseStatus::Terminated, retention);
        Ok(event)
    }

    /// Close the run as timed out.
    pub fn add_workflow_execution_timed_out(&mut self, retention: Duration) -> Result<HistoryEvent> {
        self.ensure_open()?;
        let event = self.append(EventAttributes::WorkflowExecutionTimedOut)?;
        self.close(CloseStatus::TimedOut, retention);
        Ok(event)
    }

    /// Close the run as continued-as-new, pointing at its successor.
    pub fn add_workflow_execution_continued_as_new(
        &mut self,
        decision_completed_id: i64,
        new_run_id: impl Into<String>,
        retention: Duration,
    ) -> Result<HistoryEvent> {
        self.ensure_open()?;
        let event = self.append(EventAttributes::WorkflowExecutionContinuedAsNew {
            decision_completed_id,
            new_run_id: new_run_id.into(),
        })?;
        self.close(CloseStatus::ContinuedAsNew, retention);
        Ok(event)
    }

    // ========================================================================
    // Decisions
    // ========================================================================

    /// Schedule a decision. Only one may be outstanding per run.
    pub fn schedule_decision(&mut self) -> Result<i64> {
        self.ensure_open()?;
        if self.has_pending_decision() {
            return Err(EngineError::Internal {
                details: "a decision is already outstanding".to_string(),
            });
        }
        let attempt = self.execution.decision_attempt;
        let task_list = self.execution.task_list.clone();
        let timeout = self.execution.decision_timeout_seconds;
        let event = self.append(EventAttributes::DecisionTaskScheduled {
            task_list: task_list.clone(),
            start_to_close_seconds: timeout,
            attempt,
        })?;
        self.execution.decision_schedule_id = event.event_id;
        self.push_transfer(TransferTaskKind::Decision {
            task_list,
            schedule_id: event.event_id,
        });
        Ok(event.event_id)
    }

    /// Schedule a decision if the run is open and none is outstanding.
    pub fn schedule_decision_if_needed(&mut self) -> Result<()> {
        if self.is_open() && !self.has_pending_decision() {
            self.schedule_decision()?;
        }
        Ok(())
    }

    /// Record decision pickup and arm its start-to-close timeout.
    pub fn add_decision_task_started(
        &mut self,
        schedule_id: i64,
        identity: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Result<HistoryEvent> {
        if self.execution.decision_schedule_id != schedule_id || self.has_in_flight_decision() {
            return Err(EngineError::EntityNotExists {
                entity: format!("scheduled decision {}", schedule_id),
            });
        }
        let attempt = self.execution.decision_attempt;
        let event = self.append(EventAttributes::DecisionTaskStarted {
            schedule_id,
            identity: identity.into(),
            request_id: request_id.into(),
        })?;
        self.execution.decision_started_id = event.event_id;
        self.push_timer(
            Utc::now() + Duration::seconds(self.execution.decision_timeout_seconds as i64),
            TimerTaskKind::DecisionTimeout {
                schedule_id,
                attempt,
            },
        );
        Ok(event)
    }

    /// Complete the in-flight decision, flushing buffered events.
    ///
    /// Returns `(completed_event_id, had_buffered)`; buffered events take
    /// their IDs immediately after the completion event, and the decision's
    /// own result events are appended after them by the caller.
    pub fn add_decision_task_completed(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        identity: impl Into<String>,
    ) -> Result<(i64, bool)> {
        if self.execution.decision_schedule_id != schedule_id
            || self.execution.decision_started_id != started_id
        {
            return Err(EngineError::EntityNotExists {
                entity: format!("in-flight decision {}/{}", schedule_id, started_id),
            });
        }
        let event = self.append(EventAttributes::DecisionTaskCompleted {
            schedule_id,
            started_id,
            identity: identity.into(),
        })?;
        self.execution.decision_schedule_id = EMPTY_EVENT_ID;
        self.execution.decision_started_id = EMPTY_EVENT_ID;
        self.execution.decision_attempt = 0;
        self.execution.last_processed_event_id = started_id;
        let had_buffered = self.flush_buffered_events()?;
        Ok((event.event_id, had_buffered))
    }

    /// Time out the in-flight decision at `attempt` and reschedule.
    ///
    /// Stale timers (attempt mismatch, decision already gone) are a no-op
    /// returning `false`.
    pub fn timeout_decision_task(&mut self, schedule_id: i64, attempt: i64) -> Result<bool> {
        if self.execution.decision_schedule_id != schedule_id
            || self.execution.decision_attempt != attempt
            || !self.has_in_flight_decision()
        {
            return Ok(false);
        }
        let started_id = self.execution.decision_started_id;
        self.append(EventAttributes::DecisionTaskTimedOut {
            schedule_id,
            started_id,
            timeout_type: TimeoutType::StartToClose,
        })?;
        self.execution.decision_schedule_id = EMPTY_EVENT_ID;
        self.execution.decision_started_id = EMPTY_EVENT_ID;
        self.execution.decision_attempt = attempt + 1;
        self.schedule_decision()?;
        Ok(true)
    }

    // ========================================================================
    // Activities
    // ========================================================================

    /// Schedule an activity from a completed decision.
    pub fn add_activity_task_scheduled(
        &mut self,
        decision_completed_id: i64,
        params: ActivityParams,
    ) -> Result<i64> {
        self.ensure_open()?;
        let task_list = if params.task_list.is_empty() {
            self.execution.task_list.clone()
        } else {
            params.task_list.clone()
        };
        let event = self.append(EventAttributes::ActivityTaskScheduled {
            decision_completed_id,
            activity_id: params.activity_id.clone(),
            activity_type: params.activity_type.clone(),
            task_list: task_list.clone(),
            input: params.input.clone(),
            schedule_to_start_seconds: params.schedule_to_start_seconds,
            schedule_to_close_seconds: params.schedule_to_close_seconds,
            start_to_close_seconds: params.start_to_close_seconds,
            heartbeat_seconds: params.heartbeat_seconds,
        })?;
        let schedule_id = event.event_id;
        let now = Utc::now();
        self.activities.insert(
            schedule_id,
            ActivityInfo {
                schedule_id,
                started_id: EMPTY_EVENT_ID,
                activity_id: params.activity_id,
                activity_type: params.activity_type,
                task_list: task_list.clone(),
                schedule_to_start_seconds: params.schedule_to_start_seconds,
                schedule_to_close_seconds: params.schedule_to_close_seconds,
                start_to_close_seconds: params.start_to_close_seconds,
                heartbeat_seconds: params.heartbeat_seconds,
                attempt: 0,
                scheduled_time: now,
                last_heartbeat_time: now,
                version: self.replication_state.current_version,
            },
        );
        self.push_transfer(TransferTaskKind::Activity {
            task_list,
            schedule_id,
        });
        if params.schedule_to_start_seconds > 0 {
            self.push_timer(
                now + Duration::seconds(params.schedule_to_start_seconds as i64),
                TimerTaskKind::ActivityTimeout {
                    schedule_id,
                    timeout_type: TimeoutType::ScheduleToStart,
                    attempt: 0,
                },
            );
        }
        if params.schedule_to_close_seconds > 0 {
            self.push_timer(
                now + Duration::seconds(params.schedule_to_close_seconds as i64),
                TimerTaskKind::ActivityTimeout {
                    schedule_id,
                    timeout_type: TimeoutType::ScheduleToClose,
                    attempt: 0,
                },
            );
        }
        Ok(schedule_id)
    }

    /// Record activity pickup and arm start-to-close/heartbeat timeouts.
    pub fn add_activity_task_started(
        &mut self,
        schedule_id: i64,
        identity: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Result<HistoryEvent> {
        let info = self.activities.get(&schedule_id).ok_or_else(|| {
            EngineError::EntityNotExists {
                entity: format!("scheduled activity {}", schedule_id),
            }
        })?;
        if info.started_id != EMPTY_EVENT_ID {
            return Err(EngineError::Internal {
                details: format!("activity {} already started", schedule_id),
            });
        }
        let attempt = info.attempt;
        let start_to_close = info.start_to_close_seconds;
        let heartbeat = info.heartbeat_seconds;

        let event = self.append(EventAttributes::ActivityTaskStarted {
            schedule_id,
            identity: identity.into(),
            request_id: request_id.into(),
            attempt,
        })?;
        let now = Utc::now();
        if let Some(info) = self.activities.get_mut(&schedule_id) {
            info.started_id = event.event_id;
            info.last_heartbeat_time = now;
        }
        if start_to_close > 0 {
            self.push_timer(
                now + Duration::seconds(start_to_close as i64),
                TimerTaskKind::ActivityTimeout {
                    schedule_id,
                    timeout_type: TimeoutType::StartToClose,
                    attempt,
                },
            );
        }
        if heartbeat > 0 {
            self.push_timer(
                now + Duration::seconds(heartbeat as i64),
                TimerTaskKind::ActivityTimeout {
                    schedule_id,
                    timeout_type: TimeoutType::Heartbeat,
                    attempt,
                },
            );
        }
        Ok(event)
    }

    /// Record an activity completion. Buffered behind an in-flight
    /// decision; the pending entry is removed either way.
    pub fn add_activity_task_completed(
        &mut self,
        schedule_id: i64,
        result: Option<Value>,
        identity: impl Into<String>,
    ) -> Result<()> {
        let info = self.activities.remove(&schedule_id).ok_or_else(|| {
            EngineError::EntityNotExists {
                entity: format!("pending activity {}", schedule_id),
            }
        })?;
        self.append_or_buffer(EventAttributes::ActivityTaskCompleted {
            schedule_id,
            started_id: info.started_id,
            result,
            identity: identity.into(),
        })?;
        Ok(())
    }

    /// Record an activity failure.
    pub fn add_activity_task_failed(
        &mut self,
        schedule_id: i64,
        reason: impl Into<String>,
        details: Option<Value>,
    ) -> Result<()> {
        let info = self.activities.remove(&schedule_id).ok_or_else(|| {
            EngineError::EntityNotExists {
                entity: format!("pending activity {}", schedule_id),
            }
        })?;
        self.append_or_buffer(EventAttributes::ActivityTaskFailed {
            schedule_id,
            started_id: info.started_id,
            reason: reason.into(),
            details,
        })?;
        Ok(())
    }

    /// Time out an activity at `attempt`. Stale timers are a no-op
    /// returning `false`.
    pub fn timeout_activity_task(
        &mut self,
        schedule_id: i64,
        timeout_type: TimeoutType,
        attempt: i64,
    ) -> Result<bool> {
        let Some(info) = self.activities.get(&schedule_id) else {
            return Ok(false);
        };
        if info.attempt != attempt {
            return Ok(false);
        }
        // schedule-to-start only applies while unstarted; start-to-close
        // and heartbeat only once started
        match timeout_type {
            TimeoutType::ScheduleToStart if info.started_id != EMPTY_EVENT_ID => return Ok(false),
            TimeoutType::StartToClose | TimeoutType::Heartbeat
                if info.started_id == EMPTY_EVENT_ID =>
            {
                return Ok(false)
            }
            _ => {}
        }
        let info = self.activities.remove(&schedule_id).expect("checked above");
        self.append_or_buffer(EventAttributes::ActivityTaskTimedOut {
            schedule_id,
            started_id: info.started_id,
            timeout_type,
        })?;
        Ok(true)
    }

    /// Record a heartbeat; refreshes the heartbeat deadline check.
    pub fn record_activity_heartbeat(&mut self, schedule_id: i64) -> Result<()> {
        let info = self.activities.get_mut(&schedule_id).ok_or_else(|| {
            EngineError::EntityNotExists {
                entity: format!("pending activity {}", schedule_id),
            }
        })?;
        info.last_heartbeat_time = Utc::now();
        Ok(())
    }

    // ========================================================================
    // User timers
    // ========================================================================

    /// Start a user timer from a completed decision.
    pub fn add_timer_started(
        &mut self,
        decision_completed_id: i64,
        timer_id: impl Into<String>,
        start_to_fire_seconds: i64,
    ) -> Result<HistoryEvent> {
        self.ensure_open()?;
        let timer_id = timer_id.into();
        if self.timers.contains_key(&timer_id) {
            return Err(EngineError::Internal {
                details: format!("timer '{}' already started", timer_id),
            });
        }
        let event = self.append(EventAttributes::TimerStarted {
            decision_completed_id,
            timer_id: timer_id.clone(),
            start_to_fire_seconds,
        })?;
        let expiry = Utc::now() + Duration::seconds(start_to_fire_seconds);
        self.timers.insert(
            timer_id.clone(),
            TimerInfo {
                timer_id: timer_id.clone(),
                started_event_id: event.event_id,
                expiry_time: expiry,
                version: self.replication_state.current_version,
            },
        );
        self.push_timer(expiry, TimerTaskKind::UserTimer { timer_id });
        Ok(event)
    }

    /// Fire a user timer. Stale timers are a no-op returning `false`.
    pub fn add_timer_fired(&mut self, timer_id: &str) -> Result<bool> {
        let Some(info) = self.timers.remove(timer_id) else {
            return Ok(false);
        };
        self.append_or_buffer(EventAttributes::TimerFired {
            timer_id: info.timer_id,
            started_event_id: info.started_event_id,
        })?;
        Ok(true)
    }

    /// Cancel a user timer from a completed decision.
    pub fn add_timer_canceled(
        &mut self,
        decision_completed_id: i64,
        timer_id: &str,
    ) -> Result<bool> {
        let Some(info) = self.timers.remove(timer_id) else {
            return Ok(false);
        };
        self.append(EventAttributes::TimerCanceled {
            decision_completed_id,
            timer_id: info.timer_id,
            started_event_id: info.started_event_id,
        })?;
        Ok(true)
    }

    // ========================================================================
    // External workflows: cancels, signals, children
    // ========================================================================

    /// Initiate a cancel of an external workflow.
    pub fn add_request_cancel_external_initiated(
        &mut self,
        decision_completed_id: i64,
        target_domain_id: impl Into<String>,
        target_workflow_id: impl Into<String>,
        target_run_id: impl Into<String>,
    ) -> Result<i64> {
        self.ensure_open()?;
        let target_domain_id = target_domain_id.into();
        let target_workflow_id = target_workflow_id.into();
        let target_run_id = target_run_id.into();
        let event = self.append(EventAttributes::RequestCancelExternalWorkflowInitiated {
            decision_completed_id,
            domain: target_domain_id.clone(),
            workflow_id: target_workflow_id.clone(),
            run_id: target_run_id.clone(),
        })?;
        let initiated_id = event.event_id;
        self.request_cancels.insert(
            initiated_id,
            RequestCancelInfo {
                initiated_id,
                target_domain_id: target_domain_id.clone(),
                target_workflow_id: target_workflow_id.clone(),
                target_run_id: target_run_id.clone(),
                version: self.replication_state.current_version,
            },
        );
        self.push_transfer(TransferTaskKind::CancelExecution {
            target_domain_id,
            target_workflow_id,
            target_run_id,
            initiated_id,
        });
        Ok(initiated_id)
    }

    /// Record delivery of an external cancel request.
    pub fn record_external_cancel_delivered(&mut self, initiated_id: i64) -> Result<bool> {
        let Some(info) = self.request_cancels.remove(&initiated_id) else {
            return Ok(false);
        };
        self.append_or_buffer(EventAttributes::ExternalWorkflowCancelRequested {
            initiated_id,
            domain: info.target_domain_id,
            workflow_id: info.target_workflow_id,
            run_id: info.target_run_id,
        })?;
        Ok(true)
    }

    /// Record failure of an external cancel request.
    pub fn record_external_cancel_failed(
        &mut self,
        initiated_id: i64,
        cause: impl Into<String>,
    ) -> Result<bool> {
        if self.request_cancels.remove(&initiated_id).is_none() {
            return Ok(false);
        }
        self.append_or_buffer(EventAttributes::RequestCancelExternalWorkflowFailed {
            initiated_id,
            cause: cause.into(),
        })?;
        Ok(true)
    }

    /// Initiate a signal to an external workflow.
    #[allow(clippy::too_many_arguments)]
    pub fn add_signal_external_initiated(
        &mut self,
        decision_completed_id: i64,
        target_domain_id: impl Into<String>,
        target_workflow_id: impl Into<String>,
        target_run_id: impl Into<String>,
        signal_name: impl Into<String>,
        input: Option<Value>,
    ) -> Result<i64> {
        self.ensure_open()?;
        let target_domain_id = target_domain_id.into();
        let target_workflow_id = target_workflow_id.into();
        let target_run_id = target_run_id.into();
        let signal_name = signal_name.into();
        let event = self.append(EventAttributes::SignalExternalWorkflowInitiated {
            decision_completed_id,
            domain: target_domain_id.clone(),
            workflow_id: target_workflow_id.clone(),
            run_id: target_run_id.clone(),
            signal_name: signal_name.clone(),
            input: input.clone(),
        })?;
        let initiated_id = event.event_id;
        self.signals.insert(
            initiated_id,
            SignalInfo {
                initiated_id,
                target_domain_id: target_domain_id.clone(),
                target_workflow_id: target_workflow_id.clone(),
                target_run_id: target_run_id.clone(),
                signal_name,
                input,
                version: self.replication_state.current_version,
            },
        );
        self.push_transfer(TransferTaskKind::SignalExecution {
            target_domain_id,
            target_workflow_id,
            target_run_id,
            initiated_id,
        });
        Ok(initiated_id)
    }

    /// Record delivery of an external signal.
    pub fn record_external_signal_delivered(&mut self, initiated_id: i64) -> Result<bool> {
        let Some(info) = self.signals.remove(&initiated_id) else {
            return Ok(false);
        };
        self.append_or_buffer(EventAttributes::ExternalWorkflowSignaled {
            initiated_id,
            domain: info.target_domain_id,
            workflow_id: info.target_workflow_id,
            run_id: info.target_run_id,
        })?;
        Ok(true)
    }

    /// Record failure of an external signal.
    pub fn record_external_signal_failed(
        &mut self,
        initiated_id: i64,
        cause: impl Into<String>,
    ) -> Result<bool> {
        if self.signals.remove(&initiated_id).is_none() {
            return Ok(false);
        }
        self.append_or_buffer(EventAttributes::SignalExternalWorkflowFailed {
            initiated_id,
            cause: cause.into(),
        })?;
        Ok(true)
    }

    /// Initiate a child workflow start.
    pub fn add_child_workflow_initiated(
        &mut self,
        decision_completed_id: i64,
        domain: impl Into<String>,
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        task_list: impl Into<String>,
        input: Option<Value>,
    ) -> Result<i64> {
        self.ensure_open()?;
        let domain = domain.into();
        let workflow_id = workflow_id.into();
        let workflow_type = workflow_type.into();
        let task_list = task_list.into();
        let event = self.append(EventAttributes::StartChildWorkflowInitiated {
            decision_completed_id,
            domain: domain.clone(),
            workflow_id: workflow_id.clone(),
            workflow_type: workflow_type.clone(),
            task_list: task_list.clone(),
            input,
        })?;
        let initiated_id = event.event_id;
        self.children.insert(
            initiated_id,
            ChildExecutionInfo {
                initiated_id,
                started_id: EMPTY_EVENT_ID,
                domain: domain.clone(),
                workflow_id: workflow_id.clone(),
                run_id: None,
                workflow_type,
                task_list,
                version: self.replication_state.current_version,
            },
        );
        self.push_transfer(TransferTaskKind::StartChildExecution {
            target_domain_id: domain,
            target_workflow_id: workflow_id,
            initiated_id,
        });
        Ok(initiated_id)
    }

    /// Record that a child workflow started.
    pub fn record_child_started(
        &mut self,
        initiated_id: i64,
        run_id: impl Into<String>,
    ) -> Result<bool> {
        let run_id = run_id.into();
        let Some(info) = self.children.get_mut(&initiated_id) else {
            return Ok(false);
        };
        if info.started_id != EMPTY_EVENT_ID {
            return Ok(false);
        }
        info.run_id = Some(run_id.clone());
        let domain = info.domain.clone();
        let workflow_id = info.workflow_id.clone();
        let event = self.append_or_buffer(EventAttributes::ChildWorkflowStarted {
            initiated_id,
            domain,
            workflow_id,
            run_id,
        })?;
        if let Some(event) = event {
            if let Some(info) = self.children.get_mut(&initiated_id) {
                info.started_id = event.event_id;
            }
        }
        Ok(true)
    }

    /// Record that a child workflow failed to start.
    pub fn record_child_start_failed(
        &mut self,
        initiated_id: i64,
        cause: impl Into<String>,
    ) -> Result<bool> {
        if self.children.remove(&initiated_id).is_none() {
            return Ok(false);
        }
        self.append_or_buffer(EventAttributes::StartChildWorkflowFailed {
            initiated_id,
            cause: cause.into(),
        })?;
        Ok(true)
    }

    /// Record that a child workflow closed.
    pub fn record_child_completed(
        &mut self,
        initiated_id: i64,
        result: Option<Value>,
    ) -> Result<bool> {
        let Some(info) = self.children.remove(&initiated_id) else {
            return Ok(false);
        };
        self.append_or_buffer(EventAttributes::ChildWorkflowCompleted {
            initiated_id,
            started_id: info.started_id,
            result,
        })?;
        Ok(true)
    }

    /// Record a search-attribute upsert.
    pub fn add_upsert_search_attributes(
        &mut self,
        decision_completed_id: i64,
        attributes: HashMap<String, Value>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.execution.search_attributes.extend(attributes.clone());
        self.append(EventAttributes::UpsertSearchAttributes {
            decision_completed_id,
            attributes,
        })?;
        self.push_transfer(TransferTaskKind::UpsertSearchAttributes);
        Ok(())
    }

    // ========================================================================
    // Replication replay
    // ========================================================================

    /// Apply one replicated event to the state, materializing the same
    /// transfer/timer tasks the active side produced so this cluster can
    /// take over after failover.
    pub fn replay_event(&mut self, event: &HistoryEvent) -> Result<()> {
        if event.event_id != self.execution.next_event_id {
            return Err(EngineError::Internal {
                details: format!(
                    "replayed event {} does not follow next event id {}",
                    event.event_id, self.execution.next_event_id
                ),
            });
        }
        if event.version > self.replication_state.current_version {
            self.replication_state.current_version = event.version;
        }

        match event.attributes.clone() {
            EventAttributes::WorkflowExecutionStarted {
                workflow_type,
                task_list,
                input,
                execution_timeout_seconds,
                decision_timeout_seconds,
                parent,
                continued_from_run_id,
            } => {
                self.add_workflow_execution_started(StartWorkflowParams {
                    workflow_type,
                    task_list,
                    input,
                    execution_timeout_seconds,
                    decision_timeout_seconds,
                    parent,
                    continued_from_run_id,
                })?;
            }
            EventAttributes::DecisionTaskScheduled { attempt, .. } => {
                self.execution.decision_attempt = attempt;
                self.schedule_decision()?;
            }
            EventAttributes::DecisionTaskStarted {
                schedule_id,
                identity,
                request_id,
            } => {
                self.add_decision_task_started(schedule_id, identity, request_id)?;
            }
            EventAttributes::DecisionTaskCompleted {
                schedule_id,
                started_id,
                identity,
            } => {
                self.add_decision_task_completed(schedule_id, started_id, identity)?;
            }
            EventAttributes::DecisionTaskTimedOut { .. } => {
                self.execution.decision_schedule_id = EMPTY_EVENT_ID;
                self.execution.decision_started_id = EMPTY_EVENT_ID;
                self.execution.decision_attempt += 1;
                self.append_replicated(event)?;
                return Ok(());
            }
            EventAttributes::ActivityTaskScheduled {
                decision_completed_id,
                activity_id,
                activity_type,
                task_list,
                input,
                schedule_to_start_seconds,
                schedule_to_close_seconds,
                start_to_close_seconds,
                heartbeat_seconds,
            } => {
                self.add_activity_task_scheduled(
                    decision_completed_id,
                    ActivityParams {
                        activity_id,
                        activity_type,
                        task_list,
                        input,
                        schedule_to_start_seconds,
                        schedule_to_close_seconds,
                        start_to_close_seconds,
                        heartbeat_seconds,
                    },
                )?;
            }
            EventAttributes::ActivityTaskStarted {
                schedule_id,
                identity,
                request_id,
                ..
            } => {
                self.add_activity_task_started(schedule_id, identity, request_id)?;
            }
            EventAttributes::ActivityTaskCompleted { schedule_id, .. } => {
                self.activities.remove(&schedule_id);
                self.append_replicated(event)?;
                return Ok(());
            }
            EventAttributes::ActivityTaskFailed { schedule_id, .. }
            | EventAttributes::ActivityTaskTimedOut { schedule_id, .. }
            | EventAttributes::ActivityTaskCanceled { schedule_id, .. } => {
                self.activities.remove(&schedule_id);
                self.append_replicated(event)?;
                return Ok(());
            }
            EventAttributes::TimerStarted {
                decision_completed_id,
                timer_id,
                start_to_fire_seconds,
            } => {
                self.add_timer_started(decision_completed_id, timer_id, start_to_fire_seconds)?;
            }
            EventAttributes::TimerFired { timer_id, .. }
            | EventAttributes::TimerCanceled { timer_id, .. } => {
                self.timers.remove(&timer_id);
                self.append_replicated(event)?;
                return Ok(());
            }
            EventAttributes::WorkflowExecutionSignaled { .. }
            | EventAttributes::WorkflowExecutionCancelRequested { .. }
            | EventAttributes::ActivityTaskCancelRequested { .. } => {
                self.append_replicated(event)?;
                return Ok(());
            }
            EventAttributes::UpsertSearchAttributes { attributes, .. } => {
                self.execution.search_attributes.extend(attributes);
                self.append_replicated(event)?;
                return Ok(());
            }
            EventAttributes::WorkflowExecutionCompleted { .. } => {
                self.append_replicated(event)?;
                self.close(CloseStatus::Completed, Duration::days(7));
                return Ok(());
            }
            EventAttributes::WorkflowExecutionFailed { .. } => {
                self.append_replicated(event)?;
                self.close(CloseStatus::Failed, Duration::days(7));
                return Ok(());
            }
            EventAttributes::WorkflowExecutionCanceled { .. } => {
                self.append_replicated(event)?;
                self.close(CloseStatus::Canceled, Duration::days(7));
                return Ok(());
            }
            EventAttributes::WorkflowExecutionTerminated { .. } => {
                self.append_replicated(event)?;
                self.close(CloseStatus::Terminated, Duration::days(7));
                return Ok(());
            }
            EventAttributes::WorkflowExecutionTimedOut => {
                self.append_replicated(event)?;
                self.close(CloseStatus::TimedOut, Duration::days(7));
                return Ok(());
            }
            EventAttributes::WorkflowExecutionContinuedAsNew { .. } => {
                self.append_replicated(event)?;
                self.close(CloseStatus::ContinuedAsNew, Duration::days(7));
                return Ok(());
            }
            EventAttributes::RequestCancelExternalWorkflowInitiated {
                decision_completed_id,
                domain,
                workflow_id,
                run_id,
            } => {
                self.add_request_cancel_external_initiated(
                    decision_completed_id,
                    domain,
                    workflow_id,
                    run_id,
                )?;
            }
            EventAttributes::ExternalWorkflowCancelRequested { initiated_id, .. }
            | EventAttributes::RequestCancelExternalWorkflowFailed { initiated_id, .. } => {
                self.request_cancels.remove(&initiated_id);
                self.append_replicated(event)?;
                return Ok(());
            }
            EventAttributes::SignalExternalWorkflowInitiated {
                decision_completed_id,
                domain,
                workflow_id,
                run_id,
                signal_name,
                input,
            } => {
                self.add_signal_external_initiated(
                    decision_completed_id,
                    domain,
                    workflow_id,
                    run_id,
                    signal_name,
                    input,
                )?;
            }
            EventAttributes::ExternalWorkflowSignaled { initiated_id, .. }
            | EventAttributes::SignalExternalWorkflowFailed { initiated_id, .. } => {
                self.signals.remove(&initiated_id);
                self.append_replicated(event)?;
                return Ok(());
            }
            EventAttributes::StartChildWorkflowInitiated {
                decision_completed_id,
                domain,
                workflow_id,
                workflow_type,
                task_list,
                input,
            } => {
                self.add_child_workflow_initiated(
                    decision_completed_id,
                    domain,
                    workflow_id,
                    workflow_type,
                    task_list,
                    input,
                )?;
            }
            EventAttributes::ChildWorkflowStarted {
                initiated_id,
                run_id,
                ..
            } => {
                if let Some(info) = self.children.get_mut(&initiated_id) {
                    info.started_id = event.event_id;
                    info.run_id = Some(run_id);
                }
                self.append_replicated(event)?;
                return Ok(());
            }
            EventAttributes::StartChildWorkflowFailed { initiated_id, .. }
            | EventAttributes::ChildWorkflowCompleted { initiated_id, .. } => {
                self.children.remove(&initiated_id);
                self.append_replicated(event)?;
                return Ok(());
            }
        }

        // the add_* path above appended a locally-stamped copy; replace it
        // with the replicated original so state matches the remote byte for
        // byte
        let appended = self.pending_events.last_mut().ok_or_else(|| EngineError::Internal {
            details: "replay produced no event".to_string(),
        })?;
        *appended = event.clone();
        Ok(())
    }

    /// Append a replicated event verbatim, without state-machine effects.
    /// Used when extending the history of an already-closed run.
    pub(crate) fn backfill_event(&mut self, event: &HistoryEvent) -> Result<()> {
        self.append_replicated(event)
    }

    /// Append a replicated event verbatim.
    fn append_replicated(&mut self, event: &HistoryEvent) -> Result<()> {
        self.execution.next_event_id = event.event_id + 1;
        self.version_histories
            .current_mut()
            .add_or_update_item(VersionHistoryItem::new(event.event_id, event.version))?;
        self.pending_events.push(event.clone());
        Ok(())
    }

    // ========================================================================
    // Transaction close
    // ========================================================================

    /// Drain the transaction: events, tasks, and the post-transition
    /// snapshot, with task IDs allocated from the shard.
    pub async fn close_transaction(
        &mut self,
        policy: TransactionPolicy,
        shard: &ShardContext,
    ) -> Result<Transaction> {
        let previous_last_write_version = self.previous_last_write_version;
        let events = std::mem::take(&mut self.pending_events);
        let mut transfer_tasks = std::mem::take(&mut self.transfer_tasks);
        let mut timer_tasks = std::mem::take(&mut self.timer_tasks);

        if let Some(last) = events.last() {
            self.replication_state.last_write_event_id = last.event_id;
            self.replication_state.last_write_version = last.version;
        }

        for task in &mut transfer_tasks {
            task.task_id = shard.generate_task_id().await?;
        }
        for task in &mut timer_tasks {
            task.task_id = shard.generate_task_id().await?;
        }

        let mut replication_tasks = Vec::new();
        if policy == TransactionPolicy::Active && self.is_global_domain() && !events.is_empty() {
            let task_id = shard.generate_task_id().await?;
            let first = events.first().expect("non-empty");
            let last = events.last().expect("non-empty");
            replication_tasks.push(ReplicationTask {
                task_id,
                domain_id: self.execution.key.domain_id.clone(),
                workflow_id: self.execution.key.workflow_id.clone(),
                run_id: self.execution.key.run_id.clone(),
                first_event_id: first.event_id,
                next_event_id: last.event_id + 1,
                version: last.version,
                events: events.clone(),
                version_history: self.version_histories.current().items.clone(),
            });
            self.replication_state.last_event_task_id = task_id;
        }

        let condition = self.condition;
        self.condition = self.execution.next_event_id;
        self.previous_last_write_version = self.replication_state.last_write_version;

        Ok(Transaction {
            branch_token: self.execution.branch_token.clone(),
            events,
            txn: WorkflowTransaction {
                snapshot: self.snapshot(),
                condition,
                transfer_tasks,
                timer_tasks,
                replication_tasks,
            },
            previous_last_write_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windlass_common::cluster::test_fixtures::two_cluster_metadata;
    use windlass_common::config::DynamicConfig;
    use windlass_persistence::memory::MemoryStore;

    fn new_state() -> MutableState {
        let mut state = MutableState::new(
            WorkflowKey::new("d1", "w1", "r1"),
            "branch-1".to_string(),
            1,
        );
        state
            .add_workflow_execution_started(StartWorkflowParams {
                workflow_type: "order-processing".to_string(),
                task_list: "tl".to_string(),
                input: None,
                execution_timeout_seconds: 60,
                decision_timeout_seconds: 10,
                parent: None,
                continued_from_run_id: None,
            })
            .unwrap();
        state
    }

    async fn shard() -> std::sync::Arc<ShardContext> {
        ShardContext::acquire(
            1,
            MemoryStore::new(),
            two_cluster_metadata(),
            DynamicConfig::default(),
        )
        .await
        .unwrap()
    }

    fn complete_first_decision(state: &mut MutableState) -> i64 {
        let schedule_id = state.schedule_decision().unwrap();
        let started = state
            .add_decision_task_started(schedule_id, "worker", "req-1")
            .unwrap();
        let (completed_id, _) = state
            .add_decision_task_completed(schedule_id, started.event_id, "worker")
            .unwrap();
        completed_id
    }

    #[test]
    fn test_event_ids_dense_and_monotonic() {
        let mut state = new_state();
        complete_first_decision(&mut state);
        state
            .add_activity_task_scheduled(
                4,
                ActivityParams {
                    activity_id: "a1".to_string(),
                    activity_type: "charge".to_string(),
                    task_list: String::new(),
                    input: None,
                    schedule_to_start_seconds: 10,
                    schedule_to_close_seconds: 20,
                    start_to_close_seconds: 10,
                    heartbeat_seconds: 0,
                },
            )
            .unwrap();

        let ids: Vec<i64> = state.pending_events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(state.next_event_id(), 6);
    }

    #[test]
    fn test_single_outstanding_decision() {
        let mut state = new_state();
        state.schedule_decision().unwrap();
        assert!(state.schedule_decision().is_err());
    }

    #[test]
    fn test_buffered_events_flush_on_decision_completion() {
        let mut state = new_state();
        let schedule_id = state.schedule_decision().unwrap();
        let started = state
            .add_decision_task_started(schedule_id, "worker", "req-1")
            .unwrap();

        // a signal lands while the decision is in flight
        state.add_signal_event("payment-received", None, "client").unwrap();
        assert_eq!(state.buffered_events.len(), 1);
        let next_before = state.next_event_id();

        let (completed_id, had_buffered) = state
            .add_decision_task_completed(schedule_id, started.event_id, "worker")
            .unwrap();
        assert!(had_buffered);
        assert!(state.buffered_events.is_empty());
        // completion event, then the flushed signal
        assert_eq!(completed_id, next_before);
        let last = state.pending_events.last().unwrap();
        assert_eq!(last.event_id, completed_id + 1);
        assert_eq!(last.type_name(), "WorkflowExecutionSignaled");
    }

    #[test]
    fn test_activity_timeout_attempt_guard() {
        let mut state = new_state();
        let completed_id = complete_first_decision(&mut state);
        let schedule_id = state
            .add_activity_task_scheduled(
                completed_id,
                ActivityParams {
                    activity_id: "a1".to_string(),
                    activity_type: "charge".to_string(),
                    task_list: String::new(),
                    input: None,
                    schedule_to_start_seconds: 10,
                    schedule_to_close_seconds: 20,
                    start_to_close_seconds: 10,
                    heartbeat_seconds: 0,
                },
            )
            .unwrap();

        // stale attempt is ignored
        assert!(!state
            .timeout_activity_task(schedule_id, TimeoutType::ScheduleToStart, 3)
            .unwrap());
        // start-to-close cannot fire before the activity starts
        assert!(!state
            .timeout_activity_task(schedule_id, TimeoutType::StartToClose, 0)
            .unwrap());
        // schedule-to-start at the armed attempt fires
        assert!(state
            .timeout_activity_task(schedule_id, TimeoutType::ScheduleToStart, 0)
            .unwrap());
        assert!(!state.activities.contains_key(&schedule_id));
    }

    #[tokio::test]
    async fn test_close_transaction_assigns_task_ids() {
        let shard = shard().await;
        let mut state = new_state();
        state.schedule_decision().unwrap();

        let txn = state
            .close_transaction(TransactionPolicy::Active, &shard)
            .await
            .unwrap();

        assert_eq!(txn.events.len(), 2);
        assert_eq!(txn.txn.condition, 1);
        // started -> RecordWorkflowStarted, decision -> Decision dispatch
        assert_eq!(txn.txn.transfer_tasks.len(), 2);
        assert!(txn.txn.transfer_tasks.iter().all(|t| t.task_id > 0));
        // workflow timeout timer
        assert_eq!(txn.txn.timer_tasks.len(), 1);
        // global domain (version 1) emits one replication task
        assert_eq!(txn.txn.replication_tasks.len(), 1);
        let replication = &txn.txn.replication_tasks[0];
        assert_eq!(replication.first_event_id, 1);
        assert_eq!(replication.next_event_id, 3);

        // scratch is drained
        let empty = state
            .close_transaction(TransactionPolicy::Active, &shard)
            .await
            .unwrap();
        assert!(empty.events.is_empty());
        assert!(empty.txn.transfer_tasks.is_empty());
    }

    #[tokio::test]
    async fn test_passive_policy_emits_no_replication_tasks() {
        let shard = shard().await;
        let mut state = new_state();
        state.schedule_decision().unwrap();

        let txn = state
            .close_transaction(TransactionPolicy::Passive, &shard)
            .await
            .unwrap();
        assert!(txn.txn.replication_tasks.is_empty());
        // transfer/timer tasks still materialize for standby processing
        assert_eq!(txn.txn.transfer_tasks.len(), 2);
        assert_eq!(txn.txn.timer_tasks.len(), 1);
    }

    #[test]
    fn test_version_history_tracks_appends() {
        let mut state = new_state();
        state.schedule_decision().unwrap();
        state.update_current_version(11).unwrap();
        let schedule_id = state.execution.decision_schedule_id;
        state
            .add_decision_task_started(schedule_id, "worker", "req")
            .unwrap();

        let items = &state.version_histories.current().items;
        assert_eq!(
            items,
            &vec![VersionHistoryItem::new(2, 1), VersionHistoryItem::new(3, 11)]
        );
    }

    #[test]
    fn test_replay_preserves_remote_events() {
        let mut source = new_state();
        source.schedule_decision().unwrap();
        let events = source.pending_events.clone();

        let mut replica = MutableState::new(
            WorkflowKey::new("d1", "w1", "r1"),
            "branch-replica".to_string(),
            1,
        );
        for event in &events {
            replica.replay_event(event).unwrap();
        }
        assert_eq!(replica.pending_events, events);
        assert_eq!(replica.next_event_id(), source.next_event_id());
        assert!(replica.has_pending_decision());
    }

    #[test]
    fn test_terminate_closes_and_schedules_cleanup() {
        let mut state = new_state();
        state
            .add_workflow_execution_terminated("operator request", "admin", Duration::days(7))
            .unwrap();
        assert!(!state.is_open());
        assert_eq!(state.execution.close_status, CloseStatus::Terminated);
        assert!(state
            .transfer_tasks
            .iter()
            .any(|t| t.kind == TransferTaskKind::CloseExecution));
        assert!(state
            .timer_tasks
            .iter()
            .any(|t| t.kind == TimerTaskKind::DeleteHistoryEvent));
    }
}

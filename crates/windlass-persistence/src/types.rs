// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Records persisted by the history service.
//!
//! Everything here is plain data: the mutable-state snapshot, history
//! events, the transfer/timer/replication tasks materialized alongside
//! state transitions, and the shard row.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version_history::{VersionHistories, VersionHistoryItem};

/// Identifies one branch in a run's history tree.
pub type BranchToken = String;

/// Identity of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowKey {
    /// Tenant namespace ID.
    pub domain_id: String,
    /// Caller-chosen workflow ID.
    pub workflow_id: String,
    /// Engine-chosen run ID.
    pub run_id: String,
}

impl WorkflowKey {
    /// Build a key.
    pub fn new(
        domain_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            domain_id: domain_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

/// Coarse lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    /// Persisted but not yet running (first decision not scheduled).
    Created,
    /// Open and progressing.
    Running,
    /// A terminal event has been appended.
    Completed,
}

/// How a completed run closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseStatus {
    /// Run is still open.
    None,
    /// Completed successfully.
    Completed,
    /// Failed with an application error.
    Failed,
    /// Canceled cooperatively.
    Canceled,
    /// Terminated without cooperation.
    Terminated,
    /// Closed by continuing as a fresh run.
    ContinuedAsNew,
    /// Hit its execution timeout.
    TimedOut,
}

/// Parent linkage for child workflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentExecutionInfo {
    /// Parent run identity.
    pub parent: WorkflowKey,
    /// Event ID of the parent's StartChildWorkflowInitiated event.
    pub initiated_id: i64,
}

/// Execution metadata of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionInfo {
    /// Run identity.
    pub key: WorkflowKey,
    /// Registered workflow type name.
    pub workflow_type: String,
    /// Task list decisions and activities default to.
    pub task_list: String,
    /// Parent linkage, for child workflows.
    pub parent: Option<ParentExecutionInfo>,
    /// Overall execution timeout in seconds.
    pub execution_timeout_seconds: i32,
    /// Per-decision start-to-close timeout in seconds.
    pub decision_timeout_seconds: i32,
    /// Lifecycle state.
    pub state: WorkflowState,
    /// How the run closed, if it has.
    pub close_status: CloseStatus,
    /// Next event ID to allocate. Event IDs are dense from 1.
    pub next_event_id: i64,
    /// Last event the workflow's decisions have processed.
    pub last_processed_event_id: i64,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// When the run closed.
    pub close_time: Option<DateTime<Utc>>,
    /// Schedule event ID of the outstanding decision, if any.
    pub decision_schedule_id: i64,
    /// Started event ID of the outstanding decision, if started.
    pub decision_started_id: i64,
    /// Attempt counter of the outstanding decision.
    pub decision_attempt: i64,
    /// Branch the run currently appends to.
    pub branch_token: BranchToken,
    /// Latest search attributes, mirrored to visibility on upsert.
    pub search_attributes: HashMap<String, serde_json::Value>,
}

/// Linear replication bookkeeping kept alongside version histories for
/// current-pointer CAS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationState {
    /// Version new events are stamped with.
    pub current_version: i64,
    /// Version the run started under.
    pub start_version: i64,
    /// Version of the last persisted write.
    pub last_write_version: i64,
    /// Event ID of the last persisted write.
    pub last_write_event_id: i64,
    /// Replication task ID of the last emitted batch.
    pub last_event_task_id: i64,
}

/// Pending activity bookkeeping, keyed by its scheduled event ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityInfo {
    /// Scheduled event ID; the activity's key.
    pub schedule_id: i64,
    /// Started event ID, or `EMPTY_EVENT_ID` while queued.
    pub started_id: i64,
    /// Caller-chosen activity ID.
    pub activity_id: String,
    /// Activity type name.
    pub activity_type: String,
    /// Task list the activity dispatches to.
    pub task_list: String,
    /// Timeout from schedule to worker pickup, seconds.
    pub schedule_to_start_seconds: i32,
    /// Timeout from schedule to completion, seconds.
    pub schedule_to_close_seconds: i32,
    /// Timeout from pickup to completion, seconds.
    pub start_to_close_seconds: i32,
    /// Max heartbeat gap, seconds; 0 disables heartbeat timeouts.
    pub heartbeat_seconds: i32,
    /// Attempt counter; bumps on retry and invalidates stale timers.
    pub attempt: i64,
    /// When the activity was scheduled.
    pub scheduled_time: DateTime<Utc>,
    /// Last heartbeat (or start) time.
    pub last_heartbeat_time: DateTime<Utc>,
    /// Failover version of the scheduling write.
    pub version: i64,
}

/// Pending user timer, keyed by its caller-chosen timer ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerInfo {
    /// Caller-chosen timer ID.
    pub timer_id: String,
    /// TimerStarted event ID.
    pub started_event_id: i64,
    /// When the timer fires.
    pub expiry_time: DateTime<Utc>,
    /// Failover version of the starting write.
    pub version: i64,
}

/// Pending child workflow, keyed by its initiated event ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildExecutionInfo {
    /// StartChildWorkflowInitiated event ID; the child's key.
    pub initiated_id: i64,
    /// ChildWorkflowStarted event ID once the child is running.
    pub started_id: i64,
    /// Child's domain.
    pub domain: String,
    /// Child's workflow ID.
    pub workflow_id: String,
    /// Child's run ID once started.
    pub run_id: Option<String>,
    /// Child's workflow type.
    pub workflow_type: String,
    /// Task list the child starts on.
    pub task_list: String,
    /// Failover version of the initiating write.
    pub version: i64,
}

/// Pending external-cancel request, keyed by its initiated event ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCancelInfo {
    /// RequestCancelExternalWorkflowInitiated event ID.
    pub initiated_id: i64,
    /// Target domain ID.
    pub target_domain_id: String,
    /// Target workflow ID.
    pub target_workflow_id: String,
    /// Target run ID; empty targets the current run.
    pub target_run_id: String,
    /// Failover version of the initiating write.
    pub version: i64,
}

/// Pending external-signal request, keyed by its initiated event ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalInfo {
    /// SignalExternalWorkflowInitiated event ID.
    pub initiated_id: i64,
    /// Target domain ID.
    pub target_domain_id: String,
    /// Target workflow ID.
    pub target_workflow_id: String,
    /// Target run ID; empty targets the current run.
    pub target_run_id: String,
    /// Signal name.
    pub signal_name: String,
    /// Signal payload.
    pub input: Option<serde_json::Value>,
    /// Failover version of the initiating write.
    pub version: i64,
}

/// Activity timeout flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutType {
    /// Worker never picked the task up in time.
    ScheduleToStart,
    /// Overall deadline from scheduling.
    ScheduleToClose,
    /// Worker picked it up but did not finish in time.
    StartToClose,
    /// Worker stopped heartbeating.
    Heartbeat,
}

// ============================================================================
// History events
// ============================================================================

/// One append-only history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Dense, monotonic per-run event ID (from 1).
    pub event_id: i64,
    /// Failover version of the writing cluster.
    pub version: i64,
    /// Append wall-clock time.
    pub timestamp: DateTime<Utc>,
    /// Typed payload.
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    /// Short type name used in logs and visibility records.
    pub fn type_name(&self) -> &'static str {
        self.attributes.type_name()
    }
}

/// Typed event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum EventAttributes {
    WorkflowExecutionStarted {
        workflow_type: String,
        task_list: String,
        input: Option<serde_json::Value>,
        execution_timeout_seconds: i32,
        decision_timeout_seconds: i32,
        parent: Option<ParentExecutionInfo>,
        continued_from_run_id: Option<String>,
    },
    WorkflowExecutionCompleted {
        decision_completed_id: i64,
        result: Option<serde_json::Value>,
    },
    WorkflowExecutionFailed {
        decision_completed_id: i64,
        reason: String,
        details: Option<serde_json::Value>,
    },
    WorkflowExecutionCanceled {
        decision_completed_id: i64,
        details: Option<serde_json::Value>,
    },
    WorkflowExecutionTerminated {
        reason: String,
        identity: String,
    },
    WorkflowExecutionTimedOut,
    WorkflowExecutionContinuedAsNew {
        decision_completed_id: i64,
        new_run_id: String,
    },
    WorkflowExecutionCancelRequested {
        cause: String,
        external_initiated_id: Option<i64>,
        identity: String,
    },
    WorkflowExecutionSignaled {
        signal_name: String,
        input: Option<serde_json::Value>,
        identity: String,
    },

    DecisionTaskScheduled {
        task_list: String,
        start_to_close_seconds: i32,
        attempt: i64,
    },
    DecisionTaskStarted {
        schedule_id: i64,
        identity: String,
        request_id: String,
    },
    DecisionTaskCompleted {
        schedule_id: i64,
        started_id: i64,
        identity: String,
    },
    DecisionTaskTimedOut {
        schedule_id: i64,
        started_id: i64,
        timeout_type: TimeoutType,
    },
    DecisionTaskFailed {
        schedule_id: i64,
        started_id: i64,
        cause: String,
    },

    ActivityTaskScheduled {
        decision_completed_id: i64,
        activity_id: String,
        activity_type: String,
        task_list: String,
        input: Option<serde_json::Value>,
        schedule_to_start_seconds: i32,
        schedule_to_close_seconds: i32,
        start_to_close_seconds: i32,
        heartbeat_seconds: i32,
    },
    ActivityTaskStarted {
        schedule_id: i64,
        identity: String,
        request_id: String,
        attempt: i64,
    },
    ActivityTaskCompleted {
        schedule_id: i64,
        started_id: i64,
        result: Option<serde_json::Value>,
        identity: String,
    },
    ActivityTaskFailed {
        schedule_id: i64,
        started_id: i64,
        reason: String,
        details: Option<serde_json::Value>,
    },
    ActivityTaskTimedOut {
        schedule_id: i64,
        started_id: i64,
        timeout_type: TimeoutType,
    },
    ActivityTaskCancelRequested {
        decision_completed_id: i64,
        activity_id: String,
    },
    ActivityTaskCanceled {
        schedule_id: i64,
        started_id: i64,
        details: Option<serde_json::Value>,
    },

    TimerStarted {
        decision_completed_id: i64,
        timer_id: String,
        start_to_fire_seconds: i64,
    },
    TimerFired {
        timer_id: String,
        started_event_id: i64,
    },
    TimerCanceled {
        decision_completed_id: i64,
        timer_id: String,
        started_event_id: i64,
    },

    RequestCancelExternalWorkflowInitiated {
        decision_completed_id: i64,
        domain: String,
        workflow_id: String,
        run_id: String,
    },
    ExternalWorkflowCancelRequested {
        initiated_id: i64,
        domain: String,
        workflow_id: String,
        run_id: String,
    },
    RequestCancelExternalWorkflowFailed {
        initiated_id: i64,
        cause: String,
    },

    SignalExternalWorkflowInitiated {
        decision_completed_id: i64,
        domain: String,
        workflow_id: String,
        run_id: String,
        signal_name: String,
        input: Option<serde_json::Value>,
    },
    ExternalWorkflowSignaled {
        initiated_id: i64,
        domain: String,
        workflow_id: String,
        run_id: String,
    },
    SignalExternalWorkflowFailed {
        initiated_id: i64,
        cause: String,
    },

    StartChildWorkflowInitiated {
        decision_completed_id: i64,
        domain: String,
        workflow_id: String,
        workflow_type: String,
        task_list: String,
        input: Option<serde_json::Value>,
    },
    ChildWorkflowStarted {
        initiated_id: i64,
        domain: String,
        workflow_id: String,
        run_id: String,
    },
    StartChildWorkflowFailed {
        initiated_id: i64,
        cause: String,
    },
    ChildWorkflowCompleted {
        initiated_id: i64,
        started_id: i64,
        result: Option<serde_json::Value>,
    },

    UpsertSearchAttributes {
        decision_completed_id: i64,
        attributes: HashMap<String, serde_json::Value>,
    },
}

impl EventAttributes {
    /// Short type name used in logs and visibility records.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::WorkflowExecutionStarted { .. } => "WorkflowExecutionStarted",
            Self::WorkflowExecutionCompleted { .. } => "WorkflowExecutionCompleted",
            Self::WorkflowExecutionFailed { .. } => "WorkflowExecutionFailed",
            Self::WorkflowExecutionCanceled { .. } => "WorkflowExecutionCanceled",
            Self::WorkflowExecutionTerminated { .. } => "WorkflowExecutionTerminated",
            Self::WorkflowExecutionTimedOut => "WorkflowExecutionTimedOut",
            Self::WorkflowExecutionContinuedAsNew { .. } => "WorkflowExecutionContinuedAsNew",
            Self::WorkflowExecutionCancelRequested { .. } => "WorkflowExecutionCancelRequested",
            Self::WorkflowExecutionSignaled { .. } => "WorkflowExecutionSignaled",
            Self::DecisionTaskScheduled { .. } => "DecisionTaskScheduled",
            Self::DecisionTaskStarted { .. } => "DecisionTaskStarted",
            Self::DecisionTaskCompleted { .. } => "DecisionTaskCompleted",
            Self::DecisionTaskTimedOut { .. } => "DecisionTaskTimedOut",
            Self::DecisionTaskFailed { .. } => "DecisionTaskFailed",
            Self::ActivityTaskScheduled { .. } => "ActivityTaskScheduled",
            Self::ActivityTaskStarted { .. } => "ActivityTaskStarted",
            Self::ActivityTaskCompleted { .. } => "ActivityTaskCompleted",
            Self::ActivityTaskFailed { .. } => "ActivityTaskFailed",
            Self::ActivityTaskTimedOut { .. } => "ActivityTaskTimedOut",
            Self::ActivityTaskCancelRequested { .. } => "ActivityTaskCancelRequested",
            Self::ActivityTaskCanceled { .. } => "ActivityTaskCanceled",
            Self::TimerStarted { .. } => "TimerStarted",
            Self::TimerFired { .. } => "TimerFired",
            Self::TimerCanceled { .. } => "TimerCanceled",
            Self::RequestCancelExternalWorkflowInitiated { .. } => {
                "RequestCancelExternalWorkflowInitiated"
            }
            Self::ExternalWorkflowCancelRequested { .. } => "ExternalWorkflowCancelRequested",
            Self::RequestCancelExternalWorkflowFailed { .. } => {
                "RequestCancelExternalWorkflowFailed"
            }
            Self::SignalExternalWorkflowInitiated { .. } => "SignalExternalWorkflowInitiated",
            Self::ExternalWorkflowSignaled { .. } => "ExternalWorkflowSignaled",
            Self::SignalExternalWorkflowFailed { .. } => "SignalExternalWorkflowFailed",
            Self::StartChildWorkflowInitiated { .. } => "StartChildWorkflowInitiated",
            Self::ChildWorkflowStarted { .. } => "ChildWorkflowStarted",
            Self::StartChildWorkflowFailed { .. } => "StartChildWorkflowFailed",
            Self::ChildWorkflowCompleted { .. } => "ChildWorkflowCompleted",
            Self::UpsertSearchAttributes { .. } => "UpsertSearchAttributes",
        }
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Intent to perform a side effect, produced atomically with a state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    /// Shard-monotonic task ID; enqueue and processing order.
    pub task_id: i64,
    /// Owning domain.
    pub domain_id: String,
    /// Owning workflow.
    pub workflow_id: String,
    /// Owning run.
    pub run_id: String,
    /// When the producing transition happened.
    pub visibility_timestamp: DateTime<Utc>,
    /// Failover version of the producing write.
    pub version: i64,
    /// What side effect to perform.
    pub kind: TransferTaskKind,
}

/// Transfer task flavors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferTaskKind {
    /// Dispatch an activity to matching.
    Activity {
        /// Task list to dispatch to.
        task_list: String,
        /// ActivityTaskScheduled event ID.
        schedule_id: i64,
    },
    /// Dispatch a decision to matching.
    Decision {
        /// Task list to dispatch to.
        task_list: String,
        /// DecisionTaskScheduled event ID.
        schedule_id: i64,
    },
    /// Record visibility, notify the parent, purge timers for a closed run.
    CloseExecution,
    /// Deliver a cancel request to an external workflow.
    CancelExecution {
        /// Target domain ID.
        target_domain_id: String,
        /// Target workflow ID.
        target_workflow_id: String,
        /// Target run ID; empty targets the current run.
        target_run_id: String,
        /// Initiated event ID in the source run.
        initiated_id: i64,
    },
    /// Deliver a signal to an external workflow.
    SignalExecution {
        /// Target domain ID.
        target_domain_id: String,
        /// Target workflow ID.
        target_workflow_id: String,
        /// Target run ID; empty targets the current run.
        target_run_id: String,
        /// Initiated event ID in the source run.
        initiated_id: i64,
    },
    /// Start a child workflow.
    StartChildExecution {
        /// Child domain ID.
        target_domain_id: String,
        /// Child workflow ID.
        target_workflow_id: String,
        /// Initiated event ID in the parent run.
        initiated_id: i64,
    },
    /// Record the started execution in visibility.
    RecordWorkflowStarted,
    /// Push updated search attributes to visibility.
    UpsertSearchAttributes,
    /// Re-drive a reset run's outstanding work.
    ResetWorkflow,
}

impl TransferTaskKind {
    /// The scheduled/initiated event ID this task references, if any.
    pub fn schedule_id(&self) -> Option<i64> {
        match self {
            Self::Activity { schedule_id, .. } | Self::Decision { schedule_id, .. } => {
                Some(*schedule_id)
            }
            Self::CancelExecution { initiated_id, .. }
            | Self::SignalExecution { initiated_id, .. }
            | Self::StartChildExecution { initiated_id, .. } => Some(*initiated_id),
            _ => None,
        }
    }
}

/// Intent to fire a timeout at a future timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerTask {
    /// When the timer is due; primary sort key.
    pub visibility_timestamp: DateTime<Utc>,
    /// Shard-monotonic tiebreaker.
    pub task_id: i64,
    /// Owning domain.
    pub domain_id: String,
    /// Owning workflow.
    pub workflow_id: String,
    /// Owning run.
    pub run_id: String,
    /// Failover version of the producing write.
    pub version: i64,
    /// What to do when it fires.
    pub kind: TimerTaskKind,
}

/// Timer task flavors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerTaskKind {
    /// An outstanding decision exceeded its start-to-close timeout.
    DecisionTimeout {
        /// DecisionTaskScheduled event ID.
        schedule_id: i64,
        /// Attempt the timer was armed for.
        attempt: i64,
    },
    /// An activity exceeded one of its timeouts.
    ActivityTimeout {
        /// ActivityTaskScheduled event ID.
        schedule_id: i64,
        /// Which timeout fired.
        timeout_type: TimeoutType,
        /// Attempt the timer was armed for.
        attempt: i64,
    },
    /// A user timer came due.
    UserTimer {
        /// Caller-chosen timer ID.
        timer_id: String,
    },
    /// The run exceeded its execution timeout.
    WorkflowTimeout,
    /// Retention elapsed; delete the closed run's history.
    DeleteHistoryEvent,
}

/// Replication work emitted by a mutable-state transaction in a global
/// domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationTask {
    /// Shard-monotonic task ID.
    pub task_id: i64,
    /// Owning domain.
    pub domain_id: String,
    /// Owning workflow.
    pub workflow_id: String,
    /// Owning run.
    pub run_id: String,
    /// First event of the attached batch.
    pub first_event_id: i64,
    /// One past the last event of the attached batch.
    pub next_event_id: i64,
    /// Failover version of the batch.
    pub version: i64,
    /// The events to ship.
    pub events: Vec<HistoryEvent>,
    /// The emitting run's current version-history branch.
    pub version_history: Vec<VersionHistoryItem>,
}

/// A replication batch as delivered by the transport's ordered
/// per-source-cluster stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationBatch {
    /// Cluster that produced the batch.
    pub source_cluster: String,
    /// Owning domain.
    pub domain_id: String,
    /// Owning workflow.
    pub workflow_id: String,
    /// Owning run.
    pub run_id: String,
    /// First event in `events`.
    pub first_event_id: i64,
    /// One past the last event in `events`.
    pub next_event_id: i64,
    /// The events.
    pub events: Vec<HistoryEvent>,
    /// The producing run's version-history branch at emission time.
    pub version_history: Vec<VersionHistoryItem>,
}

// ============================================================================
// Shard and transaction envelopes
// ============================================================================

/// Persisted shard row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Shard number.
    pub shard_id: i32,
    /// Fencing token; bumped on every acquisition.
    pub range_id: i64,
    /// Transfer tasks at or below this ID are fully processed.
    pub transfer_ack_level: i64,
    /// Timers before this timestamp are fully processed.
    pub timer_ack_level: DateTime<Utc>,
    /// Per-cluster transfer ack levels (standby processors).
    pub cluster_transfer_ack_level: HashMap<String, i64>,
    /// Per-cluster timer ack levels (standby processors).
    pub cluster_timer_ack_level: HashMap<String, DateTime<Utc>>,
    /// Observed current time per remote cluster, learned from replication
    /// traffic. Gates standby task processing.
    pub standby_cluster_current_time: HashMap<String, DateTime<Utc>>,
}

impl ShardInfo {
    /// A fresh shard row at range 0.
    pub fn new(shard_id: i32) -> Self {
        Self {
            shard_id,
            range_id: 0,
            transfer_ack_level: 0,
            timer_ack_level: DateTime::<Utc>::MIN_UTC,
            cluster_transfer_ack_level: HashMap::new(),
            cluster_timer_ack_level: HashMap::new(),
            standby_cluster_current_time: HashMap::new(),
        }
    }
}

/// Range-ID stamp carried by every in-shard write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardCondition {
    /// The writing shard.
    pub shard_id: i32,
    /// The writer's view of the range ID.
    pub range_id: i64,
}

/// How a create interacts with the current-run pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateWorkflowMode {
    /// No current run may exist (or only a closed one); pointer set to the
    /// new run.
    BrandNew,
    /// The previous run just closed as continued-as-new; pointer CAS'd from
    /// it to the new run.
    ContinueAsNew {
        /// Run the pointer must currently reference.
        previous_run_id: String,
    },
    /// Replicated run that is not current locally; pointer untouched.
    Zombie,
}

/// How an update interacts with the current-run pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateWorkflowMode {
    /// Target must be the current run; pointer advanced under CAS.
    UpdateCurrent,
    /// Target must not be the current run; pointer untouched.
    BypassCurrent,
    /// Replication of an older branch; pointer not consulted.
    IgnoreCurrent,
}

/// Expected values for the current-run pointer CAS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentWorkflowCas {
    /// Run the pointer must currently reference.
    pub run_id: String,
    /// Last write version the pointer must currently carry.
    pub last_write_version: i64,
}

/// The current-run pointer row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentExecution {
    /// Run the pointer references.
    pub run_id: String,
    /// That run's lifecycle state.
    pub state: WorkflowState,
    /// That run's close status.
    pub close_status: CloseStatus,
    /// Failover version of the run's last write.
    pub last_write_version: i64,
}

/// Full mutable-state snapshot of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Execution metadata.
    pub execution: WorkflowExecutionInfo,
    /// Linear replication bookkeeping.
    pub replication_state: ReplicationState,
    /// Branch set used for conflict resolution.
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
    /// Events buffered behind an in-flight decision.
    pub buffered_events: Vec<HistoryEvent>,
}

/// One atomic mutable-state write: the snapshot plus the tasks the
/// transition produced. Tasks are never visible without the state change.
#[derive(Debug, Clone)]
pub struct WorkflowTransaction {
    /// Post-transition snapshot.
    pub snapshot: WorkflowSnapshot,
    /// `next_event_id` the write conditions on (pre-transition value).
    pub condition: i64,
    /// Transfer tasks produced by this transition.
    pub transfer_tasks: Vec<TransferTask>,
    /// Timer tasks produced by this transition.
    pub timer_tasks: Vec<TimerTask>,
    /// Replication tasks produced by this transition.
    pub replication_tasks: Vec<ReplicationTask>,
}

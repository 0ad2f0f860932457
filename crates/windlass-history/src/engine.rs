// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The history engine: per-shard API surface over the mutable-state layer.
//!
//! Each operation acquires the run's context from the history cache,
//! mutates state under its lock, and persists the transaction. Writes that
//! lose the conditional update reload and retry up to the configured
//! attempt cap; `ShardOwnershipLost` aborts immediately.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use windlass_common::cluster::ClusterMetadata;
use windlass_common::domain::{DomainCache, DomainEntry};
use windlass_common::error::{EngineError, Result};
use windlass_persistence::{
    CreateWorkflowMode, ExecutionStore, HistoryEvent, HistoryStore, UpdateWorkflowMode,
    WorkflowKey,
};

use crate::cache::{EventCache, HistoryCache};
use crate::mutable_state::{ActivityParams, MutableState, StartWorkflowParams, TransactionPolicy};
use crate::ndc::NdcTransactionManager;
use crate::shard::ShardContext;

/// A workflow decision produced by a completed decision task.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Schedule an activity.
    ScheduleActivity(ActivityParams),
    /// Start a user timer.
    StartTimer {
        /// Caller-chosen timer ID.
        timer_id: String,
        /// Seconds until the timer fires.
        fire_seconds: i64,
    },
    /// Cancel a user timer.
    CancelTimer {
        /// Timer to cancel.
        timer_id: String,
    },
    /// Close the run as completed.
    CompleteWorkflow {
        /// Workflow result.
        result: Option<Value>,
    },
    /// Close the run as failed.
    FailWorkflow {
        /// Failure reason.
        reason: String,
        /// Failure details.
        details: Option<Value>,
    },
    /// Close the run as canceled (responding to a cancel request).
    CancelWorkflow {
        /// Cancellation details.
        details: Option<Value>,
    },
    /// Close this run and start a fresh one under the same workflow ID.
    ContinueAsNewWorkflow {
        /// Input for the successor run.
        input: Option<Value>,
    },
    /// Request cancellation of an external workflow.
    RequestCancelExternal {
        /// Target domain ID.
        domain_id: String,
        /// Target workflow ID.
        workflow_id: String,
        /// Target run ID; empty targets the current run.
        run_id: String,
    },
    /// Signal an external workflow.
    SignalExternal {
        /// Target domain ID.
        domain_id: String,
        /// Target workflow ID.
        workflow_id: String,
        /// Target run ID; empty targets the current run.
        run_id: String,
        /// Signal name.
        signal_name: String,
        /// Signal payload.
        input: Option<Value>,
    },
    /// Start a child workflow.
    StartChildWorkflow {
        /// Child domain ID.
        domain_id: String,
        /// Child workflow ID.
        workflow_id: String,
        /// Child workflow type.
        workflow_type: String,
        /// Child task list.
        task_list: String,
        /// Child input.
        input: Option<Value>,
    },
    /// Push updated search attributes to visibility.
    UpsertSearchAttributes {
        /// The attributes.
        attributes: HashMap<String, Value>,
    },
}

/// Request to start a workflow execution.
#[derive(Debug, Clone)]
pub struct StartWorkflowRequest {
    /// Domain ID.
    pub domain_id: String,
    /// Caller-chosen workflow ID.
    pub workflow_id: String,
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
}

/// Builder for a [`HistoryEngine`].
#[derive(Default)]
pub struct HistoryEngineBuilder {
    shard: Option<Arc<ShardContext>>,
    execution_store: Option<Arc<dyn ExecutionStore>>,
    history_store: Option<Arc<dyn HistoryStore>>,
    domain_cache: Option<Arc<DomainCache>>,
    cluster_metadata: Option<Arc<ClusterMetadata>>,
}

impl HistoryEngineBuilder {
    /// Set the owning shard (required).
    pub fn shard(mut self, shard: Arc<ShardContext>) -> Self {
        self.shard = Some(shard);
        self
    }

    /// Set the execution store (required).
    pub fn execution_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.execution_store = Some(store);
        self
    }

    /// Set the history store (required).
    pub fn history_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history_store = Some(store);
        self
    }

    /// Set the domain cache (required).
    pub fn domain_cache(mut self, cache: Arc<DomainCache>) -> Self {
        self.domain_cache = Some(cache);
        self
    }

    /// Override the cluster metadata. Defaults to the shard's.
    pub fn cluster_metadata(mut self, metadata: Arc<ClusterMetadata>) -> Self {
        self.cluster_metadata = Some(metadata);
        self
    }

    /// Build the engine. Cluster metadata defaults to the shard's.
    pub fn build(self) -> anyhow::Result<Arc<HistoryEngine>> {
        let shard = self.shard.ok_or_else(|| anyhow::anyhow!("shard is required"))?;
        let execution_store = self
            .execution_store
            .ok_or_else(|| anyhow::anyhow!("execution_store is required"))?;
        let history_store = self
            .history_store
            .ok_or_else(|| anyhow::anyhow!("history_store is required"))?;
        let domain_cache = self
            .domain_cache
            .ok_or_else(|| anyhow::anyhow!("domain_cache is required"))?;
        let cluster_metadata = self
            .cluster_metadata
            .unwrap_or_else(|| shard.cluster_metadata().clone());

        let history_cache =
            HistoryCache::new(shard.clone(), execution_store.clone(), history_store.clone());
        let event_cache = Arc::new(EventCache::new(shard.config().event_cache_size));
        let ndc = Arc::new(NdcTransactionManager::new(
            shard.clone(),
            history_cache.clone(),
            execution_store.clone(),
            history_store.clone(),
        ));

        let engine = Arc::new(HistoryEngine {
            shard,
            execution_store,
            history_store,
            domain_cache,
            cluster_metadata,
            history_cache,
            event_cache,
            ndc,
        });
        engine.shard.set_engine(engine.clone());
        Ok(engine)
    }
}

/// Per-shard history engine.
pub struct HistoryEngine {
    shard: Arc<ShardContext>,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    domain_cache: Arc<DomainCache>,
    cluster_metadata: Arc<ClusterMetadata>,
    history_cache: Arc<HistoryCache>,
    event_cache: Arc<EventCache>,
    ndc: Arc<NdcTransactionManager>,
}

impl HistoryEngine {
    /// Create a builder.
    pub fn builder() -> HistoryEngineBuilder {
        HistoryEngineBuilder::default()
    }

    /// The owning shard.
    pub fn shard(&self) -> &Arc<ShardContext> {
        &self.shard
    }

    /// The per-shard workflow context cache.
    pub fn history_cache(&self) -> &Arc<HistoryCache> {
        &self.history_cache
    }

    /// The per-shard event cache.
    pub fn event_cache(&self) -> &Arc<EventCache> {
        &self.event_cache
    }

    /// The domain cache.
    pub fn domain_cache(&self) -> &Arc<DomainCache> {
        &self.domain_cache
    }

    /// The execution store.
    pub fn execution_store(&self) -> &Arc<dyn ExecutionStore> {
        &self.execution_store
    }

    /// The history store.
    pub fn history_store(&self) -> &Arc<dyn HistoryStore> {
        &self.history_store
    }

    /// The nDC transaction manager.
    pub fn ndc(&self) -> &Arc<NdcTransactionManager> {
        &self.ndc
    }

    fn ensure_domain_active(&self, domain: &DomainEntry) -> Result<()> {
        let current = self.cluster_metadata.current_cluster_name();
        if !domain.is_active_in(current) {
            return Err(EngineError::DomainNotActive {
                domain: domain.name.clone(),
                current_cluster: current.to_string(),
                active_cluster: domain.replication.active_cluster.clone(),
            });
        }
        Ok(())
    }

    fn retention(domain: &DomainEntry) -> Duration {
        Duration::days(domain.retention_days as i64)
    }

    /// Resolve the current run of `(domain_id, workflow_id)`.
    async fn current_run(&self, domain_id: &str, workflow_id: &str) -> Result<WorkflowKey> {
        let current = self
            .execution_store
            .get_current_execution(domain_id, workflow_id)
            .await?
            .ok_or_else(|| EngineError::EntityNotExists {
                entity: format!("workflow '{}'", workflow_id),
            })?;
        Ok(WorkflowKey::new(domain_id, workflow_id, current.run_id))
    }

    /// Acquire, load, mutate, and persist one run under the bounded
    /// conditional-update retry loop.
    ///
    /// The mutator returns whether anything changed; a `false` skips the
    /// persistence write entirely (stale timers, duplicate deliveries).
    async fn update_workflow_execution<F>(
        &self,
        key: &WorkflowKey,
        domain: &DomainEntry,
        mutator: F,
    ) -> Result<()>
    where
        F: Fn(&mut MutableState) -> Result<bool>,
    {
        let max_attempts = self.shard.config().mutable_state_update_max_attempts;
        let mut attempt = 0;
        loop {
            let mut guard = self.history_cache.acquire(key.clone()).await?;
            let result: Result<bool> = async {
                let state = guard.load().await?;
                state.update_current_version(domain.write_version())?;
                mutator(state)
            }
            .await;
            match result {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(err) => {
                    guard.poison();
                    return Err(err);
                }
            }
            match guard
                .update_workflow_execution(UpdateWorkflowMode::UpdateCurrent, TransactionPolicy::Active)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) if matches!(err, EngineError::ConditionalUpdateFailed { .. }) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        warn!(
                            run_id = %key.run_id,
                            attempts = attempt,
                            "Conditional update retries exhausted"
                        );
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    // ========================================================================
    // Workflow lifecycle operations
    // ========================================================================

    /// Start a workflow execution. Returns the new run ID.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn start_workflow_execution(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<String> {
        let domain = self.domain_cache.get_domain_by_id(&request.domain_id).await?;
        self.ensure_domain_active(&domain)?;

        let run_id = Uuid::new_v4().to_string();
        let branch_token = Uuid::new_v4().to_string();
        let key = WorkflowKey::new(&request.domain_id, &request.workflow_id, &run_id);

        let mut guard = self.history_cache.acquire(key.clone()).await?;
        let result: Result<()> = async {
            let mut state = MutableState::new(key.clone(), branch_token, domain.write_version());
            state.add_workflow_execution_started(StartWorkflowParams {
                workflow_type: request.workflow_type.clone(),
                task_list: request.task_list.clone(),
                input: request.input.clone(),
                execution_timeout_seconds: request.execution_timeout_seconds,
                decision_timeout_seconds: request.decision_timeout_seconds,
                parent: None,
                continued_from_run_id: None,
            })?;
            state.schedule_decision()?;
            guard.set_mutable_state(state);
            guard
                .create_workflow_execution(CreateWorkflowMode::BrandNew, TransactionPolicy::Active)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                info!(run_id = %run_id, "Workflow started");
                Ok(run_id)
            }
            Err(err) => {
                guard.poison();
                Err(err)
            }
        }
    }

    /// Deliver a signal to the current run.
    #[instrument(skip(self, input))]
    pub async fn signal_workflow_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
        signal_name: &str,
        input: Option<Value>,
        identity: &str,
    ) -> Result<()> {
        let domain = self.domain_cache.get_domain_by_id(domain_id).await?;
        self.ensure_domain_active(&domain)?;
        let key = self.current_run(domain_id, workflow_id).await?;

        self.update_workflow_execution(&key, &domain, |state| {
            state.add_signal_event(signal_name, input.clone(), identity)?;
            if !state.has_pending_decision() {
                state.schedule_decision()?;
            }
            Ok(true)
        })
        .await
    }

    /// Record a cancellation request against the current run.
    #[instrument(skip(self))]
    pub async fn request_cancel_workflow_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
        cause: &str,
        identity: &str,
    ) -> Result<()> {
        let domain = self.domain_cache.get_domain_by_id(domain_id).await?;
        self.ensure_domain_active(&domain)?;
        let key = self.current_run(domain_id, workflow_id).await?;

        self.update_workflow_execution(&key, &domain, |state| {
            state.add_cancel_requested(cause, identity, None)?;
            if !state.has_pending_decision() {
                state.schedule_decision()?;
            }
            Ok(true)
        })
        .await
    }

    /// Terminate the current run without worker cooperation.
    #[instrument(skip(self))]
    pub async fn terminate_workflow_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
        reason: &str,
        identity: &str,
    ) -> Result<()> {
        let domain = self.domain_cache.get_domain_by_id(domain_id).await?;
        self.ensure_domain_active(&domain)?;
        let key = self.current_run(domain_id, workflow_id).await?;
        let retention = Self::retention(&domain);

        self.update_workflow_execution(&key, &domain, |state| {
            state.add_workflow_execution_terminated(reason, identity, retention)?;
            Ok(true)
        })
        .await
    }

    // ========================================================================
    // Decision tasks
    // ========================================================================

    /// Record decision pickup (called by matching on dispatch).
    #[instrument(skip(self))]
    pub async fn record_decision_task_started(
        &self,
        key: &WorkflowKey,
        schedule_id: i64,
        identity: &str,
        request_id: &str,
    ) -> Result<i64> {
        let domain = self.domain_cache.get_domain_by_id(&key.domain_id).await?;
        self.ensure_domain_active(&domain)?;

        let started_id = std::sync::Mutex::new(0);
        self.update_workflow_execution(key, &domain, |state| {
            let event = state.add_decision_task_started(schedule_id, identity, request_id)?;
            *started_id.lock().expect("no poisoning") = event.event_id;
            Ok(true)
        })
        .await?;
        Ok(started_id.into_inner().expect("no poisoning"))
    }

    /// Complete a decision task, applying its decisions.
    #[instrument(skip(self, decisions), fields(run_id = %key.run_id))]
    pub async fn respond_decision_task_completed(
        &self,
        key: &WorkflowKey,
        schedule_id: i64,
        started_id: i64,
        identity: &str,
        decisions: Vec<Decision>,
    ) -> Result<()> {
        let domain = self.domain_cache.get_domain_by_id(&key.domain_id).await?;
        self.ensure_domain_active(&domain)?;
        let retention = Self::retention(&domain);

        // continue-as-new closes this run and creates the successor; the
        // successor is created after the closing update commits
        let continue_as_new: std::sync::Mutex<Option<(String, Option<Value>)>> =
            std::sync::Mutex::new(None);

        self.update_workflow_execution(key, &domain, |state| {
            let (completed_id, had_buffered) =
                state.add_decision_task_completed(schedule_id, started_id, identity)?;

            for decision in &decisions {
                match decision.clone() {
                    Decision::ScheduleActivity(params) => {
                        state.add_activity_task_scheduled(completed_id, params)?;
                    }
                    Decision::StartTimer {
                        timer_id,
                        fire_seconds,
                    } => {
                        state.add_timer_started(completed_id, timer_id, fire_seconds)?;
                    }
                    Decision::CancelTimer { timer_id } => {
                        state.add_timer_canceled(completed_id, &timer_id)?;
                    }
                    Decision::CompleteWorkflow { result } => {
                        state.add_workflow_execution_completed(completed_id, result, retention)?;
                    }
                    Decision::FailWorkflow { reason, details } => {
                        state.add_workflow_execution_failed(
                            completed_id,
                            reason,
                            details,
                            retention,
                        )?;
                    }
                    Decision::CancelWorkflow { details } => {
                        state.add_workflow_execution_canceled(completed_id, details, retention)?;
                    }
                    Decision::ContinueAsNewWorkflow { input } => {
                        let new_run_id = Uuid::new_v4().to_string();
                        state.add_workflow_execution_continued_as_new(
                            completed_id,
                            &new_run_id,
                            retention,
                        )?;
                        *continue_as_new.lock().expect("no poisoning") =
                            Some((new_run_id, input));
                    }
                    Decision::RequestCancelExternal {
                        domain_id,
                        workflow_id,
                        run_id,
                    } => {
                        state.add_request_cancel_external_initiated(
                            completed_id,
                            domain_id,
                            workflow_id,
                            run_id,
                        )?;
                    }
                    Decision::SignalExternal {
                        domain_id,
                        workflow_id,
                        run_id,
                        signal_name,
                        input,
                    } => {
                        state.add_signal_external_initiated(
                            completed_id,
                            domain_id,
                            workflow_id,
                            run_id,
                            signal_name,
                            input,
                        )?;
                    }
                    Decision::StartChildWorkflow {
                        domain_id,
                        workflow_id,
                        workflow_type,
                        task_list,
                        input,
                    } => {
                        state.add_child_workflow_initiated(
                            completed_id,
                            domain_id,
                            workflow_id,
                            workflow_type,
                            task_list,
                            input,
                        )?;
                    }
                    Decision::UpsertSearchAttributes { attributes } => {
                        state.add_upsert_search_attributes(completed_id, attributes)?;
                    }
                }
            }

            // work arrived while the decision ran; give the worker another
            // decision to process it
            if had_buffered && state.is_open() && !state.has_pending_decision() {
                state.schedule_decision()?;
            }
            Ok(true)
        })
        .await?;

        let successor = continue_as_new.into_inner().expect("no poisoning");
        if let Some((new_run_id, input)) = successor {
            self.start_continued_run(key, &domain, new_run_id, input).await?;
        }
        Ok(())
    }

    /// Create the successor run of a continued-as-new close.
    async fn start_continued_run(
        &self,
        previous: &WorkflowKey,
        domain: &DomainEntry,
        new_run_id: String,
        input: Option<Value>,
    ) -> Result<()> {
        // the closing run's metadata seeds the successor
        let snapshot = self
            .execution_store
            .get_workflow(&previous.domain_id, &previous.workflow_id, &previous.run_id)
            .await?
            .ok_or_else(|| EngineError::EntityNotExists {
                entity: format!("continued run '{}'", previous.run_id),
            })?;

        let key = WorkflowKey::new(&previous.domain_id, &previous.workflow_id, &new_run_id);
        let branch_token = Uuid::new_v4().to_string();
        let mut guard = self.history_cache.acquire(key.clone()).await?;
        let result: Result<()> = async {
            let mut state = MutableState::new(key.clone(), branch_token, domain.write_version());
            state.add_workflow_execution_started(StartWorkflowParams {
                workflow_type: snapshot.execution.workflow_type.clone(),
                task_list: snapshot.execution.task_list.clone(),
                input,
                execution_timeout_seconds: snapshot.execution.execution_timeout_seconds,
                decision_timeout_seconds: snapshot.execution.decision_timeout_seconds,
                parent: None,
                continued_from_run_id: Some(previous.run_id.clone()),
            })?;
            state.schedule_decision()?;
            guard.set_mutable_state(state);
            guard
                .create_workflow_execution(
                    CreateWorkflowMode::ContinueAsNew {
                        previous_run_id: previous.run_id.clone(),
                    },
                    TransactionPolicy::Active,
                )
                .await
        }
        .await;
        if result.is_err() {
            guard.poison();
        }
        result
    }

    // ========================================================================
    // Activity tasks
    // ========================================================================

    /// Record activity pickup (called by matching on dispatch).
    #[instrument(skip(self))]
    pub async fn record_activity_task_started(
        &self,
        key: &WorkflowKey,
        schedule_id: i64,
        identity: &str,
        request_id: &str,
    ) -> Result<()> {
        let domain = self.domain_cache.get_domain_by_id(&key.domain_id).await?;
        self.ensure_domain_active(&domain)?;

        self.update_workflow_execution(key, &domain, |state| {
            state.add_activity_task_started(schedule_id, identity, request_id)?;
            Ok(true)
        })
        .await
    }

    /// Complete an activity.
    #[instrument(skip(self, result), fields(run_id = %key.run_id))]
    pub async fn respond_activity_task_completed(
        &self,
        key: &WorkflowKey,
        schedule_id: i64,
        result: Option<Value>,
        identity: &str,
    ) -> Result<()> {
        let domain = self.domain_cache.get_domain_by_id(&key.domain_id).await?;
        self.ensure_domain_active(&domain)?;

        self.update_workflow_execution(key, &domain, |state| {
            state.add_activity_task_completed(schedule_id, result.clone(), identity)?;
            if !state.has_pending_decision() {
                state.schedule_decision()?;
            }
            Ok(true)
        })
        .await
    }

    /// Fail an activity.
    #[instrument(skip(self, details), fields(run_id = %key.run_id))]
    pub async fn respond_activity_task_failed(
        &self,
        key: &WorkflowKey,
        schedule_id: i64,
        reason: &str,
        details: Option<Value>,
    ) -> Result<()> {
        let domain = self.domain_cache.get_domain_by_id(&key.domain_id).await?;
        self.ensure_domain_active(&domain)?;

        self.update_workflow_execution(key, &domain, |state| {
            state.add_activity_task_failed(schedule_id, reason, details.clone())?;
            if !state.has_pending_decision() {
                state.schedule_decision()?;
            }
            Ok(true)
        })
        .await
    }

    /// Record an activity heartbeat.
    #[instrument(skip(self))]
    pub async fn record_activity_heartbeat(
        &self,
        key: &WorkflowKey,
        schedule_id: i64,
    ) -> Result<()> {
        let domain = self.domain_cache.get_domain_by_id(&key.domain_id).await?;
        self.ensure_domain_active(&domain)?;

        self.update_workflow_execution(key, &domain, |state| {
            state.record_activity_heartbeat(schedule_id)?;
            Ok(true)
        })
        .await
    }

    /// Read one history event through the per-shard event cache.
    pub async fn get_history_event(
        &self,
        key: &WorkflowKey,
        event_id: i64,
    ) -> Result<HistoryEvent> {
        if let Some(event) = self.event_cache.get(&key.run_id, event_id) {
            return Ok(event);
        }
        let snapshot = self
            .execution_store
            .get_workflow(&key.domain_id, &key.workflow_id, &key.run_id)
            .await?
            .ok_or_else(|| EngineError::EntityNotExists {
                entity: format!("workflow run '{}'", key.run_id),
            })?;
        let event = self
            .history_store
            .read_history_events(&snapshot.execution.branch_token, event_id, event_id + 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::EntityNotExists {
                entity: format!("event {} of run '{}'", event_id, key.run_id),
            })?;
        self.event_cache.put(&key.run_id, event.clone());
        Ok(event)
    }

    // ========================================================================
    // Timer firing (invoked by the active timer queue)
    // ========================================================================

    /// Fire a user timer. Stale timers (canceled, already fired) are a
    /// no-op.
    pub async fn fire_user_timer(&self, key: &WorkflowKey, timer_id: &str) -> Result<()> {
        let domain = self.domain_cache.get_domain_by_id(&key.domain_id).await?;
        self.update_workflow_execution(key, &domain, |state| {
            if !state.is_open() {
                return Ok(false);
            }
            if !state.add_timer_fired(timer_id)? {
                return Ok(false);
            }
            if !state.has_pending_decision() {
                state.schedule_decision()?;
            }
            Ok(true)
        })
        .await
    }

    /// Apply an activity timeout armed at `attempt`. Stale timers are a
    /// no-op.
    pub async fn timeout_activity(
        &self,
        key: &WorkflowKey,
        schedule_id: i64,
        timeout_type: windlass_persistence::TimeoutType,
        attempt: i64,
    ) -> Result<()> {
        let domain = self.domain_cache.get_domain_by_id(&key.domain_id).await?;
        self.update_workflow_execution(key, &domain, |state| {
            if !state.is_open() {
                return Ok(false);
            }
            if !state.timeout_activity_task(schedule_id, timeout_type, attempt)? {
                return Ok(false);
            }
            if !state.has_pending_decision() {
                state.schedule_decision()?;
            }
            Ok(true)
        })
        .await
    }

    /// Apply a decision start-to-close timeout, rescheduling at the next
    /// attempt.
    pub async fn timeout_decision(
        &self,
        key: &WorkflowKey,
        schedule_id: i64,
        attempt: i64,
    ) -> Result<()> {
        let domain = self.domain_cache.get_domain_by_id(&key.domain_id).await?;
        self.update_workflow_execution(key, &domain, |state| {
            if !state.is_open() {
                return Ok(false);
            }
            state.timeout_decision_task(schedule_id, attempt)
        })
        .await
    }

    /// Time the whole run out.
    pub async fn timeout_workflow(&self, key: &WorkflowKey) -> Result<()> {
        let domain = self.domain_cache.get_domain_by_id(&key.domain_id).await?;
        let retention = Self::retention(&domain);
        self.update_workflow_execution(key, &domain, |state| {
            if !state.is_open() {
                return Ok(false);
            }
            state.add_workflow_execution_timed_out(retention)?;
            Ok(true)
        })
        .await
    }

    // ========================================================================
    // Cross-workflow results (invoked by transfer-task side effects)
    // ========================================================================

    /// Record the outcome of an external cancel request on its source run.
    pub async fn record_external_cancel_result(
        &self,
        key: &WorkflowKey,
        initiated_id: i64,
        delivered: bool,
    ) -> Result<()> {
        let domain = self.domain_cache.get_domain_by_id(&key.domain_id).await?;
        self.update_workflow_execution(key, &domain, |state| {
            let changed = if delivered {
                state.record_external_cancel_delivered(initiated_id)?
            } else {
                state.record_external_cancel_failed(initiated_id, "workflow not found")?
            };
            if changed && state.is_open() && !state.has_pending_decision() {
                state.schedule_decision()?;
            }
            Ok(changed)
        })
        .await
    }

    /// Record the outcome of an external signal on its source run.
    pub async fn record_external_signal_result(
        &self,
        key: &WorkflowKey,
        initiated_id: i64,
        delivered: bool,
    ) -> Result<()> {
        let domain = self.domain_cache.get_domain_by_id(&key.domain_id).await?;
        self.update_workflow_execution(key, &domain, |state| {
            let changed = if delivered {
                state.record_external_signal_delivered(initiated_id)?
            } else {
                state.record_external_signal_failed(initiated_id, "workflow not found")?
            };
            if changed && state.is_open() && !state.has_pending_decision() {
                state.schedule_decision()?;
            }
            Ok(changed)
        })
        .await
    }

    /// Record a child workflow's start outcome on its parent.
    pub async fn record_child_started(
        &self,
        parent: &WorkflowKey,
        initiated_id: i64,
        child_run_id: Option<&str>,
    ) -> Result<()> {
        let domain = self.domain_cache.get_domain_by_id(&parent.domain_id).await?;
        self.update_workflow_execution(parent, &domain, |state| {
            let changed = match child_run_id {
                Some(run_id) => state.record_child_started(initiated_id, run_id)?,
                None => state.record_child_start_failed(initiated_id, "start failed")?,
            };
            Ok(changed)
        })
        .await
    }

    /// Re-drive a reset run by scheduling a fresh decision.
    pub async fn schedule_decision_for_reset(&self, key: &WorkflowKey) -> Result<()> {
        let domain = self.domain_cache.get_domain_by_id(&key.domain_id).await?;
        self.update_workflow_execution(key, &domain, |state| {
            if !state.is_open() || state.has_pending_decision() {
                return Ok(false);
            }
            state.schedule_decision()?;
            Ok(true)
        })
        .await
    }

    /// Record a child workflow's close on its parent.
    pub async fn record_child_workflow_completed(
        &self,
        parent: &WorkflowKey,
        initiated_id: i64,
        result: Option<Value>,
    ) -> Result<()> {
        let domain = self.domain_cache.get_domain_by_id(&parent.domain_id).await?;
        self.update_workflow_execution(parent, &domain, |state| {
            let changed = state.record_child_completed(initiated_id, result.clone())?;
            if changed && state.is_open() && !state.has_pending_decision() {
                state.schedule_decision()?;
            }
            Ok(changed)
        })
        .await
    }
}

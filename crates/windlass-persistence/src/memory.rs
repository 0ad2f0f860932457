// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store implementing all three persistence contracts.
//!
//! Carries the full fencing/CAS semantics of a real driver: range-ID
//! checks on every write, current-run CAS, conditional snapshot updates,
//! and atomic task visibility. Used by tests and embedded deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use async_trait::async_trait;

use windlass_common::error::{EngineError, Result};

use crate::store::{ExecutionStore, HistoryStore, ShardStore};
use crate::types::{
    BranchToken, CreateWorkflowMode, CurrentExecution, CurrentWorkflowCas, HistoryEvent,
    ReplicationTask, ShardCondition, ShardInfo, TimerTask, TransferTask, UpdateWorkflowMode,
    WorkflowSnapshot, WorkflowState, WorkflowTransaction,
};

type RunKey = (String, String, String);
type WorkflowId = (String, String);

#[derive(Default)]
struct Inner {
    shards: HashMap<i32, ShardInfo>,
    executions: HashMap<RunKey, WorkflowSnapshot>,
    current: HashMap<WorkflowId, CurrentExecution>,
    transfer_tasks: BTreeMap<(i32, i64), TransferTask>,
    timer_tasks: BTreeMap<(i32, DateTime<Utc>, i64), TimerTask>,
    replication_tasks: BTreeMap<(i32, i64), ReplicationTask>,
    branches: HashMap<BranchToken, Vec<HistoryEvent>>,
    applied_txns: HashMap<(BranchToken, i64), i64>,
}

/// In-memory persistence for tests and embedded use.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a fresh branch token and register an empty branch for it.
    pub async fn new_branch(&self) -> BranchToken {
        let token = Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().await;
        inner.branches.insert(token.clone(), Vec::new());
        token
    }

    fn check_fence(inner: &Inner, shard: ShardCondition) -> Result<()> {
        match inner.shards.get(&shard.shard_id) {
            Some(stored) if stored.range_id > shard.range_id => {
                Err(EngineError::ShardOwnershipLost {
                    shard_id: shard.shard_id,
                    details: format!(
                        "write stamped with range {} but shard is at range {}",
                        shard.range_id, stored.range_id
                    ),
                })
            }
            Some(_) => Ok(()),
            None => Err(EngineError::ShardOwnershipLost {
                shard_id: shard.shard_id,
                details: "shard row missing".to_string(),
            }),
        }
    }

    fn insert_tasks(inner: &mut Inner, shard_id: i32, txn: &WorkflowTransaction) {
        for task in &txn.transfer_tasks {
            inner.transfer_tasks.insert((shard_id, task.task_id), task.clone());
        }
        for task in &txn.timer_tasks {
            inner
                .timer_tasks
                .insert((shard_id, task.visibility_timestamp, task.task_id), task.clone());
        }
        for task in &txn.replication_tasks {
            inner
                .replication_tasks
                .insert((shard_id, task.task_id), task.clone());
        }
    }

    fn current_row(snapshot: &WorkflowSnapshot) -> CurrentExecution {
        CurrentExecution {
            run_id: snapshot.execution.key.run_id.clone(),
            state: snapshot.execution.state,
            close_status: snapshot.execution.close_status,
            last_write_version: snapshot.replication_state.last_write_version,
        }
    }
}

#[async_trait]
impl ShardStore for MemoryStore {
    async fn get_or_create_shard(&self, shard_id: i32) -> Result<ShardInfo> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .shards
            .entry(shard_id)
            .or_insert_with(|| ShardInfo::new(shard_id))
            .clone())
    }

    async fn update_shard(&self, info: ShardInfo, expected_range_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner.shards.get_mut(&info.shard_id).ok_or_else(|| {
            EngineError::ShardOwnershipLost {
                shard_id: info.shard_id,
                details: "shard row missing".to_string(),
            }
        })?;
        if stored.range_id != expected_range_id {
            return Err(EngineError::ShardOwnershipLost {
                shard_id: info.shard_id,
                details: format!(
                    "expected range {} but shard is at range {}",
                    expected_range_id, stored.range_id
                ),
            });
        }
        *stored = info;
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_workflow(
        &self,
        shard: ShardCondition,
        mode: CreateWorkflowMode,
        txn: WorkflowTransaction,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        Self::check_fence(&inner, shard)?;

        let key = txn.snapshot.execution.key.clone();
        let run_key: RunKey = (key.domain_id.clone(), key.workflow_id.clone(), key.run_id.clone());
        let workflow_id: WorkflowId = (key.domain_id.clone(), key.workflow_id.clone());

        if inner.executions.contains_key(&run_key) {
            return Err(EngineError::WorkflowExecutionAlreadyStarted {
                workflow_id: key.workflow_id,
                run_id: key.run_id,
            });
        }

        match &mode {
            CreateWorkflowMode::BrandNew => {
                if let Some(current) = inner.current.get(&workflow_id) {
                    // an open current run blocks the create unless the new
                    // run's write version dominates (replicated failover)
                    let dominates = txn.snapshot.replication_state.last_write_version
                        > current.last_write_version;
                    if current.state != WorkflowState::Completed && !dominates {
                        return Err(EngineError::WorkflowExecutionAlreadyStarted {
                            workflow_id: key.workflow_id,
                            run_id: current.run_id.clone(),
                        });
                    }
                }
                let row = Self::current_row(&txn.snapshot);
                inner.current.insert(workflow_id, row);
            }
            CreateWorkflowMode::ContinueAsNew { previous_run_id } => {
                match inner.current.get(&workflow_id) {
                    Some(current) if &current.run_id == previous_run_id => {
                        let row = Self::current_row(&txn.snapshot);
                        inner.current.insert(workflow_id, row);
                    }
                    other => {
                        return Err(EngineError::ConditionalUpdateFailed {
                            run_id: key.run_id,
                            details: format!(
                                "continue-as-new expected current run '{}', found {:?}",
                                previous_run_id,
                                other.map(|c| c.run_id.clone())
                            ),
                        });
                    }
                }
            }
            CreateWorkflowMode::Zombie => {}
        }

        Self::insert_tasks(&mut inner, shard.shard_id, &txn);
        inner.executions.insert(run_key, txn.snapshot);
        Ok(())
    }

    async fn update_workflow(
        &self,
        shard: ShardCondition,
        mode: UpdateWorkflowMode,
        current_cas: Option<CurrentWorkflowCas>,
        txn: WorkflowTransaction,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        Self::check_fence(&inner, shard)?;

        let key = txn.snapshot.execution.key.clone();
        let run_key: RunKey = (key.domain_id.clone(), key.workflow_id.clone(), key.run_id.clone());
        let workflow_id: WorkflowId = (key.domain_id.clone(), key.workflow_id.clone());

        let stored = inner.executions.get(&run_key).ok_or_else(|| {
            EngineError::EntityNotExists {
                entity: format!("workflow run '{}'", key.run_id),
            }
        })?;
        if stored.execution.next_event_id != txn.condition {
            return Err(EngineError::ConditionalUpdateFailed {
                run_id: key.run_id,
                details: format!(
                    "condition {} does not match stored next event id {}",
                    txn.condition, stored.execution.next_event_id
                ),
            });
        }

        match mode {
            UpdateWorkflowMode::UpdateCurrent => {
                if let Some(cas) = &current_cas {
                    match inner.current.get(&workflow_id) {
                        Some(current)
                            if current.run_id == cas.run_id
                                && current.last_write_version == cas.last_write_version => {}
                        other => {
                            return Err(EngineError::ConditionalUpdateFailed {
                                run_id: key.run_id,
                                details: format!(
                                    "current-run CAS expected ('{}', {}), found {:?}",
                                    cas.run_id,
                                    cas.last_write_version,
                                    other.map(|c| (c.run_id.clone(), c.last_write_version))
                                ),
                            });
                        }
                    }
                }
                let row = Self::current_row(&txn.snapshot);
                inner.current.insert(workflow_id, row);
            }
            UpdateWorkflowMode::BypassCurrent => {
                if let Some(current) = inner.current.get(&workflow_id) {
                    if current.run_id == key.run_id {
                        return Err(EngineError::ConditionalUpdateFailed {
                            run_id: key.run_id,
                            details: "bypass-current write targets the current run".to_string(),
                        });
                    }
                }
            }
            UpdateWorkflowMode::IgnoreCurrent => {}
        }

        Self::insert_tasks(&mut inner, shard.shard_id, &txn);
        inner.executions.insert(run_key, txn.snapshot);
        Ok(())
    }

    async fn get_workflow(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<Option<WorkflowSnapshot>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .executions
            .get(&(domain_id.to_string(), workflow_id.to_string(), run_id.to_string()))
            .cloned())
    }

    async fn get_current_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
    ) -> Result<Option<CurrentExecution>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .current
            .get(&(domain_id.to_string(), workflow_id.to_string()))
            .cloned())
    }

    async fn delete_workflow(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .executions
            .remove(&(domain_id.to_string(), workflow_id.to_string(), run_id.to_string()));
        let workflow_key = (domain_id.to_string(), workflow_id.to_string());
        if inner
            .current
            .get(&workflow_key)
            .map(|c| c.run_id == run_id)
            .unwrap_or(false)
        {
            inner.current.remove(&workflow_key);
        }
        Ok(())
    }

    async fn get_transfer_tasks(
        &self,
        shard_id: i32,
        min_task_id: i64,
        max_task_id: i64,
        batch: usize,
    ) -> Result<Vec<TransferTask>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transfer_tasks
            .range((shard_id, min_task_id + 1)..=(shard_id, max_task_id))
            .take(batch)
            .map(|(_, task)| task.clone())
            .collect())
    }

    async fn complete_transfer_task(&self, shard_id: i32, task_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.transfer_tasks.remove(&(shard_id, task_id));
        Ok(())
    }

    async fn range_complete_transfer_tasks(&self, shard_id: i32, up_to_task_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .transfer_tasks
            .retain(|&(s, id), _| s != shard_id || id > up_to_task_id);
        Ok(())
    }

    async fn get_timer_tasks(
        &self,
        shard_id: i32,
        min_timestamp: DateTime<Utc>,
        max_timestamp: DateTime<Utc>,
        batch: usize,
    ) -> Result<Vec<TimerTask>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .timer_tasks
            .range((shard_id, min_timestamp, i64::MIN)..(shard_id, max_timestamp, i64::MIN))
            .take(batch)
            .map(|(_, task)| task.clone())
            .collect())
    }

    async fn complete_timer_task(
        &self,
        shard_id: i32,
        visibility_timestamp: DateTime<Utc>,
        task_id: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.timer_tasks.remove(&(shard_id, visibility_timestamp, task_id));
        Ok(())
    }

    async fn get_replication_tasks(
        &self,
        shard_id: i32,
        min_task_id: i64,
        batch: usize,
    ) -> Result<Vec<ReplicationTask>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .replication_tasks
            .range((shard_id, min_task_id + 1)..=(shard_id, i64::MAX))
            .take(batch)
            .map(|(_, task)| task.clone())
            .collect())
    }

    async fn complete_replication_task(&self, shard_id: i32, task_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.replication_tasks.remove(&(shard_id, task_id));
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append_history_events(
        &self,
        branch: &BranchToken,
        events: &[HistoryEvent],
        txn_id: i64,
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;

        let first_id = events[0].event_id;
        if let Some(&applied) = inner.applied_txns.get(&(branch.clone(), first_id)) {
            if applied == txn_id {
                // replay of an already-applied transaction
                return Ok(());
            }
        }

        let stored = inner.branches.entry(branch.clone()).or_default();
        if let Some(last) = stored.last() {
            if first_id > last.event_id + 1 {
                return Err(EngineError::ConditionalUpdateFailed {
                    run_id: branch.clone(),
                    details: format!(
                        "append starts at {} but branch ends at {}",
                        first_id, last.event_id
                    ),
                });
            }
            // a retried transaction re-appends its node; the newer write wins
            if first_id <= last.event_id {
                stored.retain(|e| e.event_id < first_id);
            }
        }
        stored.extend_from_slice(events);
        inner.applied_txns.insert((branch.clone(), first_id), txn_id);
        Ok(())
    }

    async fn read_history_events(
        &self,
        branch: &BranchToken,
        min_event_id: i64,
        max_event_id: i64,
    ) -> Result<Vec<HistoryEvent>> {
        let inner = self.inner.lock().await;
        let stored = inner.branches.get(branch).ok_or_else(|| {
            EngineError::EntityNotExists {
                entity: format!("history branch '{}'", branch),
            }
        })?;
        Ok(stored
            .iter()
            .filter(|e| e.event_id >= min_event_id && e.event_id < max_event_id)
            .cloned()
            .collect())
    }

    async fn fork_history_branch(
        &self,
        parent: &BranchToken,
        fork_event_id: i64,
    ) -> Result<BranchToken> {
        let mut inner = self.inner.lock().await;
        let parent_events = inner.branches.get(parent).ok_or_else(|| {
            EngineError::EntityNotExists {
                entity: format!("history branch '{}'", parent),
            }
        })?;
        let shared: Vec<HistoryEvent> = parent_events
            .iter()
            .filter(|e| e.event_id < fork_event_id)
            .cloned()
            .collect();
        let token = Uuid::new_v4().to_string();
        inner.branches.insert(token.clone(), shared);
        Ok(token)
    }

    async fn delete_history_branch(&self, branch: &BranchToken) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.branches.remove(branch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventAttributes;
    use crate::version_history::{VersionHistories, VersionHistory};
    use crate::types::{ReplicationState, WorkflowExecutionInfo, WorkflowKey};
    use windlass_common::FIRST_EVENT_ID;

    fn snapshot(run_id: &str, next_event_id: i64, last_write_version: i64) -> WorkflowSnapshot {
        WorkflowSnapshot {
            execution: WorkflowExecutionInfo {
                key: WorkflowKey::new("d1", "w1", run_id),
                workflow_type: "t".to_string(),
                task_list: "tl".to_string(),
                parent: None,
                execution_timeout_seconds: 60,
                decision_timeout_seconds: 10,
                state: WorkflowState::Running,
                close_status: crate::types::CloseStatus::None,
                next_event_id,
                last_processed_event_id: 0,
                start_time: Utc::now(),
                close_time: None,
                decision_schedule_id: 0,
                decision_started_id: 0,
                decision_attempt: 0,
                branch_token: "b".to_string(),
                search_attributes: HashMap::new(),
            },
            replication_state: ReplicationState {
                last_write_version,
                ..Default::default()
            },
            version_histories: VersionHistories::new(VersionHistory::new("b".to_string())),
            activities: HashMap::new(),
            timers: HashMap::new(),
            children: HashMap::new(),
            request_cancels: HashMap::new(),
            signals: HashMap::new(),
            buffered_events: Vec::new(),
        }
    }

    fn txn(run_id: &str, condition: i64, next_event_id: i64) -> WorkflowTransaction {
        WorkflowTransaction {
            snapshot: snapshot(run_id, next_event_id, 0),
            condition,
            transfer_tasks: Vec::new(),
            timer_tasks: Vec::new(),
            replication_tasks: Vec::new(),
        }
    }

    async fn acquired_shard(store: &MemoryStore) -> ShardCondition {
        let mut info = store.get_or_create_shard(1).await.unwrap();
        let expected = info.range_id;
        info.range_id += 1;
        store.update_shard(info.clone(), expected).await.unwrap();
        ShardCondition {
            shard_id: 1,
            range_id: info.range_id,
        }
    }

    #[tokio::test]
    async fn test_stale_range_id_is_fenced() {
        let store = MemoryStore::new();
        let shard = acquired_shard(&store).await;

        // a newer owner takes over
        let mut info = store.get_or_create_shard(1).await.unwrap();
        let expected = info.range_id;
        info.range_id += 1;
        store.update_shard(info, expected).await.unwrap();

        let err = store
            .create_workflow(shard, CreateWorkflowMode::BrandNew, txn("r1", 1, 1))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "SHARD_OWNERSHIP_LOST");
    }

    #[tokio::test]
    async fn test_brand_new_rejects_open_current() {
        let store = MemoryStore::new();
        let shard = acquired_shard(&store).await;

        store
            .create_workflow(shard, CreateWorkflowMode::BrandNew, txn("r1", 1, 1))
            .await
            .unwrap();
        let err = store
            .create_workflow(shard, CreateWorkflowMode::BrandNew, txn("r2", 1, 1))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "WORKFLOW_ALREADY_STARTED");
    }

    #[tokio::test]
    async fn test_conditional_update() {
        let store = MemoryStore::new();
        let shard = acquired_shard(&store).await;

        store
            .create_workflow(shard, CreateWorkflowMode::BrandNew, txn("r1", 1, 4))
            .await
            .unwrap();

        // stale condition
        let err = store
            .update_workflow(shard, UpdateWorkflowMode::UpdateCurrent, None, txn("r1", 1, 6))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CONDITIONAL_UPDATE_FAILED");

        // matching condition
        store
            .update_workflow(shard, UpdateWorkflowMode::UpdateCurrent, None, txn("r1", 4, 6))
            .await
            .unwrap();
        let stored = store.get_workflow("d1", "w1", "r1").await.unwrap().unwrap();
        assert_eq!(stored.execution.next_event_id, 6);
    }

    #[tokio::test]
    async fn test_current_run_cas() {
        let store = MemoryStore::new();
        let shard = acquired_shard(&store).await;

        store
            .create_workflow(shard, CreateWorkflowMode::BrandNew, txn("r1", 1, 4))
            .await
            .unwrap();

        let err = store
            .update_workflow(
                shard,
                UpdateWorkflowMode::UpdateCurrent,
                Some(CurrentWorkflowCas {
                    run_id: "r1".to_string(),
                    last_write_version: 99,
                }),
                txn("r1", 4, 6),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CONDITIONAL_UPDATE_FAILED");

        store
            .update_workflow(
                shard,
                UpdateWorkflowMode::UpdateCurrent,
                Some(CurrentWorkflowCas {
                    run_id: "r1".to_string(),
                    last_write_version: 0,
                }),
                txn("r1", 4, 6),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fork_shares_prefix() {
        let store = MemoryStore::new();
        let branch = store.new_branch().await;
        let events: Vec<HistoryEvent> = (FIRST_EVENT_ID..=5)
            .map(|event_id| HistoryEvent {
                event_id,
                version: 1,
                timestamp: Utc::now(),
                attributes: EventAttributes::WorkflowExecutionTimedOut,
            })
            .collect();
        store.append_history_events(&branch, &events, 1).await.unwrap();

        let fork = store.fork_history_branch(&branch, 4).await.unwrap();
        let shared = store.read_history_events(&fork, 1, 100).await.unwrap();
        assert_eq!(shared.len(), 3);
        assert_eq!(shared.last().unwrap().event_id, 3);
    }

    #[tokio::test]
    async fn test_append_requires_dense_ids() {
        let store = MemoryStore::new();
        let branch = store.new_branch().await;
        let event = |event_id| HistoryEvent {
            event_id,
            version: 1,
            timestamp: Utc::now(),
            attributes: EventAttributes::WorkflowExecutionTimedOut,
        };
        store.append_history_events(&branch, &[event(1)], 1).await.unwrap();
        let err = store
            .append_history_events(&branch, &[event(3)], 2)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CONDITIONAL_UPDATE_FAILED");
    }
}

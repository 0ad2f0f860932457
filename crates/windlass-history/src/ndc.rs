// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! nDC transaction manager: applies replicated event batches to the local
//! store across N clusters.
//!
//! Dispatch is three-way:
//! - the run is unknown locally -> [`NdcTransactionManager::create_workflow`];
//! - the run is open and the batch lands on its current branch ->
//!   [`NdcTransactionManager::update_workflow`], resolving conflicts by
//!   rewinding to the fork point when the local branch diverged;
//! - the run is closed, or the batch extends a non-current branch ->
//!   [`NdcTransactionManager::backfill_workflow`], which never moves the
//!   current-run pointer forward on its own.
//!
//! Current-run arbitration asks mutable state first
//! (`current_guaranteed`, valid while the context lock is held) and falls
//! back to reading the current-execution pointer. All persistence here runs
//! under the passive transaction policy: tasks for standby processing are
//! materialized, replication tasks are not.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use windlass_common::error::{EngineError, Result};
use windlass_common::FIRST_EVENT_ID;
use windlass_persistence::{
    CreateWorkflowMode, ExecutionStore, HistoryStore, ReplicationBatch, UpdateWorkflowMode,
    VersionHistory, WorkflowKey,
};

use crate::cache::{HistoryCache, WorkflowContextGuard};
use crate::mutable_state::{MutableState, TransactionPolicy};
use crate::shard::ShardContext;

/// Applies remote history batches to the local store.
pub struct NdcTransactionManager {
    shard: Arc<ShardContext>,
    history_cache: Arc<HistoryCache>,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
}

impl NdcTransactionManager {
    /// Create a manager for one shard.
    pub fn new(
        shard: Arc<ShardContext>,
        history_cache: Arc<HistoryCache>,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            shard,
            history_cache,
            execution_store,
            history_store,
        }
    }

    /// Apply one replication batch. Idempotent: re-applying a batch whose
    /// events are already present leaves state untouched.
    #[instrument(skip(self, batch), fields(run_id = %batch.run_id, first = batch.first_event_id))]
    pub async fn apply_events(&self, batch: ReplicationBatch) -> Result<()> {
        if batch.events.is_empty() {
            return Ok(());
        }
        if batch.version_history.is_empty() {
            return Err(EngineError::Internal {
                details: "replication batch carries no version history".to_string(),
            });
        }

        let key = WorkflowKey::new(&batch.domain_id, &batch.workflow_id, &batch.run_id);
        let mut guard = self.history_cache.acquire(key.clone()).await?;
        let result = self.apply_locked(&mut guard, &key, batch).await;
        if result.is_err() {
            guard.poison();
        }
        result
    }

    async fn apply_locked(
        &self,
        guard: &mut WorkflowContextGuard,
        key: &WorkflowKey,
        batch: ReplicationBatch,
    ) -> Result<()> {
        if guard.load_if_exists().await?.is_none() {
            return self.create_workflow(guard, key, batch).await;
        }

        let state = guard.mutable_state().expect("loaded above");
        let (branch_index, lca) = state
            .version_histories
            .find_lca_history_index_and_item(&batch.version_history)?;
        let on_current_branch = branch_index == state.version_histories.current_index;

        if on_current_branch && state.is_open() {
            self.update_workflow(guard, key, batch, lca).await
        } else {
            self.backfill_workflow(guard, key, batch, branch_index).await
        }
    }

    /// The run is unknown locally: rebuild it from the batch and insert it,
    /// taking the current pointer only when the incoming write version
    /// dominates.
    async fn create_workflow(
        &self,
        guard: &mut WorkflowContextGuard,
        key: &WorkflowKey,
        batch: ReplicationBatch,
    ) -> Result<()> {
        if batch.first_event_id != FIRST_EVENT_ID {
            // mid-run batch for an unknown run: the prefix is missing
            return Err(EngineError::RetryTask {
                domain_id: key.domain_id.clone(),
                workflow_id: key.workflow_id.clone(),
                run_id: key.run_id.clone(),
                next_event_id: FIRST_EVENT_ID,
            });
        }

        let branch_token = Uuid::new_v4().to_string();
        let start_version = batch.events[0].version;
        let mut state = MutableState::new(key.clone(), branch_token, start_version);
        for event in &batch.events {
            state.replay_event(event)?;
        }
        let incoming_version = batch.events.last().expect("non-empty").version;
        guard.set_mutable_state(state);

        let current = self
            .execution_store
            .get_current_execution(&key.domain_id, &key.workflow_id)
            .await?;
        let mode = match current {
            None => CreateWorkflowMode::BrandNew,
            Some(current) if incoming_version > current.last_write_version => {
                CreateWorkflowMode::BrandNew
            }
            Some(_) => CreateWorkflowMode::Zombie,
        };
        info!(run_id = %key.run_id, ?mode, "Replicated run created");
        guard
            .create_workflow_execution(mode, TransactionPolicy::Passive)
            .await
    }

    /// The batch lands on the open run's current branch: extend it, or
    /// resolve the conflict when the local branch diverged past the fork
    /// point.
    async fn update_workflow(
        &self,
        guard: &mut WorkflowContextGuard,
        key: &WorkflowKey,
        batch: ReplicationBatch,
        lca: windlass_persistence::VersionHistoryItem,
    ) -> Result<()> {
        let (local_last, local_next) = {
            let state = guard.mutable_state().expect("loaded");
            let local_last = state
                .version_histories
                .current()
                .last_item()
                .ok_or_else(|| EngineError::Internal {
                    details: "current branch has no items".to_string(),
                })?;
            (local_last, state.next_event_id())
        };
        let incoming_last = *batch.version_history.last().expect("checked non-empty");

        if local_last != lca {
            // local wrote past the fork point; higher version wins
            if local_last.version > incoming_last.version {
                debug!(
                    run_id = %key.run_id,
                    local_version = local_last.version,
                    incoming_version = incoming_last.version,
                    "Stale replication batch dropped"
                );
                return Ok(());
            }
            return self.resolve_conflict(guard, key, batch, lca).await;
        }

        // remote extends the local current branch
        if batch.next_event_id <= local_next {
            debug!(run_id = %key.run_id, "Replication batch already applied");
            return Ok(());
        }
        if batch.first_event_id > local_next {
            return Err(EngineError::RetryTask {
                domain_id: key.domain_id.clone(),
                workflow_id: key.workflow_id.clone(),
                run_id: key.run_id.clone(),
                next_event_id: local_next,
            });
        }

        let state = guard.mutable_state().expect("loaded");
        for event in batch.events.iter().filter(|e| e.event_id >= local_next) {
            state.replay_event(event)?;
        }
        let mode = self.persist_mode(guard, key).await?;
        guard
            .update_workflow_execution(mode, TransactionPolicy::Passive)
            .await
    }

    /// Rewind the local branch to the fork point, preserving the orphaned
    /// suffix for audit, and apply the remote suffix as the new current
    /// branch.
    async fn resolve_conflict(
        &self,
        guard: &mut WorkflowContextGuard,
        key: &WorkflowKey,
        batch: ReplicationBatch,
        lca: windlass_persistence::VersionHistoryItem,
    ) -> Result<()> {
        if batch.first_event_id > lca.event_id + 1 {
            return Err(EngineError::RetryTask {
                domain_id: key.domain_id.clone(),
                workflow_id: key.workflow_id.clone(),
                run_id: key.run_id.clone(),
                next_event_id: lca.event_id + 1,
            });
        }

        let state = guard.mutable_state().expect("loaded");
        let old_condition = state.condition;
        let old_last_write_version = state.previous_last_write_version;
        let old_histories = state.version_histories.clone();
        let old_branch = old_histories.current().branch_token.clone();

        info!(
            run_id = %key.run_id,
            fork_event_id = lca.event_id,
            fork_version = lca.version,
            "Resolving replication conflict, rewinding to fork point"
        );

        // the new branch shares events up to the fork point; the old branch
        // keeps the orphaned suffix for audit
        let new_branch = self
            .history_store
            .fork_history_branch(&old_branch, lca.event_id + 1)
            .await?;
        let prefix = self
            .history_store
            .read_history_events(&new_branch, FIRST_EVENT_ID, lca.event_id + 1)
            .await?;

        let mut rebuilt = MutableState::rebuild(key.clone(), new_branch.clone(), &prefix)?;

        // carry the full branch set: old branches stay for audit, the
        // rewound branch becomes current
        let mut histories = old_histories;
        let mut rewound = histories.current().clone();
        rewound.branch_token = new_branch;
        rewound.truncate_to(lca)?;
        let index = histories.add_history(rewound);
        histories.set_current(index)?;
        rebuilt.version_histories = histories;

        for event in batch.events.iter().filter(|e| e.event_id > lca.event_id) {
            rebuilt.replay_event(event)?;
        }

        // the write still conditions on what is actually stored
        rebuilt.condition = old_condition;
        rebuilt.previous_last_write_version = old_last_write_version;

        guard.set_mutable_state(rebuilt);
        let mode = self.persist_mode(guard, key).await?;
        guard
            .update_workflow_execution(mode, TransactionPolicy::Passive)
            .await
    }

    /// The run is closed or the batch extends a non-current branch: append
    /// without driving the state machine, never advancing the current
    /// pointer on this run's behalf.
    async fn backfill_workflow(
        &self,
        guard: &mut WorkflowContextGuard,
        key: &WorkflowKey,
        batch: ReplicationBatch,
        branch_index: usize,
    ) -> Result<()> {
        let state = guard.mutable_state().expect("loaded");
        let current_index = state.version_histories.current_index;

        if branch_index == current_index {
            // closed run, events continue its own branch
            if batch.next_event_id <= state.next_event_id() {
                debug!(run_id = %key.run_id, "Backfill batch already applied");
                return Ok(());
            }
            if batch.first_event_id > state.next_event_id() {
                return Err(EngineError::RetryTask {
                    domain_id: key.domain_id.clone(),
                    workflow_id: key.workflow_id.clone(),
                    run_id: key.run_id.clone(),
                    next_event_id: state.next_event_id(),
                });
            }
            let next = state.next_event_id();
            for event in batch.events.iter().filter(|e| e.event_id >= next) {
                state.backfill_event(event)?;
            }
        } else {
            // non-current branch: extend it in storage and in the branch set
            let history = &state.version_histories.histories[branch_index];
            let branch_token = history.branch_token.clone();
            let branch_last = history
                .last_item()
                .map(|item| item.event_id)
                .unwrap_or(FIRST_EVENT_ID - 1);
            if batch.next_event_id <= branch_last + 1 {
                debug!(run_id = %key.run_id, "Backfill batch already applied");
                return Ok(());
            }
            if batch.first_event_id > branch_last + 1 {
                return Err(EngineError::RetryTask {
                    domain_id: key.domain_id.clone(),
                    workflow_id: key.workflow_id.clone(),
                    run_id: key.run_id.clone(),
                    next_event_id: branch_last + 1,
                });
            }
            let fresh: Vec<_> = batch
                .events
                .iter()
                .filter(|e| e.event_id > branch_last)
                .cloned()
                .collect();
            self.history_store
                .append_history_events(&branch_token, &fresh, batch.first_event_id)
                .await?;
            let history: &mut VersionHistory =
                &mut state.version_histories.histories[branch_index];
            for event in &fresh {
                history.add_or_update_item(windlass_persistence::VersionHistoryItem::new(
                    event.event_id,
                    event.version,
                ))?;
            }
        }

        let mode = self.persist_mode(guard, key).await?;
        guard
            .update_workflow_execution(mode, TransactionPolicy::Passive)
            .await
    }

    /// Current-run arbitration: trust the lock-held guarantee, otherwise
    /// read the pointer.
    async fn persist_mode(
        &self,
        guard: &mut WorkflowContextGuard,
        key: &WorkflowKey,
    ) -> Result<UpdateWorkflowMode> {
        {
            let state = guard.mutable_state().expect("loaded");
            if state.current_guaranteed {
                return Ok(UpdateWorkflowMode::UpdateCurrent);
            }
        }
        let current = self
            .execution_store
            .get_current_execution(&key.domain_id, &key.workflow_id)
            .await?;
        let mode = match current {
            Some(current) if current.run_id == key.run_id => UpdateWorkflowMode::UpdateCurrent,
            Some(_) => UpdateWorkflowMode::BypassCurrent,
            None => {
                warn!(run_id = %key.run_id, "No current execution during arbitration");
                UpdateWorkflowMode::BypassCurrent
            }
        };
        Ok(mode)
    }

    /// The shard this manager serves.
    pub fn shard(&self) -> &Arc<ShardContext> {
        &self.shard
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow execution context: the bridge between mutable state and the
//! stores.
//!
//! A context owns one run's in-memory state and serializes all mutation of
//! it (the history cache hands out the lock). Persistence goes history
//! first, then mutable state: events append to the branch, then the
//! snapshot plus tasks commit in one conditional write.

use std::sync::Arc;

use tracing::{debug, warn};

use windlass_common::error::{EngineError, Result};
use windlass_persistence::{
    CreateWorkflowMode, CurrentWorkflowCas, ExecutionStore, HistoryStore, UpdateWorkflowMode,
    WorkflowKey,
};

use crate::mutable_state::{MutableState, TransactionPolicy};
use crate::shard::ShardContext;

/// One run's cached context. All access goes through the history cache's
/// per-entry lock.
pub struct WorkflowContext {
    key: WorkflowKey,
    shard: Arc<ShardContext>,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    mutable_state: Option<MutableState>,
}

impl WorkflowContext {
    /// Create an empty context for `key`.
    pub fn new(
        key: WorkflowKey,
        shard: Arc<ShardContext>,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            key,
            shard,
            execution_store,
            history_store,
            mutable_state: None,
        }
    }

    /// Run identity.
    pub fn key(&self) -> &WorkflowKey {
        &self.key
    }

    /// The cached state, if loaded.
    pub fn mutable_state(&mut self) -> Option<&mut MutableState> {
        self.mutable_state.as_mut()
    }

    /// Install freshly-built state (run creation, replication create).
    pub fn set_mutable_state(&mut self, state: MutableState) -> &mut MutableState {
        self.mutable_state = Some(state);
        self.mutable_state.as_mut().expect("just set")
    }

    /// Drop the cached state, forcing a reload on next use.
    pub fn clear(&mut self) {
        self.mutable_state = None;
    }

    /// Load the run's state from the store if not cached.
    ///
    /// Returns `EntityNotExists` when the run is unknown.
    pub async fn load(&mut self) -> Result<&mut MutableState> {
        if self.mutable_state.is_none() {
            let snapshot = self
                .execution_store
                .get_workflow(&self.key.domain_id, &self.key.workflow_id, &self.key.run_id)
                .await?
                .ok_or_else(|| EngineError::EntityNotExists {
                    entity: format!(
                        "workflow '{}' run '{}'",
                        self.key.workflow_id, self.key.run_id
                    ),
                })?;
            debug!(
                run_id = %self.key.run_id,
                next_event_id = snapshot.execution.next_event_id,
                "Loaded mutable state"
            );
            self.mutable_state = Some(MutableState::from_snapshot(snapshot));
        }
        Ok(self.mutable_state.as_mut().expect("loaded above"))
    }

    /// Load, returning `None` instead of an error for unknown runs.
    pub async fn load_if_exists(&mut self) -> Result<Option<&mut MutableState>> {
        match self.load().await {
            Ok(_) => Ok(self.mutable_state.as_mut()),
            Err(EngineError::EntityNotExists { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Persist the current transaction as a new run.
    pub async fn create_workflow_execution(
        &mut self,
        mode: CreateWorkflowMode,
        policy: TransactionPolicy,
    ) -> Result<()> {
        let shard_condition = self.shard.condition().await;
        let set_current = !matches!(mode, CreateWorkflowMode::Zombie);
        let state = self.mutable_state.as_mut().ok_or_else(|| EngineError::Internal {
            details: "create without mutable state".to_string(),
        })?;
        let txn = state.close_transaction(policy, &self.shard).await?;

        self.history_store
            .append_history_events(&txn.branch_token, &txn.events, txn.txn.condition)
            .await?;
        let result = self
            .execution_store
            .create_workflow(shard_condition, mode, txn.txn)
            .await;
        match result {
            Ok(()) => {
                if set_current {
                    if let Some(state) = self.mutable_state.as_mut() {
                        state.current_guaranteed = true;
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.clear();
                Err(err)
            }
        }
    }

    /// Persist the current transaction as an update of an existing run.
    ///
    /// With [`UpdateWorkflowMode::UpdateCurrent`] the current-run pointer is
    /// advanced under CAS on `(run_id, last_write_version)`. On
    /// `ConditionalUpdateFailed` the cached state is dropped so the caller
    /// reloads before retrying.
    pub async fn update_workflow_execution(
        &mut self,
        mode: UpdateWorkflowMode,
        policy: TransactionPolicy,
    ) -> Result<()> {
        let shard_condition = self.shard.condition().await;
        let state = self.mutable_state.as_mut().ok_or_else(|| EngineError::Internal {
            details: "update without mutable state".to_string(),
        })?;
        let run_id = state.key().run_id.clone();
        let txn = state.close_transaction(policy, &self.shard).await?;

        let cas = match mode {
            UpdateWorkflowMode::UpdateCurrent => Some(CurrentWorkflowCas {
                run_id,
                last_write_version: txn.previous_last_write_version,
            }),
            _ => None,
        };

        self.history_store
            .append_history_events(&txn.branch_token, &txn.events, txn.txn.condition)
            .await?;
        let result = self
            .execution_store
            .update_workflow(shard_condition, mode, cas, txn.txn)
            .await;
        match result {
            Ok(()) => {
                if mode == UpdateWorkflowMode::UpdateCurrent {
                    if let Some(state) = self.mutable_state.as_mut() {
                        state.current_guaranteed = true;
                    }
                }
                Ok(())
            }
            Err(err) => {
                if matches!(err, EngineError::ConditionalUpdateFailed { .. }) {
                    warn!(
                        run_id = %self.key.run_id,
                        "Conditional update failed, dropping cached state"
                    );
                }
                self.clear();
                Err(err)
            }
        }
    }
}

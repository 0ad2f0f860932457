// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transfer queue processor: a single-shard cursor over the persisted
//! transfer-task table in task-ID order.
//!
//! One processor runs per cluster the shard serves (the active variant for
//! the local cluster, one standby variant per remote cluster). Processing
//! order equals task-ID order modulo retries: a deferred task (`TaskRetry`)
//! stops the cursor so the ack level never jumps over unfinished work.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use windlass_common::error::{EngineError, Result};
use windlass_common::retry::{with_retries, RetryPolicy};
use windlass_persistence::{ExecutionStore, TransferTask};

use crate::shard::ShardContext;

/// One task-processing strategy (active or standby).
#[async_trait::async_trait]
pub trait TransferTaskExecutor: Send + Sync {
    /// Perform the task's side effect, or classify it for deferral.
    ///
    /// `TaskRetry` defers the task without advancing the ack level;
    /// `TaskDiscarded` permanently skips it.
    async fn process(&self, task: &TransferTask) -> Result<()>;

    /// Executor name for logs.
    fn name(&self) -> &'static str;
}

/// Cursor + ack bookkeeping over one shard's transfer tasks for one
/// cluster.
pub struct TransferQueueProcessor {
    shard: Arc<ShardContext>,
    execution_store: Arc<dyn ExecutionStore>,
    executor: Arc<dyn TransferTaskExecutor>,
    /// Cluster whose ack level this processor advances.
    cluster: String,
}

impl TransferQueueProcessor {
    /// Create a processor advancing `cluster`'s ack level.
    pub fn new(
        shard: Arc<ShardContext>,
        execution_store: Arc<dyn ExecutionStore>,
        executor: Arc<dyn TransferTaskExecutor>,
        cluster: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shard,
            execution_store,
            executor,
            cluster: cluster.into(),
        })
    }

    /// Process one task, honoring the per-task deadline.
    ///
    /// Returns `Ok(())` when the cursor may advance past the task
    /// (processed or discarded), `Err(TaskRetry)` to defer.
    pub async fn process_one(&self, task: &TransferTask) -> Result<()> {
        let deadline = self.shard.config().task_process_timeout;
        let result = tokio::time::timeout(deadline, self.executor.process(task))
            .await
            .unwrap_or(Err(EngineError::TaskRetry));

        match result {
            Ok(()) => {
                self.execution_store
                    .complete_transfer_task(self.shard.shard_id(), task.task_id)
                    .await?;
                Ok(())
            }
            Err(EngineError::TaskDiscarded) => {
                warn!(
                    task_id = task.task_id,
                    run_id = %task.run_id,
                    executor = self.executor.name(),
                    "Transfer task discarded"
                );
                self.execution_store
                    .complete_transfer_task(self.shard.shard_id(), task.task_id)
                    .await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// One poll: read from the ack level, process in ID order, stop at the
    /// first deferral, then advance the ack level and trim the table.
    pub async fn poll_once(&self) -> Result<usize> {
        let ack = self.shard.cluster_transfer_ack_level(&self.cluster).await;
        let tasks = with_retries(&RetryPolicy::default(), "get_transfer_tasks", || {
            self.execution_store.get_transfer_tasks(
                self.shard.shard_id(),
                ack,
                i64::MAX,
                self.shard.config().transfer_batch_size,
            )
        })
        .await?;
        if tasks.is_empty() {
            return Ok(0);
        }

        let mut new_ack = ack;
        let mut processed = 0;
        for task in &tasks {
            match self.process_one(task).await {
                Ok(()) => {
                    new_ack = task.task_id;
                    processed += 1;
                }
                Err(EngineError::TaskRetry) => {
                    debug!(
                        task_id = task.task_id,
                        run_id = %task.run_id,
                        "Transfer task deferred"
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
                        "Transfer task failed, will retry"
                    );
                    break;
                }
            }
        }

        if new_ack > ack {
            self.shard
                .update_cluster_transfer_ack_level(&self.cluster, new_ack)
                .await?;
            self.trim_completed().await?;
        }
        Ok(processed)
    }

    /// Delete tasks below the minimum ack level across all clusters.
    async fn trim_completed(&self) -> Result<()> {
        let mut min_ack = i64::MAX;
        for cluster in self.shard.cluster_metadata().all_cluster_info().keys() {
            min_ack = min_ack.min(self.shard.cluster_transfer_ack_level(cluster).await);
        }
        if min_ack > 0 && min_ack < i64::MAX {
            self.shard.update_transfer_ack_level(min_ack).await?;
            self.execution_store
                .range_complete_transfer_tasks(self.shard.shard_id(), min_ack)
                .await?;
        }
        Ok(())
    }

    /// Background loop: poll on an interval until the shard shuts down.
    pub async fn run(self: Arc<Self>) {
        let shutdown = self.shard.shutdown_token();
        let interval = self.shard.config().queue_poll_interval;
        info!(
            shard_id = self.shard.shard_id(),
            cluster = %self.cluster,
            executor = self.executor.name(),
            "Transfer queue processor started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(
                        shard_id = self.shard.shard_id(),
                        cluster = %self.cluster,
                        "Transfer queue processor shutting down"
                    );
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    match self.poll_once().await {
                        Ok(0) => {}
                        Ok(count) => {
                            debug!(count, cluster = %self.cluster, "Processed transfer tasks");
                        }
                        Err(err) if matches!(err, EngineError::ShardOwnershipLost { .. }) => {
                            error!(error = %err, "Transfer queue lost shard ownership");
                            break;
                        }
                        Err(err) => {
                            error!(error = %err, "Transfer queue poll failed");
                        }
                    }
                }
            }
        }
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replication ack manager and dead-letter queue.
//!
//! Consumes the ordered per-source-cluster stream of replication batches,
//! applies them through the nDC transaction manager, and tracks the last
//! applied task ID per source. An event gap triggers a targeted pull
//! through the re-replicator before one bounded retry; batches that still
//! fail move to the DLQ so the stream keeps draining.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use windlass_common::error::{EngineError, Result};
use windlass_common::END_EVENT_ID;
use windlass_persistence::ReplicationBatch;

use crate::clients::HistoryRereplicator;
use crate::ndc::NdcTransactionManager;
use crate::shard::ShardContext;

/// A replication batch that exhausted its apply attempts.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    /// Source cluster of the failed batch.
    pub source_cluster: String,
    /// Task ID the batch arrived under.
    pub task_id: i64,
    /// The batch itself, for later merge.
    pub batch: ReplicationBatch,
    /// Why the final attempt failed.
    pub error: String,
}

#[derive(Default)]
struct AckState {
    last_applied: HashMap<String, i64>,
    dlq: Vec<DlqEntry>,
}

/// Applies incoming replication traffic and owns the per-source ack levels.
pub struct ReplicationAckManager {
    shard: Arc<ShardContext>,
    ndc: Arc<NdcTransactionManager>,
    rereplicator: Arc<dyn HistoryRereplicator>,
    state: Mutex<AckState>,
}

impl ReplicationAckManager {
    /// Create an ack manager for one shard.
    pub fn new(
        shard: Arc<ShardContext>,
        ndc: Arc<NdcTransactionManager>,
        rereplicator: Arc<dyn HistoryRereplicator>,
    ) -> Self {
        Self {
            shard,
            ndc,
            rereplicator,
            state: Mutex::new(AckState::default()),
        }
    }

    /// Apply one batch from the transport stream.
    ///
    /// On success (or DLQ admission) the source's ack level advances to
    /// `task_id`; the transport may trim up to it.
    #[instrument(skip(self, batch), fields(source = %batch.source_cluster, task_id))]
    pub async fn handle_batch(&self, task_id: i64, batch: ReplicationBatch) -> Result<()> {
        // replication traffic doubles as the remote cluster's clock
        if let Some(last) = batch.events.last() {
            self.shard
                .set_current_time(&batch.source_cluster, last.timestamp)
                .await;
        }

        let max_attempts = self.shard.config().replication_apply_max_attempts;
        let mut attempt = 0;
        loop {
            match self.ndc.apply_events(batch.clone()).await {
                Ok(()) => break,
                Err(EngineError::RetryTask {
                    domain_id,
                    workflow_id,
                    run_id,
                    next_event_id,
                }) if attempt + 1 < max_attempts => {
                    // gap: pull the missing prefix, then re-apply
                    info!(
                        %run_id,
                        next_event_id,
                        "Replication gap detected, re-fetching"
                    );
                    self.rereplicator
                        .send_multi_workflow_history(
                            &domain_id,
                            &workflow_id,
                            &run_id,
                            next_event_id,
                            &run_id,
                            END_EVENT_ID,
                        )
                        .await?;
                    attempt += 1;
                }
                Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                    debug!(error = %err, attempt, "Replication apply retrying");
                    attempt += 1;
                }
                Err(err) => {
                    warn!(
                        run_id = %batch.run_id,
                        error = %err,
                        "Replication batch failed, moving to DLQ"
                    );
                    let source = batch.source_cluster.clone();
                    let mut state = self.state.lock().await;
                    state.dlq.push(DlqEntry {
                        source_cluster: source.clone(),
                        task_id,
                        batch,
                        error: err.to_string(),
                    });
                    state.last_applied.insert(source, task_id);
                    return Ok(());
                }
            }
        }

        let mut state = self.state.lock().await;
        state
            .last_applied
            .insert(batch.source_cluster.clone(), task_id);
        Ok(())
    }

    /// Last successfully applied (or dead-lettered) task ID for `source`.
    pub async fn ack_level(&self, source: &str) -> i64 {
        self.state
            .lock()
            .await
            .last_applied
            .get(source)
            .copied()
            .unwrap_or(0)
    }

    /// Current DLQ contents.
    pub async fn read_dlq(&self) -> Vec<DlqEntry> {
        self.state.lock().await.dlq.clone()
    }

    /// Drop all dead-lettered batches.
    pub async fn purge_dlq(&self) -> usize {
        let mut state = self.state.lock().await;
        let purged = state.dlq.len();
        state.dlq.clear();
        purged
    }

    /// Re-apply dead-lettered batches; entries that apply cleanly leave the
    /// queue. Returns how many merged.
    pub async fn merge_dlq(&self) -> Result<usize> {
        let entries = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.dlq)
        };
        let mut merged = 0;
        let mut remaining = Vec::new();
        for entry in entries {
            match self.ndc.apply_events(entry.batch.clone()).await {
                Ok(()) => merged += 1,
                Err(err) => {
                    remaining.push(DlqEntry {
                        error: err.to_string(),
                        ..entry
                    });
                }
            }
        }
        self.state.lock().await.dlq.extend(remaining);
        Ok(merged)
    }
}

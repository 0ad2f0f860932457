// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shard controller: ownership, fencing, ack levels, task ID allocation.
//!
//! A shard is acquired by bumping its range ID with a compare-and-swap,
//! fencing every prior owner. All in-shard writes are stamped with the
//! owner's range ID; a write that observes a newer range fails with
//! `ShardOwnershipLost` and the shard shuts down.
//!
//! Transfer task IDs are allocated from the shard row in batches: each
//! batch claim bumps the range ID under the same condition, so IDs stay
//! monotonic across ownership transfers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use windlass_common::cluster::ClusterMetadata;
use windlass_common::config::DynamicConfig;
use windlass_common::error::{EngineError, Result};
use windlass_persistence::{ShardCondition, ShardInfo, ShardStore};

struct ShardState {
    info: ShardInfo,
    /// Next transfer task ID to hand out.
    sequence_next: i64,
    /// One past the last ID of the claimed batch.
    sequence_max: i64,
}

/// One owned shard: fencing token, ack levels, task ID sequence, and the
/// observed clocks of remote clusters.
pub struct ShardContext {
    shard_id: i32,
    store: Arc<dyn ShardStore>,
    cluster_metadata: Arc<ClusterMetadata>,
    config: DynamicConfig,
    state: Mutex<ShardState>,
    /// The single engine serving this shard, installed after construction.
    engine: std::sync::Mutex<Option<Arc<crate::engine::HistoryEngine>>>,
    /// Cancelled when ownership is lost or the host shuts down; every
    /// in-flight task of this shard observes it.
    shutdown: CancellationToken,
}

impl ShardContext {
    /// Acquire the shard: read its row and CAS `range_id -> range_id + 1`.
    pub async fn acquire(
        shard_id: i32,
        store: Arc<dyn ShardStore>,
        cluster_metadata: Arc<ClusterMetadata>,
        config: DynamicConfig,
    ) -> Result<Arc<Self>> {
        let mut info = store.get_or_create_shard(shard_id).await?;
        let expected = info.range_id;
        info.range_id += 1;
        store.update_shard(info.clone(), expected).await?;

        let batch = config.task_id_batch_size;
        let sequence_next = info.range_id * batch;
        let sequence_max = (info.range_id + 1) * batch;

        info!(shard_id, range_id = info.range_id, "Shard acquired");

        Ok(Arc::new(Self {
            shard_id,
            store,
            cluster_metadata,
            config,
            state: Mutex::new(ShardState {
                info,
                sequence_next,
                sequence_max,
            }),
            engine: std::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Install the engine serving this shard. One engine per shard.
    pub fn set_engine(&self, engine: Arc<crate::engine::HistoryEngine>) {
        *self.engine.lock().expect("engine slot poisoned") = Some(engine);
    }

    /// The engine serving this shard, if installed.
    pub fn engine(&self) -> Option<Arc<crate::engine::HistoryEngine>> {
        self.engine.lock().expect("engine slot poisoned").clone()
    }

    /// Shard number.
    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    /// Cluster metadata shared engine-wide.
    pub fn cluster_metadata(&self) -> &Arc<ClusterMetadata> {
        &self.cluster_metadata
    }

    /// Dynamic configuration.
    pub fn config(&self) -> &DynamicConfig {
        &self.config
    }

    /// Token cancelled on ownership loss or shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The stamp every in-shard write must carry.
    pub async fn condition(&self) -> ShardCondition {
        let state = self.state.lock().await;
        ShardCondition {
            shard_id: self.shard_id,
            range_id: state.info.range_id,
        }
    }

    /// Next monotonic transfer task ID, refilling the batch persistently
    /// when exhausted.
    pub async fn generate_task_id(&self) -> Result<i64> {
        let mut state = self.state.lock().await;
        if state.sequence_next >= state.sequence_max {
            let expected = state.info.range_id;
            state.info.range_id += 1;
            let result = self.store.update_shard(state.info.clone(), expected).await;
            if let Err(err) = result {
                state.info.range_id = expected;
                self.on_ownership_check(&err);
                return Err(err);
            }
            let batch = self.config.task_id_batch_size;
            state.sequence_next = state.info.range_id * batch;
            state.sequence_max = (state.info.range_id + 1) * batch;
        }
        let id = state.sequence_next;
        state.sequence_next += 1;
        Ok(id)
    }

    /// Persist the in-memory shard info under the current range condition.
    async fn persist_info(&self, state: &ShardState) -> Result<()> {
        let result = self
            .store
            .update_shard(state.info.clone(), state.info.range_id)
            .await;
        if let Err(err) = &result {
            self.on_ownership_check(err);
        }
        result
    }

    fn on_ownership_check(&self, err: &EngineError) {
        if matches!(err, EngineError::ShardOwnershipLost { .. }) {
            warn!(shard_id = self.shard_id, "Shard ownership lost, shutting down");
            self.shutdown.cancel();
        }
    }

    /// Advance the shard-wide transfer ack level. Monotonic.
    pub async fn update_transfer_ack_level(&self, level: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        if level <= state.info.transfer_ack_level {
            return Ok(());
        }
        state.info.transfer_ack_level = level;
        self.persist_info(&state).await
    }

    /// Advance one cluster's transfer ack level. Monotonic.
    pub async fn update_cluster_transfer_ack_level(&self, cluster: &str, level: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let current = state
            .info
            .cluster_transfer_ack_level
            .get(cluster)
            .copied()
            .unwrap_or(0);
        if level <= current {
            return Ok(());
        }
        state
            .info
            .cluster_transfer_ack_level
            .insert(cluster.to_string(), level);
        self.persist_info(&state).await
    }

    /// Advance the shard-wide timer ack level. Monotonic.
    pub async fn update_timer_ack_level(&self, level: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        if level <= state.info.timer_ack_level {
            return Ok(());
        }
        state.info.timer_ack_level = level;
        self.persist_info(&state).await
    }

    /// Advance one cluster's timer ack level. Monotonic.
    pub async fn update_cluster_timer_ack_level(
        &self,
        cluster: &str,
        level: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let current = state
            .info
            .cluster_timer_ack_level
            .get(cluster)
            .copied()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        if level <= current {
            return Ok(());
        }
        state
            .info
            .cluster_timer_ack_level
            .insert(cluster.to_string(), level);
        self.persist_info(&state).await
    }

    /// Current transfer ack level.
    pub async fn transfer_ack_level(&self) -> i64 {
        self.state.lock().await.info.transfer_ack_level
    }

    /// One cluster's transfer ack level.
    pub async fn cluster_transfer_ack_level(&self, cluster: &str) -> i64 {
        self.state
            .lock()
            .await
            .info
            .cluster_transfer_ack_level
            .get(cluster)
            .copied()
            .unwrap_or(0)
    }

    /// One cluster's timer ack level.
    pub async fn cluster_timer_ack_level(&self, cluster: &str) -> DateTime<Utc> {
        self.state
            .lock()
            .await
            .info
            .cluster_timer_ack_level
            .get(cluster)
            .copied()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// The clock this shard uses for `cluster`: the local wall clock for
    /// the current cluster, the observed remote time otherwise.
    pub async fn current_time_for(&self, cluster: &str) -> DateTime<Utc> {
        if cluster == self.cluster_metadata.current_cluster_name() {
            return Utc::now();
        }
        self.state
            .lock()
            .await
            .info
            .standby_cluster_current_time
            .get(cluster)
            .copied()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Record a remote cluster's observed time, learned from replication
    /// traffic. Monotonic; regressions are ignored.
    pub async fn set_current_time(&self, cluster: &str, time: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        let entry = state
            .info
            .standby_cluster_current_time
            .entry(cluster.to_string())
            .or_insert(DateTime::<Utc>::MIN_UTC);
        if time > *entry {
            *entry = time;
        }
    }
}

/// Owns the shards assigned to this host.
pub struct ShardController {
    store: Arc<dyn ShardStore>,
    cluster_metadata: Arc<ClusterMetadata>,
    config: DynamicConfig,
    shards: Mutex<HashMap<i32, Arc<ShardContext>>>,
}

impl ShardController {
    /// Create a controller.
    pub fn new(
        store: Arc<dyn ShardStore>,
        cluster_metadata: Arc<ClusterMetadata>,
        config: DynamicConfig,
    ) -> Self {
        Self {
            store,
            cluster_metadata,
            config,
            shards: Mutex::new(HashMap::new()),
        }
    }

    /// Get the context for `shard_id`, acquiring the shard on first use.
    pub async fn shard(&self, shard_id: i32) -> Result<Arc<ShardContext>> {
        {
            let shards = self.shards.lock().await;
            if let Some(shard) = shards.get(&shard_id) {
                if !shard.shutdown_token().is_cancelled() {
                    return Ok(shard.clone());
                }
            }
        }

        let shard = ShardContext::acquire(
            shard_id,
            self.store.clone(),
            self.cluster_metadata.clone(),
            self.config.clone(),
        )
        .await?;
        self.shards.lock().await.insert(shard_id, shard.clone());
        Ok(shard)
    }

    /// Drop a shard after ownership loss.
    pub async fn remove_shard(&self, shard_id: i32) {
        if let Some(shard) = self.shards.lock().await.remove(&shard_id) {
            shard.shutdown_token().cancel();
            info!(shard_id, "Shard released");
        }
    }
}

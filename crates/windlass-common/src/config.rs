// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::collections::HashSet;
use std::time::Duration;

/// Windlass history service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of shards the workflow ID space is partitioned into.
    pub num_shards: i32,
    /// Dynamic knobs, adjustable per deployment.
    pub dynamic: DynamicConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `WINDLASS_NUM_SHARDS`: shard count (default: 16)
    pub fn from_env() -> Result<Self, ConfigError> {
        let num_shards: i32 = std::env::var("WINDLASS_NUM_SHARDS")
            .unwrap_or_else(|_| "16".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("WINDLASS_NUM_SHARDS", "must be a positive integer"))?;
        if num_shards <= 0 {
            return Err(ConfigError::Invalid(
                "WINDLASS_NUM_SHARDS",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            num_shards,
            dynamic: DynamicConfig::default(),
        })
    }
}

/// Knobs that deployments tune without recompiling.
#[derive(Debug, Clone)]
pub struct DynamicConfig {
    /// How far behind the active cluster a standby task may lag before the
    /// standby processor re-replicates and discards it.
    pub standby_cluster_delay: Duration,
    /// Transfer tasks read per poll.
    pub transfer_batch_size: usize,
    /// Timer tasks read per poll.
    pub timer_batch_size: usize,
    /// Poll interval of the queue processors.
    pub queue_poll_interval: Duration,
    /// Per-task processing deadline; exceeding it defers the task.
    pub task_process_timeout: Duration,
    /// Safety margin subtracted from `now` when computing the timer queue
    /// read level.
    pub timer_safety_margin: Duration,
    /// Capacity of the per-shard workflow context cache.
    pub history_cache_size: usize,
    /// Capacity of the per-shard event cache.
    pub event_cache_size: usize,
    /// Bounded attempt cap for conditional-update retry loops.
    pub mutable_state_update_max_attempts: usize,
    /// Transfer task IDs claimed from the shard row per refill.
    pub task_id_batch_size: i64,
    /// Attempts before a replication batch lands in the DLQ.
    pub replication_apply_max_attempts: usize,
    /// Whether whitelisted APIs of non-active global domains forward to the
    /// active cluster.
    pub enable_domain_not_active_forwarding: bool,
    /// APIs eligible for forwarding. Deployment policy; defaults to the
    /// mutating workflow APIs.
    pub forwarded_apis: HashSet<String>,
}

impl DynamicConfig {
    /// The default forwarding whitelist: the mutating workflow APIs.
    pub fn default_forwarded_apis() -> HashSet<String> {
        [
            "StartWorkflowExecution",
            "SignalWorkflowExecution",
            "SignalWithStartWorkflowExecution",
            "RequestCancelWorkflowExecution",
            "TerminateWorkflowExecution",
            "RespondDecisionTaskCompleted",
            "RespondDecisionTaskFailed",
            "RespondActivityTaskCompleted",
            "RespondActivityTaskFailed",
            "RespondActivityTaskCanceled",
            "ResetWorkflowExecution",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            standby_cluster_delay: Duration::from_secs(300),
            transfer_batch_size: 100,
            timer_batch_size: 100,
            queue_poll_interval: Duration::from_secs(1),
            task_process_timeout: Duration::from_secs(30),
            timer_safety_margin: Duration::from_millis(100),
            history_cache_size: 256,
            event_cache_size: 512,
            mutable_state_update_max_attempts: 5,
            task_id_batch_size: 1000,
            replication_apply_max_attempts: 3,
            enable_domain_not_active_forwarding: true,
            forwarded_apis: Self::default_forwarded_apis(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

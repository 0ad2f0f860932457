// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster metadata and failover-version arithmetic.
//!
//! Each cluster in a multi-datacenter deployment owns a disjoint residue
//! class modulo [`ClusterMetadata::failover_version_increment`]. The initial
//! failover version of a cluster is its residue; every failover bumps the
//! domain's version to the next member of the new active cluster's class.
//! The writing cluster of any event is therefore recoverable from the bare
//! version, and the numerically larger version wins ties.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::EMPTY_VERSION;

/// Static information about one cluster in the replication group.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    /// Whether the cluster participates in replication.
    pub enabled: bool,
    /// The cluster's residue class: its first failover version.
    pub initial_failover_version: i64,
    /// Front-end address used when forwarding API calls.
    pub rpc_address: String,
}

/// Immutable view of the replication group, shared engine-wide.
#[derive(Debug, Clone)]
pub struct ClusterMetadata {
    enable_global_domain: bool,
    failover_version_increment: i64,
    current_cluster_name: String,
    clusters: HashMap<String, ClusterInfo>,
}

impl ClusterMetadata {
    /// Create cluster metadata.
    ///
    /// Returns an error when the current cluster is not a member of
    /// `clusters` or when any initial failover version is outside
    /// `[0, failover_version_increment)`.
    pub fn new(
        enable_global_domain: bool,
        failover_version_increment: i64,
        current_cluster_name: impl Into<String>,
        clusters: HashMap<String, ClusterInfo>,
    ) -> Result<Arc<Self>> {
        let current_cluster_name = current_cluster_name.into();
        if !clusters.contains_key(&current_cluster_name) {
            return Err(EngineError::Internal {
                details: format!(
                    "current cluster '{}' missing from cluster info",
                    current_cluster_name
                ),
            });
        }
        for (name, info) in &clusters {
            if info.initial_failover_version < 0
                || info.initial_failover_version >= failover_version_increment
            {
                return Err(EngineError::Internal {
                    details: format!(
                        "cluster '{}' initial failover version {} outside increment {}",
                        name, info.initial_failover_version, failover_version_increment
                    ),
                });
            }
        }
        Ok(Arc::new(Self {
            enable_global_domain,
            failover_version_increment,
            current_cluster_name,
            clusters,
        }))
    }

    /// Whether cross-cluster (global) domains are enabled at all.
    pub fn is_global_domain_enabled(&self) -> bool {
        self.enable_global_domain
    }

    /// The name of this cluster.
    pub fn current_cluster_name(&self) -> &str {
        &self.current_cluster_name
    }

    /// The spacing between consecutive failover versions of one cluster.
    pub fn failover_version_increment(&self) -> i64 {
        self.failover_version_increment
    }

    /// All known clusters.
    pub fn all_cluster_info(&self) -> &HashMap<String, ClusterInfo> {
        &self.clusters
    }

    /// Resolve the cluster that wrote a failover version.
    ///
    /// `EMPTY_VERSION` belongs to no cluster; local-domain writes resolve to
    /// the current cluster.
    pub fn cluster_name_for_failover_version(&self, version: i64) -> Result<&str> {
        if version == EMPTY_VERSION {
            return Ok(&self.current_cluster_name);
        }
        let residue = version % self.failover_version_increment;
        self.clusters
            .iter()
            .find(|(_, info)| info.initial_failover_version == residue)
            .map(|(name, _)| name.as_str())
            .ok_or_else(|| EngineError::Internal {
                details: format!("no cluster owns failover version {}", version),
            })
    }

    /// Compute the next failover version for `cluster` strictly greater
    /// than `current_version`.
    pub fn next_failover_version(&self, cluster: &str, current_version: i64) -> Result<i64> {
        let info = self.clusters.get(cluster).ok_or_else(|| EngineError::Internal {
            details: format!("unknown cluster '{}'", cluster),
        })?;
        let base = info.initial_failover_version;
        if current_version < base {
            return Ok(base);
        }
        let cycles = (current_version - base) / self.failover_version_increment + 1;
        Ok(base + cycles * self.failover_version_increment)
    }

    /// Whether `version` was written by this cluster.
    pub fn is_version_from_current_cluster(&self, version: i64) -> bool {
        self.cluster_name_for_failover_version(version)
            .map(|name| name == self.current_cluster_name)
            .unwrap_or(false)
    }
}

pub mod test_fixtures {
    //! Canonical two-cluster fixture used across the workspace's tests.

    use super::*;

    /// Name of the cluster the tests run "in".
    pub const TEST_CURRENT_CLUSTER: &str = "active";
    /// Name of the other cluster in the pair.
    pub const TEST_ALTERNATIVE_CLUSTER: &str = "standby";
    /// Version spacing used by the fixture.
    pub const TEST_VERSION_INCREMENT: i64 = 10;

    /// Build the two-cluster metadata fixture.
    pub fn two_cluster_metadata() -> Arc<ClusterMetadata> {
        let mut clusters = HashMap::new();
        clusters.insert(
            TEST_CURRENT_CLUSTER.to_string(),
            ClusterInfo {
                enabled: true,
                initial_failover_version: 1,
                rpc_address: "127.0.0.1:7933".to_string(),
            },
        );
        clusters.insert(
            TEST_ALTERNATIVE_CLUSTER.to_string(),
            ClusterInfo {
                enabled: true,
                initial_failover_version: 2,
                rpc_address: "127.0.0.1:8933".to_string(),
            },
        );
        ClusterMetadata::new(true, TEST_VERSION_INCREMENT, TEST_CURRENT_CLUSTER, clusters)
            .expect("fixture metadata is valid")
    }
}

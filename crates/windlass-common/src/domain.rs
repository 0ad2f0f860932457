// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain records, the domain store contract, and the TTL domain cache.
//!
//! A *domain* is a tenant namespace carrying its own replication
//! configuration, retention, and archival policy. The engine never reads
//! domain rows directly; everything goes through [`DomainCache`], which
//! caches both hits and misses with a TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{EngineError, Result};
use crate::EMPTY_VERSION;

/// Replication configuration of a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainReplicationConfig {
    /// The cluster currently executing side effects for this domain.
    pub active_cluster: String,
    /// All clusters the domain replicates to, active included.
    pub clusters: Vec<String>,
}

/// One domain's authoritative record.
#[derive(Debug, Clone)]
pub struct DomainEntry {
    /// Stable domain ID.
    pub id: String,
    /// Human-facing domain name.
    pub name: String,
    /// Whether the domain replicates across clusters.
    pub is_global: bool,
    /// Replication configuration.
    pub replication: DomainReplicationConfig,
    /// The domain's current failover version.
    pub failover_version: i64,
    /// History retention before deletion, in days.
    pub retention_days: i32,
    /// Whether closed histories are archived before deletion.
    ///
    /// Read once at startup; archival cannot be toggled at runtime.
    pub archival_enabled: bool,
}

impl DomainEntry {
    /// Whether this domain is active in `cluster`.
    pub fn is_active_in(&self, cluster: &str) -> bool {
        !self.is_global || self.replication.active_cluster == cluster
    }

    /// The failover version new events must carry when written from the
    /// active cluster, or [`EMPTY_VERSION`] for local domains.
    pub fn write_version(&self) -> i64 {
        if self.is_global {
            self.failover_version
        } else {
            EMPTY_VERSION
        }
    }
}

/// Source of truth for domain records.
#[async_trait]
pub trait DomainStore: Send + Sync {
    /// Fetch a domain by its stable ID. `Ok(None)` means the domain does
    /// not exist (cached negatively by [`DomainCache`]).
    async fn get_domain_by_id(&self, id: &str) -> Result<Option<DomainEntry>>;

    /// Fetch a domain by name.
    async fn get_domain_by_name(&self, name: &str) -> Result<Option<DomainEntry>>;
}

struct CachedDomain {
    entry: Option<DomainEntry>,
    fetched_at: DateTime<Utc>,
}

/// TTL cache over a [`DomainStore`], with negative caching for lookups of
/// nonexistent domains.
pub struct DomainCache {
    store: Arc<dyn DomainStore>,
    ttl: Duration,
    by_id: RwLock<HashMap<String, CachedDomain>>,
    by_name: RwLock<HashMap<String, CachedDomain>>,
}

impl DomainCache {
    /// Create a cache over `store` with entries living for `ttl`.
    pub fn new(store: Arc<dyn DomainStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            by_id: RwLock::new(HashMap::new()),
            by_name: RwLock::new(HashMap::new()),
        }
    }

    fn is_fresh(&self, cached: &CachedDomain) -> bool {
        let age = Utc::now().signed_duration_since(cached.fetched_at);
        age.to_std().map(|age| age < self.ttl).unwrap_or(false)
    }

    /// Get a domain by ID, consulting the store on miss or expiry.
    ///
    /// Returns `EntityNotExists` for unknown domains; the miss itself is
    /// cached so hot lookups of bad IDs do not hammer the store.
    pub async fn get_domain_by_id(&self, id: &str) -> Result<DomainEntry> {
        {
            let cache = self.by_id.read().await;
            if let Some(cached) = cache.get(id) {
                if self.is_fresh(cached) {
                    return cached.entry.clone().ok_or_else(|| EngineError::EntityNotExists {
                        entity: format!("domain id '{}'", id),
                    });
                }
            }
        }

        let entry = self.store.get_domain_by_id(id).await?;
        let mut cache = self.by_id.write().await;
        cache.insert(
            id.to_string(),
            CachedDomain {
                entry: entry.clone(),
                fetched_at: Utc::now(),
            },
        );
        entry.ok_or_else(|| EngineError::EntityNotExists {
            entity: format!("domain id '{}'", id),
        })
    }

    /// Get a domain by name, consulting the store on miss or expiry.
    pub async fn get_domain_by_name(&self, name: &str) -> Result<DomainEntry> {
        {
            let cache = self.by_name.read().await;
            if let Some(cached) = cache.get(name) {
                if self.is_fresh(cached) {
                    return cached.entry.clone().ok_or_else(|| EngineError::EntityNotExists {
                        entity: format!("domain '{}'", name),
                    });
                }
            }
        }

        let entry = self.store.get_domain_by_name(name).await?;
        let mut cache = self.by_name.write().await;
        cache.insert(
            name.to_string(),
            CachedDomain {
                entry: entry.clone(),
                fetched_at: Utc::now(),
            },
        );
        entry.ok_or_else(|| EngineError::EntityNotExists {
            entity: format!("domain '{}'", name),
        })
    }

    /// Drop a domain from the cache, forcing a store read on next lookup.
    ///
    /// Used by the redirection layer when a `DomainNotActive` error proves
    /// the cached active cluster is stale.
    pub async fn invalidate(&self, id_or_name: &str) {
        self.by_id.write().await.remove(id_or_name);
        self.by_name.write().await.remove(id_or_name);
    }
}

pub mod test_fixtures {
    //! In-memory domain store used across the workspace's tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A `DomainStore` over a fixed map, counting fetches.
    pub struct StaticDomainStore {
        domains: Vec<DomainEntry>,
        fetches: AtomicUsize,
    }

    impl StaticDomainStore {
        /// Build a store serving `domains`.
        pub fn new(domains: Vec<DomainEntry>) -> Arc<Self> {
            Arc::new(Self {
                domains,
                fetches: AtomicUsize::new(0),
            })
        }

        /// Number of fetches that reached this store.
        pub fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DomainStore for StaticDomainStore {
        async fn get_domain_by_id(&self, id: &str) -> Result<Option<DomainEntry>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.domains.iter().find(|d| d.id == id).cloned())
        }

        async fn get_domain_by_name(&self, name: &str) -> Result<Option<DomainEntry>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.domains.iter().find(|d| d.name == name).cloned())
        }
    }

    /// A global domain active in `active_cluster`, replicated to `clusters`.
    pub fn global_domain(
        id: &str,
        name: &str,
        active_cluster: &str,
        clusters: &[&str],
        failover_version: i64,
    ) -> DomainEntry {
        DomainEntry {
            id: id.to_string(),
            name: name.to_string(),
            is_global: true,
            replication: DomainReplicationConfig {
                active_cluster: active_cluster.to_string(),
                clusters: clusters.iter().map(|c| c.to_string()).collect(),
            },
            failover_version,
            retention_days: 7,
            archival_enabled: false,
        }
    }

    /// A local domain pinned to `cluster`.
    pub fn local_domain(id: &str, name: &str, cluster: &str) -> DomainEntry {
        DomainEntry {
            id: id.to_string(),
            name: name.to_string(),
            is_global: false,
            replication: DomainReplicationConfig {
                active_cluster: cluster.to_string(),
                clusters: vec![cluster.to_string()],
            },
            failover_version: EMPTY_VERSION,
            retention_days: 7,
            archival_enabled: false,
        }
    }
}

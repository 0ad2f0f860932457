// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DC redirection policies.
//!
//! `with_domain_id_redirect` / `with_domain_name_redirect` invoke the
//! caller's closure with the chosen target cluster. When the call fails
//! with `DomainNotActive` naming a different active cluster, the cached
//! belief was stale: the forwarding policy invalidates it and retries the
//! named cluster exactly once.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info};

use windlass_common::cluster::ClusterMetadata;
use windlass_common::config::DynamicConfig;
use windlass_common::domain::{DomainCache, DomainEntry};
use windlass_common::error::{EngineError, Result};

/// Execute everything locally.
pub struct NoopRedirectionPolicy {
    current_cluster: String,
}

impl NoopRedirectionPolicy {
    /// Create a no-op policy for `current_cluster`.
    pub fn new(current_cluster: impl Into<String>) -> Self {
        Self {
            current_cluster: current_cluster.into(),
        }
    }

    /// Invoke `call` against the local cluster.
    pub async fn with_domain_redirect<T, F, Fut>(
        &self,
        _domain: &str,
        _api: &str,
        call: F,
    ) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        call(self.current_cluster.clone()).await
    }
}

/// Forward a closed set of mutating APIs of non-local global domains to the
/// active cluster.
pub struct SelectedApisForwardingPolicy {
    current_cluster: String,
    config: DynamicConfig,
    cluster_metadata: Arc<ClusterMetadata>,
    domain_cache: Arc<DomainCache>,
}

impl SelectedApisForwardingPolicy {
    /// Create a forwarding policy.
    pub fn new(
        cluster_metadata: Arc<ClusterMetadata>,
        config: DynamicConfig,
        domain_cache: Arc<DomainCache>,
    ) -> Self {
        Self {
            current_cluster: cluster_metadata.current_cluster_name().to_string(),
            config,
            cluster_metadata,
            domain_cache,
        }
    }

    /// Where the call should execute for `domain` and `api`.
    fn target_cluster(&self, domain: &DomainEntry, api: &str) -> String {
        if !self.cluster_metadata.is_global_domain_enabled() {
            return self.current_cluster.clone();
        }
        if !domain.is_global || domain.replication.clusters.len() <= 1 {
            return self.current_cluster.clone();
        }
        if !self.config.forwarded_apis.contains(api) {
            return self.current_cluster.clone();
        }
        if !self.config.enable_domain_not_active_forwarding {
            return self.current_cluster.clone();
        }
        domain.replication.active_cluster.clone()
    }

    async fn with_redirect<T, F, Fut>(
        &self,
        domain_key: &str,
        domain: DomainEntry,
        api: &str,
        call: F,
    ) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let target = self.target_cluster(&domain, api);
        debug!(domain = %domain.name, api, %target, "Routing API call");

        match call(target.clone()).await {
            Ok(value) => Ok(value),
            Err(EngineError::DomainNotActive { active_cluster, .. })
                if active_cluster != target && self.config.forwarded_apis.contains(api) =>
            {
                // stale belief; refresh and retry the named cluster once
                info!(
                    domain = %domain.name,
                    api,
                    stale_target = %target,
                    %active_cluster,
                    "Domain not active at target, retrying active cluster"
                );
                self.domain_cache.invalidate(domain_key).await;
                call(active_cluster).await
            }
            Err(err) => Err(err),
        }
    }

    /// Route a call identified by domain ID.
    pub async fn with_domain_id_redirect<T, F, Fut>(
        &self,
        domain_id: &str,
        api: &str,
        call: F,
    ) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let domain = self.domain_cache.get_domain_by_id(domain_id).await?;
        self.with_redirect(domain_id, domain, api, call).await
    }

    /// Route a call identified by domain name.
    pub async fn with_domain_name_redirect<T, F, Fut>(
        &self,
        domain_name: &str,
        api: &str,
        call: F,
    ) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let domain = self.domain_cache.get_domain_by_name(domain_name).await?;
        self.with_redirect(domain_name, domain, api, call).await
    }
}

/// The deployment-selected redirection policy.
pub enum DcRedirectionPolicy {
    /// Everything local.
    Noop(NoopRedirectionPolicy),
    /// Whitelisted mutations forward to the active cluster.
    SelectedApisForwarding(SelectedApisForwardingPolicy),
}

impl DcRedirectionPolicy {
    /// Route a call identified by domain ID through the selected policy.
    pub async fn with_domain_id_redirect<T, F, Fut>(
        &self,
        domain_id: &str,
        api: &str,
        call: F,
    ) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self {
            Self::Noop(policy) => policy.with_domain_redirect(domain_id, api, call).await,
            Self::SelectedApisForwarding(policy) => {
                policy.with_domain_id_redirect(domain_id, api, call).await
            }
        }
    }

    /// Route a call identified by domain name through the selected policy.
    pub async fn with_domain_name_redirect<T, F, Fut>(
        &self,
        domain_name: &str,
        api: &str,
        call: F,
    ) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self {
            Self::Noop(policy) => policy.with_domain_redirect(domain_name, api, call).await,
            Self::SelectedApisForwarding(policy) => {
                policy.with_domain_name_redirect(domain_name, api, call).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use windlass_common::cluster::test_fixtures::{
        two_cluster_metadata, TEST_ALTERNATIVE_CLUSTER, TEST_CURRENT_CLUSTER,
    };
    use windlass_common::domain::test_fixtures::{
        global_domain, local_domain, StaticDomainStore,
    };

    const API: &str = "SignalWorkflowExecution";
    const NON_WHITELISTED_API: &str = "DescribeWorkflowExecution";

    fn forwarding_policy(
        domains: Vec<DomainEntry>,
        forwarding_enabled: bool,
    ) -> SelectedApisForwardingPolicy {
        let store = StaticDomainStore::new(domains);
        let cache = Arc::new(DomainCache::new(store, Duration::from_secs(60)));
        let mut config = DynamicConfig::default();
        config.enable_domain_not_active_forwarding = forwarding_enabled;
        SelectedApisForwardingPolicy::new(two_cluster_metadata(), config, cache)
    }

    #[tokio::test]
    async fn test_noop_always_local() {
        let policy = NoopRedirectionPolicy::new(TEST_CURRENT_CLUSTER);
        let calls = AtomicUsize::new(0);

        let result = policy
            .with_domain_redirect("d1", API, |target| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    assert_eq!(target, TEST_CURRENT_CLUSTER);
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_domain_stays_local() {
        let policy = forwarding_policy(
            vec![local_domain("d1", "orders", TEST_CURRENT_CLUSTER)],
            true,
        );
        policy
            .with_domain_id_redirect("d1", API, |target| async move {
                assert_eq!(target, TEST_CURRENT_CLUSTER);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_single_cluster_global_domain_stays_local() {
        let policy = forwarding_policy(
            vec![global_domain(
                "d1",
                "orders",
                TEST_ALTERNATIVE_CLUSTER,
                &[TEST_ALTERNATIVE_CLUSTER],
                2,
            )],
            true,
        );
        policy
            .with_domain_id_redirect("d1", API, |target| async move {
                assert_eq!(target, TEST_CURRENT_CLUSTER);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_whitelisted_api_stays_local() {
        let policy = forwarding_policy(
            vec![global_domain(
                "d1",
                "orders",
                TEST_ALTERNATIVE_CLUSTER,
                &[TEST_CURRENT_CLUSTER, TEST_ALTERNATIVE_CLUSTER],
                2,
            )],
            true,
        );
        policy
            .with_domain_id_redirect("d1", NON_WHITELISTED_API, |target| async move {
                assert_eq!(target, TEST_CURRENT_CLUSTER);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_forwarding_disabled_stays_local() {
        let policy = forwarding_policy(
            vec![global_domain(
                "d1",
                "orders",
                TEST_ALTERNATIVE_CLUSTER,
                &[TEST_CURRENT_CLUSTER, TEST_ALTERNATIVE_CLUSTER],
                2,
            )],
            false,
        );
        policy
            .with_domain_id_redirect("d1", API, |target| async move {
                assert_eq!(target, TEST_CURRENT_CLUSTER);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_whitelisted_api_forwards_to_active() {
        let policy = forwarding_policy(
            vec![global_domain(
                "d1",
                "orders",
                TEST_ALTERNATIVE_CLUSTER,
                &[TEST_CURRENT_CLUSTER, TEST_ALTERNATIVE_CLUSTER],
                2,
            )],
            true,
        );
        policy
            .with_domain_id_redirect("d1", API, |target| async move {
                assert_eq!(target, TEST_ALTERNATIVE_CLUSTER);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stale_belief_retries_named_cluster_once() {
        // local belief: active here; reality: active in the other cluster
        let policy = forwarding_policy(
            vec![global_domain(
                "d1",
                "orders",
                TEST_CURRENT_CLUSTER,
                &[TEST_CURRENT_CLUSTER, TEST_ALTERNATIVE_CLUSTER],
                1,
            )],
            true,
        );
        let local_calls = Arc::new(AtomicUsize::new(0));
        let remote_calls = Arc::new(AtomicUsize::new(0));

        let local = local_calls.clone();
        let remote = remote_calls.clone();
        policy
            .with_domain_id_redirect("d1", API, move |target| {
                let local = local.clone();
                let remote = remote.clone();
                async move {
                    match target.as_str() {
                        TEST_CURRENT_CLUSTER => {
                            local.fetch_add(1, Ordering::SeqCst);
                            Err(EngineError::DomainNotActive {
                                domain: "orders".to_string(),
                                current_cluster: TEST_CURRENT_CLUSTER.to_string(),
                                active_cluster: TEST_ALTERNATIVE_CLUSTER.to_string(),
                            })
                        }
                        TEST_ALTERNATIVE_CLUSTER => {
                            remote.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                        other => panic!("unknown cluster {}", other),
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(local_calls.load(Ordering::SeqCst), 1);
        assert_eq!(remote_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_naming_same_cluster_is_not_retried() {
        let policy = forwarding_policy(
            vec![global_domain(
                "d1",
                "orders",
                TEST_ALTERNATIVE_CLUSTER,
                &[TEST_CURRENT_CLUSTER, TEST_ALTERNATIVE_CLUSTER],
                2,
            )],
            true,
        );
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let err = policy
            .with_domain_id_redirect("d1", API, move |_target| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(EngineError::DomainNotActive {
                        domain: "orders".to_string(),
                        current_cluster: TEST_ALTERNATIVE_CLUSTER.to_string(),
                        active_cluster: TEST_ALTERNATIVE_CLUSTER.to_string(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "DOMAIN_NOT_ACTIVE");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_name_redirect_matches_id_redirect() {
        let policy = forwarding_policy(
            vec![global_domain(
                "d1",
                "orders",
                TEST_ALTERNATIVE_CLUSTER,
                &[TEST_CURRENT_CLUSTER, TEST_ALTERNATIVE_CLUSTER],
                2,
            )],
            true,
        );
        let calls = AtomicUsize::new(0);
        policy
            .with_domain_name_redirect("orders", API, |target| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    assert_eq!(target, TEST_ALTERNATIVE_CLUSTER);
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

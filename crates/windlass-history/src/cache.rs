// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded caches for workflow contexts and individual events.
//!
//! The history cache holds at most one context per run and serializes all
//! mutation of that run through the context's lock. Acquisition pins the
//! entry; pinned entries are never evicted, and when the cache is full of
//! pinned entries acquisition fails with `ServiceBusy` instead of blocking
//! unboundedly. Releasing with an error poisons the entry: the cached
//! state is dropped so the next acquisition reloads from persistence.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use windlass_common::error::{EngineError, Result};
use windlass_persistence::{ExecutionStore, HistoryEvent, HistoryStore, WorkflowKey};

use crate::context::WorkflowContext;
use crate::shard::ShardContext;

struct CacheEntry {
    context: Arc<Mutex<WorkflowContext>>,
    pins: usize,
    last_access: u64,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    access_counter: u64,
}

/// Bounded, pinned LRU of workflow contexts, keyed by run ID within one
/// shard.
pub struct HistoryCache {
    capacity: usize,
    shard: Arc<ShardContext>,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    inner: StdMutex<CacheInner>,
}

impl HistoryCache {
    /// Create a cache for one shard.
    pub fn new(
        shard: Arc<ShardContext>,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
    ) -> Arc<Self> {
        let capacity = shard.config().history_cache_size;
        Arc::new(Self {
            capacity,
            shard,
            execution_store,
            history_store,
            inner: StdMutex::new(CacheInner {
                entries: HashMap::new(),
                access_counter: 0,
            }),
        })
    }

    /// Acquire exclusive mutation rights for one run.
    ///
    /// The returned guard unpins on drop; callers that hit an error release
    /// through [`WorkflowContextGuard::release`] so the entry is poisoned.
    pub async fn acquire(self: &Arc<Self>, key: WorkflowKey) -> Result<WorkflowContextGuard> {
        let context = {
            let mut inner = self.inner.lock().expect("cache lock poisoned");
            inner.access_counter += 1;
            let access = inner.access_counter;

            if let Some(entry) = inner.entries.get_mut(&key.run_id) {
                entry.pins += 1;
                entry.last_access = access;
                entry.context.clone()
            } else {
                if inner.entries.len() >= self.capacity {
                    // evict the least recently used unpinned entry
                    let victim = inner
                        .entries
                        .iter()
                        .filter(|(_, e)| e.pins == 0)
                        .min_by_key(|(_, e)| e.last_access)
                        .map(|(run_id, _)| run_id.clone());
                    match victim {
                        Some(run_id) => {
                            inner.entries.remove(&run_id);
                            debug!(%run_id, "Evicted workflow context");
                        }
                        None => return Err(EngineError::ServiceBusy),
                    }
                }
                let context = Arc::new(Mutex::new(WorkflowContext::new(
                    key.clone(),
                    self.shard.clone(),
                    self.execution_store.clone(),
                    self.history_store.clone(),
                )));
                inner.entries.insert(
                    key.run_id.clone(),
                    CacheEntry {
                        context: context.clone(),
                        pins: 1,
                        last_access: access,
                    },
                );
                context
            }
        };

        let guard = context.lock_owned().await;
        Ok(WorkflowContextGuard {
            cache: self.clone(),
            run_id: key.run_id,
            guard: Some(guard),
            poisoned: false,
        })
    }

    fn unpin(&self, run_id: &str) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if let Some(entry) = inner.entries.get_mut(run_id) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    #[cfg(test)]
    fn pins(&self, run_id: &str) -> usize {
        self.inner
            .lock()
            .expect("cache lock poisoned")
            .entries
            .get(run_id)
            .map(|e| e.pins)
            .unwrap_or(0)
    }
}

/// Exclusive mutation rights for one run's context.
///
/// Dropping the guard releases cleanly. Error paths go through
/// [`release`](Self::release), which poisons the cached state so the next
/// acquisition reloads from persistence.
pub struct WorkflowContextGuard {
    cache: Arc<HistoryCache>,
    run_id: String,
    guard: Option<OwnedMutexGuard<WorkflowContext>>,
    poisoned: bool,
}

impl WorkflowContextGuard {
    /// Release, poisoning the cached state when `outcome` is an error.
    pub fn release<T>(mut self, outcome: &Result<T>) {
        if outcome.is_err() {
            self.poisoned = true;
        }
    }

    /// Mark the cached state for disposal on release.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }
}

impl Deref for WorkflowContextGuard {
    type Target = WorkflowContext;

    fn deref(&self) -> &Self::Target {
        self.guard.as_ref().expect("guard held until drop")
    }
}

impl DerefMut for WorkflowContextGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_mut().expect("guard held until drop")
    }
}

impl Drop for WorkflowContextGuard {
    fn drop(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            if self.poisoned {
                guard.clear();
            }
            drop(guard);
        }
        self.cache.unpin(&self.run_id);
    }
}

/// Bounded LRU of individual history events, keyed by `(run_id, event_id)`.
pub struct EventCache {
    capacity: usize,
    inner: StdMutex<EventCacheInner>,
}

struct EventCacheInner {
    entries: HashMap<(String, i64), (HistoryEvent, u64)>,
    access_counter: u64,
}

impl EventCache {
    /// Create a cache holding up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: StdMutex::new(EventCacheInner {
                entries: HashMap::new(),
                access_counter: 0,
            }),
        }
    }

    /// Cache one event.
    pub fn put(&self, run_id: &str, event: HistoryEvent) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.access_counter += 1;
        let access = inner.access_counter;
        if inner.entries.len() >= self.capacity {
            if let Some(key) = inner
                .entries
                .iter()
                .min_by_key(|(_, (_, last))| *last)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&key);
            }
        }
        inner
            .entries
            .insert((run_id.to_string(), event.event_id), (event, access));
    }

    /// Look one event up.
    pub fn get(&self, run_id: &str, event_id: i64) -> Option<HistoryEvent> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.access_counter += 1;
        let access = inner.access_counter;
        inner
            .entries
            .get_mut(&(run_id.to_string(), event_id))
            .map(|(event, last)| {
                *last = access;
                event.clone()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use windlass_common::cluster::test_fixtures::two_cluster_metadata;
    use windlass_common::config::DynamicConfig;
    use windlass_persistence::memory::MemoryStore;
    use windlass_persistence::EventAttributes;

    async fn cache_with_capacity(capacity: usize) -> Arc<HistoryCache> {
        let store = MemoryStore::new();
        let mut config = DynamicConfig::default();
        config.history_cache_size = capacity;
        let shard = ShardContext::acquire(1, store.clone(), two_cluster_metadata(), config)
            .await
            .unwrap();
        HistoryCache::new(shard, store.clone(), store)
    }

    fn key(run_id: &str) -> WorkflowKey {
        WorkflowKey::new("d1", "w1", run_id)
    }

    #[tokio::test]
    async fn test_acquire_pins_and_drop_unpins() {
        let cache = cache_with_capacity(4).await;
        let guard = cache.acquire(key("r1")).await.unwrap();
        assert_eq!(cache.pins("r1"), 1);
        drop(guard);
        assert_eq!(cache.pins("r1"), 0);
    }

    #[tokio::test]
    async fn test_full_of_pinned_entries_is_service_busy() {
        let cache = cache_with_capacity(2).await;
        let _g1 = cache.acquire(key("r1")).await.unwrap();
        let _g2 = cache.acquire(key("r2")).await.unwrap();

        let err = cache.acquire(key("r3")).await.unwrap_err();
        assert_eq!(err.error_code(), "SERVICE_BUSY");
    }

    #[tokio::test]
    async fn test_unpinned_lru_is_evicted() {
        let cache = cache_with_capacity(2).await;
        drop(cache.acquire(key("r1")).await.unwrap());
        drop(cache.acquire(key("r2")).await.unwrap());

        // r1 is the LRU unpinned entry; r3 takes its slot
        let _g3 = cache.acquire(key("r3")).await.unwrap();
        let inner = cache.inner.lock().unwrap();
        assert!(!inner.entries.contains_key("r1"));
        assert!(inner.entries.contains_key("r2"));
        assert!(inner.entries.contains_key("r3"));
    }

    #[tokio::test]
    async fn test_release_with_error_poisons_state() {
        let cache = cache_with_capacity(4).await;
        let mut guard = cache.acquire(key("r1")).await.unwrap();
        guard.set_mutable_state(crate::mutable_state::MutableState::new(
            key("r1"),
            "b".to_string(),
            0,
        ));
        let outcome: Result<()> = Err(EngineError::ServiceBusy);
        guard.release(&outcome);

        let mut guard = cache.acquire(key("r1")).await.unwrap();
        assert!(guard.mutable_state().is_none());
    }

    #[tokio::test]
    async fn test_clean_release_keeps_state() {
        let cache = cache_with_capacity(4).await;
        let mut guard = cache.acquire(key("r1")).await.unwrap();
        guard.set_mutable_state(crate::mutable_state::MutableState::new(
            key("r1"),
            "b".to_string(),
            0,
        ));
        drop(guard);

        let mut guard = cache.acquire(key("r1")).await.unwrap();
        assert!(guard.mutable_state().is_some());
    }

    #[test]
    fn test_event_cache_lru() {
        let cache = EventCache::new(2);
        let event = |event_id| HistoryEvent {
            event_id,
            version: 1,
            timestamp: Utc::now(),
            attributes: EventAttributes::WorkflowExecutionTimedOut,
        };
        cache.put("r1", event(1));
        cache.put("r1", event(2));
        // touch event 1 so event 2 becomes the LRU
        cache.get("r1", 1);
        cache.put("r1", event(3));

        assert!(cache.get("r1", 1).is_some());
        assert!(cache.get("r1", 2).is_none());
        assert!(cache.get("r1", 3).is_some());
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for windlass-history integration tests.
//!
//! Provides a TestContext wiring the in-memory store, a shard, the engine,
//! and recording mocks for every remote collaborator.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use windlass_common::cluster::test_fixtures::two_cluster_metadata;
use windlass_common::config::DynamicConfig;
use windlass_common::domain::test_fixtures::StaticDomainStore;
use windlass_common::domain::{DomainCache, DomainEntry};
use windlass_common::error::Result;
use windlass_history::cache::HistoryCache;
use windlass_history::clients::{
    HistoryRereplicator, MatchingClient, RemoteWorkflowClient, VisibilityClient,
};
use windlass_history::engine::HistoryEngine;
use windlass_history::shard::ShardContext;
use windlass_history::transfer_active::ActiveTransferExecutor;
use windlass_history::transfer_queue::TransferQueueProcessor;
use windlass_history::transfer_standby::StandbyTransferExecutor;
use windlass_persistence::memory::MemoryStore;
use windlass_persistence::{CloseStatus, EventAttributes, HistoryEvent, TransferTask};

pub const TEST_SHARD_ID: i32 = 1;

/// Matching client that records every dispatch.
#[derive(Default)]
pub struct RecordingMatchingClient {
    /// `(domain_id, run_id, schedule_id, task_list)` per activity dispatch.
    pub activity_calls: Mutex<Vec<(String, String, i64, String)>>,
    /// `(domain_id, run_id, schedule_id, task_list)` per decision dispatch.
    pub decision_calls: Mutex<Vec<(String, String, i64, String)>>,
}

#[async_trait]
impl MatchingClient for RecordingMatchingClient {
    async fn add_decision_task(
        &self,
        domain_id: &str,
        _workflow_id: &str,
        run_id: &str,
        schedule_id: i64,
        task_list: &str,
        _schedule_to_start_seconds: i32,
    ) -> Result<()> {
        self.decision_calls.lock().await.push((
            domain_id.to_string(),
            run_id.to_string(),
            schedule_id,
            task_list.to_string(),
        ));
        Ok(())
    }

    async fn add_activity_task(
        &self,
        domain_id: &str,
        _workflow_id: &str,
        run_id: &str,
        schedule_id: i64,
        task_list: &str,
        _schedule_to_start_seconds: i32,
    ) -> Result<()> {
        self.activity_calls.lock().await.push((
            domain_id.to_string(),
            run_id.to_string(),
            schedule_id,
            task_list.to_string(),
        ));
        Ok(())
    }
}

/// Visibility client that records every write.
#[derive(Default)]
pub struct RecordingVisibilityClient {
    pub started: Mutex<Vec<(String, String)>>,
    pub closed: Mutex<Vec<(String, String, CloseStatus)>>,
    pub upserts: Mutex<Vec<String>>,
}

#[async_trait]
impl VisibilityClient for RecordingVisibilityClient {
    async fn record_workflow_started(
        &self,
        domain_id: &str,
        _workflow_id: &str,
        run_id: &str,
        _workflow_type: &str,
        _start_time: DateTime<Utc>,
    ) -> Result<()> {
        self.started
            .lock()
            .await
            .push((domain_id.to_string(), run_id.to_string()));
        Ok(())
    }

    async fn record_workflow_closed(
        &self,
        domain_id: &str,
        _workflow_id: &str,
        run_id: &str,
        _workflow_type: &str,
        close_status: CloseStatus,
        _close_time: DateTime<Utc>,
    ) -> Result<()> {
        self.closed
            .lock()
            .await
            .push((domain_id.to_string(), run_id.to_string(), close_status));
        Ok(())
    }

    async fn upsert_search_attributes(
        &self,
        _domain_id: &str,
        _workflow_id: &str,
        run_id: &str,
        _attributes: &std::collections::HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        self.upserts.lock().await.push(run_id.to_string());
        Ok(())
    }
}

/// Remote workflow client that records calls and succeeds.
#[derive(Default)]
pub struct RecordingRemoteClient {
    pub cancel_calls: Mutex<Vec<(String, String, String)>>,
    pub signal_calls: Mutex<Vec<(String, String, String)>>,
    pub start_calls: Mutex<Vec<(String, String)>>,
    pub child_completed_calls: Mutex<Vec<(String, i64)>>,
}

#[async_trait]
impl RemoteWorkflowClient for RecordingRemoteClient {
    async fn start_workflow(
        &self,
        domain_id: &str,
        workflow_id: &str,
        _workflow_type: &str,
        _task_list: &str,
        _input: Option<serde_json::Value>,
    ) -> Result<String> {
        self.start_calls
            .lock()
            .await
            .push((domain_id.to_string(), workflow_id.to_string()));
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn request_cancel(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<()> {
        self.cancel_calls.lock().await.push((
            domain_id.to_string(),
            workflow_id.to_string(),
            run_id.to_string(),
        ));
        Ok(())
    }

    async fn signal(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
        _signal_name: &str,
        _input: Option<serde_json::Value>,
    ) -> Result<()> {
        self.signal_calls.lock().await.push((
            domain_id.to_string(),
            workflow_id.to_string(),
            run_id.to_string(),
        ));
        Ok(())
    }

    async fn record_child_completed(
        &self,
        _parent_domain_id: &str,
        parent_workflow_id: &str,
        _parent_run_id: &str,
        initiated_id: i64,
        _child_run_id: &str,
    ) -> Result<()> {
        self.child_completed_calls
            .lock()
            .await
            .push((parent_workflow_id.to_string(), initiated_id));
        Ok(())
    }
}

/// Re-replicator that records the requested ranges.
#[derive(Default)]
pub struct RecordingRereplicator {
    /// `(domain_id, workflow_id, begin_run_id, begin_event_id, end_event_id)`.
    pub calls: Mutex<Vec<(String, String, String, i64, i64)>>,
}

#[async_trait]
impl HistoryRereplicator for RecordingRereplicator {
    async fn send_multi_workflow_history(
        &self,
        domain_id: &str,
        workflow_id: &str,
        begin_run_id: &str,
        begin_event_id: i64,
        _end_run_id: &str,
        end_event_id: i64,
    ) -> Result<()> {
        self.calls.lock().await.push((
            domain_id.to_string(),
            workflow_id.to_string(),
            begin_run_id.to_string(),
            begin_event_id,
            end_event_id,
        ));
        Ok(())
    }
}

/// Everything an integration test needs, wired over the in-memory store.
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub shard: Arc<ShardContext>,
    pub engine: Arc<HistoryEngine>,
    pub matching: Arc<RecordingMatchingClient>,
    pub visibility: Arc<RecordingVisibilityClient>,
    pub remote: Arc<RecordingRemoteClient>,
    pub rereplicator: Arc<RecordingRereplicator>,
}

impl TestContext {
    /// Wire a context serving `domains`.
    pub async fn new(domains: Vec<DomainEntry>) -> Self {
        windlass_common::telemetry::init_tracing();
        let store = MemoryStore::new();
        let mut config = DynamicConfig::default();
        config.standby_cluster_delay = Duration::from_secs(300);
        let shard = ShardContext::acquire(
            TEST_SHARD_ID,
            store.clone(),
            two_cluster_metadata(),
            config,
        )
        .await
        .expect("shard acquisition");

        let domain_store = StaticDomainStore::new(domains);
        let domain_cache = Arc::new(DomainCache::new(domain_store, Duration::from_secs(60)));

        let engine = HistoryEngine::builder()
            .shard(shard.clone())
            .execution_store(store.clone())
            .history_store(store.clone())
            .domain_cache(domain_cache)
            .build()
            .expect("engine construction");

        Self {
            store,
            shard,
            engine,
            matching: Arc::new(RecordingMatchingClient::default()),
            visibility: Arc::new(RecordingVisibilityClient::default()),
            remote: Arc::new(RecordingRemoteClient::default()),
            rereplicator: Arc::new(RecordingRereplicator::default()),
        }
    }

    /// Active-side transfer processor over this context.
    pub fn active_transfer_processor(&self) -> Arc<TransferQueueProcessor> {
        let executor = ActiveTransferExecutor::new(
            self.engine.clone(),
            self.matching.clone(),
            self.visibility.clone(),
            self.remote.clone(),
        );
        TransferQueueProcessor::new(
            self.shard.clone(),
            self.store.clone(),
            executor,
            self.shard.cluster_metadata().current_cluster_name(),
        )
    }

    /// Standby-side transfer processor watching `cluster`.
    pub fn standby_transfer_processor(
        &self,
        cluster: &str,
    ) -> (Arc<TransferQueueProcessor>, Arc<StandbyTransferExecutor>) {
        let executor = StandbyTransferExecutor::new(
            cluster,
            self.shard.clone(),
            self.history_cache(),
            self.matching.clone(),
            self.visibility.clone(),
            self.rereplicator.clone(),
        );
        let processor = TransferQueueProcessor::new(
            self.shard.clone(),
            self.store.clone(),
            executor.clone(),
            cluster,
        );
        (processor, executor)
    }

    pub fn history_cache(&self) -> Arc<HistoryCache> {
        self.engine.history_cache().clone()
    }

    /// All transfer tasks currently persisted for the test shard.
    pub async fn transfer_tasks(&self) -> Vec<TransferTask> {
        use windlass_persistence::ExecutionStore;
        self.store
            .get_transfer_tasks(TEST_SHARD_ID, 0, i64::MAX, 1000)
            .await
            .expect("get transfer tasks")
    }
}

/// Build a history event for replication fixtures.
pub fn event(event_id: i64, version: i64, attributes: EventAttributes) -> HistoryEvent {
    HistoryEvent {
        event_id,
        version,
        timestamp: Utc::now(),
        attributes,
    }
}

/// The canonical replicated prefix: start, schedule + run + complete the
/// first decision, then schedule activity `activity-1` at event 5.
pub fn replicated_activity_events(version: i64, task_list: &str) -> Vec<HistoryEvent> {
    vec![
        event(
            1,
            version,
            EventAttributes::WorkflowExecutionStarted {
                workflow_type: "order-processing".to_string(),
                task_list: task_list.to_string(),
                input: None,
                execution_timeout_seconds: 600,
                decision_timeout_seconds: 10,
                parent: None,
                continued_from_run_id: None,
            },
        ),
        event(
            2,
            version,
            EventAttributes::DecisionTaskScheduled {
                task_list: task_list.to_string(),
                start_to_close_seconds: 10,
                attempt: 0,
            },
        ),
        event(
            3,
            version,
            EventAttributes::DecisionTaskStarted {
                schedule_id: 2,
                identity: "worker-1".to_string(),
                request_id: "req-1".to_string(),
            },
        ),
        event(
            4,
            version,
            EventAttributes::DecisionTaskCompleted {
                schedule_id: 2,
                started_id: 3,
                identity: "worker-1".to_string(),
            },
        ),
        event(
            5,
            version,
            EventAttributes::ActivityTaskScheduled {
                decision_completed_id: 4,
                activity_id: "activity-1".to_string(),
                activity_type: "charge-card".to_string(),
                task_list: task_list.to_string(),
                input: None,
                schedule_to_start_seconds: 60,
                schedule_to_close_seconds: 120,
                start_to_close_seconds: 60,
                heartbeat_seconds: 0,
            },
        ),
    ]
}

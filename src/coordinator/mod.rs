// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine facade and composition root.
//!
//! The [`HybridEngine`] owns one instance each of:
//! - the tiered [`CacheStore`]
//! - the [`StorageOrchestrator`] with its blob store
//! - the [`SyncQueueEngine`] with its remote and connectivity collaborators
//!
//! and hands out shared references to them. Domain code talks to the facade
//! (`save`, `load`, `remove`); dashboards and diagnostics reach the
//! components through the accessors.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use hybrid_sync::{EngineConfig, EngineState, HybridEngine, ManualConnectivity, StorageStrategy};
//! # use hybrid_sync::{RemoteAck, RemoteApi, RemoteError, RemoteRequest};
//! # use std::sync::Arc;
//! # struct Api;
//! # #[async_trait::async_trait]
//! # impl RemoteApi for Api {
//! #     async fn apply(&self, _r: &RemoteRequest) -> Result<RemoteAck, RemoteError> { Ok(RemoteAck::default()) }
//! # }
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), hybrid_sync::StorageError> {
//! let config = EngineConfig {
//!     db_path: Some("./school.db".into()),
//!     blob_dir: Some("./blobs".into()),
//!     ..Default::default()
//! };
//! let engine = HybridEngine::open(config, Arc::new(Api), Arc::new(ManualConnectivity::online())).await?;
//! engine.start().await?;
//! assert_eq!(engine.state(), EngineState::Running);
//!
//! engine.save("student", "1", json!({"name": "A"}), StorageStrategy::Critical, None).await?;
//! let student: Option<serde_json::Value> = engine.load("student", "1").await;
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{EngineHealth, EngineState, MaintenanceReport, SavedRecord};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::media::{BlobPayload, MediaOptimizer};
use crate::orchestrator::{StorageOrchestrator, StorageStrategy};
use crate::queue::{InMemoryQueueStore, QueueOptions, QueueStore, SqlQueueStore, SyncQueueEngine};
use crate::remote::{ConnectivityProbe, RemoteApi};
use crate::storage::sql::open_sqlite_pool;
use crate::storage::{
    BlobStore, CacheBackend, FileBlobStore, InMemoryBackend, InMemoryBlobStore, SqlBackend, StorageError,
};
use crate::sync_item::{SyncOperation, SyncPriority};

use lifecycle::BackgroundTasks;

/// Explicit wiring for [`HybridEngine::with_parts`].
pub struct EngineParts {
    pub cache_backend: Arc<dyn CacheBackend>,
    pub blobs: Arc<dyn BlobStore>,
    pub queue_store: Arc<dyn QueueStore>,
    pub remote: Arc<dyn RemoteApi>,
    pub connectivity: Arc<dyn ConnectivityProbe>,
    pub clock: Arc<dyn Clock>,
    pub optimizer: Option<Arc<dyn MediaOptimizer>>,
}

impl EngineParts {
    /// In-memory backends around the given collaborators.
    pub fn in_memory(remote: Arc<dyn RemoteApi>, connectivity: Arc<dyn ConnectivityProbe>) -> Self {
        Self {
            cache_backend: Arc::new(InMemoryBackend::new()),
            blobs: Arc::new(InMemoryBlobStore::new()),
            queue_store: Arc::new(InMemoryQueueStore::new()),
            remote,
            connectivity,
            clock: Arc::new(SystemClock),
            optimizer: None,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_optimizer(mut self, optimizer: Arc<dyn MediaOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }
}

pub struct HybridEngine {
    pub(super) config: EngineConfig,
    pub(super) cache: Arc<CacheStore>,
    pub(super) orchestrator: Arc<StorageOrchestrator>,
    pub(super) queue: Arc<SyncQueueEngine>,
    pub(super) connectivity: Arc<dyn ConnectivityProbe>,
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,
    pub(super) tasks: Mutex<Option<BackgroundTasks>>,
}

impl HybridEngine {
    /// Build the engine from config: SQLite when `db_path` is set (one pool
    /// for cache rows, sync queue and sync config), files when `blob_dir` is
    /// set, in-memory otherwise.
    #[tracing::instrument(skip_all, fields(db_path = ?config.db_path, blob_dir = ?config.blob_dir))]
    pub async fn open(
        config: EngineConfig,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<dyn ConnectivityProbe>,
    ) -> Result<Self, StorageError> {
        let mut parts = EngineParts::in_memory(remote, connectivity);

        if let Some(path) = &config.db_path {
            let pool = open_sqlite_pool(path).await?;
            parts.cache_backend = Arc::new(SqlBackend::with_pool(pool.clone()).await?);
            parts.queue_store = Arc::new(SqlQueueStore::with_pool(pool).await?);
            info!(path = %path, "Using SQLite persistence");
        }
        if let Some(dir) = &config.blob_dir {
            parts.blobs = Arc::new(FileBlobStore::open(dir.as_str()).await?);
            info!(dir = %dir, "Using file blob store");
        }

        Self::with_parts(config, parts).await
    }

    /// Build the engine around explicitly supplied backends.
    pub async fn with_parts(config: EngineConfig, parts: EngineParts) -> Result<Self, StorageError> {
        let cache = Arc::new(CacheStore::open(parts.cache_backend, config.cache.clone(), parts.clock.clone()).await?);

        let mut orchestrator = StorageOrchestrator::new(cache.clone(), parts.blobs, parts.clock.clone());
        if let Some(optimizer) = parts.optimizer {
            orchestrator = orchestrator.with_optimizer(optimizer);
        }

        let queue = SyncQueueEngine::open(
            parts.queue_store,
            parts.remote,
            parts.connectivity.clone(),
            parts.clock,
            QueueOptions::from_engine_config(&config),
            config.sync.clone(),
        )
        .await?;

        let (state, state_rx) = watch::channel(EngineState::Created);
        crate::metrics::set_engine_state(EngineState::Created.as_str());

        Ok(Self {
            config,
            cache,
            orchestrator: Arc::new(orchestrator),
            queue: Arc::new(queue),
            connectivity: parts.connectivity,
            state,
            state_rx,
            tasks: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn orchestrator(&self) -> &Arc<StorageOrchestrator> {
        &self.orchestrator
    }

    pub fn queue(&self) -> &Arc<SyncQueueEngine> {
        &self.queue
    }

    /// Store a record locally and queue it for the remote.
    ///
    /// The record lives under `"{entity_type}:{id}"`. An object payload
    /// without an `id` field gets one, so the queue can order mutations per
    /// entity. A new record is queued as a create, an existing one as an
    /// update; the sync priority follows the strategy.
    #[tracing::instrument(skip(self, data, blob), fields(strategy = %strategy))]
    pub async fn save<T: Serialize>(
        &self,
        entity_type: &str,
        id: &str,
        data: T,
        strategy: StorageStrategy,
        blob: Option<BlobPayload>,
    ) -> Result<SavedRecord, StorageError> {
        let key = record_key(entity_type, id)?;
        let mut payload = serde_json::to_value(&data)?;
        if let Value::Object(map) = &mut payload {
            map.entry("id").or_insert_with(|| Value::String(id.to_string()));
        }

        let priority: SyncPriority = strategy.spec().priority.into();

        let (item, replaced) = self.orchestrator.store_replacing(&key, payload.clone(), strategy, blob).await?;
        let operation = if replaced {
            SyncOperation::Update
        } else {
            SyncOperation::Create
        };
        let sync_item = self
            .queue
            .add_to_sync_queue(operation, entity_type, payload, priority)
            .await?;

        debug!(key = %key, operation = %operation, sync_id = %sync_item.id, "Saved record");
        Ok(SavedRecord { item, sync_item })
    }

    /// Read a record saved with [`save`](Self::save).
    pub async fn load<T: DeserializeOwned>(&self, entity_type: &str, id: &str) -> Option<T> {
        let key = record_key(entity_type, id).ok()?;
        self.orchestrator.get(&key).await
    }

    /// Drop a record locally and queue a delete for the remote. Returns
    /// whether a local copy existed; the delete is queued either way.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, entity_type: &str, id: &str) -> Result<bool, StorageError> {
        let key = record_key(entity_type, id)?;
        let existed = self.orchestrator.remove(&key).await?;
        self.queue
            .add_to_sync_queue(SyncOperation::Delete, entity_type, json!({ "id": id }), SyncPriority::High)
            .await?;
        Ok(existed)
    }

    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            state: self.state(),
            online: self.connectivity.is_online(),
            tracked_items: self.orchestrator.len(),
            cache: self.cache.get_stats(),
            sync: self.queue.get_sync_stats(),
        }
    }
}

fn record_key(entity_type: &str, id: &str) -> Result<String, StorageError> {
    if entity_type.is_empty() || id.is_empty() {
        return Err(StorageError::Validation("entity type and id must not be empty".into()));
    }
    Ok(format!("{}:{}", entity_type, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::remote::{ManualConnectivity, RemoteAck, RemoteError, RemoteRequest};
    use crate::sync_item::SyncStatus;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingRemote {
        seen: parking_lot::Mutex<Vec<RemoteRequest>>,
    }

    #[async_trait]
    impl RemoteApi for RecordingRemote {
        async fn apply(&self, request: &RemoteRequest) -> Result<RemoteAck, RemoteError> {
            self.seen.lock().push(request.clone());
            Ok(RemoteAck::default())
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Student {
        id: String,
        name: String,
    }

    async fn engine_with(remote: Arc<RecordingRemote>, clock: Arc<ManualClock>) -> HybridEngine {
        let parts = EngineParts::in_memory(remote, Arc::new(ManualConnectivity::online())).with_clock(clock);
        HybridEngine::with_parts(EngineConfig::default(), parts).await.unwrap()
    }

    #[tokio::test]
    async fn test_save_stores_and_queues() {
        let remote = Arc::new(RecordingRemote::default());
        let engine = engine_with(remote.clone(), Arc::new(ManualClock::new(0))).await;

        let saved = engine
            .save("student", "1", json!({"name": "A"}), StorageStrategy::Critical, None)
            .await
            .unwrap();
        assert_eq!(saved.item.id, "student:1");
        assert_eq!(saved.sync_item.operation, SyncOperation::Create);
        assert_eq!(saved.sync_item.priority, SyncPriority::High);
        assert_eq!(saved.sync_item.entity_key(), "student:1");

        let loaded: Student = engine.load("student", "1").await.unwrap();
        assert_eq!(loaded, Student { id: "1".into(), name: "A".into() });

        engine.queue().force_sync().await;
        assert_eq!(remote.seen.lock()[0].payload, json!({"id": "1", "name": "A"}));
    }

    #[tokio::test]
    async fn test_second_save_is_update_with_strategy_priority() {
        let engine = engine_with(Arc::default(), Arc::new(ManualClock::new(0))).await;
        engine
            .save("note", "n", json!({"body": "a"}), StorageStrategy::Secondary, None)
            .await
            .unwrap();
        let saved = engine
            .save("note", "n", json!({"body": "b"}), StorageStrategy::Secondary, None)
            .await
            .unwrap();

        assert_eq!(saved.sync_item.operation, SyncOperation::Update);
        assert_eq!(saved.sync_item.priority, SyncPriority::Low);
        let body: Value = engine.load("note", "n").await.unwrap();
        assert_eq!(body["body"], "b");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_first_saves_queue_one_create() {
        let engine = Arc::new(engine_with(Arc::default(), Arc::new(ManualClock::new(0))).await);
        let save = |n: i64| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .save("student", "1", json!({"n": n}), StorageStrategy::Important, None)
                    .await
                    .map(|saved| saved.sync_item.operation)
            })
        };
        let (first, second) = tokio::join!(save(1), save(2));
        let mut operations = vec![first.unwrap().unwrap(), second.unwrap().unwrap()];
        operations.sort_by_key(|op| op.as_str());

        assert_eq!(operations, vec![SyncOperation::Create, SyncOperation::Update]);
    }

    #[tokio::test]
    async fn test_remove_queues_delete() {
        let engine = engine_with(Arc::default(), Arc::new(ManualClock::new(0))).await;
        engine
            .save("student", "1", json!({"name": "A"}), StorageStrategy::Important, None)
            .await
            .unwrap();

        assert!(engine.remove("student", "1").await.unwrap());
        assert!(engine.load::<Value>("student", "1").await.is_none());

        let queue = engine.queue().get_sync_queue();
        let delete = queue.iter().find(|i| i.operation == SyncOperation::Delete).unwrap();
        assert_eq!(delete.payload, json!({"id": "1"}));
        assert_eq!(delete.status, SyncStatus::Pending);

        assert!(!engine.remove("student", "1").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_key_parts_rejected() {
        let engine = engine_with(Arc::default(), Arc::new(ManualClock::new(0))).await;
        let err = engine
            .save("", "1", json!({}), StorageStrategy::Critical, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
        assert!(engine.load::<Value>("student", "").await.is_none());
    }

    #[tokio::test]
    async fn test_health_reports_components() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = engine_with(Arc::default(), clock.clone()).await;
        engine
            .save("student", "1", json!({"name": "A"}), StorageStrategy::Critical, None)
            .await
            .unwrap();

        let health = engine.health();
        assert_eq!(health.state, EngineState::Created);
        assert!(health.online);
        assert_eq!(health.tracked_items, 1);
        assert_eq!(health.cache.item_count, 1);
        assert_eq!(health.sync.pending_items, 1);
        assert!(!health.is_healthy());

        clock.advance(Duration::from_secs(1));
        engine.queue().force_sync().await;
        assert_eq!(engine.health().sync.completed_items, 1);
    }
}

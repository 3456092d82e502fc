// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Hybrid Sync
//!
//! Offline-first local storage with a durable sync queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  HybridEngine (facade)                      │
//! │  • save / load / remove                                    │
//! │  • maintenance loop + auto-sync lifecycle                  │
//! └─────────────────────────────────────────────────────────────┘
//!               │                                │
//!               ▼                                ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────────┐
//! │     StorageOrchestrator      │  │       SyncQueueEngine        │
//! │  • strategy → cache tier     │  │  • durable ordered queue     │
//! │  • blob attachments          │  │  • priority + FIFO batches   │
//! │  • age-based cleanup         │  │  • backoff, conflicts        │
//! └──────────────────────────────┘  └──────────────────────────────┘
//!       │               │                   │              │
//!       ▼               ▼                   ▼              ▼
//! ┌────────────┐  ┌────────────┐     ┌────────────┐  ┌────────────┐
//! │ CacheStore │  │ BlobStore  │     │ QueueStore │  │ RemoteApi  │
//! │ 3 tiers,   │  │ SHA-256    │     │ SQLite     │  │ + probe    │
//! │ TTL, evict │  │ files      │     │            │  │            │
//! └────────────┘  └────────────┘     └────────────┘  └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hybrid_sync::{EngineConfig, HybridEngine, ManualConnectivity, StorageStrategy};
//! # use hybrid_sync::{RemoteAck, RemoteApi, RemoteError, RemoteRequest};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # struct SchoolApi;
//! # #[async_trait::async_trait]
//! # impl RemoteApi for SchoolApi {
//! #     async fn apply(&self, _r: &RemoteRequest) -> Result<RemoteAck, RemoteError> { Ok(RemoteAck::default()) }
//! # }
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig {
//!         db_path: Some("./school.db".into()),
//!         blob_dir: Some("./blobs".into()),
//!         ..Default::default()
//!     };
//!
//!     let connectivity = Arc::new(ManualConnectivity::online());
//!     let engine = HybridEngine::open(config, Arc::new(SchoolApi), connectivity.clone())
//!         .await
//!         .expect("Failed to open");
//!     engine.start().await.expect("Failed to start");
//!
//!     // Stored locally, queued for the remote
//!     engine
//!         .save("student", "42", json!({"name": "Ada"}), StorageStrategy::Critical, None)
//!         .await
//!         .expect("Failed to save");
//!
//!     let student: Option<serde_json::Value> = engine.load("student", "42").await;
//!     println!("{:?}", student);
//!
//!     // Losing the network only parks the queue
//!     connectivity.set_online(false);
//!     println!("{:?}", engine.queue().get_sync_stats());
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`HybridEngine`] facade and its lifecycle
//! - [`cache`]: tiered [`CacheStore`] with TTL and size budgets
//! - [`orchestrator`]: [`StorageOrchestrator`] and the strategy catalog
//! - [`queue`]: [`SyncQueueEngine`], conflict policies, queue persistence
//! - [`storage`]: cache backends (SQLite, memory) and blob stores
//! - [`eviction`]: tan-curve victim selection
//! - [`remote`]: remote API and connectivity collaborators
//! - [`resilience`]: retry and backoff policies

pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod eviction;
pub mod media;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod remote;
pub mod resilience;
pub mod storage;
pub mod sync_item;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use cache::{CacheEntry, CacheStats, CacheStore, StrategyTier, TierStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, EngineConfig, SyncConfig, TierPolicy};
pub use coordinator::{EngineHealth, EngineParts, EngineState, HybridEngine, MaintenanceReport, SavedRecord};
pub use media::{BlobPayload, MediaOptimizer, MediaOptions};
pub use orchestrator::{CleanupReport, StorageItem, StorageOrchestrator, StorageStats, StorageStrategy};
pub use queue::{
    AutoSyncHandle, BatchResult, ConflictResolution, InMemoryQueueStore, QueueOptions, QueueStore, SqlQueueStore,
    SyncQueueEngine, SyncStats,
};
pub use remote::{ConnectivityProbe, ManualConnectivity, RemoteAck, RemoteApi, RemoteError, RemoteRequest};
pub use resilience::retry::RetryConfig;
pub use storage::{
    BlobMetadata, BlobRef, BlobStats, BlobStore, CacheBackend, FileBlobStore, InMemoryBackend, InMemoryBlobStore,
    SqlBackend, StorageError,
};
pub use sync_item::{SyncItem, SyncOperation, SyncPriority, SyncStatus};

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage orchestrator: routes records between the cache and the blob store.
//!
//! Every record is stored under a [`StorageStrategy`], which fixes its cache
//! tier and how long it may sit idle before [`StorageOrchestrator::cleanup`]
//! drops it. Binary attachments go to the [`BlobStore`]; the structured record
//! always goes to the cache.
//!
//! ```text
//! store(id, data, strategy, blob?)
//!   ├─ blob?  → MediaOptimizer (images) → BlobStore::store_file
//!   ├─ data   → CacheStore::set("storage:{id}", strategy.cache_tier)
//!   └─ StorageItem recorded under id
//!
//! get(id)
//!   ├─ cache hit                       → data
//!   └─ miss + blob still in blob store → re-populate cache → last known data
//! ```
//!
//! Writes to the same id are serialized by a per-id lock, so the later of two
//! concurrent `store` calls is the one subsequent reads observe.

mod item;
mod strategy;

pub use item::{cache_key_for, StorageItem};
pub use strategy::{StorageStrategy, StrategyPriority, StrategySpec, TierType};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, CacheStore, StrategyTier};
use crate::clock::{duration_millis, Clock};
use crate::media::{BlobPayload, MediaOptimizer};
use crate::metrics;
use crate::storage::traits::content_address;
use crate::storage::{BlobMetadata, BlobRef, BlobStats, BlobStore, StorageError};

/// Merged view for the admin dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub cache: CacheStats,
    /// `None` when the blob store could not be scanned
    pub blobs: Option<BlobStats>,
    pub item_count: usize,
    pub items_with_blobs: usize,
    pub items_by_strategy: BTreeMap<&'static str, usize>,
    pub total_item_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub items_removed: usize,
    pub cache_entries_removed: usize,
    pub blobs_removed: usize,
    /// Items kept because a delete failed; retried next pass
    pub failures: usize,
}

pub struct StorageOrchestrator {
    cache: Arc<CacheStore>,
    blobs: Arc<dyn BlobStore>,
    optimizer: Option<Arc<dyn MediaOptimizer>>,
    clock: Arc<dyn Clock>,
    items: DashMap<String, StorageItem<Value>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    blob_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl StorageOrchestrator {
    pub fn new(cache: Arc<CacheStore>, blobs: Arc<dyn BlobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            blobs,
            optimizer: None,
            clock,
            items: DashMap::new(),
            locks: DashMap::new(),
            blob_locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn with_optimizer(mut self, optimizer: Arc<dyn MediaOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(id.to_string()).or_default().clone()
    }

    /// Drop the per-id lock once nobody but the map and the caller holds it.
    /// Call while still holding the guard.
    fn forget_lock(&self, id: &str) {
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) <= 2);
    }

    /// Lock for one content address. Held from the blob write until the
    /// owning item is recorded, and around every in-use check plus delete.
    /// Never hold two of these at once.
    fn blob_lock_for(&self, blob_id: &str) -> Arc<Mutex<()>> {
        self.blob_locks.entry(blob_id.to_string()).or_default().clone()
    }

    fn forget_blob_lock(&self, blob_id: &str) {
        self.blob_locks.remove_if(blob_id, |_, lock| Arc::strong_count(lock) <= 1);
    }

    /// Whether any tracked item other than `except_id` still points at `blob_id`.
    /// Blobs are content addressed, so identical attachments share one file.
    fn blob_in_use(&self, blob_id: &str, except_id: &str) -> bool {
        self.items
            .iter()
            .any(|r| r.key() != except_id && r.blob_id() == Some(blob_id))
    }

    async fn release_blob(&self, blob: &BlobRef, owner_id: &str) -> bool {
        let lock = self.blob_lock_for(&blob.id);
        let removed = {
            let _guard = lock.lock().await;
            if self.blob_in_use(&blob.id, owner_id) {
                false
            } else {
                match self.blobs.delete_file(&blob.id).await {
                    Ok(removed) => removed,
                    Err(e) => {
                        warn!(id = %owner_id, blob = %blob.id, error = %e, "Failed to delete blob");
                        false
                    }
                }
            }
        };
        drop(lock);
        self.forget_blob_lock(&blob.id);
        removed
    }

    /// Store a record (and optional attachment) under `strategy`.
    ///
    /// Without a new `blob`, the previously stored attachment (if any) stays
    /// linked. Cache and blob write failures propagate.
    pub async fn store<T: Serialize>(
        &self,
        id: &str,
        data: T,
        strategy: StorageStrategy,
        blob: Option<BlobPayload>,
    ) -> Result<StorageItem<T>, StorageError> {
        self.store_replacing(id, data, strategy, blob).await.map(|(item, _)| item)
    }

    /// [`store`](Self::store), also reporting whether `id` was already
    /// tracked. The check happens under the same per-id lock as the write.
    #[tracing::instrument(skip(self, data, blob), fields(strategy = %strategy))]
    pub async fn store_replacing<T: Serialize>(
        &self,
        id: &str,
        data: T,
        strategy: StorageStrategy,
        blob: Option<BlobPayload>,
    ) -> Result<(StorageItem<T>, bool), StorageError> {
        let value = serde_json::to_value(&data)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let prepared = match blob {
            Some(payload) => Some(self.prepare_blob(id, payload).await?),
            None => None,
        };
        let blob_lock = prepared.as_ref().map(|(address, _, _)| self.blob_lock_for(address));
        let blob_guard = match &blob_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let outcome = self.write_record(id, value, strategy, prepared.as_ref()).await;

        drop(blob_guard);
        drop(blob_lock);
        if let Some((address, _, _)) = &prepared {
            self.forget_blob_lock(address);
        }

        let (item, previous) = match outcome {
            Ok(written) => written,
            Err((e, Some(fresh))) => {
                // Don't leave an unreferenced attachment behind
                self.release_blob(&fresh, id).await;
                return Err(e);
            }
            Err((e, None)) => return Err(e),
        };

        let replaced = previous.is_some();
        if let Some(old) = previous.and_then(|p| p.blob) {
            if item.blob_id() != Some(old.id.as_str()) {
                self.release_blob(&old, id).await;
            }
        }

        debug!(id = %id, size = item.size_bytes, replaced, "Stored item");
        let stored = StorageItem {
            data,
            id: item.id,
            blob: item.blob,
            cache_key: item.cache_key,
            strategy: item.strategy,
            created_at: item.created_at,
            last_accessed: item.last_accessed,
            access_count: item.access_count,
            size_bytes: item.size_bytes,
        };
        Ok((stored, replaced))
    }

    /// Blob write, cache write and item insert for [`store`](Self::store).
    /// Runs under the per-id lock and, with an attachment, its blob lock.
    /// On failure returns the freshly written blob that nothing references.
    async fn write_record(
        &self,
        id: &str,
        value: Value,
        strategy: StorageStrategy,
        prepared: Option<&(String, Vec<u8>, BlobMetadata)>,
    ) -> Result<(StorageItem<Value>, Option<StorageItem<Value>>), (StorageError, Option<BlobRef>)> {
        let previous = self.items.get(id).map(|r| r.clone());
        let previous_blob = previous.as_ref().and_then(|p| p.blob.clone());

        let new_blob = match prepared {
            Some((_, bytes, metadata)) => Some(self.blobs.store_file(bytes, metadata).await.map_err(|e| (e, None))?),
            None => None,
        };

        let cache_key = cache_key_for(id);
        let tags = vec![strategy.name().to_string()];
        if let Err(e) = self.cache.set(&cache_key, &value, strategy.cache_tier(), &tags).await {
            let orphan = new_blob.filter(|fresh| previous_blob.as_ref().map(|b| &b.id) != Some(&fresh.id));
            return Err((e, orphan));
        }

        let now = self.clock.now_millis();
        let blob_ref = new_blob.or_else(|| previous_blob.clone());
        let data_bytes = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0) as u64;
        let item = StorageItem {
            id: id.to_string(),
            data: value,
            size_bytes: data_bytes + blob_ref.as_ref().map(|b| b.size).unwrap_or(0),
            blob: blob_ref,
            cache_key,
            strategy,
            created_at: previous.as_ref().map(|p| p.created_at).unwrap_or(now),
            last_accessed: now,
            access_count: 0,
        };
        self.items.insert(id.to_string(), item.clone());
        Ok((item, previous))
    }

    /// Run the optimizer (images only) and compute the content address the
    /// blob store will file the bytes under.
    async fn prepare_blob(
        &self,
        id: &str,
        payload: BlobPayload,
    ) -> Result<(String, Vec<u8>, BlobMetadata), StorageError> {
        let bytes = match (&self.optimizer, payload.is_image()) {
            (Some(optimizer), true) => {
                let optimized = optimizer
                    .transform(&payload.bytes, &payload.metadata.mime_type, &payload.options)
                    .await?;
                debug!(id = %id, before = payload.bytes.len(), after = optimized.len(), "Optimized image");
                optimized
            }
            _ => payload.bytes,
        };
        Ok((content_address(&bytes), bytes, payload.metadata))
    }

    /// Read a record. `None` when neither the cache nor the blob store can
    /// vouch for it.
    #[tracing::instrument(skip(self))]
    pub async fn get<T: DeserializeOwned>(&self, id: &str) -> Option<T> {
        let cache_key = cache_key_for(id);

        if let Some(value) = self.cache.get::<Value>(&cache_key).await {
            self.record_access(id);
            return decode(id, value);
        }

        let item = self.items.get(id).map(|r| r.clone())?;
        let blob = item.blob.as_ref()?;

        match self.blobs.exists(&blob.id).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!(id = %id, error = %e, "Blob lookup failed during cache miss");
                return None;
            }
        }

        let tags = vec![item.strategy.name().to_string()];
        if let Err(e) = self
            .cache
            .set(&cache_key, &item.data, item.strategy.cache_tier(), &tags)
            .await
        {
            warn!(id = %id, error = %e, "Failed to re-populate cache");
        }
        self.record_access(id);
        decode(id, item.data)
    }

    fn record_access(&self, id: &str) {
        if let Some(mut item) = self.items.get_mut(id) {
            item.last_accessed = self.clock.now_millis();
            item.access_count = item.access_count.saturating_add(1);
        }
    }

    /// [`get`](Self::get), then promote `related` ids into the frequent tier
    /// in the background.
    pub async fn get_with_preload<T: DeserializeOwned>(self: &Arc<Self>, id: &str, related: &[String]) -> Option<T> {
        let result = self.get(id).await;
        if !related.is_empty() {
            let this = Arc::clone(self);
            let related = related.to_vec();
            tokio::spawn(async move {
                this.preload(&related).await;
            });
        }
        result
    }

    /// Re-promote tracked ids into the frequent tier. Unknown ids are skipped
    /// and failures are logged. Returns how many were promoted.
    pub async fn preload(&self, ids: &[String]) -> usize {
        let mut promoted = 0;
        for id in ids {
            let Some(item) = self.items.get(id).map(|r| r.clone()) else {
                continue;
            };
            let tags = vec![item.strategy.name().to_string()];
            match self
                .cache
                .set(&item.cache_key, &item.data, StrategyTier::Frequent, &tags)
                .await
            {
                Ok(()) => promoted += 1,
                Err(e) => warn!(id = %id, error = %e, "Preload failed"),
            }
        }
        promoted
    }

    /// Drop a record, its cache entry and (if unshared) its blob.
    pub async fn remove(&self, id: &str) -> Result<bool, StorageError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let cached = self.cache.delete(&cache_key_for(id)).await?;
        let removed = self.items.remove(id).map(|(_, item)| item);
        if let Some(blob) = removed.as_ref().and_then(|i| i.blob.as_ref()) {
            self.release_blob(blob, id).await;
        }
        self.forget_lock(id);

        Ok(cached || removed.is_some())
    }

    /// Tracked metadata for `id`.
    pub fn item(&self, id: &str) -> Option<StorageItem<Value>> {
        self.items.get(id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop items idle longer than their strategy's max age, together with
    /// their cache entry and blob. Never fails: problems are counted and
    /// logged, and the item is retried on the next pass.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self) -> CleanupReport {
        let now = self.clock.now_millis();
        let stale: Vec<String> = self
            .items
            .iter()
            .filter(|r| now.saturating_sub(r.last_accessed) > duration_millis(r.strategy.max_age()))
            .map(|r| r.key().clone())
            .collect();

        let mut report = CleanupReport::default();
        for id in stale {
            let lock = self.lock_for(&id);
            let _guard = lock.lock().await;

            // Re-check under the lock; a store or get may have refreshed it
            let Some(item) = self.items.get(&id).map(|r| r.clone()) else {
                continue;
            };
            if now.saturating_sub(item.last_accessed) <= duration_millis(item.strategy.max_age()) {
                continue;
            }

            match self.cache.delete(&item.cache_key).await {
                Ok(true) => report.cache_entries_removed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(id = %id, error = %e, "Cleanup could not delete cache entry");
                    report.failures += 1;
                    continue;
                }
            }

            self.items.remove(&id);
            if let Some(blob) = &item.blob {
                if self.release_blob(blob, &id).await {
                    report.blobs_removed += 1;
                }
            }
            report.items_removed += 1;
            self.forget_lock(&id);
        }

        if report.items_removed > 0 {
            info!(
                items = report.items_removed,
                blobs = report.blobs_removed,
                failures = report.failures,
                "Storage cleanup removed stale items"
            );
        }
        metrics::record_cleanup_removed("orchestrator", report.items_removed);
        report
    }

    pub async fn get_storage_stats(&self) -> StorageStats {
        let blobs = match self.blobs.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Blob stats unavailable");
                None
            }
        };

        let mut items_by_strategy = BTreeMap::new();
        let mut items_with_blobs = 0;
        let mut total_item_bytes = 0;
        for item in self.items.iter() {
            *items_by_strategy.entry(item.strategy.name()).or_insert(0) += 1;
            if item.blob.is_some() {
                items_with_blobs += 1;
            }
            total_item_bytes += item.size_bytes;
        }

        StorageStats {
            cache: self.cache.get_stats(),
            blobs,
            item_count: self.items.len(),
            items_with_blobs,
            items_by_strategy,
            total_item_bytes,
        }
    }
}

fn decode<T: DeserializeOwned>(id: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(data) => Some(data),
        Err(e) => {
            warn!(id = %id, error = %e, "Stored record does not match requested type");
            None
        }
    }
}

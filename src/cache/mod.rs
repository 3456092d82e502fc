// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tiered key/value cache with TTL, per-tier size budgets and access stats.
//!
//! Values are serialized with `serde_json` and persisted through a
//! [`CacheBackend`] under `tier:logical-key`. An in-memory index of entry
//! metadata (tier, expiry, size, access stats, tags) is rebuilt from the
//! backend on open; the bytes themselves are only read on `get`.
//!
//! # Failure semantics
//!
//! | Path | Backend error |
//! |------|---------------|
//! | `get`, `get_by_tags` | logged, treated as a miss |
//! | `set`, `delete`, `clear` | propagated |
//! | `cleanup`, access-stat updates | logged, retried on the next pass |
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use hybrid_sync::cache::{CacheStore, StrategyTier};
//! use hybrid_sync::storage::InMemoryBackend;
//! use hybrid_sync::config::CacheConfig;
//! use hybrid_sync::clock::SystemClock;
//! use std::sync::Arc;
//!
//! let cache = CacheStore::open(
//!     Arc::new(InMemoryBackend::new()),
//!     CacheConfig::default(),
//!     Arc::new(SystemClock),
//! ).await.unwrap();
//!
//! cache.set("student:1", &"Ada", StrategyTier::Frequent, &[]).await.unwrap();
//! assert_eq!(cache.get::<String>("student:1").await.as_deref(), Some("Ada"));
//! # }
//! ```

mod entry;
mod tier;

pub use entry::CacheEntry;
pub use tier::StrategyTier;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::{duration_millis, Clock};
use crate::config::CacheConfig;
use crate::eviction::{EvictionCandidate, TanCurvePolicy};
use crate::metrics;
use crate::storage::{CacheBackend, RawEntry, StorageError};
use entry::EntryMeta;

/// Per-tier slice of [`CacheStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStats {
    pub tier: StrategyTier,
    pub item_count: usize,
    pub total_size: usize,
    pub max_size: usize,
    /// `total_size / max_size`
    pub utilization: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_size: usize,
    pub item_count: usize,
    pub hits: u64,
    pub misses: u64,
    /// Lifetime `hits / (hits + misses)`, 0.0 before the first lookup
    pub hit_rate: f64,
    pub tiers: Vec<TierStats>,
}

pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    index: DashMap<String, EntryMeta>,
    hits: AtomicU64,
    misses: AtomicU64,
    generation: AtomicU64,
    policy: TanCurvePolicy,
    /// Serializes mutations so tier accounting and eviction see a stable view
    writes: tokio::sync::Mutex<()>,
}

impl CacheStore {
    /// Open over `backend`, rebuilding the metadata index from what it holds.
    pub async fn open(
        backend: Arc<dyn CacheBackend>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let persisted = backend.list().await?;

        let store = Self {
            backend,
            config,
            clock,
            index: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            policy: TanCurvePolicy::default(),
            writes: tokio::sync::Mutex::new(()),
        };

        // A key rewritten into another tier can leave an old row behind if
        // the follow-up delete failed. Newest write wins.
        let mut stale = Vec::new();
        for raw in &persisted {
            let meta = EntryMeta::from_raw(raw, store.next_generation());
            match store.index.entry(raw.logical_key.clone()) {
                Entry::Occupied(mut existing) => {
                    if existing.get().created_at < meta.created_at {
                        stale.push(existing.get().storage_key.clone());
                        existing.insert(meta);
                    } else {
                        stale.push(meta.storage_key);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(meta);
                }
            }
        }
        for storage_key in stale {
            if let Err(e) = store.backend.delete(&storage_key).await {
                warn!(storage_key = %storage_key, error = %e, "Failed to drop superseded cache row");
            }
        }

        store.publish_tier_bytes();
        info!(entries = store.index.len(), "Cache store opened");
        Ok(store)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Write `data` under `key` in `tier`, replacing any previous entry
    /// (in any tier) and resetting its access count.
    #[tracing::instrument(skip(self, data, tags), fields(tier = %tier))]
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        data: &T,
        tier: StrategyTier,
        tags: &[String],
    ) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(data)?;
        let size = bytes.len();
        let policy = self.config.policy(tier);

        if size > policy.max_bytes {
            metrics::record_cache_operation(tier.as_str(), "set", "rejected");
            return Err(StorageError::Capacity {
                tier,
                needed: size,
                budget: policy.max_bytes,
            });
        }

        let _guard = self.writes.lock().await;
        let now = self.clock.now_millis();
        let previous = self.index.get(key).map(|m| m.clone());

        self.make_room(tier, key, size, policy.max_bytes, now).await?;

        let tags: BTreeSet<String> = tags.iter().cloned().collect();
        let ttl = duration_millis(policy.ttl()).max(1);
        let raw = RawEntry {
            storage_key: tier.storage_key(key),
            logical_key: key.to_string(),
            tier,
            data: bytes,
            created_at: now,
            expires_at: now.saturating_add(ttl),
            size_bytes: size,
            access_count: 0,
            last_accessed: now,
            tags: tags.into_iter().collect(),
        };

        if let Err(e) = self.backend.put(&raw).await {
            metrics::record_cache_operation(tier.as_str(), "set", "error");
            return Err(e);
        }

        if let Some(prev) = previous.filter(|p| p.storage_key != raw.storage_key) {
            if let Err(e) = self.backend.delete(&prev.storage_key).await {
                warn!(key = %key, old_tier = %prev.tier, error = %e, "Failed to drop previous tier copy");
            }
        }

        self.index
            .insert(key.to_string(), EntryMeta::from_raw(&raw, self.next_generation()));
        metrics::record_cache_operation(tier.as_str(), "set", "success");
        self.publish_tier_bytes();
        Ok(())
    }

    /// Free space in `tier` for `incoming` bytes: purge expired entries
    /// first, then evict by tan-curve score. `key` itself is never a victim.
    async fn make_room(
        &self,
        tier: StrategyTier,
        key: &str,
        incoming: usize,
        budget: usize,
        now: i64,
    ) -> Result<(), StorageError> {
        if self.tier_usage(tier, Some(key)) + incoming <= budget {
            return Ok(());
        }

        let expired = self.collect(|k, m| m.tier == tier && k != key && m.is_expired(now));
        self.delete_batch(&expired).await?;

        let used = self.tier_usage(tier, Some(key));
        if used + incoming <= budget {
            return Ok(());
        }

        let candidates: Vec<EvictionCandidate> = self
            .collect(|k, m| m.tier == tier && k != key)
            .into_iter()
            .map(|(k, m)| EvictionCandidate {
                key: k,
                size_bytes: m.size_bytes,
                last_accessed: m.last_accessed,
                access_count: m.access_count,
            })
            .collect();

        let pressure = used as f64 / budget.max(1) as f64;
        let victims = self
            .policy
            .select_victims(&candidates, used + incoming - budget, now, pressure);

        let evicted: Vec<_> = victims
            .iter()
            .filter_map(|victim| self.index.get(victim).map(|m| (victim.clone(), m.clone())))
            .collect();
        self.delete_batch(&evicted).await?;

        debug!(tier = %tier, evicted = victims.len(), incoming, budget, "Evicted entries to make room");
        metrics::record_eviction(tier.as_str(), victims.len());
        Ok(())
    }

    /// Drop entries from the backend in one call, then from the index
    /// unless they were rewritten meanwhile.
    async fn delete_batch(&self, entries: &[(String, EntryMeta)]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let storage_keys: Vec<String> = entries.iter().map(|(_, meta)| meta.storage_key.clone()).collect();
        self.backend.delete_many(&storage_keys).await?;
        for (key, meta) in entries {
            self.index.remove_if(key, |_, cur| cur.generation == meta.generation);
        }
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_raw(key).await.map(|entry| entry.data)
    }

    /// Like [`get`](Self::get) but returns the entry with its metadata.
    /// Counts as an access.
    pub async fn get_raw<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        let now = self.clock.now_millis();

        let Some(meta) = self.index.get(key).map(|m| m.clone()) else {
            self.record_miss("none");
            return None;
        };
        let tier = meta.tier.as_str();

        if meta.is_expired(now) {
            self.record_miss(tier);
            self.remove_expired(key, &meta).await;
            return None;
        }

        let raw = match self.backend.get(&meta.storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                warn!(key = %key, "Cache index entry has no backing row");
                self.index.remove_if(key, |_, cur| cur.generation == meta.generation);
                self.record_miss(tier);
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                metrics::record_cache_operation(tier, "get", "error");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let data: T = match serde_json::from_slice(&raw.data) {
            Ok(data) => data,
            Err(e) => {
                warn!(key = %key, error = %e, "Cached bytes did not decode, treating as miss");
                self.record_miss(tier);
                return None;
            }
        };

        let access_count = match self.index.get_mut(key) {
            Some(mut cur) if cur.generation == meta.generation => {
                cur.access_count = cur.access_count.saturating_add(1);
                cur.last_accessed = now;
                cur.access_count
            }
            _ => meta.access_count.saturating_add(1),
        };

        if let Err(e) = self.backend.touch(&meta.storage_key, access_count, now).await {
            warn!(key = %key, error = %e, "Failed to persist access stats");
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_operation(tier, "get", "hit");

        Some(CacheEntry {
            key: key.to_string(),
            data,
            tier: meta.tier,
            created_at: meta.created_at,
            expires_at: meta.expires_at,
            size_bytes: meta.size_bytes,
            access_count,
            last_accessed: now,
            tags: meta.tags,
        })
    }

    fn record_miss(&self, tier: &str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_operation(tier, "get", "miss");
    }

    /// Lazy expiry. Skips the delete if the key was rewritten meanwhile.
    async fn remove_expired(&self, key: &str, seen: &EntryMeta) {
        let _guard = self.writes.lock().await;
        let still_same = self
            .index
            .get(key)
            .map(|cur| cur.generation == seen.generation)
            .unwrap_or(false);
        if !still_same {
            return;
        }
        match self.backend.delete(&seen.storage_key).await {
            Ok(_) => {
                self.index.remove_if(key, |_, cur| cur.generation == seen.generation);
                self.publish_tier_bytes();
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to delete expired entry"),
        }
    }

    /// Remove `key` from whichever tier holds it.
    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let _guard = self.writes.lock().await;
        let Some(meta) = self.index.get(key).map(|m| m.clone()) else {
            return Ok(false);
        };

        if let Err(e) = self.backend.delete(&meta.storage_key).await {
            metrics::record_cache_operation(meta.tier.as_str(), "delete", "error");
            return Err(e);
        }
        self.index.remove(key);
        metrics::record_cache_operation(meta.tier.as_str(), "delete", "success");
        self.publish_tier_bytes();
        Ok(true)
    }

    /// Drop every entry. Hit/miss counters are lifetime values and survive.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.writes.lock().await;
        self.backend.clear().await?;
        self.index.clear();
        metrics::record_cache_operation("all", "clear", "success");
        self.publish_tier_bytes();
        info!("Cache cleared");
        Ok(())
    }

    /// Live entries carrying at least one of `tags`, ordered by key.
    /// Does not count as access.
    pub async fn get_by_tags<T, S>(&self, tags: &[S]) -> Vec<CacheEntry<T>>
    where
        T: DeserializeOwned,
        S: AsRef<str>,
    {
        let now = self.clock.now_millis();
        let mut matches = self.collect(|_, m| {
            !m.is_expired(now) && tags.iter().any(|t| m.tags.contains(t.as_ref()))
        });
        matches.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::with_capacity(matches.len());
        for (key, meta) in matches {
            let raw = match self.backend.get(&meta.storage_key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable entry in tag scan");
                    continue;
                }
            };
            match serde_json::from_slice(&raw.data) {
                Ok(data) => out.push(CacheEntry {
                    key,
                    data,
                    tier: meta.tier,
                    created_at: meta.created_at,
                    expires_at: meta.expires_at,
                    size_bytes: meta.size_bytes,
                    access_count: meta.access_count,
                    last_accessed: meta.last_accessed,
                    tags: meta.tags,
                }),
                Err(e) => debug!(key = %key, error = %e, "Tagged entry has a different shape"),
            }
        }
        out
    }

    /// Sweep every entry with `expires_at <= now`. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let _guard = self.writes.lock().await;
        let now = self.clock.now_millis();

        let mut removed = 0;
        for (key, meta) in self.collect(|_, m| m.is_expired(now)) {
            match self.backend.delete(&meta.storage_key).await {
                Ok(_) => {
                    self.index.remove_if(&key, |_, cur| cur.generation == meta.generation);
                    removed += 1;
                }
                Err(e) => warn!(key = %key, error = %e, "Cleanup could not delete expired entry"),
            }
        }

        if removed > 0 {
            debug!(removed, "Cache cleanup swept expired entries");
        }
        metrics::record_cleanup_removed("cache", removed);
        self.publish_tier_bytes();
        removed
    }

    /// Aggregate stats over live (non-expired) entries.
    #[must_use]
    pub fn get_stats(&self) -> CacheStats {
        let now = self.clock.now_millis();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);

        let tiers: Vec<TierStats> = StrategyTier::ALL
            .iter()
            .map(|&tier| {
                let (item_count, total_size) = self
                    .index
                    .iter()
                    .filter(|m| m.tier == tier && !m.is_expired(now))
                    .fold((0, 0), |(n, bytes), m| (n + 1, bytes + m.size_bytes));
                let max_size = self.config.policy(tier).max_bytes;
                TierStats {
                    tier,
                    item_count,
                    total_size,
                    max_size,
                    utilization: if max_size == 0 { 0.0 } else { total_size as f64 / max_size as f64 },
                }
            })
            .collect();

        CacheStats {
            total_size: tiers.iter().map(|t| t.total_size).sum(),
            item_count: tiers.iter().map(|t| t.item_count).sum(),
            hits,
            misses,
            hit_rate: if hits + misses == 0 { 0.0 } else { hits as f64 / (hits + misses) as f64 },
            tiers,
        }
    }

    /// Live entry present for `key` (no access recorded).
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        self.index.get(key).map(|m| !m.is_expired(now)).unwrap_or(false)
    }

    #[must_use]
    pub fn tier_of(&self, key: &str) -> Option<StrategyTier> {
        self.index.get(key).map(|m| m.tier)
    }

    /// Indexed entries, expired ones included until swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn collect(&self, pred: impl Fn(&str, &EntryMeta) -> bool) -> Vec<(String, EntryMeta)> {
        self.index
            .iter()
            .filter(|r| pred(r.key(), r.value()))
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    fn tier_usage(&self, tier: StrategyTier, excluding: Option<&str>) -> usize {
        self.index
            .iter()
            .filter(|r| r.tier == tier && Some(r.key().as_str()) != excluding)
            .map(|r| r.size_bytes)
            .sum()
    }

    fn publish_tier_bytes(&self) {
        for tier in StrategyTier::ALL {
            metrics::set_cache_bytes(tier.as_str(), self.tier_usage(tier, None));
        }
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the hybrid storage and sync engine.
//!
//! # Example
//!
//! ```
//! use hybrid_sync::EngineConfig;
//!
//! // Minimal config (in-memory backends, defaults everywhere)
//! let config = EngineConfig::default();
//! assert_eq!(config.sync.batch_size, 25);
//! assert!(config.db_path.is_none());
//!
//! // Durable config
//! let config = EngineConfig {
//!     db_path: Some("./school.db".into()),
//!     blob_dir: Some("./blobs".into()),
//!     cleanup_interval_secs: 60,
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::StrategyTier;
use crate::queue::ConflictResolution;
use crate::resilience::retry::RetryConfig;

/// Configuration for the whole engine.
///
/// Every field has a default. With no `db_path`/`blob_dir` the engine runs
/// entirely in memory, which is what tests and previews want.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// SQLite file for cache entries, the sync queue and the sync config
    #[serde(default)]
    pub db_path: Option<String>,

    /// Directory for the content-addressable blob store
    #[serde(default)]
    pub blob_dir: Option<String>,

    /// Per-tier TTL and size budgets
    #[serde(default)]
    pub cache: CacheConfig,

    /// Initial sync config (only used when none has been persisted yet)
    #[serde(default)]
    pub sync: SyncConfig,

    /// Maintenance sweep interval (cache expiry + orchestrator age cleanup)
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Upper bound for a single remote apply call
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,

    /// Backoff settings for transient sync failures
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Completed sync items kept for introspection
    #[serde(default = "default_archive_retention")]
    pub archive_retention: usize,
}

fn default_cleanup_interval_secs() -> u64 { 300 }
fn default_remote_timeout_ms() -> u64 { 10_000 }
fn default_backoff_initial_ms() -> u64 { 1_000 }
fn default_backoff_max_ms() -> u64 { 300_000 } // 5 minutes
fn default_backoff_factor() -> f64 { 2.0 }
fn default_archive_retention() -> usize { 1_000 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            blob_dir: None,
            cache: CacheConfig::default(),
            sync: SyncConfig::default(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            remote_timeout_ms: default_remote_timeout_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_factor: default_backoff_factor(),
            archive_retention: default_archive_retention(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    /// Backoff policy for sync retries. `max_retries` is not used here:
    /// the attempt ceiling lives on each queued item.
    #[must_use]
    pub fn backoff(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.backoff_initial_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            factor: self.backoff_factor,
            max_retries: None,
        }
    }
}

/// TTL, aggregate size budget and eviction rank for one cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub ttl_secs: u64,
    pub max_bytes: usize,
    /// Lower rank = more important (evicted last)
    pub priority: u8,
}

impl TierPolicy {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Tier table. Defaults come from [`StrategyTier::default_policy`].
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_frequent")]
    pub frequent: TierPolicy,
    #[serde(default = "default_normal")]
    pub normal: TierPolicy,
    #[serde(default = "default_rare")]
    pub rare: TierPolicy,
}

fn default_frequent() -> TierPolicy { StrategyTier::Frequent.default_policy() }
fn default_normal() -> TierPolicy { StrategyTier::Normal.default_policy() }
fn default_rare() -> TierPolicy { StrategyTier::Rare.default_policy() }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            frequent: default_frequent(),
            normal: default_normal(),
            rare: default_rare(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn policy(&self, tier: StrategyTier) -> TierPolicy {
        match tier {
            StrategyTier::Frequent => self.frequent,
            StrategyTier::Normal => self.normal,
            StrategyTier::Rare => self.rare,
        }
    }
}

/// Sync behaviour. Persisted as a single record and replaced through
/// `SyncQueueEngine::update_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_auto_sync")]
    pub auto_sync: bool,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Attempt ceiling stamped on newly queued items
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,
}

fn default_auto_sync() -> bool { true }
fn default_sync_interval_ms() -> u64 { 30_000 }
fn default_batch_size() -> usize { 25 }
fn default_max_retries() -> u32 { 5 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync: default_auto_sync(),
            sync_interval_ms: default_sync_interval_ms(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            conflict_resolution: ConflictResolution::default(),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }
}

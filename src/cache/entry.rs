// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::Serialize;
use std::collections::BTreeSet;

use super::tier::StrategyTier;
use crate::storage::RawEntry;

/// A decoded cache entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub data: T,
    pub tier: StrategyTier,
    pub created_at: i64,
    pub expires_at: i64,
    pub size_bytes: usize,
    pub access_count: u64,
    pub last_accessed: i64,
    pub tags: BTreeSet<String>,
}

impl<T> CacheEntry<T> {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        now_millis >= self.expires_at
    }
}

/// In-memory index record for one live key. The bytes stay in the backend.
#[derive(Debug, Clone)]
pub(crate) struct EntryMeta {
    pub storage_key: String,
    pub tier: StrategyTier,
    pub created_at: i64,
    pub expires_at: i64,
    pub size_bytes: usize,
    pub access_count: u64,
    pub last_accessed: i64,
    pub tags: BTreeSet<String>,
    /// Bumped on every write of the key
    pub generation: u64,
}

impl EntryMeta {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        now_millis >= self.expires_at
    }

    pub fn from_raw(raw: &RawEntry, generation: u64) -> Self {
        Self {
            storage_key: raw.storage_key.clone(),
            tier: raw.tier,
            created_at: raw.created_at,
            expires_at: raw.expires_at,
            size_bytes: raw.size_bytes,
            access_count: raw.access_count,
            last_accessed: raw.last_accessed,
            tags: raw.tags.iter().cloned().collect(),
            generation,
        }
    }
}

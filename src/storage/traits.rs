// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::StrategyTier;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Retryable I/O failure in a backing store
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// Rejected input, never retried
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Tier '{tier}' over budget: entry needs {needed} bytes, budget is {budget}")]
    Capacity {
        tier: StrategyTier,
        needed: usize,
        budget: usize,
    },
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// A cache entry as persisted: serialized bytes plus bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    /// `tier:logical-key`
    pub storage_key: String,
    pub logical_key: String,
    pub tier: StrategyTier,
    pub data: Vec<u8>,
    pub created_at: i64,
    pub expires_at: i64,
    pub size_bytes: usize,
    pub access_count: u64,
    pub last_accessed: i64,
    pub tags: Vec<String>,
}

/// Durable key/value backend behind the cache store.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, storage_key: &str) -> Result<Option<RawEntry>, StorageError>;
    async fn put(&self, entry: &RawEntry) -> Result<(), StorageError>;
    /// Returns whether an entry was removed.
    async fn delete(&self, storage_key: &str) -> Result<bool, StorageError>;
    /// Every persisted entry, used to rebuild the in-memory index on open.
    async fn list(&self) -> Result<Vec<RawEntry>, StorageError>;
    async fn clear(&self) -> Result<(), StorageError>;

    /// Persist access statistics. Default implementation rewrites the entry.
    async fn touch(&self, storage_key: &str, access_count: u64, last_accessed: i64) -> Result<(), StorageError> {
        if let Some(mut entry) = self.get(storage_key).await? {
            entry.access_count = access_count;
            entry.last_accessed = last_accessed;
            self.put(&entry).await?;
        }
        Ok(())
    }

    /// Default implementation falls back to sequential deletes.
    async fn delete_many(&self, storage_keys: &[String]) -> Result<usize, StorageError> {
        let mut removed = 0;
        for key in storage_keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Reference to a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    /// Content address (hex SHA-256 of the stored bytes)
    pub id: String,
    pub path: String,
    pub size: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub mime_type: String,
    pub filename: Option<String>,
}

impl BlobMetadata {
    pub fn new(mime_type: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            filename: None,
        }
    }

    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobStats {
    pub blob_count: usize,
    pub total_bytes: u64,
}

/// Content-addressable storage for large binary payloads.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn store_file(&self, bytes: &[u8], metadata: &BlobMetadata) -> Result<BlobRef, StorageError>;
    async fn get_file(&self, id: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn delete_file(&self, id: &str) -> Result<bool, StorageError>;
    async fn stats(&self) -> Result<BlobStats, StorageError>;

    /// Default implementation reads the whole blob.
    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.get_file(id).await?.is_some())
    }
}

/// Hex SHA-256, the blob content address.
pub fn content_address(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}

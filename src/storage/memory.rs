// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::{
    content_address, BlobMetadata, BlobRef, BlobStats, BlobStore, CacheBackend, RawEntry, StorageError,
};

/// Volatile cache backend. Used when no database path is configured.
pub struct InMemoryBackend {
    data: DashMap<String, RawEntry>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, storage_key: &str) -> Result<Option<RawEntry>, StorageError> {
        Ok(self.data.get(storage_key).map(|r| r.value().clone()))
    }

    async fn put(&self, entry: &RawEntry) -> Result<(), StorageError> {
        self.data.insert(entry.storage_key.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, storage_key: &str) -> Result<bool, StorageError> {
        Ok(self.data.remove(storage_key).is_some())
    }

    async fn list(&self) -> Result<Vec<RawEntry>, StorageError> {
        Ok(self.data.iter().map(|r| r.value().clone()).collect())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.data.clear();
        Ok(())
    }

    async fn touch(&self, storage_key: &str, access_count: u64, last_accessed: i64) -> Result<(), StorageError> {
        if let Some(mut entry) = self.data.get_mut(storage_key) {
            entry.access_count = access_count;
            entry.last_accessed = last_accessed;
        }
        Ok(())
    }
}

/// Volatile blob store keyed by content address.
pub struct InMemoryBlobStore {
    blobs: DashMap<String, (Vec<u8>, BlobMetadata)>,
}

impl InMemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            blobs: DashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn store_file(&self, bytes: &[u8], metadata: &BlobMetadata) -> Result<BlobRef, StorageError> {
        let id = content_address(bytes);
        self.blobs.insert(id.clone(), (bytes.to_vec(), metadata.clone()));
        Ok(BlobRef {
            path: format!("memory://{}", id),
            id,
            size: bytes.len() as u64,
            mime_type: metadata.mime_type.clone(),
        })
    }

    async fn get_file(&self, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blobs.get(id).map(|r| r.value().0.clone()))
    }

    async fn delete_file(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.blobs.remove(id).is_some())
    }

    async fn stats(&self) -> Result<BlobStats, StorageError> {
        let total_bytes = self.blobs.iter().map(|r| r.value().0.len() as u64).sum();
        Ok(BlobStats {
            blob_count: self.blobs.len(),
            total_bytes,
        })
    }

    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.blobs.contains_key(id))
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::strategy::StorageStrategy;
use crate::storage::{BlobRef, StorageError};

/// Orchestrator bookkeeping for one logical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageItem<T> {
    pub id: String,
    pub data: T,
    pub blob: Option<BlobRef>,
    pub cache_key: String,
    pub strategy: StorageStrategy,
    pub created_at: i64,
    pub last_accessed: i64,
    pub access_count: u64,
    /// Serialized record plus blob bytes
    pub size_bytes: u64,
}

impl StorageItem<Value> {
    /// Re-type the record payload.
    pub fn decode<T: DeserializeOwned>(self) -> Result<StorageItem<T>, StorageError> {
        Ok(StorageItem {
            data: serde_json::from_value(self.data)?,
            id: self.id,
            blob: self.blob,
            cache_key: self.cache_key,
            strategy: self.strategy,
            created_at: self.created_at,
            last_accessed: self.last_accessed,
            access_count: self.access_count,
            size_bytes: self.size_bytes,
        })
    }

    pub(crate) fn blob_id(&self) -> Option<&str> {
        self.blob.as_ref().map(|b| b.id.as_str())
    }
}

/// Cache key for a record id.
pub fn cache_key_for(id: &str) -> String {
    format!("storage:{}", id)
}

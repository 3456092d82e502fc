// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content-addressable blob files on disk.
//!
//! Layout mirrors git's object store: `<root>/<first 2 hex>/<sha256 hex>`.
//! Storing identical bytes twice yields the same [`BlobRef`] and one file.
//! Writes go to a temp file first and are renamed into place, so a reader
//! never observes a half-written blob.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::traits::{content_address, BlobMetadata, BlobRef, BlobStats, BlobStore, StorageError};
use crate::metrics;

pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::Backend(format!("create blob dir {}: {}", root.display(), e)))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path for a content address. `None` for anything that isn't hex,
    /// which keeps ids from escaping the root.
    fn path_for(&self, id: &str) -> Option<PathBuf> {
        if id.len() < 3 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(self.root.join(&id[..2]).join(id))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn store_file(&self, bytes: &[u8], metadata: &BlobMetadata) -> Result<BlobRef, StorageError> {
        let id = content_address(bytes);
        let path = self
            .path_for(&id)
            .ok_or_else(|| StorageError::Backend(format!("invalid content address {}", id)))?;

        let result: std::io::Result<()> = async {
            if fs::try_exists(&path).await? {
                debug!(id = %id, "Blob already present");
                return Ok(());
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
            fs::write(&tmp, bytes).await?;
            fs::rename(&tmp, &path).await
        }
        .await;

        metrics::record_blob_operation("store", result.is_ok());
        result.map_err(|e| StorageError::Backend(format!("write blob {}: {}", id, e)))?;

        Ok(BlobRef {
            path: path.to_string_lossy().into_owned(),
            id,
            size: bytes.len() as u64,
            mime_type: metadata.mime_type.clone(),
        })
    }

    async fn get_file(&self, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let Some(path) = self.path_for(id) else {
            return Ok(None);
        };
        match fs::read(&path).await {
            Ok(bytes) => {
                metrics::record_blob_operation("get", true);
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => {
                metrics::record_blob_operation("get", false);
                Err(StorageError::Backend(format!("read blob {}: {}", id, e)))
            }
        }
    }

    async fn delete_file(&self, id: &str) -> Result<bool, StorageError> {
        let Some(path) = self.path_for(id) else {
            return Ok(false);
        };
        match fs::remove_file(&path).await {
            Ok(()) => {
                metrics::record_blob_operation("delete", true);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => {
                metrics::record_blob_operation("delete", false);
                Err(StorageError::Backend(format!("delete blob {}: {}", id, e)))
            }
        }
    }

    async fn stats(&self) -> Result<BlobStats, StorageError> {
        let to_err = |e: std::io::Error| StorageError::Backend(format!("scan blob dir: {}", e));
        let mut stats = BlobStats::default();

        let mut shards = fs::read_dir(&self.root).await.map_err(to_err)?;
        while let Some(shard) = shards.next_entry().await.map_err(to_err)? {
            if !shard.file_type().await.map_err(to_err)?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(shard.path()).await.map_err(to_err)?;
            while let Some(file) = files.next_entry().await.map_err(to_err)? {
                // In-flight temp files carry an extension
                if file.path().extension().is_some() {
                    continue;
                }
                stats.blob_count += 1;
                stats.total_bytes += file.metadata().await.map_err(to_err)?.len();
            }
        }
        Ok(stats)
    }

    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        let Some(path) = self.path_for(id) else {
            return Ok(false);
        };
        fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::Backend(format!("stat blob {}: {}", id, e)))
    }
}

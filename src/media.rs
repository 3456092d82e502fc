// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Binary payloads attached to stored records, and the optional hook that
//! shrinks images before they reach the blob store.
//!
//! No codec ships with this crate. Applications that want thumbnails or
//! recompression plug in their own [`MediaOptimizer`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::storage::{BlobMetadata, StorageError};

/// Hints passed to a [`MediaOptimizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaOptions {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    /// 1-100
    pub quality: u8,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            max_width: Some(1920),
            max_height: Some(1080),
            quality: 80,
        }
    }
}

#[async_trait]
pub trait MediaOptimizer: Send + Sync {
    /// Return the bytes to store in place of `bytes`.
    async fn transform(&self, bytes: &[u8], mime_type: &str, options: &MediaOptions) -> Result<Vec<u8>, StorageError>;
}

/// A binary payload to be written to the blob store alongside a record.
#[derive(Debug, Clone)]
pub struct BlobPayload {
    pub bytes: Vec<u8>,
    pub metadata: BlobMetadata,
    pub options: MediaOptions,
}

impl BlobPayload {
    pub fn new(bytes: impl Into<Vec<u8>>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            metadata: BlobMetadata::new(mime_type),
            options: MediaOptions::default(),
        }
    }

    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.metadata.filename = Some(filename.into());
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: MediaOptions) -> Self {
        self.options = options;
        self
    }

    pub fn is_image(&self) -> bool {
        self.metadata.mime_type.starts_with("image/")
    }
}

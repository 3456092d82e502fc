// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

pub mod blob;
pub mod memory;
pub mod sql;
pub mod traits;

pub use blob::FileBlobStore;
pub use memory::{InMemoryBackend, InMemoryBlobStore};
pub use sql::SqlBackend;
pub use traits::{BlobMetadata, BlobRef, BlobStats, BlobStore, CacheBackend, RawEntry, StorageError};

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable storage for the sync queue, the completed-item archive and the
//! sync config record.
//!
//! ```sql
//! CREATE TABLE sync_queue   (id TEXT PRIMARY KEY, seq INTEGER, status TEXT, record TEXT);
//! CREATE TABLE sync_archive (id TEXT PRIMARY KEY, seq INTEGER, completed_at INTEGER, record TEXT);
//! CREATE TABLE sync_config  (id INTEGER PRIMARY KEY, record TEXT);  -- single row, id = 1
//! ```
//!
//! Records are the serde_json form of [`SyncItem`] / [`SyncConfig`]; the
//! side columns only exist for ordering and pruning.

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::{any::AnyRow, AnyPool};
use std::collections::BTreeMap;
use tracing::warn;

use crate::config::SyncConfig;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::sql::{open_sqlite_pool, text_column};
use crate::storage::StorageError;
use crate::sync_item::SyncItem;

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Every item still in the active queue, in enqueue order.
    async fn load_active(&self) -> Result<Vec<SyncItem>, StorageError>;
    async fn upsert(&self, item: &SyncItem) -> Result<(), StorageError>;
    async fn remove(&self, id: &str) -> Result<(), StorageError>;
    /// Move a completed item out of the active queue, keeping at most
    /// `retention` archived items (newest first).
    async fn archive(&self, item: &SyncItem, retention: usize) -> Result<(), StorageError>;
    /// Archived items, oldest completion first.
    async fn load_archive(&self) -> Result<Vec<SyncItem>, StorageError>;
    /// Drop the active queue and the archive.
    async fn clear(&self) -> Result<(), StorageError>;
    async fn load_config(&self) -> Result<Option<SyncConfig>, StorageError>;
    async fn save_config(&self, config: &SyncConfig) -> Result<(), StorageError>;
}

#[derive(Default)]
struct MemoryQueueState {
    active: BTreeMap<String, SyncItem>,
    archive: Vec<SyncItem>,
    config: Option<SyncConfig>,
}

/// Non-durable [`QueueStore`] for tests and previews.
#[derive(Default)]
pub struct InMemoryQueueStore {
    state: Mutex<MemoryQueueState>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn load_active(&self) -> Result<Vec<SyncItem>, StorageError> {
        let mut items: Vec<SyncItem> = self.state.lock().active.values().cloned().collect();
        items.sort_by_key(|i| i.seq);
        Ok(items)
    }

    async fn upsert(&self, item: &SyncItem) -> Result<(), StorageError> {
        self.state.lock().active.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StorageError> {
        self.state.lock().active.remove(id);
        Ok(())
    }

    async fn archive(&self, item: &SyncItem, retention: usize) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.active.remove(&item.id);
        state.archive.retain(|i| i.id != item.id);
        state.archive.push(item.clone());
        let excess = state.archive.len().saturating_sub(retention);
        state.archive.drain(..excess);
        Ok(())
    }

    async fn load_archive(&self) -> Result<Vec<SyncItem>, StorageError> {
        Ok(self.state.lock().archive.clone())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.active.clear();
        state.archive.clear();
        Ok(())
    }

    async fn load_config(&self) -> Result<Option<SyncConfig>, StorageError> {
        Ok(self.state.lock().config.clone())
    }

    async fn save_config(&self, config: &SyncConfig) -> Result<(), StorageError> {
        self.state.lock().config = Some(config.clone());
        Ok(())
    }
}

/// SQLite-backed [`QueueStore`]. Shares the pool with the cache backend.
pub struct SqlQueueStore {
    pool: AnyPool,
}

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

impl SqlQueueStore {
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let pool = open_sqlite_pool(path).await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: AnyPool) -> Result<Self, StorageError> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS sync_queue (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                status TEXT NOT NULL,
                record TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS sync_archive (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                completed_at INTEGER NOT NULL,
                record TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS sync_config (
                id INTEGER PRIMARY KEY,
                record TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_seq ON sync_queue(seq)",
        ];

        retry("sql_queue_schema", &RetryConfig::startup(), || async {
            for sql in statements {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend_err)?;
            }
            Ok(())
        })
        .await
    }

    /// Rows that no longer decode are logged and skipped.
    fn decode_items(rows: &[AnyRow]) -> Vec<SyncItem> {
        rows.iter()
            .filter_map(|row| {
                let decoded = text_column(row, "record")
                    .and_then(|record| serde_json::from_str(&record).map_err(StorageError::from));
                match decoded {
                    Ok(item) => Some(item),
                    Err(e) => {
                        warn!(error = %e, "Skipping unreadable sync queue row");
                        None
                    }
                }
            })
            .collect()
    }
}

#[async_trait]
impl QueueStore for SqlQueueStore {
    async fn load_active(&self) -> Result<Vec<SyncItem>, StorageError> {
        let rows = retry("sql_queue_load", &RetryConfig::query(), || async {
            sqlx::query("SELECT record FROM sync_queue ORDER BY seq ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(backend_err)
        })
        .await?;
        Ok(Self::decode_items(&rows))
    }

    async fn upsert(&self, item: &SyncItem) -> Result<(), StorageError> {
        let record = serde_json::to_string(item)?;
        retry("sql_queue_upsert", &RetryConfig::query(), || async {
            sqlx::query(
                "INSERT INTO sync_queue (id, seq, status, record) VALUES (?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    seq = excluded.seq,
                    status = excluded.status,
                    record = excluded.record",
            )
            .bind(&item.id)
            .bind(item.seq as i64)
            .bind(item.status.as_str())
            .bind(&record)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, id: &str) -> Result<(), StorageError> {
        retry("sql_queue_remove", &RetryConfig::query(), || async {
            sqlx::query("DELETE FROM sync_queue WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
            Ok(())
        })
        .await
    }

    async fn archive(&self, item: &SyncItem, retention: usize) -> Result<(), StorageError> {
        let record = serde_json::to_string(item)?;
        let completed_at = item.completed_at.unwrap_or(item.updated_at);

        retry("sql_queue_archive", &RetryConfig::query(), || async {
            let mut tx = self.pool.begin().await.map_err(backend_err)?;
            sqlx::query("DELETE FROM sync_queue WHERE id = ?")
                .bind(&item.id)
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
            sqlx::query(
                "INSERT INTO sync_archive (id, seq, completed_at, record) VALUES (?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    completed_at = excluded.completed_at,
                    record = excluded.record",
            )
            .bind(&item.id)
            .bind(item.seq as i64)
            .bind(completed_at)
            .bind(&record)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
            sqlx::query(
                "DELETE FROM sync_archive WHERE id NOT IN (
                    SELECT id FROM sync_archive ORDER BY completed_at DESC, seq DESC LIMIT ?
                 )",
            )
            .bind(retention as i64)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
            tx.commit().await.map_err(backend_err)
        })
        .await
    }

    async fn load_archive(&self) -> Result<Vec<SyncItem>, StorageError> {
        let rows = retry("sql_archive_load", &RetryConfig::query(), || async {
            sqlx::query("SELECT record FROM sync_archive ORDER BY completed_at ASC, seq ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(backend_err)
        })
        .await?;
        Ok(Self::decode_items(&rows))
    }

    async fn clear(&self) -> Result<(), StorageError> {
        retry("sql_queue_clear", &RetryConfig::query(), || async {
            let mut tx = self.pool.begin().await.map_err(backend_err)?;
            sqlx::query("DELETE FROM sync_queue")
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
            sqlx::query("DELETE FROM sync_archive")
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
            tx.commit().await.map_err(backend_err)
        })
        .await
    }

    async fn load_config(&self) -> Result<Option<SyncConfig>, StorageError> {
        let row = retry("sql_config_load", &RetryConfig::query(), || async {
            sqlx::query("SELECT record FROM sync_config WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(backend_err)
        })
        .await?;

        match row {
            Some(row) => {
                let record = text_column(&row, "record")?;
                Ok(Some(serde_json::from_str(&record)?))
            }
            None => Ok(None),
        }
    }

    async fn save_config(&self, config: &SyncConfig) -> Result<(), StorageError> {
        let record = serde_json::to_string(config)?;
        retry("sql_config_save", &RetryConfig::query(), || async {
            sqlx::query(
                "INSERT INTO sync_config (id, record) VALUES (1, ?)
                 ON CONFLICT(id) DO UPDATE SET record = excluded.record",
            )
            .bind(&record)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
            Ok(())
        })
        .await
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite persistence for cache entries.
//!
//! ```sql
//! CREATE TABLE cache_entries (
//!   storage_key TEXT PRIMARY KEY,   -- tier:logical-key
//!   logical_key TEXT NOT NULL,
//!   tier TEXT NOT NULL,
//!   data BLOB NOT NULL,             -- serde_json bytes
//!   created_at INTEGER NOT NULL,
//!   expires_at INTEGER NOT NULL,
//!   size_bytes INTEGER NOT NULL,
//!   access_count INTEGER NOT NULL,
//!   last_accessed INTEGER NOT NULL,
//!   tags TEXT NOT NULL              -- JSON array
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! Timestamps and counters go through `i64` because the `Any` driver has
//! no unsigned mapping. Tags are a JSON array in a TEXT column.

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, any::AnyRow, AnyPool, Row};
use std::str::FromStr;
use std::sync::Once;
use std::time::Duration;
use tracing::warn;

use super::traits::{CacheBackend, RawEntry, StorageError};
use crate::cache::StrategyTier;
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Open (creating if needed) a SQLite database file in WAL mode.
///
/// The returned pool is shared by the cache backend, the sync queue store
/// and the sync config record.
pub async fn open_sqlite_pool(path: &str) -> Result<AnyPool, StorageError> {
    install_drivers();
    let url = format!("sqlite://{}?mode=rwc", path);

    let pool = retry("sqlite_connect", &RetryConfig::startup(), || async {
        AnyPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect(&url)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    })
    .await?;

    // Readers don't block the single writer
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

    Ok(pool)
}

/// Read a TEXT column that the `Any` driver may hand back as bytes.
pub(crate) fn text_column(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    row.try_get::<String, _>(column)
        .or_else(|_| {
            row.try_get::<Vec<u8>, _>(column)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        })
        .map_err(|e| StorageError::Backend(format!("column '{}': {}", column, e)))
}

pub struct SqlBackend {
    pool: AnyPool,
}

impl SqlBackend {
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let pool = open_sqlite_pool(path).await?;
        Self::with_pool(pool).await
    }

    /// Use an already opened pool (schema is created if missing).
    pub async fn with_pool(pool: AnyPool) -> Result<Self, StorageError> {
        let backend = Self { pool };
        backend.init_schema().await?;
        Ok(backend)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let sql = r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                storage_key TEXT PRIMARY KEY,
                logical_key TEXT NOT NULL,
                tier TEXT NOT NULL,
                data BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                size_bytes INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                last_accessed INTEGER NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]'
            )
        "#;

        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at)")
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    fn row_to_entry(row: &AnyRow) -> Result<RawEntry, StorageError> {
        let tier = StrategyTier::from_str(&text_column(row, "tier")?)?;
        let tags_json = text_column(row, "tags")?;
        let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
        let get_i64 = |column: &str| -> Result<i64, StorageError> {
            row.try_get::<i64, _>(column)
                .map_err(|e| StorageError::Backend(format!("column '{}': {}", column, e)))
        };

        Ok(RawEntry {
            storage_key: text_column(row, "storage_key")?,
            logical_key: text_column(row, "logical_key")?,
            tier,
            data: row
                .try_get::<Vec<u8>, _>("data")
                .map_err(|e| StorageError::Backend(format!("column 'data': {}", e)))?,
            created_at: get_i64("created_at")?,
            expires_at: get_i64("expires_at")?,
            size_bytes: get_i64("size_bytes")?.max(0) as usize,
            access_count: get_i64("access_count")?.max(0) as u64,
            last_accessed: get_i64("last_accessed")?,
            tags,
        })
    }
}

/// Keys per `DELETE ... IN (...)`; stays well under SQLite's bind limit.
const DELETE_CHUNK: usize = 500;

const SELECT_COLUMNS: &str =
    "storage_key, logical_key, tier, data, created_at, expires_at, size_bytes, access_count, last_accessed, tags";

#[async_trait]
impl CacheBackend for SqlBackend {
    async fn get(&self, storage_key: &str) -> Result<Option<RawEntry>, StorageError> {
        let sql = format!("SELECT {} FROM cache_entries WHERE storage_key = ?", SELECT_COLUMNS);
        let row = retry("sql_cache_get", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(storage_key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn put(&self, entry: &RawEntry) -> Result<(), StorageError> {
        let tags = serde_json::to_string(&entry.tags)?;
        let sql = "INSERT INTO cache_entries (storage_key, logical_key, tier, data, created_at, expires_at, size_bytes, access_count, last_accessed, tags)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(storage_key) DO UPDATE SET
                logical_key = excluded.logical_key,
                tier = excluded.tier,
                data = excluded.data,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                size_bytes = excluded.size_bytes,
                access_count = excluded.access_count,
                last_accessed = excluded.last_accessed,
                tags = excluded.tags";

        retry("sql_cache_put", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(&entry.storage_key)
                .bind(&entry.logical_key)
                .bind(entry.tier.as_str())
                .bind(&entry.data)
                .bind(entry.created_at)
                .bind(entry.expires_at)
                .bind(entry.size_bytes as i64)
                .bind(entry.access_count as i64)
                .bind(entry.last_accessed)
                .bind(&tags)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, storage_key: &str) -> Result<bool, StorageError> {
        retry("sql_cache_delete", &RetryConfig::query(), || async {
            let result = sqlx::query("DELETE FROM cache_entries WHERE storage_key = ?")
                .bind(storage_key)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn delete_many(&self, storage_keys: &[String]) -> Result<usize, StorageError> {
        let mut removed = 0;
        for chunk in storage_keys.chunks(DELETE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!("DELETE FROM cache_entries WHERE storage_key IN ({})", placeholders);
            removed += retry("sql_cache_delete_many", &RetryConfig::query(), || async {
                let mut query = sqlx::query(&sql);
                for key in chunk {
                    query = query.bind(key);
                }
                let result = query
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                Ok::<_, StorageError>(result.rows_affected() as usize)
            })
            .await?;
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<RawEntry>, StorageError> {
        let sql = format!("SELECT {} FROM cache_entries", SELECT_COLUMNS);
        let rows = retry("sql_cache_list", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let entries = rows
            .iter()
            .filter_map(|row| match Self::row_to_entry(row) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    let key = text_column(row, "storage_key").unwrap_or_default();
                    warn!(key = %key, error = %e, "Skipping unreadable cache row");
                    None
                }
            })
            .collect();
        Ok(entries)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        retry("sql_cache_clear", &RetryConfig::query(), || async {
            sqlx::query("DELETE FROM cache_entries")
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn touch(&self, storage_key: &str, access_count: u64, last_accessed: i64) -> Result<(), StorageError> {
        retry("sql_cache_touch", &RetryConfig::query(), || async {
            sqlx::query("UPDATE cache_entries SET access_count = ?, last_accessed = ? WHERE storage_key = ?")
                .bind(access_count as i64)
                .bind(last_accessed)
                .bind(storage_key)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }
}

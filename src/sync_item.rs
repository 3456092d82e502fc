// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync item data structure.
//!
//! A [`SyncItem`] is one local mutation waiting to be applied against the
//! remote system. Items are created by
//! [`SyncQueueEngine::add_to_sync_queue`](crate::queue::SyncQueueEngine::add_to_sync_queue)
//! and mutated only by the queue engine.
//!
//! ```text
//! Pending ──claim──► InProgress ──ack──────────► Completed
//!    ▲                   │
//!    └──transient/LWW────┤
//!                        └──exhausted/manual───► Failed
//! ```
//!
//! # Example
//!
//! ```
//! use hybrid_sync::{SyncItem, SyncOperation, SyncPriority, SyncStatus};
//! use serde_json::json;
//!
//! let item = SyncItem::new(
//!     1,
//!     SyncOperation::Create,
//!     "student",
//!     json!({"id": 42, "name": "Ada"}),
//!     SyncPriority::High,
//!     5,
//!     1_700_000_000_000,
//! );
//!
//! assert_eq!(item.status, SyncStatus::Pending);
//! assert_eq!(item.entity_key(), "student:42");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::storage::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncOperation {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(SyncOperation::Create),
            "update" => Ok(SyncOperation::Update),
            "delete" => Ok(SyncOperation::Delete),
            other => Err(StorageError::Validation(format!("unknown sync operation '{}'", other))),
        }
    }
}

/// Attempt order: `High` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPriority {
    High,
    Medium,
    Low,
}

impl SyncPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPriority::High => "high",
            SyncPriority::Medium => "medium",
            SyncPriority::Low => "low",
        }
    }
}

impl FromStr for SyncPriority {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(SyncPriority::High),
            "medium" => Ok(SyncPriority::Medium),
            "low" => Ok(SyncPriority::Low),
            other => Err(StorageError::Validation(format!("unknown sync priority '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Completed | SyncStatus::Failed)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
    /// UUID v4
    pub id: String,
    /// Enqueue order, strictly increasing per queue
    pub seq: u64,
    pub operation: SyncOperation,
    pub entity_type: String,
    pub payload: Value,
    pub priority: SyncPriority,
    pub status: SyncStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Epoch millis
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Not eligible for an attempt before this instant (epoch millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<i64>,
    /// Set when a conflict was resolved in favour of the local payload;
    /// the next attempt asks the remote to overwrite.
    #[serde(default)]
    pub force: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl SyncItem {
    pub fn new(
        seq: u64,
        operation: SyncOperation,
        entity_type: impl Into<String>,
        payload: Value,
        priority: SyncPriority,
        max_attempts: u32,
        now_millis: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            seq,
            operation,
            entity_type: entity_type.into(),
            payload,
            priority,
            status: SyncStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            created_at: now_millis,
            updated_at: now_millis,
            last_error: None,
            retry_after: None,
            force: false,
            completed_at: None,
        }
    }

    /// The payload's `id` field, if it has a scalar one.
    pub fn entity_id(&self) -> Option<String> {
        match self.payload.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Key used to serialize attempts per entity. Items without a payload
    /// id are their own entity.
    pub fn entity_key(&self) -> String {
        match self.entity_id() {
            Some(id) => format!("{}:{}", self.entity_type, id),
            None => format!("{}:#{}", self.entity_type, self.id),
        }
    }

    /// Pending and past any backoff.
    pub fn is_eligible(&self, now_millis: i64) -> bool {
        self.status == SyncStatus::Pending && self.retry_after.map_or(true, |t| t <= now_millis)
    }

    /// Timestamp compared against the remote's on a last-write-wins conflict:
    /// the payload's numeric `updated_at`, else when the item was queued.
    pub fn local_updated_at(&self) -> i64 {
        self.payload
            .get("updated_at")
            .and_then(Value::as_i64)
            .unwrap_or(self.created_at)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

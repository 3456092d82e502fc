// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collaborators on the far side of the sync queue: the remote API and the
//! connectivity signal. Transport details are up to the implementor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::sync_item::{SyncItem, SyncOperation};

/// One mutation to apply remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// Queue item id, usable as an idempotency key
    pub item_id: String,
    pub entity_type: String,
    pub operation: SyncOperation,
    pub payload: Value,
    /// Overwrite remote state even if it moved on (set after a local-wins
    /// conflict resolution)
    pub force: bool,
    /// 1-based
    pub attempt: u32,
}

impl RemoteRequest {
    pub fn from_item(item: &SyncItem) -> Self {
        Self {
            item_id: item.id.clone(),
            entity_type: item.entity_type.clone(),
            operation: item.operation,
            payload: item.payload.clone(),
            force: item.force,
            attempt: item.attempts + 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteAck {
    /// Remote version timestamp after the write, if reported
    pub remote_updated_at: Option<i64>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Network trouble, 5xx, timeouts: retried with backoff
    #[error("Transient remote error: {0}")]
    Transient(String),
    /// The remote copy changed since the local one was based on it
    #[error("Remote conflict (remote updated at {remote_updated_at})")]
    Conflict {
        remote_payload: Value,
        remote_updated_at: i64,
    },
    /// The remote refused the payload: never retried
    #[error("Remote rejected payload: {0}")]
    Validation(String),
}

/// Remote system that queued mutations are applied against.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn apply(&self, request: &RemoteRequest) -> Result<RemoteAck, RemoteError>;
}

/// Online/offline state plus a transition feed.
pub trait ConnectivityProbe: Send + Sync {
    fn is_online(&self) -> bool;
    /// Receiver that observes every online/offline change.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity driven by the application (e.g. from OS network events).
pub struct ManualConnectivity {
    tx: watch::Sender<bool>,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }
}

impl ConnectivityProbe for ManualConnectivity {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

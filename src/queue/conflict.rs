// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sync_item::SyncItem;

/// How a remote version conflict is settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Keep the remote copy, drop the local change
    RemoteWins,
    /// Re-send the local change on top of the remote copy
    LocalWins,
    /// Newer timestamp wins; ties go to the remote
    #[default]
    LastWriteWins,
    /// Park the item as failed for a human to decide
    Manual,
}

/// What the queue does with a conflicted item.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resolution {
    /// Mark completed; the local change is discarded
    DiscardLocal,
    /// Re-queue with this payload and `force` set
    Requeue(Value),
    /// Mark failed until someone intervenes
    Manual,
}

pub(crate) fn resolve(
    policy: ConflictResolution,
    item: &SyncItem,
    remote_payload: &Value,
    remote_updated_at: i64,
) -> Resolution {
    match policy {
        ConflictResolution::RemoteWins => Resolution::DiscardLocal,
        ConflictResolution::LocalWins => Resolution::Requeue(overlay(remote_payload, &item.payload)),
        ConflictResolution::LastWriteWins => {
            if item.local_updated_at() > remote_updated_at {
                Resolution::Requeue(overlay(remote_payload, &item.payload))
            } else {
                Resolution::DiscardLocal
            }
        }
        ConflictResolution::Manual => Resolution::Manual,
    }
}

/// Shallow merge: remote object with local fields written over it. Non-object
/// payloads are replaced by the local one wholesale.
fn overlay(remote: &Value, local: &Value) -> Value {
    match (remote, local) {
        (Value::Object(remote), Value::Object(local)) => {
            let mut merged = remote.clone();
            for (k, v) in local {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => local.clone(),
    }
}

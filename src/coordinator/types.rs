// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the engine facade.

use serde::Serialize;
use serde_json::Value;

use crate::cache::CacheStats;
use crate::orchestrator::{CleanupReport, StorageItem};
use crate::queue::SyncStats;
use crate::sync_item::SyncItem;

/// Engine lifecycle state.
///
/// Use [`super::HybridEngine::state()`] to check the current state or
/// [`super::HybridEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Constructed, background work not started
    Created,
    /// Maintenance and auto-sync loops running
    Running,
    /// Background loops are being stopped
    ShuttingDown,
    /// Background loops stopped; facade calls still work
    Stopped,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Snapshot for an admin dashboard or a `/health` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub state: EngineState,
    pub online: bool,
    pub tracked_items: usize,
    pub cache: CacheStats,
    pub sync: SyncStats,
}

impl EngineHealth {
    /// Running with nothing stuck in `Failed`.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state == EngineState::Running && self.sync.failed_items == 0
    }
}

/// Result of a facade `save`.
#[derive(Debug, Clone)]
pub struct SavedRecord {
    pub item: StorageItem<Value>,
    pub sync_item: SyncItem,
}

/// What one maintenance pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub cache_entries_expired: usize,
    pub storage: CleanupReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(format!("{}", EngineState::Created), "Created");
        assert_eq!(format!("{}", EngineState::ShuttingDown), "ShuttingDown");
        assert_eq!(EngineState::ShuttingDown.as_str(), "shutting_down");
    }
}

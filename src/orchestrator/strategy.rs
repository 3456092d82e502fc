// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::StrategyTier;
use crate::storage::StorageError;
use crate::sync_item::SyncPriority;

/// How eagerly a strategy's data is expected to be needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierType {
    Immediate,
    Lazy,
    Background,
}

impl TierType {
    /// Idle time after which cleanup drops an item.
    #[must_use]
    pub fn max_age(self) -> Duration {
        match self {
            TierType::Immediate => Duration::from_secs(24 * 3600),
            TierType::Lazy => Duration::from_secs(12 * 3600),
            TierType::Background => Duration::from_secs(6 * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyPriority {
    High,
    Medium,
    Low,
}

impl From<StrategyPriority> for SyncPriority {
    fn from(p: StrategyPriority) -> Self {
        match p {
            StrategyPriority::High => SyncPriority::High,
            StrategyPriority::Medium => SyncPriority::Medium,
            StrategyPriority::Low => SyncPriority::Low,
        }
    }
}

/// One row of the strategy catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategySpec {
    pub name: &'static str,
    pub tier_type: TierType,
    pub priority: StrategyPriority,
    pub cache_tier: StrategyTier,
}

/// Named storage strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageStrategy {
    Critical,
    Important,
    Secondary,
    HeavyFiles,
}

static CRITICAL: StrategySpec = StrategySpec {
    name: "critical",
    tier_type: TierType::Immediate,
    priority: StrategyPriority::High,
    cache_tier: StrategyTier::Frequent,
};
static IMPORTANT: StrategySpec = StrategySpec {
    name: "important",
    tier_type: TierType::Immediate,
    priority: StrategyPriority::Medium,
    cache_tier: StrategyTier::Normal,
};
static SECONDARY: StrategySpec = StrategySpec {
    name: "secondary",
    tier_type: TierType::Lazy,
    priority: StrategyPriority::Low,
    cache_tier: StrategyTier::Rare,
};
static HEAVY_FILES: StrategySpec = StrategySpec {
    name: "heavy_files",
    tier_type: TierType::Background,
    priority: StrategyPriority::Low,
    cache_tier: StrategyTier::Rare,
};

impl StorageStrategy {
    pub const ALL: [StorageStrategy; 4] = [
        StorageStrategy::Critical,
        StorageStrategy::Important,
        StorageStrategy::Secondary,
        StorageStrategy::HeavyFiles,
    ];

    #[must_use]
    pub fn spec(self) -> &'static StrategySpec {
        match self {
            StorageStrategy::Critical => &CRITICAL,
            StorageStrategy::Important => &IMPORTANT,
            StorageStrategy::Secondary => &SECONDARY,
            StorageStrategy::HeavyFiles => &HEAVY_FILES,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.spec().name
    }

    #[must_use]
    pub fn cache_tier(self) -> StrategyTier {
        self.spec().cache_tier
    }

    #[must_use]
    pub fn max_age(self) -> Duration {
        self.spec().tier_type.max_age()
    }
}

impl fmt::Display for StorageStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StorageStrategy {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorageStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.name() == s)
            .ok_or_else(|| StorageError::Validation(format!("unknown storage strategy '{}'", s)))
    }
}

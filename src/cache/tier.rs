// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::TierPolicy;
use crate::storage::StorageError;

const MIB: usize = 1024 * 1024;

/// Cache tier. Closed set; each tier carries a TTL, a size budget and an
/// eviction rank (see [`TierPolicy`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyTier {
    Frequent,
    Normal,
    Rare,
}

impl StrategyTier {
    pub const ALL: [StrategyTier; 3] = [StrategyTier::Frequent, StrategyTier::Normal, StrategyTier::Rare];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyTier::Frequent => "frequent",
            StrategyTier::Normal => "normal",
            StrategyTier::Rare => "rare",
        }
    }

    #[must_use]
    pub fn default_policy(self) -> TierPolicy {
        match self {
            StrategyTier::Frequent => TierPolicy {
                ttl_secs: 24 * 3600,
                max_bytes: 64 * MIB,
                priority: 1,
            },
            StrategyTier::Normal => TierPolicy {
                ttl_secs: 6 * 3600,
                max_bytes: 32 * MIB,
                priority: 2,
            },
            StrategyTier::Rare => TierPolicy {
                ttl_secs: 3600,
                max_bytes: 16 * MIB,
                priority: 3,
            },
        }
    }

    /// Persisted key: `tier:logical-key`
    #[must_use]
    pub fn storage_key(self, logical_key: &str) -> String {
        format!("{}:{}", self.as_str(), logical_key)
    }
}

impl fmt::Display for StrategyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyTier {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "frequent" => Ok(StrategyTier::Frequent),
            "normal" => Ok(StrategyTier::Normal),
            "rare" => Ok(StrategyTier::Rare),
            other => Err(StorageError::Validation(format!("unknown cache tier '{}'", other))),
        }
    }
}

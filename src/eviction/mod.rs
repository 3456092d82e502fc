// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Eviction policy for over-budget cache tiers.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  tan_curve.rs                                                │
//! │  └─ TierPressure: tier utilization → score multiplier        │
//! │  └─ TanCurvePolicy: recency + frequency + size → score       │
//! │  └─ EvictionCandidate: entry metadata needed for scoring     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The cache store builds one `EvictionCandidate` per live entry of the
//! tier that is about to overflow and asks the policy for the cheapest
//! set of victims that frees enough bytes. Expired entries are purged
//! before scoring, so only live data competes.

pub mod tan_curve;

pub use tan_curve::{EvictionCandidate, TanCurvePolicy, TierPressure};

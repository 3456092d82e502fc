// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::f64::consts::PI;

/// Entry metadata for eviction scoring. Timestamps are epoch millis so
/// scores stay meaningful for entries reloaded from disk.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: String,
    pub size_bytes: usize,
    pub last_accessed: i64,
    pub access_count: u64,
}

impl EvictionCandidate {
    pub fn idle_secs(&self, now_millis: i64) -> f64 {
        (now_millis.saturating_sub(self.last_accessed)).max(0) as f64 / 1000.0
    }
}

/// Maps tier utilization to a smooth multiplier using a tan curve.
pub struct TierPressure {
    /// Utilization where pressure starts (default: 75%)
    pub center_percent: f64,
    /// Utilization where pressure is critical (default: 95%)
    pub critical_percent: f64,
}

impl Default for TierPressure {
    fn default() -> Self {
        Self {
            center_percent: 0.75,
            critical_percent: 0.95,
        }
    }
}

impl TierPressure {
    /// 1.0 at low pressure, smoothly decreasing to 0.0 at critical.
    pub fn multiplier(&self, used_percent: f64) -> f64 {
        if used_percent <= self.center_percent {
            return 1.0;
        }
        if used_percent >= self.critical_percent {
            return 0.0;
        }

        let range = self.critical_percent - self.center_percent;
        let normalized = (used_percent - self.center_percent) / range;
        let angle = (normalized - 0.5) * PI / 1.2;
        (1.0 - (angle.tan() + 2.0) / 4.0).clamp(0.0, 1.0)
    }
}

/// Eviction policy combining recency, frequency, and size.
pub struct TanCurvePolicy {
    /// Half-life for recency decay (seconds)
    pub recency_half_life: f64,
    /// Max access count for normalization
    pub max_access_count: u64,
    /// Baseline size in bytes for size scoring
    pub baseline_size_bytes: usize,
    /// Weights for (recency, frequency, size)
    pub weights: (f64, f64, f64),
    pub pressure: TierPressure,
}

impl Default for TanCurvePolicy {
    fn default() -> Self {
        Self {
            recency_half_life: 3600.0,
            max_access_count: 1000,
            baseline_size_bytes: 64 * 1024,
            weights: (0.4, 0.4, 0.2),
            pressure: TierPressure::default(),
        }
    }
}

impl TanCurvePolicy {
    /// Eviction score (0.0 = evict first, 1.0 = keep)
    pub fn calculate_score(&self, entry: &EvictionCandidate, now_millis: i64, used_percent: f64) -> f64 {
        let recency = (-entry.idle_secs(now_millis) / self.recency_half_life).exp();

        let frequency = if entry.access_count == 0 {
            0.0
        } else {
            let count = entry.access_count.min(self.max_access_count) as f64;
            (1.0 + count).ln() / (1.0 + self.max_access_count as f64).ln()
        };

        let relative_size = entry.size_bytes as f64 / self.baseline_size_bytes.max(1) as f64;
        let size_score = 1.0 / (1.0 + relative_size);

        let base_score = recency * self.weights.0 + frequency * self.weights.1 + size_score * self.weights.2;
        base_score * self.pressure.multiplier(used_percent)
    }

    /// Candidate keys sorted by score, lowest first. Ties break on key so
    /// the order is deterministic.
    pub fn rank(&self, entries: &[EvictionCandidate], now_millis: i64, used_percent: f64) -> Vec<(String, usize)> {
        let mut scored: Vec<_> = entries
            .iter()
            .map(|e| (e, self.calculate_score(e, now_millis, used_percent)))
            .collect();

        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.last_accessed.cmp(&b.0.last_accessed))
                .then_with(|| a.0.key.cmp(&b.0.key))
        });
        scored
            .into_iter()
            .map(|(e, _)| (e.key.clone(), e.size_bytes))
            .collect()
    }

    /// Pick victims, lowest score first, until at least `bytes_to_free`
    /// bytes are released. Returns fewer bytes only if the candidates run out.
    pub fn select_victims(
        &self,
        entries: &[EvictionCandidate],
        bytes_to_free: usize,
        now_millis: i64,
        used_percent: f64,
    ) -> Vec<String> {
        let mut freed = 0usize;
        let mut victims = Vec::new();
        for (key, size) in self.rank(entries, now_millis, used_percent) {
            if freed >= bytes_to_free {
                break;
            }
            freed = freed.saturating_add(size);
            victims.push(key);
        }
        victims
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for hybrid-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `hybrid_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size gauges
//!
//! # Labels
//! - `tier`: frequent, normal, rare
//! - `operation`: get, set, delete, store, clear
//! - `status`: hit, miss, success, error, rejected
//! - `outcome`: completed, retried, failed, conflict

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a cache store operation
pub fn record_cache_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "hybrid_sync_cache_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record entries evicted from a tier to make room for a write
pub fn record_eviction(tier: &str, count: usize) {
    counter!(
        "hybrid_sync_cache_evictions_total",
        "tier" => tier.to_string()
    )
    .increment(count as u64);
}

/// Set live bytes held by a tier
pub fn set_cache_bytes(tier: &str, bytes: usize) {
    gauge!(
        "hybrid_sync_cache_bytes",
        "tier" => tier.to_string()
    )
    .set(bytes as f64);
}

/// Record the outcome of one sync attempt
pub fn record_sync_outcome(outcome: &str) {
    counter!(
        "hybrid_sync_sync_outcomes_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record how many items a batch claimed
pub fn record_sync_batch_size(count: usize) {
    histogram!("hybrid_sync_sync_batch_size").record(count as f64);
}

/// Record remote call latency
pub fn record_remote_latency(duration: Duration) {
    histogram!("hybrid_sync_remote_seconds").record(duration.as_secs_f64());
}

/// Set queue depth per status
pub fn set_queue_depth(status: &str, count: usize) {
    gauge!(
        "hybrid_sync_queue_depth",
        "status" => status.to_string()
    )
    .set(count as f64);
}

/// Record a blob store operation
pub fn record_blob_operation(operation: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(
        "hybrid_sync_blob_operations_total",
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record entries removed by a cleanup sweep
pub fn record_cleanup_removed(component: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(
        "hybrid_sync_cleanup_removed_total",
        "component" => component.to_string()
    )
    .increment(count as u64);
}

/// Track engine state transitions
pub fn set_engine_state(state: &str) {
    counter!(
        "hybrid_sync_engine_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records remote latency on drop
pub struct RemoteTimer {
    start: Instant,
}

impl RemoteTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Drop for RemoteTimer {
    fn drop(&mut self) {
        record_remote_latency(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_cache_operation("frequent", "get", "hit");
        record_eviction("rare", 2);
        set_cache_bytes("normal", 1024);
        record_sync_outcome("completed");
        record_sync_batch_size(10);
        set_queue_depth("pending", 3);
        record_blob_operation("store", true);
        record_cleanup_removed("cache", 0);
        set_engine_state("running");
        drop(RemoteTimer::start());
    }

    #[test]
    fn test_counters_are_labelled() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_cache_operation("frequent", "get", "hit");
            record_cache_operation("frequent", "get", "hit");
            record_sync_outcome("failed");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let hits = snapshot
            .iter()
            .find(|(key, _, _, _)| {
                key.key().name() == "hybrid_sync_cache_operations_total"
                    && key.key().labels().any(|l| l.key() == "status" && l.value() == "hit")
            })
            .map(|(_, _, _, value)| value);
        assert_eq!(hits, Some(&DebugValue::Counter(2)));

        let failed = snapshot
            .iter()
            .any(|(key, _, _, _)| key.key().name() == "hybrid_sync_sync_outcomes_total");
        assert!(failed);
    }
}

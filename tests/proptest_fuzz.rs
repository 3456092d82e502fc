// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests (fuzzing) for hybrid sync.
//!
//! Uses proptest to generate random/malformed inputs and verify the engine
//! never panics, and that ordering, backoff and expiry rules hold for any
//! input.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use serde_json::{json, Value};

use hybrid_sync::eviction::{EvictionCandidate, TanCurvePolicy};
use hybrid_sync::{
    CacheStore, EngineConfig, InMemoryBackend, InMemoryQueueStore, ManualClock, ManualConnectivity, QueueOptions,
    RemoteAck, RemoteApi, RemoteError, RemoteRequest, RetryConfig, StrategyTier, SyncConfig, SyncItem,
    SyncOperation, SyncPriority, SyncQueueEngine,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn priority_strategy() -> impl Strategy<Value = SyncPriority> {
    prop_oneof![
        Just(SyncPriority::High),
        Just(SyncPriority::Medium),
        Just(SyncPriority::Low),
    ]
}

fn tier_strategy() -> impl Strategy<Value = StrategyTier> {
    prop_oneof![
        Just(StrategyTier::Frequent),
        Just(StrategyTier::Normal),
        Just(StrategyTier::Rare),
    ]
}

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        4,  // depth
        64, // max nodes
        10, // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..10)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Remote that acks everything and records the order it saw items in.
#[derive(Default)]
struct RecordingRemote {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl RemoteApi for RecordingRemote {
    async fn apply(&self, request: &RemoteRequest) -> Result<RemoteAck, RemoteError> {
        self.seen.lock().push(request.item_id.clone());
        Ok(RemoteAck::default())
    }
}

// =============================================================================
// Deserialization Fuzz Tests
// =============================================================================

proptest! {
    /// SyncItem deserialization should never panic on arbitrary bytes
    #[test]
    fn fuzz_sync_item_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..10000)) {
        let _ = serde_json::from_slice::<SyncItem>(&bytes);
    }

    /// SyncItem deserialization should handle arbitrary JSON gracefully
    #[test]
    fn fuzz_sync_item_from_arbitrary_json(json in arbitrary_json_strategy()) {
        let serialized = serde_json::to_vec(&json).unwrap();
        let _ = serde_json::from_slice::<SyncItem>(&serialized);
    }

    /// Config records come from disk; garbage must fail cleanly
    #[test]
    fn fuzz_configs_from_arbitrary_json(json in arbitrary_json_strategy()) {
        let _ = serde_json::from_value::<SyncConfig>(json.clone());
        let _ = serde_json::from_value::<EngineConfig>(json);
    }

    /// Corrupted serialized SyncItem should fail gracefully
    #[test]
    fn fuzz_corrupted_sync_item(
        payload in arbitrary_json_strategy(),
        corruption in prop::collection::vec(any::<u8>(), 1..50),
        position in 0usize..10000,
    ) {
        let item = SyncItem::new(1, SyncOperation::Update, "student", payload, SyncPriority::Medium, 5, 0);
        let mut corrupted = serde_json::to_vec(&item).unwrap();
        let pos = position % corrupted.len();
        for (i, b) in corruption.iter().enumerate() {
            let idx = (pos + i) % corrupted.len();
            corrupted[idx] ^= b;
        }
        let _ = serde_json::from_slice::<SyncItem>(&corrupted);
    }
}

// =============================================================================
// SyncItem Invariant Tests
// =============================================================================

proptest! {
    /// Entity keys never panic and always carry the entity type
    #[test]
    fn prop_entity_key_never_panics(entity_type in "[a-z_]{1,20}", payload in arbitrary_json_strategy()) {
        let item = SyncItem::new(7, SyncOperation::Create, entity_type.clone(), payload, SyncPriority::Low, 3, 0);
        let key = item.entity_key();
        let prefix = format!("{}:", entity_type);
        prop_assert!(key.starts_with(&prefix));
    }

    /// A fresh item is pending and eligible right away
    #[test]
    fn prop_new_item_is_eligible(now in 0i64..i64::MAX / 2, max_attempts in 1u32..20) {
        let item = SyncItem::new(1, SyncOperation::Delete, "x", json!({"id": 1}), SyncPriority::High, max_attempts, now);
        prop_assert!(item.is_eligible(now));
        prop_assert!(!item.attempts_exhausted());
    }
}

// =============================================================================
// Backoff Invariant Tests
// =============================================================================

proptest! {
    /// Backoff delays never shrink and never exceed the cap
    #[test]
    fn prop_backoff_monotonic_and_capped(
        initial_ms in 1u64..5_000,
        max_ms in 1u64..600_000,
        factor in 1.0f64..4.0,
        attempts in 1u32..40,
    ) {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            factor,
            max_retries: None,
        };

        let mut previous = Duration::ZERO;
        for attempt in 1..=attempts {
            let delay = config.delay_for_attempt(attempt);
            prop_assert!(delay >= previous, "attempt {} shrank: {:?} < {:?}", attempt, delay, previous);
            prop_assert!(delay <= config.max_delay);
            previous = delay;
        }
    }
}

// =============================================================================
// Eviction Invariant Tests
// =============================================================================

proptest! {
    /// Victims free at least the requested bytes unless candidates run out
    #[test]
    fn prop_select_victims_frees_enough(
        entries in prop::collection::vec((1usize..10_000, 0i64..100_000, 0u64..1_000), 0..50),
        bytes_to_free in 0usize..100_000,
        pressure in 0.0f64..1.5,
    ) {
        let now = 1_000_000_000;
        let candidates: Vec<EvictionCandidate> = entries
            .iter()
            .enumerate()
            .map(|(i, (size, idle, hits))| EvictionCandidate {
                key: format!("k{}", i),
                size_bytes: *size,
                last_accessed: now - idle * 1000,
                access_count: *hits,
            })
            .collect();

        let victims = TanCurvePolicy::default().select_victims(&candidates, bytes_to_free, now, pressure);
        let freed: usize = candidates
            .iter()
            .filter(|c| victims.contains(&c.key))
            .map(|c| c.size_bytes)
            .sum();
        let available: usize = candidates.iter().map(|c| c.size_bytes).sum();

        prop_assert!(freed >= bytes_to_free.min(available));
        prop_assert!(victims.len() <= candidates.len());
    }
}

// =============================================================================
// Cache Expiry Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// An entry reads back until its tier TTL elapses, never after
    #[test]
    fn prop_cache_entry_lives_exactly_its_ttl(tier in tier_strategy(), elapsed_secs in 0u64..200_000) {
        runtime().block_on(async {
            let clock = Arc::new(ManualClock::new(1_000));
            let cache = CacheStore::open(Arc::new(InMemoryBackend::new()), Default::default(), clock.clone())
                .await
                .unwrap();
            cache.set("k", &json!({"v": 1}), tier, &[]).await.unwrap();

            clock.advance(Duration::from_secs(elapsed_secs));
            let ttl_secs = cache.config().policy(tier).ttl_secs;
            let value: Option<Value> = cache.get("k").await;

            if elapsed_secs < ttl_secs {
                prop_assert_eq!(value, Some(json!({"v": 1})));
            } else {
                prop_assert_eq!(value, None);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}

// =============================================================================
// Queue Ordering Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// One batch sends independent items by priority, FIFO within a priority
    #[test]
    fn prop_batch_order_is_priority_then_fifo(priorities in prop::collection::vec(priority_strategy(), 1..30)) {
        runtime().block_on(async {
            let remote = Arc::new(RecordingRemote::default());
            let queue = SyncQueueEngine::open(
                Arc::new(InMemoryQueueStore::new()),
                remote.clone(),
                Arc::new(ManualConnectivity::online()),
                Arc::new(ManualClock::new(0)),
                QueueOptions::default(),
                SyncConfig { batch_size: 100, ..SyncConfig::default() },
            )
            .await
            .unwrap();

            let mut enqueued = Vec::new();
            for (i, priority) in priorities.iter().enumerate() {
                let item = queue
                    .add_to_sync_queue(SyncOperation::Create, "student", json!({"id": i}), *priority)
                    .await
                    .unwrap();
                enqueued.push((item.priority, item.seq, item.id));
            }
            enqueued.sort();
            let expected: Vec<String> = enqueued.into_iter().map(|(_, _, id)| id).collect();

            let result = queue.process_batch().await;
            prop_assert_eq!(result.succeeded, priorities.len());
            prop_assert_eq!(remote.seen.lock().clone(), expected);
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// Items for the same entity never share a batch
    #[test]
    fn prop_same_entity_is_serialized(count in 2usize..10, batch_size in 1usize..20) {
        runtime().block_on(async {
            let remote = Arc::new(RecordingRemote::default());
            let queue = SyncQueueEngine::open(
                Arc::new(InMemoryQueueStore::new()),
                remote.clone(),
                Arc::new(ManualConnectivity::online()),
                Arc::new(ManualClock::new(0)),
                QueueOptions::default(),
                SyncConfig { batch_size, ..SyncConfig::default() },
            )
            .await
            .unwrap();

            for n in 0..count {
                queue
                    .add_to_sync_queue(SyncOperation::Update, "student", json!({"id": 1, "n": n}), SyncPriority::Medium)
                    .await
                    .unwrap();
            }

            for _ in 0..count {
                let result = queue.process_batch().await;
                prop_assert_eq!(result.claimed, 1);
            }
            prop_assert_eq!(queue.get_sync_stats().completed_items, count);
            Ok::<(), TestCaseError>(())
        })?;
    }
}

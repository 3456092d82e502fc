// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic hybrid-sync usage example.
//!
//! Demonstrates:
//! 1. Opening an engine over a SQLite file and a blob directory
//! 2. Saving records offline under different storage strategies
//! 3. Reading them back through the tiered cache
//! 4. Coming back online and draining the sync queue
//! 5. Displaying stats and metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::{json, Value};

use hybrid_sync::{
    BlobPayload, EngineConfig, HybridEngine, ManualConnectivity, RemoteAck, RemoteApi, RemoteError, RemoteRequest,
    StorageStrategy,
};

/// Stand-in for a real backend: acknowledges every change.
struct PrintingRemote;

#[async_trait]
impl RemoteApi for PrintingRemote {
    async fn apply(&self, request: &RemoteRequest) -> Result<RemoteAck, RemoteError> {
        println!(
            "   └─ remote ← {} {} (attempt {})",
            request.operation, request.entity_type, request.attempt
        );
        Ok(RemoteAck::default())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           hybrid-sync: Basic Usage Example                    ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and open the engine (starts offline)
    // ─────────────────────────────────────────────────────────────────────────
    let dir = tempfile::tempdir()?;
    let config = EngineConfig {
        db_path: Some(dir.path().join("hybrid.db").to_string_lossy().into_owned()),
        blob_dir: Some(dir.path().join("blobs").to_string_lossy().into_owned()),
        ..Default::default()
    };

    let connectivity = Arc::new(ManualConnectivity::offline());
    let engine = HybridEngine::open(config, Arc::new(PrintingRemote), connectivity.clone()).await?;
    engine.start().await?;
    println!("📦 Engine state: {}", engine.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Save records while offline
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Saving records (offline)...");
    let records = vec![
        ("student", "alice", json!({"name": "Alice", "grade": 5}), StorageStrategy::Critical),
        ("student", "bob", json!({"name": "Bob", "grade": 4}), StorageStrategy::Critical),
        ("lesson", "fractions", json!({"title": "Fractions"}), StorageStrategy::Important),
        ("note", "n1", json!({"body": "Bring a ruler"}), StorageStrategy::Secondary),
    ];

    for (entity_type, id, data, strategy) in &records {
        let saved = engine.save(entity_type, id, data.clone(), *strategy, None).await?;
        println!(
            "   └─ {}:{} [{}] queued as {} ({})",
            entity_type, id, strategy, saved.sync_item.operation, saved.sync_item.priority.as_str()
        );
    }

    let avatar = BlobPayload::new(b"\x89PNG fake avatar bytes".to_vec(), "image/png");
    engine
        .save("avatar", "alice", json!({"owner": "alice"}), StorageStrategy::HeavyFiles, Some(avatar))
        .await?;
    println!("   └─ avatar:alice stored with attachment");

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Read back through the cache
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Reading records back...");
    for (entity_type, id, _, _) in &records {
        let start = std::time::Instant::now();
        let value: Option<Value> = engine.load(entity_type, id).await;
        println!("   └─ {}:{} → {:?} ({:?})", entity_type, id, value, start.elapsed());
    }

    let stats = engine.queue().get_sync_stats();
    println!("\n⏳ Offline queue: {} pending", stats.pending_items);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Come back online; auto-sync drains the queue
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🌐 Going online...");
    connectivity.set_online(true);
    for _ in 0..50 {
        if engine.queue().get_sync_stats().pending_items == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    // Anything the loop has not reached yet
    let result = engine.queue().force_sync().await;
    println!("   └─ Forced batch: {:?}", result);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Stats and metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Engine Health:");
    let health = engine.health();
    println!("{}", serde_json::to_string_pretty(&health)?);

    let storage = engine.orchestrator().get_storage_stats().await;
    println!("\n🗄️  Storage: {} items, {} with blobs", storage.item_count, storage.items_with_blobs);
    for (strategy, count) in &storage.items_by_strategy {
        println!("   └─ {}: {}", strategy, count);
    }

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    engine.shutdown().await;
    println!("   ✅ Shutdown complete! State: {}", engine.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics, grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_kind, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, label_str, count, sum));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms (distributions)");
        for (name, labels, count, sum) in &histograms {
            let avg = if *count > 0 { sum / *count as f64 } else { 0.0 };
            println!("   │  └─ {}{} count={} avg={:.4}", name, labels, count, avg);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}

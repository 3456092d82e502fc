// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: start, maintenance loop, shutdown.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::metrics;
use crate::orchestrator::StorageOrchestrator;
use crate::queue::AutoSyncHandle;
use crate::storage::StorageError;

use super::{EngineState, HybridEngine, MaintenanceReport};

/// Handles for everything `start()` spawned.
pub(crate) struct BackgroundTasks {
    maintenance_shutdown: watch::Sender<bool>,
    maintenance: JoinHandle<()>,
    auto_sync: AutoSyncHandle,
}

impl HybridEngine {
    fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        metrics::set_engine_state(state.as_str());
    }

    /// Spawn the maintenance loop and the auto-sync loop.
    ///
    /// Auto-sync always runs; each trigger checks `auto_sync` and
    /// connectivity, so enabling it later through `update_config` takes
    /// effect without a restart. Calling `start` on a running engine is a
    /// no-op; a stopped engine cannot be restarted.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), StorageError> {
        // Held until the tasks are recorded; nothing below awaits
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            warn!("Engine already running");
            return Ok(());
        }
        let state = self.state();
        if state != EngineState::Created {
            return Err(StorageError::Validation(format!("cannot start engine in state {}", state)));
        }

        let (maintenance_shutdown, shutdown_rx) = watch::channel(false);
        let maintenance = tokio::spawn(maintenance_loop(
            self.cache.clone(),
            self.orchestrator.clone(),
            self.config.cleanup_interval(),
            shutdown_rx,
        ));
        let auto_sync = self.queue.start_auto_sync();

        *tasks = Some(BackgroundTasks {
            maintenance_shutdown,
            maintenance,
            auto_sync,
        });
        self.set_state(EngineState::Running);
        drop(tasks);

        info!(
            cleanup_interval_secs = self.config.cleanup_interval_secs,
            auto_sync = self.queue.get_config().auto_sync,
            "Hybrid engine running"
        );
        Ok(())
    }

    /// One maintenance pass: orchestrator age cleanup, then cache expiry.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        run_maintenance_pass(&self.cache, &self.orchestrator).await
    }

    /// Stop background loops and wait for them. Queued items stay durable;
    /// a batch already in flight finishes first.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let tasks = self.tasks.lock().take();
        let Some(tasks) = tasks else {
            if self.state() == EngineState::Created {
                self.set_state(EngineState::Stopped);
            }
            return;
        };

        info!("Initiating engine shutdown...");
        self.set_state(EngineState::ShuttingDown);

        let _ = tasks.maintenance_shutdown.send(true);
        if let Err(e) = tasks.maintenance.await {
            warn!(error = %e, "Maintenance task ended abnormally");
        }
        tasks.auto_sync.shutdown().await;

        self.set_state(EngineState::Stopped);
        info!("Engine shutdown complete");
    }
}

async fn run_maintenance_pass(cache: &CacheStore, orchestrator: &StorageOrchestrator) -> MaintenanceReport {
    let storage = orchestrator.cleanup().await;
    let cache_entries_expired = cache.cleanup().await;
    debug!(
        items_removed = storage.items_removed,
        cache_entries_expired,
        failures = storage.failures,
        "Maintenance pass complete"
    );
    MaintenanceReport {
        cache_entries_expired,
        storage,
    }
}

async fn maintenance_loop(
    cache: Arc<CacheStore>,
    orchestrator: Arc<StorageOrchestrator>,
    period: std::time::Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_maintenance_pass(&cache, &orchestrator).await;
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    debug!("Maintenance loop stopped");
}

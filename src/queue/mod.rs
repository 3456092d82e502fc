// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offline-first sync queue.
//!
//! Local mutations are appended with [`SyncQueueEngine::add_to_sync_queue`]
//! and persisted before the call returns. [`SyncQueueEngine::process_batch`]
//! claims eligible items, applies them against the [`RemoteApi`] and turns
//! every outcome into queue state. Nothing inside the processing path raises
//! to the caller; failures surface through [`SyncQueueEngine::get_sync_stats`]
//! and [`SyncQueueEngine::get_sync_queue`].
//!
//! # Selection
//!
//! An item is eligible when it is `Pending` and its `retry_after` has
//! passed. Eligible items are attempted by `(priority, seq)`, at most
//! `batch_size` per batch. An item waits while an earlier item of the same
//! entity is still `Pending` or `InProgress`, so one entity's mutations
//! reach the remote in the order they were made.
//!
//! # Claiming
//!
//! Selected items flip to `InProgress` under the queue lock before any
//! remote call, so overlapping batches (timer tick vs. `force_sync`) never
//! attempt the same item twice.

mod conflict;
pub mod store;

pub use conflict::ConflictResolution;
pub use store::{InMemoryQueueStore, QueueStore, SqlQueueStore};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::{duration_millis, Clock};
use crate::config::{EngineConfig, SyncConfig};
use crate::metrics;
use crate::remote::{ConnectivityProbe, RemoteAck, RemoteApi, RemoteError, RemoteRequest};
use crate::resilience::retry::RetryConfig;
use crate::storage::StorageError;
use crate::sync_item::{SyncItem, SyncOperation, SyncPriority, SyncStatus};
use conflict::{resolve, Resolution};

/// Engine-level knobs that are fixed for the lifetime of the queue.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Delay schedule for transient failures
    pub backoff: RetryConfig,
    /// Upper bound for one remote call
    pub remote_timeout: Duration,
    /// Completed items kept for introspection
    pub archive_retention: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            backoff: RetryConfig::sync_backoff(),
            remote_timeout: Duration::from_secs(10),
            archive_retention: 1_000,
        }
    }
}

impl QueueOptions {
    pub fn from_engine_config(config: &EngineConfig) -> Self {
        Self {
            backoff: config.backoff(),
            remote_timeout: config.remote_timeout(),
            archive_retention: config.archive_retention,
        }
    }
}

/// Outcome counts for one [`SyncQueueEngine::process_batch`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub claimed: usize,
    pub succeeded: usize,
    /// Back to `Pending` (transient failure or conflict re-queue)
    pub retried: usize,
    pub failed: usize,
    pub conflicts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Active items plus completions since the last clear
    pub total_items: usize,
    pub pending_items: usize,
    pub in_progress_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    /// Epoch millis of the last finished batch that claimed anything
    pub last_sync: Option<i64>,
    pub conflicts: u64,
    pub errors: u64,
}

struct QueueState {
    items: BTreeMap<u64, SyncItem>,
    next_seq: u64,
}

#[derive(Default)]
struct SyncCounters {
    completed: AtomicU64,
    conflicts: AtomicU64,
    errors: AtomicU64,
}

/// What happened to one attempted item, after conflict resolution.
enum Transition {
    Completed,
    Retry { conflict: bool },
    Failed { conflict: bool },
    /// Resolved conflict with the local change discarded
    Superseded,
}

pub struct SyncQueueEngine {
    store: Arc<dyn QueueStore>,
    remote: Arc<dyn RemoteApi>,
    connectivity: Arc<dyn ConnectivityProbe>,
    clock: Arc<dyn Clock>,
    options: QueueOptions,
    state: Mutex<QueueState>,
    archive: Mutex<VecDeque<SyncItem>>,
    config_tx: watch::Sender<SyncConfig>,
    counters: SyncCounters,
    last_sync: Mutex<Option<i64>>,
}

impl SyncQueueEngine {
    /// Load the durable queue. Items left `InProgress` by an interrupted run
    /// go back to `Pending`. `initial_config` is persisted when no sync
    /// config record exists yet.
    pub async fn open(
        store: Arc<dyn QueueStore>,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<dyn ConnectivityProbe>,
        clock: Arc<dyn Clock>,
        options: QueueOptions,
        initial_config: SyncConfig,
    ) -> Result<Self, StorageError> {
        let config = match store.load_config().await? {
            Some(config) => config,
            None => {
                store.save_config(&initial_config).await?;
                initial_config
            }
        };

        let mut items = BTreeMap::new();
        let mut recovered = 0usize;
        for mut item in store.load_active().await? {
            if item.status == SyncStatus::InProgress {
                item.status = SyncStatus::Pending;
                store.upsert(&item).await?;
                recovered += 1;
            }
            items.insert(item.seq, item);
        }

        let archived = store.load_archive().await?;
        let next_seq = items
            .keys()
            .copied()
            .chain(archived.iter().map(|i| i.seq))
            .max()
            .map_or(1, |max| max + 1);

        info!(
            active = items.len(),
            archived = archived.len(),
            recovered,
            "Sync queue loaded"
        );

        let counters = SyncCounters::default();
        counters.completed.store(archived.len() as u64, Ordering::Relaxed);
        let (config_tx, _) = watch::channel(config);

        let engine = Self {
            store,
            remote,
            connectivity,
            clock,
            options,
            state: Mutex::new(QueueState { items, next_seq }),
            archive: Mutex::new(archived.into()),
            config_tx,
            counters,
            last_sync: Mutex::new(None),
        };
        engine.publish_depth();
        Ok(engine)
    }

    /// Append a `Pending` mutation. The item is durable once this returns.
    #[tracing::instrument(skip(self, payload))]
    pub async fn add_to_sync_queue(
        &self,
        operation: SyncOperation,
        entity_type: &str,
        payload: Value,
        priority: SyncPriority,
    ) -> Result<SyncItem, StorageError> {
        if entity_type.trim().is_empty() {
            return Err(StorageError::Validation("entity type must not be empty".into()));
        }

        let max_attempts = self.config_tx.borrow().max_retries;
        let now = self.clock.now_millis();
        let seq = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            seq
        };

        let item = SyncItem::new(seq, operation, entity_type, payload, priority, max_attempts, now);
        self.store.upsert(&item).await?;
        self.state.lock().items.insert(seq, item.clone());

        debug!(id = %item.id, seq, operation = %operation, priority = priority.as_str(), "Queued sync item");
        self.publish_depth();
        Ok(item)
    }

    /// Claim and attempt up to `batch_size` eligible items.
    #[tracing::instrument(skip(self))]
    pub async fn process_batch(&self) -> BatchResult {
        let config = self.config_tx.borrow().clone();
        let claimed = self.claim(config.batch_size.max(1));
        let mut result = BatchResult {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return result;
        }

        metrics::record_sync_batch_size(claimed.len());
        for item in &claimed {
            self.persist(item).await;
        }

        for item in claimed {
            let outcome = self.attempt(&item).await;
            self.settle(item, outcome, &config, &mut result).await;
        }

        *self.last_sync.lock() = Some(self.clock.now_millis());
        self.publish_depth();
        info!(
            claimed = result.claimed,
            succeeded = result.succeeded,
            retried = result.retried,
            failed = result.failed,
            conflicts = result.conflicts,
            "Sync batch finished"
        );
        result
    }

    /// Run one batch now, online or not.
    pub async fn force_sync(&self) -> BatchResult {
        info!("Forced sync requested");
        self.process_batch().await
    }

    /// Flip eligible items to `InProgress` and return them in attempt order.
    fn claim(&self, batch_size: usize) -> Vec<SyncItem> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        let mut busy_entities: HashSet<String> = HashSet::new();
        let mut candidates: Vec<(SyncPriority, u64)> = Vec::new();
        for item in state.items.values() {
            if !matches!(item.status, SyncStatus::Pending | SyncStatus::InProgress) {
                continue;
            }
            let entity = item.entity_key();
            if !busy_entities.contains(&entity) && item.is_eligible(now) {
                candidates.push((item.priority, item.seq));
            }
            busy_entities.insert(entity);
        }

        candidates.sort();
        candidates.truncate(batch_size);

        candidates
            .into_iter()
            .filter_map(|(_, seq)| {
                let item = state.items.get_mut(&seq)?;
                item.status = SyncStatus::InProgress;
                item.updated_at = now;
                Some(item.clone())
            })
            .collect()
    }

    async fn attempt(&self, item: &SyncItem) -> Result<RemoteAck, RemoteError> {
        let request = RemoteRequest::from_item(item);
        let _timer = metrics::RemoteTimer::start();
        match tokio::time::timeout(self.options.remote_timeout, self.remote.apply(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RemoteError::Transient(format!(
                "remote call timed out after {:?}",
                self.options.remote_timeout
            ))),
        }
    }

    async fn settle(
        &self,
        mut item: SyncItem,
        outcome: Result<RemoteAck, RemoteError>,
        config: &SyncConfig,
        result: &mut BatchResult,
    ) {
        let now = self.clock.now_millis();
        item.attempts += 1;
        item.updated_at = now;

        let transition = match outcome {
            Ok(_) => {
                item.last_error = None;
                Transition::Completed
            }
            Err(RemoteError::Transient(msg)) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                item.last_error = Some(msg);
                if item.attempts_exhausted() {
                    Transition::Failed { conflict: false }
                } else {
                    Transition::Retry { conflict: false }
                }
            }
            Err(RemoteError::Validation(msg)) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                item.last_error = Some(format!("rejected by remote: {}", msg));
                Transition::Failed { conflict: false }
            }
            Err(RemoteError::Conflict {
                remote_payload,
                remote_updated_at,
            }) => {
                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                match resolve(config.conflict_resolution, &item, &remote_payload, remote_updated_at) {
                    Resolution::DiscardLocal => {
                        item.last_error = Some(format!(
                            "conflict: remote version from {} kept, local change discarded",
                            remote_updated_at
                        ));
                        Transition::Superseded
                    }
                    Resolution::Requeue(payload) => {
                        item.payload = payload;
                        item.force = true;
                        item.last_error = Some(format!(
                            "conflict with remote version from {}, retrying with local change",
                            remote_updated_at
                        ));
                        if item.attempts_exhausted() {
                            Transition::Failed { conflict: true }
                        } else {
                            Transition::Retry { conflict: true }
                        }
                    }
                    Resolution::Manual => {
                        item.last_error = Some(format!(
                            "conflict with remote version from {} requires manual resolution",
                            remote_updated_at
                        ));
                        Transition::Failed { conflict: true }
                    }
                }
            }
        };

        match transition {
            Transition::Completed | Transition::Superseded => {
                let superseded = matches!(transition, Transition::Superseded);
                item.status = SyncStatus::Completed;
                item.retry_after = None;
                item.completed_at = Some(now);
                if superseded {
                    result.conflicts += 1;
                    metrics::record_sync_outcome("conflict");
                } else {
                    metrics::record_sync_outcome("completed");
                }
                result.succeeded += 1;
                debug!(id = %item.id, attempts = item.attempts, superseded, "Sync item completed");
                self.complete(item).await;
            }
            Transition::Retry { conflict } => {
                item.status = SyncStatus::Pending;
                item.retry_after = if conflict {
                    None
                } else {
                    Some(now + duration_millis(self.options.backoff.delay_for_attempt(item.attempts)))
                };
                if conflict {
                    result.conflicts += 1;
                    metrics::record_sync_outcome("conflict");
                } else {
                    metrics::record_sync_outcome("retried");
                }
                result.retried += 1;
                debug!(
                    id = %item.id,
                    attempts = item.attempts,
                    retry_after = ?item.retry_after,
                    error = item.last_error.as_deref().unwrap_or(""),
                    "Sync item re-queued"
                );
                self.replace(item).await;
            }
            Transition::Failed { conflict } => {
                item.status = SyncStatus::Failed;
                item.retry_after = None;
                if conflict {
                    result.conflicts += 1;
                }
                result.failed += 1;
                metrics::record_sync_outcome("failed");
                warn!(
                    id = %item.id,
                    attempts = item.attempts,
                    error = item.last_error.as_deref().unwrap_or(""),
                    "Sync item failed"
                );
                self.replace(item).await;
            }
        }
    }

    /// Write back a non-terminal or failed item. An item removed while its
    /// attempt was in flight (clear/discard) stays removed.
    async fn replace(&self, item: SyncItem) {
        {
            let mut state = self.state.lock();
            match state.items.get_mut(&item.seq) {
                Some(slot) => *slot = item.clone(),
                None => return,
            }
        }
        self.persist(&item).await;
    }

    async fn complete(&self, item: SyncItem) {
        if self.state.lock().items.remove(&item.seq).is_none() {
            return;
        }
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        {
            let mut archive = self.archive.lock();
            archive.push_back(item.clone());
            while archive.len() > self.options.archive_retention {
                archive.pop_front();
            }
        }
        if let Err(e) = self.store.archive(&item, self.options.archive_retention).await {
            warn!(id = %item.id, error = %e, "Failed to archive completed sync item");
        }
    }

    /// Mirror an item to the store. If it left the queue while the write
    /// was in flight, the stored row is dropped again.
    async fn persist(&self, item: &SyncItem) {
        if let Err(e) = self.store.upsert(item).await {
            warn!(id = %item.id, status = %item.status, error = %e, "Failed to persist sync item");
            return;
        }
        if self.state.lock().items.contains_key(&item.seq) {
            return;
        }
        debug!(id = %item.id, "Sync item removed during write, dropping stored row");
        if let Err(e) = self.store.remove(&item.id).await {
            warn!(id = %item.id, error = %e, "Failed to drop stored row of removed sync item");
        }
    }

    fn publish_depth(&self) {
        let (mut pending, mut in_progress, mut failed) = (0, 0, 0);
        for item in self.state.lock().items.values() {
            match item.status {
                SyncStatus::Pending => pending += 1,
                SyncStatus::InProgress => in_progress += 1,
                SyncStatus::Failed => failed += 1,
                SyncStatus::Completed => {}
            }
        }
        metrics::set_queue_depth("pending", pending);
        metrics::set_queue_depth("in_progress", in_progress);
        metrics::set_queue_depth("failed", failed);
    }

    pub fn get_sync_stats(&self) -> SyncStats {
        let completed = self.counters.completed.load(Ordering::Relaxed) as usize;
        let state = self.state.lock();
        let count = |status: SyncStatus| state.items.values().filter(|i| i.status == status).count();

        SyncStats {
            total_items: state.items.len() + completed,
            pending_items: count(SyncStatus::Pending),
            in_progress_items: count(SyncStatus::InProgress),
            completed_items: completed,
            failed_items: count(SyncStatus::Failed),
            last_sync: *self.last_sync.lock(),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Active items in selection order.
    pub fn get_sync_queue(&self) -> Vec<SyncItem> {
        let mut items: Vec<SyncItem> = self.state.lock().items.values().cloned().collect();
        items.sort_by_key(|i| (i.priority, i.seq));
        items
    }

    /// Recently completed items, oldest first.
    pub fn get_archived(&self) -> Vec<SyncItem> {
        self.archive.lock().iter().cloned().collect()
    }

    /// Look up an item in the active queue, then the archive.
    pub fn get_item(&self, id: &str) -> Option<SyncItem> {
        let active = self.state.lock().items.values().find(|i| i.id == id).cloned();
        active.or_else(|| self.archive.lock().iter().find(|i| i.id == id).cloned())
    }

    /// Drop every active and archived item without contacting the remote.
    /// Returns how many active items were removed.
    #[tracing::instrument(skip(self))]
    pub async fn clear_sync_queue(&self) -> Result<usize, StorageError> {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.items.len();
            state.items.clear();
            removed
        };
        self.archive.lock().clear();
        self.counters.completed.store(0, Ordering::Relaxed);
        self.publish_depth();

        self.store.clear().await?;
        info!(removed, "Sync queue cleared");
        Ok(removed)
    }

    /// Persist and broadcast a new sync config.
    pub async fn update_config(&self, config: SyncConfig) -> Result<(), StorageError> {
        if config.batch_size == 0 {
            return Err(StorageError::Validation("batch_size must be at least 1".into()));
        }
        if config.max_retries == 0 {
            return Err(StorageError::Validation("max_retries must be at least 1".into()));
        }
        if config.sync_interval_ms == 0 {
            return Err(StorageError::Validation("sync_interval_ms must be at least 1".into()));
        }

        self.store.save_config(&config).await?;
        info!(
            auto_sync = config.auto_sync,
            interval_ms = config.sync_interval_ms,
            batch_size = config.batch_size,
            "Sync config updated"
        );
        self.config_tx.send_replace(config);
        Ok(())
    }

    pub fn get_config(&self) -> SyncConfig {
        self.config_tx.borrow().clone()
    }

    pub fn is_online_status(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Give a failed item a fresh set of attempts.
    pub async fn retry_failed(&self, id: &str) -> Result<bool, StorageError> {
        let max_attempts = self.config_tx.borrow().max_retries.max(1);
        let now = self.clock.now_millis();
        let item = {
            let mut state = self.state.lock();
            let Some(item) = state
                .items
                .values_mut()
                .find(|i| i.id == id && i.status == SyncStatus::Failed)
            else {
                return Ok(false);
            };
            item.status = SyncStatus::Pending;
            item.attempts = 0;
            item.max_attempts = max_attempts;
            item.retry_after = None;
            item.updated_at = now;
            item.clone()
        };

        self.store.upsert(&item).await?;
        info!(id = %item.id, "Failed sync item re-queued");
        self.publish_depth();
        Ok(true)
    }

    /// Remove a pending or failed item. Items mid-attempt are left alone.
    pub async fn discard(&self, id: &str) -> Result<bool, StorageError> {
        let removed = {
            let mut state = self.state.lock();
            let seq = state
                .items
                .values()
                .find(|i| i.id == id && i.status != SyncStatus::InProgress)
                .map(|i| i.seq);
            seq.and_then(|seq| state.items.remove(&seq))
        };

        match removed {
            Some(item) => {
                self.store.remove(&item.id).await?;
                info!(id = %item.id, status = %item.status, "Sync item discarded");
                self.publish_depth();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn should_auto_sync(&self) -> bool {
        self.config_tx.borrow().auto_sync && self.connectivity.is_online()
    }

    /// Spawn the background trigger loop: interval ticks and offline→online
    /// transitions run a batch while online with `auto_sync` on. A config
    /// change restarts the interval.
    pub fn start_auto_sync(self: &Arc<Self>) -> AutoSyncHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let engine = Arc::clone(self);
        let mut config_rx = self.config_tx.subscribe();
        let mut online_rx = self.connectivity.subscribe();
        let initial = config_rx.borrow_and_update().clone();
        let mut was_online = *online_rx.borrow_and_update();

        let task = tokio::spawn(async move {
            let mut interval = sync_interval(&initial);
            let mut watch_open = true;
            info!("Auto-sync started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if engine.should_auto_sync() {
                            engine.process_batch().await;
                        }
                    }
                    changed = online_rx.changed(), if watch_open => {
                        if changed.is_err() {
                            warn!("Connectivity feed closed, relying on the interval");
                            watch_open = false;
                            continue;
                        }
                        let online = *online_rx.borrow_and_update();
                        if online && !was_online {
                            info!("Connectivity regained");
                            if engine.should_auto_sync() {
                                engine.process_batch().await;
                            }
                        }
                        was_online = online;
                    }
                    changed = config_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        interval = sync_interval(&config_rx.borrow_and_update());
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("Auto-sync stopped");
        });

        AutoSyncHandle { shutdown_tx, task }
    }
}

/// Interval whose first tick is one full period away.
fn sync_interval(config: &SyncConfig) -> tokio::time::Interval {
    let period = config.sync_interval();
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Running auto-sync task. Dropping the handle also stops the task.
pub struct AutoSyncHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AutoSyncHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop and wait for an in-flight batch to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Auto-sync task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::remote::ManualConnectivity;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::Notify;

    /// Remote that answers from a script, then acks forever.
    #[derive(Default)]
    struct ScriptedRemote {
        script: Mutex<VecDeque<Result<RemoteAck, RemoteError>>>,
        seen: Mutex<Vec<RemoteRequest>>,
    }

    impl ScriptedRemote {
        fn with(outcomes: Vec<Result<RemoteAck, RemoteError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(outcomes.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen_ids(&self) -> Vec<Value> {
            self.seen.lock().iter().map(|r| r.payload["id"].clone()).collect()
        }
    }

    #[async_trait]
    impl RemoteApi for ScriptedRemote {
        async fn apply(&self, request: &RemoteRequest) -> Result<RemoteAck, RemoteError> {
            self.seen.lock().push(request.clone());
            self.script.lock().pop_front().unwrap_or(Ok(RemoteAck::default()))
        }
    }

    struct AlwaysTransient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteApi for AlwaysTransient {
        async fn apply(&self, _request: &RemoteRequest) -> Result<RemoteAck, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Transient("503".into()))
        }
    }

    struct Hanging;

    #[async_trait]
    impl RemoteApi for Hanging {
        async fn apply(&self, _request: &RemoteRequest) -> Result<RemoteAck, RemoteError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(RemoteAck::default())
        }
    }

    struct Harness {
        engine: Arc<SyncQueueEngine>,
        clock: Arc<ManualClock>,
        connectivity: Arc<ManualConnectivity>,
        store: Arc<InMemoryQueueStore>,
    }

    fn test_options() -> QueueOptions {
        QueueOptions {
            backoff: RetryConfig {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(8),
                factor: 2.0,
                max_retries: None,
            },
            remote_timeout: Duration::from_millis(50),
            archive_retention: 10,
        }
    }

    async fn harness(remote: Arc<dyn RemoteApi>, config: SyncConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let connectivity = Arc::new(ManualConnectivity::online());
        let store = Arc::new(InMemoryQueueStore::new());
        let engine = SyncQueueEngine::open(
            store.clone(),
            remote,
            connectivity.clone(),
            clock.clone(),
            test_options(),
            config,
        )
        .await
        .unwrap();
        Harness {
            engine: Arc::new(engine),
            clock,
            connectivity,
            store,
        }
    }

    async fn enqueue(engine: &SyncQueueEngine, id: i64, priority: SyncPriority) -> SyncItem {
        engine
            .add_to_sync_queue(SyncOperation::Create, "student", json!({"id": id}), priority)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_is_pending_and_persisted() {
        let h = harness(ScriptedRemote::with(vec![]), SyncConfig::default()).await;
        let item = enqueue(&h.engine, 1, SyncPriority::High).await;

        assert_eq!(item.status, SyncStatus::Pending);
        assert_eq!(item.attempts, 0);
        assert_eq!(h.engine.get_sync_queue().len(), 1);
        assert_eq!(h.store.load_active().await.unwrap(), vec![item]);
    }

    #[tokio::test]
    async fn test_empty_entity_type_rejected() {
        let h = harness(ScriptedRemote::with(vec![]), SyncConfig::default()).await;
        let err = h
            .engine
            .add_to_sync_queue(SyncOperation::Create, " ", json!({}), SyncPriority::Low)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[tokio::test]
    async fn test_ack_completes_and_archives() {
        let h = harness(ScriptedRemote::with(vec![]), SyncConfig::default()).await;
        let item = enqueue(&h.engine, 1, SyncPriority::High).await;

        let result = h.engine.force_sync().await;
        assert_eq!(result.claimed, 1);
        assert_eq!(result.succeeded, 1);

        let stats = h.engine.get_sync_stats();
        assert_eq!(stats.completed_items, 1);
        assert_eq!(stats.pending_items, 0);
        assert_eq!(stats.last_sync, Some(1_000_000));
        assert!(h.engine.get_sync_queue().is_empty());

        let archived = h.engine.get_item(&item.id).unwrap();
        assert_eq!(archived.status, SyncStatus::Completed);
        assert_eq!(archived.attempts, 1);
        assert_eq!(h.store.load_archive().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_exactly_at_max() {
        let remote = Arc::new(AlwaysTransient { calls: AtomicUsize::new(0) });
        let config = SyncConfig {
            max_retries: 3,
            ..Default::default()
        };
        let h = harness(remote.clone(), config).await;
        let item = enqueue(&h.engine, 1, SyncPriority::Medium).await;

        for expected in 1..=3u32 {
            let result = h.engine.force_sync().await;
            assert_eq!(result.claimed, 1);
            let current = h.engine.get_item(&item.id).unwrap();
            assert_eq!(current.attempts, expected);
            if expected < 3 {
                assert_eq!(current.status, SyncStatus::Pending);
                // Not eligible until the backoff passes
                assert_eq!(h.engine.force_sync().await.claimed, 0);
                h.clock.advance(Duration::from_secs(60));
            } else {
                assert_eq!(current.status, SyncStatus::Failed);
                assert_eq!(current.last_error.as_deref(), Some("503"));
            }
        }

        h.clock.advance(Duration::from_secs(600));
        assert_eq!(h.engine.force_sync().await.claimed, 0);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.engine.get_sync_stats().failed_items, 1);
        assert_eq!(h.engine.get_sync_stats().errors, 3);
    }

    #[tokio::test]
    async fn test_backoff_sets_retry_after() {
        let remote = Arc::new(AlwaysTransient { calls: AtomicUsize::new(0) });
        let h = harness(remote, SyncConfig::default()).await;
        let item = enqueue(&h.engine, 1, SyncPriority::Medium).await;

        h.engine.force_sync().await;
        assert_eq!(h.engine.get_item(&item.id).unwrap().retry_after, Some(1_001_000));

        h.clock.advance(Duration::from_secs(1));
        h.engine.force_sync().await;
        assert_eq!(h.engine.get_item(&item.id).unwrap().retry_after, Some(1_001_000 + 2_000));
    }

    #[tokio::test]
    async fn test_validation_fails_immediately() {
        let remote = ScriptedRemote::with(vec![Err(RemoteError::Validation("bad grade".into()))]);
        let h = harness(remote, SyncConfig::default()).await;
        let item = enqueue(&h.engine, 1, SyncPriority::High).await;

        let result = h.engine.force_sync().await;
        assert_eq!(result.failed, 1);
        let failed = h.engine.get_item(&item.id).unwrap();
        assert_eq!(failed.status, SyncStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert!(failed.last_error.unwrap().contains("bad grade"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let h = harness(Arc::new(Hanging), SyncConfig::default()).await;
        let item = enqueue(&h.engine, 1, SyncPriority::High).await;

        let result = h.engine.force_sync().await;
        assert_eq!(result.retried, 1);
        let current = h.engine.get_item(&item.id).unwrap();
        assert_eq!(current.status, SyncStatus::Pending);
        assert_eq!(current.attempts, 1);
        assert!(current.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let remote = ScriptedRemote::with(vec![]);
        let h = harness(remote.clone(), SyncConfig::default()).await;
        enqueue(&h.engine, 1, SyncPriority::Low).await;
        enqueue(&h.engine, 2, SyncPriority::High).await;
        enqueue(&h.engine, 3, SyncPriority::Medium).await;
        enqueue(&h.engine, 4, SyncPriority::High).await;

        let ids: Vec<Value> = h.engine.get_sync_queue().iter().map(|i| i.payload["id"].clone()).collect();
        assert_eq!(ids, vec![json!(2), json!(4), json!(3), json!(1)]);

        h.engine.force_sync().await;
        assert_eq!(remote.seen_ids(), vec![json!(2), json!(4), json!(3), json!(1)]);
    }

    #[tokio::test]
    async fn test_batch_size_limits_claim() {
        let config = SyncConfig {
            batch_size: 2,
            ..Default::default()
        };
        let h = harness(ScriptedRemote::with(vec![]), config).await;
        for id in 0..5 {
            enqueue(&h.engine, id, SyncPriority::Medium).await;
        }

        assert_eq!(h.engine.force_sync().await.claimed, 2);
        assert_eq!(h.engine.get_sync_stats().pending_items, 3);
    }

    #[tokio::test]
    async fn test_same_entity_is_serialized() {
        let remote = ScriptedRemote::with(vec![Err(RemoteError::Transient("flaky".into()))]);
        let h = harness(remote.clone(), SyncConfig::default()).await;
        let first = enqueue(&h.engine, 7, SyncPriority::Low).await;
        let second = h
            .engine
            .add_to_sync_queue(SyncOperation::Update, "student", json!({"id": 7, "name": "B"}), SyncPriority::High)
            .await
            .unwrap();

        // Only the older mutation goes out; it fails and blocks the newer one
        assert_eq!(h.engine.force_sync().await.claimed, 1);
        assert_eq!(h.engine.force_sync().await.claimed, 0);

        h.clock.advance(Duration::from_secs(5));
        assert_eq!(h.engine.force_sync().await.claimed, 1);
        assert_eq!(h.engine.get_item(&first.id).unwrap().status, SyncStatus::Completed);
        assert_eq!(h.engine.force_sync().await.claimed, 1);
        assert_eq!(h.engine.get_item(&second.id).unwrap().status, SyncStatus::Completed);
    }

    #[tokio::test]
    async fn test_overlapping_batches_never_double_claim() {
        struct Slow {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl RemoteApi for Slow {
            async fn apply(&self, _request: &RemoteRequest) -> Result<RemoteAck, RemoteError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(RemoteAck::default())
            }
        }

        let remote = Arc::new(Slow { calls: AtomicUsize::new(0) });
        let h = harness(remote.clone(), SyncConfig::default()).await;
        for id in 0..4 {
            enqueue(&h.engine, id, SyncPriority::Medium).await;
        }

        let (a, b) = tokio::join!(h.engine.process_batch(), h.engine.force_sync());
        assert_eq!(a.claimed + b.claimed, 4);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 4);
        assert_eq!(h.engine.get_sync_stats().completed_items, 4);
    }

    #[tokio::test]
    async fn test_conflict_remote_wins_completes() {
        let remote = ScriptedRemote::with(vec![Err(RemoteError::Conflict {
            remote_payload: json!({"id": 1, "name": "remote"}),
            remote_updated_at: 5,
        })]);
        let config = SyncConfig {
            conflict_resolution: ConflictResolution::RemoteWins,
            ..Default::default()
        };
        let h = harness(remote, config).await;
        let item = enqueue(&h.engine, 1, SyncPriority::High).await;

        let result = h.engine.force_sync().await;
        assert_eq!(result.conflicts, 1);
        assert_eq!(h.engine.get_item(&item.id).unwrap().status, SyncStatus::Completed);
        assert_eq!(h.engine.get_sync_stats().conflicts, 1);
    }

    #[tokio::test]
    async fn test_conflict_local_wins_requeues_with_force() {
        let remote = ScriptedRemote::with(vec![Err(RemoteError::Conflict {
            remote_payload: json!({"id": 1, "name": "remote", "grade": 4}),
            remote_updated_at: 5,
        })]);
        let config = SyncConfig {
            conflict_resolution: ConflictResolution::LocalWins,
            ..Default::default()
        };
        let h = harness(remote.clone(), config).await;
        let item = h
            .engine
            .add_to_sync_queue(SyncOperation::Update, "student", json!({"id": 1, "name": "local"}), SyncPriority::High)
            .await
            .unwrap();

        h.engine.force_sync().await;
        let requeued = h.engine.get_item(&item.id).unwrap();
        assert_eq!(requeued.status, SyncStatus::Pending);
        assert!(requeued.force);
        assert_eq!(requeued.payload, json!({"id": 1, "name": "local", "grade": 4}));

        // Re-sent straight away with force set
        h.engine.force_sync().await;
        let seen = remote.seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].force);
        assert_eq!(h.engine.get_item(&item.id).unwrap().status, SyncStatus::Completed);
    }

    #[tokio::test]
    async fn test_conflict_manual_fails() {
        let remote = ScriptedRemote::with(vec![Err(RemoteError::Conflict {
            remote_payload: json!({}),
            remote_updated_at: 5,
        })]);
        let config = SyncConfig {
            conflict_resolution: ConflictResolution::Manual,
            ..Default::default()
        };
        let h = harness(remote, config).await;
        let item = enqueue(&h.engine, 1, SyncPriority::High).await;

        h.engine.force_sync().await;
        let failed = h.engine.get_item(&item.id).unwrap();
        assert_eq!(failed.status, SyncStatus::Failed);
        assert!(failed.last_error.unwrap().contains("manual"));
    }

    #[tokio::test]
    async fn test_clear_sync_queue() {
        let h = harness(ScriptedRemote::with(vec![]), SyncConfig::default()).await;
        enqueue(&h.engine, 1, SyncPriority::High).await;
        h.engine.force_sync().await;
        enqueue(&h.engine, 2, SyncPriority::High).await;
        enqueue(&h.engine, 3, SyncPriority::High).await;

        assert_eq!(h.engine.clear_sync_queue().await.unwrap(), 2);
        assert!(h.engine.get_sync_queue().is_empty());
        let stats = h.engine.get_sync_stats();
        assert_eq!(stats.pending_items, 0);
        assert_eq!(stats.completed_items, 0);
        assert!(h.store.load_active().await.unwrap().is_empty());
        assert!(h.engine.get_archived().is_empty());
    }

    /// Store whose first armed in-progress write parks until released.
    #[derive(Default)]
    struct HeldWriteStore {
        inner: InMemoryQueueStore,
        armed: AtomicBool,
        reached: Notify,
        release: Notify,
    }

    #[async_trait]
    impl QueueStore for HeldWriteStore {
        async fn load_active(&self) -> Result<Vec<SyncItem>, StorageError> {
            self.inner.load_active().await
        }
        async fn upsert(&self, item: &SyncItem) -> Result<(), StorageError> {
            if item.status == SyncStatus::InProgress && self.armed.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.notified().await;
            }
            self.inner.upsert(item).await
        }
        async fn remove(&self, id: &str) -> Result<(), StorageError> {
            self.inner.remove(id).await
        }
        async fn archive(&self, item: &SyncItem, retention: usize) -> Result<(), StorageError> {
            self.inner.archive(item, retention).await
        }
        async fn load_archive(&self) -> Result<Vec<SyncItem>, StorageError> {
            self.inner.load_archive().await
        }
        async fn clear(&self) -> Result<(), StorageError> {
            self.inner.clear().await
        }
        async fn load_config(&self) -> Result<Option<SyncConfig>, StorageError> {
            self.inner.load_config().await
        }
        async fn save_config(&self, config: &SyncConfig) -> Result<(), StorageError> {
            self.inner.save_config(config).await
        }
    }

    #[tokio::test]
    async fn test_clear_during_claim_write_stays_cleared_after_restart() {
        let store = Arc::new(HeldWriteStore::default());
        let open = |store: Arc<HeldWriteStore>| {
            SyncQueueEngine::open(
                store,
                ScriptedRemote::with(vec![]),
                Arc::new(ManualConnectivity::online()),
                Arc::new(ManualClock::new(1_000_000)),
                test_options(),
                SyncConfig::default(),
            )
        };
        let engine = Arc::new(open(store.clone()).await.unwrap());
        enqueue(&engine, 1, SyncPriority::High).await;
        store.armed.store(true, Ordering::SeqCst);

        let batch = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.process_batch().await })
        };
        store.reached.notified().await;
        assert_eq!(engine.clear_sync_queue().await.unwrap(), 1);

        store.release.notify_one();
        batch.await.unwrap();

        assert!(store.load_active().await.unwrap().is_empty());
        let reopened = open(store.clone()).await.unwrap();
        assert!(reopened.get_sync_queue().is_empty());
        assert_eq!(reopened.get_sync_stats().total_items, 0);
    }

    #[tokio::test]
    async fn test_update_config_validates_and_persists() {
        let h = harness(ScriptedRemote::with(vec![]), SyncConfig::default()).await;

        let bad = SyncConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(h.engine.update_config(bad).await.is_err());

        let config = SyncConfig {
            auto_sync: false,
            batch_size: 3,
            ..Default::default()
        };
        h.engine.update_config(config.clone()).await.unwrap();
        assert_eq!(h.engine.get_config(), config);
        assert_eq!(h.store.load_config().await.unwrap(), Some(config));
    }

    #[tokio::test]
    async fn test_persisted_config_wins_over_initial() {
        let store = Arc::new(InMemoryQueueStore::new());
        let saved = SyncConfig {
            batch_size: 9,
            ..Default::default()
        };
        store.save_config(&saved).await.unwrap();

        let engine = SyncQueueEngine::open(
            store,
            ScriptedRemote::with(vec![]),
            Arc::new(ManualConnectivity::online()),
            Arc::new(ManualClock::new(0)),
            test_options(),
            SyncConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(engine.get_config().batch_size, 9);
    }

    #[tokio::test]
    async fn test_reopen_resets_in_progress_and_continues_seq() {
        let store = Arc::new(InMemoryQueueStore::new());
        let mut stuck = SyncItem::new(4, SyncOperation::Create, "student", json!({"id": 1}), SyncPriority::High, 5, 0);
        stuck.status = SyncStatus::InProgress;
        store.upsert(&stuck).await.unwrap();

        let engine = SyncQueueEngine::open(
            store.clone(),
            ScriptedRemote::with(vec![]),
            Arc::new(ManualConnectivity::online()),
            Arc::new(ManualClock::new(0)),
            test_options(),
            SyncConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(engine.get_item(&stuck.id).unwrap().status, SyncStatus::Pending);
        assert_eq!(store.load_active().await.unwrap()[0].status, SyncStatus::Pending);

        let next = engine
            .add_to_sync_queue(SyncOperation::Create, "student", json!({"id": 2}), SyncPriority::Low)
            .await
            .unwrap();
        assert_eq!(next.seq, 5);
    }

    #[tokio::test]
    async fn test_retry_failed_and_discard() {
        let remote = ScriptedRemote::with(vec![Err(RemoteError::Validation("nope".into()))]);
        let h = harness(remote, SyncConfig::default()).await;
        let item = enqueue(&h.engine, 1, SyncPriority::High).await;
        h.engine.force_sync().await;

        assert!(h.engine.retry_failed(&item.id).await.unwrap());
        let revived = h.engine.get_item(&item.id).unwrap();
        assert_eq!((revived.status, revived.attempts), (SyncStatus::Pending, 0));
        assert!(!h.engine.retry_failed(&item.id).await.unwrap());

        assert!(h.engine.discard(&item.id).await.unwrap());
        assert!(h.engine.get_item(&item.id).is_none());
        assert!(!h.engine.discard(&item.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_auto_sync_runs_on_reconnect() {
        let config = SyncConfig {
            sync_interval_ms: 3_600_000,
            ..Default::default()
        };
        let h = harness(ScriptedRemote::with(vec![]), config).await;
        h.connectivity.set_online(false);
        let handle = h.engine.start_auto_sync();
        enqueue(&h.engine, 1, SyncPriority::High).await;

        h.connectivity.set_online(true);
        for _ in 0..100 {
            if h.engine.get_sync_stats().completed_items == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.engine.get_sync_stats().completed_items, 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_auto_sync_interval_respects_offline_and_config() {
        let config = SyncConfig {
            sync_interval_ms: 10,
            ..Default::default()
        };
        let h = harness(ScriptedRemote::with(vec![]), config.clone()).await;
        h.connectivity.set_online(false);
        let handle = h.engine.start_auto_sync();
        enqueue(&h.engine, 1, SyncPriority::High).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.engine.get_sync_stats().pending_items, 1);

        // Online, but auto-sync switched off
        h.engine
            .update_config(SyncConfig {
                auto_sync: false,
                ..config.clone()
            })
            .await
            .unwrap();
        h.connectivity.set_online(true);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.engine.get_sync_stats().pending_items, 1);

        h.engine.update_config(config).await.unwrap();
        for _ in 0..100 {
            if h.engine.get_sync_stats().completed_items == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.engine.get_sync_stats().completed_items, 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_task() {
        let h = harness(ScriptedRemote::with(vec![]), SyncConfig::default()).await;
        let handle = h.engine.start_auto_sync();
        let AutoSyncHandle { shutdown_tx, task } = handle;
        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}

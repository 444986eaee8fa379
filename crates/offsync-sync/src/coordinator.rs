//! SyncCoordinator: drives every sync round and owns the engine's state.
//!
//! Responsibilities:
//!   - `queue_mutation`: local write, encrypt, enqueue, wake the run loop
//!   - `run_full_sync`: drain the whole queue in per-entity-type batches, then pull
//!   - `run_incremental_sync`: pull changes since the last sync, push recent items
//!   - `handle_remote_update`: decrypt, verify, detect, resolve, apply
//!   - `start`: run loop reacting to network transitions, realtime messages,
//!     the incremental timer and retry deadlines
//!
//! At most one round runs at a time; a second caller gets a skipped report.
//! Realtime messages are handled on their own task and may interleave with a
//! round, since both paths only touch the store and queue through their
//! own synchronization.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use offsync_core::config::{ConflictConfig, OfsConfig};
use offsync_core::{now_millis, ClientInfo, EntityVersion, OfsResult, Operation, SyncError, SyncItem};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::checksum::{checksum_bytes, checksum_value, encode_value};
use crate::conflict::{ConflictDetector, Detection};
use crate::encryption::Encryptor;
use crate::network::{NetworkEvent, NetworkMonitor};
use crate::protocol::{
    BatchItem, BatchRequest, BatchResponse, ChannelMessage, ItemError, ItemErrorKind, RemoteMutation,
};
use crate::queue::{NewItem, RetryOutcome, SyncQueue};
use crate::realtime::{ChannelEvent, Credentials, RealtimeChannel, RealtimeTransport, ReconnectPolicy};
use crate::remote::RemoteApi;
use crate::resolve::{ConflictResolver, Winner};
use crate::state::{SyncMeta, TenantState};
use crate::stats::{DropReason, SyncEvent, SyncMode, SyncReport, SyncStats};
use crate::store::LocalStore;

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub client_info: ClientInfo,
    pub credentials: Credentials,
    pub realtime_endpoint: String,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub coalesce_window: Duration,
    pub incremental_interval: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub request_timeout: Duration,
    pub conflict: ConflictConfig,
    pub reconnect: ReconnectPolicy,
}

impl CoordinatorSettings {
    pub fn from_config(config: &OfsConfig, client_info: ClientInfo, credentials: Credentials) -> Self {
        Self {
            client_info,
            credentials,
            realtime_endpoint: config.remote.realtime_url.clone(),
            batch_size: config.sync.batch_size.max(1),
            max_attempts: config.sync.max_attempts.max(1),
            coalesce_window: Duration::from_millis(config.sync.coalesce_window_ms),
            incremental_interval: Duration::from_secs(config.sync.incremental_interval_secs.max(1)),
            retry_base_delay: Duration::from_millis(config.sync.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(config.sync.retry_max_delay_ms),
            request_timeout: Duration::from_secs(config.remote.request_timeout_secs.max(1)),
            conflict: config.conflict.clone(),
            reconnect: ReconnectPolicy {
                cap: Duration::from_secs(config.realtime.reconnect_cap_secs),
                max_attempts: config.realtime.max_reconnect_attempts,
            },
        }
    }
}

/// External collaborators the coordinator drives.
pub struct Collaborators {
    pub store: Arc<dyn LocalStore>,
    pub encryptor: Arc<dyn Encryptor>,
    pub remote: Arc<dyn RemoteApi>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub network: Arc<NetworkMonitor>,
    /// Where queue and sync metadata persist; `None` keeps everything in memory
    pub state: Option<TenantState>,
}

/// How an incoming remote mutation was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// Produced by this device
    Echo,
    /// Failed decryption or checksum verification
    Rejected,
    UpToDate,
    Applied,
    Resolved,
}

struct RoundGuard<'a>(&'a AtomicBool);

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn group_by_entity_type(items: Vec<SyncItem>) -> Vec<(String, Vec<SyncItem>)> {
    let mut groups: Vec<(String, Vec<SyncItem>)> = Vec::new();
    for item in items {
        match groups.iter_mut().find(|(entity_type, _)| *entity_type == item.entity_type) {
            Some((_, group)) => group.push(item),
            None => groups.push((item.entity_type.clone(), vec![item])),
        }
    }
    groups
}

fn count_settled(report: &mut SyncReport, settled: Settled) {
    match settled {
        Settled::Applied => report.applied += 1,
        Settled::Resolved => report.conflicts += 1,
        Settled::Echo | Settled::Rejected | Settled::UpToDate => {}
    }
}

fn ids_of(items: impl IntoIterator<Item = SyncItem>) -> Vec<String> {
    items.into_iter().map(|item| item.id).collect()
}

// ── Coordinator ───────────────────────────────────────────────────────────────

pub struct SyncCoordinator {
    settings: CoordinatorSettings,
    store: Arc<dyn LocalStore>,
    encryptor: Arc<dyn Encryptor>,
    remote: Arc<dyn RemoteApi>,
    network: Arc<NetworkMonitor>,
    channel: Arc<RealtimeChannel>,
    state: Option<TenantState>,
    queue: SyncQueue,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    credentials: RwLock<Credentials>,
    stats: Mutex<SyncStats>,
    events: broadcast::Sender<SyncEvent>,
    sync_in_progress: AtomicBool,
    auth_paused: AtomicBool,
    last_sync_time: AtomicU64,
    network_failures: AtomicU32,
    wake: Notify,
    persist_lock: tokio::sync::Mutex<()>,
}

impl SyncCoordinator {
    /// Build a coordinator, restoring the persisted queue and sync metadata.
    pub fn new(settings: CoordinatorSettings, collaborators: Collaborators) -> OfsResult<Arc<Self>> {
        let Collaborators {
            store,
            encryptor,
            remote,
            transport,
            network,
            state,
        } = collaborators;

        let queue = SyncQueue::new(settings.coalesce_window);
        let mut last_sync_time = 0;
        if let Some(state) = &state {
            queue.restore(state.load_queue()?);
            last_sync_time = state.load_meta()?.last_sync_time;
        }

        let channel = RealtimeChannel::new(
            transport,
            Arc::clone(&network),
            settings.client_info.clone(),
            settings.reconnect,
        );
        let (events, _) = broadcast::channel(256);

        info!(
            device_id = %settings.client_info.device_id,
            tenant = %settings.credentials.tenant_id,
            pending = queue.size(),
            last_sync_time,
            "sync coordinator ready"
        );

        Ok(Arc::new(Self {
            detector: ConflictDetector::new(Duration::from_millis(settings.conflict.window_ms)),
            resolver: ConflictResolver::from_config(&settings.conflict),
            credentials: RwLock::new(settings.credentials.clone()),
            settings,
            store,
            encryptor,
            remote,
            network,
            channel,
            state,
            queue,
            stats: Mutex::new(SyncStats::default()),
            events,
            sync_in_progress: AtomicBool::new(false),
            auth_paused: AtomicBool::new(false),
            last_sync_time: AtomicU64::new(last_sync_time),
            network_failures: AtomicU32::new(0),
            wake: Notify::new(),
            persist_lock: tokio::sync::Mutex::new(()),
        }))
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn client_info(&self) -> &ClientInfo {
        &self.settings.client_info
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn channel(&self) -> &Arc<RealtimeChannel> {
        &self.channel
    }

    pub fn last_sync_time(&self) -> u64 {
        self.last_sync_time.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.sync_in_progress.load(Ordering::SeqCst)
    }

    pub fn is_auth_paused(&self) -> bool {
        self.auth_paused.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> SyncStats {
        self.lock_stats().clone()
    }

    pub fn reset_stats(&self) {
        self.lock_stats().reset();
    }

    fn lock_stats(&self) -> MutexGuard<'_, SyncStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // ── Local mutations ───────────────────────────────────────────────────────

    /// Record a local mutation. Never fails: store and encryption problems are
    /// logged and published as events. Returns the queue item id, or `None`
    /// when the payload could not be encrypted.
    pub async fn queue_mutation(
        &self,
        operation: Operation,
        entity_type: &str,
        entity_id: &str,
        value: Value,
    ) -> Option<String> {
        let now = now_millis();
        let device_id = Some(self.settings.client_info.device_id.clone());
        let version = if operation == Operation::Delete {
            EntityVersion {
                device_id,
                ..EntityVersion::tombstone(entity_id, now, checksum_value(&Value::Null))
            }
        } else {
            EntityVersion {
                entity_id: entity_id.to_string(),
                checksum: checksum_value(&value),
                value,
                timestamp: now,
                deleted: false,
                device_id,
            }
        };

        if let Err(e) = self.apply_version(entity_type, version.clone()).await {
            warn!(entity_type, entity_id, "local store write failed: {e}");
            self.emit(SyncEvent::LocalStoreFailed {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                message: e.to_string(),
            });
        }

        let id = self.enqueue_version(operation, entity_type, &version).await?;
        debug!(item_id = %id, entity_type, entity_id, %operation, "mutation queued");
        self.wake.notify_one();
        Some(id)
    }

    async fn enqueue_version(
        &self,
        operation: Operation,
        entity_type: &str,
        version: &EntityVersion,
    ) -> Option<String> {
        let plaintext = if version.deleted {
            encode_value(&Value::Null)
        } else {
            encode_value(&version.value)
        };
        let payload = match self.encryptor.encrypt(&plaintext) {
            Ok(payload) => payload,
            Err(e) => {
                error!(entity_type, entity_id = %version.entity_id, "payload encryption failed: {e}");
                self.lock_stats().items_dropped += 1;
                self.emit(SyncEvent::ItemDropped {
                    item_id: String::new(),
                    entity_type: entity_type.to_string(),
                    entity_id: version.entity_id.clone(),
                    reason: DropReason::Encryption,
                    message: e.to_string(),
                });
                return None;
            }
        };

        let id = self.queue.enqueue(NewItem {
            operation,
            entity_type: entity_type.to_string(),
            entity_id: version.entity_id.clone(),
            payload,
            checksum: version.checksum.clone(),
        });
        self.persist_queue().await;
        Some(id)
    }

    async fn apply_version(&self, entity_type: &str, version: EntityVersion) -> OfsResult<()> {
        if version.deleted {
            self.store.delete(entity_type, &version.entity_id).await
        } else {
            self.store.put(entity_type, version).await
        }
    }

    // ── Rounds ────────────────────────────────────────────────────────────────

    pub async fn run_full_sync(&self) -> SyncReport {
        self.run_round(SyncMode::Full).await
    }

    pub async fn run_incremental_sync(&self) -> SyncReport {
        self.run_round(SyncMode::Incremental).await
    }

    fn try_begin(&self) -> Option<RoundGuard<'_>> {
        self.sync_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RoundGuard(&self.sync_in_progress))
    }

    async fn run_round(&self, mode: SyncMode) -> SyncReport {
        if self.is_auth_paused() {
            debug!(mode = mode.as_str(), "sync paused until re-authentication");
            return SyncReport::skipped(mode);
        }
        if !self.network.is_online() {
            debug!(mode = mode.as_str(), "offline; skipping sync round");
            return SyncReport::skipped(mode);
        }
        let Some(_guard) = self.try_begin() else {
            debug!(mode = mode.as_str(), "sync round already in progress");
            return SyncReport::skipped(mode);
        };

        self.emit(SyncEvent::SyncStarted { mode });
        let started = Instant::now();
        let mut report = SyncReport::new(mode);
        let result = match mode {
            SyncMode::Full => self.full_round(&mut report).await,
            SyncMode::Incremental => self.incremental_round(&mut report).await,
        };
        let elapsed = started.elapsed();
        report.duration_ms = elapsed.as_millis() as u64;

        let success = result.is_ok() && !report.interrupted;
        {
            let mut stats = self.lock_stats();
            stats.record_round(elapsed, success, now_millis());
            stats.items_pushed += report.acknowledged as u64;
        }
        self.persist_queue().await;

        match result {
            Ok(()) => {
                info!(
                    mode = mode.as_str(),
                    acknowledged = report.acknowledged,
                    retried = report.retried,
                    dropped = report.dropped,
                    conflicts = report.conflicts,
                    applied = report.applied,
                    interrupted = report.interrupted,
                    duration_ms = report.duration_ms,
                    "sync round finished"
                );
                self.emit(SyncEvent::SyncCompleted {
                    report: report.clone(),
                });
            }
            Err(e) => {
                warn!(mode = mode.as_str(), kind = e.kind(), "sync round failed: {e}");
                self.emit(SyncEvent::SyncFailed {
                    mode,
                    error: e.to_string(),
                });
            }
        }
        report
    }

    async fn full_round(&self, report: &mut SyncReport) -> OfsResult<()> {
        self.drain(report, None).await?;
        if report.interrupted {
            return Ok(());
        }
        self.pull(report).await
    }

    async fn incremental_round(&self, report: &mut SyncReport) -> OfsResult<()> {
        let since = self.last_sync_time();
        self.pull(report).await?;
        if !self.network.is_online() {
            report.interrupted = true;
            return Ok(());
        }
        self.drain(report, Some(since)).await
    }

    // ── Push ──────────────────────────────────────────────────────────────────

    /// Send eligible items until the queue is empty, each item at most once
    /// per round. Items dequeued a second time are held in flight until the
    /// round ends so the loop moves past them.
    async fn drain(&self, report: &mut SyncReport, since: Option<u64>) -> OfsResult<()> {
        let mut attempted = HashSet::new();
        let mut held = Vec::new();
        let result = self
            .drain_batches(report, since, &mut attempted, &mut held)
            .await;
        self.queue.release(&held);
        result
    }

    async fn drain_batches(
        &self,
        report: &mut SyncReport,
        since: Option<u64>,
        attempted: &mut HashSet<String>,
        held: &mut Vec<String>,
    ) -> OfsResult<()> {
        let batch_size = self.settings.batch_size;
        loop {
            if !self.network.is_online() {
                info!("network went offline; not starting further batches");
                report.interrupted = true;
                return Ok(());
            }

            let batch = match since {
                Some(since) => self.queue.dequeue_since(batch_size, since),
                None => self.queue.dequeue(batch_size),
            };
            if batch.is_empty() {
                return Ok(());
            }

            let (fresh, repeated): (Vec<SyncItem>, Vec<SyncItem>) =
                batch.into_iter().partition(|item| !attempted.contains(&item.id));
            held.extend(ids_of(repeated));
            if fresh.is_empty() {
                continue;
            }
            attempted.extend(fresh.iter().map(|item| item.id.clone()));

            let mut groups = group_by_entity_type(fresh).into_iter();
            while let Some((entity_type, items)) = groups.next() {
                if !self.network.is_online() {
                    let mut ids = ids_of(items);
                    ids.extend(groups.by_ref().flat_map(|(_, rest)| ids_of(rest)));
                    self.queue.release(&ids);
                    info!("network went offline; not starting further batches");
                    report.interrupted = true;
                    return Ok(());
                }
                if let Err(e) = self.push_group(&entity_type, items, report).await {
                    let rest: Vec<String> = groups.by_ref().flat_map(|(_, rest)| ids_of(rest)).collect();
                    if e.is_retryable() {
                        self.queue.defer(&rest, self.network_retry_delay());
                    } else {
                        self.queue.release(&rest);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn push_group(
        &self,
        entity_type: &str,
        items: Vec<SyncItem>,
        report: &mut SyncReport,
    ) -> OfsResult<()> {
        let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
        let request = BatchRequest {
            entity_type: entity_type.to_string(),
            items: items.iter().map(BatchItem::from).collect(),
            client_info: self.settings.client_info.clone(),
        };
        report.pushed += items.len();
        debug!(entity_type, items = items.len(), "pushing batch");

        match self.with_timeout(self.remote.send_batch(&request)).await {
            Ok(response) => {
                self.network_failures.store(0, Ordering::SeqCst);
                self.apply_batch_response(items, response, report).await
            }
            Err(SyncError::Network(message)) => {
                let failures = self.network_failures.fetch_add(1, Ordering::SeqCst);
                let delay = self.retry_delay(failures);
                self.queue.defer(&ids, delay);
                report.retried += ids.len();
                warn!(
                    entity_type,
                    items = ids.len(),
                    delay_ms = delay.as_millis() as u64,
                    "batch send failed, deferring: {message}"
                );
                Err(SyncError::Network(message))
            }
            Err(SyncError::Auth(message)) => {
                self.queue.release(&ids);
                self.pause_for_auth(&message);
                Err(SyncError::Auth(message))
            }
            Err(SyncError::Validation(message)) => {
                for item in &items {
                    self.retry_item(item, &message, report);
                }
                Ok(())
            }
            Err(e) => {
                self.queue.release(&ids);
                Err(e)
            }
        }
    }

    async fn apply_batch_response(
        &self,
        items: Vec<SyncItem>,
        response: BatchResponse,
        report: &mut SyncReport,
    ) -> OfsResult<()> {
        let mut pending: HashMap<String, SyncItem> =
            items.into_iter().map(|item| (item.id.clone(), item)).collect();
        let mut auth_failure = None;
        let mut failure = None;

        for result in response.results {
            let Some(item) = pending.remove(&result.item_id) else {
                // Duplicate or replayed acknowledgement
                trace!(item_id = %result.item_id, "result for an item not in this batch");
                continue;
            };
            if result.success {
                self.acknowledge(&item, report);
                continue;
            }
            let error = result.error.unwrap_or(ItemError {
                kind: ItemErrorKind::Validation,
                message: "rejected without reason".into(),
            });
            match error.kind {
                ItemErrorKind::Validation => self.retry_item(&item, &error.message, report),
                ItemErrorKind::Integrity => {
                    self.queue.remove(&item.id);
                    self.record_drop(item, DropReason::Integrity, error.message, report);
                }
                ItemErrorKind::Server => {
                    self.queue.defer(&[item.id.clone()], self.retry_delay(item.attempt));
                    report.retried += 1;
                }
                ItemErrorKind::Auth => {
                    self.queue.release(&[item.id.clone()]);
                    auth_failure = Some(error.message);
                }
            }
        }

        for conflict in response.conflicts {
            let item = pending.remove(&conflict.item_id);
            let settled = self.settle_remote(conflict.remote).await;
            let Some(item) = item else {
                match settled {
                    Ok(settled) => count_settled(report, settled),
                    Err(e) => {
                        failure.get_or_insert(e);
                    }
                }
                continue;
            };
            match settled {
                // Resolution decides what, if anything, to push next
                Ok(settled @ (Settled::Applied | Settled::UpToDate | Settled::Resolved)) => {
                    self.queue.remove(&item.id);
                    count_settled(report, settled);
                }
                Ok(Settled::Rejected) => {
                    self.retry_item(&item, "server copy of a conflicting item failed verification", report);
                }
                Ok(Settled::Echo) => {
                    self.retry_item(&item, "server reported a conflict with this device's own write", report);
                }
                Err(e) => {
                    self.queue.defer(&[item.id.clone()], self.retry_delay(item.attempt));
                    report.retried += 1;
                    failure.get_or_insert(e);
                }
            }
        }
        for update in response.server_updates {
            if let Err(e) = self.settle_into(update, report).await {
                failure.get_or_insert(e);
            }
        }

        for item in pending.into_values() {
            self.retry_item(&item, "missing from batch response", report);
        }

        if let Some(message) = auth_failure {
            self.pause_for_auth(&message);
            return Err(SyncError::Auth(message));
        }
        failure.map_or(Ok(()), Err)
    }

    fn acknowledge(&self, item: &SyncItem, report: &mut SyncReport) {
        if self.queue.remove(&item.id).is_some() {
            report.acknowledged += 1;
            self.emit(SyncEvent::ItemAcknowledged {
                item_id: item.id.clone(),
                entity_type: item.entity_type.clone(),
            });
        }
    }

    fn retry_item(&self, item: &SyncItem, message: &str, report: &mut SyncReport) {
        let delay = self.retry_delay(item.attempt);
        match self.queue.mark_retry(&item.id, delay, self.settings.max_attempts) {
            RetryOutcome::Scheduled { attempt, .. } => {
                report.retried += 1;
                debug!(
                    item_id = %item.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "item rejected, retry scheduled: {message}"
                );
                self.emit(SyncEvent::ItemRetryScheduled {
                    item_id: item.id.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
            }
            RetryOutcome::Exhausted(item) => {
                self.record_drop(item, DropReason::MaxAttempts, message.to_string(), report);
            }
            RetryOutcome::Missing => {}
        }
    }

    fn record_drop(&self, item: SyncItem, reason: DropReason, message: String, report: &mut SyncReport) {
        report.dropped += 1;
        self.lock_stats().items_dropped += 1;
        warn!(
            item_id = %item.id,
            entity_type = %item.entity_type,
            entity_id = %item.entity_id,
            attempts = item.attempt,
            reason = reason.as_str(),
            "dropping queued item: {message}"
        );
        self.emit(SyncEvent::ItemDropped {
            item_id: item.id,
            entity_type: item.entity_type,
            entity_id: item.entity_id,
            reason,
            message,
        });
    }

    /// `base * 2^attempt`, capped at the configured maximum.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.settings.retry_base_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(factor)).min(self.settings.retry_max_delay)
    }

    fn network_retry_delay(&self) -> Duration {
        let failures = self.network_failures.load(Ordering::SeqCst);
        self.retry_delay(failures.saturating_sub(1))
    }

    async fn with_timeout<T>(&self, request: impl Future<Output = OfsResult<T>>) -> OfsResult<T> {
        let timeout = self.settings.request_timeout;
        match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Network(format!(
                "request timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    // ── Pull ──────────────────────────────────────────────────────────────────

    async fn pull(&self, report: &mut SyncReport) -> OfsResult<()> {
        let since = self.last_sync_time();
        let changes = match self
            .with_timeout(self.remote.fetch_changes(since, &self.settings.client_info))
            .await
        {
            Ok(changes) => changes,
            Err(e) => {
                match &e {
                    SyncError::Auth(message) => self.pause_for_auth(message),
                    SyncError::Network(_) => {
                        self.network_failures.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {}
                }
                return Err(e);
            }
        };
        self.network_failures.store(0, Ordering::SeqCst);
        debug!(since, changes = changes.changes.len(), "pulled remote changes");

        for mutation in changes.changes {
            self.settle_into(mutation, report).await?;
        }
        self.advance_last_sync_time(changes.server_time).await;
        Ok(())
    }

    async fn settle_into(&self, mutation: RemoteMutation, report: &mut SyncReport) -> OfsResult<()> {
        let settled = self.settle_remote(mutation).await?;
        count_settled(report, settled);
        Ok(())
    }

    /// Route one remote mutation through verification and conflict detection.
    pub async fn handle_remote_update(&self, mutation: RemoteMutation) -> OfsResult<Settled> {
        self.settle_remote(mutation).await
    }

    async fn settle_remote(&self, mutation: RemoteMutation) -> OfsResult<Settled> {
        if self
            .settings
            .client_info
            .is_self(mutation.device_id.as_deref())
        {
            trace!(entity_type = %mutation.entity_type, entity_id = %mutation.entity_id, "skipping own echo");
            return Ok(Settled::Echo);
        }

        let incoming = match self.open_mutation(&mutation) {
            Ok(version) => version,
            Err(e) => {
                warn!(
                    entity_type = %mutation.entity_type,
                    entity_id = %mutation.entity_id,
                    "rejecting remote mutation: {e}"
                );
                self.emit(SyncEvent::RemoteRejected {
                    entity_type: mutation.entity_type,
                    entity_id: mutation.entity_id,
                    reason: e.to_string(),
                });
                return Ok(Settled::Rejected);
            }
        };

        let entity_type = mutation.entity_type.as_str();
        let local = self.store.get(entity_type, &mutation.entity_id).await?;
        match self.detector.classify(entity_type, &incoming, local.as_ref()) {
            Detection::UpToDate => Ok(Settled::UpToDate),
            Detection::ApplyIncoming => {
                self.apply_version(entity_type, incoming).await?;
                debug!(entity_type, entity_id = %mutation.entity_id, "applied remote version");
                self.emit(SyncEvent::RemoteApplied {
                    entity_type: entity_type.to_string(),
                    entity_id: mutation.entity_id.clone(),
                });
                Ok(Settled::Applied)
            }
            Detection::Conflict(record) => {
                let resolution = self.resolver.resolve_for(record);
                if resolution.winner != Winner::Local {
                    self.apply_version(entity_type, resolution.value.clone()).await?;
                }
                let requeued = resolution.needs_push();
                if requeued {
                    let operation = if resolution.value.deleted {
                        Operation::Delete
                    } else {
                        Operation::Update
                    };
                    self.enqueue_version(operation, entity_type, &resolution.value).await;
                }
                self.lock_stats().conflicts_resolved += 1;
                info!(
                    entity_type,
                    entity_id = %resolution.entity_id,
                    kind = resolution.kind.as_str(),
                    strategy = resolution.strategy,
                    winner = resolution.winner.as_str(),
                    requeued,
                    "conflict resolved"
                );
                self.emit(SyncEvent::ConflictResolved {
                    entity_type: resolution.entity_type,
                    entity_id: resolution.entity_id,
                    kind: resolution.kind,
                    strategy: resolution.strategy,
                    winner: resolution.winner,
                    requeued,
                });
                Ok(Settled::Resolved)
            }
        }
    }

    /// Decrypt and verify; any failure is an integrity error.
    fn open_mutation(&self, mutation: &RemoteMutation) -> OfsResult<EntityVersion> {
        let integrity = |reason: String| SyncError::Integrity {
            entity_type: mutation.entity_type.clone(),
            entity_id: mutation.entity_id.clone(),
            reason,
        };

        let plaintext = self
            .encryptor
            .decrypt(&mutation.payload)
            .map_err(|e| integrity(format!("decryption failed: {e}")))?;
        let actual = checksum_bytes(&plaintext);
        if actual != mutation.checksum {
            return Err(integrity(format!(
                "checksum mismatch: expected {}, computed {actual}",
                mutation.checksum
            )));
        }

        if mutation.operation == Operation::Delete {
            return Ok(EntityVersion {
                device_id: mutation.device_id.clone(),
                ..EntityVersion::tombstone(mutation.entity_id.clone(), mutation.timestamp, actual)
            });
        }
        let value: Value = serde_json::from_slice(&plaintext)
            .map_err(|e| integrity(format!("payload is not JSON: {e}")))?;
        Ok(EntityVersion {
            entity_id: mutation.entity_id.clone(),
            value,
            timestamp: mutation.timestamp,
            checksum: actual,
            deleted: false,
            device_id: mutation.device_id.clone(),
        })
    }

    // ── Auth ──────────────────────────────────────────────────────────────────

    fn pause_for_auth(&self, reason: &str) {
        if !self.auth_paused.swap(true, Ordering::SeqCst) {
            warn!("credentials rejected, pausing sync until re-authentication: {reason}");
            self.emit(SyncEvent::AuthRequired {
                reason: reason.to_string(),
            });
        }
    }

    /// Install refreshed credentials and resume syncing.
    pub async fn resume_after_reauth(&self, credentials: Credentials) {
        self.remote.update_credentials(&credentials);
        *self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = credentials;
        self.auth_paused.store(false, Ordering::SeqCst);
        info!("credentials refreshed; resuming sync");
        if self.network.is_online() {
            self.connect_realtime().await;
        }
        self.wake.notify_one();
    }

    async fn connect_realtime(&self) {
        if self.is_auth_paused() {
            return;
        }
        let credentials = self
            .credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Err(e) = self
            .channel
            .connect(&self.settings.realtime_endpoint, credentials)
            .await
        {
            warn!(kind = e.kind(), "realtime connect failed: {e}");
        }
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    async fn persist_queue(&self) {
        let Some(state) = &self.state else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        if let Err(e) = state.save_queue(&self.queue.snapshot()) {
            warn!("persisting sync queue failed: {e}");
        }
    }

    async fn advance_last_sync_time(&self, server_time: u64) {
        let previous = self.last_sync_time.fetch_max(server_time, Ordering::SeqCst);
        if server_time <= previous {
            return;
        }
        self.persist_meta().await;
    }

    async fn persist_meta(&self) {
        let Some(state) = &self.state else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        let meta = SyncMeta {
            last_sync_time: self.last_sync_time(),
            client_info: Some(self.settings.client_info.clone()),
        };
        if let Err(e) = state.save_meta(&meta) {
            warn!("persisting sync metadata failed: {e}");
        }
    }

    /// Close the realtime channel and flush queue and metadata to disk.
    pub async fn shutdown(&self) {
        self.channel.close().await;
        self.persist_queue().await;
        self.persist_meta().await;
        info!(pending = self.queue.size(), "sync coordinator stopped");
    }

    // ── Run loop ──────────────────────────────────────────────────────────────

    /// Spawn the run loop and the realtime message handler. Call once.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChannelEvent>();
        self.channel.on_message(move |event| {
            let _ = tx.send(event);
        });

        let handler = Arc::clone(self);
        let handler_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = handler_cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => handler.handle_channel_event(event).await,
                        None => break,
                    },
                }
            }
        });

        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.run(cancel).await })
    }

    async fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(
                ChannelMessage::RemoteMutation { mutation }
                | ChannelMessage::ConflictNotice { mutation, .. },
            ) => {
                if let Err(e) = self.handle_remote_update(mutation).await {
                    warn!(kind = e.kind(), "applying realtime update failed: {e}");
                }
            }
            ChannelEvent::Message(ChannelMessage::SyncComplete { server_time, .. }) => {
                debug!(server_time, "server reported sync complete");
                self.emit(SyncEvent::ServerSyncComplete { server_time });
            }
            ChannelEvent::Message(other) => {
                trace!(kind = other.type_name(), "ignoring channel message");
            }
            ChannelEvent::StateChanged(state) => self.emit(SyncEvent::Realtime(state)),
            ChannelEvent::AuthRejected(reason) => self.pause_for_auth(&reason),
            ChannelEvent::GaveUp { attempts } => {
                warn!(attempts, "realtime reconnect exhausted; waiting for next online transition");
            }
        }
    }

    /// Time until the earliest deferred item becomes eligible, when a retry
    /// round could make progress.
    fn retry_wait(&self) -> Option<Duration> {
        if !self.network.is_online() || self.is_auth_paused() {
            return None;
        }
        let next = self.queue.next_eligible_at()?;
        let wait = Duration::from_millis(next.saturating_sub(now_millis()));
        Some(wait.max(Duration::from_millis(100)))
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut network_events = self.network.subscribe();
        if self.network.is_online() {
            self.connect_realtime().await;
            self.run_full_sync().await;
        }

        let mut ticker = tokio::time::interval(self.settings.incremental_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            let retry_in = self.retry_wait();
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = network_events.recv() => match event {
                    Ok(NetworkEvent::Online) => {
                        self.emit(SyncEvent::Network(NetworkEvent::Online));
                        self.connect_realtime().await;
                        self.run_full_sync().await;
                    }
                    Ok(NetworkEvent::Offline) => {
                        self.emit(SyncEvent::Network(NetworkEvent::Offline));
                        self.channel.close().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "network events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    self.run_incremental_sync().await;
                }
                _ = self.wake.notified() => {
                    self.run_full_sync().await;
                }
                _ = tokio::time::sleep(retry_in.unwrap_or_default()), if retry_in.is_some() => {
                    self.run_full_sync().await;
                }
            }
        }

        self.shutdown().await;
    }
}

//! Sync manager: drains the mutation queue against the remote authority.
//!
//! States move `Idle -> Syncing -> Idle | WaitingToRetry`. Passes run strictly
//! one at a time and dispatch items sequentially, oldest first. Once an item
//! for an entity fails, later items for that entity are left untouched for the
//! rest of the pass so a newer write never overtakes an older one. Writes for
//! an entity whose create sits in the conflict list are held until that
//! conflict is retried or discarded.

mod backoff;
mod dispatch;

pub use backoff::Backoff;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::cache::ResponseCache;
use crate::config::SyncSettings;
use crate::error::{Error, Result};
use crate::model::{Conflict, EntityKind, MutationAction, MutationQueueItem};
use crate::queue::MutationQueue;
use crate::remote::{RemoteService, TransportError};
use crate::store::LocalStore;

pub const LAST_SYNC_ERROR_KEY: &str = "last_sync_error";
pub const LAST_SYNC_AT_KEY: &str = "last_sync_at";

const EVENT_CAPACITY: usize = 256;
const TRIGGER_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    WaitingToRetry,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub interval: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retries: u32,
    pub client_errors_to_conflicts: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_config(&SyncSettings::default())
    }
}

impl SyncOptions {
    pub fn from_config(cfg: &SyncSettings) -> Self {
        Self {
            interval: Duration::from_secs(cfg.interval_secs),
            base_backoff: Duration::from_secs(cfg.base_backoff_secs),
            max_backoff: Duration::from_secs(cfg.max_backoff_secs),
            max_retries: cfg.max_retries,
            client_errors_to_conflicts: cfg.client_errors_to_conflicts,
        }
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items left untouched because an earlier item for the same entity failed.
    pub skipped: usize,
    /// Items moved to the conflict list during this pass.
    pub conflicts: usize,
    /// Items waiting on a conflicted create for the same entity.
    pub held: usize,
    /// The pass did not run because connectivity was believed absent.
    pub offline: bool,
    /// Connectivity was lost mid-pass; remaining items were not attempted.
    pub interrupted: bool,
    /// Backoff armed at the end of the pass.
    pub retry_in: Option<Duration>,
}

impl PassReport {
    fn retained_failures(&self) -> usize {
        self.failed - self.conflicts + self.skipped
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub state: SyncState,
    pub online: bool,
    pub pending_count: u64,
    pub is_syncing: bool,
    pub last_error: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub conflicts: Vec<Conflict>,
    /// Delay the next failing pass will wait before retrying.
    pub backoff: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged(SyncState),
    ConnectivityChanged { online: bool },
    PassCompleted(PassReport),
    SyncError { message: String },
    ConflictRaised(Conflict),
    ConflictResolved { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Manual,
    Enqueued,
    Foreground,
    ConnectivityRestored,
}

impl Trigger {
    /// Whether this trigger may cut a pending backoff short.
    fn overrides_backoff(self) -> bool {
        matches!(self, Trigger::Manual | Trigger::ConnectivityRestored)
    }
}

struct Shared {
    state: SyncState,
    online: bool,
    last_error: Option<String>,
    last_sync_at: Option<DateTime<Utc>>,
    conflicts: Vec<Conflict>,
    backoff: Backoff,
    retry_at: Option<Instant>,
}

struct Inner {
    store: LocalStore,
    queue: MutationQueue,
    cache: ResponseCache,
    remote: Arc<dyn RemoteService>,
    options: SyncOptions,
    shared: Mutex<Shared>,
    pass_lock: Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
    triggers: mpsc::Sender<Trigger>,
    trigger_rx: Mutex<Option<mpsc::Receiver<Trigger>>>,
    shutdown: watch::Sender<bool>,
    /// Wakes the scheduler whenever `retry_at` changes outside its own loop.
    retry_changed: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl SyncManager {
    /// Build a manager. Connectivity is assumed until told otherwise; the last
    /// persisted error and sync time are restored from metadata.
    pub async fn new(
        store: LocalStore,
        cache: ResponseCache,
        remote: Arc<dyn RemoteService>,
        options: SyncOptions,
    ) -> Result<Self> {
        let last_error = store.get_metadata::<String>(LAST_SYNC_ERROR_KEY).await?;
        let last_sync_at = store
            .get_metadata::<DateTime<Utc>>(LAST_SYNC_AT_KEY)
            .await?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (triggers, trigger_rx) = mpsc::channel(TRIGGER_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let shared = Shared {
            state: SyncState::Idle,
            online: true,
            last_error,
            last_sync_at,
            conflicts: Vec::new(),
            backoff: Backoff::new(options.base_backoff, options.max_backoff),
            retry_at: None,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                queue: MutationQueue::new(store.clone()),
                store,
                cache,
                remote,
                options,
                shared: Mutex::new(shared),
                pass_lock: Mutex::new(()),
                events,
                triggers,
                trigger_rx: Mutex::new(Some(trigger_rx)),
                shutdown,
                retry_changed: Notify::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.inner.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Spawn the scheduler task. Calling it twice is a no-op.
    pub async fn start(&self) {
        let Some(triggers) = self.inner.trigger_rx.lock().await.take() else {
            return;
        };
        let shutdown = self.inner.shutdown.subscribe();
        let manager = self.clone();
        let handle = tokio::spawn(async move { manager.run_scheduler(triggers, shutdown).await });
        self.inner.tasks.lock().await.push(handle);
        info!(interval = ?self.inner.options.interval, "sync scheduler started");
    }

    /// Stop background tasks and wait for them. A pass already in flight is
    /// allowed to finish.
    pub async fn close(&self) {
        let _ = self.inner.shutdown.send(true);
        let handles: Vec<_> = self.inner.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(%err, "sync task ended abnormally");
                }
            }
        }
        info!("sync manager closed");
    }

    /// Periodically probe the remote authority and feed the answer into
    /// [`set_online`](Self::set_online).
    pub async fn spawn_connectivity_probe(&self, period: Duration) {
        let manager = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let online = manager.inner.remote.probe().await;
                        manager.set_online(online).await;
                    }
                }
            }
        });
        self.inner.tasks.lock().await.push(handle);
    }

    pub async fn is_online(&self) -> bool {
        self.inner.shared.lock().await.online
    }

    pub async fn set_online(&self, online: bool) {
        {
            let mut shared = self.inner.shared.lock().await;
            if shared.online == online {
                return;
            }
            shared.online = online;
            shared.retry_at = None;
            if online {
                shared.backoff.reset();
            }
        }
        self.inner.retry_changed.notify_one();
        self.emit(SyncEvent::ConnectivityChanged { online });
        if online {
            info!("connectivity restored");
            self.trigger(Trigger::ConnectivityRestored);
        } else {
            warn!("connectivity lost");
            self.set_state(SyncState::Idle).await;
        }
    }

    /// The host application came to the foreground.
    pub fn app_foregrounded(&self) {
        self.trigger(Trigger::Foreground);
    }

    /// A mutation was just queued.
    pub fn notify_enqueued(&self) {
        self.trigger(Trigger::Enqueued);
    }

    /// Ask the scheduler for a pass, even during backoff.
    pub fn request_sync(&self) {
        self.trigger(Trigger::Manual);
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let pending_count = self.inner.queue.count().await?;
        let shared = self.inner.shared.lock().await;
        Ok(SyncStatus {
            state: shared.state,
            online: shared.online,
            pending_count,
            is_syncing: shared.state == SyncState::Syncing,
            last_error: shared.last_error.clone(),
            last_sync_at: shared.last_sync_at,
            conflicts: shared.conflicts.clone(),
            backoff: shared.backoff.current(),
        })
    }

    pub async fn conflicts(&self) -> Vec<Conflict> {
        self.inner.shared.lock().await.conflicts.clone()
    }

    /// Whether `entity_id` was created locally and its create is in the
    /// conflict list. Later writes for it cannot be sent until resolved.
    pub async fn has_conflicted_create(&self, entity: EntityKind, entity_id: &str) -> bool {
        self.inner
            .shared
            .lock()
            .await
            .conflicts
            .iter()
            .any(|c| is_create_of(&c.item, entity, entity_id))
    }

    /// Put a conflicted mutation back into the queue with a fresh retry
    /// budget. It keeps its original position so it still precedes later
    /// writes for the same entity.
    pub async fn retry_conflict(&self, id: &str) -> Result<()> {
        self.requeue_conflict(id, None).await
    }

    /// Like [`retry_conflict`](Self::retry_conflict) with a replacement payload.
    pub async fn replace_conflict(&self, id: &str, payload: Value) -> Result<()> {
        self.requeue_conflict(id, Some(payload)).await
    }

    pub async fn discard_conflict(&self, id: &str) -> Result<Conflict> {
        let conflict = self.take_conflict(id).await?;
        info!(id, "conflict discarded");
        self.emit(SyncEvent::ConflictResolved { id: id.to_string() });
        Ok(conflict)
    }

    async fn requeue_conflict(&self, id: &str, payload: Option<Value>) -> Result<()> {
        let conflict = self.take_conflict(id).await?;
        let mut item = conflict.item;
        if let Some(payload) = payload {
            item.payload = payload;
        }
        item.retry_count = 0;
        item.last_error = None;
        if let Err(err) = self.inner.queue.enqueue(&item).await {
            self.inner.shared.lock().await.conflicts.push(Conflict {
                item,
                failed_at: conflict.failed_at,
            });
            return Err(err);
        }
        info!(id, "conflict re-enqueued");
        self.emit(SyncEvent::ConflictResolved { id: id.to_string() });
        self.request_sync();
        Ok(())
    }

    async fn take_conflict(&self, id: &str) -> Result<Conflict> {
        let mut shared = self.inner.shared.lock().await;
        let position = shared
            .conflicts
            .iter()
            .position(|c| c.item.id == id)
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))?;
        Ok(shared.conflicts.remove(position))
    }

    /// Run one pass now and report what happened. Waits for a pass already in
    /// flight instead of overlapping it.
    #[instrument(skip_all)]
    pub async fn sync_now(&self) -> Result<PassReport> {
        let _pass = self.inner.pass_lock.lock().await;
        match self.run_pass().await {
            Ok(report) => Ok(report),
            Err(err) => {
                error!(%err, "sync pass aborted");
                self.record_error(err.to_string()).await;
                self.set_state(SyncState::Idle).await;
                Err(err)
            }
        }
    }

    async fn run_pass(&self) -> Result<PassReport> {
        let mut report = PassReport::default();
        if !self.is_online().await {
            report.offline = true;
            return Ok(report);
        }

        let items = self.inner.queue.list_pending().await?;
        if items.is_empty() {
            let mut shared = self.inner.shared.lock().await;
            shared.retry_at = None;
            shared.backoff.reset();
            drop(shared);
            self.inner.retry_changed.notify_one();
            self.set_state(SyncState::Idle).await;
            trace!("queue empty; nothing to sync");
            return Ok(report);
        }

        self.set_state(SyncState::Syncing).await;
        debug!(pending = items.len(), "sync pass started");

        let mut blocked: HashSet<(EntityKind, Option<String>)> = HashSet::new();
        let mut held: HashSet<(EntityKind, Option<String>)> = self
            .inner
            .shared
            .lock()
            .await
            .conflicts
            .iter()
            .filter(|c| c.item.action == MutationAction::Create && c.item.entity_id.is_some())
            .map(|c| (c.item.entity, c.item.entity_id.clone()))
            .collect();
        let mut touched: HashSet<EntityKind> = HashSet::new();
        let mut failures: Vec<String> = Vec::new();

        for mut item in items {
            if !self.is_online().await {
                report.interrupted = true;
                break;
            }
            let key = (item.entity, item.entity_id.clone());
            if held.contains(&key) {
                report.held += 1;
                continue;
            }
            if blocked.contains(&key) {
                report.skipped += 1;
                continue;
            }
            report.attempted += 1;

            match dispatch::send(&self.inner.store, self.inner.remote.as_ref(), &item).await? {
                Ok(response) => {
                    self.inner.queue.remove(&item.id).await?;
                    dispatch::apply_success(
                        &self.inner.store,
                        &self.inner.queue,
                        &item,
                        &response,
                    )
                    .await?;
                    touched.insert(item.entity);
                    report.succeeded += 1;
                    debug!(
                        id = %item.id,
                        action = item.action.as_str(),
                        entity = item.entity.as_str(),
                        "mutation acknowledged"
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    blocked.insert(key.clone());
                    failures.push(format!("{} {}: {err}", item.action.as_str(), item.entity.as_str()));
                    if self.record_item_failure(&mut item, &err).await? {
                        report.conflicts += 1;
                        if item.action == MutationAction::Create && item.entity_id.is_some() {
                            held.insert(key);
                        }
                    }
                }
            }
        }

        self.finish_pass(&mut report, &touched, failures).await?;
        Ok(report)
    }

    /// Bump retry bookkeeping for a failed item; returns whether it moved to
    /// the conflict list.
    async fn record_item_failure(
        &self,
        item: &mut MutationQueueItem,
        err: &TransportError,
    ) -> Result<bool> {
        item.retry_count += 1;
        item.last_error = Some(err.to_string());

        let rejected = self.inner.options.client_errors_to_conflicts && err.is_client_rejection();
        if !rejected && item.retry_count < self.inner.options.max_retries {
            warn!(
                id = %item.id,
                retry_count = item.retry_count,
                %err,
                "mutation failed; will retry"
            );
            self.inner.queue.update(item).await?;
            return Ok(false);
        }

        self.inner.queue.remove(&item.id).await?;
        let conflict = Conflict {
            item: item.clone(),
            failed_at: Utc::now(),
        };
        if rejected {
            warn!(id = %item.id, %err, "mutation rejected; moved to conflicts");
        } else {
            let exhausted = Error::ConflictExceeded {
                id: item.id.clone(),
            };
            warn!(retry_count = item.retry_count, %err, "{exhausted}");
        }
        self.inner
            .shared
            .lock()
            .await
            .conflicts
            .push(conflict.clone());
        self.emit(SyncEvent::ConflictRaised(conflict));
        Ok(true)
    }

    async fn finish_pass(
        &self,
        report: &mut PassReport,
        touched: &HashSet<EntityKind>,
        failures: Vec<String>,
    ) -> Result<()> {
        for entity in touched {
            let base = format!("/{}", entity.remote_collection());
            self.inner.cache.invalidate_path(&base).await?;
            if *entity == EntityKind::User {
                self.inner.cache.invalidate_path("/me").await?;
            }
        }

        let now = Utc::now();
        self.inner.store.set_metadata(LAST_SYNC_AT_KEY, &now).await?;
        if failures.is_empty() {
            self.inner.store.delete_metadata(LAST_SYNC_ERROR_KEY).await?;
        } else {
            let message = failures.join("; ");
            self.inner
                .store
                .set_metadata(LAST_SYNC_ERROR_KEY, &message)
                .await?;
        }

        let online = self.is_online().await;
        let next_state = {
            let mut shared = self.inner.shared.lock().await;
            shared.last_sync_at = Some(now);
            shared.last_error = (!failures.is_empty()).then(|| failures.join("; "));
            if !online {
                shared.retry_at = None;
                SyncState::Idle
            } else if report.retained_failures() > 0 {
                let delay = shared.backoff.advance();
                shared.retry_at = Some(Instant::now() + delay);
                report.retry_in = Some(delay);
                SyncState::WaitingToRetry
            } else {
                if report.failed == 0 {
                    shared.backoff.reset();
                }
                shared.retry_at = None;
                SyncState::Idle
            }
        };
        self.inner.retry_changed.notify_one();
        self.set_state(next_state).await;

        if !failures.is_empty() {
            self.emit(SyncEvent::SyncError {
                message: failures.join("; "),
            });
        }
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            conflicts = report.conflicts,
            held = report.held,
            retry_in = ?report.retry_in,
            "sync pass completed"
        );
        self.emit(SyncEvent::PassCompleted(report.clone()));
        Ok(())
    }

    async fn record_error(&self, message: String) {
        if let Err(err) = self
            .inner
            .store
            .set_metadata(LAST_SYNC_ERROR_KEY, &message)
            .await
        {
            error!(%err, "failed to persist last sync error");
        }
        self.inner.shared.lock().await.last_error = Some(message.clone());
        self.emit(SyncEvent::SyncError { message });
    }

    async fn set_state(&self, state: SyncState) {
        let changed = {
            let mut shared = self.inner.shared.lock().await;
            let changed = shared.state != state;
            shared.state = state;
            changed
        };
        if changed {
            debug!(?state, "sync state changed");
            self.emit(SyncEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SyncEvent) {
        if self.inner.events.send(event).is_err() {
            trace!("no sync event subscribers");
        }
    }

    fn trigger(&self, trigger: Trigger) {
        if self.inner.triggers.try_send(trigger).is_err() {
            trace!(?trigger, "sync trigger dropped; scheduler busy or stopped");
        }
    }

    async fn run_scheduler(
        self,
        mut triggers: mpsc::Receiver<Trigger>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = self.inner.options.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let retry_at = self.inner.shared.lock().await.retry_at;
            let retry_timer = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if self.state().await != SyncState::WaitingToRetry {
                        self.scheduled_pass("periodic").await;
                    }
                }
                Some(trigger) = triggers.recv() => {
                    if trigger.overrides_backoff()
                        || self.state().await != SyncState::WaitingToRetry
                    {
                        self.scheduled_pass("trigger").await;
                    }
                }
                _ = self.inner.retry_changed.notified() => {
                    trace!("retry deadline changed");
                }
                _ = retry_timer => {
                    self.inner.shared.lock().await.retry_at = None;
                    self.scheduled_pass("backoff").await;
                }
            }
        }
        debug!("sync scheduler stopped");
    }

    async fn state(&self) -> SyncState {
        self.inner.shared.lock().await.state
    }

    async fn scheduled_pass(&self, reason: &'static str) {
        trace!(reason, "scheduled sync pass");
        if let Err(err) = self.sync_now().await {
            error!(%err, reason, "scheduled sync pass failed");
        }
    }
}

fn is_create_of(item: &MutationQueueItem, entity: EntityKind, entity_id: &str) -> bool {
    item.action == MutationAction::Create
        && item.entity == entity
        && item.entity_id.as_deref() == Some(entity_id)
}

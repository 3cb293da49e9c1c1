//! Top-level sync coordinator.
//!
//! A [`SyncOrchestrator`] is constructed explicitly by the host, initialized
//! once and shut down once. It owns every engine component, runs the
//! periodic drain and pull loop, coalesces overlapping sync requests into a
//! single pass and publishes [`SyncStats`] to subscribers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use crate::cache::Cache;
use crate::config::EngineConfig;
use crate::delta::{DeltaPuller, PullReport};
use crate::error::{Error, Result};
use crate::governor::{GovernorSnapshot, RequestGovernor};
use crate::models::{
    entity_cache_key, Collection, Entity, EntityId, Operation, OutboxItem, OutboxItemId,
    Payload, SyncStats,
};
use crate::outbox::{DrainReport, Outbox};
use crate::realtime::{ChannelState, Reconciler, ScopeSubscription};
use crate::remote::{RemoteService, Topic};
use crate::store::LocalStore;

/// Host-reported connectivity and lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
    Foreground,
    Background,
}

/// What one full pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub sent: usize,
    pub retried: usize,
    pub terminal: usize,
    pub pulls: Vec<PullReport>,
    pub errors: Vec<String>,
}

impl PassReport {
    fn record_drain(&mut self, drain: DrainReport) {
        self.sent += drain.sent;
        self.retried += drain.retried;
        self.terminal += drain.terminal;
    }

    /// Records merged by this pass's pulls.
    pub fn records_pulled(&self) -> usize {
        self.pulls.iter().map(|pull| pull.applied).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(PassReport),
    /// Folded into the pass already running
    Coalesced,
    /// Skipped, the host reported no connectivity
    Offline,
}

/// Handle for observing [`SyncStats`].
#[derive(Debug, Clone)]
pub struct StatsSubscription {
    rx: watch::Receiver<SyncStats>,
}

impl StatsSubscription {
    pub fn current(&self) -> SyncStats {
        self.rx.borrow().clone()
    }

    /// Wait for the next update. `None` once the orchestrator is gone.
    pub async fn changed(&mut self) -> Option<SyncStats> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

struct Inner {
    store: LocalStore,
    config: EngineConfig,
    governor: RequestGovernor,
    outbox: Outbox,
    delta: DeltaPuller,
    cache: Cache<Entity>,
    reconciler: Reconciler,
    stats: watch::Sender<SyncStats>,
    pass_lock: AsyncMutex<()>,
    rerun: AtomicBool,
    online: AtomicBool,
    paused: AtomicBool,
    shutdown: CancellationToken,
    scope: Mutex<Option<String>>,
    tasks: Mutex<Vec<AbortOnDropHandle<()>>>,
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    /// Build an engine over `store`. Fails if `config` does not validate.
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteService>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let governor = RequestGovernor::from_config(&config.governor);
        let outbox = Outbox::new(
            store.clone(),
            Arc::clone(&remote),
            governor.clone(),
            config.outbox.clone(),
        );
        let delta = DeltaPuller::new(
            store.clone(),
            Arc::clone(&remote),
            governor.clone(),
            config.delta.clone(),
        );
        let cache = Cache::new(
            Arc::clone(store.clock()),
            config.cache.default_ttl(),
            config.cache.stale_fraction,
        );
        let reconciler = Reconciler::new(store.clone(), remote, config.realtime.clone());
        let (stats, _) = watch::channel(SyncStats {
            online: true,
            ..SyncStats::default()
        });

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                config,
                governor,
                outbox,
                delta,
                cache,
                reconciler,
                stats,
                pass_lock: AsyncMutex::new(()),
                rerun: AtomicBool::new(false),
                online: AtomicBool::new(true),
                paused: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                scope: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Start the engine for `scope`.
    ///
    /// Recovers interrupted outbox items, starts the cache and background
    /// tasks, then runs a first pass with forced pulls.
    pub async fn initialize(&self, scope: Option<&str>) -> Result<SyncOutcome> {
        self.ensure_running()?;
        *self
            .inner
            .scope
            .lock()
            .map_err(|_| Error::lock_poisoned("orchestrator scope"))? = scope.map(str::to_string);

        self.inner.outbox.recover_in_flight()?;

        let cache = &self.inner.cache;
        let tasks = vec![
            cache.attach(&self.inner.store),
            cache.spawn_sweeper(self.inner.config.cache.sweep_interval()),
            self.spawn_realtime_monitor(),
            self.spawn_background_loop(),
        ];
        self.inner
            .tasks
            .lock()
            .map_err(|_| Error::lock_poisoned("orchestrator tasks"))?
            .extend(tasks);

        tracing::info!(scope, "Sync engine initialized");
        self.refresh_stats();
        self.run(true).await
    }

    /// Run a full pass now: drain the outbox, then pull every collection
    /// regardless of pull backoff.
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        self.ensure_running()?;
        self.run(true).await
    }

    /// Optimistically apply a local mutation and queue it for the remote.
    pub fn queue_operation(
        &self,
        collection: Collection,
        id: impl Into<EntityId>,
        operation: Operation,
        payload: Option<Payload>,
    ) -> Result<OutboxItem> {
        self.ensure_running()?;
        let item = self
            .inner
            .outbox
            .enqueue(collection, id.into(), operation, payload, true)?;
        self.refresh_stats();
        self.spawn_drain();
        Ok(item)
    }

    pub async fn handle_connectivity(&self, event: ConnectivityEvent) -> Result<SyncOutcome> {
        self.ensure_running()?;
        tracing::info!(?event, "Connectivity changed");
        match event {
            ConnectivityEvent::Offline => {
                self.inner.online.store(false, Ordering::SeqCst);
                self.update_stats(|stats| stats.online = false);
                Ok(SyncOutcome::Offline)
            }
            ConnectivityEvent::Background => {
                self.inner.paused.store(true, Ordering::SeqCst);
                Ok(SyncOutcome::Offline)
            }
            ConnectivityEvent::Online | ConnectivityEvent::Foreground => {
                if event == ConnectivityEvent::Online {
                    self.inner.online.store(true, Ordering::SeqCst);
                    self.update_stats(|stats| stats.online = true);
                }
                self.inner.paused.store(false, Ordering::SeqCst);
                self.inner.reconciler.revive_degraded();
                self.run(true).await
            }
        }
    }

    /// Read an entity through the cache.
    ///
    /// When the store read fails, a stale cached copy is served instead.
    pub fn get_entity(&self, collection: Collection, id: &EntityId) -> Result<Option<Entity>> {
        let key = entity_cache_key(collection, id);
        if let Some(entity) = self.inner.cache.get(&key) {
            return Ok(Some(entity));
        }

        match self.inner.store.get(collection, id) {
            Ok(Some(entity)) => {
                self.inner.cache.insert(key, entity.clone());
                Ok(Some(entity))
            }
            Ok(None) => Ok(None),
            Err(error) => match self.inner.cache.get_or_stale(&key) {
                Some((entity, freshness)) => {
                    tracing::warn!(%key, ?freshness, "Serving cached entity after store error: {error}");
                    Ok(Some(entity))
                }
                None => Err(error),
            },
        }
    }

    /// Receive realtime changes for one scope while the handle is alive.
    pub fn watch_scope(&self, collection: Collection, scope: Option<&str>) -> Result<ScopeSubscription> {
        self.ensure_running()?;
        Ok(self.inner.reconciler.subscribe(collection, scope))
    }

    pub fn failed_operations(&self) -> Result<Vec<OutboxItem>> {
        self.inner.outbox.failed()
    }

    pub fn retry_operation(&self, id: &OutboxItemId) -> Result<()> {
        self.inner.outbox.retry(id)?;
        self.refresh_stats();
        self.spawn_drain();
        Ok(())
    }

    pub fn dismiss_operation(&self, id: &OutboxItemId) -> Result<()> {
        self.inner.outbox.dismiss(id)?;
        self.refresh_stats();
        Ok(())
    }

    /// Wipe all local sync state, e.g. on logout.
    pub fn reset(&self) -> Result<()> {
        self.inner.store.reset()?;
        self.inner.cache.clear();
        let online = self.is_online();
        self.inner.stats.send_replace(SyncStats {
            online,
            ..SyncStats::default()
        });
        tracing::info!("Sync state reset");
        Ok(())
    }

    /// Stop background work and wait for a running pass to finish.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        drop(tasks);
        let _pass = self.inner.pass_lock.lock().await;
        tracing::info!("Sync engine shut down");
    }

    pub fn subscribe(&self) -> StatsSubscription {
        StatsSubscription {
            rx: self.inner.stats.subscribe(),
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.inner.stats.borrow().clone()
    }

    pub fn governor_snapshot(&self) -> GovernorSnapshot {
        self.inner.governor.snapshot()
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn outbox(&self) -> &Outbox {
        &self.inner.outbox
    }

    pub fn cache(&self) -> &Cache<Entity> {
        &self.inner.cache
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ShutDown);
        }
        Ok(())
    }

    /// Run passes until no request arrived mid-pass. A caller that finds a
    /// pass already running only leaves the rerun flag behind.
    async fn run(&self, force_pull: bool) -> Result<SyncOutcome> {
        if !self.is_online() {
            return Ok(SyncOutcome::Offline);
        }

        let Ok(guard) = self.inner.pass_lock.try_lock() else {
            self.inner.rerun.store(true, Ordering::SeqCst);
            tracing::debug!("Sync pass already running, coalescing request");
            return Ok(SyncOutcome::Coalesced);
        };

        let mut report = self.pass(force_pull).await;
        while self.inner.rerun.swap(false, Ordering::SeqCst) && self.is_online() {
            tracing::debug!("Running coalesced sync pass");
            report = self.pass(true).await;
        }
        drop(guard);
        Ok(SyncOutcome::Completed(report))
    }

    async fn pass(&self, force_pull: bool) -> PassReport {
        self.update_stats(|stats| stats.in_progress = true);
        let mut report = PassReport::default();

        match self.inner.outbox.drain().await {
            Ok(drain) => report.record_drain(drain),
            Err(error) => report.errors.push(format!("outbox: {error}")),
        }

        for (collection, scope) in self.pull_targets() {
            match self
                .inner
                .delta
                .pull(collection, scope.as_deref(), force_pull)
                .await
            {
                Ok(Some(pull)) => report.pulls.push(pull),
                Ok(None) => {}
                Err(error) => report.errors.push(format!("pull {collection}: {error}")),
            }
        }

        let now = self.inner.store.clock().now_ms();
        tracing::debug!(
            sent = report.sent,
            failed = report.retried + report.terminal,
            pulled = report.records_pulled(),
            "Sync pass finished"
        );
        self.update_stats(|stats| {
            stats.in_progress = false;
            stats.last_sync_at = Some(now);
            stats.items_synced += report.sent as u64;
            stats.items_failed += (report.retried + report.terminal) as u64;
            stats.records_pulled += report.records_pulled() as u64;
            stats.last_error = report.errors.last().cloned();
        });
        self.refresh_stats();
        report
    }

    /// Scoped collections pull within the initialized scope, the rest pull
    /// everything.
    fn pull_targets(&self) -> Vec<(Collection, Option<String>)> {
        let scope = self
            .inner
            .scope
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.inner
            .config
            .delta
            .collections
            .iter()
            .map(|&collection| {
                let target = if collection.is_scoped() {
                    scope.clone()
                } else {
                    None
                };
                (collection, target)
            })
            .collect()
    }

    async fn drain_once(&self) {
        match self.inner.outbox.drain().await {
            Ok(drain) => self.update_stats(|stats| {
                stats.items_synced += drain.sent as u64;
                stats.items_failed += drain.failed() as u64;
            }),
            Err(error) => {
                tracing::warn!("Outbox drain failed: {error}");
                self.update_stats(|stats| stats.last_error = Some(error.to_string()));
            }
        }
        self.refresh_stats();
    }

    fn spawn_drain(&self) {
        if !self.is_online() || tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            if let Some(orchestrator) = upgrade(&weak) {
                orchestrator.drain_once().await;
            }
        });
    }

    fn is_active(&self) -> bool {
        self.is_online()
            && !self.inner.paused.load(Ordering::SeqCst)
            && !self.inner.shutdown.is_cancelled()
    }

    fn spawn_background_loop(&self) -> AbortOnDropHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let drain_every = self.inner.config.outbox.drain_interval();
        let pull_every = self.inner.config.delta.interval();

        AbortOnDropHandle::new(tokio::spawn(async move {
            let mut drain_tick = ticker(drain_every);
            let mut pull_tick = ticker(pull_every);
            loop {
                let pull = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = drain_tick.tick() => false,
                    _ = pull_tick.tick() => true,
                };
                let Some(orchestrator) = upgrade(&weak) else {
                    return;
                };
                if !orchestrator.is_active() {
                    continue;
                }
                if pull {
                    if let Err(e) = orchestrator.run(false).await {
                        tracing::warn!("Scheduled sync pass failed: {e}");
                    }
                } else {
                    orchestrator.drain_once().await;
                }
            }
        }))
    }

    /// Mirror realtime degradation into the stats.
    fn spawn_realtime_monitor(&self) -> AbortOnDropHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let mut changes = self.inner.reconciler.state_changes();

        AbortOnDropHandle::new(tokio::spawn(async move {
            let mut degraded: HashSet<Topic> = HashSet::new();
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        match change.state {
                            ChannelState::Degraded => {
                                degraded.insert(change.topic);
                            }
                            ChannelState::Connected | ChannelState::Disconnected => {
                                degraded.remove(&change.topic);
                            }
                            ChannelState::Reconnecting { .. } => {}
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Realtime monitor lagged by {skipped} transitions");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
                let Some(orchestrator) = upgrade(&weak) else {
                    return;
                };
                let is_degraded = !degraded.is_empty();
                orchestrator.update_stats(|stats| stats.realtime_degraded = is_degraded);
            }
        }))
    }

    fn update_stats(&self, update: impl FnOnce(&mut SyncStats)) {
        self.inner.stats.send_modify(update);
    }

    /// Re-read counters that live in the store.
    fn refresh_stats(&self) {
        let counts = self
            .inner
            .outbox
            .pending_count()
            .and_then(|pending| Ok((pending, self.inner.outbox.failed_count()?)));
        match counts {
            Ok((pending, failed)) => self.update_stats(|stats| {
                stats.pending_count = pending as u64;
                stats.failed_count = failed as u64;
            }),
            Err(error) => tracing::warn!("Failed to read outbox counts: {error}"),
        }
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<SyncOrchestrator> {
    weak.upgrade().map(|inner| SyncOrchestrator { inner })
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

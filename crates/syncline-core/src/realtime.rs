//! Push-based change reconciliation.
//!
//! One [`ScopeSubscription`] per actively viewed scope. Its task keeps a
//! change stream open, applies incoming events idempotently to the local
//! store and reconnects with exponential backoff. After too many failed
//! reconnects the scope is [`ChannelState::Degraded`] until revived; delta
//! pulls keep the data eventually consistent in the meantime.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{broadcast, watch, Notify};
use tokio_util::task::AbortOnDropHandle;

use crate::backoff::Backoff;
use crate::config::RealtimeConfig;
use crate::db::WriteOutcome;
use crate::error::{RemoteError, Result};
use crate::models::{Collection, Entity};
use crate::remote::{ChangeEvent, ChangeKind, ChangeStream, ChannelId, RemoteService, Topic};
use crate::store::LocalStore;

/// Connection state of one scope's change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Reconnecting { attempt: u32 },
    Connected,
    /// Gave up reconnecting
    Degraded,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Connected => f.write_str("connected"),
            Self::Degraded => f.write_str("degraded"),
        }
    }
}

/// What to do after a channel failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    RetryAfter(Duration),
    GiveUp,
}

/// Reconnect bookkeeping, free of timers so it can be tested directly.
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    state: ChannelState,
    backoff: Backoff,
    max_attempts: u32,
}

impl ReconnectMachine {
    pub const fn new(backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            state: ChannelState::Disconnected,
            backoff,
            max_attempts,
        }
    }

    pub const fn state(&self) -> ChannelState {
        self.state
    }

    pub fn on_connected(&mut self) {
        self.state = ChannelState::Connected;
    }

    /// Record a failed connect or a dropped stream.
    pub fn on_error(&mut self) -> ReconnectAction {
        let attempt = match self.state {
            ChannelState::Reconnecting { attempt } => attempt + 1,
            ChannelState::Degraded => return ReconnectAction::GiveUp,
            ChannelState::Disconnected | ChannelState::Connected => 1,
        };

        if attempt > self.max_attempts {
            self.state = ChannelState::Degraded;
            return ReconnectAction::GiveUp;
        }

        self.state = ChannelState::Reconnecting { attempt };
        ReconnectAction::RetryAfter(self.backoff.delay_for(attempt - 1))
    }

    /// Start over after a revive.
    pub fn reset(&mut self) {
        self.state = ChannelState::Disconnected;
    }
}

/// How one change event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Local copy is equal or newer
    Duplicate,
    /// Delete of an id we never had
    Ignored,
}

/// A scope state transition, fanned out to observers such as the
/// orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub topic: Topic,
    pub state: ChannelState,
}

/// Applies change events and hands out scope subscriptions.
#[derive(Clone)]
pub struct Reconciler {
    store: LocalStore,
    remote: Arc<dyn RemoteService>,
    config: RealtimeConfig,
    applied: Arc<AtomicU64>,
    transitions: broadcast::Sender<StateChange>,
    revive_all: Arc<watch::Sender<u64>>,
}

impl Reconciler {
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteService>, config: RealtimeConfig) -> Self {
        let (transitions, _) = broadcast::channel(config.buffer.max(1));
        Self {
            store,
            remote,
            config,
            applied: Arc::new(AtomicU64::new(0)),
            transitions,
            revive_all: Arc::new(watch::channel(0).0),
        }
    }

    /// Events that changed local state since start.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.transitions.subscribe()
    }

    /// Revive every currently degraded subscription.
    pub fn revive_degraded(&self) {
        self.revive_all.send_modify(|generation| *generation += 1);
    }

    /// Merge one change event into the local store.
    pub fn apply(&self, event: ChangeEvent) -> Result<ApplyOutcome> {
        let collection = event.collection;
        let record = event.record;
        let is_delete = event.kind == ChangeKind::Delete || record.deleted;

        if let Some(local) = self.store.get_any(collection, &record.id)? {
            if local.updated_at > record.updated_at {
                tracing::trace!(collection = %collection, id = %record.id, "Skipped duplicate change event");
                return Ok(ApplyOutcome::Duplicate);
            }
        }

        let outcome = if is_delete {
            self.store
                .delete_at(collection, &record.id, record.updated_at)?
        } else {
            self.store.put(&Entity::new(
                collection,
                record.id,
                record.payload,
                record.updated_at,
            ))?
        };

        Ok(match outcome {
            WriteOutcome::Missing => ApplyOutcome::Ignored,
            outcome if outcome.is_applied() => {
                self.applied.fetch_add(1, Ordering::Relaxed);
                ApplyOutcome::Applied
            }
            _ => ApplyOutcome::Duplicate,
        })
    }

    /// Start receiving changes for `(collection, scope)`.
    ///
    /// Delivery stops as soon as the returned handle is dropped.
    pub fn subscribe(&self, collection: Collection, scope: Option<&str>) -> ScopeSubscription {
        let topic = Topic::new(collection, scope);
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        let gate = Arc::new(RwLock::new(true));
        let channel = Arc::new(Mutex::new(None));
        let revive = Arc::new(Notify::new());

        let worker = SubscriptionWorker {
            reconciler: self.clone(),
            topic: topic.clone(),
            gate: Arc::clone(&gate),
            channel: Arc::clone(&channel),
            state: state_tx,
            revive: Arc::clone(&revive),
        };
        let task = AbortOnDropHandle::new(tokio::spawn(worker.run()));
        tracing::debug!(topic = %topic, "Subscribed to realtime scope");

        ScopeSubscription {
            topic,
            remote: Arc::clone(&self.remote),
            transitions: self.transitions.clone(),
            gate,
            channel,
            state: state_rx,
            revive,
            task,
        }
    }
}

/// The stream a subscription currently holds. Whoever takes it out of the
/// slot releases it, so each channel is released exactly once.
type ChannelSlot = Arc<Mutex<Option<ChannelId>>>;

fn release_channel(remote: &dyn RemoteService, slot: &ChannelSlot, only: Option<ChannelId>) {
    let taken = {
        let mut held = slot.lock().unwrap_or_else(PoisonError::into_inner);
        match (*held, only) {
            (Some(current), Some(wanted)) if current != wanted => None,
            _ => held.take(),
        }
    };
    if let Some(channel) = taken {
        remote.unsubscribe(channel);
    }
}

/// Releases the worker's current channel when the stream ends or the task
/// is aborted.
struct ChannelGuard {
    remote: Arc<dyn RemoteService>,
    slot: ChannelSlot,
    channel: ChannelId,
}

impl ChannelGuard {
    fn hold(remote: Arc<dyn RemoteService>, slot: ChannelSlot, channel: ChannelId) -> Self {
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(channel);
        Self {
            remote,
            slot,
            channel,
        }
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        release_channel(self.remote.as_ref(), &self.slot, Some(self.channel));
    }
}

struct SubscriptionWorker {
    reconciler: Reconciler,
    topic: Topic,
    gate: Arc<RwLock<bool>>,
    channel: ChannelSlot,
    state: watch::Sender<ChannelState>,
    revive: Arc<Notify>,
}

impl SubscriptionWorker {
    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
        let _ = self.reconciler.transitions.send(StateChange {
            topic: self.topic.clone(),
            state,
        });
    }

    async fn run(self) {
        let config = &self.reconciler.config;
        let mut machine = ReconnectMachine::new(config.backoff(), config.max_reconnect_attempts);

        loop {
            let failure = self.connect_and_consume(&mut machine).await;
            let Some(failure) = failure else {
                return;
            };

            match machine.on_error() {
                ReconnectAction::RetryAfter(delay) => {
                    tracing::debug!(topic = %self.topic, retry_in = ?delay, "Realtime channel lost: {failure}");
                    self.set_state(machine.state());
                    tokio::time::sleep(delay).await;
                }
                ReconnectAction::GiveUp => {
                    tracing::info!(topic = %self.topic, "Realtime degraded after repeated failures: {failure}");
                    let mut revive_all = self.reconciler.revive_all.subscribe();
                    self.set_state(ChannelState::Degraded);
                    tokio::select! {
                        () = self.revive.notified() => {}
                        _ = revive_all.changed() => {}
                    }
                    tracing::info!(topic = %self.topic, "Reviving realtime scope");
                    machine.reset();
                    self.set_state(ChannelState::Disconnected);
                }
            }
        }
    }

    /// Returns the failure that ended the stream, or `None` once the
    /// subscription was closed.
    async fn connect_and_consume(&self, machine: &mut ReconnectMachine) -> Option<RemoteError> {
        let subscription = match self.reconciler.remote.subscribe(&self.topic).await {
            Ok(subscription) => subscription,
            Err(error) => return Some(error),
        };
        let _channel = ChannelGuard::hold(
            Arc::clone(&self.reconciler.remote),
            Arc::clone(&self.channel),
            subscription.channel,
        );
        let mut stream = subscription.stream;
        machine.on_connected();
        self.set_state(ChannelState::Connected);

        self.consume(&mut stream).await
    }

    async fn consume(&self, stream: &mut ChangeStream) -> Option<RemoteError> {
        loop {
            match stream.recv().await {
                Some(Ok(event)) => {
                    let gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
                    if !*gate {
                        return None;
                    }
                    if let Err(e) = self.reconciler.apply(event) {
                        tracing::warn!(topic = %self.topic, "Failed to apply change event: {e}");
                    }
                }
                Some(Err(error)) => return Some(error),
                None => {
                    return Some(RemoteError::ChannelDisconnected(
                        "stream closed by remote".to_string(),
                    ))
                }
            }
        }
    }
}

/// Live subscription to one scope. Dropping it stops delivery and releases
/// the remote channel.
pub struct ScopeSubscription {
    topic: Topic,
    remote: Arc<dyn RemoteService>,
    transitions: broadcast::Sender<StateChange>,
    gate: Arc<RwLock<bool>>,
    channel: ChannelSlot,
    state: watch::Receiver<ChannelState>,
    revive: Arc<Notify>,
    task: AbortOnDropHandle<()>,
}

impl ScopeSubscription {
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.state() == ChannelState::Degraded
    }

    /// Retry a degraded scope from scratch. No-op otherwise.
    pub fn revive(&self) {
        if self.is_degraded() {
            self.revive.notify_one();
        }
    }
}

impl Drop for ScopeSubscription {
    fn drop(&mut self) {
        // Waits for an in-progress apply, then blocks all further ones
        *self.gate.write().unwrap_or_else(PoisonError::into_inner) = false;
        self.task.abort();
        release_channel(self.remote.as_ref(), &self.channel, None);
        let _ = self.transitions.send(StateChange {
            topic: self.topic.clone(),
            state: ChannelState::Disconnected,
        });
        tracing::debug!(topic = %self.topic, "Unsubscribed from realtime scope");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::Payload;
    use crate::remote::{MemoryRemote, RemoteRecord};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn machine(max_attempts: u32) -> ReconnectMachine {
        ReconnectMachine::new(
            Backoff::new(Duration::from_secs(1), Duration::from_secs(5)),
            max_attempts,
        )
    }

    #[test]
    fn machine_backs_off_then_gives_up() {
        let mut machine = machine(3);
        assert_eq!(machine.state(), ChannelState::Disconnected);

        assert_eq!(
            machine.on_error(),
            ReconnectAction::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(machine.state(), ChannelState::Reconnecting { attempt: 1 });
        assert_eq!(
            machine.on_error(),
            ReconnectAction::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            machine.on_error(),
            ReconnectAction::RetryAfter(Duration::from_secs(4))
        );
        assert_eq!(machine.on_error(), ReconnectAction::GiveUp);
        assert_eq!(machine.state(), ChannelState::Degraded);
        assert_eq!(machine.on_error(), ReconnectAction::GiveUp);
    }

    #[test]
    fn machine_resets_attempts_after_connect() {
        let mut machine = machine(2);
        machine.on_error();
        machine.on_error();
        machine.on_connected();
        assert_eq!(machine.state(), ChannelState::Connected);
        assert_eq!(
            machine.on_error(),
            ReconnectAction::RetryAfter(Duration::from_secs(1))
        );

        machine.on_error();
        assert_eq!(machine.on_error(), ReconnectAction::GiveUp);
        machine.reset();
        assert_eq!(machine.state(), ChannelState::Disconnected);
    }

    fn setup() -> (LocalStore, Arc<MemoryRemote>, Reconciler) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = LocalStore::open_in_memory(clock).unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let reconciler = Reconciler::new(store.clone(), remote.clone(), RealtimeConfig::default());
        (store, remote, reconciler)
    }

    fn event(kind: ChangeKind, record: RemoteRecord) -> ChangeEvent {
        ChangeEvent {
            kind,
            collection: Collection::Messages,
            scope: Some("chat-1".to_string()),
            record,
        }
    }

    fn message(id: &str, text: &str, updated_at: i64) -> RemoteRecord {
        RemoteRecord::new(
            id,
            json!({ "text": text }).as_object().cloned().unwrap(),
            updated_at,
        )
    }

    async fn wait_for_state(sub: &ScopeSubscription, wanted: ChannelState) {
        let mut rx = sub.watch_state();
        rx.wait_for(|state| *state == wanted).await.unwrap();
    }

    #[tokio::test]
    async fn delete_of_unknown_id_is_noop() {
        let (store, _, reconciler) = setup();
        let outcome = reconciler
            .apply(event(ChangeKind::Delete, RemoteRecord::deleted("gone", 5)))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert!(store.get_any(Collection::Messages, &"gone".into()).unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_and_stale_events_are_skipped() {
        let (store, _, reconciler) = setup();
        let first = event(ChangeKind::Insert, message("m1", "hi", 10));

        assert_eq!(reconciler.apply(first.clone()).unwrap(), ApplyOutcome::Applied);
        assert_eq!(reconciler.apply(first).unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(
            reconciler
                .apply(event(ChangeKind::Update, message("m1", "older", 9)))
                .unwrap(),
            ApplyOutcome::Duplicate
        );
        let local = store.get(Collection::Messages, &"m1".into()).unwrap().unwrap();
        assert_eq!(local.payload["text"], "hi");
        assert_eq!(reconciler.applied_count(), 1);
    }

    #[tokio::test]
    async fn converges_regardless_of_arrival_order() {
        let older = event(ChangeKind::Insert, message("m1", "v1", 10));
        let newer = event(ChangeKind::Update, message("m1", "v2", 20));

        let mut finals = Vec::new();
        for order in [[older.clone(), newer.clone()], [newer, older]] {
            let (store, _, reconciler) = setup();
            for e in order {
                reconciler.apply(e).unwrap();
            }
            finals.push(store.get(Collection::Messages, &"m1".into()).unwrap());
        }
        assert_eq!(finals[0], finals[1]);
        assert_eq!(finals[0].as_ref().unwrap().payload["text"], "v2");
    }

    #[tokio::test]
    async fn same_timestamp_events_converge_regardless_of_arrival_order() {
        let left = event(ChangeKind::Update, message("m1", "left", 10));
        let right = event(ChangeKind::Update, message("m1", "right", 10));

        let mut finals = Vec::new();
        for order in [[left.clone(), right.clone()], [right, left]] {
            let (store, _, reconciler) = setup();
            for e in order {
                reconciler.apply(e).unwrap();
            }
            finals.push(store.get(Collection::Messages, &"m1".into()).unwrap());
        }
        assert_eq!(finals[0], finals[1]);
        assert_eq!(finals[0].as_ref().unwrap().payload["text"], "right");
    }

    #[tokio::test]
    async fn subscription_applies_pushed_changes() {
        let (store, remote, reconciler) = setup();
        let sub = reconciler.subscribe(Collection::Messages, Some("chat-1"));
        wait_for_state(&sub, ChannelState::Connected).await;

        remote.push(
            Collection::Messages,
            Some("chat-1"),
            ChangeKind::Insert,
            message("m1", "hello", 10),
        );
        remote.push(
            Collection::Messages,
            Some("chat-2"),
            ChangeKind::Insert,
            message("m2", "elsewhere", 10),
        );

        for _ in 0..50 {
            if store.get(Collection::Messages, &"m1".into()).unwrap().is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(store.get(Collection::Messages, &"m1".into()).unwrap().is_some());
        assert!(store.get(Collection::Messages, &"m2".into()).unwrap().is_none());
    }

    #[tokio::test]
    async fn dropping_subscription_stops_delivery_and_releases_channel() {
        let (store, remote, reconciler) = setup();
        let topic = Topic::new(Collection::Messages, Some("chat-1"));
        let sub = reconciler.subscribe(Collection::Messages, Some("chat-1"));
        wait_for_state(&sub, ChannelState::Connected).await;
        assert_eq!(remote.subscriber_count(&topic), 1);

        drop(sub);
        assert_eq!(remote.subscriber_count(&topic), 0);

        remote.push(
            Collection::Messages,
            Some("chat-1"),
            ChangeKind::Insert,
            message("m1", "late", 10),
        );
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(store.get(Collection::Messages, &"m1".into()).unwrap().is_none());
    }

    #[tokio::test]
    async fn dropping_one_subscription_keeps_sibling_on_same_scope() {
        let (store, remote, reconciler) = setup();
        let topic = Topic::new(Collection::Messages, Some("chat-1"));
        let first = reconciler.subscribe(Collection::Messages, Some("chat-1"));
        let second = reconciler.subscribe(Collection::Messages, Some("chat-1"));
        wait_for_state(&first, ChannelState::Connected).await;
        wait_for_state(&second, ChannelState::Connected).await;
        assert_eq!(remote.subscriber_count(&topic), 2);

        drop(first);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(remote.subscriber_count(&topic), 1);
        assert_eq!(remote.unsubscribe_calls(), 1);
        assert_eq!(second.state(), ChannelState::Connected);

        remote.push(
            Collection::Messages,
            Some("chat-1"),
            ChangeKind::Insert,
            message("m1", "still here", 10),
        );
        for _ in 0..50 {
            if store.get(Collection::Messages, &"m1".into()).unwrap().is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(store.get(Collection::Messages, &"m1".into()).unwrap().is_some());
    }

    #[tokio::test]
    async fn resubscribing_right_after_drop_keeps_new_channel() {
        let (_, remote, reconciler) = setup();
        let topic = Topic::new(Collection::Messages, Some("chat-1"));
        let old = reconciler.subscribe(Collection::Messages, Some("chat-1"));
        wait_for_state(&old, ChannelState::Connected).await;

        drop(old);
        let new = reconciler.subscribe(Collection::Messages, Some("chat-1"));
        wait_for_state(&new, ChannelState::Connected).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(remote.subscriber_count(&topic), 1);
        assert_eq!(new.state(), ChannelState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_stream_error() {
        let (_, remote, reconciler) = setup();
        let topic = Topic::new(Collection::Messages, Some("chat-1"));
        let sub = reconciler.subscribe(Collection::Messages, Some("chat-1"));
        wait_for_state(&sub, ChannelState::Connected).await;

        remote.disconnect(&topic);
        wait_for_state(&sub, ChannelState::Reconnecting { attempt: 1 }).await;
        wait_for_state(&sub, ChannelState::Connected).await;
        assert_eq!(remote.subscribe_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn degrades_after_max_attempts_and_revives() {
        let (_, remote, reconciler) = setup();
        let mut transitions = reconciler.state_changes();
        remote.set_online(false);

        let sub = reconciler.subscribe(Collection::Messages, Some("chat-1"));
        wait_for_state(&sub, ChannelState::Degraded).await;
        assert!(sub.is_degraded());

        let mut saw_degraded = false;
        while let Ok(change) = transitions.try_recv() {
            saw_degraded |= change.state == ChannelState::Degraded;
        }
        assert!(saw_degraded);

        remote.set_online(true);
        sub.revive();
        wait_for_state(&sub, ChannelState::Connected).await;
    }

    #[tokio::test]
    async fn tombstone_event_without_delete_kind_still_deletes() {
        let (store, _, reconciler) = setup();
        store
            .put(&Entity::new(Collection::Messages, "m1", Payload::new(), 10))
            .unwrap();
        let outcome = reconciler
            .apply(event(ChangeKind::Update, RemoteRecord::deleted("m1", 11)))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert!(store.get(Collection::Messages, &"m1".into()).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_setup_retries_with_a_single_open_channel() {
        let (_, remote, reconciler) = setup();
        let topic = Topic::new(Collection::Notes, None);
        remote.fail_next(2, RemoteError::Timeout);

        let sub = reconciler.subscribe(Collection::Notes, None);
        wait_for_state(&sub, ChannelState::Connected).await;

        assert_eq!(remote.subscribe_calls(), 1);
        assert_eq!(remote.subscriber_count(&topic), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn revive_degraded_restarts_every_degraded_scope() {
        let (_, remote, reconciler) = setup();
        remote.set_online(false);
        let first = reconciler.subscribe(Collection::Notes, None);
        let second = reconciler.subscribe(Collection::Messages, Some("chat-1"));
        wait_for_state(&first, ChannelState::Degraded).await;
        wait_for_state(&second, ChannelState::Degraded).await;

        remote.set_online(true);
        reconciler.revive_degraded();
        wait_for_state(&first, ChannelState::Connected).await;
        wait_for_state(&second, ChannelState::Connected).await;
    }
}

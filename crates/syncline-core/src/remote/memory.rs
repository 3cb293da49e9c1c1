//! In-process remote backend.
//!
//! Keeps records per collection, logs every applied mutation in order and
//! fans changes out to subscribers. Failures, latency and connectivity can
//! be scripted, which makes it the remote double for engine tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    Ack, ChangeEvent, ChangeKind, ChannelId, RemoteMutation, RemoteOperation, RemoteRecord,
    RemoteService, Subscription, Topic,
};
use crate::error::RemoteError;
use crate::models::{Collection, EntityId};

const STREAM_BUFFER: usize = 256;

#[derive(Debug, Clone)]
struct StoredRecord {
    scope: Option<String>,
    record: RemoteRecord,
}

struct Subscriber {
    channel: ChannelId,
    topic: Topic,
    sender: mpsc::Sender<Result<ChangeEvent, RemoteError>>,
}

#[derive(Default)]
struct RemoteState {
    online: bool,
    delay: Duration,
    records: HashMap<Collection, BTreeMap<EntityId, StoredRecord>>,
    applied: Vec<RemoteMutation>,
    fetches: Vec<(Collection, i64, Option<String>)>,
    injected: VecDeque<RemoteError>,
    subscribers: Vec<Subscriber>,
    subscribe_calls: usize,
    unsubscribe_calls: usize,
    next_channel: u64,
}

/// Scripted in-memory [`RemoteService`].
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

struct CallGuard<'a>(&'a MemoryRemote);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryRemote {
    /// An empty, online remote.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState {
                online: true,
                ..RemoteState::default()
            }),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Toggle connectivity. Going offline errors and closes open streams.
    pub fn set_online(&self, online: bool) {
        let mut state = self.state();
        state.online = online;
        if !online {
            for subscriber in state.subscribers.drain(..) {
                let _ = subscriber.sender.try_send(Err(RemoteError::ChannelDisconnected(
                    "remote went offline".to_string(),
                )));
            }
        }
    }

    pub fn is_online(&self) -> bool {
        self.state().online
    }

    /// Add latency to every call.
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = delay;
    }

    /// Fail the next `count` fetch/apply/subscribe calls with `error`.
    pub fn fail_next(&self, count: usize, error: RemoteError) {
        let mut state = self.state();
        for _ in 0..count {
            state.injected.push_back(error.clone());
        }
    }

    /// Store a record without notifying anyone.
    pub fn seed(&self, collection: Collection, scope: Option<&str>, record: RemoteRecord) {
        store_record(&mut self.state(), collection, scope, record);
    }

    /// Simulate a change made by another client: store it and notify
    /// subscribers.
    pub fn push(
        &self,
        collection: Collection,
        scope: Option<&str>,
        kind: ChangeKind,
        record: RemoteRecord,
    ) {
        let mut state = self.state();
        notify(&mut state, collection, scope, kind, &record);
        store_record(&mut state, collection, scope, record);
    }

    /// Send a channel error to every stream on `topic` and close them.
    pub fn disconnect(&self, topic: &Topic) {
        let mut state = self.state();
        state.subscribers.retain(|subscriber| {
            if &subscriber.topic == topic {
                let _ = subscriber.sender.try_send(Err(RemoteError::ChannelDisconnected(
                    "stream reset by remote".to_string(),
                )));
                false
            } else {
                true
            }
        });
    }

    /// Mutations applied so far, in application order.
    pub fn applied(&self) -> Vec<RemoteMutation> {
        self.state().applied.clone()
    }

    /// `(collection, since, scope)` of every fetch, in call order.
    pub fn fetches(&self) -> Vec<(Collection, i64, Option<String>)> {
        self.state().fetches.clone()
    }

    /// Stored records of `collection`, tombstones included.
    pub fn records(&self, collection: Collection) -> Vec<RemoteRecord> {
        self.state()
            .records
            .get(&collection)
            .map(|records| records.values().map(|stored| stored.record.clone()).collect())
            .unwrap_or_default()
    }

    /// Open streams for `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.state()
            .subscribers
            .iter()
            .filter(|subscriber| &subscriber.topic == topic && !subscriber.sender.is_closed())
            .count()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }

    /// Calls to [`RemoteService::unsubscribe`], including ones for channels
    /// already gone.
    pub fn unsubscribe_calls(&self) -> usize {
        self.state().unsubscribe_calls
    }

    /// Highest number of calls observed in progress at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn begin_call(&self) -> Result<CallGuard<'_>, RemoteError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let guard = CallGuard(self);

        let delay = self.state().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if !state.online {
            return Err(RemoteError::Network("remote unreachable".to_string()));
        }
        if let Some(error) = state.injected.pop_front() {
            return Err(error);
        }
        Ok(guard)
    }
}

fn store_record(
    state: &mut RemoteState,
    collection: Collection,
    scope: Option<&str>,
    record: RemoteRecord,
) {
    state.records.entry(collection).or_default().insert(
        record.id.clone(),
        StoredRecord {
            scope: scope.map(str::to_string),
            record,
        },
    );
}

fn notify(
    state: &mut RemoteState,
    collection: Collection,
    scope: Option<&str>,
    kind: ChangeKind,
    record: &RemoteRecord,
) {
    state.subscribers.retain(|subscriber| {
        if subscriber.sender.is_closed() {
            return false;
        }
        if subscriber.topic.matches(collection, scope) {
            let _ = subscriber.sender.try_send(Ok(ChangeEvent {
                kind,
                collection,
                scope: scope.map(str::to_string),
                record: record.clone(),
            }));
        }
        true
    });
}

#[async_trait]
impl RemoteService for MemoryRemote {
    async fn fetch(
        &self,
        collection: Collection,
        since: i64,
        scope: Option<&str>,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        let _call = self.begin_call().await?;
        let mut state = self.state();
        state
            .fetches
            .push((collection, since, scope.map(str::to_string)));

        let mut records: Vec<RemoteRecord> = state
            .records
            .get(&collection)
            .map(|records| {
                records
                    .values()
                    .filter(|stored| stored.record.updated_at >= since)
                    .filter(|stored| scope.is_none() || stored.scope.as_deref() == scope)
                    .map(|stored| stored.record.clone())
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn apply(&self, mutation: &RemoteMutation) -> Result<Ack, RemoteError> {
        let _call = self.begin_call().await?;
        let mut state = self.state();
        state.applied.push(mutation.clone());

        let existing = state
            .records
            .get(&mutation.collection)
            .and_then(|records| records.get(&mutation.id))
            .cloned();
        let scope = existing.as_ref().and_then(|stored| stored.scope.clone());

        let (record, kind) = match mutation.operation {
            RemoteOperation::Delete => (
                RemoteRecord::deleted(mutation.id.clone(), mutation.updated_at),
                ChangeKind::Delete,
            ),
            operation => (
                RemoteRecord::new(
                    mutation.id.clone(),
                    mutation.payload.clone().unwrap_or_default(),
                    mutation.updated_at,
                ),
                if operation == RemoteOperation::Insert && existing.is_none() {
                    ChangeKind::Insert
                } else {
                    ChangeKind::Update
                },
            ),
        };

        notify(
            &mut state,
            mutation.collection,
            scope.as_deref(),
            kind,
            &record,
        );
        store_record(&mut state, mutation.collection, scope.as_deref(), record);

        Ok(Ack {
            id: mutation.id.clone(),
            updated_at: mutation.updated_at,
        })
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, RemoteError> {
        let _call = self.begin_call().await?;
        let (sender, stream) = mpsc::channel(STREAM_BUFFER);
        let mut state = self.state();
        state.subscribe_calls += 1;
        state.next_channel += 1;
        let channel = ChannelId(state.next_channel);
        state.subscribers.push(Subscriber {
            channel,
            topic: topic.clone(),
            sender,
        });
        Ok(Subscription { channel, stream })
    }

    fn unsubscribe(&self, channel: ChannelId) {
        let mut state = self.state();
        state.unsubscribe_calls += 1;
        state
            .subscribers
            .retain(|subscriber| subscriber.channel != channel);
    }
}

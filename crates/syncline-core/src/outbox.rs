//! Durable queue of local mutations awaiting remote confirmation.
//!
//! Items move `PENDING -> IN_FLIGHT -> {removed | PENDING (retry) |
//! FAILED_TERMINAL}`. Only the oldest non-terminal item of an entity is ever
//! sent, so replay is FIFO per entity while different entities and
//! collections drain independently.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;

use crate::clock::duration_ms;
use crate::config::OutboxConfig;
use crate::db::{
    EntityRepository, MetadataRepository, OutboxRepository, SqliteEntityRepository,
    SqliteMetadataRepository, SqliteOutboxRepository,
};
use crate::error::{Error, RemoteError, Result};
use crate::governor::{Priority, RequestGovernor};
use crate::models::{
    Collection, Entity, EntityId, Operation, OutboxItem, OutboxItemId, OutboxStatus, Payload,
};
use crate::remote::{Ack, RemoteMutation, RemoteService};
use crate::store::LocalStore;

/// Totals for one [`Outbox::drain`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Confirmed by the remote and removed
    pub sent: usize,
    /// Failed and rescheduled
    pub retried: usize,
    /// Moved to `FAILED_TERMINAL`
    pub terminal: usize,
}

impl DrainReport {
    pub const fn failed(&self) -> usize {
        self.retried + self.terminal
    }
}

enum Delivery {
    Sent,
    Retried,
    Terminal,
}

#[derive(Clone)]
pub struct Outbox {
    store: LocalStore,
    remote: Arc<dyn RemoteService>,
    governor: RequestGovernor,
    config: OutboxConfig,
    queue: OutboxQueue,
    drain_lock: Arc<AsyncMutex<()>>,
}

impl Outbox {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteService>,
        governor: RequestGovernor,
        config: OutboxConfig,
    ) -> Self {
        Self {
            queue: OutboxQueue::new(store.clone()),
            store,
            remote,
            governor,
            config,
            drain_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Apply a mutation locally and queue it for the remote, atomically.
    ///
    /// The local write is stamped with the current time, bumped past the
    /// stored `updated_at` if needed so it never loses to its own previous
    /// version.
    pub fn enqueue(
        &self,
        collection: Collection,
        entity_id: EntityId,
        operation: Operation,
        payload: Option<Payload>,
        interactive: bool,
    ) -> Result<OutboxItem> {
        if operation != Operation::Delete && payload.is_none() {
            return Err(Error::InvalidInput(format!(
                "{operation} on {collection}/{entity_id} requires a payload"
            )));
        }

        let now = self.store.clock().now_ms();
        let (item, written, outcome) = self.store.transaction(|tx| {
            let entities = SqliteEntityRepository::new(tx);
            let updated_at = entities
                .get_any(collection, &entity_id)?
                .map_or(now, |stored| now.max(stored.updated_at + 1));

            let (written, outcome) = match (operation, &payload) {
                (Operation::Delete, _) => {
                    let tombstone = Entity::tombstone(collection, entity_id.clone(), updated_at);
                    let outcome = entities.delete(collection, &entity_id, updated_at, now)?;
                    (tombstone, outcome)
                }
                (_, payload) => {
                    let entity = Entity::new(
                        collection,
                        entity_id.clone(),
                        payload.clone().unwrap_or_default(),
                        updated_at,
                    );
                    let outcome = entities.upsert(&entity, now)?;
                    (entity, outcome)
                }
            };

            let item = SqliteOutboxRepository::new(tx).insert(&OutboxItem {
                id: OutboxItemId::new(),
                seq: 0,
                collection,
                entity_id: entity_id.clone(),
                operation,
                payload: payload.clone(),
                updated_at,
                status: OutboxStatus::Pending,
                retry_count: 0,
                last_error: None,
                created_at: now,
                next_attempt_at: now,
                interactive,
            })?;
            Ok((item, written, outcome))
        })?;

        tracing::debug!(
            item = %item.id,
            collection = %collection,
            entity = %item.entity_id,
            operation = %operation,
            "Queued local mutation"
        );
        self.store.publish_write(&written, outcome);
        Ok(item)
    }

    /// Send every due item, round after round, until nothing is due.
    ///
    /// Concurrent calls are serialized. Per-item failures are recorded on
    /// the item and never abort the drain.
    pub async fn drain(&self) -> Result<DrainReport> {
        let _draining = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        loop {
            let batch = self.claim_due()?;
            if batch.is_empty() {
                break;
            }
            tracing::debug!("Draining {} outbox items", batch.len());

            let mut claimed: HashMap<OutboxItemId, OutboxItem> = HashMap::new();
            let mut sends = JoinSet::new();
            for item in batch {
                claimed.insert(item.id, item.clone());
                let outbox = self.clone();
                sends.spawn(async move {
                    let id = item.id;
                    (id, outbox.deliver(item).await)
                });
            }

            while let Some(joined) = sends.join_next().await {
                let (id, delivered) = match joined {
                    Ok(joined) => joined,
                    Err(e) => {
                        tracing::error!("Outbox send task failed: {e}");
                        continue;
                    }
                };
                let Some(item) = claimed.remove(&id) else {
                    continue;
                };
                match delivered {
                    Ok(Delivery::Sent) => report.sent += 1,
                    Ok(Delivery::Retried) => report.retried += 1,
                    Ok(Delivery::Terminal) => report.terminal += 1,
                    Err(e) => {
                        tracing::error!(item = %item.id, "Outbox bookkeeping failed: {e}");
                        self.release_claim(&item, &e.to_string());
                        report.retried += 1;
                    }
                }
            }

            // Tasks that died without reporting back
            for item in claimed.into_values() {
                self.release_claim(&item, "send task aborted");
                report.retried += 1;
            }
        }

        if report != DrainReport::default() {
            tracing::debug!(
                sent = report.sent,
                retried = report.retried,
                terminal = report.terminal,
                "Outbox drain finished"
            );
        }
        Ok(report)
    }

    /// Put a claimed item back to `PENDING` with a backoff so its entity's
    /// queue keeps moving without a restart.
    fn release_claim(&self, item: &OutboxItem, reason: &str) {
        let delay = self.config.backoff().delay_for(item.retry_count);
        let next_attempt_at = self
            .store
            .clock()
            .now_ms()
            .saturating_add(duration_ms(delay));
        let released = self.store.transaction(|tx| {
            SqliteOutboxRepository::new(tx).schedule_retry(&item.id, reason, next_attempt_at)
        });
        match released {
            Ok(()) => tracing::warn!(item = %item.id, retry_in = ?delay, "Requeued outbox item: {reason}"),
            Err(e) => tracing::error!(item = %item.id, "Failed to requeue outbox item: {e}"),
        }
    }

    /// Mark the current heads of every collection in flight and return them.
    fn claim_due(&self) -> Result<Vec<OutboxItem>> {
        let now = self.store.clock().now_ms();
        let batch_size = self.config.batch_size;
        self.store.transaction(|tx| {
            let repo = SqliteOutboxRepository::new(tx);
            let mut claimed = Vec::new();
            for collection in Collection::ALL {
                for item in repo.due_heads(collection, now, batch_size)? {
                    repo.mark_in_flight(&item.id)?;
                    claimed.push(item);
                }
            }
            Ok(claimed)
        })
    }

    async fn deliver(&self, item: OutboxItem) -> Result<Delivery> {
        let mutation = RemoteMutation {
            collection: item.collection,
            operation: item.operation.into(),
            id: item.entity_id.clone(),
            payload: item.payload.clone(),
            updated_at: item.updated_at,
        };
        let priority = if item.interactive {
            Priority::Interactive
        } else {
            Priority::Background
        };

        let remote = Arc::clone(&self.remote);
        let result = self
            .governor
            .execute(&format!("push:{}", item.id), priority, || async move {
                remote.apply(&mutation).await
            })
            .await;

        match result {
            Ok(ack) => {
                self.confirm(&item, &ack)?;
                tracing::trace!(item = %item.id, "Outbox item confirmed");
                Ok(Delivery::Sent)
            }
            Err(error) => self.record_failure(&item, &error),
        }
    }

    fn confirm(&self, item: &OutboxItem, ack: &Ack) -> Result<()> {
        let now = self.store.clock().now_ms();
        let restamped = self.store.transaction(|tx| {
            SqliteOutboxRepository::new(tx).remove(&item.id)?;
            SqliteMetadataRepository::new(tx).bump_local_version(item.collection)?;

            // Adopt the remote timestamp unless the entity changed again locally
            let entities = SqliteEntityRepository::new(tx);
            match entities.get_any(item.collection, &item.entity_id)? {
                Some(mut entity)
                    if entity.updated_at == item.updated_at && ack.updated_at > entity.updated_at =>
                {
                    entity.updated_at = ack.updated_at;
                    let outcome = entities.upsert(&entity, now)?;
                    Ok(Some((entity, outcome)))
                }
                _ => Ok(None),
            }
        })?;

        if let Some((entity, outcome)) = restamped {
            self.store.publish_write(&entity, outcome);
        }
        Ok(())
    }

    fn record_failure(&self, item: &OutboxItem, error: &RemoteError) -> Result<Delivery> {
        let attempts = item.retry_count + 1;
        let message = error.to_string();

        if !error.is_retryable() || attempts >= self.config.max_retry_attempts {
            self.store
                .transaction(|tx| SqliteOutboxRepository::new(tx).mark_failed(&item.id, &message))?;
            tracing::warn!(
                item = %item.id,
                entity = %item.entity_id,
                attempts,
                "Outbox item failed permanently: {message}"
            );
            return Ok(Delivery::Terminal);
        }

        let delay = self.config.backoff().delay_for(item.retry_count);
        let next_attempt_at = self
            .store
            .clock()
            .now_ms()
            .saturating_add(duration_ms(delay));
        self.store.transaction(|tx| {
            SqliteOutboxRepository::new(tx).schedule_retry(&item.id, &message, next_attempt_at)
        })?;
        tracing::warn!(
            item = %item.id,
            attempts,
            retry_in = ?delay,
            "Outbox item failed, will retry: {message}"
        );
        Ok(Delivery::Retried)
    }

    /// Store-only queue administration.
    pub const fn queue(&self) -> &OutboxQueue {
        &self.queue
    }

    pub fn recover_in_flight(&self) -> Result<usize> {
        self.queue.recover_in_flight()
    }

    pub fn get(&self, id: &OutboxItemId) -> Result<Option<OutboxItem>> {
        self.queue.get(id)
    }

    pub fn items(&self) -> Result<Vec<OutboxItem>> {
        self.queue.items()
    }

    pub fn failed(&self) -> Result<Vec<OutboxItem>> {
        self.queue.failed()
    }

    pub fn retry(&self, id: &OutboxItemId) -> Result<()> {
        self.queue.retry(id)
    }

    pub fn dismiss(&self, id: &OutboxItemId) -> Result<()> {
        self.queue.dismiss(id)
    }

    pub fn resolve(&self, prefix: &str) -> Result<OutboxItem> {
        self.queue.resolve(prefix)
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.queue.pending_count()
    }

    pub fn failed_count(&self) -> Result<usize> {
        self.queue.failed_count()
    }

    pub fn next_retry_at(&self) -> Result<Option<i64>> {
        self.queue.next_retry_at()
    }

    pub const fn config(&self) -> &OutboxConfig {
        &self.config
    }
}

/// Read and administer queued items without a remote, e.g. from an
/// operator tool.
#[derive(Clone)]
pub struct OutboxQueue {
    store: LocalStore,
}

impl OutboxQueue {
    pub const fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Return items left `IN_FLIGHT` by a crash to `PENDING`.
    pub fn recover_in_flight(&self) -> Result<usize> {
        let recovered =
            self.store
                .transaction(|tx| SqliteOutboxRepository::new(tx).recover_in_flight())?;
        if recovered > 0 {
            tracing::info!("Recovered {recovered} in-flight outbox items");
        }
        Ok(recovered)
    }

    pub fn get(&self, id: &OutboxItemId) -> Result<Option<OutboxItem>> {
        self.store
            .transaction(|tx| SqliteOutboxRepository::new(tx).get(id))
    }

    /// Every queued item in replay order, terminal ones included.
    pub fn items(&self) -> Result<Vec<OutboxItem>> {
        self.store
            .transaction(|tx| SqliteOutboxRepository::new(tx).list(None))
    }

    /// Terminal items waiting for the user.
    pub fn failed(&self) -> Result<Vec<OutboxItem>> {
        self.store.transaction(|tx| {
            SqliteOutboxRepository::new(tx).list(Some(OutboxStatus::Failed))
        })
    }

    /// Give a terminal item a fresh set of attempts.
    pub fn retry(&self, id: &OutboxItemId) -> Result<()> {
        let now = self.store.clock().now_ms();
        self.store
            .transaction(|tx| SqliteOutboxRepository::new(tx).requeue(id, now))?;
        tracing::info!(item = %id, "Requeued failed outbox item");
        Ok(())
    }

    /// Discard a terminal item. Non-terminal items cannot be dismissed.
    pub fn dismiss(&self, id: &OutboxItemId) -> Result<()> {
        self.store.transaction(|tx| {
            let repo = SqliteOutboxRepository::new(tx);
            let item = repo
                .get(id)?
                .ok_or_else(|| Error::NotFound(format!("outbox item {id}")))?;
            if !item.is_terminal() {
                return Err(Error::InvalidInput(format!(
                    "outbox item {id} is {} and cannot be dismissed",
                    item.status
                )));
            }
            repo.remove(id)?;
            Ok(())
        })?;
        tracing::info!(item = %id, "Dismissed failed outbox item");
        Ok(())
    }

    /// Resolve a full id or unique id prefix.
    pub fn resolve(&self, prefix: &str) -> Result<OutboxItem> {
        let mut matches = self
            .store
            .transaction(|tx| SqliteOutboxRepository::new(tx).find_by_prefix(prefix))?;
        match matches.len() {
            0 => Err(Error::NotFound(format!("outbox item {prefix}"))),
            1 => Ok(matches.remove(0)),
            n => Err(Error::InvalidInput(format!(
                "outbox id prefix '{prefix}' is ambiguous ({n} matches)"
            ))),
        }
    }

    /// Items not yet confirmed and not terminal.
    pub fn pending_count(&self) -> Result<usize> {
        self.store.transaction(|tx| {
            let repo = SqliteOutboxRepository::new(tx);
            Ok(repo.count(OutboxStatus::Pending)? + repo.count(OutboxStatus::InFlight)?)
        })
    }

    pub fn failed_count(&self) -> Result<usize> {
        self.store
            .transaction(|tx| SqliteOutboxRepository::new(tx).count(OutboxStatus::Failed))
    }

    /// Earliest `next_attempt_at` among pending items.
    pub fn next_retry_at(&self) -> Result<Option<i64>> {
        self.store
            .transaction(|tx| SqliteOutboxRepository::new(tx).next_attempt_at())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::remote::{MemoryRemote, RemoteOperation};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        clock: Arc<ManualClock>,
        store: LocalStore,
        remote: Arc<MemoryRemote>,
        outbox: Outbox,
    }

    fn harness(config: OutboxConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = LocalStore::open_in_memory(clock.clone()).unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let outbox = Outbox::new(
            store.clone(),
            remote.clone(),
            RequestGovernor::new(4, Duration::from_secs(5)),
            config,
        );
        Harness {
            clock,
            store,
            remote,
            outbox,
        }
    }

    fn payload(title: &str) -> Option<Payload> {
        json!({ "title": title }).as_object().cloned()
    }

    #[tokio::test]
    async fn enqueue_writes_locally_and_queues() {
        let h = harness(OutboxConfig::default());
        let item = h
            .outbox
            .enqueue(
                Collection::Notes,
                "n1".into(),
                Operation::Create,
                payload("a"),
                true,
            )
            .unwrap();

        assert_eq!(item.status, OutboxStatus::Pending);
        assert_eq!(item.updated_at, 10_000);
        let local = h.store.get(Collection::Notes, &"n1".into()).unwrap().unwrap();
        assert_eq!(local.payload, payload("a").unwrap());
        assert_eq!(h.outbox.pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn enqueue_rejects_missing_payload() {
        let h = harness(OutboxConfig::default());
        let error = h
            .outbox
            .enqueue(Collection::Notes, "n1".into(), Operation::Update, None, false)
            .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
        assert_eq!(h.outbox.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn same_millisecond_edits_keep_increasing_timestamps() {
        let h = harness(OutboxConfig::default());
        let create = h
            .outbox
            .enqueue(Collection::Notes, "n1".into(), Operation::Create, payload("a"), false)
            .unwrap();
        let update = h
            .outbox
            .enqueue(Collection::Notes, "n1".into(), Operation::Update, payload("b"), false)
            .unwrap();

        assert!(update.updated_at > create.updated_at);
        let local = h.store.get(Collection::Notes, &"n1".into()).unwrap().unwrap();
        assert_eq!(local.payload, payload("b").unwrap());
    }

    #[tokio::test]
    async fn drain_replays_fifo_per_entity() {
        let h = harness(OutboxConfig::default());
        h.outbox
            .enqueue(Collection::Notes, "n1".into(), Operation::Create, payload("a"), false)
            .unwrap();
        h.outbox
            .enqueue(Collection::Notes, "n1".into(), Operation::Update, payload("b"), false)
            .unwrap();
        h.outbox
            .enqueue(Collection::Notes, "n1".into(), Operation::Delete, None, false)
            .unwrap();
        h.outbox
            .enqueue(Collection::Reminders, "r1".into(), Operation::Create, payload("r"), false)
            .unwrap();

        let report = h.outbox.drain().await.unwrap();
        assert_eq!(report.sent, 4);
        assert_eq!(h.outbox.pending_count().unwrap(), 0);

        let n1_ops: Vec<_> = h
            .remote
            .applied()
            .into_iter()
            .filter(|m| m.id.as_str() == "n1")
            .map(|m| m.operation)
            .collect();
        assert_eq!(
            n1_ops,
            vec![
                RemoteOperation::Insert,
                RemoteOperation::Update,
                RemoteOperation::Delete
            ]
        );

        let checkpoint = h.store.metadata(Collection::Notes, None).unwrap().unwrap();
        assert_eq!(checkpoint.local_version, 3);
    }

    #[tokio::test]
    async fn transient_failure_backs_off_and_blocks_followers() {
        let h = harness(OutboxConfig::default());
        h.outbox
            .enqueue(Collection::Notes, "n1".into(), Operation::Create, payload("a"), false)
            .unwrap();
        h.outbox
            .enqueue(Collection::Notes, "n1".into(), Operation::Update, payload("b"), false)
            .unwrap();
        h.remote
            .fail_next(1, RemoteError::Network("connection reset".into()));

        let report = h.outbox.drain().await.unwrap();
        assert_eq!(report, DrainReport { sent: 0, retried: 1, terminal: 0 });
        assert!(h.remote.applied().is_empty());

        let items = h.outbox.items().unwrap();
        assert_eq!(items[0].retry_count, 1);
        assert_eq!(items[0].next_attempt_at, 11_000);
        assert_eq!(h.outbox.next_retry_at().unwrap(), Some(11_000));

        // Still inside the backoff window
        assert_eq!(h.outbox.drain().await.unwrap().sent, 0);

        h.clock.advance(Duration::from_secs(1));
        assert_eq!(h.outbox.drain().await.unwrap().sent, 2);
        assert_eq!(h.remote.applied().len(), 2);
    }

    #[tokio::test]
    async fn rejected_item_is_terminal_and_unblocks_others() {
        let h = harness(OutboxConfig::default());
        let bad = h
            .outbox
            .enqueue(Collection::Notes, "n1".into(), Operation::Create, payload("a"), false)
            .unwrap();
        h.remote.fail_next(1, RemoteError::Rejected("invalid title".into()));
        h.outbox
            .enqueue(Collection::Notes, "n1".into(), Operation::Update, payload("b"), false)
            .unwrap();

        let report = h.outbox.drain().await.unwrap();
        assert_eq!(report.terminal, 1);
        assert_eq!(report.sent, 1);

        let failed = h.outbox.failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, bad.id);
        assert_eq!(
            failed[0].last_error.as_deref(),
            Some("rejected by remote: invalid title")
        );
        assert_eq!(h.outbox.failed_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_moves_item_to_terminal() {
        let config = OutboxConfig {
            max_retry_attempts: 2,
            base_delay_ms: 0,
            max_delay_ms: 0,
            ..OutboxConfig::default()
        };
        let h = harness(config);
        h.outbox
            .enqueue(Collection::Notes, "n1".into(), Operation::Create, payload("a"), false)
            .unwrap();
        h.remote.set_online(false);

        let report = h.outbox.drain().await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.terminal, 1);
        assert_eq!(h.outbox.failed().unwrap()[0].retry_count, 2);
    }

    #[tokio::test]
    async fn retry_and_dismiss_only_touch_terminal_items() {
        let h = harness(OutboxConfig::default());
        let item = h
            .outbox
            .enqueue(Collection::Notes, "n1".into(), Operation::Create, payload("a"), false)
            .unwrap();

        assert!(h.outbox.dismiss(&item.id).is_err());
        assert!(h.outbox.retry(&item.id).is_err());

        h.remote.fail_next(1, RemoteError::Rejected("nope".into()));
        h.outbox.drain().await.unwrap();

        h.outbox.retry(&item.id).unwrap();
        let requeued = h.outbox.get(&item.id).unwrap().unwrap();
        assert_eq!(requeued.status, OutboxStatus::Pending);
        assert_eq!(requeued.retry_count, 0);

        h.remote.fail_next(1, RemoteError::Rejected("still no".into()));
        h.outbox.drain().await.unwrap();
        h.outbox.dismiss(&item.id).unwrap();
        assert!(h.outbox.items().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolve_accepts_unique_prefix() {
        let h = harness(OutboxConfig::default());
        let item = h
            .outbox
            .enqueue(Collection::Notes, "n1".into(), Operation::Create, payload("a"), false)
            .unwrap();

        let id = item.id.to_string();
        assert_eq!(h.outbox.resolve(&id[..13]).unwrap().id, item.id);
        assert!(matches!(
            h.outbox.resolve("zzzz"),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn recover_in_flight_requeues_claimed_items() {
        let h = harness(OutboxConfig::default());
        h.outbox
            .enqueue(Collection::Notes, "n1".into(), Operation::Create, payload("a"), false)
            .unwrap();

        let claimed = h.outbox.claim_due().unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(h.outbox.items().unwrap()[0].status, OutboxStatus::InFlight);

        assert_eq!(h.outbox.recover_in_flight().unwrap(), 1);
        assert_eq!(h.outbox.drain().await.unwrap().sent, 1);
    }

    #[tokio::test]
    async fn bookkeeping_error_requeues_instead_of_stranding_item() {
        let h = harness(OutboxConfig::default());
        let item = h
            .outbox
            .enqueue(Collection::Notes, "n1".into(), Operation::Create, payload("a"), false)
            .unwrap();
        // Make the confirm transaction fail after the remote accepted the write
        h.store
            .transaction(|tx| Ok(tx.execute_batch("DROP TABLE sync_metadata")?))
            .unwrap();

        let report = h.outbox.drain().await.unwrap();
        assert_eq!(report, DrainReport { sent: 0, retried: 1, terminal: 0 });
        assert_eq!(h.remote.applied().len(), 1);

        let requeued = h.outbox.get(&item.id).unwrap().unwrap();
        assert_eq!(requeued.status, OutboxStatus::Pending);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.next_attempt_at, 11_000);
        assert!(requeued.last_error.is_some());
    }

    struct PanickingRemote;

    #[async_trait::async_trait]
    impl RemoteService for PanickingRemote {
        async fn fetch(
            &self,
            _collection: Collection,
            _since: i64,
            _scope: Option<&str>,
        ) -> std::result::Result<Vec<crate::remote::RemoteRecord>, RemoteError> {
            Ok(Vec::new())
        }

        async fn apply(&self, _mutation: &RemoteMutation) -> std::result::Result<Ack, RemoteError> {
            panic!("client bug");
        }

        async fn subscribe(
            &self,
            _topic: &crate::remote::Topic,
        ) -> std::result::Result<crate::remote::Subscription, RemoteError> {
            Err(RemoteError::Network("unsupported".into()))
        }

        fn unsubscribe(&self, _channel: crate::remote::ChannelId) {}
    }

    #[tokio::test]
    async fn crashed_send_task_releases_its_item() {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = LocalStore::open_in_memory(clock).unwrap();
        let outbox = Outbox::new(
            store,
            Arc::new(PanickingRemote),
            RequestGovernor::new(4, Duration::from_secs(5)),
            OutboxConfig::default(),
        );
        let item = outbox
            .enqueue(Collection::Notes, "n1".into(), Operation::Create, payload("a"), false)
            .unwrap();

        let report = outbox.drain().await.unwrap();
        assert_eq!(report.retried, 1);
        let released = outbox.get(&item.id).unwrap().unwrap();
        assert_eq!(released.status, OutboxStatus::Pending);
        assert_eq!(released.last_error.as_deref(), Some("send task aborted"));
    }
}

//! Thread-safe local store shared by every engine component.
//!
//! Each public call runs in its own `SQLite` transaction, so partial writes
//! are never observable. Successful mutations are published as
//! [`StoreEvent`]s for cache invalidation.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Transaction;
use tokio::sync::broadcast;

use crate::clock::{duration_ms, Clock};
use crate::db::{
    Database, EntityRepository, MetadataRepository, SqliteEntityRepository,
    SqliteMetadataRepository, WriteOutcome,
};
use crate::error::{Error, Result};
use crate::models::{Collection, Entity, EntityId, SyncConflict, SyncMetadata};

const EVENT_BUFFER: usize = 1024;
const DEFAULT_PAGE_SIZE: usize = 200;

/// Change notification emitted after a committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Upserted { collection: Collection, id: EntityId },
    Deleted { collection: Collection, id: EntityId },
    /// Everything was wiped (logout)
    Reset,
}

impl StoreEvent {
    fn for_write(entity: &Entity) -> Self {
        if entity.is_deleted {
            Self::Deleted {
                collection: entity.collection,
                id: entity.id.clone(),
            }
        } else {
            Self::Upserted {
                collection: entity.collection,
                id: entity.id.clone(),
            }
        }
    }
}

/// Predicate used by [`LocalStore::query`].
pub type EntityFilter = Arc<dyn Fn(&Entity) -> bool + Send + Sync>;

/// Embedded, transactional entity store.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    events: broadcast::Sender<StoreEvent>,
    clock: Arc<dyn Clock>,
    path: Option<PathBuf>,
}

impl LocalStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let db = Database::open(path.as_ref())?;
        tracing::info!("Opened local store at {}", path.as_ref().display());
        Ok(Self::from_database(db, clock))
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?, clock))
    }

    fn from_database(db: Database, clock: Arc<dyn Clock>) -> Self {
        let path = db.path().map(Path::to_path_buf);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            db: Arc::new(Mutex::new(db)),
            events,
            clock,
            path,
        }
    }

    /// Filesystem location, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The clock this store stamps local writes with.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Subscribe to committed mutations.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>> {
        self.db.lock().map_err(|_| Error::lock_poisoned("database"))
    }

    /// Run `f` inside a single transaction; commits only when `f` succeeds.
    pub(crate) fn transaction<R>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<R>) -> Result<R> {
        let mut db = self.lock()?;
        let tx = db.connection_mut().transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub(crate) fn publish(&self, event: StoreEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn publish_write(&self, entity: &Entity, outcome: WriteOutcome) {
        if outcome.is_applied() {
            self.publish(StoreEvent::for_write(entity));
        }
    }

    /// Get a live entity.
    pub fn get(&self, collection: Collection, id: &EntityId) -> Result<Option<Entity>> {
        let db = self.lock()?;
        SqliteEntityRepository::new(db.connection()).get(collection, id)
    }

    /// Get an entity including tombstones.
    pub fn get_any(&self, collection: Collection, id: &EntityId) -> Result<Option<Entity>> {
        let db = self.lock()?;
        SqliteEntityRepository::new(db.connection()).get_any(collection, id)
    }

    /// Write `entity` with last-write-wins.
    ///
    /// A write older than the stored row is dropped and reported as
    /// [`WriteOutcome::Superseded`], not as an error.
    pub fn put(&self, entity: &Entity) -> Result<WriteOutcome> {
        let now = self.clock.now_ms();
        let outcome =
            self.transaction(|tx| SqliteEntityRepository::new(tx).upsert(entity, now))?;

        match outcome {
            WriteOutcome::Superseded { stored_updated_at } => tracing::debug!(
                collection = %entity.collection,
                id = %entity.id,
                incoming = entity.updated_at,
                stored = stored_updated_at,
                "Dropped superseded write"
            ),
            _ => tracing::trace!(collection = %entity.collection, id = %entity.id, ?outcome, "Stored entity"),
        }

        self.publish_write(entity, outcome);
        Ok(outcome)
    }

    /// Delete `id` now.
    pub fn delete(&self, collection: Collection, id: &EntityId) -> Result<WriteOutcome> {
        self.delete_at(collection, id, self.clock.now_ms())
    }

    /// Delete `id` as of `deleted_at`; a missing id is a no-op.
    pub fn delete_at(
        &self,
        collection: Collection,
        id: &EntityId,
        deleted_at: i64,
    ) -> Result<WriteOutcome> {
        let now = self.clock.now_ms();
        let outcome = self.transaction(|tx| {
            SqliteEntityRepository::new(tx).delete(collection, id, deleted_at, now)
        })?;

        if outcome.is_applied() {
            self.publish(StoreEvent::Deleted {
                collection,
                id: id.clone(),
            });
        }
        Ok(outcome)
    }

    /// Lazily iterate the live entities of `collection` matching `predicate`.
    ///
    /// The sequence is finite and restartable; pages are read in id order,
    /// each in its own short read.
    pub fn query<F>(&self, collection: Collection, predicate: F) -> EntityQuery
    where
        F: Fn(&Entity) -> bool + Send + Sync + 'static,
    {
        EntityQuery {
            store: self.clone(),
            collection,
            predicate: Arc::new(predicate),
            page_size: DEFAULT_PAGE_SIZE,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Count live entities in `collection`.
    pub fn count(&self, collection: Collection) -> Result<usize> {
        let db = self.lock()?;
        SqliteEntityRepository::new(db.connection()).count(collection)
    }

    /// Physically remove tombstones older than `older_than`.
    pub fn purge_tombstones(&self, older_than: Duration) -> Result<usize> {
        let before = self.clock.now_ms().saturating_sub(duration_ms(older_than));
        let removed =
            self.transaction(|tx| SqliteEntityRepository::new(tx).purge_tombstones(before))?;
        if removed > 0 {
            tracing::debug!("Purged {removed} tombstones");
        }
        Ok(removed)
    }

    /// Recently resolved last-write-wins conflicts.
    pub fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let db = self.lock()?;
        SqliteEntityRepository::new(db.connection()).list_conflicts(limit)
    }

    /// Load the checkpoint for `(collection, scope)`.
    pub fn metadata(
        &self,
        collection: Collection,
        scope: Option<&str>,
    ) -> Result<Option<SyncMetadata>> {
        let db = self.lock()?;
        SqliteMetadataRepository::new(db.connection()).get(collection, scope)
    }

    /// Persist a checkpoint.
    pub fn save_metadata(&self, metadata: &SyncMetadata) -> Result<()> {
        self.transaction(|tx| SqliteMetadataRepository::new(tx).save(metadata))
    }

    /// All checkpoints.
    pub fn list_metadata(&self) -> Result<Vec<SyncMetadata>> {
        let db = self.lock()?;
        SqliteMetadataRepository::new(db.connection()).list()
    }

    /// Wipe entities, checkpoints, outbox and conflict log (logout).
    pub fn reset(&self) -> Result<()> {
        self.transaction(|tx| {
            tx.execute_batch(
                "DELETE FROM entities;
                 DELETE FROM sync_metadata;
                 DELETE FROM outbox;
                 DELETE FROM sync_conflicts;",
            )?;
            Ok(())
        })?;
        tracing::info!("Local store reset");
        self.publish(StoreEvent::Reset);
        Ok(())
    }

    fn page(&self, collection: Collection, after: Option<&EntityId>, limit: usize) -> Result<Vec<Entity>> {
        let db = self.lock()?;
        SqliteEntityRepository::new(db.connection()).page(collection, after, limit)
    }
}

/// Lazy, restartable query over one collection.
pub struct EntityQuery {
    store: LocalStore,
    collection: Collection,
    predicate: EntityFilter,
    page_size: usize,
    cursor: Option<EntityId>,
    buffer: VecDeque<Entity>,
    exhausted: bool,
}

impl EntityQuery {
    /// Read `page_size` rows per round trip to the database.
    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Start over from the first entity.
    pub fn restart(&mut self) {
        self.cursor = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fill(&mut self) -> Result<()> {
        while self.buffer.is_empty() && !self.exhausted {
            let page = self
                .store
                .page(self.collection, self.cursor.as_ref(), self.page_size)?;
            if page.len() < self.page_size {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.cursor = Some(last.id.clone());
            }
            self.buffer
                .extend(page.into_iter().filter(|entity| (self.predicate)(entity)));
        }
        Ok(())
    }
}

impl Iterator for EntityQuery {
    type Item = Result<Entity>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(error) = self.fill() {
            self.exhausted = true;
            return Some(Err(error));
        }
        self.buffer.pop_front().map(Ok)
    }
}

//! Outbox repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use crate::error::{Error, Result};
use crate::models::{
    Collection, EntityId, Operation, OutboxItem, OutboxItemId, OutboxStatus, Payload,
};
use rusqlite::{params, Connection, OptionalExtension};

/// Trait for outbox storage operations
pub trait OutboxRepository {
    /// Persist a new item; returns it with its assigned sequence number
    fn insert(&self, item: &OutboxItem) -> Result<OutboxItem>;

    /// Get an item by ID
    fn get(&self, id: &OutboxItemId) -> Result<Option<OutboxItem>>;

    /// Oldest-first `PENDING` items that are due and are the head of their
    /// entity's queue (no earlier non-terminal item for the same entity)
    fn due_heads(&self, collection: Collection, now: i64, limit: usize) -> Result<Vec<OutboxItem>>;

    /// Move an item to `IN_FLIGHT`
    fn mark_in_flight(&self, id: &OutboxItemId) -> Result<()>;

    /// Record a retryable failure and schedule the next attempt
    fn schedule_retry(&self, id: &OutboxItemId, error: &str, next_attempt_at: i64) -> Result<()>;

    /// Record a terminal failure
    fn mark_failed(&self, id: &OutboxItemId, error: &str) -> Result<()>;

    /// Put a terminal item back in the queue with a fresh retry budget
    fn requeue(&self, id: &OutboxItemId, now: i64) -> Result<()>;

    /// Remove an item
    fn remove(&self, id: &OutboxItemId) -> Result<bool>;

    /// Items with the given status, oldest first
    fn list(&self, status: Option<OutboxStatus>) -> Result<Vec<OutboxItem>>;

    /// Number of items with the given status
    fn count(&self, status: OutboxStatus) -> Result<usize>;

    /// Earliest `next_attempt_at` among pending items
    fn next_attempt_at(&self) -> Result<Option<i64>>;

    /// Reset items left `IN_FLIGHT` (e.g. by a crash) to `PENDING`
    fn recover_in_flight(&self) -> Result<usize>;

    /// Find items whose ID starts with `prefix`
    fn find_by_prefix(&self, prefix: &str) -> Result<Vec<OutboxItem>>;
}

/// `SQLite` implementation of `OutboxRepository`
pub struct SqliteOutboxRepository<'a> {
    conn: &'a Connection,
}

struct OutboxRow {
    seq: i64,
    id: String,
    collection: String,
    entity_id: String,
    operation: String,
    payload: Option<String>,
    updated_at: i64,
    status: String,
    retry_count: i64,
    last_error: Option<String>,
    created_at: i64,
    next_attempt_at: i64,
    interactive: bool,
}

impl TryFrom<OutboxRow> for OutboxItem {
    type Error = Error;

    fn try_from(row: OutboxRow) -> Result<Self> {
        Ok(Self {
            id: row
                .id
                .parse()
                .map_err(|_| Error::Database(format!("Invalid outbox id: {}", row.id)))?,
            seq: row.seq,
            collection: row.collection.parse()?,
            entity_id: EntityId::new(row.entity_id),
            operation: row.operation.parse()?,
            payload: row
                .payload
                .map(|payload| serde_json::from_str::<Payload>(&payload))
                .transpose()?,
            updated_at: row.updated_at,
            status: row.status.parse()?,
            retry_count: u32::try_from(row.retry_count).unwrap_or_default(),
            last_error: row.last_error,
            created_at: row.created_at,
            next_attempt_at: row.next_attempt_at,
            interactive: row.interactive,
        })
    }
}

const SELECT_OUTBOX: &str = "SELECT seq, id, collection, entity_id, operation, payload, updated_at, status,
        retry_count, last_error, created_at, next_attempt_at, interactive
     FROM outbox o";

impl<'a> SqliteOutboxRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxRow> {
        Ok(OutboxRow {
            seq: row.get(0)?,
            id: row.get(1)?,
            collection: row.get(2)?,
            entity_id: row.get(3)?,
            operation: row.get(4)?,
            payload: row.get(5)?,
            updated_at: row.get(6)?,
            status: row.get(7)?,
            retry_count: row.get(8)?,
            last_error: row.get(9)?,
            created_at: row.get(10)?,
            next_attempt_at: row.get(11)?,
            interactive: row.get::<_, i32>(12)? != 0,
        })
    }

    fn query_items(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<OutboxItem>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, Self::parse_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(OutboxItem::try_from).collect()
    }

    fn expect_one(rows: usize, id: &OutboxItemId) -> Result<()> {
        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }
}

impl OutboxRepository for SqliteOutboxRepository<'_> {
    fn insert(&self, item: &OutboxItem) -> Result<OutboxItem> {
        let payload = item
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            "INSERT INTO outbox (
                id, collection, entity_id, operation, payload, updated_at, status,
                retry_count, last_error, created_at, next_attempt_at, interactive
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                item.id.as_str(),
                item.collection.as_str(),
                item.entity_id.as_str(),
                item.operation.as_str(),
                payload,
                item.updated_at,
                item.status.as_str(),
                item.retry_count,
                item.last_error,
                item.created_at,
                item.next_attempt_at,
                i32::from(item.interactive)
            ],
        )?;

        Ok(OutboxItem {
            seq: self.conn.last_insert_rowid(),
            ..item.clone()
        })
    }

    fn get(&self, id: &OutboxItemId) -> Result<Option<OutboxItem>> {
        let row = self
            .conn
            .query_row(
                &format!("{SELECT_OUTBOX} WHERE o.id = ?"),
                params![id.as_str()],
                Self::parse_row,
            )
            .optional()?;
        row.map(OutboxItem::try_from).transpose()
    }

    fn due_heads(&self, collection: Collection, now: i64, limit: usize) -> Result<Vec<OutboxItem>> {
        self.query_items(
            &format!(
                "{SELECT_OUTBOX}
                 WHERE o.collection = ?1 AND o.status = 'PENDING' AND o.next_attempt_at <= ?2
                   AND NOT EXISTS (
                       SELECT 1 FROM outbox p
                       WHERE p.collection = o.collection
                         AND p.entity_id = o.entity_id
                         AND p.seq < o.seq
                         AND p.status != 'FAILED_TERMINAL'
                   )
                 ORDER BY o.seq ASC
                 LIMIT ?3"
            ),
            params![collection.as_str(), now, limit as i64],
        )
    }

    fn mark_in_flight(&self, id: &OutboxItemId) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE outbox SET status = 'IN_FLIGHT' WHERE id = ?",
            params![id.as_str()],
        )?;
        Self::expect_one(rows, id)
    }

    fn schedule_retry(&self, id: &OutboxItemId, error: &str, next_attempt_at: i64) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE outbox
             SET status = 'PENDING', retry_count = retry_count + 1, last_error = ?, next_attempt_at = ?
             WHERE id = ?",
            params![error, next_attempt_at, id.as_str()],
        )?;
        Self::expect_one(rows, id)
    }

    fn mark_failed(&self, id: &OutboxItemId, error: &str) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE outbox
             SET status = 'FAILED_TERMINAL', retry_count = retry_count + 1, last_error = ?
             WHERE id = ?",
            params![error, id.as_str()],
        )?;
        Self::expect_one(rows, id)
    }

    fn requeue(&self, id: &OutboxItemId, now: i64) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE outbox
             SET status = 'PENDING', retry_count = 0, next_attempt_at = ?
             WHERE id = ? AND status = 'FAILED_TERMINAL'",
            params![now, id.as_str()],
        )?;
        Self::expect_one(rows, id)
    }

    fn remove(&self, id: &OutboxItemId) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM outbox WHERE id = ?", params![id.as_str()])?;
        Ok(rows > 0)
    }

    fn list(&self, status: Option<OutboxStatus>) -> Result<Vec<OutboxItem>> {
        let status = status.map(OutboxStatus::as_str);
        self.query_items(
            &format!("{SELECT_OUTBOX} WHERE (?1 IS NULL OR o.status = ?1) ORDER BY o.seq ASC"),
            params![status],
        )
    }

    fn count(&self, status: OutboxStatus) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM outbox WHERE status = ?",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn next_attempt_at(&self) -> Result<Option<i64>> {
        let next = self.conn.query_row(
            "SELECT MIN(o.next_attempt_at) FROM outbox o
             WHERE o.status = 'PENDING'
               AND NOT EXISTS (
                   SELECT 1 FROM outbox p
                   WHERE p.collection = o.collection
                     AND p.entity_id = o.entity_id
                     AND p.seq < o.seq
                     AND p.status != 'FAILED_TERMINAL'
               )",
            [],
            |row| row.get(0),
        )?;
        Ok(next)
    }

    fn recover_in_flight(&self) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE outbox SET status = 'PENDING' WHERE status = 'IN_FLIGHT'",
            [],
        )?;
        Ok(rows)
    }

    fn find_by_prefix(&self, prefix: &str) -> Result<Vec<OutboxItem>> {
        let pattern = format!("{}%", prefix.trim());
        self.query_items(
            &format!("{SELECT_OUTBOX} WHERE o.id LIKE ? ORDER BY o.seq ASC"),
            params![pattern],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    fn item(entity: &str, operation: Operation, created_at: i64) -> OutboxItem {
        OutboxItem {
            id: OutboxItemId::new(),
            seq: 0,
            collection: Collection::Notes,
            entity_id: entity.into(),
            operation,
            payload: Some(Payload::new()),
            updated_at: created_at,
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at,
            next_attempt_at: created_at,
            interactive: false,
        }
    }

    fn entity_ids(items: &[OutboxItem]) -> Vec<String> {
        items
            .iter()
            .map(|item| item.entity_id.as_str().to_string())
            .collect()
    }

    #[test]
    fn test_insert_assigns_increasing_seq() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteOutboxRepository::new(db.connection());

        let first = repo.insert(&item("a", Operation::Create, 1)).unwrap();
        let second = repo.insert(&item("b", Operation::Create, 1)).unwrap();
        assert!(second.seq > first.seq);

        let fetched = repo.get(&first.id).unwrap().unwrap();
        assert_eq!(fetched, first);
    }

    #[test]
    fn test_due_heads_returns_one_item_per_entity() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteOutboxRepository::new(db.connection());

        repo.insert(&item("a", Operation::Create, 1)).unwrap();
        repo.insert(&item("a", Operation::Update, 2)).unwrap();
        repo.insert(&item("b", Operation::Create, 3)).unwrap();

        let heads = repo.due_heads(Collection::Notes, 10, 10).unwrap();
        assert_eq!(entity_ids(&heads), vec!["a", "b"]);
        assert_eq!(heads[0].operation, Operation::Create);
    }

    #[test]
    fn test_retrying_head_blocks_later_items_for_same_entity() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteOutboxRepository::new(db.connection());

        let create = repo.insert(&item("a", Operation::Create, 1)).unwrap();
        repo.insert(&item("a", Operation::Update, 2)).unwrap();

        repo.schedule_retry(&create.id, "offline", 100).unwrap();
        assert!(repo.due_heads(Collection::Notes, 50, 10).unwrap().is_empty());

        let heads = repo.due_heads(Collection::Notes, 100, 10).unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].id, create.id);
        assert_eq!(heads[0].retry_count, 1);
    }

    #[test]
    fn test_terminal_head_unblocks_followers() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteOutboxRepository::new(db.connection());

        let create = repo.insert(&item("a", Operation::Create, 1)).unwrap();
        let update = repo.insert(&item("a", Operation::Update, 2)).unwrap();

        repo.mark_failed(&create.id, "rejected").unwrap();
        let heads = repo.due_heads(Collection::Notes, 10, 10).unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].id, update.id);
        assert_eq!(repo.count(OutboxStatus::Failed).unwrap(), 1);
    }

    #[test]
    fn test_in_flight_recovery() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteOutboxRepository::new(db.connection());

        let pending = repo.insert(&item("a", Operation::Create, 1)).unwrap();
        repo.mark_in_flight(&pending.id).unwrap();
        assert!(repo.due_heads(Collection::Notes, 10, 10).unwrap().is_empty());

        assert_eq!(repo.recover_in_flight().unwrap(), 1);
        assert_eq!(repo.due_heads(Collection::Notes, 10, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_requeue_only_applies_to_terminal_items() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteOutboxRepository::new(db.connection());

        let pending = repo.insert(&item("a", Operation::Create, 1)).unwrap();
        assert!(repo.requeue(&pending.id, 5).is_err());

        repo.mark_failed(&pending.id, "rejected").unwrap();
        repo.requeue(&pending.id, 5).unwrap();
        let requeued = repo.get(&pending.id).unwrap().unwrap();
        assert_eq!(requeued.status, OutboxStatus::Pending);
        assert_eq!(requeued.retry_count, 0);
        assert_eq!(requeued.next_attempt_at, 5);
    }

    #[test]
    fn test_find_by_prefix_and_remove() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteOutboxRepository::new(db.connection());

        let stored = repo.insert(&item("a", Operation::Delete, 1)).unwrap();
        let prefix = &stored.id.as_str()[..13];
        let found = repo.find_by_prefix(prefix).unwrap();
        assert_eq!(found.len(), 1);

        assert!(repo.remove(&stored.id).unwrap());
        assert!(!repo.remove(&stored.id).unwrap());
        assert_eq!(repo.next_attempt_at().unwrap(), None);
    }
}

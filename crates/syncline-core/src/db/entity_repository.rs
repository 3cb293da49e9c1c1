//! Entity repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use crate::error::{Error, Result};
use crate::models::{Collection, Entity, EntityId, Payload, SyncConflict};
use rusqlite::{params, Connection, OptionalExtension};

/// Result of a last-write-wins write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// No previous row existed
    Inserted,
    /// An older or equally old row was overwritten
    Updated,
    /// Same timestamp and content as the stored row; nothing changed
    Unchanged,
    /// The stored row is newer or wins the timestamp tie; the write was dropped
    Superseded {
        /// Timestamp of the row that won
        stored_updated_at: i64,
    },
    /// Delete of an id that is not present
    Missing,
}

impl WriteOutcome {
    /// Whether the stored state changed (and a change event is due).
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

/// Trait for entity storage operations
pub trait EntityRepository {
    /// Get a live entity
    fn get(&self, collection: Collection, id: &EntityId) -> Result<Option<Entity>>;

    /// Get an entity including tombstones
    fn get_any(&self, collection: Collection, id: &EntityId) -> Result<Option<Entity>>;

    /// Write with last-write-wins on `updated_at`
    fn upsert(&self, entity: &Entity, now: i64) -> Result<WriteOutcome>;

    /// Tombstone an existing entity, last-write-wins on `deleted_at`
    fn delete(&self, collection: Collection, id: &EntityId, deleted_at: i64, now: i64)
        -> Result<WriteOutcome>;

    /// Live entities ordered by id, strictly after `after`
    fn page(&self, collection: Collection, after: Option<&EntityId>, limit: usize)
        -> Result<Vec<Entity>>;

    /// Count live entities
    fn count(&self, collection: Collection) -> Result<usize>;

    /// Physically remove tombstones older than `before`
    fn purge_tombstones(&self, before: i64) -> Result<usize>;

    /// Recently resolved conflicts, newest first
    fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>>;
}

/// `SQLite` implementation of `EntityRepository`
pub struct SqliteEntityRepository<'a> {
    conn: &'a Connection,
}

struct EntityRow {
    collection: String,
    id: String,
    payload: String,
    updated_at: i64,
    is_deleted: bool,
}

impl TryFrom<EntityRow> for Entity {
    type Error = Error;

    fn try_from(row: EntityRow) -> Result<Self> {
        Ok(Self {
            collection: row.collection.parse()?,
            id: EntityId::new(row.id),
            payload: serde_json::from_str::<Payload>(&row.payload)?,
            updated_at: row.updated_at,
            is_deleted: row.is_deleted,
        })
    }
}

const SELECT_ENTITY: &str =
    "SELECT collection, id, payload, updated_at, is_deleted FROM entities";

impl<'a> SqliteEntityRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse an entity from a database row
    fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRow> {
        Ok(EntityRow {
            collection: row.get(0)?,
            id: row.get(1)?,
            payload: row.get(2)?,
            updated_at: row.get(3)?,
            is_deleted: row.get::<_, i32>(4)? != 0,
        })
    }

    fn record_conflict(
        &self,
        collection: Collection,
        id: &EntityId,
        local_updated_at: i64,
        incoming_updated_at: i64,
        now: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_conflicts (
                collection, entity_id, local_updated_at, incoming_updated_at, resolved_at, strategy
             ) VALUES (?, ?, ?, ?, ?, 'lww')",
            params![
                collection.as_str(),
                id.as_str(),
                local_updated_at,
                incoming_updated_at,
                now
            ],
        )?;
        Ok(())
    }

    fn write_row(&self, entity: &Entity) -> Result<()> {
        let payload = serde_json::to_string(&entity.payload)?;
        self.conn.execute(
            "INSERT INTO entities (collection, id, payload, updated_at, is_deleted)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(collection, id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at,
                is_deleted = excluded.is_deleted",
            params![
                entity.collection.as_str(),
                entity.id.as_str(),
                payload,
                entity.updated_at,
                i32::from(entity.is_deleted)
            ],
        )?;
        Ok(())
    }
}

/// Orders two versions carrying the same timestamp so every replica keeps
/// the same one regardless of arrival order: tombstones first, then the
/// larger serialized payload. Map keys serialize sorted.
fn tie_break_key(entity: &Entity) -> Result<(bool, String)> {
    Ok((entity.is_deleted, serde_json::to_string(&entity.payload)?))
}

impl EntityRepository for SqliteEntityRepository<'_> {
    fn get(&self, collection: Collection, id: &EntityId) -> Result<Option<Entity>> {
        Ok(self
            .get_any(collection, id)?
            .filter(|entity| !entity.is_deleted))
    }

    fn get_any(&self, collection: Collection, id: &EntityId) -> Result<Option<Entity>> {
        let row = self
            .conn
            .query_row(
                &format!("{SELECT_ENTITY} WHERE collection = ? AND id = ?"),
                params![collection.as_str(), id.as_str()],
                Self::parse_row,
            )
            .optional()?;

        row.map(Entity::try_from).transpose()
    }

    fn upsert(&self, entity: &Entity, now: i64) -> Result<WriteOutcome> {
        let Some(stored) = self.get_any(entity.collection, &entity.id)? else {
            self.write_row(entity)?;
            return Ok(WriteOutcome::Inserted);
        };

        let loses_tie = entity.updated_at == stored.updated_at && {
            let incoming = tie_break_key(entity)?;
            let current = tie_break_key(&stored)?;
            if incoming == current {
                return Ok(WriteOutcome::Unchanged);
            }
            incoming < current
        };

        if entity.updated_at < stored.updated_at || loses_tie {
            self.record_conflict(
                entity.collection,
                &entity.id,
                stored.updated_at,
                entity.updated_at,
                now,
            )?;
            return Ok(WriteOutcome::Superseded {
                stored_updated_at: stored.updated_at,
            });
        }

        self.write_row(entity)?;
        Ok(WriteOutcome::Updated)
    }

    fn delete(
        &self,
        collection: Collection,
        id: &EntityId,
        deleted_at: i64,
        now: i64,
    ) -> Result<WriteOutcome> {
        match self.get_any(collection, id)? {
            None => Ok(WriteOutcome::Missing),
            Some(stored) if stored.is_deleted && stored.updated_at >= deleted_at => {
                Ok(WriteOutcome::Unchanged)
            }
            Some(_) => self.upsert(&Entity::tombstone(collection, id.clone(), deleted_at), now),
        }
    }

    fn page(
        &self,
        collection: Collection,
        after: Option<&EntityId>,
        limit: usize,
    ) -> Result<Vec<Entity>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_ENTITY}
             WHERE collection = ? AND is_deleted = 0 AND (? IS NULL OR id > ?)
             ORDER BY id ASC
             LIMIT ?"
        ))?;

        let after = after.map(EntityId::as_str);
        let rows = stmt
            .query_map(
                params![collection.as_str(), after, after, limit as i64],
                Self::parse_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(Entity::try_from).collect()
    }

    fn count(&self, collection: Collection) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE collection = ? AND is_deleted = 0",
            params![collection.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn purge_tombstones(&self, before: i64) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM entities WHERE is_deleted = 1 AND updated_at < ?",
            params![before],
        )?;
        Ok(removed)
    }

    fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, collection, entity_id, local_updated_at, incoming_updated_at, resolved_at, strategy
             FROM sync_conflicts
             ORDER BY resolved_at DESC, id DESC
             LIMIT ?",
        )?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(id, collection, entity_id, local_updated_at, incoming_updated_at, resolved_at, strategy)| {
                    Ok(SyncConflict {
                        id,
                        collection: collection.parse()?,
                        entity_id,
                        local_updated_at,
                        incoming_updated_at,
                        resolved_at,
                        strategy,
                    })
                },
            )
            .collect()
    }
}

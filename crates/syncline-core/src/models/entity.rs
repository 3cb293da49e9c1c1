//! Synchronizable entity model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Structured key/value document carried by every entity.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// The closed set of collections the engine knows how to sync.
///
/// Adding a collection means adding a variant here; every dispatch over
/// collections is an exhaustive match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Chats,
    Messages,
    Notes,
    Reminders,
}

impl Collection {
    /// Every known collection, in pull order.
    pub const ALL: [Self; 4] = [Self::Chats, Self::Messages, Self::Notes, Self::Reminders];

    /// Stable tag used in storage keys and cache keys.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chats => "chats",
            Self::Messages => "messages",
            Self::Notes => "notes",
            Self::Reminders => "reminders",
        }
    }

    /// Whether remote pulls and change streams for this collection are
    /// partitioned by a scope (messages are scoped to one chat).
    pub const fn is_scoped(self) -> bool {
        matches!(self, Self::Messages)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chats" => Ok(Self::Chats),
            "messages" => Ok(Self::Messages),
            "notes" => Ok(Self::Notes),
            "reminders" => Ok(Self::Reminders),
            other => Err(Error::InvalidInput(format!("Unknown collection: {other}"))),
        }
    }
}

/// Opaque entity identifier, unique within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh time-sortable id (UUID v7) for locally created entities.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A synchronizable record (chat, message, note, reminder, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Owning collection
    pub collection: Collection,
    /// Identifier, unique within the collection
    pub id: EntityId,
    /// Mutable document
    pub payload: Payload,
    /// Last update timestamp (Unix ms), used for last-write-wins
    pub updated_at: i64,
    /// Tombstone flag; deleted entities are kept so stale updates cannot
    /// resurrect them
    pub is_deleted: bool,
}

impl Entity {
    /// Create a live entity stamped with `updated_at`.
    pub fn new(
        collection: Collection,
        id: impl Into<EntityId>,
        payload: Payload,
        updated_at: i64,
    ) -> Self {
        Self {
            collection,
            id: id.into(),
            payload,
            updated_at,
            is_deleted: false,
        }
    }

    /// Create a tombstone for `id` at `deleted_at`.
    pub fn tombstone(collection: Collection, id: impl Into<EntityId>, deleted_at: i64) -> Self {
        Self {
            collection,
            id: id.into(),
            payload: Payload::new(),
            updated_at: deleted_at,
            is_deleted: true,
        }
    }

    /// Cache key for this entity, `"{collection}:{id}"`.
    pub fn cache_key(&self) -> String {
        entity_cache_key(self.collection, &self.id)
    }
}

/// Cache key for a single entity, `"{collection}:{id}"`.
pub fn entity_cache_key(collection: Collection, id: &EntityId) -> String {
    format!("{collection}:{id}")
}

/// Prefix shared by every cached list/query result of a collection.
pub fn list_cache_prefix(collection: Collection) -> String {
    format!("{collection}:list")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_roundtrips_through_str() {
        for collection in Collection::ALL {
            let parsed: Collection = collection.as_str().parse().unwrap();
            assert_eq!(parsed, collection);
        }
        assert!("widgets".parse::<Collection>().is_err());
        assert_eq!(" Notes ".parse::<Collection>().unwrap(), Collection::Notes);
    }

    #[test]
    fn only_messages_are_scoped() {
        assert!(Collection::Messages.is_scoped());
        assert!(!Collection::Notes.is_scoped());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(EntityId::generate(), EntityId::generate());
    }

    #[test]
    fn tombstone_has_empty_payload() {
        let tombstone = Entity::tombstone(Collection::Notes, "n1", 42);
        assert!(tombstone.is_deleted);
        assert!(tombstone.payload.is_empty());
        assert_eq!(tombstone.cache_key(), "notes:n1");
    }
}

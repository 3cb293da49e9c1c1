//! Remote backend contract.
//!
//! The engine consumes, but never implements, a backend exposing three
//! surfaces: delta pulls, mutation pushes and per-topic change streams.
//! Wire format is the implementor's concern.
//!
//! - [`MemoryRemote`]: in-process backend for tests and demos

mod memory;

pub use memory::MemoryRemote;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::RemoteError;
use crate::models::{Collection, Entity, EntityId, Operation, Payload};

/// A record as returned by a delta pull or carried by a change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: EntityId,
    pub payload: Payload,
    pub updated_at: i64,
    pub deleted: bool,
}

impl RemoteRecord {
    pub fn new(id: impl Into<EntityId>, payload: Payload, updated_at: i64) -> Self {
        Self {
            id: id.into(),
            payload,
            updated_at,
            deleted: false,
        }
    }

    pub fn deleted(id: impl Into<EntityId>, updated_at: i64) -> Self {
        Self {
            id: id.into(),
            payload: Payload::new(),
            updated_at,
            deleted: true,
        }
    }

    /// Convert to a local entity (a tombstone when `deleted`).
    pub fn into_entity(self, collection: Collection) -> Entity {
        if self.deleted {
            Entity::tombstone(collection, self.id, self.updated_at)
        } else {
            Entity::new(collection, self.id, self.payload, self.updated_at)
        }
    }
}

/// Mutation kind as understood by the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteOperation {
    Insert,
    Update,
    Delete,
}

impl From<Operation> for RemoteOperation {
    fn from(operation: Operation) -> Self {
        match operation {
            Operation::Create => Self::Insert,
            Operation::Update => Self::Update,
            Operation::Delete => Self::Delete,
        }
    }
}

/// One local mutation replayed against the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMutation {
    pub collection: Collection,
    pub operation: RemoteOperation,
    pub id: EntityId,
    pub payload: Option<Payload>,
    /// Client timestamp of the mutation
    pub updated_at: i64,
}

/// Remote confirmation of an applied mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub id: EntityId,
    /// Timestamp the remote stored the record with
    pub updated_at: i64,
}

/// A change-stream subscription key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    pub collection: Collection,
    pub scope: Option<String>,
}

impl Topic {
    pub fn new(collection: Collection, scope: Option<&str>) -> Self {
        Self {
            collection,
            scope: scope.map(str::to_string),
        }
    }

    /// Whether an event on `(collection, scope)` is delivered to this topic.
    /// An unscoped topic receives every scope of its collection.
    pub fn matches(&self, collection: Collection, scope: Option<&str>) -> bool {
        self.collection == collection
            && self
                .scope
                .as_deref()
                .is_none_or(|wanted| scope == Some(wanted))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}:{scope}", self.collection),
            None => write!(f, "{}", self.collection),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A push notification. Delivery is at-least-once and may repeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub collection: Collection,
    pub scope: Option<String>,
    pub record: RemoteRecord,
}

/// Receiving end of a change stream.
///
/// An `Err` item reports a channel failure; the stream ends (`None`) when
/// the remote closes it.
pub type ChangeStream = mpsc::Receiver<Result<ChangeEvent, RemoteError>>;

/// Remote-assigned handle of one open change stream. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An opened change stream and the handle that releases it.
#[derive(Debug)]
pub struct Subscription {
    pub channel: ChannelId,
    pub stream: ChangeStream,
}

/// The remote backend.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Records of `collection` with `updated_at >= since`, ordered by
    /// `updated_at`. `scope` narrows scoped collections.
    async fn fetch(
        &self,
        collection: Collection,
        since: i64,
        scope: Option<&str>,
    ) -> Result<Vec<RemoteRecord>, RemoteError>;

    /// Apply one mutation.
    async fn apply(&self, mutation: &RemoteMutation) -> Result<Ack, RemoteError>;

    /// Open a change stream for `topic`. Several streams may be open on the
    /// same topic at once.
    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, RemoteError>;

    /// Release one stream. Other streams on the same topic stay open.
    fn unsubscribe(&self, channel: ChannelId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unscoped_topic_matches_every_scope() {
        let all = Topic::new(Collection::Messages, None);
        let chat = Topic::new(Collection::Messages, Some("chat-1"));

        assert!(all.matches(Collection::Messages, Some("chat-2")));
        assert!(chat.matches(Collection::Messages, Some("chat-1")));
        assert!(!chat.matches(Collection::Messages, Some("chat-2")));
        assert!(!chat.matches(Collection::Notes, Some("chat-1")));
        assert_eq!(chat.to_string(), "messages:chat-1");
    }

    #[test]
    fn deleted_record_becomes_tombstone() {
        let entity = RemoteRecord::deleted("n1", 42).into_entity(Collection::Notes);
        assert!(entity.is_deleted);
        assert_eq!(entity.updated_at, 42);
    }
}

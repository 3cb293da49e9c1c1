//! Data models for syncline

mod entity;
mod outbox;
mod stats;
mod sync_conflict;
mod sync_metadata;

pub use entity::{entity_cache_key, list_cache_prefix, Collection, Entity, EntityId, Payload};
pub use outbox::{Operation, OutboxItem, OutboxItemId, OutboxStatus};
pub use stats::SyncStats;
pub use sync_conflict::SyncConflict;
pub use sync_metadata::SyncMetadata;

//! Database layer for syncline

mod connection;
mod entity_repository;
mod metadata_repository;
mod migrations;
mod outbox_repository;

pub use connection::Database;
pub use entity_repository::{EntityRepository, SqliteEntityRepository, WriteOutcome};
pub use metadata_repository::{MetadataRepository, SqliteMetadataRepository};
pub use outbox_repository::{OutboxRepository, SqliteOutboxRepository};

//! syncline-core - Offline-first sync engine
//!
//! Local writes land in a SQLite-backed store first and are replayed to a
//! remote backend through a durable outbox. Remote changes come back via
//! scheduled delta pulls and per-scope realtime streams, merged
//! last-write-wins by `updated_at`.

pub mod backoff;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod delta;
pub mod error;
pub mod governor;
pub mod models;
pub mod orchestrator;
pub mod outbox;
pub mod realtime;
pub mod remote;
pub mod store;

pub use config::EngineConfig;
pub use error::{Error, ErrorKind, RemoteError, Result};
pub use models::{Collection, Entity, EntityId, Operation, OutboxItem, OutboxItemId, SyncStats};
pub use orchestrator::{ConnectivityEvent, SyncOrchestrator, SyncOutcome};
pub use store::LocalStore;

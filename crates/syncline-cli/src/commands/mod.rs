pub mod checkpoints;
pub mod common;
pub mod config;
pub mod conflicts;
pub mod outbox;
pub mod reset;
pub mod status;

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] syncline_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Outbox item ID cannot be empty")]
    EmptyItemId,
    #[error("Outbox item not found for id/prefix: {0}")]
    ItemNotFound(String),
    #[error("{0}")]
    AmbiguousItemId(String),
    #[error("Failed to resolve {0} directory")]
    NoDirectory(&'static str),
    #[error("Refusing to reset without --yes")]
    ResetNotConfirmed,
}

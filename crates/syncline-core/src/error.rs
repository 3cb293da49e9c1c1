//! Error types for syncline-core

use thiserror::Error;

/// Result type alias using syncline-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in syncline-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote service error
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The engine was shut down
    #[error("Sync engine has been shut down")]
    ShutDown,
}

/// Coarse classification used to decide retry and surfacing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retryable: back off and requeue.
    TransientNetwork,
    /// Validation or conflict on the remote side; terminal for the item.
    RemoteRejected,
    /// Local persistence failed for the current operation.
    LocalStoreIo,
    /// Push channel dropped; the reconciler backs off.
    ChannelDisconnected,
    /// Anything else (bad input, config, shutdown).
    Other,
}

impl Error {
    /// Classify this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Remote(remote) => remote.kind(),
            Self::Database(_) | Self::Sqlite(_) | Self::Io(_) | Self::Serialization(_) => {
                ErrorKind::LocalStoreIo
            }
            Self::NotFound(_) | Self::InvalidInput(_) | Self::Config(_) | Self::ShutDown => {
                ErrorKind::Other
            }
        }
    }

    pub(crate) fn lock_poisoned(what: &str) -> Self {
        Self::Database(format!("{what} lock poisoned"))
    }
}

/// Errors returned by the remote service.
///
/// Cloneable so that coalesced callers in the request governor can share one
/// result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Connectivity or server-side transient failure
    #[error("network failure: {0}")]
    Network(String),

    /// The call exceeded the governor timeout
    #[error("request timed out")]
    Timeout,

    /// The remote refused the request (validation, conflict, permissions)
    #[error("rejected by remote: {0}")]
    Rejected(String),

    /// Change stream closed or errored
    #[error("change channel disconnected: {0}")]
    ChannelDisconnected(String),

    /// A coalesced request was dropped before it produced a result
    #[error("coalesced request abandoned")]
    Abandoned,
}

impl RemoteError {
    /// Whether the caller should back off and try again.
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) | Self::Timeout | Self::Abandoned => ErrorKind::TransientNetwork,
            Self::Rejected(_) => ErrorKind::RemoteRejected,
            Self::ChannelDisconnected(_) => ErrorKind::ChannelDisconnected,
        }
    }
}

//! Outbox item model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

use super::{Collection, EntityId, Payload};

/// A unique identifier for an outbox item, using UUID v7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutboxItemId(Uuid);

impl OutboxItemId {
    /// Create a new unique item ID using UUID v7.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID.
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OutboxItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OutboxItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OutboxItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Mutation kind replayed against the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("Unknown operation: {other}"))),
        }
    }
}

/// Persisted outbox item state.
///
/// A retryable failure goes back to `Pending` with a future
/// `next_attempt_at`; only `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    InFlight,
    Failed,
}

impl OutboxStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InFlight => "IN_FLIGHT",
            Self::Failed => "FAILED_TERMINAL",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_FLIGHT" => Ok(Self::InFlight),
            "FAILED_TERMINAL" => Ok(Self::Failed),
            other => Err(Error::InvalidInput(format!("Unknown outbox status: {other}"))),
        }
    }
}

/// A local mutation awaiting remote confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
    /// Unique item identifier
    pub id: OutboxItemId,
    /// Monotonic creation sequence; defines replay order
    pub seq: i64,
    /// Target collection
    pub collection: Collection,
    /// Target entity
    pub entity_id: EntityId,
    /// Mutation kind
    pub operation: Operation,
    /// Payload snapshot taken at enqueue time (`None` for deletes)
    pub payload: Option<Payload>,
    /// Entity timestamp the mutation was stamped with (Unix ms)
    pub updated_at: i64,
    /// Current state
    pub status: OutboxStatus,
    /// Failed replay attempts so far
    pub retry_count: u32,
    /// Last replay error, if any
    pub last_error: Option<String>,
    /// Enqueue timestamp (Unix ms)
    pub created_at: i64,
    /// Earliest time the item may be sent again (Unix ms)
    pub next_attempt_at: i64,
    /// Stems from a just-performed user action
    pub interactive: bool,
}

impl OutboxItem {
    /// Whether the item is terminal and waiting for the user.
    pub const fn is_terminal(&self) -> bool {
        matches!(self.status, OutboxStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_item_id_parse() {
        let id = OutboxItemId::new();
        let parsed: OutboxItemId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::InFlight,
            OutboxStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!("APPLIED".parse::<OutboxStatus>().is_err());
    }

    #[test]
    fn test_operation_roundtrip() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
    }
}

//! Sync conflict model

use serde::{Deserialize, Serialize};

use super::Collection;

/// Recorded sync conflict resolved by last-write-wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Collection of the entity involved
    pub collection: Collection,
    /// Entity involved in the conflict
    pub entity_id: String,
    /// Existing row's timestamp when conflict occurred
    pub local_updated_at: i64,
    /// Incoming row's timestamp that was rejected
    pub incoming_updated_at: i64,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
    /// Resolution strategy name
    pub strategy: String,
}

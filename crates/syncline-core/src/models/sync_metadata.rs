//! Per-collection sync checkpoint

use serde::{Deserialize, Serialize};

use super::Collection;

/// Delta-sync checkpoint for one `(collection, scope)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub collection: Collection,
    /// Optional partition, e.g. a chat id for messages
    pub scope: Option<String>,
    /// High-water mark (Unix ms) used as `since` for the next pull
    pub last_synced_at: Option<i64>,
    /// Local mutations confirmed by the remote
    pub local_version: i64,
    /// Successful pull passes
    pub remote_version: i64,
    /// Last pull saw records older than the local copy
    pub has_conflict: bool,
}

impl SyncMetadata {
    /// A fresh checkpoint that has never synced.
    pub fn new(collection: Collection, scope: Option<&str>) -> Self {
        Self {
            collection,
            scope: scope.map(str::to_string),
            last_synced_at: None,
            local_version: 0,
            remote_version: 0,
            has_conflict: false,
        }
    }
}

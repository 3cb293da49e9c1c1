//! Aggregate sync statistics

use serde::{Deserialize, Serialize};

/// Snapshot of the orchestrator's sync statistics, published to subscribers
/// after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// End of the last completed pass (Unix ms)
    pub last_sync_at: Option<i64>,
    /// Outbox items confirmed by the remote since start
    pub items_synced: u64,
    /// Outbox replay failures since start (retryable and terminal)
    pub items_failed: u64,
    /// Remote records applied by delta pulls since start
    pub records_pulled: u64,
    /// Outbox items still waiting for the remote
    pub pending_count: u64,
    /// Terminal outbox items awaiting user action
    pub failed_count: u64,
    /// A pass is running
    pub in_progress: bool,
    /// Host reports connectivity
    pub online: bool,
    /// At least one realtime scope gave up reconnecting
    pub realtime_degraded: bool,
    /// Last error message, cleared by a clean pass
    pub last_error: Option<String>,
}

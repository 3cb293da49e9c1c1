use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use syncline_core::clock::SystemClock;
use syncline_core::models::{OutboxItem, SyncConflict, SyncMetadata};
use syncline_core::outbox::OutboxQueue;
use syncline_core::LocalStore;

use crate::error::CliError;

const ID_PREFIX_LEN: usize = 8;

#[derive(Debug, Serialize)]
pub struct OutboxListItem {
    pub id: String,
    pub collection: String,
    pub entity_id: String,
    pub operation: String,
    pub status: String,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub next_attempt_at: i64,
}

#[derive(Debug, Serialize)]
pub struct CheckpointItem {
    pub collection: String,
    pub scope: Option<String>,
    pub last_synced_at: Option<i64>,
    pub last_synced_at_iso: Option<String>,
    pub local_version: i64,
    pub remote_version: i64,
    pub has_conflict: bool,
}

#[derive(Debug, Serialize)]
pub struct SyncConflictItem {
    pub id: i64,
    pub collection: String,
    pub entity_id: String,
    pub local_updated_at: i64,
    pub incoming_updated_at: i64,
    pub resolved_at: i64,
    pub resolved_at_iso: String,
    pub strategy: String,
}

pub fn open_store(db_path: &Path) -> Result<LocalStore, CliError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(LocalStore::open(db_path, Arc::new(SystemClock))?)
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn normalize_item_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyItemId)
    } else {
        Ok(trimmed.to_string())
    }
}

/// Resolve a full outbox id or a unique prefix of one.
pub fn resolve_item(queue: &OutboxQueue, id: &str) -> Result<OutboxItem, CliError> {
    let id = normalize_item_identifier(id)?;
    queue.resolve(&id).map_err(|error| match error {
        syncline_core::Error::NotFound(_) => CliError::ItemNotFound(id),
        syncline_core::Error::InvalidInput(message) => CliError::AmbiguousItemId(message),
        other => CliError::Core(other),
    })
}

pub fn short_id(id: &str) -> &str {
    id.get(..ID_PREFIX_LEN).unwrap_or(id)
}

pub fn outbox_to_list_item(item: &OutboxItem) -> OutboxListItem {
    OutboxListItem {
        id: item.id.to_string(),
        collection: item.collection.to_string(),
        entity_id: item.entity_id.to_string(),
        operation: item.operation.to_string(),
        status: item.status.to_string(),
        retry_count: item.retry_count,
        last_error: item.last_error.clone(),
        created_at: item.created_at,
        next_attempt_at: item.next_attempt_at,
    }
}

pub fn format_outbox_lines(items: &[OutboxItem], now_ms: i64) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            let id = item.id.to_string();
            let mut line = format!(
                "{}  {:<15}  {:<6}  {}/{}  retries={}  {}",
                short_id(&id),
                item.status.as_str(),
                item.operation.as_str(),
                item.collection,
                item.entity_id,
                item.retry_count,
                format_relative_time(item.created_at, now_ms)
            );
            if let Some(error) = &item.last_error {
                line.push_str(&format!("  error: {error}"));
            }
            line
        })
        .collect()
}

pub fn checkpoint_to_item(metadata: &SyncMetadata) -> CheckpointItem {
    CheckpointItem {
        collection: metadata.collection.to_string(),
        scope: metadata.scope.clone(),
        last_synced_at: metadata.last_synced_at,
        last_synced_at_iso: metadata
            .last_synced_at
            .and_then(chrono::DateTime::from_timestamp_millis)
            .map(|date_time| date_time.to_rfc3339()),
        local_version: metadata.local_version,
        remote_version: metadata.remote_version,
        has_conflict: metadata.has_conflict,
    }
}

pub fn format_checkpoint_lines(checkpoints: &[SyncMetadata], now_ms: i64) -> Vec<String> {
    checkpoints
        .iter()
        .map(|metadata| {
            let target = metadata.scope.as_ref().map_or_else(
                || metadata.collection.to_string(),
                |scope| format!("{}:{scope}", metadata.collection),
            );
            let synced = metadata.last_synced_at.map_or_else(
                || "never synced".to_string(),
                |at| format!("synced {}", format_relative_time(at, now_ms)),
            );
            let conflict = if metadata.has_conflict { "  conflict" } else { "" };
            format!(
                "{target:<24}  {synced:<18}  local=v{} remote=v{}{conflict}",
                metadata.local_version, metadata.remote_version
            )
        })
        .collect()
}

pub fn sync_conflict_to_item(conflict: &SyncConflict) -> SyncConflictItem {
    SyncConflictItem {
        id: conflict.id,
        collection: conflict.collection.to_string(),
        entity_id: conflict.entity_id.clone(),
        local_updated_at: conflict.local_updated_at,
        incoming_updated_at: conflict.incoming_updated_at,
        resolved_at: conflict.resolved_at,
        resolved_at_iso: format_sync_timestamp(conflict.resolved_at),
        strategy: conflict.strategy.clone(),
    }
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<4}  {}={}  local={} incoming={}",
                format_sync_timestamp(conflict.resolved_at),
                conflict.strategy,
                conflict.collection,
                conflict.entity_id,
                conflict.local_updated_at,
                conflict.incoming_updated_at
            )
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms - timestamp_ms;
    if diff < 0 {
        return format!("in {}", format_span(-diff));
    }
    if diff < 60_000 {
        return "just now".to_string();
    }
    format!("{} ago", format_span(diff))
}

fn format_span(diff: i64) -> String {
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        format!("{}s", diff / 1000)
    } else if diff < hour {
        format!("{}m", diff / minute)
    } else if diff < day {
        format!("{}h", diff / hour)
    } else {
        format!("{}d", diff / day)
    }
}

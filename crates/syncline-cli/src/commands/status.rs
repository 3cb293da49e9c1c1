use serde::Serialize;
use syncline_core::outbox::OutboxQueue;
use syncline_core::LocalStore;

use crate::commands::common::{
    checkpoint_to_item, format_checkpoint_lines, format_relative_time, now_ms, CheckpointItem,
};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub pending: usize,
    pub failed: usize,
    pub next_retry_at: Option<i64>,
    pub checkpoints: Vec<CheckpointItem>,
}

pub fn build_status(store: &LocalStore) -> Result<StatusReport, CliError> {
    let queue = OutboxQueue::new(store.clone());
    Ok(StatusReport {
        pending: queue.pending_count()?,
        failed: queue.failed_count()?,
        next_retry_at: queue.next_retry_at()?,
        checkpoints: store
            .list_metadata()?
            .iter()
            .map(checkpoint_to_item)
            .collect(),
    })
}

pub fn run_status(store: &LocalStore, as_json: bool) -> Result<(), CliError> {
    if as_json {
        let report = build_status(store)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let queue = OutboxQueue::new(store.clone());
    let now = now_ms();
    println!("Pending: {}", queue.pending_count()?);
    println!("Failed:  {}", queue.failed_count()?);
    if let Some(next) = queue.next_retry_at()? {
        println!("Next attempt: {}", format_relative_time(next, now));
    }

    let checkpoints = store.list_metadata()?;
    if checkpoints.is_empty() {
        println!("No checkpoints yet.");
        return Ok(());
    }
    println!();
    for line in format_checkpoint_lines(&checkpoints, now) {
        println!("{line}");
    }
    Ok(())
}

use syncline_core::outbox::OutboxQueue;
use syncline_core::LocalStore;

use crate::cli::OutboxCommands;
use crate::commands::common::{
    format_outbox_lines, now_ms, outbox_to_list_item, resolve_item, OutboxListItem,
};
use crate::error::CliError;

pub fn run_outbox(store: &LocalStore, command: OutboxCommands) -> Result<(), CliError> {
    let queue = OutboxQueue::new(store.clone());
    match command {
        OutboxCommands::List { failed, json } => run_outbox_list(&queue, failed, json),
        OutboxCommands::Retry { id } => run_outbox_retry(&queue, &id),
        OutboxCommands::Dismiss { id } => run_outbox_dismiss(&queue, &id),
    }
}

pub fn run_outbox_list(queue: &OutboxQueue, failed_only: bool, as_json: bool) -> Result<(), CliError> {
    let items = if failed_only {
        queue.failed()?
    } else {
        queue.items()?
    };

    if as_json {
        let json_items = items
            .iter()
            .map(outbox_to_list_item)
            .collect::<Vec<OutboxListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("Outbox is empty.");
        return Ok(());
    }
    for line in format_outbox_lines(&items, now_ms()) {
        println!("{line}");
    }
    Ok(())
}

pub fn run_outbox_retry(queue: &OutboxQueue, id: &str) -> Result<(), CliError> {
    let item = resolve_item(queue, id)?;
    queue.retry(&item.id)?;
    println!("Requeued {}", item.id);
    Ok(())
}

pub fn run_outbox_dismiss(queue: &OutboxQueue, id: &str) -> Result<(), CliError> {
    let item = resolve_item(queue, id)?;
    queue.dismiss(&item.id)?;
    println!("Dismissed {}", item.id);
    Ok(())
}

use syncline_core::LocalStore;

use crate::commands::common::{
    format_sync_conflict_lines, sync_conflict_to_item, SyncConflictItem,
};
use crate::error::CliError;

pub fn run_conflicts(store: &LocalStore, limit: usize, as_json: bool) -> Result<(), CliError> {
    let conflicts = store.list_conflicts(limit)?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(sync_conflict_to_item)
            .collect::<Vec<SyncConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_sync_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

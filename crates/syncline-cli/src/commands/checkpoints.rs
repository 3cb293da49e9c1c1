use syncline_core::LocalStore;

use crate::commands::common::{
    checkpoint_to_item, format_checkpoint_lines, now_ms, CheckpointItem,
};
use crate::error::CliError;

pub fn run_checkpoints(store: &LocalStore, as_json: bool) -> Result<(), CliError> {
    let checkpoints = store.list_metadata()?;

    if as_json {
        let json_items = checkpoints
            .iter()
            .map(checkpoint_to_item)
            .collect::<Vec<CheckpointItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if checkpoints.is_empty() {
        println!("No checkpoints yet.");
        return Ok(());
    }
    for line in format_checkpoint_lines(&checkpoints, now_ms()) {
        println!("{line}");
    }
    Ok(())
}

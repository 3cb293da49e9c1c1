use std::path::Path;

use syncline_core::EngineConfig;

use crate::cli::ConfigCommands;
use crate::error::CliError;

pub fn run_config(command: &ConfigCommands, config_path: &Path) -> Result<(), CliError> {
    match command {
        ConfigCommands::Show => {
            let config = load_effective_config(config_path)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommands::Path => println!("{}", config_path.display()),
    }
    Ok(())
}

/// The config file (defaults when absent) with `SYNCLINE_*` overrides applied.
pub fn load_effective_config(config_path: &Path) -> Result<EngineConfig, CliError> {
    let mut config = EngineConfig::load_from_path(config_path)?;
    config.apply_process_env()?;
    Ok(config)
}

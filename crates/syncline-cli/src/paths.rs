//! Default file locations.

use std::env;
use std::path::PathBuf;

use crate::error::CliError;

const APP_DIR: &str = "syncline";

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    cli_db_path
        .or_else(|| env::var_os("SYNCLINE_DB_PATH").map(PathBuf::from))
        .map_or_else(default_db_path, Ok)
}

pub fn resolve_config_path(cli_config_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    cli_config_path
        .or_else(|| env::var_os("SYNCLINE_CONFIG").map(PathBuf::from))
        .map_or_else(default_config_path, Ok)
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    let data_dir = dirs::data_dir().ok_or(CliError::NoDirectory("data"))?;
    Ok(data_dir.join(APP_DIR).join("syncline.db"))
}

pub fn default_config_path() -> Result<PathBuf, CliError> {
    let config_dir = dirs::config_dir().ok_or(CliError::NoDirectory("config"))?;
    Ok(config_dir.join(APP_DIR).join("config.json"))
}

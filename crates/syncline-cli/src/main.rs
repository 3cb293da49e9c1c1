//! syncline CLI - operator tool for a syncline local store
//!
//! Works on the local database only: shows what is queued and what was
//! pulled, and lets an operator retry or dismiss failed mutations.

mod cli;
mod commands;
mod error;
mod paths;


use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::error::CliError;

fn main() {
    if let Err(error) = run() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = paths::resolve_config_path(cli.config)?;
    let open_store = || {
        let db_path = paths::resolve_db_path(cli.db_path.clone())?;
        commands::common::open_store(&db_path)
    };

    match cli.command {
        Commands::Status { json } => commands::status::run_status(&open_store()?, json),
        Commands::Outbox { command } => commands::outbox::run_outbox(&open_store()?, command),
        Commands::Checkpoints { json } => {
            commands::checkpoints::run_checkpoints(&open_store()?, json)
        }
        Commands::Conflicts { limit, json } => {
            commands::conflicts::run_conflicts(&open_store()?, limit, json)
        }
        Commands::Reset { yes } => commands::reset::run_reset(&open_store()?, yes),
        Commands::Config { command } => commands::config::run_config(&command, &config_path),
    }
}

fn init_tracing(verbose: bool) {
    let directive = if verbose { "syncline=debug" } else { "syncline=info" };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(
        directive
            .parse()
            .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into()),
    );
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

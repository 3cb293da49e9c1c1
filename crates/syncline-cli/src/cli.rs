use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "syncline")]
#[command(about = "Inspect and repair the local state of a syncline sync engine")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to the local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to the engine config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show outbox counts and checkpoint summary
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and manage queued mutations
    Outbox {
        #[command(subcommand)]
        command: OutboxCommands,
    },
    /// List delta-sync checkpoints
    Checkpoints {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recently resolved sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Wipe all local entities, checkpoints, queued mutations and conflicts
    Reset {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },
    /// Show engine configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum OutboxCommands {
    /// List queued mutations in replay order
    List {
        /// Only show items that failed permanently
        #[arg(long)]
        failed: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Give a failed item a fresh set of attempts
    Retry {
        /// Item ID or unique ID prefix
        id: String,
    },
    /// Discard a failed item
    Dismiss {
        /// Item ID or unique ID prefix
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration (file, then environment overrides)
    Show,
    /// Print the config file location
    Path,
}

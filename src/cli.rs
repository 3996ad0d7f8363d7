// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `slotdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "slotdag",
    version,
    about = "Dispatch dependent tasks to agent runners in isolated repository slots.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, global = true, value_name = "PATH", default_value = "Slotdag.toml")]
    pub config: PathBuf,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `SLOTDAG_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the dispatcher loop.
    Run {
        /// Exit once nothing is queued, running or backing off.
        #[arg(long)]
        once: bool,

        /// Plan and log assignments without touching slots or runners.
        #[arg(long)]
        dry_run: bool,
    },

    /// Create a task set from a TOML definition file.
    Ingest {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Show the tasks of a set and their states.
    Status {
        #[arg(value_name = "SET")]
        set: String,
    },

    /// Print a set's event log.
    Events {
        #[arg(value_name = "SET")]
        set: String,
    },

    /// Show slot pools and their slots.
    Pools,

    /// Rebuild an errored slot and put it back into service.
    RepairSlot {
        #[arg(value_name = "SLOT_ID")]
        slot_id: String,
    },

    /// Move a finished set out of the active registry.
    Archive {
        #[arg(value_name = "SET")]
        set: String,
    },

    /// Reconstruct a set from its event log and persist it.
    Rebuild {
        #[arg(value_name = "SET")]
        set: String,
    },

    /// Reclaim stale slot and task-set leases.
    Sweep,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

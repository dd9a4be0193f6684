//! Command-line interface

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Autonomous supervisor daemon for a personal compute host
#[derive(Debug, Parser)]
#[command(name = "orchd", version, about)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the supervisor daemon
    Start {
        /// Run in the foreground instead of detaching
        #[arg(short, long)]
        foreground: bool,
    },

    /// Stop the running daemon
    Stop,

    /// Show daemon and supervisor status
    Status,

    /// Run one think cycle in the foreground and exit
    Think,

    /// Internal: the detached daemon entry point
    #[command(hide = true, name = "run-daemon")]
    RunDaemon,
}

//! Command-line interface for wastetrail.
//!
//! This module provides the CLI structure for the `wtrail` binary, an
//! operator tool over the same core the service uses.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    parse_container, AuditCommand, ConfigCommand, ContainerCommand, HandoffCommand,
    HandoffTypeArg, LocationCommand, PointArgs, ReceiverArgs, SessionCommand,
};

/// wtrail - Track medical-waste collection and custody
///
/// Start and stop collection sessions, record locations and visits, and move
/// custody through confirmed handoffs with a verifiable audit trail.
#[derive(Debug, Parser)]
#[command(name = "wtrail")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start, stop, and inspect collection sessions
    #[command(subcommand)]
    Session(SessionCommand),

    /// Report GPS fixes
    #[command(subcommand)]
    Location(LocationCommand),

    /// Create and advance custody handoffs
    #[command(subcommand)]
    Handoff(HandoffCommand),

    /// Inspect and verify custody trails
    #[command(subcommand)]
    Audit(AuditCommand),

    /// Manage the container registry
    #[command(subcommand)]
    Container(ContainerCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        crate::logging::Verbosity::from_flags(self.quiet, self.verbose)
    }
}

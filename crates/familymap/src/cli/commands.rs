//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

use crate::config::SourceKind;

/// Run command arguments.
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Position source to watch, overriding the configuration
    #[arg(short, long, value_enum)]
    pub source: Option<SourceArg>,

    /// Write the map page here instead of the configured path
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Don't listen for roster changes
    #[arg(long)]
    pub no_realtime: bool,
}

/// Email and password for sign-in and sign-up.
#[derive(Debug, Args)]
pub struct CredentialArgs {
    /// Account email
    #[arg(short, long)]
    pub email: String,

    /// Account password (read from stdin when omitted)
    #[arg(short, long)]
    pub password: Option<String>,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Members command arguments.
#[derive(Debug, Args)]
pub struct MembersCommand {
    /// Show the cached roster instead of fetching
    #[arg(long)]
    pub cached: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

/// Map command arguments.
#[derive(Debug, Args)]
pub struct MapCommand {
    /// Write the map page here instead of the configured path
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

/// Publish command arguments.
#[derive(Debug, Args)]
pub struct PublishCommand {
    /// Latitude to publish (read from the position source when omitted)
    #[arg(long, allow_hyphen_values = true, requires = "lng")]
    pub lat: Option<f64>,

    /// Longitude to publish
    #[arg(long, allow_hyphen_values = true, requires = "lat")]
    pub lng: Option<f64>,
}

/// Local cache commands.
#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Delete the remembered session and roster
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Show cache statistics
    Stats {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Position source argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceArg {
    /// A gpsd daemon
    Gpsd,
    /// The configured fixed coordinates
    Fixed,
}

impl From<SourceArg> for SourceKind {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Gpsd => Self::Gpsd,
            SourceArg::Fixed => Self::Fixed,
        }
    }
}

/// Output format for commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output
    #[default]
    Plain,
    /// Formatted table
    Table,
    /// JSON output
    Json,
}

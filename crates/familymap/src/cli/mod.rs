//! Command-line interface for familymap.
//!
//! This module provides the CLI structure for the `famap` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    CacheCommand, ConfigCommand, CredentialArgs, MapCommand, MembersCommand, OutputFormat,
    PublishCommand, RunCommand, SourceArg, StatusCommand,
};

/// famap - See where your family is, live
///
/// Shares this device's position with your family and keeps a map of
/// everyone's last known location up to date.
#[derive(Debug, Parser)]
#[command(name = "famap")]
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
    /// Share your location and follow the family map
    Run(RunCommand),

    /// Sign in to an existing account
    #[command(name = "signin")]
    SignIn(CredentialArgs),

    /// Create an account
    #[command(name = "signup")]
    SignUp(CredentialArgs),

    /// Sign out and forget the session
    #[command(name = "signout")]
    SignOut,

    /// Show session and cache status
    Status(StatusCommand),

    /// List family members and their last update
    Members(MembersCommand),

    /// Write the map page once
    Map(MapCommand),

    /// Publish this device's position once
    Publish(PublishCommand),

    /// Manage the local cache
    #[command(subcommand)]
    Cache(CacheCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}

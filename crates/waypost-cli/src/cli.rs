//! Clap CLI definitions for Waypost.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  waypost keygen                Create the node identity key
  waypost roles                 Show which listener serves which role
  waypost start                 Run the node until Ctrl+C";

/// Waypost: identity hosting, profile search and application-service relay.
#[derive(Parser)]
#[command(name = "waypost", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the node and serve until interrupted.
    Start,
    /// Generate a new node identity key.
    Keygen {
        /// Where to write the key (defaults to the configured key path).
        #[arg(long)]
        out: Option<PathBuf>,
        /// Replace an existing key.
        #[arg(long)]
        force: bool,
    },
    /// Print the configured listener layout.
    Roles,
}

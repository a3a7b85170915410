//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "tblocker")]
#[command(author, version, about = "Time-bounded kernel blocking of addresses flagged in proxy logs")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch the log and block offending addresses until stopped
    Run,

    /// Show stored blocks and the live firewall state. As root this
    /// re-creates the managed chain or table if it is missing
    Status,

    /// Remove the managed chain/table from every backend (stored blocks are kept)
    Cleanup,

    /// Show version
    Version,
}

//! # strata-cli
//!
//! Command-line interface for the strata merge engine.
//!
//! ## Commands
//!
//! - `strata run` - Merge a JSONL batch into a source
//! - `strata status` - Show freshness per source
//! - `strata history` - Show dimension history or current view
//! - `strata resolve` - Resolve a dimension key at a point in time
//! - `strata dead-letters` - List quarantined records
//!
//! ## Configuration
//!
//! The CLI uses environment variables or command-line flags for settings:
//!
//! - `STRATA_STATE` - Warehouse snapshot file (default: `strata-state.json`)
//! - `STRATA_CONFIG` - Engine configuration YAML (default: `strata.yaml`)
//! - `STRATA_LOG_FORMAT` - `pretty` or `json` log output on stderr

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod commands;
pub mod workspace;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// strata - CDC / SCD2 merge command-line interface.
#[derive(Debug, Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Warehouse snapshot file; created on first write.
    #[arg(long, env = "STRATA_STATE", default_value = "strata-state.json")]
    pub state: PathBuf,

    /// Engine configuration file.
    #[arg(long, env = "STRATA_CONFIG", default_value = "strata.yaml")]
    pub config: PathBuf,

    /// Output format.
    #[arg(long, default_value = "text")]
    pub format: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Get the effective configuration.
    #[must_use]
    pub fn config(&self) -> Config {
        Config {
            state_path: self.state.clone(),
            config_path: self.config.clone(),
            format: self.format.clone(),
        }
    }
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Merge a batch of records into a source.
    Run(commands::run::RunArgs),
    /// Show freshness per source.
    Status(commands::status::StatusArgs),
    /// Show dimension history.
    History(commands::history::HistoryArgs),
    /// Resolve a dimension key at a point in time.
    Resolve(commands::resolve::ResolveArgs),
    /// List quarantined records.
    DeadLetters(commands::dead_letters::DeadLettersArgs),
}

/// Output format.
#[derive(Debug, Clone, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
    /// Table output.
    Table,
}

/// CLI configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Warehouse snapshot file.
    pub state_path: PathBuf,
    /// Engine configuration file.
    pub config_path: PathBuf,
    /// Output format.
    pub format: OutputFormat,
}

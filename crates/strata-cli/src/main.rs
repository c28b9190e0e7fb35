//! strata CLI - merge batches and inspect warehouse state.
//!
//! The main entry point for the `strata` CLI binary.

use anyhow::Result;
use clap::Parser;

use strata_cli::{Cli, Commands};
use strata_core::{LogFormat, init_logging};

fn main() -> Result<()> {
    init_logging(LogFormat::from_env());
    strata_merge::metrics::register_metrics();

    // Parse CLI arguments
    let cli = Cli::parse();
    let config = cli.config();

    // Create runtime and execute
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match cli.command {
            Commands::Run(args) => strata_cli::commands::run::execute(args, &config).await,
            Commands::Status(args) => strata_cli::commands::status::execute(&args, &config).await,
            Commands::History(args) => strata_cli::commands::history::execute(&args, &config).await,
            Commands::Resolve(args) => strata_cli::commands::resolve::execute(&args, &config).await,
            Commands::DeadLetters(args) => {
                strata_cli::commands::dead_letters::execute(&args, &config).await
            }
        }
    })
}

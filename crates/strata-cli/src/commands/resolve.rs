//! Resolve command - find the dimension version valid at a point in time.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use owo_colors::OwoColorize;

use crate::commands::history::format_attributes;
use crate::workspace::Workspace;
use crate::{Config, OutputFormat};

/// Arguments for the resolve command.
#[derive(Debug, Args)]
pub struct ResolveArgs {
    /// Dimension source.
    #[arg(long, short = 's')]
    pub source: String,

    /// Natural key.
    #[arg(long, short = 'k')]
    pub key: String,

    /// Point in time (RFC 3339).
    #[arg(long)]
    pub as_of: DateTime<Utc>,
}

/// Execute the resolve command.
///
/// Prints `unknown` when no version of the key was valid at `--as-of`.
///
/// # Errors
///
/// Returns an error if the workspace cannot be loaded or storage reads fail.
pub async fn execute(args: &ResolveArgs, config: &Config) -> Result<()> {
    let workspace = Workspace::open(config)?;
    let version = workspace
        .engine
        .resolve(&args.source, &args.key, args.as_of)
        .await?;

    match config.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&version)?);
        }
        OutputFormat::Text | OutputFormat::Table => match &version {
            Some(v) => {
                println!("{} {}", v.natural_key, v.surrogate_key.green());
                println!("  valid from: {}", v.valid_from.to_rfc3339());
                match v.valid_to {
                    Some(to) => println!("  valid to:   {}", to.to_rfc3339()),
                    None => println!("  valid to:   open"),
                }
                println!("  attributes: {}", format_attributes(&v.attributes)?);
            }
            None => println!("{} {}", args.key, "unknown".yellow()),
        },
    }

    Ok(())
}

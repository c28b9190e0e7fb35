//! Dead-letters command - list quarantined records.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use owo_colors::OwoColorize;

use strata_core::DeadLetterQuery;

use crate::workspace::Workspace;
use crate::{Config, OutputFormat};

/// Arguments for the dead-letters command.
#[derive(Debug, Args)]
pub struct DeadLettersArgs {
    /// Only show this source.
    #[arg(long, short = 's')]
    pub source: Option<String>,

    /// Earliest failure time to include (RFC 3339).
    #[arg(long)]
    pub since: Option<DateTime<Utc>>,

    /// Failure time to stop before (RFC 3339).
    #[arg(long)]
    pub until: Option<DateTime<Utc>>,
}

impl DeadLettersArgs {
    fn query(&self) -> DeadLetterQuery {
        DeadLetterQuery {
            source: self.source.clone(),
            since: self.since,
            until: self.until,
        }
    }
}

/// Execute the dead-letters command.
///
/// # Errors
///
/// Returns an error if the workspace cannot be loaded or storage reads fail.
pub async fn execute(args: &DeadLettersArgs, config: &Config) -> Result<()> {
    let workspace = Workspace::open(config)?;
    let entries = workspace.engine.dead_letters(&args.query()).await?;

    match config.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        OutputFormat::Text => {
            if entries.is_empty() {
                println!("No dead letters");
                return Ok(());
            }
            for entry in &entries {
                let key = if entry.natural_key.is_empty() {
                    "<no key>"
                } else {
                    entry.natural_key.as_str()
                };
                println!(
                    "  {} {}/{} {}",
                    entry.first_failed_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.source,
                    key,
                    entry.reason.red()
                );
            }
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct DeadLetterRow {
                #[tabled(rename = "Failed At")]
                failed_at: String,
                #[tabled(rename = "Source")]
                source: String,
                #[tabled(rename = "Key")]
                key: String,
                #[tabled(rename = "Reason")]
                reason: String,
                #[tabled(rename = "Load Time")]
                load_timestamp: String,
            }

            let rows: Vec<_> = entries
                .iter()
                .map(|e| DeadLetterRow {
                    failed_at: e.first_failed_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    source: e.source.clone(),
                    key: e.natural_key.clone(),
                    reason: e.reason.to_string(),
                    load_timestamp: e.record.load_timestamp.to_rfc3339(),
                })
                .collect();
            if rows.is_empty() {
                println!("No dead letters");
            } else {
                println!("{}", Table::new(rows));
            }
        }
    }

    Ok(())
}

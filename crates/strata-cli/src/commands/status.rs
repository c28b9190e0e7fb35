//! Status command - show freshness per source.

use anyhow::Result;
use clap::Args;
use owo_colors::OwoColorize;

use strata_merge::{FreshnessStatus, Health};

use crate::workspace::Workspace;
use crate::{Config, OutputFormat};

/// Arguments for the status command.
#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Only show this source.
    #[arg(long, short = 's')]
    pub source: Option<String>,
}

/// Execute the status command.
///
/// # Errors
///
/// Returns an error if the workspace cannot be loaded or storage reads fail.
pub async fn execute(args: &StatusArgs, config: &Config) -> Result<()> {
    let workspace = Workspace::open(config)?;
    let statuses = match &args.source {
        Some(source) => vec![workspace.engine.freshness().status(source).await?],
        None => workspace.engine.freshness_report().await?,
    };

    match config.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
        OutputFormat::Text => {
            if statuses.is_empty() {
                println!("No sources configured");
                return Ok(());
            }
            for status in &statuses {
                println!(
                    "  {} {} (lag {}, last load {})",
                    status.source,
                    format_health_colored(status.health),
                    format_lag(status),
                    format_last_load(status)
                );
            }
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct SourceRow {
                #[tabled(rename = "Source")]
                source: String,
                #[tabled(rename = "Health")]
                health: String,
                #[tabled(rename = "Lag")]
                lag: String,
                #[tabled(rename = "Last Load")]
                last_load: String,
            }

            let rows: Vec<_> = statuses
                .iter()
                .map(|s| SourceRow {
                    source: s.source.clone(),
                    health: s.health.to_string(),
                    lag: format_lag(s),
                    last_load: format_last_load(s),
                })
                .collect();
            println!("{}", Table::new(rows));
        }
    }

    Ok(())
}

fn format_health_colored(health: Health) -> String {
    match health {
        Health::Ok => health.green().to_string(),
        Health::Warn => health.yellow().to_string(),
        Health::Error => health.red().to_string(),
    }
}

fn format_lag(status: &FreshnessStatus) -> String {
    status.lag.map_or_else(
        || "-".to_string(),
        |lag| {
            let secs = lag.as_secs();
            format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
        },
    )
}

fn format_last_load(status: &FreshnessStatus) -> String {
    status.last_load_timestamp.map_or_else(
        || "never".to_string(),
        |ts| ts.format("%Y-%m-%d %H:%M:%S").to_string(),
    )
}

//! History command - show dimension versions.

use anyhow::{Context, Result};
use clap::Args;
use owo_colors::OwoColorize;

use strata_core::{Attributes, DimensionVersion};

use crate::workspace::Workspace;
use crate::{Config, OutputFormat};

/// Arguments for the history command.
#[derive(Debug, Args)]
pub struct HistoryArgs {
    /// Dimension source.
    #[arg(long, short = 's')]
    pub source: String,

    /// Only show this natural key.
    #[arg(long, short = 'k')]
    pub key: Option<String>,

    /// Only show current versions.
    #[arg(long)]
    pub current_only: bool,
}

/// Execute the history command.
///
/// # Errors
///
/// Returns an error if the workspace cannot be loaded or storage reads fail.
pub async fn execute(args: &HistoryArgs, config: &Config) -> Result<()> {
    let workspace = Workspace::open(config)?;
    let engine = &workspace.engine;

    let mut versions = if args.current_only {
        engine.current_view(&args.source).await?
    } else {
        engine.history(&args.source).await?
    };
    if let Some(key) = &args.key {
        versions.retain(|v| &v.natural_key == key);
    }

    match config.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&versions)?);
        }
        OutputFormat::Text => {
            if versions.is_empty() {
                println!("No versions found");
                return Ok(());
            }
            let mut last_key: Option<&str> = None;
            for version in &versions {
                if last_key != Some(version.natural_key.as_str()) {
                    println!("{}", version.natural_key.bold());
                    last_key = Some(&version.natural_key);
                }
                let marker = if version.is_current {
                    "current".green().to_string()
                } else {
                    "closed".dimmed().to_string()
                };
                println!(
                    "  {} [{}, {}) {} {}",
                    version.surrogate_key,
                    version.valid_from.to_rfc3339(),
                    format_valid_to(version),
                    marker,
                    format_attributes(&version.attributes)?
                );
            }
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct VersionRow {
                #[tabled(rename = "Key")]
                key: String,
                #[tabled(rename = "SK")]
                surrogate_key: String,
                #[tabled(rename = "Valid From")]
                valid_from: String,
                #[tabled(rename = "Valid To")]
                valid_to: String,
                #[tabled(rename = "Current")]
                current: bool,
                #[tabled(rename = "Attributes")]
                attributes: String,
            }

            let rows = versions
                .iter()
                .map(|v| {
                    Ok(VersionRow {
                        key: v.natural_key.clone(),
                        surrogate_key: v.surrogate_key.to_string(),
                        valid_from: v.valid_from.to_rfc3339(),
                        valid_to: format_valid_to(v),
                        current: v.is_current,
                        attributes: format_attributes(&v.attributes)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            println!("{}", Table::new(rows));
        }
    }

    Ok(())
}

fn format_valid_to(version: &DimensionVersion) -> String {
    version
        .valid_to
        .map_or_else(|| "open".to_string(), |t| t.to_rfc3339())
}

pub(crate) fn format_attributes(attributes: &Attributes) -> Result<String> {
    serde_json::to_string(attributes).context("serializing attributes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_args_parsing() {
        use clap::Parser;

        #[derive(Parser)]
        struct TestCli {
            #[command(flatten)]
            args: HistoryArgs,
        }

        let cli = TestCli::parse_from(["test", "-s", "customers", "-k", "C001"]);
        assert_eq!(cli.args.key.as_deref(), Some("C001"));
        assert!(!cli.args.current_only);
    }

    #[test]
    fn test_attributes_render_as_json() {
        let mut attributes = Attributes::new();
        attributes.insert("segment".into(), "growth".into());
        attributes.insert("seats".into(), 12_i64.into());
        assert_eq!(
            format_attributes(&attributes).unwrap(),
            r#"{"seats":12,"segment":"growth"}"#
        );
    }
}

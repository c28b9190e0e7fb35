//! Run command - merge a JSONL batch into a source.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use owo_colors::OwoColorize;
use serde::Deserialize;

use strata_core::{Attributes, BatchId, BatchIngestRecord};
use strata_merge::{CancelFlag, FullRefreshOptions, RunSummary};

use crate::workspace::Workspace;
use crate::{Config, OutputFormat};

/// Arguments for the run command.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Source to merge into.
    #[arg(long, short = 's')]
    pub source: String,

    /// JSON Lines file with one record per line.
    #[arg(long, short = 'i')]
    pub input: PathBuf,

    /// Rebuild history for every key in the input instead of merging.
    #[arg(long)]
    pub full_refresh: bool,

    /// Report what a full refresh would change without writing anything.
    #[arg(long, requires = "full_refresh")]
    pub dry_run: bool,
}

/// One line of the input file.
#[derive(Debug, Deserialize)]
struct InputLine {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    natural_key: String,
    #[serde(default)]
    attributes: Attributes,
    load_timestamp: DateTime<Utc>,
    #[serde(default)]
    batch_id: Option<BatchId>,
    #[serde(default)]
    sequence: Option<u64>,
}

/// Reads a JSONL batch file.
///
/// Lines without a `source` belong to `source`; lines without a `batch_id`
/// share one batch generated for the file, and a missing `sequence` defaults
/// to the line position. Blank lines are ignored.
///
/// # Errors
///
/// Returns an error naming the line number of the first unparseable line.
pub fn read_batch(path: &Path, source: &str) -> Result<Vec<BatchIngestRecord>> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file_batch = BatchId::generate();

    let mut records = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: InputLine = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid record", path.display(), index + 1))?;
        records.push(BatchIngestRecord {
            source: parsed.source.unwrap_or_else(|| source.to_string()),
            natural_key: parsed.natural_key,
            attributes: parsed.attributes,
            load_timestamp: parsed.load_timestamp,
            batch_id: parsed.batch_id.unwrap_or(file_batch),
            sequence: parsed.sequence.unwrap_or(index as u64),
        });
    }
    Ok(records)
}

/// Execute the run command.
///
/// State is saved even when the run aborts so that committed keys survive;
/// a dry run never saves.
///
/// # Errors
///
/// Returns an error if the input or workspace cannot be loaded, the source
/// is unknown, or the run was aborted or cancelled.
pub async fn execute(args: RunArgs, config: &Config) -> Result<()> {
    let records = read_batch(&args.input, &args.source)?;
    let workspace = Workspace::open(config)?;

    tracing::info!(
        source = %args.source,
        records = records.len(),
        full_refresh = args.full_refresh,
        "starting run"
    );

    let cancel = CancelFlag::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; finishing in-flight keys");
                cancel.cancel();
            }
        })
    };

    let result = if args.full_refresh {
        let options = FullRefreshOptions {
            dry_run: args.dry_run,
        };
        workspace
            .engine
            .run_full_refresh(&args.source, records, options, &cancel)
            .await
    } else {
        workspace
            .engine
            .run_incremental(&args.source, records, &cancel)
            .await
    };
    watcher.abort();
    let summary = result?;

    if !summary.dry_run {
        workspace.save()?;
    }

    print_summary(&summary, config)?;

    if let Some(reason) = &summary.aborted {
        anyhow::bail!("run {} aborted: {reason}", summary.run_id);
    }
    if summary.cancelled {
        anyhow::bail!("run {} cancelled", summary.run_id);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, config: &Config) -> Result<()> {
    match config.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(summary)?);
        }
        OutputFormat::Text => {
            print!("{summary}");
            if summary.is_success() {
                println!("{}", "succeeded".green());
            } else if summary.aborted.is_some() || summary.cancelled {
                println!("{}", "incomplete".red());
            } else {
                println!("{}", "completed with failures".yellow());
            }
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct CountRow {
                #[tabled(rename = "Outcome")]
                outcome: &'static str,
                #[tabled(rename = "Records")]
                records: usize,
            }

            let c = &summary.counts;
            let rows = vec![
                CountRow { outcome: "inserted", records: c.inserted },
                CountRow { outcome: "updated", records: c.updated },
                CountRow { outcome: "no change", records: c.no_change },
                CountRow { outcome: "late arrival", records: c.late_arrivals },
                CountRow { outcome: "fact inserted", records: c.facts_inserted },
                CountRow { outcome: "fact updated", records: c.facts_updated },
                CountRow { outcome: "fact unchanged", records: c.facts_unchanged },
                CountRow { outcome: "fact stale", records: c.facts_stale },
                CountRow { outcome: "skipped", records: c.skipped },
                CountRow { outcome: "quarantined", records: c.quarantined },
            ];
            println!("Run {} ({}) on {}", summary.run_id, summary.mode, summary.source);
            println!("{}", Table::new(rows));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_run_args_parsing() {
        use clap::Parser;

        #[derive(Parser)]
        struct TestCli {
            #[command(flatten)]
            args: RunArgs,
        }

        let cli = TestCli::parse_from(["test", "-s", "orders", "-i", "orders.jsonl"]);
        assert_eq!(cli.args.source, "orders");
        assert!(!cli.args.full_refresh);
        assert!(!cli.args.dry_run);
    }

    #[test]
    fn test_dry_run_requires_full_refresh() {
        use clap::Parser;

        #[derive(Parser)]
        struct TestCli {
            #[command(flatten)]
            args: RunArgs,
        }

        let result = TestCli::try_parse_from(["test", "-s", "c", "-i", "c.jsonl", "--dry-run"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_read_batch_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"natural_key":"C001","attributes":{{"segment":"starter"}},"load_timestamp":"2024-01-01T00:00:00Z"}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"natural_key":"C002","load_timestamp":"2024-01-02T00:00:00Z","sequence":9}}"#
        )
        .unwrap();

        let records = read_batch(file.path(), "customers").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source, "customers");
        assert_eq!(records[0].sequence, 0);
        assert_eq!(records[1].sequence, 9);
        assert_eq!(records[0].batch_id, records[1].batch_id);
        assert_eq!(
            records[0].attributes["segment"],
            strata_core::AttributeValue::from("starter")
        );
    }

    #[test]
    fn test_read_batch_reports_line_number() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"natural_key":"C001","load_timestamp":"2024-01-01T00:00:00Z"}}"#)
            .unwrap();
        writeln!(file, r#"{{"natural_key":"C002"}}"#).unwrap();

        let err = read_batch(file.path(), "customers").unwrap_err();
        assert!(err.to_string().ends_with(":2: invalid record"), "{err}");
    }
}

//! End-to-end tests of the CLI commands against a snapshot file.

use std::fs;
use std::path::Path;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use strata_cli::commands::{dead_letters, history, resolve, run, status};
use strata_cli::{Config, OutputFormat};
use strata_core::{AuditStore, DeadLetterQuery, DimensionReadStore, MemoryWarehouse};

const ENGINE_YAML: &str = r"
max_concurrency: 2
sources:
  - name: customers
    kind:
      type: dimension
      tracked_attributes: [segment]
";

const BATCH: &str = r#"{"natural_key":"C001","attributes":{"segment":"starter"},"load_timestamp":"2024-01-01T00:00:00Z"}
{"natural_key":"C001","attributes":{"segment":"growth"},"load_timestamp":"2024-06-15T00:00:00Z"}
{"natural_key":"","attributes":{"segment":"starter"},"load_timestamp":"2024-06-15T00:00:00Z"}
"#;

fn workspace(format: OutputFormat) -> (TempDir, Config) {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("strata.yaml");
    fs::write(&config_path, ENGINE_YAML).unwrap();
    let config = Config {
        state_path: dir.path().join("state.json"),
        config_path,
        format,
    };
    (dir, config)
}

fn write_batch(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn run_args(input: std::path::PathBuf) -> run::RunArgs {
    run::RunArgs {
        source: "customers".into(),
        input,
        full_refresh: false,
        dry_run: false,
    }
}

#[tokio::test]
async fn test_run_persists_history_and_dead_letters() {
    let (dir, config) = workspace(OutputFormat::Json);
    let input = write_batch(dir.path(), "batch.jsonl", BATCH);

    run::execute(run_args(input.clone()), &config).await.unwrap();

    let store = MemoryWarehouse::load(&config.state_path).unwrap();
    let history = store.get_all_versions("customers", "C001").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(
        history[0].valid_to,
        Some(Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap())
    );
    let dead = store.list_dead_letters(&DeadLetterQuery::default()).await.unwrap();
    assert_eq!(dead.len(), 1);

    // Rerunning the same file changes nothing.
    run::execute(run_args(input), &config).await.unwrap();
    let store = MemoryWarehouse::load(&config.state_path).unwrap();
    assert_eq!(store.list_history("customers").await.unwrap(), history);
    assert_eq!(
        store.list_dead_letters(&DeadLetterQuery::default()).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_dry_run_leaves_state_file_untouched() {
    let (dir, config) = workspace(OutputFormat::Text);
    let input = write_batch(dir.path(), "batch.jsonl", BATCH);
    run::execute(run_args(input), &config).await.unwrap();
    let before = fs::read(&config.state_path).unwrap();

    let corrected = write_batch(
        dir.path(),
        "corrected.jsonl",
        r#"{"natural_key":"C001","attributes":{"segment":"enterprise"},"load_timestamp":"2024-01-01T00:00:00Z"}"#,
    );
    let args = run::RunArgs {
        full_refresh: true,
        dry_run: true,
        ..run_args(corrected)
    };
    run::execute(args, &config).await.unwrap();

    assert_eq!(fs::read(&config.state_path).unwrap(), before);
}

#[tokio::test]
async fn test_unknown_source_is_an_error() {
    let (dir, config) = workspace(OutputFormat::Text);
    let input = write_batch(dir.path(), "batch.jsonl", BATCH);
    let args = run::RunArgs {
        source: "suppliers".into(),
        ..run_args(input)
    };

    assert!(run::execute(args, &config).await.is_err());
    assert!(!config.state_path.exists());
}

#[tokio::test]
async fn test_malformed_input_fails_before_loading() {
    let (dir, config) = workspace(OutputFormat::Text);
    let input = write_batch(dir.path(), "bad.jsonl", "{\"natural_key\":\"C001\"}\n");

    let err = run::execute(run_args(input), &config).await.unwrap_err();
    assert!(err.to_string().contains(":1:"), "{err}");
    assert!(!config.state_path.exists());
}

#[tokio::test]
async fn test_inspection_commands_read_saved_state() {
    for format in [OutputFormat::Text, OutputFormat::Json, OutputFormat::Table] {
        let (dir, config) = workspace(format);
        let input = write_batch(dir.path(), "batch.jsonl", BATCH);
        run::execute(run_args(input), &config).await.unwrap();

        history::execute(
            &history::HistoryArgs {
                source: "customers".into(),
                key: Some("C001".into()),
                current_only: false,
            },
            &config,
        )
        .await
        .unwrap();
        resolve::execute(
            &resolve::ResolveArgs {
                source: "customers".into(),
                key: "C001".into(),
                as_of: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            },
            &config,
        )
        .await
        .unwrap();
        status::execute(&status::StatusArgs { source: None }, &config)
            .await
            .unwrap();
        dead_letters::execute(
            &dead_letters::DeadLettersArgs {
                source: Some("customers".into()),
                since: None,
                until: None,
            },
            &config,
        )
        .await
        .unwrap();
    }
}

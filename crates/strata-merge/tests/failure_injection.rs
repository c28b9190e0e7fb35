//! Integration tests for storage failure handling.
//!
//! These tests verify retries, dead-lettering of exhausted keys, invariant
//! race handling and outage aborts using the fault-injecting warehouse.

use std::sync::Arc;

use strata_core::{AuditStore, DeadLetterQuery, DeadLetterReason, DimensionReadStore};
use strata_merge::{CancelFlag, MergeEngine};
use strata_test_utils::{
    FailingWarehouse, RecordBuilder, assert_history_contiguous, customer, init_test_logging,
    test_config, ts,
};

fn engine() -> (FailingWarehouse, MergeEngine) {
    init_test_logging();
    let store = FailingWarehouse::new();
    let engine = MergeEngine::new(Arc::new(store.clone()), test_config()).unwrap();
    (store, engine)
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let (store, engine) = engine();
    store.fail_transiently("C001", 2);

    let summary = engine
        .run_incremental("customers", vec![customer("C001", "starter", ts(2024, 1, 1))], &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(summary.counts.inserted, 1);
    assert!(summary.is_success());
}

#[tokio::test]
async fn test_exhausted_retries_quarantine_only_that_key() {
    let (store, engine) = engine();
    store.fail_transiently("C001", usize::MAX);

    let summary = engine
        .run_incremental(
            "customers",
            vec![
                customer("C001", "starter", ts(2024, 1, 1)),
                customer("C002", "starter", ts(2024, 1, 1)),
            ],
            &CancelFlag::new(),
        )
        .await
        .unwrap();
    assert_eq!(summary.counts.inserted, 1);
    assert_eq!(summary.counts.quarantined, 1);
    assert_eq!(summary.keys_failed, 1);
    assert!(!summary.is_success());
    assert!(summary.errors[0].contains("C001"));

    let dead = engine.dead_letters(&DeadLetterQuery::default()).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason.kind(), "storage-retries-exhausted");
    assert!(matches!(
        &dead[0].reason,
        DeadLetterReason::RetriesExhausted { operation, .. } if operation == "merge_record"
    ));
    assert!(store.inner().get_current_version("customers", "C002").await.unwrap().is_some());
}

#[tokio::test]
async fn test_single_invariant_race_is_retried() {
    let (store, engine) = engine();
    store.fail_preconditions("C001", 1);

    let summary = engine
        .run_incremental("customers", vec![customer("C001", "starter", ts(2024, 1, 1))], &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(summary.counts.inserted, 1);
    assert!(summary.is_success());
}

#[tokio::test]
async fn test_repeated_invariant_race_is_quarantined() {
    let (store, engine) = engine();
    store.fail_preconditions("C001", 2);

    let summary = engine
        .run_incremental("customers", vec![customer("C001", "starter", ts(2024, 1, 1))], &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(summary.counts.inserted, 0);
    assert_eq!(summary.counts.quarantined, 1);
    assert_eq!(summary.keys_failed, 1);

    let dead = engine.dead_letters(&DeadLetterQuery::default()).await.unwrap();
    assert!(matches!(dead[0].reason, DeadLetterReason::InvariantViolation(_)));
    assert!(store.inner().list_history("customers").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_outage_before_start_aborts_run() {
    let (store, engine) = engine();
    store.set_outage(true);

    let summary = engine
        .run_incremental(
            "customers",
            vec![
                customer("C001", "starter", ts(2024, 1, 1)),
                customer("C001", "growth", ts(2024, 2, 1)),
                customer("C002", "starter", ts(2024, 1, 1)),
            ],
            &CancelFlag::new(),
        )
        .await
        .unwrap();
    assert!(summary.aborted.is_some());
    assert_eq!(summary.keys_pending, 2);
    assert_eq!(summary.keys_processed, 0);
    assert!(!summary.is_success());
}

#[tokio::test]
async fn test_outage_mid_run_stops_and_rerun_completes() {
    init_test_logging();
    let store = FailingWarehouse::new();
    let mut config = test_config();
    config.max_concurrency = 1;
    let engine = MergeEngine::new(Arc::new(store.clone()), config).unwrap();

    let batch: Vec<_> = (1..=5)
        .map(|day| customer(&format!("C00{day}"), "starter", ts(2024, 1, day)))
        .collect();
    store.outage_after_writes(2);

    let summary = engine
        .run_incremental("customers", batch.clone(), &CancelFlag::new())
        .await
        .unwrap();
    assert!(summary.aborted.is_some());
    assert_eq!(summary.counts.inserted, 2);
    assert_eq!(summary.keys_processed, 2);
    assert_eq!(summary.keys_pending, 3);
    assert_eq!(store.inner().get_watermark("customers").await.unwrap(), None);

    store.set_outage(false);
    let rerun = engine
        .run_incremental("customers", batch, &CancelFlag::new())
        .await
        .unwrap();
    assert!(rerun.is_success());
    assert_eq!(rerun.counts.inserted, 3);
    assert_eq!(rerun.counts.no_change, 2);

    let history = store.inner().list_history("customers").await.unwrap();
    assert_eq!(history.len(), 5);
    assert_history_contiguous(&history);
    assert_eq!(
        store.inner().get_watermark("customers").await.unwrap(),
        Some(ts(2024, 1, 5))
    );
}

#[tokio::test]
async fn test_rerun_after_outage_keeps_same_instant_winner() {
    init_test_logging();
    let store = FailingWarehouse::new();
    let mut config = test_config();
    config.max_concurrency = 1;
    let engine = MergeEngine::new(Arc::new(store.clone()), config).unwrap();

    let batch = vec![
        customer("C001", "starter", ts(2024, 1, 2)),
        customer("C001", "starter", ts(2024, 1, 5)),
        RecordBuilder::new("customers", "C001")
            .attr("segment", "growth")
            .at(ts(2024, 1, 5))
            .seq(1)
            .build(),
        customer("C002", "starter", ts(2024, 1, 1)),
    ];
    store.outage_after_writes(2);

    let summary = engine
        .run_incremental("customers", batch.clone(), &CancelFlag::new())
        .await
        .unwrap();
    assert!(summary.aborted.is_some());
    assert_eq!((summary.counts.inserted, summary.counts.updated), (1, 1));
    assert_eq!(store.inner().get_watermark("customers").await.unwrap(), None);
    let before = store.inner().get_all_versions("customers", "C001").await.unwrap();
    assert_eq!(before.len(), 2);

    store.set_outage(false);
    let rerun = engine
        .run_incremental("customers", batch, &CancelFlag::new())
        .await
        .unwrap();
    assert!(rerun.is_success());
    assert_eq!(rerun.counts.updated, 0);
    assert_eq!(rerun.counts.inserted, 1);
    assert_eq!(rerun.counts.skipped, 2);
    assert_eq!(rerun.counts.quarantined, 0);

    let after = store.inner().get_all_versions("customers", "C001").await.unwrap();
    assert_eq!(after, before);
    let current = store
        .inner()
        .get_current_version("customers", "C001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.attributes["segment"].as_str(), Some("growth"));
}

#[tokio::test]
async fn test_quarantine_is_deduplicated_across_reruns() {
    let (store, engine) = engine();
    store.fail_transiently("C001", usize::MAX);
    let batch = vec![customer("C001", "starter", ts(2024, 1, 1))];

    engine
        .run_incremental("customers", batch.clone(), &CancelFlag::new())
        .await
        .unwrap();
    engine
        .run_incremental("customers", batch, &CancelFlag::new())
        .await
        .unwrap();

    let dead = engine.dead_letters(&DeadLetterQuery::default()).await.unwrap();
    assert_eq!(dead.len(), 1);
}

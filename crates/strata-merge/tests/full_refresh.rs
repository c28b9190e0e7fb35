//! Full-refresh rebuilds: idempotence, correction of divergent history, dry runs.

use std::sync::Arc;

use strata_core::{AuditStore, DeadLetterQuery, DimensionReadStore, FactReadStore, MemoryWarehouse};
use strata_merge::{CancelFlag, FullRefreshOptions, MergeEngine};
use strata_test_utils::{
    RecordBuilder, assert_history_contiguous, customer, init_test_logging, order, test_config, ts,
};

fn engine() -> (Arc<MemoryWarehouse>, MergeEngine) {
    init_test_logging();
    let store = Arc::new(MemoryWarehouse::new());
    let engine = MergeEngine::new(store.clone(), test_config()).unwrap();
    (store, engine)
}

fn apply() -> FullRefreshOptions {
    FullRefreshOptions::default()
}

#[tokio::test]
async fn test_full_refresh_matches_incremental_history() {
    let (store, engine) = engine();
    let cancel = CancelFlag::new();
    let batch = vec![
        customer("C001", "starter", ts(2024, 1, 1)),
        customer("C001", "growth", ts(2024, 6, 15)),
        customer("C002", "starter", ts(2024, 2, 1)),
    ];
    engine
        .run_incremental("customers", batch.clone(), &cancel)
        .await
        .unwrap();
    let before = store.list_history("customers").await.unwrap();

    let refresh = engine
        .run_full_refresh("customers", batch.clone(), apply(), &cancel)
        .await
        .unwrap();
    assert_eq!(refresh.keys_diverged, 0);
    assert_eq!((refresh.counts.inserted, refresh.counts.updated), (2, 1));
    assert!(refresh.is_success());
    assert_eq!(store.list_history("customers").await.unwrap(), before);

    let again = engine
        .run_full_refresh("customers", batch, apply(), &cancel)
        .await
        .unwrap();
    assert_eq!(again.keys_diverged, 0);
    assert_eq!(store.list_history("customers").await.unwrap(), before);
}

#[tokio::test]
async fn test_full_refresh_repairs_late_arrival() {
    let (store, engine) = engine();
    let cancel = CancelFlag::new();
    engine
        .run_incremental(
            "customers",
            vec![
                customer("C001", "starter", ts(2024, 1, 1)),
                customer("C001", "growth", ts(2024, 6, 15)),
            ],
            &cancel,
        )
        .await
        .unwrap();
    let late = customer("C001", "enterprise", ts(2024, 3, 1));
    let summary = engine
        .run_incremental("customers", vec![late.clone()], &cancel)
        .await
        .unwrap();
    assert_eq!(summary.counts.late_arrivals, 1);
    let original = store.get_all_versions("customers", "C001").await.unwrap();

    let refresh = engine
        .run_full_refresh(
            "customers",
            vec![
                customer("C001", "starter", ts(2024, 1, 1)),
                late,
                customer("C001", "growth", ts(2024, 6, 15)),
            ],
            apply(),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(refresh.keys_diverged, 1);

    let history = store.get_all_versions("customers", "C001").await.unwrap();
    assert_eq!(history.len(), 3);
    assert_history_contiguous(&history);
    let segments: Vec<_> = history
        .iter()
        .map(|v| v.attributes["segment"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(segments, ["starter", "enterprise", "growth"]);
    assert_eq!(history[0].valid_to, Some(ts(2024, 3, 1)));

    // Versions that survived the rebuild keep their surrogate keys.
    assert_eq!(history[0].surrogate_key, original[0].surrogate_key);
    assert_eq!(history[2].surrogate_key, original[1].surrogate_key);
}

#[tokio::test]
async fn test_later_batch_same_instant_record_agrees_with_rebuild() {
    let (store, engine) = engine();
    let cancel = CancelFlag::new();
    let growth = RecordBuilder::new("customers", "C001")
        .attr("segment", "growth")
        .attr("name", "Customer C001")
        .at(ts(2024, 1, 5))
        .seq(1)
        .build();
    let first = vec![customer("C001", "starter", ts(2024, 1, 1)), growth];
    engine
        .run_incremental("customers", first.clone(), &cancel)
        .await
        .unwrap();

    let back_to_starter = RecordBuilder::new("customers", "C001")
        .attr("segment", "starter")
        .attr("name", "Customer C001")
        .at(ts(2024, 1, 5))
        .seq(2)
        .build();
    let second = engine
        .run_incremental("customers", vec![back_to_starter.clone()], &cancel)
        .await
        .unwrap();
    assert_eq!(second.counts.updated, 1);
    assert_eq!(second.counts.skipped, 0);
    assert_eq!(second.counts.quarantined, 0);

    let incremental = store.get_all_versions("customers", "C001").await.unwrap();
    assert_eq!(incremental.len(), 3);
    assert_history_contiguous(&incremental);
    assert_eq!(incremental[1].valid_to, Some(ts(2024, 1, 5)));
    assert_eq!(incremental[2].attributes["segment"].as_str(), Some("starter"));

    let mut all = first;
    all.push(back_to_starter);
    let refresh = engine
        .run_full_refresh("customers", all, apply(), &cancel)
        .await
        .unwrap();
    assert_eq!(refresh.keys_diverged, 0);
    assert_eq!(
        store.get_all_versions("customers", "C001").await.unwrap(),
        incremental
    );
}

#[tokio::test]
async fn test_dry_run_reports_without_writing() {
    let (store, engine) = engine();
    let cancel = CancelFlag::new();
    engine
        .run_incremental(
            "customers",
            vec![customer("C001", "starter", ts(2024, 1, 1))],
            &cancel,
        )
        .await
        .unwrap();
    let before = store.snapshot().unwrap();

    let summary = engine
        .run_full_refresh(
            "customers",
            vec![
                customer("C001", "growth", ts(2024, 1, 1)),
                customer("C002", "starter", ts(2024, 2, 1)),
                customer("", "starter", ts(2024, 2, 1)),
            ],
            FullRefreshOptions { dry_run: true },
            &cancel,
        )
        .await
        .unwrap();
    assert!(summary.dry_run);
    assert_eq!(summary.keys_diverged, 2);
    assert_eq!(summary.counts.quarantined, 1);
    assert_eq!(store.snapshot().unwrap(), before);
    assert!(engine.dead_letters(&DeadLetterQuery::default()).await.unwrap().is_empty());
    assert_eq!(store.get_watermark("customers").await.unwrap(), Some(ts(2024, 1, 1)));
}

#[tokio::test]
async fn test_full_refresh_rewrites_fact_rows() {
    let (store, engine) = engine();
    let cancel = CancelFlag::new();
    engine
        .run_incremental(
            "orders",
            vec![order("O1", "C001", 10, ts(2024, 7, 1), ts(2024, 7, 1))],
            &cancel,
        )
        .await
        .unwrap();

    let summary = engine
        .run_full_refresh(
            "orders",
            vec![
                order("O1", "C002", 25, ts(2024, 7, 1), ts(2024, 7, 1)),
                order("O2", "C001", 5, ts(2024, 7, 2), ts(2024, 7, 2)),
            ],
            apply(),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(summary.counts.facts_updated, 1);
    assert_eq!(summary.counts.facts_inserted, 1);
    assert_eq!(summary.keys_diverged, 2);

    let o1 = store.get_fact("orders", "O1").await.unwrap().unwrap();
    assert_eq!(o1.dimension_keys["customers"], "C002");
    assert_eq!(o1.measures["amount"], 25_i64.into());

    let again = engine
        .run_full_refresh(
            "orders",
            vec![
                order("O1", "C002", 25, ts(2024, 7, 1), ts(2024, 7, 1)),
                order("O2", "C001", 5, ts(2024, 7, 2), ts(2024, 7, 2)),
            ],
            apply(),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(again.counts.facts_unchanged, 2);
    assert_eq!(again.keys_diverged, 0);
}

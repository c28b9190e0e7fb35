//! Property-based tests for history invariants.
//!
//! These tests use proptest to verify contiguity and idempotence hold across
//! randomly generated change streams, including same-instant updates and late
//! arrivals.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use proptest::prelude::*;
use tokio_test::block_on;

use strata_core::{BatchIngestRecord, DimensionReadStore, MemoryWarehouse};
use strata_merge::{CancelFlag, FullRefreshOptions, MergeEngine};
use strata_test_utils::{RecordBuilder, assert_history_contiguous, test_config, ts};

/// Generates one customer change: key, segment, day of January, hour.
fn arb_change() -> impl Strategy<Value = (usize, &'static str, u32, i64)> {
    (
        0usize..3,
        prop::sample::select(vec!["starter", "growth", "enterprise"]),
        1u32..20,
        prop::sample::select(vec![0_i64, 0, 6]),
    )
}

fn to_records(changes: &[(usize, &'static str, u32, i64)]) -> Vec<BatchIngestRecord> {
    changes
        .iter()
        .enumerate()
        .map(|(seq, (key, segment, day, hour))| {
            RecordBuilder::new("customers", format!("K{key}"))
                .attr("segment", *segment)
                .at(ts(2024, 1, *day) + chrono::Duration::hours(*hour))
                .seq(seq as u64)
                .build()
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_incremental_history_is_contiguous(
        changes in prop::collection::vec(arb_change(), 1..40),
        split in 0usize..40,
    ) {
        let records = to_records(&changes);
        let split = split.min(records.len());

        block_on(async {
            let store = Arc::new(MemoryWarehouse::new());
            let engine = MergeEngine::new(store.clone(), test_config()).unwrap();
            let cancel = CancelFlag::new();

            engine.run_incremental("customers", records[..split].to_vec(), &cancel).await.unwrap();
            engine.run_incremental("customers", records[split..].to_vec(), &cancel).await.unwrap();

            assert_history_contiguous(&store.list_history("customers").await.unwrap());
        });
    }

    #[test]
    fn prop_full_refresh_is_idempotent(
        changes in prop::collection::vec(arb_change(), 1..40),
        split in 0usize..40,
    ) {
        let records = to_records(&changes);
        let split = split.min(records.len());

        block_on(async {
            let store = Arc::new(MemoryWarehouse::new());
            let engine = MergeEngine::new(store.clone(), test_config()).unwrap();
            let cancel = CancelFlag::new();
            let options = FullRefreshOptions::default();

            engine.run_incremental("customers", records[split..].to_vec(), &cancel).await.unwrap();
            engine.run_incremental("customers", records[..split].to_vec(), &cancel).await.unwrap();

            engine.run_full_refresh("customers", records.clone(), options, &cancel).await.unwrap();
            let rebuilt = store.list_history("customers").await.unwrap();
            assert_history_contiguous(&rebuilt);

            let again = engine
                .run_full_refresh("customers", records.clone(), options, &cancel)
                .await
                .unwrap();
            assert_eq!(again.keys_diverged, 0);
            assert_eq!(store.list_history("customers").await.unwrap(), rebuilt);

            let replay = engine.run_incremental("customers", records, &cancel).await.unwrap();
            assert_eq!(replay.counts.inserted + replay.counts.updated, 0);
            assert_eq!(replay.counts.quarantined, 0);
            assert_eq!(store.list_history("customers").await.unwrap(), rebuilt);
        });
    }
}

//! Merge engine metrics.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `strata_merge_decisions_total` | Counter | `decision` | Classifier decisions |
//! | `strata_merge_retries_total` | Counter | `operation` | Transient-failure retries |
//! | `strata_merge_quarantined_total` | Counter | `reason` | Records sent to the dead-letter store |
//! | `strata_merge_facts_total` | Counter | `outcome` | Fact merge outcomes |
//! | `strata_merge_run_duration_seconds` | Histogram | `mode` | Wall time of a merge run |
//! | `strata_freshness_lag_seconds` | Gauge | `source` | Lag observed by the last freshness check |
//!
//! Metrics go through the `metrics` facade; without an installed recorder every
//! call is a no-op.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Counter: classifier decisions.
pub const DECISIONS_TOTAL: &str = "strata_merge_decisions_total";
/// Counter: retries of transient failures.
pub const RETRIES_TOTAL: &str = "strata_merge_retries_total";
/// Counter: quarantined records.
pub const QUARANTINED_TOTAL: &str = "strata_merge_quarantined_total";
/// Counter: fact merge outcomes.
pub const FACTS_TOTAL: &str = "strata_merge_facts_total";
/// Histogram: run duration in seconds.
pub const RUN_DURATION_SECONDS: &str = "strata_merge_run_duration_seconds";
/// Gauge: freshness lag in seconds.
pub const FRESHNESS_LAG_SECONDS: &str = "strata_freshness_lag_seconds";

/// Registers metric descriptions with the installed recorder.
pub fn register_metrics() {
    describe_counter!(DECISIONS_TOTAL, "Classifier decisions by kind");
    describe_counter!(RETRIES_TOTAL, "Retries of transient storage failures");
    describe_counter!(QUARANTINED_TOTAL, "Records quarantined to the dead-letter store");
    describe_counter!(FACTS_TOTAL, "Fact merge outcomes");
    describe_histogram!(RUN_DURATION_SECONDS, "Duration of merge runs in seconds");
    describe_gauge!(FRESHNESS_LAG_SECONDS, "Source lag at the last freshness check");
}

/// Records one classifier decision.
pub fn record_decision(decision: &str) {
    counter!(DECISIONS_TOTAL, "decision" => decision.to_string()).increment(1);
}

/// Records a retry of the given operation.
pub fn record_retry(operation: &str) {
    counter!(RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Records a quarantined record.
pub fn record_quarantine(reason: &str) {
    counter!(QUARANTINED_TOTAL, "reason" => reason.to_string()).increment(1);
}

/// Records a fact merge outcome.
pub fn record_fact_outcome(outcome: &str) {
    counter!(FACTS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// Records the duration of a finished run.
pub fn observe_run_duration(mode: &str, duration_secs: f64) {
    histogram!(RUN_DURATION_SECONDS, "mode" => mode.to_string()).record(duration_secs);
}

/// Publishes the lag of a source.
pub fn set_freshness_lag(source: &str, lag_secs: f64) {
    gauge!(FRESHNESS_LAG_SECONDS, "source" => source.to_string()).set(lag_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        register_metrics();
        record_decision("insert");
        record_retry("merge_record");
        record_quarantine("out-of-order");
        record_fact_outcome("inserted");
        observe_run_duration("incremental", 0.25);
        set_freshness_lag("customers", 12.0);
    }
}

//! Run summaries.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::RunId;

use crate::classifier::ChangeDecision;
use crate::fact_merge::FactMergeOutcome;

/// Which entry point produced a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// `run_incremental`.
    Incremental,
    /// `run_full_refresh`.
    FullRefresh,
}

impl RunMode {
    /// Stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::FullRefresh => "full_refresh",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-outcome record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCounts {
    /// Dimension keys seen for the first time.
    pub inserted: usize,
    /// SCD2 updates (close + open).
    pub updated: usize,
    /// Records with no tracked change.
    pub no_change: usize,
    /// Records quarantined as out of order.
    pub late_arrivals: usize,
    /// Records already reflected in stored state.
    pub skipped: usize,
    /// Facts inserted.
    pub facts_inserted: usize,
    /// Facts overwritten.
    pub facts_updated: usize,
    /// Facts replayed without change.
    pub facts_unchanged: usize,
    /// Facts older than the stored row.
    pub facts_stale: usize,
    /// Records sent to the dead-letter store, for any reason.
    pub quarantined: usize,
}

impl MergeCounts {
    /// Counts one classifier decision.
    pub fn record_decision(&mut self, decision: ChangeDecision) {
        match decision {
            ChangeDecision::Insert => self.inserted += 1,
            ChangeDecision::Scd2Update => self.updated += 1,
            ChangeDecision::NoChange => self.no_change += 1,
            ChangeDecision::LateArrival => self.late_arrivals += 1,
        }
    }

    /// Counts one fact outcome.
    pub fn record_fact(&mut self, outcome: FactMergeOutcome) {
        match outcome {
            FactMergeOutcome::Inserted => self.facts_inserted += 1,
            FactMergeOutcome::Updated => self.facts_updated += 1,
            FactMergeOutcome::Unchanged => self.facts_unchanged += 1,
            FactMergeOutcome::Stale => self.facts_stale += 1,
        }
    }

    /// Adds another set of counts.
    pub fn absorb(&mut self, other: &Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.no_change += other.no_change;
        self.late_arrivals += other.late_arrivals;
        self.skipped += other.skipped;
        self.facts_inserted += other.facts_inserted;
        self.facts_updated += other.facts_updated;
        self.facts_unchanged += other.facts_unchanged;
        self.facts_stale += other.facts_stale;
        self.quarantined += other.quarantined;
    }
}

/// Result of one merge run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run identifier.
    pub run_id: RunId,
    /// Source merged.
    pub source: String,
    /// Entry point.
    pub mode: RunMode,
    /// Whether writes were suppressed.
    pub dry_run: bool,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
    /// Records handed to the run.
    pub records_received: usize,
    /// Outcome counts.
    #[serde(flatten)]
    pub counts: MergeCounts,
    /// Natural keys whose records were all handled.
    pub keys_processed: usize,
    /// Natural keys with at least one storage or invariant failure.
    pub keys_failed: usize,
    /// Natural keys never started (cancellation or outage).
    pub keys_pending: usize,
    /// Natural keys whose stored history differed from the rebuild (full refresh).
    pub keys_diverged: usize,
    /// Highest load timestamp up to which every record is handled.
    pub watermark: Option<DateTime<Utc>>,
    /// Whether the run stopped on a cancellation request.
    pub cancelled: bool,
    /// Outage that aborted the run, if any.
    pub aborted: Option<String>,
    /// Per-record failures (storage exhaustion, invariant violations).
    pub errors: Vec<String>,
}

impl RunSummary {
    pub(crate) fn start(run_id: RunId, source: &str, mode: RunMode, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            source: source.to_string(),
            mode,
            dry_run,
            started_at: now,
            completed_at: now,
            records_received: 0,
            counts: MergeCounts::default(),
            keys_processed: 0,
            keys_failed: 0,
            keys_pending: 0,
            keys_diverged: 0,
            watermark: None,
            cancelled: false,
            aborted: None,
            errors: Vec::new(),
        }
    }

    /// True when the run finished every key without failures.
    ///
    /// Quarantined late arrivals and malformed records do not count as
    /// failures; they are expected data conditions.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && !self.cancelled && self.errors.is_empty()
    }

    /// Wall time of the run.
    #[must_use]
    pub fn duration(&self) -> chrono::TimeDelta {
        self.completed_at - self.started_at
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counts;
        writeln!(
            f,
            "run {} ({}) on {}{}",
            self.run_id,
            self.mode,
            self.source,
            if self.dry_run { " [dry run]" } else { "" }
        )?;
        writeln!(f, "  records:      {}", self.records_received)?;
        writeln!(
            f,
            "  dimensions:   {} inserted, {} updated, {} unchanged, {} late",
            c.inserted, c.updated, c.no_change, c.late_arrivals
        )?;
        writeln!(
            f,
            "  facts:        {} inserted, {} updated, {} unchanged, {} stale",
            c.facts_inserted, c.facts_updated, c.facts_unchanged, c.facts_stale
        )?;
        writeln!(f, "  skipped:      {}", c.skipped)?;
        writeln!(f, "  quarantined:  {}", c.quarantined)?;
        writeln!(
            f,
            "  keys:         {} processed, {} failed, {} pending, {} diverged",
            self.keys_processed, self.keys_failed, self.keys_pending, self.keys_diverged
        )?;
        match self.watermark {
            Some(w) => writeln!(f, "  watermark:    {}", w.to_rfc3339())?,
            None => writeln!(f, "  watermark:    -")?,
        }
        if self.cancelled {
            writeln!(f, "  cancelled")?;
        }
        if let Some(reason) = &self.aborted {
            writeln!(f, "  aborted:      {reason}")?;
        }
        for error in &self.errors {
            writeln!(f, "  error:        {error}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_absorb() {
        let mut a = MergeCounts::default();
        a.record_decision(ChangeDecision::Insert);
        let mut b = MergeCounts::default();
        b.record_decision(ChangeDecision::Scd2Update);
        b.record_fact(FactMergeOutcome::Stale);
        a.absorb(&b);
        assert_eq!((a.inserted, a.updated, a.facts_stale), (1, 1, 1));
    }

    #[test]
    fn success_requires_no_errors_or_abort() {
        let mut summary = RunSummary::start(RunId::generate(), "customers", RunMode::Incremental, false);
        assert!(summary.is_success());
        summary.counts.quarantined = 3;
        assert!(summary.is_success());
        summary.errors.push("C001: retries exhausted".into());
        assert!(!summary.is_success());
    }

    #[test]
    fn serializes_counts_flat() {
        let summary = RunSummary::start(RunId::generate(), "customers", RunMode::FullRefresh, true);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["mode"], "full_refresh");
        assert_eq!(json["inserted"], 0);
    }
}

//! Run orchestration.
//!
//! A run takes one source's batch, routes malformed records straight to the
//! dead-letter store, groups the rest by natural key and merges the keys
//! concurrently:
//!
//! ```text
//! records ──validate──▶ group by key ──▶ JoinSet (≤ max_concurrency permits)
//!    │                                       │
//!    ▼                                       ├── key A: lock ▶ r1 ▶ r2 ▶ ...
//! dead letters                               ├── key B: lock ▶ r1 ▶ ...
//!                                            └── ...
//! ```
//!
//! Within a key, records run strictly in `(load_timestamp, sequence)` order.
//! Cancellation is checked before a key starts; a key that has started runs to
//! the end. A storage outage stops the run: keys not yet started are reported
//! as pending and the watermark only covers records that were fully handled.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use strata_core::observability::{merge_span, run_span};
use strata_core::{
    BatchIngestRecord, DeadLetterEntry, DeadLetterQuery, DeadLetterReason, DimensionVersion,
    EngineConfig, FactRecord, RunId, SourceConfig, WarehouseStore,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::classifier::{ChangeDecision, classify};
use crate::dead_letter::DeadLetterTracker;
use crate::error::{MergeError, Result};
use crate::fact_merge::{FactMergeOutcome, FactMerger};
use crate::freshness::{FreshnessStatus, FreshnessTracker};
use crate::key_lock::KeyLocks;
use crate::metrics;
use crate::notify::{LogNotifier, RunNotifier};
use crate::resolver::PointInTimeResolver;
use crate::retry::{RetryContext, RetryPolicy, with_retry};
use crate::scd2::{ApplyOutcome, RebuiltHistory, Scd2Applier, assign_surrogate_keys, rebuild_history};
use crate::summary::{MergeCounts, RunMode, RunSummary};

/// Cooperative cancellation for a run.
///
/// Clones share the same flag. The engine checks it before starting each
/// natural key.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for [`MergeEngine::run_full_refresh`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FullRefreshOptions {
    /// Compare and report only; write nothing.
    pub dry_run: bool,
}

/// The merge engine.
///
/// Holds the warehouse handle and configuration. All per-run state lives in
/// the run itself; the only thing shared between runs is the key lock table.
pub struct MergeEngine {
    store: Arc<dyn WarehouseStore>,
    config: Arc<EngineConfig>,
    locks: Arc<KeyLocks>,
    retry: RetryPolicy,
    notifier: Arc<dyn RunNotifier>,
}

impl std::fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeEngine")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl MergeEngine {
    /// Creates an engine.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `config` is invalid.
    pub fn new(store: Arc<dyn WarehouseStore>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            retry: RetryPolicy::from(&config.retry),
            store,
            config: Arc::new(config),
            locks: Arc::new(KeyLocks::new()),
            notifier: Arc::new(LogNotifier),
        })
    }

    /// Replaces the run notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn RunNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Merges records with load timestamps newer than the source watermark.
    ///
    /// Records at or below the watermark that are already reflected in stored
    /// state are counted as skipped; any others are merged normally.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::UnknownSource`] for an unconfigured source. Storage
    /// failures never surface here; they are reported in the summary.
    pub async fn run_incremental(
        &self,
        source: &str,
        records: Vec<BatchIngestRecord>,
        cancel: &CancelFlag,
    ) -> Result<RunSummary> {
        self.run(source, records, RunMode::Incremental, false, cancel)
            .await
    }

    /// Rebuilds the source from `records` and corrects divergent stored history.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::UnknownSource`] for an unconfigured source.
    pub async fn run_full_refresh(
        &self,
        source: &str,
        records: Vec<BatchIngestRecord>,
        options: FullRefreshOptions,
        cancel: &CancelFlag,
    ) -> Result<RunSummary> {
        self.run(source, records, RunMode::FullRefresh, options.dry_run, cancel)
            .await
    }

    async fn run(
        &self,
        source: &str,
        records: Vec<BatchIngestRecord>,
        mode: RunMode,
        dry_run: bool,
        cancel: &CancelFlag,
    ) -> Result<RunSummary> {
        let source_config =
            self.config
                .source(source)
                .ok_or_else(|| MergeError::UnknownSource {
                    source_name: source.to_string(),
                })?;
        let run_id = RunId::generate();
        let span = run_span(mode.as_str(), &run_id.to_string(), source);
        self.execute(run_id, source_config, records, mode, dry_run, cancel)
            .instrument(span)
            .await
    }

    #[allow(clippy::too_many_lines)]
    async fn execute(
        &self,
        run_id: RunId,
        source_config: &SourceConfig,
        records: Vec<BatchIngestRecord>,
        mode: RunMode,
        dry_run: bool,
        cancel: &CancelFlag,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let source = source_config.name.as_str();
        let mut summary = RunSummary::start(run_id, source, mode, dry_run);
        summary.records_received = records.len();
        tracing::info!(records = records.len(), dry_run, "merge run started");

        let mut ctx = RunContext::new(self, source_config, dry_run)?;

        let previous_watermark = match ctx
            .guarded("get_watermark", "", || async {
                self.store
                    .get_watermark(source)
                    .await
                    .map_err(MergeError::from)
            })
            .await
        {
            Ok(w) => w,
            Err(err) => {
                summary.aborted = Some(err.to_string());
                summary.keys_pending = records
                    .iter()
                    .map(|r| r.natural_key.as_str())
                    .collect::<BTreeSet<_>>()
                    .len();
                return Ok(self.finish(summary, started).await);
            }
        };
        if mode == RunMode::Incremental {
            ctx.watermark = previous_watermark;
        }

        let mut rejected = KeyReport::default();
        let mut keyed: BTreeMap<String, Vec<BatchIngestRecord>> = BTreeMap::new();
        for record in records {
            match precheck(&record, source) {
                Ok(()) => keyed
                    .entry(record.natural_key.clone())
                    .or_default()
                    .push(record),
                Err(reason) => {
                    ctx.quarantine(&record, reason, &mut rejected).await;
                    rejected.processed.push(record.load_timestamp);
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut join_set = JoinSet::new();
        for (natural_key, mut key_records) in keyed {
            key_records.sort_by_key(BatchIngestRecord::processing_order);
            let ctx = ctx.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            join_set.spawn(
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return KeyReport::pending(&key_records);
                    };
                    match mode {
                        RunMode::Incremental => {
                            ctx.process_key(natural_key, key_records, &cancel).await
                        }
                        RunMode::FullRefresh => {
                            ctx.refresh_key(natural_key, key_records, &cancel).await
                        }
                    }
                }
                .in_current_span(),
            );
        }

        let mut reports = Vec::new();
        let mut lost_tasks = false;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => {
                    lost_tasks = true;
                    summary.keys_failed += 1;
                    summary.errors.push(format!("key task failed: {err}"));
                }
            }
        }

        summary.counts.absorb(&rejected.counts);
        for report in &reports {
            summary.counts.absorb(&report.counts);
            summary.errors.extend(report.errors.iter().cloned());
            if report.unprocessed.is_some() {
                summary.keys_pending += 1;
            } else {
                summary.keys_processed += 1;
            }
            summary.keys_failed += usize::from(report.failed);
            summary.keys_diverged += usize::from(report.diverged);
        }
        summary.cancelled = cancel.is_cancelled() && summary.keys_pending > 0;
        summary.aborted = ctx.outage.get().cloned();

        let min_unprocessed = reports.iter().filter_map(|r| r.unprocessed).min();
        let handled = || {
            reports
                .iter()
                .chain(std::iter::once(&rejected))
                .flat_map(|r| r.processed.iter().copied())
        };
        let reached = handled()
            .filter(|t| min_unprocessed.is_none_or(|m| *t < m))
            .max();
        summary.watermark = previous_watermark.max(reached);

        if !dry_run && !lost_tasks {
            let complete = summary.aborted.is_none() && !summary.cancelled;
            if let Some(watermark) = reached {
                let advanced = ctx
                    .guarded("advance_watermark", "", || async {
                        self.store
                            .advance_watermark(source, watermark)
                            .await
                            .map_err(MergeError::from)
                    })
                    .await;
                if let Err(err) = advanced {
                    tracing::warn!(%watermark, error = %err, "watermark not advanced");
                    if complete {
                        summary.errors.push(format!("advance watermark: {err}"));
                    }
                }
            }
            if complete {
                if let Some(latest) = handled().max() {
                    let tracker = FreshnessTracker::new(Arc::clone(&self.store), Arc::clone(&self.config));
                    if let Err(err) = tracker.record_batch_loaded(source, latest).await {
                        summary.errors.push(format!("record freshness: {err}"));
                    }
                }
            }
        }

        Ok(self.finish(summary, started).await)
    }

    async fn finish(&self, mut summary: RunSummary, started: Instant) -> RunSummary {
        summary.completed_at = Utc::now();
        metrics::observe_run_duration(summary.mode.as_str(), started.elapsed().as_secs_f64());
        tracing::info!(
            success = summary.is_success(),
            keys_processed = summary.keys_processed,
            keys_pending = summary.keys_pending,
            quarantined = summary.counts.quarantined,
            "merge run finished"
        );
        self.notifier.notify(&summary).await;
        self.locks.prune();
        summary
    }

    /// Current versions of a dimension source.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn current_view(&self, source: &str) -> Result<Vec<DimensionVersion>> {
        Ok(self.store.list_current_versions(source).await?)
    }

    /// Full history of a dimension source.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn history(&self, source: &str) -> Result<Vec<DimensionVersion>> {
        Ok(self.store.list_history(source).await?)
    }

    /// Stored facts of a fact source.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn facts(&self, source: &str) -> Result<Vec<FactRecord>> {
        Ok(self.store.list_facts(source).await?)
    }

    /// Freshness of every known source.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn freshness_report(&self) -> Result<Vec<FreshnessStatus>> {
        self.freshness().status_all().await
    }

    /// Dead-letter entries matching `query`.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn dead_letters(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetterEntry>> {
        DeadLetterTracker::new(Arc::clone(&self.store))
            .list(query)
            .await
    }

    /// Point-in-time resolver over the engine's store.
    #[must_use]
    pub fn resolver(&self) -> PointInTimeResolver {
        PointInTimeResolver::new(Arc::clone(&self.store))
    }

    /// Resolves the version of a dimension key valid at `as_of`.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn resolve(
        &self,
        source: &str,
        natural_key: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<DimensionVersion>> {
        self.resolver().resolve(source, natural_key, as_of).await
    }

    /// Freshness tracker over the engine's store and configuration.
    #[must_use]
    pub fn freshness(&self) -> FreshnessTracker {
        FreshnessTracker::new(Arc::clone(&self.store), Arc::clone(&self.config))
    }
}

/// Structural checks done before any classification.
fn precheck(record: &BatchIngestRecord, source: &str) -> std::result::Result<(), DeadLetterReason> {
    if record.source != source {
        return Err(DeadLetterReason::MalformedRecord(format!(
            "record belongs to source '{}'",
            record.source
        )));
    }
    if record.natural_key.trim().is_empty() {
        return Err(DeadLetterReason::MissingNaturalKey);
    }
    record
        .validate()
        .map_err(|e| DeadLetterReason::MalformedRecord(e.to_string()))
}

/// Dead-letter reason for a record whose merge failed.
fn failure_reason(err: &MergeError) -> DeadLetterReason {
    match err {
        MergeError::MalformedRecord { message } => DeadLetterReason::MalformedRecord(message.clone()),
        MergeError::InvariantViolation { reason, .. } => {
            DeadLetterReason::InvariantViolation(reason.clone())
        }
        MergeError::RetriesExhausted {
            operation, message, ..
        } => DeadLetterReason::RetriesExhausted {
            operation: operation.clone(),
            message: message.clone(),
        },
        other => DeadLetterReason::MalformedRecord(other.to_string()),
    }
}

#[derive(Clone)]
enum SourceWorker {
    Dimension(Scd2Applier),
    Fact(FactMerger),
}

enum RecordOutcome {
    Decided(ChangeDecision),
    Fact(FactMergeOutcome),
    Skipped,
    Late,
}

/// What happened to one natural key.
#[derive(Debug, Default)]
struct KeyReport {
    counts: MergeCounts,
    /// Load timestamps of handled records.
    processed: Vec<DateTime<Utc>>,
    /// Earliest load timestamp left unhandled.
    unprocessed: Option<DateTime<Utc>>,
    failed: bool,
    diverged: bool,
    errors: Vec<String>,
}

impl KeyReport {
    fn pending(records: &[BatchIngestRecord]) -> Self {
        Self {
            unprocessed: records.iter().map(|r| r.load_timestamp).min(),
            ..Self::default()
        }
    }
}

/// Per-run state shared by all key tasks.
#[derive(Clone)]
struct RunContext {
    store: Arc<dyn WarehouseStore>,
    source: Arc<str>,
    worker: SourceWorker,
    dead_letters: DeadLetterTracker,
    locks: Arc<KeyLocks>,
    retry: RetryPolicy,
    watermark: Option<DateTime<Utc>>,
    dry_run: bool,
    outage: Arc<OnceLock<String>>,
}

impl RunContext {
    fn new(engine: &MergeEngine, source: &SourceConfig, dry_run: bool) -> Result<Self> {
        let store = Arc::clone(&engine.store);
        let worker = if source.is_dimension() {
            SourceWorker::Dimension(Scd2Applier::new(Arc::clone(&store), source)?)
        } else {
            SourceWorker::Fact(FactMerger::new(Arc::clone(&store), source)?)
        };
        Ok(Self {
            dead_letters: DeadLetterTracker::new(Arc::clone(&store)),
            store,
            source: Arc::from(source.name.as_str()),
            worker,
            locks: Arc::clone(&engine.locks),
            retry: engine.retry,
            watermark: None,
            dry_run,
            outage: Arc::new(OnceLock::new()),
        })
    }

    fn halted(&self) -> bool {
        self.outage.get().is_some()
    }

    fn halt(&self, err: &MergeError) {
        if self.outage.set(err.to_string()).is_ok() {
            tracing::error!(error = %err, "storage outage, stopping run");
        }
    }

    fn below_watermark(&self, record: &BatchIngestRecord) -> bool {
        self.watermark.is_some_and(|w| record.load_timestamp <= w)
    }

    /// Runs `f` with transient retries; an invariant violation gets one more try.
    async fn guarded<T, F, Fut>(&self, operation: &str, natural_key: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ctx = RetryContext {
            source: &self.source,
            natural_key,
        };
        let mut violations = 0;
        loop {
            match with_retry(&self.retry, operation, &ctx, &mut f).await {
                Err(MergeError::InvariantViolation { reason, .. }) if violations == 0 => {
                    violations += 1;
                    tracing::warn!(
                        source = %self.source,
                        natural_key,
                        operation,
                        reason = %reason,
                        "invariant violation, retrying once"
                    );
                }
                other => return other,
            }
        }
    }

    async fn quarantine(
        &self,
        record: &BatchIngestRecord,
        reason: DeadLetterReason,
        report: &mut KeyReport,
    ) {
        report.counts.quarantined += 1;
        if self.dry_run {
            tracing::info!(natural_key = %record.natural_key, reason = %reason, "would quarantine");
            return;
        }
        self.dead_letters
            .quarantine(record, reason, &self.source)
            .await;
    }

    /// Routes a failed record and notes whether the key failed.
    async fn route_failure(
        &self,
        record: &BatchIngestRecord,
        err: &MergeError,
        report: &mut KeyReport,
    ) {
        let reason = failure_reason(err);
        if !matches!(err, MergeError::MalformedRecord { .. }) {
            report.failed = true;
            let error = format!("{}: {err}", record.natural_key);
            if !report.errors.contains(&error) {
                report.errors.push(error);
            }
        }
        self.quarantine(record, reason, report).await;
    }

    async fn process_record(&self, record: &BatchIngestRecord) -> Result<RecordOutcome> {
        match &self.worker {
            SourceWorker::Dimension(applier) => {
                if self.below_watermark(record) && applier.is_reflected(record).await? {
                    return Ok(RecordOutcome::Skipped);
                }
                let current = applier.current_version(&record.natural_key).await?;
                let decision = classify(record, current.as_ref(), applier.tracked());
                match decision {
                    ChangeDecision::NoChange => Ok(RecordOutcome::Decided(decision)),
                    ChangeDecision::LateArrival => {
                        if applier.is_reflected(record).await? {
                            Ok(RecordOutcome::Skipped)
                        } else {
                            Ok(RecordOutcome::Late)
                        }
                    }
                    ChangeDecision::Insert | ChangeDecision::Scd2Update => {
                        match applier
                            .apply_dimension_change(decision, record, current.as_ref())
                            .await?
                        {
                            ApplyOutcome::AlreadyApplied => Ok(RecordOutcome::Skipped),
                            _ => Ok(RecordOutcome::Decided(decision)),
                        }
                    }
                }
            }
            SourceWorker::Fact(merger) => {
                let outcome = merger.merge_fact(record).await?;
                if outcome == FactMergeOutcome::Unchanged && self.below_watermark(record) {
                    Ok(RecordOutcome::Skipped)
                } else {
                    Ok(RecordOutcome::Fact(outcome))
                }
            }
        }
    }

    async fn process_key(
        self,
        natural_key: String,
        records: Vec<BatchIngestRecord>,
        cancel: &CancelFlag,
    ) -> KeyReport {
        if cancel.is_cancelled() || self.halted() {
            return KeyReport::pending(&records);
        }
        let _guard = self.locks.lock(&self.source, &natural_key).await;
        let span = merge_span("merge_key", &self.source, &natural_key);

        async {
            let mut report = KeyReport::default();
            for record in &records {
                if self.halted() {
                    report.unprocessed = Some(record.load_timestamp);
                    break;
                }
                match self
                    .guarded("merge_record", &natural_key, || self.process_record(record))
                    .await
                {
                    Ok(RecordOutcome::Decided(decision)) => {
                        metrics::record_decision(decision.as_str());
                        report.counts.record_decision(decision);
                    }
                    Ok(RecordOutcome::Fact(outcome)) => {
                        metrics::record_fact_outcome(outcome.as_str());
                        report.counts.record_fact(outcome);
                    }
                    Ok(RecordOutcome::Skipped) => {
                        metrics::record_decision("already_applied");
                        report.counts.skipped += 1;
                    }
                    Ok(RecordOutcome::Late) => {
                        metrics::record_decision(ChangeDecision::LateArrival.as_str());
                        report.counts.record_decision(ChangeDecision::LateArrival);
                        self.quarantine(record, DeadLetterReason::OutOfOrder, &mut report)
                            .await;
                    }
                    Err(err) if err.is_outage() => {
                        self.halt(&err);
                        report.unprocessed = Some(record.load_timestamp);
                        break;
                    }
                    Err(err) => self.route_failure(record, &err, &mut report).await,
                }
                report.processed.push(record.load_timestamp);
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn refresh_key(
        self,
        natural_key: String,
        records: Vec<BatchIngestRecord>,
        cancel: &CancelFlag,
    ) -> KeyReport {
        if cancel.is_cancelled() || self.halted() {
            return KeyReport::pending(&records);
        }
        let _guard = self.locks.lock(&self.source, &natural_key).await;
        let span = merge_span("refresh_key", &self.source, &natural_key);

        async {
            let mut report = KeyReport::default();
            let result = match &self.worker {
                SourceWorker::Dimension(applier) => {
                    let rebuilt = rebuild_history(&self.source, &records, applier.tracked());
                    for decision in &rebuilt.decisions {
                        metrics::record_decision(decision.as_str());
                        report.counts.record_decision(*decision);
                    }
                    self.guarded("refresh_history", &natural_key, || {
                        self.reconcile_history(applier, &natural_key, &rebuilt)
                    })
                    .await
                }
                SourceWorker::Fact(merger) => {
                    self.refresh_fact(merger, &natural_key, &records, &mut report)
                        .await
                }
            };

            match result {
                Ok(diverged) => {
                    if diverged {
                        tracing::info!(dry_run = self.dry_run, "stored history diverged from rebuild");
                    }
                    report.diverged = diverged;
                    report
                        .processed
                        .extend(records.iter().map(|r| r.load_timestamp));
                }
                Err(err) if err.is_outage() => {
                    self.halt(&err);
                    report.unprocessed = records.iter().map(|r| r.load_timestamp).min();
                }
                Err(err) => {
                    for record in &records {
                        self.route_failure(record, &err, &mut report).await;
                        report.processed.push(record.load_timestamp);
                    }
                }
            }
            report
        }
        .instrument(span)
        .await
    }

    /// Compares rebuilt and stored history; replaces stored history on divergence.
    async fn reconcile_history(
        &self,
        applier: &Scd2Applier,
        natural_key: &str,
        rebuilt: &RebuiltHistory,
    ) -> Result<bool> {
        let stored = applier.history(natural_key).await?;
        if rebuilt.matches(&stored) {
            return Ok(false);
        }
        if self.dry_run {
            return Ok(true);
        }
        let versions = assign_surrogate_keys(rebuilt.versions.clone(), &stored, || {
            applier.allocate_surrogate_key()
        })
        .await?;
        applier.replace_history(natural_key, versions).await?;
        Ok(true)
    }

    /// Rebuilds one fact row: the last valid record wins.
    async fn refresh_fact(
        &self,
        merger: &FactMerger,
        natural_key: &str,
        records: &[BatchIngestRecord],
        report: &mut KeyReport,
    ) -> Result<bool> {
        let mut winner = None;
        for record in records {
            match merger.to_fact(record) {
                Ok(fact) => winner = Some(fact),
                Err(err) => self.route_failure(record, &err, report).await,
            }
        }
        let Some(fact) = winner else {
            return Ok(false);
        };

        let stored = self
            .guarded("get_fact", natural_key, || merger.stored(natural_key))
            .await?;
        let outcome = match &stored {
            None => FactMergeOutcome::Inserted,
            Some(s) if *s == fact => FactMergeOutcome::Unchanged,
            Some(_) => FactMergeOutcome::Updated,
        };
        metrics::record_fact_outcome(outcome.as_str());
        report.counts.record_fact(outcome);
        if outcome == FactMergeOutcome::Unchanged {
            return Ok(false);
        }
        if !self.dry_run {
            let expected = stored.map(|s| s.load_timestamp);
            self.guarded("write_fact", natural_key, || {
                merger.write(fact.clone(), expected)
            })
            .await?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{Attributes, BatchId, MemoryWarehouse};

    fn record(source: &str, key: &str) -> BatchIngestRecord {
        BatchIngestRecord {
            source: source.into(),
            natural_key: key.into(),
            attributes: Attributes::new(),
            load_timestamp: Utc::now(),
            batch_id: BatchId::generate(),
            sequence: 0,
        }
    }

    #[test]
    fn precheck_routes_structural_problems() {
        assert_eq!(
            precheck(&record("customers", ""), "customers"),
            Err(DeadLetterReason::MissingNaturalKey)
        );
        assert!(matches!(
            precheck(&record("orders", "C001"), "customers"),
            Err(DeadLetterReason::MalformedRecord(_))
        ));
        assert!(precheck(&record("customers", "C001"), "customers").is_ok());
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[tokio::test]
    async fn unknown_source_is_an_error() {
        let engine = MergeEngine::new(Arc::new(MemoryWarehouse::new()), EngineConfig::default()).unwrap();
        let err = engine
            .run_incremental("customers", Vec::new(), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::UnknownSource { .. }));
    }
}

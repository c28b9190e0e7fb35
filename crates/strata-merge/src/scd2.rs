//! SCD Type 2 history application.
//!
//! The applier turns classifier decisions into versioned history. An update is
//! always a single [`WriteBatch`] holding the close of the current version and
//! the insert of its successor, so history never shows a gap or an overlap even
//! if the process dies between the two.
//!
//! Full refresh uses [`rebuild_history`] to replay records from empty state in
//! memory and [`assign_surrogate_keys`] to carry keys of unchanged versions over
//! to the replacement history.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use strata_core::{
    BatchIngestRecord, CommitResult, DimensionVersion, RecordFingerprint, SourceConfig, SurrogateKey,
    WarehouseStore, WriteBatch, WriteOp,
};

use crate::classifier::{ChangeDecision, classify};
use crate::error::{MergeError, Result};

/// Result of applying one dimension decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A first version was opened.
    Inserted(DimensionVersion),
    /// The current version was closed and a successor opened.
    Updated {
        /// The version that was closed.
        closed: SurrogateKey,
        /// The new current version.
        opened: DimensionVersion,
    },
    /// The record is already reflected in history; nothing was written.
    AlreadyApplied,
    /// The decision does not mutate history.
    Unchanged,
}

/// Returns true when `record` is already reflected in `versions`.
///
/// Either a version was opened by this exact record at its position in
/// `(load_timestamp, sequence)` order, or the version governing that position
/// (the last one opened at or before it) already carries the same tracked
/// attributes. The check uses only persisted history, so it gives the same
/// answer whether or not the source watermark covers the record.
#[must_use]
pub fn reflected_in(
    versions: &[DimensionVersion],
    record: &BatchIngestRecord,
    tracked: &[String],
) -> bool {
    let order = record.processing_order();
    let fingerprint = record.fingerprint();
    versions
        .iter()
        .any(|v| v.processing_order() == order && v.record_fingerprint == fingerprint)
        || versions
            .iter()
            .filter(|v| v.processing_order() <= order)
            .max_by_key(|v| v.processing_order())
            .is_some_and(|v| v.tracked_equal(&record.attributes, tracked))
}

/// Applies dimension decisions for one source.
#[derive(Clone)]
pub struct Scd2Applier {
    store: Arc<dyn WarehouseStore>,
    source: String,
    tracked: Arc<[String]>,
}

impl std::fmt::Debug for Scd2Applier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scd2Applier")
            .field("source", &self.source)
            .field("tracked", &self.tracked)
            .finish_non_exhaustive()
    }
}

impl Scd2Applier {
    /// Creates an applier for a dimension source.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::SourceKindMismatch`] for fact sources.
    pub fn new(store: Arc<dyn WarehouseStore>, source: &SourceConfig) -> Result<Self> {
        let tracked = source
            .tracked_attributes()
            .ok_or_else(|| MergeError::SourceKindMismatch {
                source_name: source.name.clone(),
                expected: "dimension",
            })?;
        Ok(Self {
            store,
            source: source.name.clone(),
            tracked: tracked.into(),
        })
    }

    /// Tracked attributes of the source.
    #[must_use]
    pub fn tracked(&self) -> &[String] {
        &self.tracked
    }

    /// Reads the current version of a key.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn current_version(&self, natural_key: &str) -> Result<Option<DimensionVersion>> {
        Ok(self
            .store
            .get_current_version(&self.source, natural_key)
            .await?)
    }

    /// Reads the full history of a key.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn history(&self, natural_key: &str) -> Result<Vec<DimensionVersion>> {
        Ok(self
            .store
            .get_all_versions(&self.source, natural_key)
            .await?)
    }

    /// Allocates a surrogate key for a new version.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn allocate_surrogate_key(&self) -> Result<SurrogateKey> {
        Ok(self.store.allocate_surrogate_key().await?)
    }

    /// Returns true when the record is already reflected in stored history.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn is_reflected(&self, record: &BatchIngestRecord) -> Result<bool> {
        let versions = self.history(&record.natural_key).await?;
        Ok(reflected_in(&versions, record, &self.tracked))
    }

    /// Materializes a decision into history.
    ///
    /// `current` must be the version the decision was made against. The
    /// idempotency check runs before anything is written.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::InvariantViolation`] when the write precondition
    /// fails (the key changed underneath the decision), or storage errors.
    pub async fn apply_dimension_change(
        &self,
        decision: ChangeDecision,
        record: &BatchIngestRecord,
        current: Option<&DimensionVersion>,
    ) -> Result<ApplyOutcome> {
        if !decision.mutates() {
            return Ok(ApplyOutcome::Unchanged);
        }
        if self.is_reflected(record).await? {
            tracing::debug!(
                source = %self.source,
                natural_key = %record.natural_key,
                "record already applied"
            );
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let opened = DimensionVersion {
            surrogate_key: self.store.allocate_surrogate_key().await?,
            source: self.source.clone(),
            natural_key: record.natural_key.clone(),
            attributes: record.attributes.clone(),
            valid_from: record.load_timestamp,
            valid_to: None,
            is_current: true,
            record_fingerprint: record.fingerprint(),
            batch_id: record.batch_id,
            sequence: record.sequence,
        };

        let mut batch = WriteBatch::new();
        let closed = match (decision, current) {
            (ChangeDecision::Scd2Update, Some(current)) => {
                batch.push(WriteOp::CloseVersion {
                    source: self.source.clone(),
                    natural_key: record.natural_key.clone(),
                    surrogate_key: current.surrogate_key,
                    valid_to: record.load_timestamp,
                });
                Some(current.surrogate_key)
            }
            (ChangeDecision::Scd2Update, None) => {
                return Err(self.violation(record, "update decided without a current version"));
            }
            _ => None,
        };
        batch.push(WriteOp::InsertVersion(opened.clone()));

        match self.store.transactional_write(batch).await? {
            CommitResult::Committed => Ok(match closed {
                Some(closed) => ApplyOutcome::Updated { closed, opened },
                None => ApplyOutcome::Inserted(opened),
            }),
            CommitResult::PreconditionFailed { reason } => Err(self.violation(record, &reason)),
        }
    }

    /// Replaces the stored history of a key.
    ///
    /// # Errors
    ///
    /// Returns storage errors, or [`MergeError::InvariantViolation`] when the
    /// store rejects the replacement.
    pub async fn replace_history(
        &self,
        natural_key: &str,
        versions: Vec<DimensionVersion>,
    ) -> Result<()> {
        let batch = WriteBatch::new().with(WriteOp::ReplaceHistory {
            source: self.source.clone(),
            natural_key: natural_key.to_string(),
            versions,
        });
        match self.store.transactional_write(batch).await? {
            CommitResult::Committed => Ok(()),
            CommitResult::PreconditionFailed { reason } => Err(MergeError::InvariantViolation {
                source_name: self.source.clone(),
                natural_key: natural_key.to_string(),
                reason,
            }),
        }
    }

    fn violation(&self, record: &BatchIngestRecord, reason: &str) -> MergeError {
        MergeError::InvariantViolation {
            source_name: self.source.clone(),
            natural_key: record.natural_key.clone(),
            reason: reason.to_string(),
        }
    }
}

/// In-memory replay of one key's records from empty state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuiltHistory {
    /// Versions in `valid_from` order; surrogate keys are unassigned (zero).
    pub versions: Vec<DimensionVersion>,
    /// Decision taken for each record, in processing order.
    pub decisions: Vec<ChangeDecision>,
}

impl RebuiltHistory {
    /// Returns true when `stored` holds the same history, ignoring surrogate keys.
    #[must_use]
    pub fn matches(&self, stored: &[DimensionVersion]) -> bool {
        if self.versions.len() != stored.len() {
            return false;
        }
        let mut stored: Vec<&DimensionVersion> = stored.iter().collect();
        stored.sort_by_key(|v| content_order(v));
        let mut rebuilt: Vec<&DimensionVersion> = self.versions.iter().collect();
        rebuilt.sort_by_key(|v| content_order(v));
        rebuilt
            .iter()
            .zip(&stored)
            .all(|(rebuilt, stored)| same_version(rebuilt, stored))
    }
}

/// History order with the fingerprint standing in for the surrogate key.
fn content_order(
    v: &DimensionVersion,
) -> (DateTime<Utc>, bool, Option<DateTime<Utc>>, &RecordFingerprint) {
    (
        v.valid_from,
        v.valid_to.is_none(),
        v.valid_to,
        &v.record_fingerprint,
    )
}

fn same_version(a: &DimensionVersion, b: &DimensionVersion) -> bool {
    a.natural_key == b.natural_key
        && a.valid_from == b.valid_from
        && a.valid_to == b.valid_to
        && a.is_current == b.is_current
        && a.attributes == b.attributes
        && a.record_fingerprint == b.record_fingerprint
        && a.sequence == b.sequence
}

/// Replays `records` (one natural key, any order) from empty state.
///
/// Records are processed in `(load_timestamp, sequence)` order using the same
/// classifier as incremental runs, so an input merged incrementally without
/// late arrivals rebuilds to an identical history.
#[must_use]
pub fn rebuild_history(
    source: &str,
    records: &[BatchIngestRecord],
    tracked: &[String],
) -> RebuiltHistory {
    let mut ordered: Vec<&BatchIngestRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.processing_order());

    let mut rebuilt = RebuiltHistory::default();
    for record in ordered {
        let decision = classify(record, rebuilt.versions.last(), tracked);
        rebuilt.decisions.push(decision);
        if !decision.mutates() {
            continue;
        }
        if let Some(last) = rebuilt.versions.last_mut() {
            last.valid_to = Some(record.load_timestamp);
            last.is_current = false;
        }
        rebuilt.versions.push(DimensionVersion {
            surrogate_key: SurrogateKey::new(0),
            source: source.to_string(),
            natural_key: record.natural_key.clone(),
            attributes: record.attributes.clone(),
            valid_from: record.load_timestamp,
            valid_to: None,
            is_current: true,
            record_fingerprint: record.fingerprint(),
            batch_id: record.batch_id,
            sequence: record.sequence,
        });
    }
    rebuilt
}

/// Gives rebuilt versions their final surrogate keys.
///
/// A rebuilt version opened by the same record at the same position as a
/// stored version keeps that version's key; the rest get keys from `allocate`.
///
/// # Errors
///
/// Propagates allocation failures.
pub async fn assign_surrogate_keys<F, Fut>(
    mut rebuilt: Vec<DimensionVersion>,
    stored: &[DimensionVersion],
    mut allocate: F,
) -> Result<Vec<DimensionVersion>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<SurrogateKey>>,
{
    let mut reusable: Vec<&DimensionVersion> = stored.iter().collect();
    for version in &mut rebuilt {
        let reuse = reusable.iter().position(|s| {
            s.processing_order() == version.processing_order()
                && s.record_fingerprint == version.record_fingerprint
        });
        version.surrogate_key = match reuse {
            Some(idx) => reusable.swap_remove(idx).surrogate_key,
            None => allocate().await?,
        };
    }
    Ok(rebuilt)
}

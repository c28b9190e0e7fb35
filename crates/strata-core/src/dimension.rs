//! Versioned dimension history rows (SCD Type 2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::RecordFingerprint;
use crate::id::{BatchId, SurrogateKey};
use crate::record::{Attributes, NULL};

/// One version of a dimension member.
///
/// For a natural key, versions ordered by `valid_from` form contiguous,
/// non-overlapping `[valid_from, valid_to)` intervals; only the latest is open
/// (`valid_to = None`) and current. A version is mutated only once, to close it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionVersion {
    /// System-assigned identifier of this version.
    pub surrogate_key: SurrogateKey,
    /// Dimension source the version belongs to.
    pub source: String,
    /// Business key shared by all versions of the member.
    pub natural_key: String,
    /// Attribute snapshot taken from the record that opened the version.
    pub attributes: Attributes,
    /// Inclusive start of validity.
    pub valid_from: DateTime<Utc>,
    /// Exclusive end of validity; `None` while open.
    pub valid_to: Option<DateTime<Utc>>,
    /// Whether this is the current version of the member.
    pub is_current: bool,
    /// Fingerprint of the record that opened the version.
    pub record_fingerprint: RecordFingerprint,
    /// Batch that opened the version.
    pub batch_id: BatchId,
    /// Ingestion sequence of the record that opened the version.
    #[serde(default)]
    pub sequence: u64,
}

impl DimensionVersion {
    /// Returns true when the version is valid at `as_of`.
    #[must_use]
    pub fn covers(&self, as_of: DateTime<Utc>) -> bool {
        self.valid_from <= as_of && self.valid_to.is_none_or(|to| as_of < to)
    }

    /// Position of the opening record in `(load_timestamp, sequence)` order.
    ///
    /// Comparable with [`BatchIngestRecord::processing_order`]: a record whose
    /// order is below the current version's was already overtaken by it.
    ///
    /// [`BatchIngestRecord::processing_order`]: crate::record::BatchIngestRecord::processing_order
    #[must_use]
    pub fn processing_order(&self) -> (DateTime<Utc>, u64) {
        (self.valid_from, self.sequence)
    }

    /// Sort key placing a key's versions in history order.
    ///
    /// Versions sharing a `valid_from` sort closed before open and shorter
    /// before longer, so a zero-length version precedes its successor.
    #[must_use]
    pub fn history_order(&self) -> (DateTime<Utc>, bool, Option<DateTime<Utc>>, SurrogateKey) {
        (
            self.valid_from,
            self.valid_to.is_none(),
            self.valid_to,
            self.surrogate_key,
        )
    }

    /// Returns true when every tracked attribute equals the given snapshot.
    ///
    /// Missing attributes compare as null on both sides.
    #[must_use]
    pub fn tracked_equal(&self, other: &Attributes, tracked: &[String]) -> bool {
        tracked.iter().all(|name| {
            self.attributes.get(name).unwrap_or(&NULL) == other.get(name).unwrap_or(&NULL)
        })
    }
}

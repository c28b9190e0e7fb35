//! Freshness and dead-letter records.
//!
//! These are the operator-facing side tables: per-source load recency, and the
//! append-only quarantine of rows the engine refused to merge.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::RecordFingerprint;
use crate::record::BatchIngestRecord;

/// Last observed load for a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessState {
    /// Source name.
    pub source: String,
    /// Highest load timestamp seen for the source.
    pub last_load_timestamp: DateTime<Utc>,
    /// Wall-clock time at which that load was observed.
    pub observed_at: DateTime<Utc>,
}

/// Why a record was quarantined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum DeadLetterReason {
    /// Load timestamp precedes the current version's `valid_from`.
    OutOfOrder,
    /// The record carried no natural key.
    MissingNaturalKey,
    /// The record could not be interpreted (e.g. missing fact event time).
    MalformedRecord(String),
    /// Transient storage failures persisted through every retry.
    RetriesExhausted {
        /// Operation that kept failing.
        operation: String,
        /// Last error message.
        message: String,
    },
    /// A merge-time invariant check failed twice for the key.
    InvariantViolation(String),
}

impl DeadLetterReason {
    /// Stable short label, used in metrics and de-duplication.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::OutOfOrder => "out-of-order",
            Self::MissingNaturalKey => "missing-natural-key",
            Self::MalformedRecord(_) => "malformed-record",
            Self::RetriesExhausted { .. } => "storage-retries-exhausted",
            Self::InvariantViolation(_) => "invariant-violation",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfOrder | Self::MissingNaturalKey => f.write_str(self.kind()),
            Self::MalformedRecord(detail) | Self::InvariantViolation(detail) => {
                write!(f, "{}: {detail}", self.kind())
            }
            Self::RetriesExhausted { operation, message } => {
                write!(f, "{}: {operation}: {message}", self.kind())
            }
        }
    }
}

/// A quarantined record. Append-only; never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Source the record came from.
    pub source: String,
    /// Natural key as received (may be empty).
    pub natural_key: String,
    /// The original record.
    pub record: BatchIngestRecord,
    /// Failure reason.
    pub reason: DeadLetterReason,
    /// When the record first failed.
    pub first_failed_at: DateTime<Utc>,
    /// Fingerprint of the original record.
    pub fingerprint: RecordFingerprint,
}

impl DeadLetterEntry {
    /// Returns true when both entries describe the same failure of the same record.
    #[must_use]
    pub fn same_failure(&self, other: &Self) -> bool {
        self.source == other.source
            && self.fingerprint == other.fingerprint
            && self.reason.kind() == other.reason.kind()
    }
}

/// Filter for dead-letter listings. `since` is inclusive, `until` exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterQuery {
    /// Restrict to one source.
    pub source: Option<String>,
    /// Earliest `first_failed_at` to include.
    pub since: Option<DateTime<Utc>>,
    /// First `first_failed_at` to exclude.
    pub until: Option<DateTime<Utc>>,
}

impl DeadLetterQuery {
    /// Returns true when the entry passes the filter.
    #[must_use]
    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.source.as_ref().is_none_or(|s| *s == entry.source)
            && self.since.is_none_or(|t| entry.first_failed_at >= t)
            && self.until.is_none_or(|t| entry.first_failed_at < t)
    }
}

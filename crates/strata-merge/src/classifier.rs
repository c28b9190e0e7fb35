//! Change classification.
//!
//! [`classify`] is a pure decision function: it compares one incoming record to
//! the current version of its natural key and decides what the applier should
//! do. It never touches storage.

use std::fmt;

use serde::{Deserialize, Serialize};
use strata_core::{BatchIngestRecord, DimensionVersion};

/// What to do with an incoming dimension record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDecision {
    /// No version exists yet; open the first one.
    Insert,
    /// A tracked attribute changed; close the current version and open a new one.
    Scd2Update,
    /// Nothing tracked changed; discard the record.
    NoChange,
    /// The record predates the current version; quarantine it.
    LateArrival,
}

impl ChangeDecision {
    /// Stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Scd2Update => "scd2_update",
            Self::NoChange => "no_change",
            Self::LateArrival => "late_arrival",
        }
    }

    /// Returns true when applying the decision mutates history.
    #[must_use]
    pub const fn mutates(self) -> bool {
        matches!(self, Self::Insert | Self::Scd2Update)
    }
}

impl fmt::Display for ChangeDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies `record` against the current version of its key.
///
/// Only `tracked` attributes are compared. A record that precedes the record
/// which opened the current version, in `(load_timestamp, sequence)` order, is
/// a late arrival whether or not it changes anything: applying it would have to
/// reopen closed history. This includes a same-instant record with a lower
/// sequence.
#[must_use]
pub fn classify(
    record: &BatchIngestRecord,
    current: Option<&DimensionVersion>,
    tracked: &[String],
) -> ChangeDecision {
    let Some(current) = current else {
        return ChangeDecision::Insert;
    };

    if record.processing_order() < current.processing_order() {
        return ChangeDecision::LateArrival;
    }

    if current.tracked_equal(&record.attributes, tracked) {
        ChangeDecision::NoChange
    } else {
        ChangeDecision::Scd2Update
    }
}

//! Fact rows merged by natural key.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::RecordFingerprint;
use crate::record::Attributes;

/// A stored fact. Exactly one row exists per `(source, natural_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactRecord {
    /// Fact source (table feed).
    pub source: String,
    /// Business key, e.g. a transaction id.
    pub natural_key: String,
    /// Foreign natural keys, keyed by dimension source name.
    pub dimension_keys: BTreeMap<String, String>,
    /// Measures and categorical attributes.
    pub measures: Attributes,
    /// When the business event happened; used for point-in-time joins.
    pub event_timestamp: DateTime<Utc>,
    /// Load timestamp of the record that last wrote this row.
    pub load_timestamp: DateTime<Utc>,
    /// Fingerprint of the record that last wrote this row.
    pub record_fingerprint: RecordFingerprint,
}

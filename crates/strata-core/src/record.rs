//! Incoming batch records and their attribute values.
//!
//! A [`BatchIngestRecord`] is one schema-validated row handed to the engine by
//! the external ingestion component. It is consumed once by the classifier and
//! is not retained after the merge (dead-lettered copies excepted).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fingerprint::RecordFingerprint;
use crate::id::BatchId;

/// A single attribute value.
///
/// Equality is type-aware and exact: `Int(1)` never equals `Float(1.0)`, and
/// floats compare by bit pattern so formatting round-trips cannot make two
/// values flap between equal and unequal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Explicit null. A missing attribute is treated the same way.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// Text value.
    Text(String),
}

/// Shared null used when an attribute is absent.
pub static NULL: AttributeValue = AttributeValue::Null;

impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Text(a), Self::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for AttributeValue {}

impl AttributeValue {
    /// Returns true for [`AttributeValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the text payload, if this is a text value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Interprets the value as a timestamp.
    ///
    /// Text is parsed as RFC 3339; integers are epoch milliseconds.
    #[must_use]
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Text(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            Self::Int(ms) => DateTime::from_timestamp_millis(*ms),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Ordered attribute map. Ordering keeps hashing and serialization deterministic.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// One normalized incoming row plus its load metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchIngestRecord {
    /// Source (dimension or fact table feed) this row belongs to.
    pub source: String,
    /// Natural / business key. Empty means missing.
    #[serde(default)]
    pub natural_key: String,
    /// Attribute values, tracked and untracked.
    #[serde(default)]
    pub attributes: Attributes,
    /// When the source delivered this row.
    pub load_timestamp: DateTime<Utc>,
    /// Batch the row arrived in.
    pub batch_id: BatchId,
    /// Ingestion sequence number; breaks ties between rows with the same key
    /// and load timestamp.
    #[serde(default)]
    pub sequence: u64,
}

impl BatchIngestRecord {
    /// Returns the attribute value, treating a missing attribute as null.
    #[must_use]
    pub fn attribute(&self, name: &str) -> &AttributeValue {
        self.attributes.get(name).unwrap_or(&NULL)
    }

    /// Checks the structural requirements the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` when the natural key or source is missing.
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(Error::InvalidInput("record has no source".into()));
        }
        if self.natural_key.trim().is_empty() {
            return Err(Error::InvalidInput("record has no natural key".into()));
        }
        Ok(())
    }

    /// Computes the replay fingerprint of this record.
    #[must_use]
    pub fn fingerprint(&self) -> RecordFingerprint {
        RecordFingerprint::compute(&self.natural_key, self.load_timestamp, &self.attributes)
    }

    /// Ordering used everywhere records of one key are processed.
    #[must_use]
    pub fn processing_order(&self) -> (DateTime<Utc>, u64) {
        (self.load_timestamp, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(key: &str) -> BatchIngestRecord {
        BatchIngestRecord {
            source: "customers".into(),
            natural_key: key.into(),
            attributes: Attributes::new(),
            load_timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            batch_id: BatchId::generate(),
            sequence: 0,
        }
    }

    #[test]
    fn int_and_float_are_never_equal() {
        assert_ne!(AttributeValue::Int(1), AttributeValue::Float(1.0));
        assert_eq!(AttributeValue::Float(0.1), AttributeValue::Float(0.1));
        assert_ne!(AttributeValue::Float(0.0), AttributeValue::Float(-0.0));
    }

    #[test]
    fn null_only_equals_null() {
        assert_eq!(AttributeValue::Null, AttributeValue::Null);
        assert_ne!(AttributeValue::Null, AttributeValue::Text(String::new()));
    }

    #[test]
    fn missing_attribute_reads_as_null() {
        assert!(record("C001").attribute("segment").is_null());
    }

    #[test]
    fn blank_natural_key_is_rejected() {
        assert!(record("  ").validate().is_err());
        assert!(record("C001").validate().is_ok());
    }

    #[test]
    fn untagged_values_deserialize_by_shape() {
        let attrs: Attributes =
            serde_json::from_str(r#"{"a":null,"b":true,"c":3,"d":2.5,"e":"x"}"#).unwrap();
        assert_eq!(attrs["a"], AttributeValue::Null);
        assert_eq!(attrs["b"], AttributeValue::Bool(true));
        assert_eq!(attrs["c"], AttributeValue::Int(3));
        assert_eq!(attrs["d"], AttributeValue::Float(2.5));
        assert_eq!(attrs["e"], AttributeValue::Text("x".into()));
    }

    #[test]
    fn timestamps_parse_from_text_and_millis() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert_eq!(
            AttributeValue::from("2024-05-01T00:00:00Z").as_timestamp(),
            Some(expected)
        );
        assert_eq!(
            AttributeValue::Int(expected.timestamp_millis()).as_timestamp(),
            Some(expected)
        );
        assert_eq!(AttributeValue::Bool(true).as_timestamp(), None);
    }
}

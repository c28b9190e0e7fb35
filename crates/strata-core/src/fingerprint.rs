//! Record fingerprints for replay detection.
//!
//! A fingerprint is the SHA-256 of `(natural_key, load_timestamp, attributes)` in
//! a canonical, type-tagged encoding. Versions and facts remember the fingerprint
//! of the record that produced them; dead-letter entries are keyed by it. Seeing
//! the same fingerprint again means the record was already handled.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::record::{AttributeValue, Attributes};

/// Hex-encoded SHA-256 fingerprint of a record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordFingerprint(String);

impl RecordFingerprint {
    /// Computes the fingerprint of a record's identity and content.
    #[must_use]
    pub fn compute(
        natural_key: &str,
        load_timestamp: DateTime<Utc>,
        attributes: &Attributes,
    ) -> Self {
        let mut hasher = Sha256::new();
        update_len_prefixed(&mut hasher, natural_key.as_bytes());
        let nanos = load_timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| load_timestamp.timestamp_millis().saturating_mul(1_000_000));
        hasher.update(nanos.to_be_bytes());
        update_attributes(&mut hasher, attributes);
        Self(hex::encode(hasher.finalize()))
    }

    /// Wraps an already computed fingerprint string.
    #[must_use]
    pub fn from_hex(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hashes attribute content alone (no key, no timestamp).
#[must_use]
pub fn attribute_hash(attributes: &Attributes) -> String {
    let mut hasher = Sha256::new();
    update_attributes(&mut hasher, attributes);
    hex::encode(hasher.finalize())
}

fn update_attributes(hasher: &mut Sha256, attributes: &Attributes) {
    hasher.update((attributes.len() as u64).to_be_bytes());
    for (name, value) in attributes {
        update_len_prefixed(hasher, name.as_bytes());
        match value {
            AttributeValue::Null => hasher.update([0u8]),
            AttributeValue::Bool(b) => hasher.update([1u8, u8::from(*b)]),
            AttributeValue::Int(i) => {
                hasher.update([2u8]);
                hasher.update(i.to_be_bytes());
            }
            AttributeValue::Float(f) => {
                hasher.update([3u8]);
                hasher.update(f.to_bits().to_be_bytes());
            }
            AttributeValue::Text(s) => {
                hasher.update([4u8]);
                update_len_prefixed(hasher, s.as_bytes());
            }
        }
    }
}

fn update_len_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn attrs(pairs: &[(&str, AttributeValue)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let a = attrs(&[("segment", "starter".into())]);
        assert_eq!(
            RecordFingerprint::compute("C001", ts, &a),
            RecordFingerprint::compute("C001", ts, &a)
        );
    }

    #[test]
    fn fingerprint_changes_with_timestamp_key_or_type() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let base = RecordFingerprint::compute("C001", ts, &attrs(&[("n", 1_i64.into())]));

        assert_ne!(
            base,
            RecordFingerprint::compute("C001", later, &attrs(&[("n", 1_i64.into())]))
        );
        assert_ne!(
            base,
            RecordFingerprint::compute("C002", ts, &attrs(&[("n", 1_i64.into())]))
        );
        assert_ne!(
            base,
            RecordFingerprint::compute("C001", ts, &attrs(&[("n", 1.0_f64.into())]))
        );
    }

    #[test]
    fn attribute_hash_ignores_insertion_order() {
        let mut first = Attributes::new();
        first.insert("b".into(), 2_i64.into());
        first.insert("a".into(), 1_i64.into());
        let mut second = Attributes::new();
        second.insert("a".into(), 1_i64.into());
        second.insert("b".into(), 2_i64.into());
        assert_eq!(attribute_hash(&first), attribute_hash(&second));
    }
}

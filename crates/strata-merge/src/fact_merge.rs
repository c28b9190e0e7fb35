//! Incremental fact merge (upsert by natural key).
//!
//! A stored fact only moves forward: a record whose load timestamp is older
//! than the stored row is reported as stale and dropped, so replaying an old
//! batch can never regress data. The write is a compare-and-swap on the load
//! timestamp the decision was based on.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_core::{
    AttributeValue, BatchIngestRecord, CommitResult, FactRecord, SourceConfig, SourceKind,
    WarehouseStore, WriteBatch, WriteOp,
};

use crate::error::{MergeError, Result};

/// Result of merging one fact record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactMergeOutcome {
    /// No row existed; one was inserted.
    Inserted,
    /// The stored row was overwritten.
    Updated,
    /// The stored row was written by this exact record.
    Unchanged,
    /// The record is older than the stored row and was ignored.
    Stale,
}

impl FactMergeOutcome {
    /// Stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Stale => "stale",
        }
    }
}

impl fmt::Display for FactMergeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upserts fact records for one source.
#[derive(Clone)]
pub struct FactMerger {
    store: Arc<dyn WarehouseStore>,
    source: String,
    event_time_attribute: String,
    dimension_refs: BTreeMap<String, String>,
}

impl fmt::Debug for FactMerger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactMerger")
            .field("source", &self.source)
            .field("event_time_attribute", &self.event_time_attribute)
            .field("dimension_refs", &self.dimension_refs)
            .finish_non_exhaustive()
    }
}

impl FactMerger {
    /// Creates a merger for a fact source.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::SourceKindMismatch`] for dimension sources.
    pub fn new(store: Arc<dyn WarehouseStore>, source: &SourceConfig) -> Result<Self> {
        let SourceKind::Fact {
            event_time_attribute,
            dimension_refs,
        } = &source.kind
        else {
            return Err(MergeError::SourceKindMismatch {
                source_name: source.name.clone(),
                expected: "fact",
            });
        };
        Ok(Self {
            store,
            source: source.name.clone(),
            event_time_attribute: event_time_attribute.clone(),
            dimension_refs: dimension_refs.clone(),
        })
    }

    /// Converts a record into the fact row it would write.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::MalformedRecord`] when the event time is missing or
    /// unparseable, or a dimension reference is not a key-like value.
    pub fn to_fact(&self, record: &BatchIngestRecord) -> Result<FactRecord> {
        let event_timestamp = record
            .attribute(&self.event_time_attribute)
            .as_timestamp()
            .ok_or_else(|| {
                MergeError::malformed(format!(
                    "fact {} has no usable event time in '{}'",
                    record.natural_key, self.event_time_attribute
                ))
            })?;

        let mut dimension_keys = BTreeMap::new();
        for (dimension, attribute) in &self.dimension_refs {
            let key = match record.attribute(attribute) {
                AttributeValue::Null => continue,
                AttributeValue::Text(s) if s.trim().is_empty() => continue,
                AttributeValue::Text(s) => s.clone(),
                AttributeValue::Int(i) => i.to_string(),
                other => {
                    return Err(MergeError::malformed(format!(
                        "fact {} references {dimension} with non-key value {other:?}",
                        record.natural_key
                    )));
                }
            };
            dimension_keys.insert(dimension.clone(), key);
        }

        let measures = record
            .attributes
            .iter()
            .filter(|(name, _)| {
                **name != self.event_time_attribute
                    && !self.dimension_refs.values().any(|a| a == *name)
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Ok(FactRecord {
            source: self.source.clone(),
            natural_key: record.natural_key.clone(),
            dimension_keys,
            measures,
            event_timestamp,
            load_timestamp: record.load_timestamp,
            record_fingerprint: record.fingerprint(),
        })
    }

    /// Upserts one record.
    ///
    /// # Errors
    ///
    /// Returns malformed-record errors, storage errors, or
    /// [`MergeError::InvariantViolation`] if the stored row changed between
    /// the read and the write.
    pub async fn merge_fact(&self, record: &BatchIngestRecord) -> Result<FactMergeOutcome> {
        let fact = self.to_fact(record)?;
        let existing = self.store.get_fact(&self.source, &record.natural_key).await?;

        let outcome = match &existing {
            None => FactMergeOutcome::Inserted,
            Some(stored) if record.load_timestamp < stored.load_timestamp => {
                return Ok(FactMergeOutcome::Stale);
            }
            Some(stored) if stored.record_fingerprint == fact.record_fingerprint => {
                return Ok(FactMergeOutcome::Unchanged);
            }
            Some(_) => FactMergeOutcome::Updated,
        };

        self.write(fact, existing.map(|f| f.load_timestamp)).await?;
        Ok(outcome)
    }

    /// Writes a fact row, guarded by the load timestamp that was read.
    ///
    /// # Errors
    ///
    /// Returns storage errors or [`MergeError::InvariantViolation`].
    pub async fn write(
        &self,
        fact: FactRecord,
        expected_load_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()> {
        let natural_key = fact.natural_key.clone();
        let batch = WriteBatch::new().with(WriteOp::UpsertFact {
            fact,
            expected_load_timestamp,
        });
        match self.store.transactional_write(batch).await? {
            CommitResult::Committed => Ok(()),
            CommitResult::PreconditionFailed { reason } => Err(MergeError::InvariantViolation {
                source_name: self.source.clone(),
                natural_key,
                reason,
            }),
        }
    }

    /// Reads the stored fact for a key.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn stored(&self, natural_key: &str) -> Result<Option<FactRecord>> {
        Ok(self.store.get_fact(&self.source, natural_key).await?)
    }
}

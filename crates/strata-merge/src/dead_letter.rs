//! Dead-letter quarantine.
//!
//! `quarantine` is the last stop for a record: it never returns an error, so a
//! failing dead-letter write cannot take down the rest of the batch. A record
//! that fails the same way on a rerun is recognized and not appended twice.

use std::sync::Arc;

use chrono::Utc;
use strata_core::{
    BatchIngestRecord, DeadLetterEntry, DeadLetterQuery, DeadLetterReason, WarehouseStore,
};

use crate::error::Result;
use crate::metrics;

/// Outcome of a quarantine attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineOutcome {
    /// A new entry was appended.
    Recorded,
    /// An entry for the same failure of the same record already existed.
    Duplicate,
    /// The dead-letter store could not be written; the failure was logged.
    Failed,
}

/// Appends and lists dead-letter entries.
#[derive(Clone)]
pub struct DeadLetterTracker {
    store: Arc<dyn WarehouseStore>,
}

impl std::fmt::Debug for DeadLetterTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterTracker").finish_non_exhaustive()
    }
}

impl DeadLetterTracker {
    /// Creates a tracker over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn WarehouseStore>) -> Self {
        Self { store }
    }

    /// Quarantines a record.
    pub async fn quarantine(
        &self,
        record: &BatchIngestRecord,
        reason: DeadLetterReason,
        source: &str,
    ) -> QuarantineOutcome {
        let kind = reason.kind();
        tracing::warn!(
            source,
            natural_key = %record.natural_key,
            batch_id = %record.batch_id,
            load_timestamp = %record.load_timestamp,
            reason = %reason,
            "record quarantined"
        );
        metrics::record_quarantine(kind);

        let entry = DeadLetterEntry {
            source: source.to_string(),
            natural_key: record.natural_key.clone(),
            record: record.clone(),
            reason,
            first_failed_at: Utc::now(),
            fingerprint: record.fingerprint(),
        };
        match self.store.append_dead_letter(entry).await {
            Ok(true) => QuarantineOutcome::Recorded,
            Ok(false) => QuarantineOutcome::Duplicate,
            Err(error) => {
                tracing::error!(
                    source,
                    natural_key = %record.natural_key,
                    reason = kind,
                    %error,
                    "failed to write dead-letter entry"
                );
                QuarantineOutcome::Failed
            }
        }
    }

    /// Lists entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn list(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetterEntry>> {
        Ok(self.store.list_dead_letters(query).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use strata_core::{Attributes, BatchId, MemoryWarehouse};

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

    #[tokio::test]
    async fn duplicates_are_not_appended() {
        let tracker = DeadLetterTracker::new(Arc::new(MemoryWarehouse::new()));
        let rec = record("C001");
        assert_eq!(
            tracker
                .quarantine(&rec, DeadLetterReason::OutOfOrder, "customers")
                .await,
            QuarantineOutcome::Recorded
        );
        assert_eq!(
            tracker
                .quarantine(&rec, DeadLetterReason::OutOfOrder, "customers")
                .await,
            QuarantineOutcome::Duplicate
        );
        // A different failure of the same record is its own entry.
        assert_eq!(
            tracker
                .quarantine(
                    &rec,
                    DeadLetterReason::InvariantViolation("race".into()),
                    "customers"
                )
                .await,
            QuarantineOutcome::Recorded
        );
        let all = tracker.list(&DeadLetterQuery::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn list_filters_by_source() {
        let tracker = DeadLetterTracker::new(Arc::new(MemoryWarehouse::new()));
        tracker
            .quarantine(&record("C001"), DeadLetterReason::OutOfOrder, "customers")
            .await;
        tracker
            .quarantine(&record("T1"), DeadLetterReason::MissingNaturalKey, "transactions")
            .await;

        let query = DeadLetterQuery {
            source: Some("transactions".into()),
            ..DeadLetterQuery::default()
        };
        let entries = tracker.list(&query).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].natural_key, "T1");
    }
}

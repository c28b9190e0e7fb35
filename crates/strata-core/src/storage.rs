//! Storage collaborator contract.
//!
//! The engine talks to the warehouse through capability-split traits. Components
//! receive only what they need:
//!
//! | Trait | Operations | Who Gets It |
//! |-------|------------|-------------|
//! | [`DimensionReadStore`] | current/all versions, listings, surrogate keys | Applier, Resolver |
//! | [`FactReadStore`] | fact lookups and listings | Fact merger, reporting |
//! | [`TransactionalStore`] | all-or-nothing [`WriteBatch`] commits | Applier, Fact merger |
//! | [`AuditStore`] | freshness, dead letters, watermarks | Trackers, engine |
//!
//! [`WarehouseStore`] bundles all four and is blanket-implemented.
//!
//! # Transactions
//!
//! A [`WriteBatch`] is applied atomically: either every op commits or none does.
//! Preconditions that are not met produce `Ok(CommitResult::PreconditionFailed)`;
//! that is a normal outcome, not an error. Errors are reserved for storage
//! failures (`Error::Storage` transient, `Error::Unavailable` outage).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::audit::{DeadLetterEntry, DeadLetterQuery, FreshnessState};
use crate::dimension::DimensionVersion;
use crate::error::Result;
use crate::fact::FactRecord;
use crate::id::SurrogateKey;

/// One mutation inside a transactional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Close the current version of a key.
    ///
    /// Precondition: the version exists and is current.
    CloseVersion {
        /// Dimension source.
        source: String,
        /// Natural key.
        natural_key: String,
        /// The version expected to be current.
        surrogate_key: SurrogateKey,
        /// Exclusive end of validity to set.
        valid_to: DateTime<Utc>,
    },
    /// Insert a new version.
    ///
    /// Precondition: when the version is current, no other current version
    /// exists for the key once earlier ops of the batch are applied.
    InsertVersion(DimensionVersion),
    /// Insert or overwrite a fact row.
    ///
    /// Precondition: the stored row's load timestamp equals
    /// `expected_load_timestamp` (`None` means the row must not exist).
    UpsertFact {
        /// New row contents.
        fact: FactRecord,
        /// Load timestamp observed when the merge decision was made.
        expected_load_timestamp: Option<DateTime<Utc>>,
    },
    /// Replace the whole history of a key. Used only by full-refresh correction.
    ReplaceHistory {
        /// Dimension source.
        source: String,
        /// Natural key.
        natural_key: String,
        /// Complete replacement history.
        versions: Vec<DimensionVersion>,
    },
}

/// Ordered set of ops committed all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an op.
    #[must_use]
    pub fn with(mut self, op: WriteOp) -> Self {
        self.ops.push(op);
        self
    }

    /// Appends an op in place.
    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    /// Returns the ops in order.
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Returns true when the batch holds no ops.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Result of a transactional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    /// Every op was applied.
    Committed,
    /// A precondition did not hold; nothing was applied.
    PreconditionFailed {
        /// Which precondition failed.
        reason: String,
    },
}

impl CommitResult {
    /// Returns true when the batch committed.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// Read access to dimension history.
#[async_trait]
pub trait DimensionReadStore: Send + Sync {
    /// Returns the current version of a key, if any.
    async fn get_current_version(
        &self,
        source: &str,
        natural_key: &str,
    ) -> Result<Option<DimensionVersion>>;

    /// Returns every version of a key in history order
    /// (see [`DimensionVersion::history_order`]).
    async fn get_all_versions(&self, source: &str, natural_key: &str)
    -> Result<Vec<DimensionVersion>>;

    /// Returns all current versions of a source, ordered by natural key.
    async fn list_current_versions(&self, source: &str) -> Result<Vec<DimensionVersion>>;

    /// Returns the full history of a source, ordered by natural key then `valid_from`.
    async fn list_history(&self, source: &str) -> Result<Vec<DimensionVersion>>;

    /// Allocates the next surrogate key. Keys are unique and increasing.
    async fn allocate_surrogate_key(&self) -> Result<SurrogateKey>;
}

/// Read access to fact rows.
#[async_trait]
pub trait FactReadStore: Send + Sync {
    /// Returns the stored fact for a key, if any.
    async fn get_fact(&self, source: &str, natural_key: &str) -> Result<Option<FactRecord>>;

    /// Returns all facts of a source ordered by natural key.
    async fn list_facts(&self, source: &str) -> Result<Vec<FactRecord>>;
}

/// All-or-nothing writes of history and fact rows.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    /// Applies every op in the batch or none of them.
    async fn transactional_write(&self, batch: WriteBatch) -> Result<CommitResult>;
}

/// Freshness, dead-letter and watermark bookkeeping.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Records a load. The stored load timestamp never moves backwards;
    /// `observed_at` is updated whenever the load timestamp advances.
    async fn record_freshness(&self, state: FreshnessState) -> Result<()>;

    /// Returns the freshness state of a source.
    async fn get_freshness(&self, source: &str) -> Result<Option<FreshnessState>>;

    /// Returns the freshness state of every source seen so far.
    async fn list_freshness(&self) -> Result<Vec<FreshnessState>>;

    /// Appends a dead-letter entry.
    ///
    /// Returns `false` when an entry for the same failure of the same record
    /// already exists; the existing entry (and its first-failure time) is kept.
    async fn append_dead_letter(&self, entry: DeadLetterEntry) -> Result<bool>;

    /// Lists dead-letter entries matching the query, oldest first.
    async fn list_dead_letters(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetterEntry>>;

    /// Returns the highest load timestamp fully processed for a source.
    async fn get_watermark(&self, source: &str) -> Result<Option<DateTime<Utc>>>;

    /// Raises the watermark; lower values are ignored.
    async fn advance_watermark(&self, source: &str, watermark: DateTime<Utc>) -> Result<()>;
}

/// The full warehouse capability set.
pub trait WarehouseStore: DimensionReadStore + FactReadStore + TransactionalStore + AuditStore {}

impl<T> WarehouseStore for T where
    T: DimensionReadStore + FactReadStore + TransactionalStore + AuditStore
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_result_is_committed() {
        assert!(CommitResult::Committed.is_committed());
        assert!(
            !CommitResult::PreconditionFailed {
                reason: "stale".into()
            }
            .is_committed()
        );
    }

    #[test]
    fn write_batch_preserves_order() {
        let batch = WriteBatch::new()
            .with(WriteOp::CloseVersion {
                source: "customers".into(),
                natural_key: "C001".into(),
                surrogate_key: SurrogateKey::new(1),
                valid_to: Utc::now(),
            })
            .with(WriteOp::ReplaceHistory {
                source: "customers".into(),
                natural_key: "C001".into(),
                versions: Vec::new(),
            });
        assert_eq!(batch.ops().len(), 2);
        assert!(matches!(batch.ops()[0], WriteOp::CloseVersion { .. }));
    }
}

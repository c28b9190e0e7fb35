//! # strata-merge
//!
//! The merge engine for strata: turns batches of change records into SCD2
//! dimension history and upserted fact rows.
//!
//! This crate provides:
//!
//! - **Change Classification**: insert / SCD2 update / no change / late arrival
//! - **SCD2 Application**: atomic close-then-open history writes
//! - **Fact Merge**: compare-and-set upserts keyed by natural key
//! - **Point-in-Time Resolution**: the dimension version valid at an instant
//! - **Run Orchestration**: per-key ordered, cross-key concurrent merge runs
//!   with bounded retry, dead-lettering and freshness tracking
//!
//! ## Guarantees
//!
//! - **Contiguous**: a key's versions never overlap and leave no gaps
//! - **Idempotent**: replaying a batch creates no new versions
//! - **Isolated**: a bad record is quarantined; it never fails its batch
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use strata_core::{EngineConfig, MemoryWarehouse, SourceConfig};
//! use strata_merge::{CancelFlag, MergeEngine};
//!
//! # async fn example() -> strata_merge::Result<()> {
//! let config = EngineConfig::default()
//!     .with_source(SourceConfig::dimension("customers", ["segment"]));
//! let engine = MergeEngine::new(Arc::new(MemoryWarehouse::new()), config)?;
//!
//! let summary = engine
//!     .run_incremental("customers", Vec::new(), &CancelFlag::new())
//!     .await?;
//! assert!(summary.is_success());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod classifier;
pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod fact_merge;
pub mod freshness;
pub mod key_lock;
pub mod metrics;
pub mod notify;
pub mod resolver;
pub mod retry;
pub mod scd2;
pub mod summary;

pub use classifier::{ChangeDecision, classify};
pub use dead_letter::{DeadLetterTracker, QuarantineOutcome};
pub use engine::{CancelFlag, FullRefreshOptions, MergeEngine};
pub use error::{MergeError, Result};
pub use fact_merge::{FactMergeOutcome, FactMerger};
pub use freshness::{FreshnessStatus, FreshnessTracker, Health};
pub use notify::{LogNotifier, RunNotifier};
pub use resolver::{PointInTimeResolver, Resolution};
pub use retry::{RetryPolicy, with_retry};
pub use scd2::{ApplyOutcome, RebuiltHistory, Scd2Applier};
pub use summary::{MergeCounts, RunMode, RunSummary};

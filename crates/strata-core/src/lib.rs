//! # strata-core
//!
//! Core abstractions for the strata CDC / SCD2 merge engine.
//!
//! This crate provides the foundational types and traits shared by the engine,
//! the CLI and the test utilities:
//!
//! - **Records**: [`BatchIngestRecord`] and type-aware [`AttributeValue`]s
//! - **Warehouse rows**: [`DimensionVersion`], [`FactRecord`], freshness and dead letters
//! - **Storage Traits**: capability-split warehouse collaborator interfaces
//! - **Memory Warehouse**: an in-memory backend with JSON snapshot persistence
//! - **Configuration**: [`EngineConfig`] with YAML loading and env overrides
//! - **Error Types**: shared error definitions and result types
//!
//! ## Example
//!
//! ```rust
//! use strata_core::prelude::*;
//!
//! let batch = BatchId::generate();
//! let config = EngineConfig::default()
//!     .with_source(SourceConfig::dimension("customers", ["segment"]));
//! assert!(config.validate().is_ok());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod audit;
pub mod config;
pub mod dimension;
pub mod error;
pub mod fact;
pub mod fingerprint;
pub mod id;
pub mod memory;
pub mod observability;
pub mod record;
pub mod storage;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use strata_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::audit::{DeadLetterEntry, DeadLetterQuery, DeadLetterReason, FreshnessState};
    pub use crate::config::{EngineConfig, FreshnessThresholds, RetryConfig, SourceConfig, SourceKind};
    pub use crate::dimension::DimensionVersion;
    pub use crate::error::{Error, Result};
    pub use crate::fact::FactRecord;
    pub use crate::fingerprint::RecordFingerprint;
    pub use crate::id::{BatchId, RunId, SurrogateKey};
    pub use crate::memory::MemoryWarehouse;
    pub use crate::record::{AttributeValue, Attributes, BatchIngestRecord};
    pub use crate::storage::{
        AuditStore, CommitResult, DimensionReadStore, FactReadStore, TransactionalStore,
        WarehouseStore, WriteBatch, WriteOp,
    };
}

// Re-export key types at crate root for ergonomics
pub use audit::{DeadLetterEntry, DeadLetterQuery, DeadLetterReason, FreshnessState};
pub use config::{EngineConfig, FreshnessThresholds, RetryConfig, SourceConfig, SourceKind};
pub use dimension::DimensionVersion;
pub use error::{Error, Result};
pub use fact::FactRecord;
pub use fingerprint::RecordFingerprint;
pub use id::{BatchId, RunId, SurrogateKey};
pub use memory::{MemoryWarehouse, WarehouseSnapshot};
pub use observability::{LogFormat, init_logging};
pub use record::{AttributeValue, Attributes, BatchIngestRecord};
pub use storage::{
    AuditStore, CommitResult, DimensionReadStore, FactReadStore, TransactionalStore,
    WarehouseStore, WriteBatch, WriteOp,
};

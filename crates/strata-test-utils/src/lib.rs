//! Shared test utilities for strata tests.
//!
//! This crate provides:
//! - [`FailingWarehouse`]: an in-memory warehouse with injectable faults
//! - [`RecordBuilder`] and config helpers for creating test data
//! - Custom assertion helpers over stored history
//!
//! # Example
//!
//! ```rust,ignore
//! use strata_test_utils::{RecordBuilder, ts};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let record = RecordBuilder::new("customers", "C001")
//!         .attr("segment", "starter")
//!         .at(ts(2024, 1, 1))
//!         .build();
//!     // ... run test ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod storage;

pub use assertions::*;
pub use fixtures::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("strata=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}

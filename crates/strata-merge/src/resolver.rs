//! Point-in-time resolution of dimension versions.
//!
//! Joining a fact to the *current* dimension row attaches today's attributes
//! to yesterday's events. The resolver instead returns the version whose
//! validity interval contains the fact's event time, or reports the dimension
//! as unknown when the event predates all history.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use strata_core::{DimensionVersion, FactRecord, WarehouseStore};

use crate::error::Result;

/// Returns the version valid at `as_of`, if any.
///
/// Intervals are half-open, so at a change instant the newer version wins.
#[must_use]
pub fn resolve_in_history(
    versions: &[DimensionVersion],
    as_of: DateTime<Utc>,
) -> Option<&DimensionVersion> {
    versions.iter().find(|v| v.covers(as_of))
}

/// Resolution of one dimension reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "version", rename_all = "snake_case")]
pub enum Resolution {
    /// The version valid at the event time.
    Known(DimensionVersion),
    /// No version was valid at the event time (or the fact has no key for it).
    Unknown,
}

impl Resolution {
    /// Returns the resolved version, if known.
    #[must_use]
    pub const fn version(&self) -> Option<&DimensionVersion> {
        match self {
            Self::Known(v) => Some(v),
            Self::Unknown => None,
        }
    }
}

/// Storage-backed resolver.
#[derive(Clone)]
pub struct PointInTimeResolver {
    store: Arc<dyn WarehouseStore>,
}

impl std::fmt::Debug for PointInTimeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointInTimeResolver").finish_non_exhaustive()
    }
}

impl PointInTimeResolver {
    /// Creates a resolver over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn WarehouseStore>) -> Self {
        Self { store }
    }

    /// Resolves the version of `natural_key` valid at `as_of`.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn resolve(
        &self,
        source: &str,
        natural_key: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<DimensionVersion>> {
        let versions = self.store.get_all_versions(source, natural_key).await?;
        Ok(resolve_in_history(&versions, as_of).cloned())
    }

    /// Resolves every dimension reference of a fact at its event time.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn resolve_fact(&self, fact: &FactRecord) -> Result<BTreeMap<String, Resolution>> {
        let mut resolved = BTreeMap::new();
        for (dimension, natural_key) in &fact.dimension_keys {
            let resolution = match self
                .resolve(dimension, natural_key, fact.event_timestamp)
                .await?
            {
                Some(version) => Resolution::Known(version),
                None => Resolution::Unknown,
            };
            resolved.insert(dimension.clone(), resolution);
        }
        Ok(resolved)
    }
}

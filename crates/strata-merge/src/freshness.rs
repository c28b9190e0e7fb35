//! Source freshness tracking.
//!
//! Writes are a single monotone upsert per batch. Reads compute a tri-state
//! health from the lag between `now` and the last load timestamp:
//!
//! | Health | Lag |
//! |--------|-----|
//! | Ok | `lag < warn_after` |
//! | Warn | `warn_after <= lag < error_after` |
//! | Error | `lag >= error_after`, or the source was never loaded |

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::{EngineConfig, FreshnessState, WarehouseStore};

use crate::error::Result;
use crate::metrics;

/// Tri-state source health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Within the warn threshold.
    Ok,
    /// Past the warn threshold.
    Warn,
    /// Past the error threshold, or never loaded.
    Error,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

/// Freshness of one source at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessStatus {
    /// Source name.
    pub source: String,
    /// Computed health.
    pub health: Health,
    /// Lag behind `now`; `None` when never loaded.
    #[serde(with = "lag_secs")]
    pub lag: Option<Duration>,
    /// Last load timestamp, if any.
    pub last_load_timestamp: Option<DateTime<Utc>>,
}

mod lag_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(lag: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match lag {
            Some(lag) => s.serialize_some(&lag.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// Records batch loads and reports per-source health.
#[derive(Clone)]
pub struct FreshnessTracker {
    store: Arc<dyn WarehouseStore>,
    config: Arc<EngineConfig>,
}

impl fmt::Debug for FreshnessTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreshnessTracker").finish_non_exhaustive()
    }
}

impl FreshnessTracker {
    /// Creates a tracker.
    #[must_use]
    pub fn new(store: Arc<dyn WarehouseStore>, config: Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    /// Records that a batch with the given load timestamp was merged.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn record_batch_loaded(
        &self,
        source: &str,
        load_timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.store
            .record_freshness(FreshnessState {
                source: source.to_string(),
                last_load_timestamp: load_timestamp,
                observed_at: Utc::now(),
            })
            .await?;
        tracing::debug!(source, %load_timestamp, "freshness recorded");
        Ok(())
    }

    /// Health of a source now.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn status(&self, source: &str) -> Result<FreshnessStatus> {
        self.status_at(source, Utc::now()).await
    }

    /// Health of a source at `now`.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn status_at(&self, source: &str, now: DateTime<Utc>) -> Result<FreshnessStatus> {
        let state = self.store.get_freshness(source).await?;
        Ok(self.evaluate(source, state.as_ref(), now))
    }

    /// Health of every configured source, plus any other source with recorded loads.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn status_all(&self) -> Result<Vec<FreshnessStatus>> {
        self.status_all_at(Utc::now()).await
    }

    /// [`Self::status_all`] evaluated at `now`.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn status_all_at(&self, now: DateTime<Utc>) -> Result<Vec<FreshnessStatus>> {
        let states = self.store.list_freshness().await?;
        let mut names: Vec<&str> = self.config.sources.iter().map(|s| s.name.as_str()).collect();
        for state in &states {
            if !names.contains(&state.source.as_str()) {
                names.push(&state.source);
            }
        }
        names.sort_unstable();
        Ok(names
            .into_iter()
            .map(|name| {
                let state = states.iter().find(|s| s.source == name);
                self.evaluate(name, state, now)
            })
            .collect())
    }

    fn evaluate(
        &self,
        source: &str,
        state: Option<&FreshnessState>,
        now: DateTime<Utc>,
    ) -> FreshnessStatus {
        let Some(state) = state else {
            return FreshnessStatus {
                source: source.to_string(),
                health: Health::Error,
                lag: None,
                last_load_timestamp: None,
            };
        };

        let lag = (now - state.last_load_timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let thresholds = self.config.freshness_for(source);
        let health = if lag >= thresholds.error_after() {
            Health::Error
        } else if lag >= thresholds.warn_after() {
            Health::Warn
        } else {
            Health::Ok
        };
        metrics::set_freshness_lag(source, lag.as_secs_f64());

        FreshnessStatus {
            source: source.to_string(),
            health,
            lag: Some(lag),
            last_load_timestamp: Some(state.last_load_timestamp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use strata_core::{FreshnessThresholds, MemoryWarehouse, SourceConfig};

    fn tracker() -> FreshnessTracker {
        let mut orders = SourceConfig::dimension("orders", ["status"]);
        orders.freshness = Some(FreshnessThresholds {
            warn_after_secs: 60,
            error_after_secs: 120,
        });
        let config = EngineConfig::default()
            .with_source(SourceConfig::dimension("customers", ["segment"]))
            .with_source(orders);
        FreshnessTracker::new(Arc::new(MemoryWarehouse::new()), Arc::new(config))
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn never_loaded_is_error() {
        let status = tracker().status_at("customers", at(0, 0)).await.unwrap();
        assert_eq!(status.health, Health::Error);
        assert_eq!(status.lag, None);
    }

    #[tokio::test]
    async fn health_follows_thresholds() {
        let tracker = tracker();
        tracker.record_batch_loaded("customers", at(0, 0)).await.unwrap();

        assert_eq!(
            tracker.status_at("customers", at(0, 30)).await.unwrap().health,
            Health::Ok
        );
        assert_eq!(
            tracker.status_at("customers", at(1, 0)).await.unwrap().health,
            Health::Warn
        );
        let late = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap();
        assert_eq!(
            tracker.status_at("customers", late).await.unwrap().health,
            Health::Error
        );
    }

    #[tokio::test]
    async fn per_source_thresholds_override_defaults() {
        let tracker = tracker();
        tracker.record_batch_loaded("orders", at(0, 0)).await.unwrap();
        let status = tracker.status_at("orders", at(0, 1)).await.unwrap();
        assert_eq!(status.health, Health::Warn);
        assert_eq!(status.lag, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn older_load_does_not_move_freshness_back() {
        let tracker = tracker();
        tracker.record_batch_loaded("customers", at(5, 0)).await.unwrap();
        tracker.record_batch_loaded("customers", at(1, 0)).await.unwrap();
        let status = tracker.status_at("customers", at(5, 10)).await.unwrap();
        assert_eq!(status.last_load_timestamp, Some(at(5, 0)));
    }

    #[tokio::test]
    async fn status_all_lists_configured_sources() {
        let tracker = tracker();
        tracker.record_batch_loaded("customers", at(0, 0)).await.unwrap();
        let all = tracker.status_all_at(at(0, 5)).await.unwrap();
        let summary: Vec<_> = all.iter().map(|s| (s.source.as_str(), s.health)).collect();
        assert_eq!(summary, [("customers", Health::Ok), ("orders", Health::Error)]);
    }
}

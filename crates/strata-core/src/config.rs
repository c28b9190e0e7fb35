//! Engine configuration.
//!
//! Loaded from YAML, then optionally overridden from the environment:
//!
//! ```yaml
//! max_concurrency: 8
//! retry:
//!   max_attempts: 3
//!   base_backoff_ms: 50
//!   max_backoff_ms: 500
//! freshness:
//!   warn_after_secs: 3600
//!   error_after_secs: 86400
//! sources:
//!   - name: customers
//!     kind:
//!       type: dimension
//!       tracked_attributes: [segment, region]
//!   - name: transactions
//!     freshness:
//!       warn_after_secs: 600
//!       error_after_secs: 7200
//!     kind:
//!       type: fact
//!       event_time_attribute: event_time
//!       dimension_refs:
//!         customers: customer_id
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const ENV_MAX_CONCURRENCY: &str = "STRATA_MAX_CONCURRENCY";
const ENV_RETRY_MAX_ATTEMPTS: &str = "STRATA_RETRY_MAX_ATTEMPTS";
const ENV_FRESHNESS_WARN_SECS: &str = "STRATA_FRESHNESS_WARN_SECS";
const ENV_FRESHNESS_ERROR_SECS: &str = "STRATA_FRESHNESS_ERROR_SECS";

/// Bounded retry settings for warehouse writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_backoff_ms: u64,
    /// Upper bound on any single delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 50,
            max_backoff_ms: 500,
        }
    }
}

impl RetryConfig {
    /// Base backoff as a duration.
    #[must_use]
    pub const fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    /// Backoff cap as a duration.
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Lag thresholds for freshness health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessThresholds {
    /// Lag above which a source is reported as `warn`.
    pub warn_after_secs: u64,
    /// Lag above which a source is reported as `error`.
    pub error_after_secs: u64,
}

impl Default for FreshnessThresholds {
    fn default() -> Self {
        Self {
            warn_after_secs: 3600,
            error_after_secs: 86_400,
        }
    }
}

impl FreshnessThresholds {
    /// Warn threshold as a duration.
    #[must_use]
    pub const fn warn_after(&self) -> Duration {
        Duration::from_secs(self.warn_after_secs)
    }

    /// Error threshold as a duration.
    #[must_use]
    pub const fn error_after(&self) -> Duration {
        Duration::from_secs(self.error_after_secs)
    }

    fn validate(&self, scope: &str) -> Result<()> {
        if self.warn_after_secs >= self.error_after_secs {
            return Err(Error::configuration(format!(
                "{scope}: warn_after_secs ({}) must be below error_after_secs ({})",
                self.warn_after_secs, self.error_after_secs
            )));
        }
        Ok(())
    }
}

/// What a source feeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    /// A slowly changing dimension kept as SCD2 history.
    Dimension {
        /// Attributes whose change opens a new version.
        tracked_attributes: Vec<String>,
    },
    /// A fact table upserted by natural key.
    Fact {
        /// Attribute holding the business event time.
        event_time_attribute: String,
        /// Dimension source name -> attribute holding that dimension's natural key.
        #[serde(default)]
        dimension_refs: BTreeMap<String, String>,
    },
}

/// One configured source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source name as carried on every record.
    pub name: String,
    /// Per-source freshness thresholds; falls back to the engine default.
    #[serde(default)]
    pub freshness: Option<FreshnessThresholds>,
    /// Dimension or fact.
    pub kind: SourceKind,
}

impl SourceConfig {
    /// Convenience constructor for a dimension source.
    #[must_use]
    pub fn dimension<I, S>(name: impl Into<String>, tracked: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            freshness: None,
            kind: SourceKind::Dimension {
                tracked_attributes: tracked.into_iter().map(Into::into).collect(),
            },
        }
    }

    /// Convenience constructor for a fact source.
    #[must_use]
    pub fn fact(
        name: impl Into<String>,
        event_time_attribute: impl Into<String>,
        dimension_refs: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            freshness: None,
            kind: SourceKind::Fact {
                event_time_attribute: event_time_attribute.into(),
                dimension_refs,
            },
        }
    }

    /// Returns the tracked attributes of a dimension source.
    #[must_use]
    pub fn tracked_attributes(&self) -> Option<&[String]> {
        match &self.kind {
            SourceKind::Dimension { tracked_attributes } => Some(tracked_attributes),
            SourceKind::Fact { .. } => None,
        }
    }

    /// Returns true for dimension sources.
    #[must_use]
    pub const fn is_dimension(&self) -> bool {
        matches!(self.kind, SourceKind::Dimension { .. })
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on natural keys merged concurrently within a run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Retry policy for warehouse writes.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Default freshness thresholds.
    #[serde(default)]
    pub freshness: FreshnessThresholds,
    /// Configured sources.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

const fn default_max_concurrency() -> usize {
    8
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            retry: RetryConfig::default(),
            freshness: FreshnessThresholds::default(),
            sources: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a YAML document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` when the YAML is malformed or invalid.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::configuration(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a YAML file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` when the file cannot be read or is invalid.
    pub fn from_path(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Adds a source.
    #[must_use]
    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.sources.push(source);
        self
    }

    /// Looks up a source by name.
    #[must_use]
    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Effective freshness thresholds of a source.
    #[must_use]
    pub fn freshness_for(&self, source: &str) -> FreshnessThresholds {
        self.source(source)
            .and_then(|s| s.freshness)
            .unwrap_or(self.freshness)
    }

    /// Applies `STRATA_*` overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but not a valid number, or the
    /// resulting config fails validation.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Applies `STRATA_*` overrides from an arbitrary lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but not a valid number, or the
    /// resulting config fails validation.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var::<usize, _>(&lookup, ENV_MAX_CONCURRENCY)? {
            self.max_concurrency = v;
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, ENV_RETRY_MAX_ATTEMPTS)? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, ENV_FRESHNESS_WARN_SECS)? {
            self.freshness.warn_after_secs = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, ENV_FRESHNESS_ERROR_SECS)? {
            self.freshness.error_after_secs = v;
        }
        self.validate()
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::configuration("max_concurrency must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::configuration("retry.max_attempts must be at least 1"));
        }
        self.freshness.validate("freshness")?;

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(Error::configuration("source name must not be empty"));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(Error::configuration(format!(
                    "source '{}' is configured twice",
                    source.name
                )));
            }
            if let Some(thresholds) = &source.freshness {
                thresholds.validate(&format!("source '{}'", source.name))?;
            }
            match &source.kind {
                SourceKind::Dimension { tracked_attributes } => {
                    if tracked_attributes.is_empty() {
                        return Err(Error::configuration(format!(
                            "dimension source '{}' must track at least one attribute",
                            source.name
                        )));
                    }
                }
                SourceKind::Fact {
                    event_time_attribute,
                    dimension_refs,
                } => {
                    if event_time_attribute.trim().is_empty() {
                        return Err(Error::configuration(format!(
                            "fact source '{}' needs an event_time_attribute",
                            source.name
                        )));
                    }
                    for dimension in dimension_refs.keys() {
                        if !self.source(dimension).is_some_and(SourceConfig::is_dimension) {
                            return Err(Error::configuration(format!(
                                "fact source '{}' references unknown dimension '{dimension}'",
                                source.name
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<T>()
        .map(Some)
        .map_err(|e| Error::configuration(format!("{name} must be a number: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"
max_concurrency: 4
sources:
  - name: customers
    kind:
      type: dimension
      tracked_attributes: [segment]
  - name: transactions
    freshness:
      warn_after_secs: 60
      error_after_secs: 600
    kind:
      type: fact
      event_time_attribute: event_time
      dimension_refs:
        customers: customer_id
";

    #[test]
    fn parses_yaml_with_defaults() {
        let config = EngineConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(
            config.source("customers").unwrap().tracked_attributes(),
            Some(&["segment".to_string()][..])
        );
        assert_eq!(config.freshness_for("transactions").warn_after_secs, 60);
        assert_eq!(config.freshness_for("customers").warn_after_secs, 3600);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = EngineConfig::from_yaml_str(SAMPLE).unwrap();
        config
            .apply_env_with(|name| match name {
                "STRATA_MAX_CONCURRENCY" => Some("2".into()),
                "STRATA_RETRY_MAX_ATTEMPTS" => Some("5".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn env_override_must_be_numeric() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_env_with(|name| (name == "STRATA_MAX_CONCURRENCY").then(|| "many".into()))
            .unwrap_err();
        assert!(err.to_string().contains("STRATA_MAX_CONCURRENCY"));
    }

    #[test]
    fn rejects_unknown_dimension_reference() {
        let config = EngineConfig::default().with_source(SourceConfig::fact(
            "transactions",
            "event_time",
            BTreeMap::from([("accounts".to_string(), "account_id".to_string())]),
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_sources_and_empty_tracking() {
        let dup = EngineConfig::default()
            .with_source(SourceConfig::dimension("customers", ["segment"]))
            .with_source(SourceConfig::dimension("customers", ["region"]));
        assert!(dup.validate().is_err());

        let untracked =
            EngineConfig::default().with_source(SourceConfig::dimension("customers", Vec::<String>::new()));
        assert!(untracked.validate().is_err());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = EngineConfig::default();
        config.freshness = FreshnessThresholds {
            warn_after_secs: 100,
            error_after_secs: 100,
        };
        assert!(matches!(config.validate(), Err(Error::Configuration { .. })));
    }
}

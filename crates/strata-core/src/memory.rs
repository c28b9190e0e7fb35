//! In-memory warehouse backend.
//!
//! [`MemoryWarehouse`] implements every storage capability behind a single
//! `RwLock`, which makes each [`WriteBatch`] trivially atomic. It can be
//! snapshotted to and restored from JSON, which is how the CLI persists state
//! between invocations.
//!
//! ## Limitations
//!
//! - **Single-process only**: no cross-process coordination
//! - **Whole-file persistence**: `save` rewrites the entire snapshot

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{DeadLetterEntry, DeadLetterQuery, FreshnessState};
use crate::dimension::DimensionVersion;
use crate::error::{Error, Result};
use crate::fact::FactRecord;
use crate::id::SurrogateKey;
use crate::storage::{
    AuditStore, CommitResult, DimensionReadStore, FactReadStore, TransactionalStore, WriteBatch,
    WriteOp,
};

/// Serializable image of the whole warehouse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseSnapshot {
    /// Last surrogate key handed out.
    #[serde(default)]
    pub last_surrogate_key: u64,
    /// Dimension history: source -> natural key -> versions ordered by `valid_from`.
    #[serde(default)]
    pub history: BTreeMap<String, BTreeMap<String, Vec<DimensionVersion>>>,
    /// Facts: source -> natural key -> row.
    #[serde(default)]
    pub facts: BTreeMap<String, BTreeMap<String, FactRecord>>,
    /// Freshness per source.
    #[serde(default)]
    pub freshness: BTreeMap<String, FreshnessState>,
    /// Dead letters in append order.
    #[serde(default)]
    pub dead_letters: Vec<DeadLetterEntry>,
    /// Watermark per source.
    #[serde(default)]
    pub watermarks: BTreeMap<String, DateTime<Utc>>,
}

impl WarehouseSnapshot {
    fn versions(&self, source: &str, natural_key: &str) -> &[DimensionVersion] {
        self.history
            .get(source)
            .and_then(|keys| keys.get(natural_key))
            .map_or(&[], Vec::as_slice)
    }

    fn fact(&self, source: &str, natural_key: &str) -> Option<&FactRecord> {
        self.facts.get(source).and_then(|keys| keys.get(natural_key))
    }
}

/// In-memory warehouse.
///
/// ## Example
///
/// ```rust
/// use strata_core::memory::MemoryWarehouse;
///
/// let warehouse = MemoryWarehouse::new();
/// // Hand `Arc::new(warehouse)` to the merge engine...
/// ```
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: RwLock<WarehouseSnapshot>,
}

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Internal {
        message: "warehouse lock poisoned".into(),
    }
}

impl MemoryWarehouse {
    /// Creates an empty warehouse.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a warehouse from a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: WarehouseSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
        }
    }

    /// Returns a copy of the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn snapshot(&self) -> Result<WarehouseSnapshot> {
        Ok(self.state.read().map_err(poison_err)?.clone())
    }

    /// Loads a snapshot file, or starts empty when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = fs::read(path).map_err(|e| {
            Error::storage_with_source(format!("read snapshot {}", path.display()), e)
        })?;
        let snapshot: WarehouseSnapshot = serde_json::from_slice(&bytes)?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Writes the snapshot to `path` via a temporary file and rename.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any filesystem step fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot()?;
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|e| {
            Error::storage_with_source(format!("write snapshot {}", tmp.display()), e)
        })?;
        fs::rename(&tmp, path).map_err(|e| {
            Error::storage_with_source(format!("publish snapshot {}", path.display()), e)
        })
    }
}

type KeyRef = (String, String);

/// Applies a batch against staged copies; only publishes when every op passes.
fn apply_batch(state: &mut WarehouseSnapshot, batch: &WriteBatch) -> CommitResult {
    let mut staged_history: BTreeMap<KeyRef, Vec<DimensionVersion>> = BTreeMap::new();
    let mut staged_facts: BTreeMap<KeyRef, Option<FactRecord>> = BTreeMap::new();

    for op in batch.ops() {
        let outcome = match op {
            WriteOp::CloseVersion {
                source,
                natural_key,
                surrogate_key,
                valid_to,
            } => {
                let versions = staged_history
                    .entry((source.clone(), natural_key.clone()))
                    .or_insert_with(|| state.versions(source, natural_key).to_vec());
                close_version(versions, *surrogate_key, *valid_to)
            }
            WriteOp::InsertVersion(version) => {
                let versions = staged_history
                    .entry((version.source.clone(), version.natural_key.clone()))
                    .or_insert_with(|| {
                        state
                            .versions(&version.source, &version.natural_key)
                            .to_vec()
                    });
                insert_version(versions, version)
            }
            WriteOp::UpsertFact {
                fact,
                expected_load_timestamp,
            } => {
                let stored = staged_facts
                    .entry((fact.source.clone(), fact.natural_key.clone()))
                    .or_insert_with(|| state.fact(&fact.source, &fact.natural_key).cloned());
                let actual = stored.as_ref().map(|f| f.load_timestamp);
                if actual == *expected_load_timestamp {
                    *stored = Some(fact.clone());
                    Ok(())
                } else {
                    Err(format!(
                        "fact {}/{} load timestamp is {actual:?}, expected {expected_load_timestamp:?}",
                        fact.source, fact.natural_key
                    ))
                }
            }
            WriteOp::ReplaceHistory {
                source,
                natural_key,
                versions,
            } => {
                if versions.iter().filter(|v| v.is_current).count() > 1 {
                    Err(format!(
                        "replacement history for {source}/{natural_key} has several current versions"
                    ))
                } else {
                    let mut sorted = versions.clone();
                    sorted.sort_by_key(DimensionVersion::history_order);
                    staged_history.insert((source.clone(), natural_key.clone()), sorted);
                    Ok(())
                }
            }
        };

        if let Err(reason) = outcome {
            return CommitResult::PreconditionFailed { reason };
        }
    }

    for ((source, natural_key), versions) in staged_history {
        let keys = state.history.entry(source).or_default();
        if versions.is_empty() {
            keys.remove(&natural_key);
        } else {
            keys.insert(natural_key, versions);
        }
    }
    for ((source, natural_key), fact) in staged_facts {
        if let Some(fact) = fact {
            state.facts.entry(source).or_default().insert(natural_key, fact);
        }
    }
    CommitResult::Committed
}

fn close_version(
    versions: &mut [DimensionVersion],
    surrogate_key: SurrogateKey,
    valid_to: DateTime<Utc>,
) -> std::result::Result<(), String> {
    let Some(version) = versions
        .iter_mut()
        .find(|v| v.surrogate_key == surrogate_key)
    else {
        return Err(format!("version {surrogate_key} does not exist"));
    };
    if !version.is_current {
        return Err(format!("version {surrogate_key} is not current"));
    }
    if valid_to < version.valid_from {
        return Err(format!(
            "closing {surrogate_key} at {valid_to} precedes its valid_from {}",
            version.valid_from
        ));
    }
    version.valid_to = Some(valid_to);
    version.is_current = false;
    Ok(())
}

fn insert_version(
    versions: &mut Vec<DimensionVersion>,
    version: &DimensionVersion,
) -> std::result::Result<(), String> {
    if versions
        .iter()
        .any(|v| v.surrogate_key == version.surrogate_key)
    {
        return Err(format!("version {} already exists", version.surrogate_key));
    }
    if version.is_current && versions.iter().any(|v| v.is_current) {
        return Err(format!(
            "{}/{} already has a current version",
            version.source, version.natural_key
        ));
    }
    versions.push(version.clone());
    versions.sort_by_key(DimensionVersion::history_order);
    Ok(())
}

#[async_trait]
impl DimensionReadStore for MemoryWarehouse {
    async fn get_current_version(
        &self,
        source: &str,
        natural_key: &str,
    ) -> Result<Option<DimensionVersion>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .versions(source, natural_key)
            .iter()
            .find(|v| v.is_current)
            .cloned())
    }

    async fn get_all_versions(
        &self,
        source: &str,
        natural_key: &str,
    ) -> Result<Vec<DimensionVersion>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.versions(source, natural_key).to_vec())
    }

    async fn list_current_versions(&self, source: &str) -> Result<Vec<DimensionVersion>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .history
            .get(source)
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter_map(|versions| versions.iter().find(|v| v.is_current).cloned())
            .collect())
    }

    async fn list_history(&self, source: &str) -> Result<Vec<DimensionVersion>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .history
            .get(source)
            .into_iter()
            .flat_map(BTreeMap::values)
            .flatten()
            .cloned()
            .collect())
    }

    async fn allocate_surrogate_key(&self) -> Result<SurrogateKey> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.last_surrogate_key += 1;
        Ok(SurrogateKey::new(state.last_surrogate_key))
    }
}

#[async_trait]
impl FactReadStore for MemoryWarehouse {
    async fn get_fact(&self, source: &str, natural_key: &str) -> Result<Option<FactRecord>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.fact(source, natural_key).cloned())
    }

    async fn list_facts(&self, source: &str) -> Result<Vec<FactRecord>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .facts
            .get(source)
            .into_iter()
            .flat_map(BTreeMap::values)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TransactionalStore for MemoryWarehouse {
    async fn transactional_write(&self, batch: WriteBatch) -> Result<CommitResult> {
        let mut state = self.state.write().map_err(poison_err)?;
        Ok(apply_batch(&mut state, &batch))
    }
}

#[async_trait]
impl AuditStore for MemoryWarehouse {
    async fn record_freshness(&self, update: FreshnessState) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        match state.freshness.get(&update.source) {
            Some(existing) if existing.last_load_timestamp >= update.last_load_timestamp => {}
            _ => {
                state.freshness.insert(update.source.clone(), update);
            }
        }
        Ok(())
    }

    async fn get_freshness(&self, source: &str) -> Result<Option<FreshnessState>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.freshness.get(source).cloned())
    }

    async fn list_freshness(&self) -> Result<Vec<FreshnessState>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.freshness.values().cloned().collect())
    }

    async fn append_dead_letter(&self, entry: DeadLetterEntry) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state.dead_letters.iter().any(|e| e.same_failure(&entry)) {
            return Ok(false);
        }
        state.dead_letters.push(entry);
        Ok(true)
    }

    async fn list_dead_letters(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetterEntry>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut entries: Vec<DeadLetterEntry> = state
            .dead_letters
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.first_failed_at);
        Ok(entries)
    }

    async fn get_watermark(&self, source: &str) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.watermarks.get(source).copied())
    }

    async fn advance_watermark(&self, source: &str, watermark: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let slot = state.watermarks.entry(source.to_string()).or_insert(watermark);
        if watermark > *slot {
            *slot = watermark;
        }
        Ok(())
    }
}

//! Test storage with fault injection.
//!
//! [`FailingWarehouse`] wraps a [`MemoryWarehouse`] and can be told to fail
//! operations on particular keys, or everything, to exercise retry,
//! quarantine and outage handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use strata_core::{
    AuditStore, CommitResult, DeadLetterEntry, DeadLetterQuery, DimensionReadStore,
    DimensionVersion, Error, FactReadStore, FactRecord, FreshnessState, MemoryWarehouse,
    Result, SurrogateKey, TransactionalStore, WriteBatch, WriteOp,
};

/// In-memory warehouse with injectable failures.
///
/// Key-scoped faults apply to reads of that key and to write batches touching
/// it. Each injected fault is consumed by one call.
#[derive(Debug, Clone, Default)]
pub struct FailingWarehouse {
    inner: Arc<MemoryWarehouse>,
    transient: Arc<Mutex<HashMap<String, usize>>>,
    preconditions: Arc<Mutex<HashMap<String, usize>>>,
    outage: Arc<AtomicBool>,
    watermark_outage: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
    outage_after: Arc<Mutex<Option<usize>>>,
}

impl FailingWarehouse {
    /// Creates an empty warehouse with no faults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped warehouse, for direct inspection.
    pub fn inner(&self) -> &MemoryWarehouse {
        &self.inner
    }

    /// Fails the next `times` operations touching `natural_key` with a
    /// transient storage error.
    pub fn fail_transiently(&self, natural_key: &str, times: usize) {
        self.transient
            .lock()
            .expect("lock")
            .insert(natural_key.to_string(), times);
    }

    /// Rejects the next `times` write batches touching `natural_key` with a
    /// failed precondition, as if another writer got there first.
    pub fn fail_preconditions(&self, natural_key: &str, times: usize) {
        self.preconditions
            .lock()
            .expect("lock")
            .insert(natural_key.to_string(), times);
    }

    /// Makes every operation fail with an outage error until cleared.
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// Makes only watermark reads and writes fail with an outage error.
    pub fn set_watermark_outage(&self, down: bool) {
        self.watermark_outage.store(down, Ordering::SeqCst);
    }

    /// Starts an outage once `writes` more batches have committed.
    pub fn outage_after_writes(&self, writes: usize) {
        let target = self.committed_writes() + writes;
        *self.outage_after.lock().expect("lock") = Some(target);
    }

    /// Number of write batches that committed.
    pub fn committed_writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_outage(&self) -> Result<()> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(Error::unavailable("injected outage"));
        }
        Ok(())
    }

    fn check_key(&self, natural_key: &str) -> Result<()> {
        self.check_outage()?;
        if take(&self.transient, natural_key) {
            return Err(Error::storage(format!("injected timeout on {natural_key}")));
        }
        Ok(())
    }
}

fn take(faults: &Mutex<HashMap<String, usize>>, natural_key: &str) -> bool {
    let mut faults = faults.lock().expect("lock");
    match faults.get_mut(natural_key) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

fn batch_key(batch: &WriteBatch) -> Option<&str> {
    batch.ops().first().map(|op| match op {
        WriteOp::CloseVersion { natural_key, .. } | WriteOp::ReplaceHistory { natural_key, .. } => {
            natural_key.as_str()
        }
        WriteOp::InsertVersion(version) => version.natural_key.as_str(),
        WriteOp::UpsertFact { fact, .. } => fact.natural_key.as_str(),
    })
}

#[async_trait]
impl DimensionReadStore for FailingWarehouse {
    async fn get_current_version(
        &self,
        source: &str,
        natural_key: &str,
    ) -> Result<Option<DimensionVersion>> {
        self.check_key(natural_key)?;
        self.inner.get_current_version(source, natural_key).await
    }

    async fn get_all_versions(
        &self,
        source: &str,
        natural_key: &str,
    ) -> Result<Vec<DimensionVersion>> {
        self.check_key(natural_key)?;
        self.inner.get_all_versions(source, natural_key).await
    }

    async fn list_current_versions(&self, source: &str) -> Result<Vec<DimensionVersion>> {
        self.check_outage()?;
        self.inner.list_current_versions(source).await
    }

    async fn list_history(&self, source: &str) -> Result<Vec<DimensionVersion>> {
        self.check_outage()?;
        self.inner.list_history(source).await
    }

    async fn allocate_surrogate_key(&self) -> Result<SurrogateKey> {
        self.check_outage()?;
        self.inner.allocate_surrogate_key().await
    }
}

#[async_trait]
impl FactReadStore for FailingWarehouse {
    async fn get_fact(&self, source: &str, natural_key: &str) -> Result<Option<FactRecord>> {
        self.check_key(natural_key)?;
        self.inner.get_fact(source, natural_key).await
    }

    async fn list_facts(&self, source: &str) -> Result<Vec<FactRecord>> {
        self.check_outage()?;
        self.inner.list_facts(source).await
    }
}

#[async_trait]
impl TransactionalStore for FailingWarehouse {
    async fn transactional_write(&self, batch: WriteBatch) -> Result<CommitResult> {
        self.check_outage()?;
        if let Some(natural_key) = batch_key(&batch) {
            self.check_key(natural_key)?;
            if take(&self.preconditions, natural_key) {
                return Ok(CommitResult::PreconditionFailed {
                    reason: format!("injected conflict on {natural_key}"),
                });
            }
        }
        let result = self.inner.transactional_write(batch).await?;
        if result.is_committed() {
            let committed = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
            if self
                .outage_after
                .lock()
                .expect("lock")
                .is_some_and(|target| committed >= target)
            {
                self.set_outage(true);
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl AuditStore for FailingWarehouse {
    async fn record_freshness(&self, state: FreshnessState) -> Result<()> {
        self.check_outage()?;
        self.inner.record_freshness(state).await
    }

    async fn get_freshness(&self, source: &str) -> Result<Option<FreshnessState>> {
        self.check_outage()?;
        self.inner.get_freshness(source).await
    }

    async fn list_freshness(&self) -> Result<Vec<FreshnessState>> {
        self.check_outage()?;
        self.inner.list_freshness().await
    }

    async fn append_dead_letter(&self, entry: DeadLetterEntry) -> Result<bool> {
        self.check_outage()?;
        self.inner.append_dead_letter(entry).await
    }

    async fn list_dead_letters(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetterEntry>> {
        self.check_outage()?;
        self.inner.list_dead_letters(query).await
    }

    async fn get_watermark(&self, source: &str) -> Result<Option<DateTime<Utc>>> {
        self.check_outage()?;
        if self.watermark_outage.load(Ordering::SeqCst) {
            return Err(Error::unavailable("injected watermark outage"));
        }
        self.inner.get_watermark(source).await
    }

    async fn advance_watermark(&self, source: &str, watermark: DateTime<Utc>) -> Result<()> {
        self.check_outage()?;
        if self.watermark_outage.load(Ordering::SeqCst) {
            return Err(Error::unavailable("injected watermark outage"));
        }
        self.inner.advance_watermark(source, watermark).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transient_faults_are_consumed() {
        let store = FailingWarehouse::new();
        store.fail_transiently("C001", 2);
        assert!(store.get_current_version("customers", "C001").await.unwrap_err().is_transient());
        assert!(store.get_current_version("customers", "C001").await.is_err());
        assert!(store.get_current_version("customers", "C001").await.is_ok());
        assert!(store.get_current_version("customers", "C002").await.is_ok());
    }

    #[tokio::test]
    async fn outage_fails_everything() {
        let store = FailingWarehouse::new();
        store.set_outage(true);
        assert!(store.list_freshness().await.unwrap_err().is_outage());
        store.set_outage(false);
        assert!(store.list_freshness().await.is_ok());
    }
}

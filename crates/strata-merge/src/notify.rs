//! Run completion notifications.
//!
//! The engine hands every finished [`RunSummary`] to a [`RunNotifier`]. The
//! default [`LogNotifier`] emits one structured event per run; deployments can
//! plug in their own delivery (chat, paging) behind the same trait.

use async_trait::async_trait;

use crate::summary::RunSummary;

/// Receives finished runs.
#[async_trait]
pub trait RunNotifier: Send + Sync {
    /// Called once per run, after all writes.
    async fn notify(&self, summary: &RunSummary);
}

/// Emits `run_completed` / `run_failed` tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl RunNotifier for LogNotifier {
    async fn notify(&self, summary: &RunSummary) {
        let c = &summary.counts;
        if summary.is_success() {
            tracing::info!(
                event = "run_completed",
                run_id = %summary.run_id,
                source = %summary.source,
                mode = %summary.mode,
                inserted = c.inserted,
                updated = c.updated,
                facts_inserted = c.facts_inserted,
                facts_updated = c.facts_updated,
                quarantined = c.quarantined,
                skipped = c.skipped,
                "merge run completed"
            );
        } else {
            tracing::error!(
                event = "run_failed",
                run_id = %summary.run_id,
                source = %summary.source,
                mode = %summary.mode,
                cancelled = summary.cancelled,
                aborted = summary.aborted.as_deref().unwrap_or(""),
                errors = summary.errors.len(),
                keys_failed = summary.keys_failed,
                keys_pending = summary.keys_pending,
                "merge run failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::RunMode;
    use strata_core::RunId;

    #[tokio::test]
    async fn log_notifier_handles_both_outcomes() {
        let mut summary = RunSummary::start(RunId::generate(), "customers", RunMode::Incremental, false);
        LogNotifier.notify(&summary).await;
        summary.aborted = Some("warehouse down".into());
        LogNotifier.notify(&summary).await;
    }
}

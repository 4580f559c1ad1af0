//! Stuck/failed reconciler.
//!
//! The self-healing sweep. Three independent passes, each over a small
//! capped batch since the reconciler is re-invoked frequently by an external
//! scheduler:
//!
//! 1. stuck sweep - jobs abandoned in `processing` past the staleness
//!    threshold are reset for retry or terminally failed;
//! 2. failed recovery - terminally-recorded failures with retry budget left
//!    get another chance after a cooldown (longer than the stuck threshold,
//!    to avoid thrashing); failed chunks are revived the same way;
//! 3. orphan recovery - documents failed by a timeout before any job was
//!    created are reset to `ingested` so the pipeline re-derives their work.
//!
//! Running the sweep twice with no intervening writes changes nothing: every
//! reset clears the condition that selected the row.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::config::PipelineConfig;
use crate::model::{AuditRecord, DocumentStatus};
use crate::store::DocumentStore;

/// Counts from one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Stale `processing` jobs handled (reset or terminally failed).
    pub stuck_reset: usize,
    /// Failed jobs and chunks given another chance.
    pub failed_recovered: usize,
    /// Orphaned timeout documents reset to `ingested`.
    pub orphans_recovered: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.stuck_reset == 0 && self.failed_recovered == 0 && self.orphans_recovered == 0
    }
}

/// Periodic sweep over stuck, failed, and orphaned work.
pub struct Reconciler {
    store: Arc<dyn DocumentStore>,
    config: PipelineConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DocumentStore>, config: PipelineConfig) -> Self {
        Self { store, config }
    }

    /// Run all three sweeps once.
    pub async fn run(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        report.stuck_reset = self.sweep_stuck().await?;
        report.failed_recovered = self.sweep_failed().await?;
        report.orphans_recovered = self.sweep_orphans().await?;

        if !report.is_empty() {
            tracing::info!(
                stuck_reset = report.stuck_reset,
                failed_recovered = report.failed_recovered,
                orphans_recovered = report.orphans_recovered,
                "Reconciliation pass recovered work"
            );
            self.store
                .append_audit(AuditRecord::new(
                    "reconcile",
                    serde_json::json!({
                        "stuck_reset": report.stuck_reset,
                        "failed_recovered": report.failed_recovered,
                        "orphans_recovered": report.orphans_recovered,
                    }),
                ))
                .await?;
        }

        Ok(report)
    }

    /// Recover jobs whose worker crashed or timed out mid-run without ever
    /// recording completion.
    async fn sweep_stuck(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.config.stuck_after();
        let stale = self
            .store
            .stale_processing_jobs(cutoff, self.config.reconcile_batch_cap)
            .await?;

        let mut handled = 0;
        for job in stale {
            let retries = job.retry_count + 1;
            if retries >= self.config.max_retries {
                let message = format!(
                    "job stalled in processing and exhausted its {} retries",
                    self.config.max_retries
                );
                self.store.fail_job(&job.id, retries, &message).await?;
                self.store.fail_document(&job.document_id, &message).await?;
                tracing::error!(job_id = %job.id, doc_id = %job.document_id, "Stuck job terminally failed");
            } else {
                self.store
                    .requeue_job(&job.id, retries, Some("reclaimed after processing stall"))
                    .await?;
                tracing::warn!(job_id = %job.id, retries, "Stuck job reset to pending");
            }
            handled += 1;
        }
        Ok(handled)
    }

    /// Give transient failures (rate limits, timeouts) another chance after
    /// the cooldown.
    async fn sweep_failed(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.config.failed_cooldown();
        let mut recovered = 0;

        let jobs = self
            .store
            .recoverable_failed_jobs(
                self.config.max_retries,
                cutoff,
                self.config.reconcile_batch_cap,
            )
            .await?;
        for job in jobs {
            // Retry count is preserved: the budget was spent, only the
            // terminal verdict is revisited.
            self.store.requeue_job(&job.id, job.retry_count, None).await?;
            tracing::info!(job_id = %job.id, doc_id = %job.document_id, "Failed job recovered");
            recovered += 1;
        }

        let chunks = self
            .store
            .failed_chunks(cutoff, self.config.reconcile_batch_cap)
            .await?;
        for chunk in chunks {
            // A chunk under a terminally-failed document stays down; its
            // retry ceiling is tracked at the job/document level.
            let doc = self.store.document(&chunk.document_id).await?;
            if doc.is_some_and(|d| d.status == DocumentStatus::Failed) {
                continue;
            }
            if self.store.reset_chunk(&chunk.id).await? {
                tracing::info!(chunk_id = %chunk.id, doc_id = %chunk.document_id, "Failed chunk recovered");
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    /// Documents failed by a timeout before job creation have nothing for
    /// the other sweeps to find; reset them so jobs are re-derived.
    async fn sweep_orphans(&self) -> Result<usize> {
        let orphans = self
            .store
            .orphaned_timeout_documents(self.config.reconcile_batch_cap)
            .await?;

        let mut recovered = 0;
        for doc in orphans {
            self.store
                .reset_document(&doc.id, DocumentStatus::Ingested)
                .await?;
            tracing::info!(doc_id = %doc.id, "Orphaned timeout document reset to ingested");
            recovered += 1;
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Orchestrator;
    use crate::model::{ChunkStatus, Document, JobStage, JobStatus};
    use crate::pipeline::PipelineKind;
    use crate::store::MemoryStore;
    use chrono::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        orchestrator: Orchestrator,
        reconciler: Reconciler,
        config: PipelineConfig,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let config = PipelineConfig::default();
        Fixture {
            orchestrator: Orchestrator::new(store.clone()),
            reconciler: Reconciler::new(store.clone(), config.clone()),
            store,
            config,
        }
    }

    async fn make_doc(f: &Fixture) -> Document {
        f.orchestrator
            .create_document("a.txt", "docs/a", 5, Some(5), PipelineKind::Primary)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn stuck_job_past_threshold_is_reset_with_bumped_retry() {
        let f = fixture();
        let doc = make_doc(&f).await;
        let job = f
            .orchestrator
            .enqueue_job(&doc, 0, JobStage::Extract, "jobs/a", None, None)
            .await
            .unwrap();

        f.store.claim_job(&job.id).await.unwrap();
        // Stuck for 11 minutes against a 10 minute threshold.
        f.store.backdate_job(&job.id, Duration::seconds(660)).await;

        let report = f.reconciler.run().await.unwrap();
        assert_eq!(report.stuck_reset, 1);

        let job = f.store.job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
    }

    #[tokio::test]
    async fn fresh_processing_job_is_left_alone() {
        let f = fixture();
        let doc = make_doc(&f).await;
        let job = f
            .orchestrator
            .enqueue_job(&doc, 0, JobStage::Extract, "jobs/a", None, None)
            .await
            .unwrap();
        f.store.claim_job(&job.id).await.unwrap();

        let report = f.reconciler.run().await.unwrap();
        assert!(report.is_empty());

        let job = f.store.job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn stuck_job_at_retry_ceiling_fails_terminally() {
        let f = fixture();
        let doc = make_doc(&f).await;
        let job = f
            .orchestrator
            .enqueue_job(&doc, 0, JobStage::Extract, "jobs/a", None, None)
            .await
            .unwrap();

        f.store.claim_job(&job.id).await.unwrap();
        // Already spent the budget before stalling (max_retries = 3).
        f.store
            .requeue_job(&job.id, f.config.max_retries - 1, Some("earlier failure"))
            .await
            .unwrap();
        f.store.claim_job(&job.id).await.unwrap();
        f.store.backdate_job(&job.id, Duration::seconds(660)).await;

        f.reconciler.run().await.unwrap();

        let job = f.store.job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, f.config.max_retries);

        let doc = f.store.document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);

        // The stuck sweep never revives it, and the failed-recovery sweep
        // skips it because the budget is gone.
        f.store.backdate_job(&job.id, Duration::seconds(3600)).await;
        let report = f.reconciler.run().await.unwrap();
        assert_eq!(report.stuck_reset, 0);
        assert_eq!(report.failed_recovered, 0);
    }

    #[tokio::test]
    async fn failed_job_below_ceiling_recovers_after_cooldown() {
        let f = fixture();
        let doc = make_doc(&f).await;
        let job = f
            .orchestrator
            .enqueue_job(&doc, 0, JobStage::Extract, "jobs/a", None, None)
            .await
            .unwrap();

        f.store.claim_job(&job.id).await.unwrap();
        f.store.fail_job(&job.id, 1, "rate limited").await.unwrap();

        // Inside the cooldown: not yet eligible.
        let report = f.reconciler.run().await.unwrap();
        assert_eq!(report.failed_recovered, 0);

        // Past the cooldown (15 min default): recovered with error cleared.
        f.store.backdate_job(&job.id, Duration::seconds(1000)).await;
        let report = f.reconciler.run().await.unwrap();
        assert_eq!(report.failed_recovered, 1);

        let job = f.store.job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn failed_chunk_recovers_unless_document_is_dead() {
        let f = fixture();
        let doc = make_doc(&f).await;
        f.orchestrator
            .register_chunks(&doc, vec!["one".into(), "two".into()])
            .await
            .unwrap();

        let chunks = f.store.chunks_for_document(&doc.id).await.unwrap();
        for c in &chunks {
            f.store.claim_chunk(&c.id).await.unwrap();
            f.store.fail_chunk(&c.id, "rate limited").await.unwrap();
            f.store.backdate_chunk(&c.id, Duration::seconds(1000)).await;
        }

        let report = f.reconciler.run().await.unwrap();
        assert_eq!(report.failed_recovered, 2);

        let chunks = f.store.chunks_for_document(&doc.id).await.unwrap();
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Pending));
        assert!(chunks.iter().all(|c| c.error.is_none()));

        // Now with a terminally-failed document: chunks stay down.
        for c in &chunks {
            f.store.claim_chunk(&c.id).await.unwrap();
            f.store.fail_chunk(&c.id, "rate limited").await.unwrap();
            f.store.backdate_chunk(&c.id, Duration::seconds(1000)).await;
        }
        f.store.fail_document(&doc.id, "dead").await.unwrap();

        let report = f.reconciler.run().await.unwrap();
        assert_eq!(report.failed_recovered, 0);
    }

    #[tokio::test]
    async fn orphaned_timeout_document_resets_to_ingested() {
        let f = fixture();
        let doc = make_doc(&f).await;
        f.store
            .fail_document(&doc.id, "processing timed out")
            .await
            .unwrap();

        let report = f.reconciler.run().await.unwrap();
        assert_eq!(report.orphans_recovered, 1);

        let doc = f.store.document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Ingested);
        assert!(doc.error.is_none());
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let f = fixture();
        let doc = make_doc(&f).await;
        let job = f
            .orchestrator
            .enqueue_job(&doc, 0, JobStage::Extract, "jobs/a", None, None)
            .await
            .unwrap();
        f.store.claim_job(&job.id).await.unwrap();
        f.store.backdate_job(&job.id, Duration::seconds(660)).await;

        let orphan = make_doc(&f).await;
        f.store
            .fail_document(&orphan.id, "upload timeout")
            .await
            .unwrap();

        let first = f.reconciler.run().await.unwrap();
        assert!(!first.is_empty());

        // Second pass with no intervening writes: nothing left to do.
        let second = f.reconciler.run().await.unwrap();
        assert!(second.is_empty());
        assert_eq!(f.store.audits("reconcile").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweeps_are_capped_per_invocation() {
        let f = fixture();
        let doc = make_doc(&f).await;
        for i in 0..5 {
            let job = f
                .orchestrator
                .enqueue_job(&doc, i, JobStage::Extract, "jobs/a", None, None)
                .await
                .unwrap();
            f.store.claim_job(&job.id).await.unwrap();
            f.store.backdate_job(&job.id, Duration::seconds(660)).await;
        }

        // Default cap is 3 per sweep per invocation.
        let report = f.reconciler.run().await.unwrap();
        assert_eq!(report.stuck_reset, 3);

        let report = f.reconciler.run().await.unwrap();
        assert_eq!(report.stuck_reset, 2);
    }
}

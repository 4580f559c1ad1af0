//! Generic retryable-task runner.
//!
//! Claims queued units of work via conditional status transitions, dispatches
//! them to stage handlers, and records success or failure with bounded
//! retries. Handlers never raise past this boundary: every failure is caught
//! and converted into a persisted status + error-message update, so the
//! invoking scheduler has nothing to rely on but the report counts.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::PipelineConfig;
use crate::model::{JobStage, ProcessingJob};
use crate::store::DocumentStore;

/// What a handler reports back on success.
#[derive(Debug)]
pub enum HandlerOutput {
    /// No side-effect verification required.
    Done,
    /// The handler wrote chunk rows for the job's document. The processor
    /// verifies they actually materialized before declaring success: exact
    /// total when the handler knows it, at-least-one otherwise.
    ChunksWritten { expected_total: Option<usize> },
}

/// A stage-specific job handler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Which stage this handler serves.
    fn stage(&self) -> JobStage;

    /// Run the job. Must be idempotent: the reconciler can re-queue work
    /// that partially succeeded, and a handler may be abandoned mid-run.
    async fn execute(&self, job: &ProcessingJob) -> Result<HandlerOutput>;
}

/// Outcome of one queue drain.
#[derive(Debug, Default, Clone)]
pub struct QueueReport {
    pub processed: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Claims pending jobs oldest-first and drives them through their handlers.
pub struct QueueProcessor {
    store: Arc<dyn DocumentStore>,
    config: PipelineConfig,
    handlers: HashMap<JobStage, Arc<dyn JobHandler>>,
}

impl QueueProcessor {
    pub fn new(store: Arc<dyn DocumentStore>, config: PipelineConfig) -> Self {
        Self {
            store,
            config,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for its stage, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.stage(), handler);
    }

    /// Claim and run up to `limit` pending jobs.
    ///
    /// Jobs whose retry budget is exhausted are never listed. A lost claim
    /// (another invocation got there first) is skipped silently; each job is
    /// processed by exactly one claimant.
    pub async fn process_batch(&self, limit: usize) -> Result<QueueReport> {
        let mut report = QueueReport::default();

        let candidates = self
            .store
            .pending_jobs(limit, self.config.max_retries)
            .await?;

        for job in candidates {
            if !self.store.claim_job(&job.id).await? {
                tracing::debug!(job_id = %job.id, "Lost claim race, skipping");
                continue;
            }
            self.drive_claimed(&job, &mut report).await?;
        }

        Ok(report)
    }

    /// Claim and run one specific job.
    ///
    /// Event-driven triggers use this to reach the job they just created
    /// instead of whichever pending job happens to be oldest. A missing job,
    /// a lost claim, or an exhausted retry budget leaves the report empty.
    pub async fn process_job(&self, job_id: &str) -> Result<QueueReport> {
        let mut report = QueueReport::default();
        let Some(job) = self.store.job(job_id).await? else {
            return Ok(report);
        };
        if job.retry_count >= self.config.max_retries || !self.store.claim_job(&job.id).await? {
            return Ok(report);
        }
        self.drive_claimed(&job, &mut report).await?;
        Ok(report)
    }

    /// Run one already-claimed job and record its outcome.
    async fn drive_claimed(&self, job: &ProcessingJob, report: &mut QueueReport) -> Result<()> {
        match self.run_claimed(job).await {
            Ok(()) => {
                self.store.complete_job(&job.id).await?;
                report.processed += 1;
                tracing::debug!(job_id = %job.id, doc_id = %job.document_id, "Job completed");
            }
            Err(message) => {
                let retries = job.retry_count + 1;
                if retries >= self.config.max_retries {
                    self.store.fail_job(&job.id, retries, &message).await?;
                    self.store.fail_document(&job.document_id, &message).await?;
                    tracing::error!(
                        job_id = %job.id,
                        doc_id = %job.document_id,
                        retries,
                        error = %message,
                        "Job terminally failed"
                    );
                } else {
                    // Back to pending right away so the next sweep can
                    // pick it up without waiting for the reconciler.
                    self.store
                        .requeue_job(&job.id, retries, Some(&message))
                        .await?;
                    tracing::warn!(
                        job_id = %job.id,
                        retries,
                        error = %message,
                        "Job failed, requeued"
                    );
                }
                report.failed += 1;
                report.errors.push(format!("{}: {}", job.id, message));
            }
        }
        Ok(())
    }

    /// Execute and verify one claimed job. Returns the error message on any
    /// failure; nothing propagates past this point as a raised error.
    async fn run_claimed(&self, job: &ProcessingJob) -> Result<(), String> {
        let Some(handler) = self.handlers.get(&job.stage) else {
            return Err(format!("no handler registered for stage {:?}", job.stage));
        };

        let output = handler.execute(job).await.map_err(|e| format!("{e:#}"))?;

        // A reported success without the expected side effects is still a
        // failure: guards against silent partial writes.
        match output {
            HandlerOutput::Done => Ok(()),
            HandlerOutput::ChunksWritten { expected_total } => {
                let actual = self
                    .store
                    .count_chunks(&job.document_id, job.pipeline)
                    .await
                    .map_err(|e| format!("verification query failed: {e:#}"))?;
                match expected_total {
                    Some(expected) if actual != expected => Err(format!(
                        "verification failed: expected {expected} chunks, found {actual}"
                    )),
                    None if actual == 0 => {
                        Err("verification failed: no chunks materialized".to_string())
                    }
                    _ => Ok(()),
                }
            }
        }
    }
}

//! Batch splitter for large page-based sources.
//!
//! Slices a document into fixed-size page windows and materializes one
//! extract job per window. Window artifacts are uploaded with exponential
//! backoff plus jitter; if any window exhausts its attempts the whole split
//! aborts and every already-created job is removed, so a document never
//! carries a partial job set.

use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;

use crate::config::PipelineConfig;
use crate::lifecycle::Orchestrator;
use crate::model::{Document, DocumentStatus, JobStage, ProcessingJob};
use crate::store::ObjectStore;

use super::queue::QueueProcessor;

/// A source that decomposes into ordered pages. The actual decoder (PDF or
/// otherwise) lives outside the pipeline.
pub trait PageSource: Send + Sync {
    fn page_count(&self) -> usize;

    /// Raw bytes for pages `start..=end`, 1-indexed inclusive.
    fn window_bytes(&self, start: usize, end: usize) -> Result<Vec<u8>>;
}

/// Page ranges covered by each window, 1-indexed inclusive.
pub fn page_windows(total_pages: usize, window: usize) -> Vec<(usize, usize)> {
    if total_pages == 0 || window == 0 {
        return vec![];
    }
    let mut windows = Vec::with_capacity(total_pages.div_ceil(window));
    let mut start = 1;
    while start <= total_pages {
        let end = (start + window - 1).min(total_pages);
        windows.push((start, end));
        start = end + 1;
    }
    windows
}

/// Splits documents into windowed extract jobs.
pub struct Splitter {
    orchestrator: Orchestrator,
    objects: Arc<dyn ObjectStore>,
    config: PipelineConfig,
    /// When present, the first window's job is triggered immediately after a
    /// successful split so latency doesn't depend on the periodic sweep.
    queue: Option<Arc<QueueProcessor>>,
}

impl Splitter {
    pub fn new(
        orchestrator: Orchestrator,
        objects: Arc<dyn ObjectStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            orchestrator,
            objects,
            config,
            queue: None,
        }
    }

    /// Enable the event-driven fast path for the first window.
    pub fn with_fast_path(mut self, queue: Arc<QueueProcessor>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Split `doc` into page windows and enqueue one job per window.
    ///
    /// Either every window's artifact and job is created, or the document is
    /// marked failed and no jobs remain. Returns the created jobs; an empty
    /// vec means another invocation already owns the split (duplicate
    /// trigger).
    pub async fn split_document(
        &self,
        doc: &Document,
        source: &dyn PageSource,
    ) -> Result<Vec<ProcessingJob>> {
        let store = self.orchestrator.store();

        if !store
            .transition_document(&doc.id, DocumentStatus::Created, DocumentStatus::Splitting)
            .await?
        {
            tracing::debug!(doc_id = %doc.id, "Split already in progress, skipping");
            return Ok(vec![]);
        }

        let total_pages = source.page_count();
        let windows = page_windows(total_pages, self.config.split_window_pages);
        if windows.is_empty() {
            let message = "source has no pages to split";
            store.fail_document(&doc.id, message).await?;
            anyhow::bail!("{message}: {}", doc.id);
        }

        tracing::info!(
            doc_id = %doc.id,
            total_pages,
            windows = windows.len(),
            "Splitting document"
        );

        let mut jobs = Vec::with_capacity(windows.len());
        for (ordinal, (start, end)) in windows.into_iter().enumerate() {
            let result = self
                .create_window(doc, ordinal, start, end, source)
                .await
                .with_context(|| format!("window {ordinal} (pages {start}-{end})"));

            match result {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    // Abort the whole split: no dangling partial job sets.
                    let removed = store.delete_jobs_for_document(&doc.id).await?;
                    let message = format!("split failed: {e:#}");
                    store.fail_document(&doc.id, &message).await?;
                    tracing::error!(
                        doc_id = %doc.id,
                        removed_jobs = removed,
                        error = %message,
                        "Split aborted"
                    );
                    return Err(e);
                }
            }
        }

        store
            .transition_document(&doc.id, DocumentStatus::Splitting, DocumentStatus::Ingested)
            .await?;

        // Fire-and-forget fast path for the first window; the rest wait for
        // the normal sweep. The claim is by id so a concurrent split never
        // steals the trigger for its own oldest job.
        if let (Some(queue), Some(first)) = (&self.queue, jobs.first()) {
            let queue = queue.clone();
            let job_id = first.id.clone();
            let doc_id = doc.id.clone();
            tokio::spawn(async move {
                if let Err(e) = queue.process_job(&job_id).await {
                    tracing::warn!(doc_id = %doc_id, error = %e, "First-window trigger failed");
                }
            });
        }

        Ok(jobs)
    }

    async fn create_window(
        &self,
        doc: &Document,
        ordinal: usize,
        start: usize,
        end: usize,
        source: &dyn PageSource,
    ) -> Result<ProcessingJob> {
        let bytes = source.window_bytes(start, end)?;
        let key = format!("{}/windows/{:04}", doc.storage_ref, ordinal);

        self.upload_with_backoff(&key, bytes).await?;

        self.orchestrator
            .enqueue_job(doc, ordinal, JobStage::Extract, &key, Some(start), Some(end))
            .await
    }

    /// Upload with `base * 2^attempt` backoff plus random jitter, capped at
    /// `upload_max_attempts`.
    async fn upload_with_backoff(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let max_attempts = self.config.upload_max_attempts.max(1);
        let base_ms = self.config.upload_base_delay_ms;

        for attempt in 0..max_attempts {
            match self.objects.put(key, bytes.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 == max_attempts => {
                    return Err(e.context(format!("upload exhausted {max_attempts} attempts")));
                }
                Err(e) => {
                    let delay_ms = {
                        let jitter_cap = (base_ms / 2).max(1);
                        let jitter = rand::rng().random_range(0..jitter_cap);
                        base_ms * 2u64.pow(attempt) + jitter
                    };
                    tracing::warn!(
                        key,
                        attempt,
                        delay_ms,
                        error = %e,
                        "Upload failed, backing off"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
            }
        }
        unreachable!("loop returns on the last attempt");
    }
}

//! Extraction stage handler.
//!
//! Pulls the job's artifact from the object store, runs the opaque text
//! extractor, chunks the result, and registers the chunks. The expected
//! chunk total is reported back so the queue can verify the rows actually
//! materialized.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::timeout;

use crate::chunker;
use crate::config::PipelineConfig;
use crate::extract::TextExtractor;
use crate::lifecycle::Orchestrator;
use crate::model::{JobStage, ProcessingJob};
use crate::store::ObjectStore;

use super::queue::{HandlerOutput, JobHandler};

/// Handler for [`JobStage::Extract`] jobs.
pub struct ExtractHandler {
    objects: Arc<dyn ObjectStore>,
    extractor: Arc<dyn TextExtractor>,
    orchestrator: Orchestrator,
    config: PipelineConfig,
}

impl ExtractHandler {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        extractor: Arc<dyn TextExtractor>,
        orchestrator: Orchestrator,
        config: PipelineConfig,
    ) -> Self {
        Self {
            objects,
            extractor,
            orchestrator,
            config,
        }
    }
}

#[async_trait]
impl JobHandler for ExtractHandler {
    fn stage(&self) -> JobStage {
        JobStage::Extract
    }

    async fn execute(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let store = self.orchestrator.store();

        let doc = store
            .document(&job.document_id)
            .await?
            .with_context(|| format!("document not found: {}", job.document_id))?;

        // A job reclaimed by the stuck sweep can land here after its chunks
        // already materialized. For whole-file jobs any existing chunk rows
        // are proof of that, so report them instead of writing a duplicate
        // set. Windowed jobs share the document's rows and cannot use this
        // shortcut.
        if job.page_start.is_none() {
            let prior = store.count_chunks(&doc.id, doc.pipeline).await?;
            if prior > 0 {
                tracing::debug!(
                    doc_id = %doc.id,
                    job_id = %job.id,
                    chunks = prior,
                    "Chunks already registered, skipping re-extraction"
                );
                return Ok(HandlerOutput::ChunksWritten {
                    expected_total: Some(prior),
                });
            }
        }

        let bytes = self
            .objects
            .get(&job.input_ref)
            .await?
            .with_context(|| format!("artifact not found: {}", job.input_ref))?;

        let text = timeout(
            self.config.external_call_timeout(),
            self.extractor.extract(&bytes),
        )
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "extraction timed out after {}s",
                self.config.external_call_timeout_secs
            )
        })??;

        let extracted_len = text.chars().count();
        let total_len = doc.text_len.unwrap_or(0) + extracted_len;
        store.set_document_text_len(&doc.id, total_len).await?;

        let pieces = chunker::chunk(&text, self.config.chunk_size, self.config.chunk_overlap)?;
        let written = self.orchestrator.register_chunks(&doc, pieces).await?;

        // Windowed jobs of one document may run in concurrent invocations,
        // so an exact document-wide total would race; fall back to the
        // at-least-one check for those.
        let expected_total = if job.page_start.is_none() {
            Some(written)
        } else {
            None
        };

        tracing::debug!(
            doc_id = %doc.id,
            job_id = %job.id,
            chars = extracted_len,
            chunks = written,
            "Extracted and chunked artifact"
        );

        Ok(HandlerOutput::ChunksWritten { expected_total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{FailingExtractor, PlainTextExtractor};
    use crate::model::{ChunkStatus, DocumentStatus, JobStatus};
    use crate::pipeline::PipelineKind;
    use crate::store::{DocumentStore, MemoryObjects, MemoryStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        objects: Arc<MemoryObjects>,
        orchestrator: Orchestrator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        Fixture {
            store: store.clone(),
            objects: Arc::new(MemoryObjects::new()),
            orchestrator: Orchestrator::new(store),
        }
    }

    fn handler(f: &Fixture, extractor: Arc<dyn TextExtractor>) -> ExtractHandler {
        ExtractHandler::new(
            f.objects.clone(),
            extractor,
            f.orchestrator.clone(),
            PipelineConfig {
                chunk_size: 10,
                chunk_overlap: 2,
                ..PipelineConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn extracts_chunks_and_reports_exact_total() {
        let f = fixture();
        let text = "abcdefghijklmnopqrstuvwxyz";
        f.objects
            .put("docs/a", text.as_bytes().to_vec())
            .await
            .unwrap();

        let doc = f
            .orchestrator
            .create_document("a.txt", "docs/a", 26, Some(26), PipelineKind::Primary)
            .await
            .unwrap();
        let job = f
            .orchestrator
            .enqueue_job(&doc, 0, JobStage::Extract, "docs/a", None, None)
            .await
            .unwrap();

        let h = handler(&f, Arc::new(PlainTextExtractor));
        let output = h.execute(&job).await.unwrap();

        let chunks = f.store.chunks_for_document(&doc.id).await.unwrap();
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Pending));

        match output {
            HandlerOutput::ChunksWritten { expected_total } => {
                assert_eq!(expected_total, Some(chunks.len()));
            }
            HandlerOutput::Done => panic!("extract must report written chunks"),
        }

        let doc = f.store.document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Processing);
    }

    #[tokio::test]
    async fn reclaimed_job_does_not_duplicate_chunks() {
        let f = fixture();
        let text = "abcdefghijklmnopqrstuvwxyz";
        f.objects
            .put("docs/a", text.as_bytes().to_vec())
            .await
            .unwrap();

        let doc = f
            .orchestrator
            .create_document("a.txt", "docs/a", 26, Some(26), PipelineKind::Primary)
            .await
            .unwrap();
        let job = f
            .orchestrator
            .enqueue_job(&doc, 0, JobStage::Extract, "docs/a", None, None)
            .await
            .unwrap();

        let h = handler(&f, Arc::new(PlainTextExtractor));
        h.execute(&job).await.unwrap();
        let first_pass = f.store.chunks_for_document(&doc.id).await.unwrap();
        let text_len = f.store.document(&doc.id).await.unwrap().unwrap().text_len;

        // The stuck sweep hands the job back after the chunks landed; the
        // rerun must report the existing rows, not write a second set.
        f.store
            .requeue_job(&job.id, 1, Some("reclaimed after processing stall"))
            .await
            .unwrap();
        match h.execute(&job).await.unwrap() {
            HandlerOutput::ChunksWritten { expected_total } => {
                assert_eq!(expected_total, Some(first_pass.len()));
            }
            HandlerOutput::Done => panic!("extract must report written chunks"),
        }

        let second_pass = f.store.chunks_for_document(&doc.id).await.unwrap();
        assert_eq!(second_pass.len(), first_pass.len());
        let doc = f.store.document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.text_len, text_len);
    }

    #[tokio::test]
    async fn windowed_jobs_skip_the_exact_count() {
        let f = fixture();
        f.objects.put("docs/a/w0", b"0123456789".to_vec()).await.unwrap();

        let doc = f
            .orchestrator
            .create_document("a.pdf", "docs/a", 100, Some(100), PipelineKind::Primary)
            .await
            .unwrap();
        let job = f
            .orchestrator
            .enqueue_job(&doc, 0, JobStage::Extract, "docs/a/w0", Some(1), Some(20))
            .await
            .unwrap();

        let h = handler(&f, Arc::new(PlainTextExtractor));
        match h.execute(&job).await.unwrap() {
            HandlerOutput::ChunksWritten { expected_total } => assert_eq!(expected_total, None),
            HandlerOutput::Done => panic!("extract must report written chunks"),
        }
    }

    #[tokio::test]
    async fn extractor_error_propagates_as_failure() {
        let f = fixture();
        f.objects.put("docs/a", b"x".to_vec()).await.unwrap();

        let doc = f
            .orchestrator
            .create_document("a.pdf", "docs/a", 1, Some(1), PipelineKind::Primary)
            .await
            .unwrap();
        let job = f
            .orchestrator
            .enqueue_job(&doc, 0, JobStage::Extract, "docs/a", None, None)
            .await
            .unwrap();

        let h = handler(&f, Arc::new(FailingExtractor("ocr backend unreachable")));
        let err = h.execute(&job).await.unwrap_err();
        assert!(err.to_string().contains("ocr backend unreachable"));
    }

    #[tokio::test]
    async fn missing_artifact_is_an_error() {
        let f = fixture();
        let doc = f
            .orchestrator
            .create_document("a.txt", "docs/gone", 1, Some(1), PipelineKind::Primary)
            .await
            .unwrap();
        let job = f
            .orchestrator
            .enqueue_job(&doc, 0, JobStage::Extract, "docs/gone", None, None)
            .await
            .unwrap();

        let h = handler(&f, Arc::new(PlainTextExtractor));
        let err = h.execute(&job).await.unwrap_err();
        assert!(err.to_string().contains("artifact not found"));
    }

    #[tokio::test]
    async fn end_to_end_through_the_queue() {
        use crate::jobs::queue::QueueProcessor;

        let f = fixture();
        f.objects
            .put("docs/a", b"hello world, this is a longer text".to_vec())
            .await
            .unwrap();

        let doc = f
            .orchestrator
            .create_document("a.txt", "docs/a", 34, Some(34), PipelineKind::Primary)
            .await
            .unwrap();
        let job = f
            .orchestrator
            .enqueue_job(&doc, 0, JobStage::Extract, "docs/a", None, None)
            .await
            .unwrap();

        let config = PipelineConfig {
            chunk_size: 10,
            chunk_overlap: 2,
            ..PipelineConfig::default()
        };
        let mut queue = QueueProcessor::new(f.store.clone(), config.clone());
        queue.register(Arc::new(ExtractHandler::new(
            f.objects.clone(),
            Arc::new(PlainTextExtractor),
            f.orchestrator.clone(),
            config,
        )));

        let report = queue.process_batch(5).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);

        let job = f.store.job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
}

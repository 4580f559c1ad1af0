//! Embedding worker.
//!
//! Promotes pending chunks to `ready` by calling the embedding provider,
//! one chunk at a time with a fixed inter-call delay to respect upstream
//! rate limits. Failures are recorded on the chunk and left for the
//! reconciler; there is no automatic in-worker retry.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::timeout;

use crate::config::PipelineConfig;
use crate::embeddings::EmbeddingProvider;
use crate::model::{Chunk, ChunkStatus, DocumentStatus, JobStage, JobStatus, ProcessingJob};
use crate::store::DocumentStore;

use super::queue::{HandlerOutput, JobHandler};

/// Outcome of one embedding pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbedReport {
    pub embedded: usize,
    pub failed: usize,
    /// Documents flipped to `ready` by this pass.
    pub documents_ready: usize,
}

/// Consumes pending chunks and writes back vectors.
pub struct EmbedWorker {
    store: Arc<dyn DocumentStore>,
    provider: Arc<dyn EmbeddingProvider>,
    config: PipelineConfig,
}

impl EmbedWorker {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        provider: Arc<dyn EmbeddingProvider>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Embed up to `embed_batch_size` pending chunks across all documents,
    /// oldest first.
    pub async fn process_pending(&self) -> Result<EmbedReport> {
        let chunks = self
            .store
            .pending_chunks(self.config.embed_batch_size)
            .await?;
        self.process_chunks(chunks).await
    }

    /// Embed every pending chunk of one document.
    pub async fn process_document(&self, doc_id: &str) -> Result<EmbedReport> {
        let chunks: Vec<Chunk> = self
            .store
            .chunks_for_document(doc_id)
            .await?
            .into_iter()
            .filter(|c| c.status == ChunkStatus::Pending)
            .collect();
        self.process_chunks(chunks).await
    }

    async fn process_chunks(&self, chunks: Vec<Chunk>) -> Result<EmbedReport> {
        let mut report = EmbedReport::default();
        let mut touched: BTreeSet<String> = BTreeSet::new();
        let mut first_call = true;

        for chunk in chunks {
            if !self.store.claim_chunk(&chunk.id).await? {
                continue;
            }
            touched.insert(chunk.document_id.clone());

            // Throttle between provider calls. Not a correctness mechanism,
            // just rate-limit hygiene.
            if !first_call {
                tokio::time::sleep(self.config.embed_call_delay()).await;
            }
            first_call = false;

            let call = timeout(
                self.config.external_call_timeout(),
                self.provider.embed(&chunk.content),
            )
            .await;

            match call {
                Err(_) => {
                    self.store
                        .fail_chunk(&chunk.id, "embedding call timed out")
                        .await?;
                    report.failed += 1;
                }
                Ok(Err(e)) => {
                    self.store.fail_chunk(&chunk.id, &format!("{e:#}")).await?;
                    report.failed += 1;
                }
                Ok(Ok(vector)) if vector.len() != self.provider.dimensions() => {
                    // A mismatched width is a hard failure, never silently
                    // accepted.
                    let message = format!(
                        "dimension mismatch: expected {}, got {}",
                        self.provider.dimensions(),
                        vector.len()
                    );
                    self.store.fail_chunk(&chunk.id, &message).await?;
                    report.failed += 1;
                }
                Ok(Ok(vector)) => {
                    self.store.complete_chunk(&chunk.id, vector).await?;
                    report.embedded += 1;
                }
            }
        }

        // For every document touched, flip it to ready once no sibling is
        // still non-ready and all of its jobs completed.
        for doc_id in touched {
            if self.try_finish_document(&doc_id).await? {
                report.documents_ready += 1;
            }
        }

        Ok(report)
    }

    async fn try_finish_document(&self, doc_id: &str) -> Result<bool> {
        if self.store.count_unready_chunks(doc_id).await? > 0 {
            return Ok(false);
        }
        let jobs = self.store.jobs_for_document(doc_id).await?;
        if jobs.iter().any(|j| j.status != JobStatus::Completed) {
            return Ok(false);
        }

        let flipped = self
            .store
            .transition_document(doc_id, DocumentStatus::Processing, DocumentStatus::Ready)
            .await?;
        if flipped {
            tracing::info!(doc_id, "Document ready");
        }
        Ok(flipped)
    }
}

/// Queue handler that embeds one document's pending chunks as a job.
pub struct EmbedDocumentHandler {
    worker: Arc<EmbedWorker>,
}

impl EmbedDocumentHandler {
    pub fn new(worker: Arc<EmbedWorker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl JobHandler for EmbedDocumentHandler {
    fn stage(&self) -> JobStage {
        JobStage::EmbedDocument
    }

    async fn execute(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let report = self.worker.process_document(&job.document_id).await?;
        if report.failed > 0 {
            anyhow::bail!(
                "{} of {} chunks failed to embed",
                report.failed,
                report.failed + report.embedded
            );
        }
        Ok(HandlerOutput::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::MockProvider;
    use crate::lifecycle::Orchestrator;
    use crate::model::Document;
    use crate::pipeline::PipelineKind;
    use crate::store::MemoryStore;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            embed_call_delay_ms: 0,
            ..PipelineConfig::default()
        }
    }

    async fn ingest(store: &Arc<MemoryStore>, chunk_count: usize) -> Document {
        let orch = Orchestrator::new(store.clone() as Arc<dyn DocumentStore>);
        let doc = orch
            .create_document("a.txt", "docs/a", 10, Some(10), PipelineKind::Primary)
            .await
            .unwrap();
        let contents = (0..chunk_count).map(|i| format!("chunk {i}")).collect();
        orch.register_chunks(&doc, contents).await.unwrap();
        doc
    }

    #[tokio::test]
    async fn drains_batches_until_document_ready() {
        let store = Arc::new(MemoryStore::new());
        let doc = ingest(&store, 45).await;

        let worker = EmbedWorker::new(
            store.clone(),
            Arc::new(MockProvider::new(8)),
            test_config(), // embed_batch_size: 20
        );

        // 45 pending chunks at 20 per pass: two passes leave work behind.
        let r1 = worker.process_pending().await.unwrap();
        assert_eq!(r1.embedded, 20);
        assert_eq!(r1.documents_ready, 0);

        let r2 = worker.process_pending().await.unwrap();
        assert_eq!(r2.embedded, 20);
        assert_eq!(r2.documents_ready, 0);

        let r3 = worker.process_pending().await.unwrap();
        assert_eq!(r3.embedded, 5);
        assert_eq!(r3.documents_ready, 1);

        let doc = store.document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready);

        let chunks = store.chunks_for_document(&doc.id).await.unwrap();
        assert_eq!(chunks.len(), 45);
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Ready));
        assert!(chunks.iter().all(|c| c.vector.is_some() && c.embedded_at.is_some()));
    }

    #[tokio::test]
    async fn provider_failure_marks_chunk_failed_without_retry() {
        let store = Arc::new(MemoryStore::new());
        let doc = ingest(&store, 2).await;

        let worker = EmbedWorker::new(
            store.clone(),
            Arc::new(MockProvider::failing(8, "rate limited")),
            test_config(),
        );

        let report = worker.process_pending().await.unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.embedded, 0);

        let chunks = store.chunks_for_document(&doc.id).await.unwrap();
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Failed));
        assert!(chunks[0].error.as_deref().unwrap().contains("rate limited"));

        // Re-running does nothing: failed chunks are the reconciler's to
        // revive, not the worker's.
        let report = worker.process_pending().await.unwrap();
        assert_eq!(report.failed + report.embedded, 0);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_a_hard_failure() {
        let store = Arc::new(MemoryStore::new());
        let doc = ingest(&store, 1).await;

        let worker = EmbedWorker::new(
            store.clone(),
            Arc::new(MockProvider::mismatched(8, 5)),
            test_config(),
        );

        worker.process_pending().await.unwrap();

        let chunks = store.chunks_for_document(&doc.id).await.unwrap();
        assert_eq!(chunks[0].status, ChunkStatus::Failed);
        assert!(chunks[0]
            .error
            .as_deref()
            .unwrap()
            .contains("dimension mismatch"));
        assert!(chunks[0].vector.is_none());
    }

    #[tokio::test]
    async fn document_with_failed_sibling_stays_processing() {
        let store = Arc::new(MemoryStore::new());
        let doc = ingest(&store, 2).await;

        let chunks = store.chunks_for_document(&doc.id).await.unwrap();
        store.claim_chunk(&chunks[0].id).await.unwrap();
        store.fail_chunk(&chunks[0].id, "boom").await.unwrap();

        let worker = EmbedWorker::new(store.clone(), Arc::new(MockProvider::new(8)), test_config());
        let report = worker.process_pending().await.unwrap();
        assert_eq!(report.embedded, 1);
        assert_eq!(report.documents_ready, 0);

        let doc = store.document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Processing);
    }

    #[tokio::test]
    async fn oldest_chunks_are_drained_first() {
        let store = Arc::new(MemoryStore::new());
        let older = ingest(&store, 2).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = ingest(&store, 2).await;

        let config = PipelineConfig {
            embed_batch_size: 2,
            embed_call_delay_ms: 0,
            ..PipelineConfig::default()
        };
        let worker = EmbedWorker::new(store.clone(), Arc::new(MockProvider::new(8)), config);
        worker.process_pending().await.unwrap();

        let older_chunks = store.chunks_for_document(&older.id).await.unwrap();
        assert!(older_chunks.iter().all(|c| c.status == ChunkStatus::Ready));

        let newer_chunks = store.chunks_for_document(&newer.id).await.unwrap();
        assert!(newer_chunks.iter().all(|c| c.status == ChunkStatus::Pending));
    }
}

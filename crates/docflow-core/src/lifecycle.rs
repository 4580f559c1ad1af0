//! Document lifecycle orchestration.
//!
//! Owns the per-document status field. Transitions are driven externally by
//! the other stages; this module provides the creation entry points, the
//! guarded advancement helpers they call, and the reconciliation routine
//! that recomputes a document's status purely from its children.
//!
//! ```text
//! created ──(split)──▶ splitting ──▶ ingested ──▶ chunked ──▶ processing ──▶ ready
//!                                        ▲
//!                                        └── reconcile resets (no chunks)
//! failed is reachable from any non-terminal state
//! ```

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::model::{
    Chunk, ChunkStatus, Document, DocumentStatus, JobStage, JobStatus, ProcessingJob,
};
use crate::pipeline::PipelineKind;
use crate::store::DocumentStore;

/// Creation and status-advancement entry points for documents.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn DocumentStore>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Create a document record for an uploaded or crawled artifact.
    ///
    /// Documents whose text is already known enter at `Ingested`; sources
    /// that still need extraction or splitting enter at `Created`.
    pub async fn create_document(
        &self,
        name: &str,
        storage_ref: &str,
        size_bytes: u64,
        text_len: Option<usize>,
        kind: PipelineKind,
    ) -> Result<Document> {
        let now = Utc::now();
        let doc = Document {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            storage_ref: storage_ref.to_string(),
            size_bytes,
            text_len,
            status: if text_len.is_some() {
                DocumentStatus::Ingested
            } else {
                DocumentStatus::Created
            },
            error: None,
            pipeline: kind,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_document(doc.clone()).await?;
        tracing::info!(doc_id = %doc.id, name = %doc.name, pipeline = %kind, "Document created");
        Ok(doc)
    }

    /// Bulk-create pending chunks for a document and advance it to
    /// `Processing` (via `Chunked`). Returns how many chunks were written.
    pub async fn register_chunks(&self, doc: &Document, contents: Vec<String>) -> Result<usize> {
        let now = Utc::now();
        let count = contents.len();
        let chunks: Vec<Chunk> = contents
            .into_iter()
            .enumerate()
            .map(|(index, content)| Chunk {
                id: uuid::Uuid::new_v4().to_string(),
                document_id: doc.id.clone(),
                index,
                content,
                status: ChunkStatus::Pending,
                vector: None,
                error: None,
                embedded_at: None,
                pipeline: doc.pipeline,
                created_at: now,
                updated_at: now,
            })
            .collect();

        self.store.insert_chunks(chunks).await?;

        // Advance the lifecycle; losing either CAS means another invocation
        // already moved the document, which is fine.
        self.store
            .transition_document(&doc.id, DocumentStatus::Ingested, DocumentStatus::Chunked)
            .await?;
        self.store
            .transition_document(&doc.id, DocumentStatus::Chunked, DocumentStatus::Processing)
            .await?;

        tracing::debug!(doc_id = %doc.id, count, "Registered chunks");
        Ok(count)
    }

    /// Enqueue one unit of work for a document.
    pub async fn enqueue_job(
        &self,
        doc: &Document,
        index: usize,
        stage: JobStage,
        input_ref: &str,
        page_start: Option<usize>,
        page_end: Option<usize>,
    ) -> Result<ProcessingJob> {
        let now = Utc::now();
        let job = ProcessingJob {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: doc.id.clone(),
            index,
            stage,
            input_ref: input_ref.to_string(),
            page_start,
            page_end,
            status: JobStatus::Pending,
            retry_count: 0,
            error: None,
            pipeline: doc.pipeline,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };
        self.store.insert_job(job.clone()).await?;
        tracing::debug!(doc_id = %doc.id, job_id = %job.id, stage = ?stage, "Job enqueued");
        Ok(job)
    }

    /// Recompute a document's status purely from its children.
    ///
    /// The correctness backstop against lost status-update writes: idempotent
    /// and safe to run arbitrarily often.
    ///
    /// - no chunks at all => reset to `Ingested` so the pipeline re-derives
    ///   work for it;
    /// - all chunks ready and all jobs terminal-complete => `Ready`;
    /// - otherwise unchanged.
    pub async fn reconcile_document(&self, doc_id: &str) -> Result<DocumentStatus> {
        let Some(doc) = self.store.document(doc_id).await? else {
            anyhow::bail!("Document not found: {doc_id}");
        };

        // Terminal failure and pre-chunking states are left alone; resetting
        // a document that never reached chunking would loop it forever.
        if !matches!(
            doc.status,
            DocumentStatus::Chunked | DocumentStatus::Processing | DocumentStatus::Ready
        ) {
            return Ok(doc.status);
        }

        let chunks = self.store.chunks_for_document(doc_id).await?;

        if chunks.is_empty() {
            if doc.status != DocumentStatus::Ingested {
                self.store
                    .reset_document(doc_id, DocumentStatus::Ingested)
                    .await?;
                tracing::info!(doc_id, "No chunks found, reset to ingested");
            }
            return Ok(DocumentStatus::Ingested);
        }

        let all_ready = chunks.iter().all(|c| c.status == ChunkStatus::Ready);
        let jobs_done = self
            .store
            .jobs_for_document(doc_id)
            .await?
            .iter()
            .all(|j| j.status == JobStatus::Completed);

        if all_ready && jobs_done {
            if self
                .store
                .transition_document(doc_id, DocumentStatus::Processing, DocumentStatus::Ready)
                .await?
            {
                tracing::info!(doc_id, "All chunks ready, document ready");
            }
            return Ok(DocumentStatus::Ready);
        }

        Ok(doc.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn create_with_text_starts_ingested() {
        let orch = orchestrator();
        let doc = orch
            .create_document("a.txt", "docs/a", 5, Some(5), PipelineKind::Primary)
            .await
            .unwrap();
        assert_eq!(doc.status, DocumentStatus::Ingested);

        let doc = orch
            .create_document("b.pdf", "docs/b", 5, None, PipelineKind::Compact)
            .await
            .unwrap();
        assert_eq!(doc.status, DocumentStatus::Created);
    }

    #[tokio::test]
    async fn register_chunks_advances_to_processing() {
        let orch = orchestrator();
        let doc = orch
            .create_document("a.txt", "docs/a", 5, Some(5), PipelineKind::Primary)
            .await
            .unwrap();

        let n = orch
            .register_chunks(&doc, vec!["one".into(), "two".into()])
            .await
            .unwrap();
        assert_eq!(n, 2);

        let doc = orch.store().document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Processing);

        let chunks = orch.store().chunks_for_document(&doc.id).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Pending));
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[1].index, 1);
    }

    #[tokio::test]
    async fn reconcile_resets_chunkless_processing_document() {
        let orch = orchestrator();
        let doc = orch
            .create_document("a.txt", "docs/a", 5, Some(5), PipelineKind::Primary)
            .await
            .unwrap();
        orch.store()
            .transition_document(&doc.id, DocumentStatus::Ingested, DocumentStatus::Chunked)
            .await
            .unwrap();
        orch.store()
            .transition_document(&doc.id, DocumentStatus::Chunked, DocumentStatus::Processing)
            .await
            .unwrap();

        let status = orch.reconcile_document(&doc.id).await.unwrap();
        assert_eq!(status, DocumentStatus::Ingested);
    }

    #[tokio::test]
    async fn reconcile_promotes_when_all_children_ready() {
        let orch = orchestrator();
        let doc = orch
            .create_document("a.txt", "docs/a", 5, Some(5), PipelineKind::Primary)
            .await
            .unwrap();
        orch.register_chunks(&doc, vec!["one".into()]).await.unwrap();

        let chunks = orch.store().chunks_for_document(&doc.id).await.unwrap();
        orch.store()
            .complete_chunk(&chunks[0].id, vec![0.0])
            .await
            .unwrap();

        let status = orch.reconcile_document(&doc.id).await.unwrap();
        assert_eq!(status, DocumentStatus::Ready);

        // Running again changes nothing.
        let status = orch.reconcile_document(&doc.id).await.unwrap();
        assert_eq!(status, DocumentStatus::Ready);
    }

    #[tokio::test]
    async fn reconcile_leaves_in_flight_documents_alone() {
        let orch = orchestrator();
        let doc = orch
            .create_document("a.txt", "docs/a", 5, Some(5), PipelineKind::Primary)
            .await
            .unwrap();
        orch.register_chunks(&doc, vec!["one".into(), "two".into()])
            .await
            .unwrap();

        let chunks = orch.store().chunks_for_document(&doc.id).await.unwrap();
        orch.store()
            .complete_chunk(&chunks[0].id, vec![0.0])
            .await
            .unwrap();

        let status = orch.reconcile_document(&doc.id).await.unwrap();
        assert_eq!(status, DocumentStatus::Processing);
    }

    #[tokio::test]
    async fn reconcile_waits_for_incomplete_jobs() {
        let orch = orchestrator();
        let doc = orch
            .create_document("a.txt", "docs/a", 5, Some(5), PipelineKind::Primary)
            .await
            .unwrap();
        orch.register_chunks(&doc, vec!["one".into()]).await.unwrap();
        orch.enqueue_job(&doc, 0, JobStage::Extract, "jobs/x", None, None)
            .await
            .unwrap();

        let chunks = orch.store().chunks_for_document(&doc.id).await.unwrap();
        orch.store()
            .complete_chunk(&chunks[0].id, vec![0.0])
            .await
            .unwrap();

        // Job still pending, so the document must not flip to ready.
        let status = orch.reconcile_document(&doc.id).await.unwrap();
        assert_eq!(status, DocumentStatus::Processing);
    }
}

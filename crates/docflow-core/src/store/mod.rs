//! Storage seams for the pipeline.
//!
//! The relational row store and the blob store are external collaborators
//! with their own durability guarantees; the pipeline only relies on the
//! operations declared here. The one non-negotiable primitive is the
//! conditional transition (`claim_job`, `claim_chunk`, `transition_document`):
//! stages run as independently invoked, stateless units with no shared
//! process memory, so exclusivity comes entirely from compare-and-swap on a
//! status column, never from in-process locks.

mod memory;

pub use memory::{MemoryObjects, MemoryStore};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{AuditRecord, Chunk, Document, DocumentStatus, ProcessingJob};
use crate::pipeline::PipelineKind;

/// Row CRUD and conditional transitions over pipeline records.
///
/// All list queries return oldest-first so draining is fair. Queries that
/// feed a sweep take a `limit` so a single invocation stays bounded.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    // Documents

    async fn insert_document(&self, doc: Document) -> Result<()>;

    async fn document(&self, id: &str) -> Result<Option<Document>>;

    /// Compare-and-swap the document status. Returns whether the caller won;
    /// a `false` means another invocation already moved the row.
    async fn transition_document(
        &self,
        id: &str,
        from: DocumentStatus,
        to: DocumentStatus,
    ) -> Result<bool>;

    /// Force a document into `Failed` with a human-readable error. No-op if
    /// the document is already `Ready`.
    async fn fail_document(&self, id: &str, error: &str) -> Result<()>;

    /// Force a document back to an earlier lifecycle state, clearing its
    /// error. Used by reconciliation resets.
    async fn reset_document(&self, id: &str, to: DocumentStatus) -> Result<()>;

    async fn set_document_text_len(&self, id: &str, len: usize) -> Result<()>;

    /// Documents terminally failed with timeout-shaped error text and no job
    /// rows at all (orphaned by a crash before job creation).
    async fn orphaned_timeout_documents(&self, limit: usize) -> Result<Vec<Document>>;

    // Chunks

    async fn insert_chunks(&self, chunks: Vec<Chunk>) -> Result<()>;

    async fn chunks_for_document(&self, doc_id: &str) -> Result<Vec<Chunk>>;

    /// Pending chunks across all documents, oldest first.
    async fn pending_chunks(&self, limit: usize) -> Result<Vec<Chunk>>;

    /// CAS `Pending -> Processing`. Returns whether the caller won the claim.
    async fn claim_chunk(&self, id: &str) -> Result<bool>;

    async fn complete_chunk(&self, id: &str, vector: Vec<f32>) -> Result<()>;

    async fn fail_chunk(&self, id: &str, error: &str) -> Result<()>;

    /// CAS `Failed -> Pending`, clearing the error. Returns whether the
    /// chunk was actually reset.
    async fn reset_chunk(&self, id: &str) -> Result<bool>;

    /// Chunk count for a document scoped to one pipeline variant. Used by
    /// post-success verification.
    async fn count_chunks(&self, doc_id: &str, kind: PipelineKind) -> Result<usize>;

    /// Chunks of the document not yet `Ready`.
    async fn count_unready_chunks(&self, doc_id: &str) -> Result<usize>;

    /// Failed chunks idle since before `idle_since`, oldest first.
    async fn failed_chunks(&self, idle_since: DateTime<Utc>, limit: usize) -> Result<Vec<Chunk>>;

    // Jobs

    async fn insert_job(&self, job: ProcessingJob) -> Result<()>;

    async fn job(&self, id: &str) -> Result<Option<ProcessingJob>>;

    async fn jobs_for_document(&self, doc_id: &str) -> Result<Vec<ProcessingJob>>;

    /// Remove all jobs of a document. Returns how many were deleted. Used
    /// when a split aborts so no partial job set is left dangling.
    async fn delete_jobs_for_document(&self, doc_id: &str) -> Result<usize>;

    /// Pending jobs with retry budget remaining, oldest first.
    async fn pending_jobs(&self, limit: usize, max_retries: u32) -> Result<Vec<ProcessingJob>>;

    /// CAS `Pending -> Processing`, stamping `started_at`. Returns whether
    /// the caller won the claim.
    async fn claim_job(&self, id: &str) -> Result<bool>;

    async fn complete_job(&self, id: &str) -> Result<()>;

    /// Return a job to `Pending` with the given retry count; `error` is kept
    /// for diagnostics when present, cleared otherwise.
    async fn requeue_job(&self, id: &str, retry_count: u32, error: Option<&str>) -> Result<()>;

    /// Terminally fail a job.
    async fn fail_job(&self, id: &str, retry_count: u32, error: &str) -> Result<()>;

    /// Jobs still `Processing` whose last update is older than `older_than`.
    async fn stale_processing_jobs(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProcessingJob>>;

    /// Failed jobs with retry budget left, idle since before `idle_since`.
    async fn recoverable_failed_jobs(
        &self,
        max_retries: u32,
        idle_since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProcessingJob>>;

    // Agents and assignment

    async fn agent_exists(&self, agent_id: &str) -> Result<bool>;

    /// Link documents to an agent. Idempotent; returns how many links were
    /// written (existing links count as written).
    async fn link_documents_to_agent(&self, agent_id: &str, doc_ids: &[String]) -> Result<usize>;

    // Audit

    async fn append_audit(&self, record: AuditRecord) -> Result<()>;

    async fn audits(&self, kind: &str) -> Result<Vec<AuditRecord>>;
}

/// Blob upload/download for source artifacts and window slices.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

//! In-memory store implementations.
//!
//! Back the demo runner and the test suite. The compare-and-swap semantics
//! match what a relational store provides via conditional `UPDATE`: every
//! claim checks the prior status and only one caller observes the old value.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::model::{AuditRecord, Chunk, Document, DocumentStatus, ChunkStatus, JobStatus, ProcessingJob};
use crate::pipeline::PipelineKind;

use super::{DocumentStore, ObjectStore};

#[derive(Default)]
struct Inner {
    documents: HashMap<String, Document>,
    chunks: HashMap<String, Chunk>,
    jobs: HashMap<String, ProcessingJob>,
    agents: HashSet<String>,
    /// agent id -> linked document ids
    links: HashMap<String, HashSet<String>>,
    audits: Vec<AuditRecord>,
}

/// In-memory [`DocumentStore`] with conditional-update semantics.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent so `agent_exists` answers true.
    pub async fn register_agent(&self, agent_id: &str) {
        self.inner.lock().await.agents.insert(agent_id.to_string());
    }

    /// Documents linked to an agent.
    pub async fn linked_documents(&self, agent_id: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<String> = inner
            .links
            .get(agent_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Shift a job's `updated_at` into the past. Test support for staleness
    /// sweeps.
    pub async fn backdate_job(&self, id: &str, by: Duration) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(id) {
            job.updated_at -= by;
        }
    }

    /// Shift a chunk's `updated_at` into the past. Test support.
    pub async fn backdate_chunk(&self, id: &str, by: Duration) {
        let mut inner = self.inner.lock().await;
        if let Some(chunk) = inner.chunks.get_mut(id) {
            chunk.updated_at -= by;
        }
    }

    /// Snapshot of every document, for diagnostics.
    pub async fn all_documents(&self) -> Vec<Document> {
        let inner = self.inner.lock().await;
        let mut docs: Vec<Document> = inner.documents.values().cloned().collect();
        docs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        docs
    }
}

fn oldest_first_chunks(mut chunks: Vec<Chunk>) -> Vec<Chunk> {
    chunks.sort_by(|a, b| {
        (a.created_at, &a.document_id, a.index).cmp(&(b.created_at, &b.document_id, b.index))
    });
    chunks
}

fn oldest_first_jobs(mut jobs: Vec<ProcessingJob>) -> Vec<ProcessingJob> {
    jobs.sort_by(|a, b| {
        (a.created_at, &a.document_id, a.index).cmp(&(b.created_at, &b.document_id, b.index))
    });
    jobs
}

fn error_looks_like_timeout(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("timed out") || lower.contains("timeout")
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_document(&self, doc: Document) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.documents.insert(doc.id.clone(), doc);
        Ok(())
    }

    async fn document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.inner.lock().await.documents.get(id).cloned())
    }

    async fn transition_document(
        &self,
        id: &str,
        from: DocumentStatus,
        to: DocumentStatus,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.documents.get_mut(id) {
            Some(doc) if doc.status == from => {
                doc.status = to;
                doc.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_document(&self, id: &str, error: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(doc) = inner.documents.get_mut(id) {
            if doc.status != DocumentStatus::Ready {
                doc.status = DocumentStatus::Failed;
                doc.error = Some(error.to_string());
                doc.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn reset_document(&self, id: &str, to: DocumentStatus) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(doc) = inner.documents.get_mut(id) {
            doc.status = to;
            doc.error = None;
            doc.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_document_text_len(&self, id: &str, len: usize) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(doc) = inner.documents.get_mut(id) {
            doc.text_len = Some(len);
            doc.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn orphaned_timeout_documents(&self, limit: usize) -> Result<Vec<Document>> {
        let inner = self.inner.lock().await;
        let with_jobs: HashSet<&str> = inner
            .jobs
            .values()
            .map(|j| j.document_id.as_str())
            .collect();
        let mut docs: Vec<Document> = inner
            .documents
            .values()
            .filter(|d| {
                d.status == DocumentStatus::Failed
                    && d.error.as_deref().is_some_and(error_looks_like_timeout)
                    && !with_jobs.contains(d.id.as_str())
            })
            .cloned()
            .collect();
        docs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        docs.truncate(limit);
        Ok(docs)
    }

    async fn insert_chunks(&self, chunks: Vec<Chunk>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for chunk in chunks {
            inner.chunks.insert(chunk.id.clone(), chunk);
        }
        Ok(())
    }

    async fn chunks_for_document(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        let inner = self.inner.lock().await;
        let chunks = inner
            .chunks
            .values()
            .filter(|c| c.document_id == doc_id)
            .cloned()
            .collect();
        Ok(oldest_first_chunks(chunks))
    }

    async fn pending_chunks(&self, limit: usize) -> Result<Vec<Chunk>> {
        let inner = self.inner.lock().await;
        let pending = inner
            .chunks
            .values()
            .filter(|c| c.status == ChunkStatus::Pending)
            .cloned()
            .collect();
        let mut pending = oldest_first_chunks(pending);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn claim_chunk(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.chunks.get_mut(id) {
            Some(chunk) if chunk.status == ChunkStatus::Pending => {
                chunk.status = ChunkStatus::Processing;
                chunk.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_chunk(&self, id: &str, vector: Vec<f32>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(chunk) = inner.chunks.get_mut(id) {
            chunk.status = ChunkStatus::Ready;
            chunk.vector = Some(vector);
            chunk.error = None;
            chunk.embedded_at = Some(Utc::now());
            chunk.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn fail_chunk(&self, id: &str, error: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(chunk) = inner.chunks.get_mut(id) {
            chunk.status = ChunkStatus::Failed;
            chunk.error = Some(error.to_string());
            chunk.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reset_chunk(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.chunks.get_mut(id) {
            Some(chunk) if chunk.status == ChunkStatus::Failed => {
                chunk.status = ChunkStatus::Pending;
                chunk.error = None;
                chunk.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_chunks(&self, doc_id: &str, kind: PipelineKind) -> Result<usize> {
        let inner = self.inner.lock().await;
        Ok(inner
            .chunks
            .values()
            .filter(|c| c.document_id == doc_id && c.pipeline == kind)
            .count())
    }

    async fn count_unready_chunks(&self, doc_id: &str) -> Result<usize> {
        let inner = self.inner.lock().await;
        Ok(inner
            .chunks
            .values()
            .filter(|c| c.document_id == doc_id && c.status != ChunkStatus::Ready)
            .count())
    }

    async fn failed_chunks(&self, idle_since: DateTime<Utc>, limit: usize) -> Result<Vec<Chunk>> {
        let inner = self.inner.lock().await;
        let failed = inner
            .chunks
            .values()
            .filter(|c| c.status == ChunkStatus::Failed && c.updated_at < idle_since)
            .cloned()
            .collect();
        let mut failed = oldest_first_chunks(failed);
        failed.truncate(limit);
        Ok(failed)
    }

    async fn insert_job(&self, job: ProcessingJob) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn job(&self, id: &str) -> Result<Option<ProcessingJob>> {
        Ok(self.inner.lock().await.jobs.get(id).cloned())
    }

    async fn jobs_for_document(&self, doc_id: &str) -> Result<Vec<ProcessingJob>> {
        let inner = self.inner.lock().await;
        let jobs = inner
            .jobs
            .values()
            .filter(|j| j.document_id == doc_id)
            .cloned()
            .collect();
        Ok(oldest_first_jobs(jobs))
    }

    async fn delete_jobs_for_document(&self, doc_id: &str) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let before = inner.jobs.len();
        inner.jobs.retain(|_, j| j.document_id != doc_id);
        Ok(before - inner.jobs.len())
    }

    async fn pending_jobs(&self, limit: usize, max_retries: u32) -> Result<Vec<ProcessingJob>> {
        let inner = self.inner.lock().await;
        let pending = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.retry_count < max_retries)
            .cloned()
            .collect();
        let mut pending = oldest_first_jobs(pending);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn claim_job(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Processing;
                job.started_at = Some(Utc::now());
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_job(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(id) {
            job.status = JobStatus::Completed;
            job.error = None;
            job.completed_at = Some(Utc::now());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn requeue_job(&self, id: &str, retry_count: u32, error: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(id) {
            job.status = JobStatus::Pending;
            job.retry_count = retry_count;
            job.error = error.map(|e| e.to_string());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn fail_job(&self, id: &str, retry_count: u32, error: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(id) {
            job.status = JobStatus::Failed;
            job.retry_count = retry_count;
            job.error = Some(error.to_string());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn stale_processing_jobs(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProcessingJob>> {
        let inner = self.inner.lock().await;
        let stale = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing && j.updated_at < older_than)
            .cloned()
            .collect();
        let mut stale = oldest_first_jobs(stale);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn recoverable_failed_jobs(
        &self,
        max_retries: u32,
        idle_since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProcessingJob>> {
        let inner = self.inner.lock().await;
        let failed = inner
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Failed
                    && j.retry_count < max_retries
                    && j.updated_at < idle_since
            })
            .cloned()
            .collect();
        let mut failed = oldest_first_jobs(failed);
        failed.truncate(limit);
        Ok(failed)
    }

    async fn agent_exists(&self, agent_id: &str) -> Result<bool> {
        Ok(self.inner.lock().await.agents.contains(agent_id))
    }

    async fn link_documents_to_agent(&self, agent_id: &str, doc_ids: &[String]) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let links = inner.links.entry(agent_id.to_string()).or_default();
        for id in doc_ids {
            links.insert(id.clone());
        }
        Ok(doc_ids.len())
    }

    async fn append_audit(&self, record: AuditRecord) -> Result<()> {
        self.inner.lock().await.audits.push(record);
        Ok(())
    }

    async fn audits(&self, kind: &str) -> Result<Vec<AuditRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .audits
            .iter()
            .filter(|a| a.kind == kind)
            .cloned()
            .collect())
    }
}

/// In-memory [`ObjectStore`] with optional fault injection.
#[derive(Default)]
pub struct MemoryObjects {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    /// How many upcoming `put` calls should fail.
    failing_puts: AtomicU32,
}

impl MemoryObjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` uploads fail. Fault injection for backoff tests.
    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjects {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let remaining = self.failing_puts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_puts.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("injected upload failure for {key}");
        }
        self.blobs.lock().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().await.get(key).cloned())
    }
}

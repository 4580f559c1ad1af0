//! Persistent record types shared across the pipeline stages.
//!
//! All mutation of these records goes through the [`crate::store::DocumentStore`]
//! trait; the structs here are plain data. Status enums serialize as
//! snake_case so rows round-trip through JSON-speaking stores unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::PipelineKind;

/// Lifecycle status of an ingested document.
///
/// `Ready` is only reachable once every chunk is `Ready` and every job is
/// `Completed`; `Failed` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Created,
    Splitting,
    Ingested,
    Chunked,
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    /// Whether the pipeline considers this document finished (success or not).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

/// Embedding status of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

/// Status of a queued unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Which stage handler a job is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    /// Extract text from a stored artifact and register its chunks.
    Extract,
    /// Embed every pending chunk of one document.
    EmbedDocument,
}

/// One ingested source artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub name: String,
    /// Object-store key of the source content.
    pub storage_ref: String,
    pub size_bytes: u64,
    /// Length of the extracted text, once known.
    pub text_len: Option<usize>,
    pub status: DocumentStatus,
    pub error: Option<String>,
    pub pipeline: PipelineKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One unit of embeddable text derived from a document.
///
/// Content is immutable after creation; only status, vector, and error
/// transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// Position within the document, 0-indexed.
    pub index: usize,
    pub content: String,
    pub status: ChunkStatus,
    /// Present iff `status == Ready`.
    pub vector: Option<Vec<f32>>,
    pub error: Option<String>,
    pub embedded_at: Option<DateTime<Utc>>,
    pub pipeline: PipelineKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One unit of page-range or file-range work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: String,
    pub document_id: String,
    /// Window ordinal, 0-indexed.
    pub index: usize,
    pub stage: JobStage,
    /// Object-store key of this job's input artifact.
    pub input_ref: String,
    /// First page covered, 1-indexed inclusive. None for non-windowed jobs.
    pub page_start: Option<usize>,
    /// Last page covered, 1-indexed inclusive.
    pub page_end: Option<usize>,
    pub status: JobStatus,
    pub retry_count: u32,
    pub error: Option<String>,
    pub pipeline: PipelineKind,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only operator-visibility record. Never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    /// Record category, e.g. "reconcile" or "bulk_assign".
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

//! Core library for docflow, a document ingestion and knowledge-sync
//! pipeline.
//!
//! Uploaded artifacts are split into page windows, extracted into text,
//! chunked, embedded, and finally assigned to agents in bulk. All stages are
//! stateless passes coordinated through conditional status transitions in
//! the [`store::DocumentStore`], so any number of concurrent invocations can
//! safely share one row set.
//!
//! - [`chunker`] - deterministic overlapping text windows
//! - [`jobs`] - the queue processor, stage handlers, reconciler, and bulk
//!   assigner
//! - [`lifecycle`] - document creation and status orchestration
//! - [`embeddings`] - provider seam plus HTTP and mock implementations
//! - [`store`] - storage traits and the in-memory implementation

pub mod chunker;
pub mod config;
pub mod embeddings;
pub mod extract;
pub mod jobs;
pub mod lifecycle;
pub mod model;
pub mod pipeline;
pub mod store;

pub use config::PipelineConfig;
pub use lifecycle::Orchestrator;
pub use pipeline::PipelineKind;

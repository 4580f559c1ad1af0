//! Bulk agent assignment.
//!
//! Linking a large document set to an agent can take longer than a request
//! should block, so `assign` validates, acknowledges, and hands the actual
//! syncing to a detached task. Per-batch failures never abort the run; they
//! are counted and surfaced through the `bulk_assign` audit record instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::PipelineConfig;
use crate::model::{AuditRecord, Document};
use crate::pipeline::PipelineKind;
use crate::store::DocumentStore;

/// Pushes one batch of documents into an agent's knowledge set.
#[async_trait]
pub trait AgentSyncHandler: Send + Sync {
    async fn sync_batch(&self, agent_id: &str, documents: &[Document]) -> Result<()>;
}

/// Sync handler that links documents to the agent directly in the row store.
pub struct DirectLinkSync {
    store: Arc<dyn DocumentStore>,
}

impl DirectLinkSync {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AgentSyncHandler for DirectLinkSync {
    async fn sync_batch(&self, agent_id: &str, documents: &[Document]) -> Result<()> {
        let ids: Vec<String> = documents.iter().map(|d| d.id.clone()).collect();
        self.store.link_documents_to_agent(agent_id, &ids).await?;
        Ok(())
    }
}

/// Immediate acknowledgement returned by [`BulkAssigner::assign`].
///
/// Holds no completion information: the run finishes in the background and
/// reports through the audit trail.
#[derive(Debug, Clone)]
pub struct AssignAccepted {
    pub run_id: String,
    pub document_count: usize,
}

/// Validates an assignment request and dispatches it as a detached run.
pub struct BulkAssigner {
    store: Arc<dyn DocumentStore>,
    handlers: HashMap<PipelineKind, Arc<dyn AgentSyncHandler>>,
    config: PipelineConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BulkAssigner {
    pub fn new(store: Arc<dyn DocumentStore>, config: PipelineConfig) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            config,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register the sync handler for one pipeline variant.
    pub fn with_handler(mut self, kind: PipelineKind, handler: Arc<dyn AgentSyncHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Validate and accept an assignment request.
    ///
    /// Returns as soon as the inputs check out; the sync itself runs in a
    /// spawned task. Bad input (empty set, unknown agent) is rejected here,
    /// synchronously, so the caller never gets an acknowledgement for a run
    /// that cannot start.
    pub async fn assign(&self, agent_id: &str, doc_ids: Vec<String>) -> Result<AssignAccepted> {
        if doc_ids.is_empty() {
            bail!("no documents given to assign");
        }
        if !self.store.agent_exists(agent_id).await? {
            bail!("agent not found: {agent_id}");
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let accepted = AssignAccepted {
            run_id: run_id.clone(),
            document_count: doc_ids.len(),
        };
        tracing::info!(
            run_id = %run_id,
            agent_id,
            documents = doc_ids.len(),
            "Bulk assignment accepted"
        );

        let store = self.store.clone();
        let handlers = self.handlers.clone();
        let batch_size = self.config.assign_batch_size.max(1);
        let agent_id = agent_id.to_string();

        let handle = tokio::spawn(async move {
            run_assignment(store, handlers, batch_size, agent_id, doc_ids, run_id).await;
        });
        self.tasks.lock().unwrap().push(handle);

        Ok(accepted)
    }

    /// Await every in-flight assignment run. Used for graceful shutdown and
    /// by tests; callers on the request path never need it.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn run_assignment(
    store: Arc<dyn DocumentStore>,
    handlers: HashMap<PipelineKind, Arc<dyn AgentSyncHandler>>,
    batch_size: usize,
    agent_id: String,
    doc_ids: Vec<String>,
    run_id: String,
) {
    let mut assigned = 0usize;
    let mut failed = 0usize;

    for batch_ids in doc_ids.chunks(batch_size) {
        // Resolve the rows; ids that no longer exist count as failures and
        // the rest of the batch proceeds.
        let mut by_kind: HashMap<PipelineKind, Vec<Document>> = HashMap::new();
        for id in batch_ids {
            match store.document(id).await {
                Ok(Some(doc)) => by_kind.entry(doc.pipeline).or_default().push(doc),
                Ok(None) => {
                    tracing::warn!(run_id = %run_id, doc_id = %id, "Assigned document not found");
                    failed += 1;
                }
                Err(e) => {
                    tracing::warn!(run_id = %run_id, doc_id = %id, error = %format!("{e:#}"), "Document lookup failed");
                    failed += 1;
                }
            }
        }

        for (kind, docs) in by_kind {
            let Some(handler) = handlers.get(&kind) else {
                tracing::warn!(run_id = %run_id, pipeline = %kind, "No sync handler for pipeline");
                failed += docs.len();
                continue;
            };
            match handler.sync_batch(&agent_id, &docs).await {
                Ok(()) => assigned += docs.len(),
                Err(e) => {
                    tracing::warn!(
                        run_id = %run_id,
                        agent_id = %agent_id,
                        pipeline = %kind,
                        error = %format!("{e:#}"),
                        "Sync batch failed"
                    );
                    failed += docs.len();
                }
            }
        }
    }

    tracing::info!(run_id = %run_id, agent_id = %agent_id, assigned, failed, "Bulk assignment finished");

    let audit = AuditRecord::new(
        "bulk_assign",
        serde_json::json!({
            "run_id": run_id,
            "agent_id": agent_id,
            "assigned": assigned,
            "failed": failed,
        }),
    );
    if let Err(e) = store.append_audit(audit).await {
        tracing::error!(run_id = %run_id, error = %format!("{e:#}"), "Failed to record assignment audit");
    }
}

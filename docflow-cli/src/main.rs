//! Headless runner for the docflow pipeline.
//!
//! `demo` pushes local files through the full in-memory pipeline end to end;
//! `sweep` runs the recurring queue-drain and reconciliation passes until
//! interrupted, the way a deployed scheduler would invoke them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use docflow_core::embeddings::MockProvider;
use docflow_core::extract::PlainTextExtractor;
use docflow_core::jobs::{
    EmbedWorker, ExtractHandler, PageSource, QueueProcessor, Reconciler, Splitter,
};
use docflow_core::store::{DocumentStore, MemoryObjects, MemoryStore, ObjectStore};
use docflow_core::{Orchestrator, PipelineConfig, PipelineKind};

#[derive(Parser, Debug)]
#[command(name = "docflow")]
#[command(about = "Document ingestion and knowledge-sync pipeline")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run local text files through the whole pipeline and print the result
    Demo {
        /// Files to ingest
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Run the recurring queue and reconciliation sweeps until Ctrl+C
    Sweep {
        /// Seconds between queue drains
        #[arg(long, default_value_t = 5)]
        queue_interval: u64,
        /// Seconds between reconciliation passes
        #[arg(long, default_value_t = 60)]
        reconcile_interval: u64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("docflow=info".parse().unwrap()),
        )
        .init();

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(async {
        match args.command {
            Command::Demo { files } => demo(files).await,
            Command::Sweep {
                queue_interval,
                reconcile_interval,
            } => sweep(queue_interval, reconcile_interval).await,
        }
    })
}

/// One stack of pipeline components over the in-memory stores.
struct Stack {
    store: Arc<MemoryStore>,
    objects: Arc<MemoryObjects>,
    orchestrator: Orchestrator,
    queue: Arc<QueueProcessor>,
    embedder: EmbedWorker,
    reconciler: Reconciler,
    config: PipelineConfig,
}

fn build_stack() -> Stack {
    let config = PipelineConfig::load_or_default();
    let store = Arc::new(MemoryStore::new());
    let objects = Arc::new(MemoryObjects::new());
    let orchestrator = Orchestrator::new(store.clone() as Arc<dyn DocumentStore>);

    let mut queue = QueueProcessor::new(store.clone(), config.clone());
    queue.register(Arc::new(ExtractHandler::new(
        objects.clone(),
        Arc::new(PlainTextExtractor),
        orchestrator.clone(),
        config.clone(),
    )));

    Stack {
        embedder: EmbedWorker::new(store.clone(), Arc::new(MockProvider::new(64)), config.clone()),
        reconciler: Reconciler::new(store.clone(), config.clone()),
        queue: Arc::new(queue),
        store,
        objects,
        orchestrator,
        config,
    }
}

/// Treats one text file as a single-page source.
struct WholeFile(Vec<u8>);

impl PageSource for WholeFile {
    fn page_count(&self) -> usize {
        1
    }

    fn window_bytes(&self, _start: usize, _end: usize) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

async fn demo(files: Vec<PathBuf>) -> Result<()> {
    let stack = build_stack();
    let splitter = Splitter::new(
        stack.orchestrator.clone(),
        stack.objects.clone(),
        stack.config.clone(),
    );

    for path in &files {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let key = format!("uploads/{name}");
        stack.objects.put(&key, bytes.clone()).await?;

        let doc = stack
            .orchestrator
            .create_document(&name, &key, bytes.len() as u64, None, PipelineKind::Primary)
            .await?;
        splitter.split_document(&doc, &WholeFile(bytes)).await?;
    }

    // Drive the pipeline the way the periodic sweeps would, until every
    // document settles.
    for _ in 0..100 {
        stack.queue.process_batch(10).await?;
        stack.embedder.process_pending().await?;
        stack.reconciler.run().await?;

        let docs = stack.store.all_documents().await;
        if docs.iter().all(|d| d.status.is_terminal()) {
            break;
        }
    }

    for doc in stack.store.all_documents().await {
        let chunks = stack.store.chunks_for_document(&doc.id).await?;
        println!(
            "{}\t{}\t{} chunks\t{}",
            doc.name,
            format!("{:?}", doc.status).to_lowercase(),
            chunks.len(),
            doc.error.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn sweep(queue_interval: u64, reconcile_interval: u64) -> Result<()> {
    let stack = build_stack();
    tracing::info!(queue_interval, reconcile_interval, "Sweep scheduler running. Press Ctrl+C to stop.");

    let shutdown = CancellationToken::new();

    let queue = stack.queue.clone();
    let queue_shutdown = shutdown.clone();
    let queue_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(queue_interval));
        loop {
            tokio::select! {
                _ = queue_shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = queue.process_batch(10).await {
                        tracing::error!(error = %format!("{e:#}"), "Queue drain failed");
                    }
                }
            }
        }
    });

    let reconciler = stack.reconciler;
    let reconcile_shutdown = shutdown.clone();
    let reconcile_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(reconcile_interval));
        loop {
            tokio::select! {
                _ = reconcile_shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = reconciler.run().await {
                        tracing::error!(error = %format!("{e:#}"), "Reconciliation failed");
                    }
                }
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("Shutting down...");

    shutdown.cancel();
    let _ = tokio::join!(queue_task, reconcile_task);
    Ok(())
}

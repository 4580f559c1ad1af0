//! Background processing stages.
//!
//! Everything here runs as short, independently invoked passes over shared
//! rows; no stage holds state between invocations and any two invocations
//! may overlap. The flow for a windowed source:
//!
//! ```text
//!   upload -> split ----> queue (extract) ----> chunks -> embed -> ready
//!               |            ^                              |
//!               | windows    | requeue / recover            v
//!               v            |                        agent assignment
//!          object store   reconciler
//! ```
//!
//! The [`queue::QueueProcessor`] drives [`queue::JobHandler`]s with bounded
//! retries; the [`reconcile::Reconciler`] sweeps up whatever a crashed or
//! stalled invocation left behind.

pub mod assign;
pub mod embed;
pub mod extract;
pub mod queue;
pub mod reconcile;
pub mod split;

pub use assign::{AgentSyncHandler, AssignAccepted, BulkAssigner, DirectLinkSync};
pub use embed::{EmbedDocumentHandler, EmbedReport, EmbedWorker};
pub use extract::ExtractHandler;
pub use queue::{HandlerOutput, JobHandler, QueueProcessor, QueueReport};
pub use reconcile::{ReconcileReport, Reconciler};
pub use split::{page_windows, PageSource, Splitter};

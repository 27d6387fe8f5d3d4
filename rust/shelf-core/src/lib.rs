//! Job execution core for the shelf book-digitization backend.
//!
//! Turns long-running, heterogeneous book-processing jobs (OCR, LLM
//! extraction, audio synthesis) into a stream of routable work units and
//! executes them across per-provider worker pools under rate limits, retry
//! policies, and durable state in an external document store.
//!
//! The HTTP surface, CLI, configuration-file parsing, and provider HTTP
//! client bodies are external collaborators; this crate pins only the
//! interfaces it depends on (`DocumentStoreClient`, `ProviderClient`).

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod cancellation;
pub mod config;
pub mod context;
pub mod document_store;
pub mod error;
pub mod jobs;
pub mod model;
pub mod observability;
pub mod pool;
pub mod provider;
pub mod rate_limiter;
pub mod records;
pub mod registry;
pub mod scheduler;
pub mod signals;
pub mod sink;

pub use cancellation::CancelToken;
pub use context::ServiceContext;
pub use error::{ShelfError, ShelfResult};
pub use model::{JobId, JobRecord, JobStatus, WorkResult, WorkUnit};
pub use scheduler::Scheduler;
pub use sink::WriteSink;

use std::sync::Arc;

/// Brings up the core against an already-constructed `ServiceContext` and
/// `Scheduler`: resumes any `running` jobs left over from a prior process,
/// then runs the scheduler's result loop until `cancel` fires. Registration
/// of pools and job factories is the caller's responsibility (it happens
/// before this is called) because the set of bound providers is assembled
/// by the binary wiring layer, not by the library.
pub async fn run(scheduler: Arc<Scheduler>, cancel: CancelToken) -> ShelfResult<()> {
    let resumed = scheduler.resume().await?;
    tracing::info!(resumed, "resume scan complete");
    scheduler.start(cancel).await;
    Ok(())
}

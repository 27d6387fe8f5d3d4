//! Jobs (spec.md §4.5): opaque, resumable producers of work units. The
//! scheduler only ever sees the capability set in `Job`; concrete job
//! types live in the sibling modules.

pub mod audio_generation;
pub mod book_processing;
pub mod toc_finalize;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::context::ServiceContext;
use crate::model::{JobId, WorkResult, WorkUnit};

/// A job's attribute-map status output, merged with `pending_units` by the
/// scheduler's `Status` operation.
pub type JobStatusMap = HashMap<String, serde_json::Value>;

/// Reconstructs a job from its durable id and metadata on resume
/// (spec.md §4.1 `Register-factory`).
pub type JobFactory = std::sync::Arc<dyn Fn(JobId, HashMap<String, serde_json::Value>) -> Box<dyn Job> + Send + Sync>;

/// The capability set the scheduler drives (spec.md §3). `start` runs
/// exactly once; `on_complete` runs once per result. Both must return
/// promptly — any I/O they need goes through `ctx.sink` or `ctx.document_store`
/// without blocking the scheduler's single result-dispatch task any longer
/// than that one call takes (spec.md §5).
#[async_trait]
pub trait Job: Send + Sync {
    /// Stable type tag used to find this job's factory on resume.
    fn job_type(&self) -> &'static str;

    fn set_record_id(&mut self, id: JobId);

    fn record_id(&self) -> JobId;

    /// Fields needed to reconstruct this job via its factory on resume
    /// (spec.md §4.1). Persisted verbatim into the durable record's
    /// `metadata` map at submit time.
    fn metadata(&self) -> HashMap<String, serde_json::Value>;

    /// Emits the initial batch of work units. On resume, must only emit
    /// units for items whose durable artifact is missing (idempotency
    /// rule, spec.md §4.5, §8 law).
    async fn start(&mut self, ctx: &ServiceContext) -> Vec<WorkUnit>;

    /// Reacts to one result, optionally emitting follow-up units.
    async fn on_complete(&mut self, ctx: &ServiceContext, result: WorkResult) -> Vec<WorkUnit>;

    /// True once no further stages can be unlocked by new results. The
    /// scheduler completes the job once this is true AND its pending-unit
    /// count has reached zero.
    fn done(&self) -> bool;

    fn status(&self) -> JobStatusMap;
}

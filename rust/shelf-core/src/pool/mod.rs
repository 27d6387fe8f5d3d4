//! Worker pools (spec.md §4.2, §4.3): the provider variant (dispatcher +
//! rate-limited workers) and the CPU variant (workers only, no rate
//! budget). Both share the same input-queue-plus-bounded-worker-count
//! shape and the same `WorkerPool` capability set.

pub mod cpu_pool;
pub mod provider_pool;

use async_trait::async_trait;

use crate::cancellation::CancelToken;
use crate::model::{WorkKind, WorkResult, WorkUnit};
use crate::rate_limiter::RateLimiterSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    QueueFull,
}

#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub name: String,
    pub kind: WorkKind,
    pub workers: usize,
    pub in_flight: usize,
    pub queue_depth: usize,
    pub rate_limiter: Option<RateLimiterSnapshot>,
}

/// Capability set a worker pool exposes to the scheduler (spec.md §3).
/// `init_results_channel` always runs before `start`, per the scheduler's
/// registration contract.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> WorkKind;
    fn init_results_channel(&self, tx: tokio::sync::mpsc::Sender<WorkResult>);
    async fn start(&self, cancel: CancelToken);
    fn submit(&self, unit: WorkUnit) -> SubmitOutcome;
    fn status(&self) -> PoolStatus;
}

//! CPU pool: identical queue/worker shape to the provider pool, but with
//! no dispatcher and no rate limiter — workers pull directly from the
//! input queue (spec.md §4.3). Used for compute-bound steps such as
//! audio-segment concatenation that must bound concurrency but do not
//! contend for a remote rate budget.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cancellation::CancelToken;
use crate::model::{ResultPayload, WorkKind, WorkPayload, WorkResult, WorkUnit};
use crate::pool::{PoolStatus, SubmitOutcome, WorkerPool};

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_WORKERS: usize = 8;

/// A CPU unit's opaque payload is executed by a closure supplied at pool
/// construction time — the concatenation/assembly bodies themselves are
/// out of scope (spec.md §1); this pool only bounds their concurrency.
pub type CpuHandler = Arc<dyn Fn(serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync>;

pub struct CpuPool {
    name: String,
    handler: CpuHandler,
    workers: usize,
    input_tx: mpsc::Sender<WorkUnit>,
    input_rx: Mutex<Option<mpsc::Receiver<WorkUnit>>>,
    results_tx: Mutex<Option<mpsc::Sender<WorkResult>>>,
    queue_depth: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
}

impl CpuPool {
    pub fn new(name: impl Into<String>, workers: usize, handler: CpuHandler) -> Self {
        let (input_tx, input_rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        Self {
            name: name.into(),
            handler,
            workers: workers.max(1),
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            results_tx: Mutex::new(None),
            queue_depth: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl WorkerPool for CpuPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> WorkKind {
        WorkKind::Cpu
    }

    fn init_results_channel(&self, tx: mpsc::Sender<WorkResult>) {
        *self.results_tx.lock() = Some(tx);
    }

    async fn start(&self, cancel: CancelToken) {
        #[allow(clippy::expect_used)] // scheduler invariant: start() runs at most once per pool
        let input_rx = self.input_rx.lock().take().expect("start called more than once");
        #[allow(clippy::expect_used)] // scheduler invariant: init_results_channel runs before start
        let results_tx = self.results_tx.lock().clone().expect("init_results_channel must run before start");
        let shared_rx = Arc::new(tokio::sync::Mutex::new(input_rx));

        let mut workers = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let shared_rx = shared_rx.clone();
            let results_tx = results_tx.clone();
            let handler = self.handler.clone();
            let queue_depth = self.queue_depth.clone();
            let in_flight = self.in_flight.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let unit = {
                        let mut rx = shared_rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            maybe_unit = rx.recv() => match maybe_unit {
                                Some(u) => u,
                                None => return,
                            },
                        }
                    };
                    queue_depth.fetch_sub(1, Ordering::SeqCst);
                    in_flight.fetch_add(1, Ordering::SeqCst);

                    let result = run_cpu_unit(&unit, &handler);

                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    if results_tx.send(result).await.is_err() {
                        warn!(worker_id, "scheduler results channel closed; dropping result");
                        return;
                    }
                }
            }));
        }

        info!(workers = self.workers, "cpu pool started");
        let _ = futures::future::join_all(workers).await;
    }

    fn submit(&self, unit: WorkUnit) -> SubmitOutcome {
        match self.input_tx.try_send(unit) {
            Ok(()) => {
                self.queue_depth.fetch_add(1, Ordering::SeqCst);
                SubmitOutcome::Accepted
            }
            Err(_) => SubmitOutcome::QueueFull,
        }
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            name: self.name.clone(),
            kind: WorkKind::Cpu,
            workers: self.workers,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            queue_depth: self.queue_depth.load(Ordering::SeqCst),
            rate_limiter: None,
        }
    }
}

fn run_cpu_unit(unit: &WorkUnit, handler: &CpuHandler) -> WorkResult {
    let input = match &unit.payload {
        WorkPayload::Cpu(v) => v.clone(),
        other => {
            return WorkResult::failure(unit, format!("cpu pool received non-cpu payload: {other:?}"));
        }
    };

    match handler(input) {
        Ok(output) => WorkResult {
            unit_id: unit.id.clone(),
            job_id: unit.job_id.clone(),
            success: true,
            error: None,
            payload: ResultPayload::Cpu(output),
            attribution: unit.attribution.clone(),
        },
        Err(e) => WorkResult::failure(unit, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn executes_cpu_units_and_reports_results() {
        let handler: CpuHandler = Arc::new(|v| Ok(serde_json::json!({ "doubled": v["n"].as_i64().unwrap_or(0) * 2 })));
        let pool = CpuPool::new("concat", 2, handler);
        let (tx, mut rx) = mpsc::channel(10);
        pool.init_results_channel(tx);

        let cancel = CancelToken::new();
        let pool = Arc::new(pool);
        let runner = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.start(cancel).await })
        };

        for n in 0..3 {
            let unit = WorkUnit::new("job-1".into(), WorkKind::Cpu, WorkPayload::Cpu(serde_json::json!({ "n": n })));
            assert_eq!(pool.submit(unit), SubmitOutcome::Accepted);
        }

        for _ in 0..3 {
            let result = rx.recv().await.expect("result");
            assert!(result.success);
        }

        cancel.cancel();
        let _ = runner.await;
    }
}

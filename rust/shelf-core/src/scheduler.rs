//! The scheduler (spec.md §4.1): owns job lifecycle, routes work units to
//! pools, funnels results back to their owning job, detects completion,
//! and resumes jobs left `running` on restart.
//!
//! Concurrency model: one result-dispatch task (spawned by `start`)
//! processes results strictly one at a time, so `on_complete` calls never
//! interleave with each other. Registration (`register_pool`,
//! `register_factory`) and `submit`/`resume` may run concurrently with
//! that loop and with each other; all of them go through the single
//! `Mutex<SchedulerState>` that covers the jobs/pending/pools/factories
//! mappings (spec.md §5), and none of them hold that lock across an
//! `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::cancellation::CancelToken;
use crate::context::ServiceContext;
use crate::document_store::Filter;
use crate::error::{ShelfError, ShelfResult};
use crate::jobs::{Job, JobFactory, JobStatusMap};
use crate::model::{JobId, JobRecord, JobStatus, WorkResult, WorkUnit};
use crate::pool::{SubmitOutcome, WorkerPool};

const DEFAULT_RESULTS_CHANNEL_CAPACITY: usize = 1000;

struct SchedulerState {
    pools: Vec<Arc<dyn WorkerPool>>,
    factories: HashMap<String, JobFactory>,
    jobs: HashMap<JobId, Box<dyn Job>>,
    pending: HashMap<JobId, usize>,
}

pub struct Scheduler {
    state: Mutex<SchedulerState>,
    ctx: ServiceContext,
    results_tx: mpsc::Sender<WorkResult>,
    results_rx: Mutex<Option<mpsc::Receiver<WorkResult>>>,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new(ctx: ServiceContext) -> Self {
        Self::with_results_capacity(ctx, DEFAULT_RESULTS_CHANNEL_CAPACITY)
    }

    pub fn with_results_capacity(ctx: ServiceContext, capacity: usize) -> Self {
        let (results_tx, results_rx) = mpsc::channel(capacity);
        Self {
            state: Mutex::new(SchedulerState {
                pools: Vec::new(),
                factories: HashMap::new(),
                jobs: HashMap::new(),
                pending: HashMap::new(),
            }),
            ctx,
            results_tx,
            results_rx: Mutex::new(Some(results_rx)),
            started: AtomicBool::new(false),
        }
    }

    /// Pre-start registration. Duplicate pool names are rejected. The pool
    /// is wired to the shared results channel before it is ever started.
    pub fn register_pool(&self, pool: Arc<dyn WorkerPool>) -> ShelfResult<()> {
        let mut state = self.state.lock();
        if state.pools.iter().any(|p| p.name() == pool.name()) {
            return Err(ShelfError::DuplicateRegistration(pool.name().to_string()));
        }
        pool.init_results_channel(self.results_tx.clone());
        state.pools.push(pool);
        Ok(())
    }

    pub fn register_factory(&self, job_type: impl Into<String>, factory: JobFactory) {
        self.state.lock().factories.insert(job_type.into(), factory);
    }

    /// Creates a durable job record (status `running`), assigns the id,
    /// calls `start`, and routes the initial batch. Returns once `start`
    /// has returned; further progress happens on the result-dispatch task.
    pub async fn submit(&self, mut job: Box<dyn Job>) -> ShelfResult<JobId> {
        let job_type = job.job_type().to_string();
        let metadata = job.metadata();
        let record = JobRecord::new_running(String::new(), job_type.clone(), metadata.clone());

        let id = self
            .ctx
            .document_store
            .create(
                "Job",
                json!({
                    "job_type": record.job_type,
                    "status": "running",
                    "submittedAt": record.submitted_at.to_rfc3339(),
                    "startedAt": record.started_at.map(|t| t.to_rfc3339()),
                    "metadata": metadata,
                }),
            )
            .await
            .map_err(|e| ShelfError::Persistence(e.to_string()))?;

        job.set_record_id(id.clone());
        self.state.lock().pending.insert(id.clone(), 0);

        let units = job.start(&self.ctx).await;

        self.state.lock().jobs.insert(id.clone(), job);
        self.route_and_track(&id, units).await;

        Ok(id)
    }

    /// Lists durable records in `running` status and reconstructs each via
    /// its registered factory, re-emitting only the work still missing
    /// (idempotency rule, spec.md §4.5). Records whose type has no
    /// registered factory are skipped with a warning, status untouched.
    pub async fn resume(&self) -> ShelfResult<usize> {
        let records = self
            .ctx
            .document_store
            .query("Job", &[Filter::eq("status", json!("running"))])
            .await
            .map_err(|e| ShelfError::Persistence(e.to_string()))?;

        let mut resumed = 0usize;
        for doc in records {
            let Some(id) = doc.get("id").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            let job_type = doc.get("job_type").and_then(Value::as_str).unwrap_or_default().to_string();
            let metadata: HashMap<String, Value> = doc
                .get("metadata")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();

            let factory = self.state.lock().factories.get(&job_type).cloned();
            let Some(factory) = factory else {
                warn!(job_type = %job_type, job_id = %id, "no resume factory registered; skipping");
                continue;
            };

            let mut job = factory(id.clone(), metadata);
            job.set_record_id(id.clone());
            self.state.lock().pending.insert(id.clone(), 0);

            let units = job.start(&self.ctx).await;

            self.state.lock().jobs.insert(id.clone(), job);
            self.route_and_track(&id, units).await;
            resumed += 1;
        }

        Ok(resumed)
    }

    /// Launches every registered pool concurrently, then consumes results
    /// until `cancel` fires. Safe to call only once.
    pub async fn start(&self, cancel: CancelToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("scheduler start() called more than once; ignoring");
            return;
        }

        let pools = self.state.lock().pools.clone();
        let mut pool_handles = Vec::with_capacity(pools.len());
        for pool in pools {
            let cancel = cancel.clone();
            pool_handles.push(tokio::spawn(async move { pool.start(cancel).await }));
        }

        #[allow(clippy::expect_used)] // `started` guard above ensures this runs at most once
        let mut results_rx = self.results_rx.lock().take().expect("start called more than once");
        info!(pools = pool_handles.len(), "scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                maybe_result = results_rx.recv() => {
                    match maybe_result {
                        Some(result) => self.handle_result(result).await,
                        None => break,
                    }
                }
            }
        }

        for handle in pool_handles {
            let _ = handle.await;
        }
    }

    pub fn status(&self, job_id: &JobId) -> Option<JobStatusMap> {
        let state = self.state.lock();
        let job = state.jobs.get(job_id)?;
        let mut map = job.status();
        let pending = state.pending.get(job_id).copied().unwrap_or(0);
        map.insert("pending_units".to_string(), json!(pending));
        Some(map)
    }

    /// Decrements the job's pending count, invokes `on_complete`, routes
    /// any new units, and completes the job once `done() && pending == 0`.
    /// Orphan results (job already removed) are logged at warn and
    /// discarded, never panicking (spec.md §8 S4).
    async fn handle_result(&self, result: WorkResult) {
        let job_id = result.job_id.clone();
        let unit_id = result.unit_id.clone();

        let job_opt = {
            let mut state = self.state.lock();
            if let Some(pending) = state.pending.get_mut(&job_id) {
                *pending = pending.saturating_sub(1);
            }
            state.jobs.remove(&job_id)
        };

        let mut job = match job_opt {
            Some(job) => job,
            None => {
                warn!(job_id = %job_id, unit_id = %unit_id, "orphan result discarded");
                return;
            }
        };

        let new_units = job.on_complete(&self.ctx, result).await;
        let done = job.done();

        self.state.lock().jobs.insert(job_id.clone(), job);
        self.route_and_track(&job_id, new_units).await;

        if done {
            let pending_now = self.state.lock().pending.get(&job_id).copied().unwrap_or(0);
            if pending_now == 0 {
                self.complete_job(&job_id).await;
            }
        }
    }

    async fn complete_job(&self, job_id: &JobId) {
        info!(job_id = %job_id, "job complete");
        self.ctx
            .sink
            .send(crate::model::WriteOp::update(
                "Job",
                job_id.clone(),
                json!({ "status": "completed", "endedAt": chrono::Utc::now().to_rfc3339() }),
            ))
            .await;
        self.state.lock().jobs.remove(job_id);
        self.state.lock().pending.remove(job_id);
    }

    /// Stamps the owning job id onto every unit before enqueue (invariant,
    /// spec.md §3), tracks its pending count, and routes it.
    async fn route_and_track(&self, job_id: &JobId, units: Vec<WorkUnit>) {
        for mut unit in units {
            unit.job_id = job_id.clone();
            *self.state.lock().pending.entry(job_id.clone()).or_insert(0) += 1;
            self.route_unit(unit).await;
        }
    }

    fn select_pool(&self, unit: &WorkUnit) -> Option<Arc<dyn WorkerPool>> {
        let state = self.state.lock();
        match &unit.provider {
            Some(name) => state.pools.iter().find(|p| p.name() == name && p.kind() == unit.kind).cloned(),
            None => state.pools.iter().find(|p| p.kind() == unit.kind).cloned(),
        }
    }

    /// A unit with a provider selector is routed only to a same-kind pool
    /// of that name; a unit without one goes to the first registered pool
    /// of matching kind. Any routing failure or a `QueueFull` submit
    /// produces a synthetic failure result fed back through the normal
    /// result path, never an error return (spec.md §4.1, §7).
    async fn route_unit(&self, unit: WorkUnit) {
        match self.select_pool(&unit) {
            None => {
                let result = WorkResult::failure(
                    &unit,
                    format!("no pool matches kind={:?} provider={:?}", unit.kind, unit.provider),
                );
                self.emit_synthetic(result).await;
            }
            Some(pool) => {
                let fallback = unit.clone();
                let pool_name = pool.name().to_string();
                match pool.submit(unit) {
                    SubmitOutcome::Accepted => {}
                    SubmitOutcome::QueueFull => {
                        error!(pool = %pool_name, unit_id = %fallback.id, "pool queue full");
                        let result = WorkResult::failure(&fallback, format!("pool {pool_name} queue full"));
                        self.emit_synthetic(result).await;
                    }
                }
            }
        }
    }

    async fn emit_synthetic(&self, result: WorkResult) {
        if self.results_tx.send(result).await.is_err() {
            warn!("results channel closed; dropping synthetic result");
        }
    }
}

//! End-to-end scenario tests exercising the full scheduler/pool/sink graph
//! from outside the crate, using the `test-support` feature's in-memory
//! document store and hand-written fake provider clients in place of real
//! network collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use shelf_core::cancellation::CancelToken;
use shelf_core::context::ServiceContext;
use shelf_core::document_store::fake::FakeDocumentStore;
use shelf_core::document_store::DocumentStoreClient;
use shelf_core::jobs::book_processing::BookProcessingJob;
use shelf_core::jobs::{Job, JobFactory, JobStatusMap};
use shelf_core::model::{ChatMessage, ChatRequest, JobId, WorkKind, WorkPayload, WorkResult, WorkUnit};
use shelf_core::pool::provider_pool::{ProviderPool, ProviderPoolConfig};
use shelf_core::pool::{PoolStatus, SubmitOutcome, WorkerPool};
use shelf_core::provider::{ProviderClient, ProviderError, ProviderErrorKind, ProviderResult};
use shelf_core::rate_limiter::RateLimiter;
use shelf_core::registry::ConfigStore;
use shelf_core::scheduler::Scheduler;
use shelf_core::sink::{SinkConfig, WriteSink};

fn test_ctx(store: Arc<FakeDocumentStore>) -> ServiceContext {
    let cancel = CancelToken::new();
    let store: Arc<dyn DocumentStoreClient> = store;
    let (sink, _handle) = WriteSink::spawn(store.clone(), SinkConfig::default(), cancel.clone());
    ServiceContext::new(store, sink, Arc::new(ConfigStore::new_empty()), cancel)
}

fn chat_unit() -> WorkUnit {
    WorkUnit::new(
        "job-1".into(),
        WorkKind::Llm,
        WorkPayload::Chat(ChatRequest { system_prompt: None, messages: vec![ChatMessage { role: "user".into(), content: "hi".into() }], tools: None }),
    )
}

/// S1 — rate limit accuracy: draining 50 instantly-available tokens at
/// rps=5 should take roughly 10 seconds, not faster and not much slower.
#[tokio::test(start_paused = true)]
async fn s1_rate_limit_accuracy() {
    let limiter = RateLimiter::new(5.0);
    let cancel = CancelToken::new();

    let start = tokio::time::Instant::now();
    for _ in 0..50 {
        limiter.wait(&cancel).await.unwrap();
    }
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(9_800), "drained too fast: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(10_400), "drained too slow: {elapsed:?}");
}

struct RateLimited429Client {
    calls: AtomicU32,
}

#[async_trait]
impl ProviderClient for RateLimited429Client {
    fn name(&self) -> &str {
        "rate-limited"
    }
    fn requests_per_second(&self) -> f64 {
        1000.0
    }
    fn max_concurrency(&self) -> usize {
        1
    }
    fn max_retries(&self) -> u32 {
        5
    }

    async fn chat(&self, _req: &ChatRequest) -> ProviderResult<shelf_core::model::ChatResult> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            Err(ProviderError { kind: ProviderErrorKind::RateLimited { retry_after: Some(Duration::from_secs(2)) }, message: "slow down".into() })
        } else {
            Ok(shelf_core::model::ChatResult { text: "ok".into(), input_tokens: 1, output_tokens: 1, cost_usd: 0.0, tool_calls: vec![] })
        }
    }
}

/// S2 — 429 cooldown honored: a provider returning `Retry-After: 2s` on the
/// first attempt must not be retried sooner than that, and the pool's next
/// queued unit must wait out the same cooldown before its own first call.
#[tokio::test(start_paused = true)]
async fn s2_429_cooldown_honored() {
    let store = Arc::new(FakeDocumentStore::new());
    let cancel = CancelToken::new();
    let (sink, _sink_handle) = WriteSink::spawn(store.clone() as Arc<dyn DocumentStoreClient>, SinkConfig::default(), cancel.clone());

    let client = Arc::new(RateLimited429Client { calls: AtomicU32::new(0) });
    let config = ProviderPoolConfig { queue_capacity: 16, max_concurrency: 1, max_retries: 5, requests_per_second: 1000.0 };
    let pool = Arc::new(ProviderPool::new(WorkKind::Llm, client.clone(), sink, config));

    let (results_tx, mut results_rx) = tokio::sync::mpsc::channel::<WorkResult>(16);
    pool.init_results_channel(results_tx);

    let pool_for_start = pool.clone();
    let cancel_for_start = cancel.clone();
    let pool_task = tokio::spawn(async move { pool_for_start.start(cancel_for_start).await });

    let start = tokio::time::Instant::now();
    assert_eq!(pool.submit(chat_unit()), SubmitOutcome::Accepted);

    let result = results_rx.recv().await.expect("result channel closed");
    let elapsed = start.elapsed();

    assert!(result.success);
    assert_eq!(client.calls.load(Ordering::SeqCst), 2, "expected exactly two attempts");
    assert!(elapsed >= Duration::from_secs(2), "retry happened before the cooldown elapsed: {elapsed:?}");

    cancel.cancel();
    let _ = pool_task.await;
}

struct OrphanEmittingPool {
    results_tx: std::sync::Mutex<Option<tokio::sync::mpsc::Sender<WorkResult>>>,
}

#[async_trait]
impl WorkerPool for OrphanEmittingPool {
    fn name(&self) -> &str {
        "orphan"
    }
    fn kind(&self) -> WorkKind {
        WorkKind::Cpu
    }
    fn init_results_channel(&self, tx: tokio::sync::mpsc::Sender<WorkResult>) {
        *self.results_tx.lock().unwrap() = Some(tx);
    }
    async fn start(&self, cancel: CancelToken) {
        let tx = self.results_tx.lock().unwrap().clone().expect("init_results_channel must run before start");
        let unit = WorkUnit::new("never-submitted-job".to_string(), WorkKind::Cpu, WorkPayload::Cpu(json!({})));
        let _ = tx.send(WorkResult::failure(&unit, "late result after completion")).await;
        let _ = tx.send(WorkResult::failure(&unit, "second late result")).await;
        cancel.cancelled().await;
    }
    fn submit(&self, _unit: WorkUnit) -> SubmitOutcome {
        SubmitOutcome::Accepted
    }
    fn status(&self) -> PoolStatus {
        PoolStatus { name: self.name().to_string(), kind: self.kind(), workers: 0, in_flight: 0, queue_depth: 0, rate_limiter: None }
    }
}

/// S4 — orphan result safety: two results arrive for a job the scheduler
/// never tracked (simulating late arrivals after completion). They must be
/// logged and discarded, never panic, and must not wedge the result loop.
#[tokio::test]
async fn s4_orphan_result_safety() {
    let store = Arc::new(FakeDocumentStore::new());
    let ctx = test_ctx(store);
    let scheduler = Arc::new(Scheduler::new(ctx));

    let pool = Arc::new(OrphanEmittingPool { results_tx: std::sync::Mutex::new(None) });
    scheduler.register_pool(pool as Arc<dyn WorkerPool>).unwrap();

    let cancel = CancelToken::new();
    let scheduler_for_start = scheduler.clone();
    let cancel_for_start = cancel.clone();
    let handle = tokio::spawn(async move { scheduler_for_start.start(cancel_for_start).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    // No panic unwinding out of the join means the orphan results were
    // discarded rather than causing the result-dispatch task to abort.
    handle.await.expect("scheduler task panicked on orphan result");
}

struct RecordingJob {
    id: JobId,
    done: bool,
}

#[async_trait]
impl Job for RecordingJob {
    fn job_type(&self) -> &'static str {
        "recording"
    }
    fn set_record_id(&mut self, id: JobId) {
        self.id = id;
    }
    fn record_id(&self) -> JobId {
        self.id.clone()
    }
    fn metadata(&self) -> HashMap<String, Value> {
        HashMap::new()
    }
    async fn start(&mut self, _ctx: &ServiceContext) -> Vec<WorkUnit> {
        vec![]
    }
    async fn on_complete(&mut self, _ctx: &ServiceContext, _result: WorkResult) -> Vec<WorkUnit> {
        vec![]
    }
    fn done(&self) -> bool {
        self.done
    }
    fn status(&self) -> JobStatusMap {
        JobStatusMap::new()
    }
}

fn recording_factory() -> JobFactory {
    Arc::new(|id: JobId, _metadata: HashMap<String, Value>| Box::new(RecordingJob { id, done: false }) as Box<dyn Job>)
}

/// S3 — resume idempotence, exercised at the scheduler boundary: a job
/// record left `running` in the store is reconstructed and started exactly
/// once via its registered factory.
#[tokio::test]
async fn s3_resume_reconstructs_running_jobs() {
    let store = Arc::new(FakeDocumentStore::new());
    let job_id = store
        .create("Job", json!({ "job_type": "recording", "status": "running", "submittedAt": "2026-01-01T00:00:00Z", "metadata": {} }))
        .await
        .unwrap();

    let ctx = test_ctx(store);
    let scheduler = Scheduler::new(ctx);
    scheduler.register_factory("recording", recording_factory());

    let resumed = scheduler.resume().await.unwrap();
    assert_eq!(resumed, 1);
    assert!(scheduler.status(&job_id).is_some());
}

struct RecordingPool {
    kind: WorkKind,
    received: std::sync::Mutex<Vec<WorkUnit>>,
}

#[async_trait]
impl WorkerPool for RecordingPool {
    fn name(&self) -> &str {
        "recording-pool"
    }
    fn kind(&self) -> WorkKind {
        self.kind
    }
    fn init_results_channel(&self, _tx: tokio::sync::mpsc::Sender<WorkResult>) {}
    async fn start(&self, cancel: CancelToken) {
        cancel.cancelled().await;
    }
    fn submit(&self, unit: WorkUnit) -> SubmitOutcome {
        self.received.lock().unwrap().push(unit);
        SubmitOutcome::Accepted
    }
    fn status(&self) -> PoolStatus {
        PoolStatus { name: self.name().to_string(), kind: self.kind(), workers: 0, in_flight: 0, queue_depth: self.received.lock().unwrap().len(), rate_limiter: None }
    }
}

/// S3 — resume idempotence against a real job: a book-processing job
/// `submit`s through one scheduler, the scheduler is dropped (simulating a
/// restart), and a fresh scheduler built on the same store `resume`s it.
/// Only the 5 still-missing pages' OCR units must be re-emitted.
#[tokio::test]
async fn s3_resume_reconstructs_book_processing_job_from_persisted_metadata() {
    let store = Arc::new(FakeDocumentStore::new());
    for i in 0..10 {
        let mut doc = json!({ "book_id": "book-1", "page_number": i });
        if i < 5 {
            doc["ocr_text"] = json!("already done");
        }
        store.create("Page", doc).await.unwrap();
    }

    let job_id = {
        let ctx = test_ctx(store.clone());
        let scheduler = Scheduler::new(ctx);
        let pool = Arc::new(RecordingPool { kind: WorkKind::Ocr, received: std::sync::Mutex::new(Vec::new()) });
        scheduler.register_pool(pool as Arc<dyn WorkerPool>).unwrap();

        let job = BookProcessingJob::new("book-1", None, None);
        let job_id = scheduler.submit(Box::new(job)).await.unwrap();

        // scheduler, and the in-memory job it holds, are dropped here.
        job_id
    };

    let stored = store.get("Job", &job_id).await.unwrap().expect("job record persisted");
    let metadata = stored.get("metadata").cloned().unwrap_or_default();
    assert_eq!(metadata.get("book_id"), Some(&json!("book-1")), "book_id must survive the round trip for resume to work");

    let ctx = test_ctx(store);
    let scheduler = Scheduler::new(ctx);
    let pool = Arc::new(RecordingPool { kind: WorkKind::Ocr, received: std::sync::Mutex::new(Vec::new()) });
    scheduler.register_pool(pool.clone() as Arc<dyn WorkerPool>).unwrap();
    scheduler.register_factory(shelf_core::jobs::book_processing::JOB_TYPE, BookProcessingJob::factory());

    let resumed = scheduler.resume().await.unwrap();
    assert_eq!(resumed, 1);

    let received = pool.received.lock().unwrap();
    assert_eq!(received.len(), 5, "only the 5 still-missing pages should be re-OCR'd");
    assert!(received.iter().all(|u| u.kind == WorkKind::Ocr));
}

//! Provider pool: one instance per external provider configuration
//! (spec.md §4.2). Three concurrent elements share one pool:
//!
//! 1. a bounded input queue fed by the scheduler's `submit`,
//! 2. a single dispatcher that owns the rate limiter and forwards units
//!    onto an internal channel once a token is available,
//! 3. a fixed-size worker fleet that executes calls and retries.
//!
//! Only the dispatcher ever touches the rate limiter; workers never
//! contend on it, which keeps rate enforcement exact and lets workers run
//! exactly as fast as the external calls allow.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::cancellation::CancelToken;
use crate::model::{ResultPayload, WorkKind, WorkPayload, WorkResult, WorkUnit};
use crate::pool::{PoolStatus, SubmitOutcome, WorkerPool};
use crate::provider::{ProviderClient, ProviderErrorKind};
use crate::rate_limiter::RateLimiter;
use crate::records::{LlmCallRecord, MetricRecord};
use crate::sink::WriteSink;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_MAX_CONCURRENCY: usize = 30;
pub const DEFAULT_MAX_RETRIES: u32 = 7;
const DEFAULT_429_COOLDOWN: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct ProviderPoolConfig {
    pub queue_capacity: usize,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub requests_per_second: f64,
}

impl ProviderPoolConfig {
    /// Resolves provider-reported zero-means-default fields against the
    /// pool defaults (spec.md §6 provider client contract).
    pub fn from_client(client: &dyn ProviderClient) -> Self {
        let rps = client.requests_per_second();
        let concurrency = client.max_concurrency();
        let retries = client.max_retries();
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_concurrency: if concurrency == 0 { DEFAULT_MAX_CONCURRENCY } else { concurrency },
            max_retries: if retries == 0 { DEFAULT_MAX_RETRIES } else { retries },
            requests_per_second: if rps == 0.0 { 1.0 } else { rps },
        }
    }
}

pub struct ProviderPool {
    name: String,
    kind: WorkKind,
    client: Arc<dyn ProviderClient>,
    sink: WriteSink,
    config: ProviderPoolConfig,
    rate_limiter: Arc<RateLimiter>,
    input_tx: mpsc::Sender<WorkUnit>,
    input_rx: Mutex<Option<mpsc::Receiver<WorkUnit>>>,
    results_tx: Mutex<Option<mpsc::Sender<WorkResult>>>,
    queue_depth: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
}

impl ProviderPool {
    pub fn new(kind: WorkKind, client: Arc<dyn ProviderClient>, sink: WriteSink, config: ProviderPoolConfig) -> Self {
        let (input_tx, input_rx) = mpsc::channel(config.queue_capacity);
        let name = client.name().to_string();
        let rate_limiter = Arc::new(RateLimiter::new(config.requests_per_second));
        Self {
            name,
            kind,
            client,
            sink,
            config,
            rate_limiter,
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            results_tx: Mutex::new(None),
            queue_depth: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl WorkerPool for ProviderPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> WorkKind {
        self.kind
    }

    fn init_results_channel(&self, tx: mpsc::Sender<WorkResult>) {
        *self.results_tx.lock() = Some(tx);
    }

    #[instrument(skip(self, cancel), fields(pool = %self.name))]
    async fn start(&self, cancel: CancelToken) {
        #[allow(clippy::expect_used)] // scheduler invariant: start() runs at most once per pool
        let input_rx = self.input_rx.lock().take().expect("start called more than once");
        #[allow(clippy::expect_used)] // scheduler invariant: init_results_channel runs before start
        let results_tx = self.results_tx.lock().clone().expect("init_results_channel must run before start");

        let (internal_tx, internal_rx) = mpsc::channel::<WorkUnit>(self.config.max_concurrency.max(1));
        let internal_rx = Arc::new(tokio::sync::Mutex::new(internal_rx));

        let dispatcher = tokio::spawn(dispatch(
            input_rx,
            internal_tx,
            self.rate_limiter.clone(),
            self.queue_depth.clone(),
            cancel.clone(),
        ));

        let mut workers = Vec::with_capacity(self.config.max_concurrency);
        for worker_id in 0..self.config.max_concurrency {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                self.name.clone(),
                self.kind,
                self.client.clone(),
                self.sink.clone(),
                self.config.max_retries,
                self.rate_limiter.clone(),
                internal_rx.clone(),
                results_tx.clone(),
                self.in_flight.clone(),
                cancel.clone(),
            )));
        }

        info!(workers = self.config.max_concurrency, "provider pool started");
        let _ = tokio::join!(dispatcher, futures::future::join_all(workers));
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
            kind: self.kind,
            workers: self.config.max_concurrency,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            queue_depth: self.queue_depth.load(Ordering::SeqCst),
            rate_limiter: Some(self.rate_limiter.snapshot()),
        }
    }
}

async fn dispatch(
    mut input_rx: mpsc::Receiver<WorkUnit>,
    internal_tx: mpsc::Sender<WorkUnit>,
    rate_limiter: Arc<RateLimiter>,
    queue_depth: Arc<AtomicUsize>,
    cancel: CancelToken,
) {
    loop {
        let unit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            maybe_unit = input_rx.recv() => match maybe_unit {
                Some(u) => u,
                None => return,
            },
        };
        queue_depth.fetch_sub(1, Ordering::SeqCst);

        if rate_limiter.wait(&cancel).await.is_err() {
            return;
        }

        if internal_tx.send(unit).await.is_err() {
            return;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    pool_name: String,
    pool_kind: WorkKind,
    client: Arc<dyn ProviderClient>,
    sink: WriteSink,
    max_retries: u32,
    rate_limiter: Arc<RateLimiter>,
    internal_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkUnit>>>,
    results_tx: mpsc::Sender<WorkResult>,
    in_flight: Arc<AtomicUsize>,
    cancel: CancelToken,
) {
    loop {
        let unit = {
            let mut rx = internal_rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                maybe_unit = rx.recv() => match maybe_unit {
                    Some(u) => u,
                    None => return,
                },
            }
        };

        in_flight.fetch_add(1, Ordering::SeqCst);
        let result = execute_with_retry(&unit, pool_kind, &pool_name, &*client, &sink, max_retries, &rate_limiter, &cancel).await;
        in_flight.fetch_sub(1, Ordering::SeqCst);

        debug!(worker_id, unit_id = %unit.id, "worker completed unit");
        if results_tx.send(result).await.is_err() {
            warn!("scheduler results channel closed; dropping result");
            return;
        }
    }
}

async fn execute_with_retry(
    unit: &WorkUnit,
    pool_kind: WorkKind,
    provider_name: &str,
    client: &dyn ProviderClient,
    sink: &WriteSink,
    max_retries: u32,
    rate_limiter: &RateLimiter,
    cancel: &CancelToken,
) -> WorkResult {
    if unit.kind != pool_kind {
        let result = WorkResult::failure(unit, format!("unit kind {:?} does not match pool kind {:?}", unit.kind, pool_kind));
        MetricRecord { unit, provider: provider_name, success: false, error: result.error.as_deref(), attempts: 0, latency_ms: 0, cost_usd: 0.0 }
            .emit(sink)
            .await;
        return result;
    }

    let start = tokio::time::Instant::now();
    let mut attempt: u32 = 0;
    let mut last_error: Option<crate::provider::ProviderError> = None;

    loop {
        if cancel.is_cancelled() {
            let result = WorkResult::failure(unit, "cancelled");
            emit_records(unit, provider_name, &ResultPayload::None, false, result.error.as_deref(), attempt, start.elapsed().as_millis() as u64, sink).await;
            return result;
        }

        let outcome = invoke(unit, client).await;
        match outcome {
            Ok(payload) => {
                let cost = payload_cost(&payload);
                emit_records(unit, provider_name, &payload, true, None, attempt + 1, start.elapsed().as_millis() as u64, sink).await;
                let _ = cost;
                return WorkResult {
                    unit_id: unit.id.clone(),
                    job_id: unit.job_id.clone(),
                    success: true,
                    error: None,
                    payload,
                    attribution: unit.attribution.clone(),
                };
            }
            Err(err) => {
                if err.is_rate_limit() {
                    rate_limiter.record_429(err.retry_after().unwrap_or(DEFAULT_429_COOLDOWN));
                }

                let retriable = err.is_retriable();
                last_error = Some(err.clone());

                if !retriable || attempt >= max_retries {
                    let message = err.message.clone();
                    emit_records(unit, provider_name, &ResultPayload::None, false, Some(&message), attempt + 1, start.elapsed().as_millis() as u64, sink).await;
                    return WorkResult {
                        unit_id: unit.id.clone(),
                        job_id: unit.job_id.clone(),
                        success: false,
                        error: Some(message),
                        payload: ResultPayload::None,
                        attribution: unit.attribution.clone(),
                    };
                }

                let sleep_for = err.retry_after().unwrap_or_else(|| backoff_with_jitter(attempt));
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = cancel.cancelled() => {
                        let message = last_error.map(|e| e.message).unwrap_or_else(|| "cancelled".to_string());
                        emit_records(unit, provider_name, &ResultPayload::None, false, Some(&message), attempt + 1, start.elapsed().as_millis() as u64, sink).await;
                        return WorkResult::failure(unit, message);
                    }
                }
                attempt += 1;
            }
        }
    }
}

async fn emit_records(
    unit: &WorkUnit,
    provider_name: &str,
    payload: &ResultPayload,
    success: bool,
    error: Option<&str>,
    attempts: u32,
    latency_ms: u64,
    sink: &WriteSink,
) {
    let cost_usd = payload_cost(payload);
    MetricRecord { unit, provider: provider_name, success, error, attempts, latency_ms, cost_usd }
        .emit(sink)
        .await;
    if unit.kind == WorkKind::Llm {
        LlmCallRecord { unit, provider: provider_name, result: payload }.emit(sink).await;
    }
}

fn payload_cost(payload: &ResultPayload) -> f64 {
    match payload {
        ResultPayload::Chat(c) => c.cost_usd,
        ResultPayload::Ocr(o) => o.cost_usd,
        _ => 0.0,
    }
}

async fn invoke(unit: &WorkUnit, client: &dyn ProviderClient) -> Result<ResultPayload, crate::provider::ProviderError> {
    match &unit.payload {
        WorkPayload::Chat(req) => {
            let result = if let Some(tools) = &req.tools {
                client.chat_with_tools(req, tools).await?
            } else {
                client.chat(req).await?
            };
            Ok(ResultPayload::Chat(result))
        }
        WorkPayload::Ocr(req) => {
            let result = client.process_image(&req.image_bytes, req.page_number).await?;
            Ok(ResultPayload::Ocr(result))
        }
        WorkPayload::Tts(req) => {
            let result = client.synthesize(&req.text, &req.voice, &serde_json::Value::Null).await?;
            Ok(ResultPayload::Tts(result))
        }
        WorkPayload::Cpu(_) => Err(crate::provider::ProviderError::terminal("CPU payload submitted to a provider pool")),
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let exp = StdDuration::from_secs_f64(1.0 * 2f64.powi(attempt as i32));
    let capped = exp.min(StdDuration::from_secs(30)).min(MAX_BACKOFF);
    let jitter_ms: u64 = rand::thread_rng().gen_range(0..1000);
    capped + StdDuration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::fake::FakeDocumentStore;
    use crate::model::{ChatRequest, WorkKind, WorkPayload};
    use crate::provider::{ProviderError, ProviderResult};
    use std::sync::atomic::AtomicU32;

    struct FlakyClient {
        fail_times: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProviderClient for FlakyClient {
        fn name(&self) -> &str {
            "flaky"
        }
        fn requests_per_second(&self) -> f64 {
            1000.0
        }
        fn max_concurrency(&self) -> usize {
            1
        }
        fn max_retries(&self) -> u32 {
            7
        }

        async fn chat(&self, _req: &ChatRequest) -> ProviderResult<crate::model::ChatResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(ProviderError { kind: ProviderErrorKind::Timeout, message: "timeout".into() })
            } else {
                Ok(crate::model::ChatResult { text: "ok".into(), input_tokens: 1, output_tokens: 1, cost_usd: 0.01, tool_calls: vec![] })
            }
        }
    }

    fn chat_unit() -> WorkUnit {
        WorkUnit::new(
            "job-1".into(),
            WorkKind::Llm,
            WorkPayload::Chat(ChatRequest { system_prompt: None, messages: vec![], tools: None }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let store: Arc<dyn crate::document_store::DocumentStoreClient> = Arc::new(FakeDocumentStore::new());
        let cancel = CancelToken::new();
        let (sink, _handle) = WriteSink::spawn(store, Default::default(), cancel.clone());
        let client = FlakyClient { fail_times: 2, calls: AtomicU32::new(0) };
        let limiter = RateLimiter::new(1000.0);

        let unit = chat_unit();
        let result = execute_with_retry(&unit, WorkKind::Llm, "flaky", &client, &sink, 7, &limiter, &cancel).await;
        assert!(result.success);
    }

    struct AlwaysTerminal;

    #[async_trait]
    impl ProviderClient for AlwaysTerminal {
        fn name(&self) -> &str {
            "terminal"
        }
        fn requests_per_second(&self) -> f64 {
            1000.0
        }
        fn max_concurrency(&self) -> usize {
            1
        }
        fn max_retries(&self) -> u32 {
            7
        }

        async fn chat(&self, _req: &ChatRequest) -> ProviderResult<crate::model::ChatResult> {
            Err(ProviderError::terminal("bad api key"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_are_not_retried() {
        let store: Arc<dyn crate::document_store::DocumentStoreClient> = Arc::new(FakeDocumentStore::new());
        let cancel = CancelToken::new();
        let (sink, _handle) = WriteSink::spawn(store, Default::default(), cancel.clone());
        let client = AlwaysTerminal;
        let limiter = RateLimiter::new(1000.0);

        let unit = chat_unit();
        let result = execute_with_retry(&unit, WorkKind::Llm, "terminal", &client, &sink, 7, &limiter, &cancel).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("bad api key"));
    }

    #[test]
    fn kind_mismatch_is_terminal() {
        let unit = WorkUnit::new("job-1".into(), WorkKind::Ocr, WorkPayload::Ocr(crate::model::OcrRequest { image_bytes: vec![], page_number: 1 }));
        assert_ne!(unit.kind, WorkKind::Llm);
    }
}

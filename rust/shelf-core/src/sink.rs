//! The write sink (spec.md §4.6): a bounded, multi-producer, single-consumer
//! channel that batches writes to the document store so workers and jobs
//! never block on durable-store I/O.
//!
//! Ordering: operations for the same `document_id`, enqueued from a single
//! producer, are applied in enqueue order. Batches preserve the relative
//! order of everything they contain; only operations that land in
//! different batches (i.e. separated by a flush boundary) may reorder
//! relative to unrelated document ids. Because the consumer is a single
//! task draining a single channel in FIFO order and `flush` processes a
//! batch sequentially, program order is preserved for any fixed
//! document id.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::cancellation::CancelToken;
use crate::document_store::DocumentStoreClient;
use crate::model::{WriteOp, WriteOpKind};

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_backoff: Duration,
    pub max_batch_retries: u32,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 10_000,
            batch_size: 64,
            flush_interval: Duration::from_millis(50),
            max_backoff: Duration::from_secs(30),
            max_batch_retries: 5,
        }
    }
}

#[derive(Clone)]
pub struct WriteSink {
    tx: mpsc::Sender<WriteOp>,
}

impl WriteSink {
    /// Spawn the sink's single consumer task and return a cloneable handle.
    /// Callers `send` onto the handle; back-pressure blocks the caller
    /// when the bounded channel is full (acceptable: all callers are
    /// already in I/O-bound contexts, spec.md §4.6).
    pub fn spawn(
        store: std::sync::Arc<dyn DocumentStoreClient>,
        config: SinkConfig,
        cancel: CancelToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let handle = tokio::spawn(run_consumer(rx, store, config, cancel));
        (Self { tx }, handle)
    }

    /// Build a sink around an explicit sender, for tests that want to
    /// drive the consumer loop directly without `spawn`'s task.
    #[cfg(test)]
    pub fn from_sender(tx: mpsc::Sender<WriteOp>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, op: WriteOp) {
        if self.tx.send(op).await.is_err() {
            warn!("write sink consumer gone; dropping write");
        }
    }
}

async fn run_consumer(
    mut rx: mpsc::Receiver<WriteOp>,
    store: std::sync::Arc<dyn DocumentStoreClient>,
    config: SinkConfig,
    cancel: CancelToken,
) {
    let mut batch: Vec<WriteOp> = Vec::with_capacity(config.batch_size);

    loop {
        let deadline = Instant::now() + config.flush_interval;
        let mut timed_out = false;

        while batch.len() < config.batch_size {
            tokio::select! {
                biased;
                maybe_op = rx.recv() => {
                    match maybe_op {
                        Some(op) => batch.push(op),
                        None => {
                            flush(&store, &mut batch, &config).await;
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
                _ = cancel.cancelled() => {
                    timed_out = true;
                    break;
                }
            }
        }

        if !batch.is_empty() {
            flush(&store, &mut batch, &config).await;
        }

        if cancel.is_cancelled() {
            drain_and_flush(&mut rx, &store, &config).await;
            return;
        }

        let _ = timed_out;
    }
}

/// On cancellation: drain whatever is already queued and attempt one final
/// flush (spec.md §4.6 shutdown).
async fn drain_and_flush(
    rx: &mut mpsc::Receiver<WriteOp>,
    store: &std::sync::Arc<dyn DocumentStoreClient>,
    config: &SinkConfig,
) {
    let mut batch = Vec::new();
    while let Ok(op) = rx.try_recv() {
        batch.push(op);
    }
    if !batch.is_empty() {
        debug!(count = batch.len(), "draining write sink on shutdown");
        flush(store, &mut batch, config).await;
    }
}

async fn flush(store: &std::sync::Arc<dyn DocumentStoreClient>, batch: &mut Vec<WriteOp>, config: &SinkConfig) {
    if batch.is_empty() {
        return;
    }
    let ops = std::mem::take(batch);
    let mut backoff = Duration::from_millis(100);

    for attempt in 0..=config.max_batch_retries {
        match apply_batch(store, &ops).await {
            Ok(()) => return,
            Err(e) => {
                error!(attempt, error = %e, "write batch failed");
                if attempt == config.max_batch_retries {
                    error!(count = ops.len(), "dropping batch after exhausting retries");
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_backoff);
            }
        }
    }
}

/// Ops are applied strictly in slice order, which preserves the
/// enqueue-order guarantee for any single document id within a batch.
async fn apply_batch(store: &std::sync::Arc<dyn DocumentStoreClient>, ops: &[WriteOp]) -> Result<(), String> {
    for op in ops {
        let result = match op.op {
            WriteOpKind::Create => store.create(&op.collection, op.document.clone()).await.map(|_| ()),
            WriteOpKind::Update => {
                let id = op.document_id.as_deref().ok_or("update op missing document_id")?;
                store.update(&op.collection, id, op.document.clone()).await
            }
            WriteOpKind::Delete => {
                let id = op.document_id.as_deref().ok_or("delete op missing document_id")?;
                store.delete(&op.collection, id).await
            }
        };
        result.map_err(|e| e.to_string())?;
    }
    Ok(())
}

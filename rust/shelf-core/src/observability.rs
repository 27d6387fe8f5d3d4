//! Tracing and metrics bootstrap for the `shelf-worker` binary.
//!
//! Mirrors the teacher's `init_tracing` pattern (env-driven filter, a
//! compact-vs-JSON fork) but built on this crate's own `tracing-subscriber`
//! dependency rather than the teacher's OpenTelemetry pipeline, since no
//! OTLP exporter is part of this crate's stack. Pool `status()` snapshots
//! (spec.md §4.2: worker count, in-flight, queue depth, limiter snapshot)
//! are fed into `metrics` gauges here so they're visible to whatever
//! recorder the deployment wires up, without this crate picking one.

use tracing_subscriber::{fmt, EnvFilter};

use crate::pool::PoolStatus;

const DEFAULT_FILTER: &str = "info";

/// Initializes the global `tracing` subscriber exactly once. Call at the
/// very start of `main`, before anything else logs.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let subscriber = fmt().with_env_filter(filter);
    if json {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}

/// Publishes one pool's status snapshot as a set of gauges, labeled by pool
/// name. Called periodically by the binary wiring layer (e.g. once per
/// status poll), never from inside the pool itself — `PoolStatus` stays a
/// plain data snapshot so tests can assert on it without a metrics
/// recorder installed.
pub fn record_pool_status(status: &PoolStatus) {
    metrics::gauge!("shelf_pool_workers", "pool" => status.name.clone()).set(status.workers as f64);
    metrics::gauge!("shelf_pool_inflight", "pool" => status.name.clone()).set(status.in_flight as f64);
    metrics::gauge!("shelf_pool_queue_depth", "pool" => status.name.clone()).set(status.queue_depth as f64);
    if let Some(limiter) = &status.rate_limiter {
        metrics::gauge!("shelf_limiter_tokens", "pool" => status.name.clone()).set(limiter.tokens);
        metrics::gauge!("shelf_limiter_cooling_down", "pool" => status.name.clone())
            .set(if limiter.cooling_down { 1.0 } else { 0.0 });
    }
}

//! Ambient process configuration for the `shelf-worker` binary.
//!
//! spec.md §1 places file-based configuration, hot-reload, and the HTTP
//! surface out of scope; what remains in scope is the durable `Config`
//! collection reconstructed by [`crate::registry`]. This module only
//! carries what the process needs to *bootstrap* before it can reach that
//! collection at all — the document-store endpoint, its credential, and
//! the write sink's batching knobs — mirroring the teacher's
//! `ConfigLoader::load_from_env` rather than its file/hot-reload path.

use std::time::Duration;

use clap::Parser;

use crate::sink::SinkConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "shelf-worker")]
#[command(about = "Job execution core worker: scheduler, pools, and write sink")]
pub struct ProcessConfig {
    /// Base URL of the GraphQL-speaking document store.
    #[arg(long, env = "SHELF_DOCUMENT_STORE_URL")]
    pub document_store_url: String,

    /// Bearer token presented to the document store, if any.
    #[arg(long, env = "SHELF_DOCUMENT_STORE_TOKEN")]
    pub document_store_token: Option<String>,

    /// `json` for structured logs, anything else for compact output.
    #[arg(long, env = "SHELF_LOG_FORMAT", default_value = "compact")]
    pub log_format: String,

    /// Scheduler's results-channel capacity (spec.md §5 default 1000).
    #[arg(long, env = "SHELF_RESULTS_CHANNEL_CAPACITY", default_value_t = 1000)]
    pub results_channel_capacity: usize,

    /// Write sink batch size (spec.md §4.6 default 64).
    #[arg(long, env = "SHELF_SINK_BATCH_SIZE", default_value_t = 64)]
    pub sink_batch_size: usize,

    /// Write sink flush interval in milliseconds (spec.md §4.6 default 50ms).
    #[arg(long, env = "SHELF_SINK_FLUSH_INTERVAL_MS", default_value_t = 50)]
    pub sink_flush_interval_ms: u64,

    /// Write sink input channel capacity (spec.md §4.6 default 10000).
    #[arg(long, env = "SHELF_SINK_CHANNEL_CAPACITY", default_value_t = 10_000)]
    pub sink_channel_capacity: usize,
}

impl ProcessConfig {
    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig {
            channel_capacity: self.sink_channel_capacity,
            batch_size: self.sink_batch_size,
            flush_interval: Duration::from_millis(self.sink_flush_interval_ms),
            ..SinkConfig::default()
        }
    }

    pub fn is_json_logging(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

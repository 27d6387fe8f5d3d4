//! Thin wiring layer around `shelf_core`: assembles a `ServiceContext` and
//! `Scheduler` from environment configuration, registers the known job
//! factories and whatever provider pools this deployment knows how to
//! build, installs the double-signal shutdown handler, and runs until
//! cancelled.
//!
//! This binary intentionally does none of the work spec.md §1 places out
//! of scope: no HTTP surface, no file-based config, no hot-reload. It
//! exists only so the crate is runnable, the way the teacher wraps its
//! library in a minimal `src/bin/*.rs`.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use shelf_core::cancellation::CancelToken;
use shelf_core::config::ProcessConfig;
use shelf_core::context::ServiceContext;
use shelf_core::document_store::{DocumentStoreClient, GraphQlDocumentStore};
use shelf_core::jobs::{audio_generation::AudioGenerationJob, book_processing::BookProcessingJob, toc_finalize::TocFinalizeJob};
use shelf_core::observability;
use shelf_core::registry::{self, ConfigStore};
use shelf_core::scheduler::Scheduler;
use shelf_core::signals;
use shelf_core::sink::WriteSink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ProcessConfig::parse();
    observability::init_tracing(config.is_json_logging());

    let cancel = CancelToken::new();
    signals::install(cancel.clone());

    let document_store: Arc<dyn DocumentStoreClient> =
        Arc::new(GraphQlDocumentStore::new(config.document_store_url.clone(), config.document_store_token.clone()));

    let (sink, sink_handle) = WriteSink::spawn(document_store.clone(), config.sink_config(), cancel.clone());

    let config_store = Arc::new(ConfigStore::load(document_store.as_ref()).await?);
    let ctx = ServiceContext::new(document_store.clone(), sink.clone(), config_store.clone(), cancel.clone());

    let scheduler = Arc::new(Scheduler::with_results_capacity(ctx, config.results_channel_capacity));

    scheduler.register_factory(shelf_core::jobs::book_processing::JOB_TYPE, BookProcessingJob::factory());
    scheduler.register_factory(shelf_core::jobs::audio_generation::JOB_TYPE, AudioGenerationJob::factory());
    scheduler.register_factory(shelf_core::jobs::toc_finalize::JOB_TYPE, TocFinalizeJob::factory());

    // Provider pools are assembled from the durable `Config` collection
    // (spec.md §4.8), but instantiating a concrete `ProviderClient` per
    // provider is this deployment's business, not the library's (spec.md
    // §1). No client builders are registered here; an embedding deployment
    // replaces `no_client_available` with one that knows how to construct
    // its bound OCR/LLM/TTS clients from `ProviderDefinition.fields`.
    let definitions = registry::reconstruct_providers(&config_store);
    for pool in registry::build_provider_pools(&definitions, &sink, no_client_available) {
        if let Err(e) = scheduler.register_pool(pool) {
            warn!(error = %e, "failed to register provider pool");
        }
    }

    info!("shelf-worker starting");
    shelf_core::run(scheduler, cancel).await?;

    let _ = sink_handle.await;
    info!("shelf-worker exited");
    Ok(())
}

fn no_client_available(_def: &registry::ProviderDefinition) -> Option<Arc<dyn shelf_core::provider::ProviderClient>> {
    None
}

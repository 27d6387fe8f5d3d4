//! The service context (spec.md §4.7): a bundle of shared collaborators
//! threaded through the call graph so components extract only the fields
//! they need, instead of reaching for globals. Built once at startup and
//! then treated as an immutable snapshot — components that need mutable
//! shared state (the scheduler's job map, a pool's in-flight counter) own
//! interior mutability themselves rather than mutating the context.

use std::sync::Arc;

use crate::cancellation::CancelToken;
use crate::document_store::DocumentStoreClient;
use crate::registry::ConfigStore;
use crate::sink::WriteSink;

#[derive(Clone)]
pub struct ServiceContext {
    pub document_store: Arc<dyn DocumentStoreClient>,
    pub sink: WriteSink,
    pub config_store: Arc<ConfigStore>,
    pub cancel: CancelToken,
}

impl ServiceContext {
    pub fn new(
        document_store: Arc<dyn DocumentStoreClient>,
        sink: WriteSink,
        config_store: Arc<ConfigStore>,
        cancel: CancelToken,
    ) -> Self {
        Self { document_store, sink, config_store, cancel }
    }
}

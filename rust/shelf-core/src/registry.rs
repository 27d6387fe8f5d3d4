//! Provider registry & configuration store (spec.md §4.8): a flat
//! `{key -> value}` store backed by the document store's `Config`
//! collection, plus reconstruction of provider definitions from
//! dotted-prefix entries (`providers.<kind>.<name>.<field>`).
//!
//! Instantiating the *concrete* `ProviderClient` for a definition is out
//! of scope here (spec.md §1: provider HTTP client bodies are external
//! collaborators) — `reconstruct_providers` hands back plain
//! `ProviderDefinition`s; the binary wiring layer turns each into a pool
//! by pairing it with a concrete client it knows how to build.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::document_store::{DocumentStoreClient, Filter};
use crate::error::ShelfResult;
use crate::model::{ConfigEntry, ConfigValue, WorkKind};
use crate::pool::provider_pool::{ProviderPool, ProviderPoolConfig};
use crate::pool::WorkerPool;
use crate::provider::ProviderClient;
use crate::sink::WriteSink;

const PROVIDERS_PREFIX: &str = "providers.";
const DEFAULT_RATE: f64 = 1.0;
const DEFAULT_CONCURRENCY: usize = 30;
const DEFAULT_RETRIES: u32 = 7;

pub struct ConfigStore {
    entries: RwLock<HashMap<String, ConfigEntry>>,
}

impl ConfigStore {
    pub fn new_empty() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// Loads every `Config` document from the store into memory. Call once
    /// at startup; the store does not watch for external changes (hot
    /// reload is out of scope, spec.md §1).
    pub async fn load(document_store: &dyn DocumentStoreClient) -> ShelfResult<Self> {
        let docs = document_store
            .query("Config", &[])
            .await
            .map_err(|e| crate::error::ShelfError::Config(e.to_string()))?;

        let mut entries = HashMap::new();
        for doc in docs {
            match serde_json::from_value::<ConfigEntry>(doc.clone()) {
                Ok(entry) => {
                    entries.insert(entry.key.clone(), entry);
                }
                Err(e) => warn!(error = %e, doc = %doc, "skipping malformed Config entry"),
            }
        }
        Ok(Self { entries: RwLock::new(entries) })
    }

    pub fn get(&self, key: &str) -> Option<ConfigEntry> {
        self.entries.read().get(key).cloned()
    }

    pub fn by_prefix(&self, prefix: &str) -> Vec<ConfigEntry> {
        self.entries.read().values().filter(|e| e.key.starts_with(prefix)).cloned().collect()
    }

    /// Writes each default whose key is not already present, via the
    /// sink. Idempotent: a second call with the same defaults after the
    /// first has landed leaves the store unchanged (spec.md §8 law),
    /// because `load` (called before this in the normal boot sequence)
    /// already populated `entries` with whatever persists.
    pub async fn seed_defaults(&self, sink: &WriteSink, defaults: &[(&str, ConfigValue, &str)]) {
        for (key, value, description) in defaults {
            if self.entries.read().contains_key(*key) {
                continue;
            }
            debug!(key, "seeding default config entry");
            let entry = ConfigEntry { key: key.to_string(), value: value.clone(), description: description.to_string() };
            let doc = serde_json::to_value(&entry).unwrap_or(Value::Null);
            sink.send(crate::model::WriteOp::create("Config", doc)).await;
            self.entries.write().insert(entry.key.clone(), entry);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderDefinition {
    pub kind: String,
    pub name: String,
    pub fields: HashMap<String, Value>,
    pub requests_per_second: f64,
    pub max_concurrency: usize,
    pub max_retries: u32,
}

/// `${NAME}` values are resolved against the process environment; any
/// other shape passes through unchanged.
fn resolve_env(value: &Value) -> Value {
    let Some(s) = value.as_str() else { return value.clone() };
    if let Some(name) = s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
        match std::env::var(name) {
            Ok(resolved) => Value::String(resolved),
            Err(_) => {
                warn!(name, "provider config references unset environment variable");
                value.clone()
            }
        }
    } else {
        value.clone()
    }
}

/// Groups `providers.<kind>.<name>.<field>` entries by `(kind, name)` and
/// resolves `${NAME}` fields against the environment (spec.md §4.8).
pub fn reconstruct_providers(store: &ConfigStore) -> Vec<ProviderDefinition> {
    let mut grouped: HashMap<(String, String), HashMap<String, Value>> = HashMap::new();

    for entry in store.by_prefix(PROVIDERS_PREFIX) {
        let rest = &entry.key[PROVIDERS_PREFIX.len()..];
        let mut parts = rest.splitn(3, '.');
        let (Some(kind), Some(name), Some(field)) = (parts.next(), parts.next(), parts.next()) else {
            warn!(key = %entry.key, "malformed provider config key, expected providers.<kind>.<name>.<field>");
            continue;
        };

        let value = match &entry.value {
            ConfigValue::Scalar(v) => resolve_env(v),
            ConfigValue::List(items) => Value::Array(items.iter().map(resolve_env).collect()),
        };
        grouped.entry((kind.to_string(), name.to_string())).or_default().insert(field.to_string(), value);
    }

    grouped
        .into_iter()
        .map(|((kind, name), fields)| {
            let requests_per_second = fields.get("requests_per_second").and_then(Value::as_f64).unwrap_or(DEFAULT_RATE);
            let max_concurrency = fields.get("max_concurrency").and_then(Value::as_u64).map(|n| n as usize).unwrap_or(DEFAULT_CONCURRENCY);
            let max_retries = fields.get("max_retries").and_then(Value::as_u64).map(|n| n as u32).unwrap_or(DEFAULT_RETRIES);
            ProviderDefinition { kind, name, fields, requests_per_second, max_concurrency, max_retries }
        })
        .collect()
}

impl WorkKind {
    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "llm" => Some(WorkKind::Llm),
            "ocr" => Some(WorkKind::Ocr),
            "tts" => Some(WorkKind::Tts),
            _ => None,
        }
    }
}

/// Pairs each reconstructed provider definition with a concrete client the
/// caller knows how to build, then wraps it in a `ProviderPool` sized from
/// the definition's configured (or default) rate/concurrency/retries
/// (spec.md §4.8: "the scheduler then builds one pool per provider"). A
/// definition for an unrecognized `kind`, or one `build_client` declines to
/// build (no client registered for that provider), is skipped with a
/// warning rather than failing the whole registry build.
pub fn build_provider_pools(
    definitions: &[ProviderDefinition],
    sink: &WriteSink,
    build_client: impl Fn(&ProviderDefinition) -> Option<Arc<dyn ProviderClient>>,
) -> Vec<Arc<dyn WorkerPool>> {
    let mut pools = Vec::new();
    for definition in definitions {
        let Some(kind) = WorkKind::parse(&definition.kind) else {
            warn!(kind = %definition.kind, name = %definition.name, "unrecognized provider kind, skipping");
            continue;
        };
        let Some(client) = build_client(definition) else {
            warn!(kind = %definition.kind, name = %definition.name, "no client builder registered for provider, skipping");
            continue;
        };

        let config = ProviderPoolConfig {
            queue_capacity: crate::pool::provider_pool::DEFAULT_QUEUE_CAPACITY,
            max_concurrency: if definition.max_concurrency == 0 { DEFAULT_CONCURRENCY } else { definition.max_concurrency },
            max_retries: if definition.max_retries == 0 { DEFAULT_RETRIES } else { definition.max_retries },
            requests_per_second: if definition.requests_per_second <= 0.0 { DEFAULT_RATE } else { definition.requests_per_second },
        };
        pools.push(Arc::new(ProviderPool::new(kind, client, sink.clone(), config)) as Arc<dyn WorkerPool>);
    }
    pools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::fake::FakeDocumentStore;
    use crate::cancellation::CancelToken;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn seed_defaults_is_idempotent() {
        let store = Arc::new(FakeDocumentStore::new());
        let cancel = CancelToken::new();
        let (sink, handle) = WriteSink::spawn(store.clone(), Default::default(), cancel.clone());

        let config = ConfigStore::load(store.as_ref()).await.unwrap();
        let defaults = [("providers.llm.default.requests_per_second", ConfigValue::Scalar(json!(5.0)), "default llm rate")];

        config.seed_defaults(&sink, &defaults).await;
        config.seed_defaults(&sink, &defaults).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        cancel.cancel();
        let _ = handle.await;

        assert_eq!(store.dump("Config").len(), 1);
    }

    #[tokio::test]
    async fn reconstructs_provider_definitions_with_env_resolution() {
        std::env::set_var("SHELF_TEST_API_KEY", "secret-value");
        let store = Arc::new(FakeDocumentStore::new());
        store
            .create(
                "Config",
                json!({ "key": "providers.llm.openai.api_key", "value": "${SHELF_TEST_API_KEY}", "description": "" }),
            )
            .await
            .unwrap();
        store
            .create("Config", json!({ "key": "providers.llm.openai.requests_per_second", "value": 10.0, "description": "" }))
            .await
            .unwrap();

        let config = ConfigStore::load(store.as_ref()).await.unwrap();
        let providers = reconstruct_providers(&config);

        assert_eq!(providers.len(), 1);
        let p = &providers[0];
        assert_eq!(p.kind, "llm");
        assert_eq!(p.name, "openai");
        assert_eq!(p.requests_per_second, 10.0);
        assert_eq!(p.fields.get("api_key").and_then(Value::as_str), Some("secret-value"));
    }

    struct NoopClient;

    #[async_trait::async_trait]
    impl ProviderClient for NoopClient {
        fn name(&self) -> &str {
            "openai"
        }
        fn requests_per_second(&self) -> f64 {
            10.0
        }
        fn max_concurrency(&self) -> usize {
            0
        }
        fn max_retries(&self) -> u32 {
            0
        }
    }

    #[tokio::test]
    async fn build_provider_pools_skips_unrecognized_kind_and_missing_client() {
        let store = Arc::new(FakeDocumentStore::new());
        let cancel = CancelToken::new();
        let (sink, handle) = WriteSink::spawn(store.clone(), Default::default(), cancel.clone());

        let definitions = vec![
            ProviderDefinition { kind: "llm".into(), name: "openai".into(), fields: HashMap::new(), requests_per_second: 10.0, max_concurrency: 0, max_retries: 0 },
            ProviderDefinition { kind: "bogus".into(), name: "x".into(), fields: HashMap::new(), requests_per_second: 1.0, max_concurrency: 0, max_retries: 0 },
            ProviderDefinition { kind: "tts".into(), name: "unbuilt".into(), fields: HashMap::new(), requests_per_second: 1.0, max_concurrency: 0, max_retries: 0 },
        ];

        let pools = build_provider_pools(&definitions, &sink, |def| {
            if def.name == "openai" {
                Some(Arc::new(NoopClient) as Arc<dyn ProviderClient>)
            } else {
                None
            }
        });

        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].name(), "openai");
        assert_eq!(pools[0].kind(), WorkKind::Llm);

        cancel.cancel();
        let _ = handle.await;
    }
}

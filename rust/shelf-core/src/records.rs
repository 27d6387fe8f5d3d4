//! Shaping of the Metric and LLMCall records a provider pool emits through
//! the write sink on every terminal outcome (spec.md §4.2, §6). These are
//! plain documents addressed at the `Metric` and `LLMCall` collections;
//! the pool never blocks on their persistence.

use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::model::{Attribution, ResultPayload, WorkKind, WorkUnit};
use crate::sink::WriteSink;

/// Content-addresses a prompt body so LLM calls using the same exact
/// prompt text carry the same `prompt_cid`, enabling replay and A/B
/// comparison across runs (spec.md GLOSSARY "Prompt CID").
pub fn prompt_cid(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(digest)
}

fn attribution_fields(attribution: &Option<Attribution>) -> serde_json::Value {
    match attribution {
        Some(a) => json!({
            "book_id": a.book_id,
            "page_id": a.page_id,
            "stage": a.stage,
            "item_key": a.item_key,
            "prompt_key": a.prompt_key,
            "prompt_cid": a.prompt_cid,
        }),
        None => serde_json::Value::Null,
    }
}

pub struct MetricRecord<'a> {
    pub unit: &'a WorkUnit,
    pub provider: &'a str,
    pub success: bool,
    pub error: Option<&'a str>,
    pub attempts: u32,
    pub latency_ms: u64,
    pub cost_usd: f64,
}

impl<'a> MetricRecord<'a> {
    pub async fn emit(self, sink: &WriteSink) {
        let doc = json!({
            "unit_id": self.unit.id,
            "job_id": self.unit.job_id,
            "kind": self.unit.kind.as_str(),
            "provider": self.provider,
            "success": self.success,
            "error": self.error,
            "attempts": self.attempts,
            "latency_ms": self.latency_ms,
            "cost_usd": self.cost_usd,
            "attribution": attribution_fields(&self.unit.attribution),
            "recorded_at": Utc::now().to_rfc3339(),
        });
        sink.send(crate::model::WriteOp::create("Metric", doc)).await;
    }
}

pub struct LlmCallRecord<'a> {
    pub unit: &'a WorkUnit,
    pub provider: &'a str,
    pub result: &'a ResultPayload,
}

impl<'a> LlmCallRecord<'a> {
    /// Only emitted for `WorkKind::Llm` units with a successful chat
    /// result; callers gate on kind before constructing this.
    pub async fn emit(self, sink: &WriteSink) {
        debug_assert_eq!(self.unit.kind, WorkKind::Llm);
        let (input_tokens, output_tokens, cost_usd, tool_call_count) = match self.result {
            ResultPayload::Chat(c) => (c.input_tokens, c.output_tokens, c.cost_usd, c.tool_calls.len()),
            _ => (0, 0, 0.0, 0),
        };
        let doc = json!({
            "unit_id": self.unit.id,
            "job_id": self.unit.job_id,
            "provider": self.provider,
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
            "cost_usd": cost_usd,
            "tool_call_count": tool_call_count,
            "attribution": attribution_fields(&self.unit.attribution),
            "recorded_at": Utc::now().to_rfc3339(),
        });
        sink.send(crate::model::WriteOp::create("LLMCall", doc)).await;
    }
}

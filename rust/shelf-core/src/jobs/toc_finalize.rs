//! Table-of-contents finalize / common-structure job (spec.md §4.5): a
//! small job, independent of the book-processing orchestrator, that emits
//! one or a few LLM units to reconcile ToC page-link discrepancies and
//! build the chapter hierarchy. Useful for re-running reconciliation on a
//! book whose ToC was edited after the main pipeline completed.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::context::ServiceContext;
use crate::document_store::Filter;
use crate::jobs::{Job, JobFactory, JobStatusMap};
use crate::model::{Attribution, ChatMessage, ChatRequest, JobId, ResultPayload, UnitId, WorkKind, WorkPayload, WorkResult, WorkUnit, WriteOp};

pub const JOB_TYPE: &str = "toc_finalize";

pub struct TocFinalizeJob {
    id: JobId,
    book_id: String,
    llm_provider: Option<String>,
    pending_unit: Option<UnitId>,
    done: bool,
}

impl TocFinalizeJob {
    pub fn new(book_id: impl Into<String>, llm_provider: Option<String>) -> Self {
        Self { id: String::new(), book_id: book_id.into(), llm_provider, pending_unit: None, done: false }
    }

    pub fn factory() -> JobFactory {
        std::sync::Arc::new(|id: JobId, metadata: HashMap<String, Value>| {
            let book_id = metadata.get("book_id").and_then(Value::as_str).unwrap_or_default().to_string();
            let llm_provider = metadata.get("llm_provider").and_then(Value::as_str).map(str::to_string);
            let mut job = TocFinalizeJob::new(book_id, llm_provider);
            job.id = id;
            Box::new(job) as Box<dyn Job>
        })
    }

    async fn already_finalized(&self, ctx: &ServiceContext) -> bool {
        ctx.document_store
            .query("ToC", &[Filter::eq("book_id", json!(self.book_id))])
            .await
            .unwrap_or_default()
            .into_iter()
            .next()
            .map(|t| t.get("finalized") == Some(&json!(true)))
            .unwrap_or(false)
    }

    async fn toc_entries(&self, ctx: &ServiceContext) -> Vec<Value> {
        let Some(toc) = ctx
            .document_store
            .query("ToC", &[Filter::eq("book_id", json!(self.book_id))])
            .await
            .unwrap_or_default()
            .into_iter()
            .next()
        else {
            return vec![];
        };
        let toc_id = toc.get("id").and_then(Value::as_str).unwrap_or_default();
        ctx.document_store
            .query("TocEntry", &[Filter::eq("toc_id", json!(toc_id))])
            .await
            .unwrap_or_default()
    }
}

#[async_trait]
impl Job for TocFinalizeJob {
    fn job_type(&self) -> &'static str {
        JOB_TYPE
    }

    fn set_record_id(&mut self, id: JobId) {
        self.id = id;
    }

    fn record_id(&self) -> JobId {
        self.id.clone()
    }

    fn metadata(&self) -> HashMap<String, Value> {
        let mut meta = HashMap::new();
        meta.insert("book_id".to_string(), json!(self.book_id));
        if let Some(provider) = &self.llm_provider {
            meta.insert("llm_provider".to_string(), json!(provider));
        }
        meta
    }

    async fn start(&mut self, ctx: &ServiceContext) -> Vec<WorkUnit> {
        if self.already_finalized(ctx).await {
            self.done = true;
            return vec![];
        }

        let entries = self.toc_entries(ctx).await;
        let prompt = format!("ToC entries for book {}: {entries:?}", self.book_id);
        let request = ChatRequest {
            system_prompt: Some("Reconcile table-of-contents page-link discrepancies and propose a chapter hierarchy.".to_string()),
            messages: vec![ChatMessage { role: "user".to_string(), content: prompt.clone() }],
            tools: None,
        };

        let mut unit = WorkUnit::new(self.id.clone(), WorkKind::Llm, WorkPayload::Chat(request)).with_attribution(Attribution {
            book_id: Some(self.book_id.clone()),
            page_id: None,
            stage: Some("toc-finalize".to_string()),
            item_key: None,
            prompt_key: Some("toc-finalize".to_string()),
            prompt_cid: Some(crate::records::prompt_cid(&prompt)),
        });
        if let Some(provider) = &self.llm_provider {
            unit = unit.with_provider(provider.clone());
        }

        self.pending_unit = Some(unit.id.clone());
        vec![unit]
    }

    async fn on_complete(&mut self, ctx: &ServiceContext, result: WorkResult) -> Vec<WorkUnit> {
        if self.pending_unit.as_deref() != Some(result.unit_id.as_str()) {
            warn!(job_id = %self.id, unit_id = %result.unit_id, "toc-finalize job received unknown unit id");
            return vec![];
        }
        self.pending_unit = None;

        if !result.success {
            warn!(job_id = %self.id, error = ?result.error, "toc-finalize reconciliation call failed");
            self.done = true;
            return vec![];
        }

        if let ResultPayload::Chat(c) = &result.payload {
            if let Some(toc) = ctx
                .document_store
                .query("ToC", &[Filter::eq("book_id", json!(self.book_id))])
                .await
                .unwrap_or_default()
                .into_iter()
                .next()
            {
                let toc_id = toc.get("id").and_then(Value::as_str).unwrap_or_default();
                ctx.sink.send(WriteOp::update("ToC", toc_id, json!({ "finalized": true, "reconciliation_notes": c.text }))).await;
            }
        }

        self.done = true;
        vec![]
    }

    fn done(&self) -> bool {
        self.done
    }

    fn status(&self) -> JobStatusMap {
        let mut map = JobStatusMap::new();
        map.insert("book_id".to_string(), json!(self.book_id));
        map.insert("done".to_string(), json!(self.done));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancelToken;
    use crate::document_store::fake::FakeDocumentStore;
    use crate::model::ChatResult;
    use crate::sink::WriteSink;
    use std::sync::Arc;

    fn test_ctx() -> (ServiceContext, Arc<FakeDocumentStore>) {
        let store = Arc::new(FakeDocumentStore::new());
        let cancel = CancelToken::new();
        let (sink, _handle) = WriteSink::spawn(store.clone(), Default::default(), cancel.clone());
        let ctx = ServiceContext::new(store.clone(), sink, Arc::new(crate::registry::ConfigStore::new_empty()), cancel);
        (ctx, store)
    }

    #[tokio::test]
    async fn already_finalized_toc_emits_no_units() {
        let (ctx, store) = test_ctx();
        store.create("ToC", json!({ "book_id": "b1", "finalized": true })).await.unwrap();

        let mut job = TocFinalizeJob::new("b1", None);
        job.set_record_id("j1".to_string());
        let units = job.start(&ctx).await;
        assert!(units.is_empty());
        assert!(job.done());
    }

    #[tokio::test]
    async fn unfinalized_toc_emits_one_unit_and_finalizes_on_result() {
        let (ctx, store) = test_ctx();
        let toc_id = store.create("ToC", json!({ "book_id": "b2", "finalized": false })).await.unwrap();

        let mut job = TocFinalizeJob::new("b2", None);
        job.set_record_id("j2".to_string());
        let units = job.start(&ctx).await;
        assert_eq!(units.len(), 1);

        let result = WorkResult {
            unit_id: units[0].id.clone(),
            job_id: "j2".to_string(),
            success: true,
            error: None,
            payload: ResultPayload::Chat(ChatResult { text: "ok".to_string(), input_tokens: 1, output_tokens: 1, cost_usd: 0.0, tool_calls: vec![] }),
            attribution: None,
        };
        job.on_complete(&ctx, result).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let toc = store.get("ToC", &toc_id).await.unwrap().unwrap();
        assert_eq!(toc.get("finalized"), Some(&json!(true)));
        assert!(job.done());
    }
}

//! The book-processing orchestrator (spec.md §4.5): runs a book through
//! OCR, metadata extraction, table-of-contents discovery/extraction/
//! linking/finalizing, chapter-structure building, and text polishing.
//!
//! Each stage's completeness is re-derived from the document store so that
//! `start` is idempotent on resume (spec.md §8 S3): a freshly reconstructed
//! job only emits units for pages/entries/chapters whose artifact is
//! missing. Within a single run, a small set of in-memory flags shadows
//! that derivation — the write sink is fire-and-forget, so a store query
//! issued immediately after enqueuing a write for the same stage may not
//! yet observe it; the flags prevent re-emitting that stage's units before
//! the write lands, without weakening the resume guarantee (a genuinely
//! restarted process has empty flags and trusts the store alone, which is
//! safe because redoing a little work is acceptable — spec.md §1 Non-goals
//! disclaims exactly-once delivery).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::context::ServiceContext;
use crate::document_store::Filter;
use crate::jobs::{Job, JobFactory, JobStatusMap};
use crate::model::{Attribution, ChatMessage, ChatRequest, JobId, OcrRequest, UnitId, WorkKind, WorkPayload, WorkResult, WorkUnit};

pub const JOB_TYPE: &str = "book_processing";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Ocr,
    Metadata,
    TocFind,
    TocExtract,
    TocLink,
    TocFinalize,
    Structure,
    Polish,
    Done,
}

#[derive(Clone)]
enum UnitTag {
    Ocr { page_id: String },
    Metadata,
    TocFind,
    TocExtract,
    TocLink,
    TocFinalize,
    Structure,
    Polish { chapter_id: String },
}

pub struct BookProcessingJob {
    id: JobId,
    book_id: String,
    ocr_provider: Option<String>,
    llm_provider: Option<String>,
    stage: Stage,
    in_flight: HashMap<UnitId, UnitTag>,

    completed_pages: HashSet<String>,
    metadata_done: bool,
    toc_found: bool,
    toc_extracted: bool,
    toc_linked: bool,
    toc_finalized: bool,
    structure_done: bool,
    polished_chapters: HashSet<String>,
}

impl BookProcessingJob {
    pub fn new(book_id: impl Into<String>, ocr_provider: Option<String>, llm_provider: Option<String>) -> Self {
        Self {
            id: String::new(),
            book_id: book_id.into(),
            ocr_provider,
            llm_provider,
            stage: Stage::Ocr,
            in_flight: HashMap::new(),
            completed_pages: HashSet::new(),
            metadata_done: false,
            toc_found: false,
            toc_extracted: false,
            toc_linked: false,
            toc_finalized: false,
            structure_done: false,
            polished_chapters: HashSet::new(),
        }
    }

    /// Returns a `JobFactory` the scheduler can register for `JOB_TYPE`,
    /// reconstructing a job from its durable metadata on resume.
    pub fn factory() -> JobFactory {
        std::sync::Arc::new(|id: JobId, metadata: HashMap<String, Value>| {
            let book_id = metadata.get("book_id").and_then(Value::as_str).unwrap_or_default().to_string();
            let ocr_provider = metadata.get("ocr_provider").and_then(Value::as_str).map(str::to_string);
            let llm_provider = metadata.get("llm_provider").and_then(Value::as_str).map(str::to_string);
            let mut job = BookProcessingJob::new(book_id, ocr_provider, llm_provider);
            job.id = id;
            Box::new(job) as Box<dyn Job>
        })
    }

    fn attribution(&self, stage: &str, item_key: Option<String>, prompt: &str) -> Attribution {
        Attribution {
            book_id: Some(self.book_id.clone()),
            page_id: None,
            stage: Some(stage.to_string()),
            item_key,
            prompt_key: Some(stage.to_string()),
            prompt_cid: Some(crate::records::prompt_cid(prompt)),
        }
    }

    fn llm_unit(&self, stage: &str, prompt: impl Into<String>, item_key: Option<String>) -> WorkUnit {
        let prompt = prompt.into();
        let request = ChatRequest {
            system_prompt: Some(format!("You are assisting with the {stage} stage of digitizing a book.")),
            messages: vec![ChatMessage { role: "user".to_string(), content: prompt.clone() }],
            tools: None,
        };
        let mut unit = WorkUnit::new(self.id.clone(), WorkKind::Llm, WorkPayload::Chat(request))
            .with_attribution(self.attribution(stage, item_key, &prompt));
        if let Some(provider) = &self.llm_provider {
            unit = unit.with_provider(provider.clone());
        }
        unit
    }

    /// Walks the stage chain, skipping any stage whose artifact already
    /// exists, until it finds one needing work or reaches `Done`.
    async fn advance(&mut self, ctx: &ServiceContext) -> Vec<WorkUnit> {
        loop {
            match self.stage {
                Stage::Ocr => {
                    let pages = ctx
                        .document_store
                        .query("Page", &[Filter::eq("book_id", json!(self.book_id))])
                        .await
                        .unwrap_or_default();
                    let missing: Vec<Value> = pages
                        .into_iter()
                        .filter(|p| {
                            let id = p.get("id").and_then(Value::as_str).unwrap_or_default();
                            p.get("ocr_text").is_none() && !self.completed_pages.contains(id)
                        })
                        .collect();
                    if missing.is_empty() {
                        self.stage = Stage::Metadata;
                        continue;
                    }
                    return missing.into_iter().filter_map(|p| self.emit_ocr(p)).collect();
                }
                Stage::Metadata => {
                    if self.metadata_done || self.book_has_metadata(ctx).await {
                        self.stage = Stage::TocFind;
                        continue;
                    }
                    let pages = self.page_texts(ctx).await;
                    let unit = self.llm_unit(
                        "metadata",
                        format!("Extract {{title, author}} as JSON from these OCR'd pages:\n{pages}"),
                        None,
                    );
                    self.in_flight.insert(unit.id.clone(), UnitTag::Metadata);
                    return vec![unit];
                }
                Stage::TocFind => {
                    if self.toc_found || self.toc_doc(ctx).await.is_some() {
                        self.stage = Stage::TocExtract;
                        continue;
                    }
                    let pages = self.page_texts(ctx).await;
                    let unit = self.llm_unit(
                        "toc-find",
                        format!("Which page numbers contain the table of contents? Pages:\n{pages}"),
                        None,
                    );
                    self.in_flight.insert(unit.id.clone(), UnitTag::TocFind);
                    return vec![unit];
                }
                Stage::TocExtract => {
                    if self.toc_extracted || !self.toc_entries(ctx).await.is_empty() {
                        self.stage = Stage::TocLink;
                        continue;
                    }
                    let Some(toc) = self.toc_doc(ctx).await else {
                        // TocFind result not yet visible through the sink; wait for it.
                        return vec![];
                    };
                    let toc_id = toc.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                    let unit = self.llm_unit(
                        "toc-extract",
                        format!("Extract {{title, page_number}} entries as a JSON array from ToC id {toc_id}."),
                        Some(toc_id),
                    );
                    self.in_flight.insert(unit.id.clone(), UnitTag::TocExtract);
                    return vec![unit];
                }
                Stage::TocLink => {
                    let entries = self.toc_entries(ctx).await;
                    let unresolved = !self.toc_linked
                        && entries.iter().any(|e| e.get("linked_page_id").map(Value::is_null).unwrap_or(true));
                    if !unresolved {
                        self.stage = Stage::TocFinalize;
                        continue;
                    }
                    let pages = self.page_texts(ctx).await;
                    let unit = self.llm_unit(
                        "toc-link",
                        format!("Resolve each ToC entry's page_number to a Page document id.\nEntries: {entries:?}\nPages:\n{pages}"),
                        None,
                    );
                    self.in_flight.insert(unit.id.clone(), UnitTag::TocLink);
                    return vec![unit];
                }
                Stage::TocFinalize => {
                    let finalized = self.toc_finalized
                        || self
                            .toc_doc(ctx)
                            .await
                            .map(|t| t.get("finalized") == Some(&json!(true)))
                            .unwrap_or(false);
                    if finalized {
                        self.stage = Stage::Structure;
                        continue;
                    }
                    let unit = self.llm_unit("toc-finalize", "Reconcile any remaining ToC page-link discrepancies.", None);
                    self.in_flight.insert(unit.id.clone(), UnitTag::TocFinalize);
                    return vec![unit];
                }
                Stage::Structure => {
                    if self.structure_done || !self.chapters(ctx).await.is_empty() {
                        self.stage = Stage::Polish;
                        continue;
                    }
                    let entries = self.toc_entries(ctx).await;
                    let unit = self.llm_unit(
                        "structure",
                        format!("Build the chapter hierarchy from these ToC entries: {entries:?}"),
                        None,
                    );
                    self.in_flight.insert(unit.id.clone(), UnitTag::Structure);
                    return vec![unit];
                }
                Stage::Polish => {
                    let chapters = self.chapters(ctx).await;
                    let unpolished: Vec<Value> = chapters
                        .into_iter()
                        .filter(|c| {
                            let id = c.get("id").and_then(Value::as_str).unwrap_or_default();
                            c.get("polished") != Some(&json!(true)) && !self.polished_chapters.contains(id)
                        })
                        .collect();
                    if unpolished.is_empty() {
                        self.stage = Stage::Done;
                        continue;
                    }
                    return unpolished.into_iter().filter_map(|c| self.emit_polish(c)).collect();
                }
                Stage::Done => return vec![],
            }
        }
    }

    fn emit_ocr(&mut self, page: Value) -> Option<WorkUnit> {
        let page_id = page.get("id").and_then(Value::as_str)?.to_string();
        let page_number = page.get("page_number").and_then(Value::as_u64).unwrap_or(0) as u32;
        let image_bytes = page
            .get("image_base64")
            .and_then(Value::as_str)
            .map(|s| s.as_bytes().to_vec())
            .unwrap_or_default();

        let mut unit = WorkUnit::new(self.id.clone(), WorkKind::Ocr, WorkPayload::Ocr(OcrRequest { image_bytes, page_number }))
            .with_attribution(Attribution {
                book_id: Some(self.book_id.clone()),
                page_id: Some(page_id.clone()),
                stage: Some("ocr".to_string()),
                item_key: Some(page_id.clone()),
                prompt_key: None,
                prompt_cid: None,
            });
        if let Some(provider) = &self.ocr_provider {
            unit = unit.with_provider(provider.clone());
        }
        self.in_flight.insert(unit.id.clone(), UnitTag::Ocr { page_id });
        Some(unit)
    }

    fn emit_polish(&mut self, chapter: Value) -> Option<WorkUnit> {
        let chapter_id = chapter.get("id").and_then(Value::as_str)?.to_string();
        let text = chapter.get("structure_text").and_then(Value::as_str).unwrap_or_default();
        let unit = self.llm_unit(
            "polish",
            format!("Polish this chapter's text for readability, preserving meaning:\n{text}"),
            Some(chapter_id.clone()),
        );
        self.in_flight.insert(unit.id.clone(), UnitTag::Polish { chapter_id });
        Some(unit)
    }

    async fn book_has_metadata(&self, ctx: &ServiceContext) -> bool {
        ctx.document_store
            .get("Book", &self.book_id)
            .await
            .ok()
            .flatten()
            .map(|b| b.get("title").is_some())
            .unwrap_or(false)
    }

    async fn toc_doc(&self, ctx: &ServiceContext) -> Option<Value> {
        ctx.document_store
            .query("ToC", &[Filter::eq("book_id", json!(self.book_id))])
            .await
            .ok()?
            .into_iter()
            .next()
    }

    async fn toc_entries(&self, ctx: &ServiceContext) -> Vec<Value> {
        let Some(toc) = self.toc_doc(ctx).await else { return vec![] };
        let toc_id = toc.get("id").and_then(Value::as_str).unwrap_or_default();
        ctx.document_store
            .query("TocEntry", &[Filter::eq("toc_id", json!(toc_id))])
            .await
            .unwrap_or_default()
    }

    async fn chapters(&self, ctx: &ServiceContext) -> Vec<Value> {
        ctx.document_store
            .query("Chapter", &[Filter::eq("book_id", json!(self.book_id))])
            .await
            .unwrap_or_default()
    }

    async fn page_texts(&self, ctx: &ServiceContext) -> String {
        let pages = ctx
            .document_store
            .query("Page", &[Filter::eq("book_id", json!(self.book_id))])
            .await
            .unwrap_or_default();
        pages
            .iter()
            .filter_map(|p| p.get("ocr_text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n---\n")
    }
}

#[async_trait]
impl Job for BookProcessingJob {
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
        if let Some(provider) = &self.ocr_provider {
            meta.insert("ocr_provider".to_string(), json!(provider));
        }
        if let Some(provider) = &self.llm_provider {
            meta.insert("llm_provider".to_string(), json!(provider));
        }
        meta
    }

    async fn start(&mut self, ctx: &ServiceContext) -> Vec<WorkUnit> {
        self.advance(ctx).await
    }

    async fn on_complete(&mut self, ctx: &ServiceContext, result: WorkResult) -> Vec<WorkUnit> {
        let Some(tag) = self.in_flight.remove(&result.unit_id) else {
            warn!(job_id = %self.id, unit_id = %result.unit_id, "book-processing job received unknown unit id");
            return vec![];
        };

        self.apply_result(ctx, &tag, &result).await;

        let stage_still_busy = self.in_flight.values().any(|t| std::mem::discriminant(t) == std::mem::discriminant(&tag));
        if stage_still_busy {
            return vec![];
        }
        self.advance(ctx).await
    }

    fn done(&self) -> bool {
        self.stage == Stage::Done
    }

    fn status(&self) -> JobStatusMap {
        let mut map = JobStatusMap::new();
        map.insert("book_id".to_string(), json!(self.book_id));
        map.insert(
            "stage".to_string(),
            json!(match self.stage {
                Stage::Ocr => "ocr",
                Stage::Metadata => "metadata",
                Stage::TocFind => "toc_find",
                Stage::TocExtract => "toc_extract",
                Stage::TocLink => "toc_link",
                Stage::TocFinalize => "toc_finalize",
                Stage::Structure => "structure",
                Stage::Polish => "polish",
                Stage::Done => "done",
            }),
        );
        map
    }
}

impl BookProcessingJob {
    async fn apply_result(&mut self, ctx: &ServiceContext, tag: &UnitTag, result: &WorkResult) {
        use crate::model::{ResultPayload, WriteOp};

        if !result.success {
            warn!(job_id = %self.id, unit_id = %result.unit_id, error = ?result.error, "book-processing unit failed");
        }

        match tag {
            UnitTag::Ocr { page_id } => {
                if let ResultPayload::Ocr(ocr) = &result.payload {
                    ctx.sink
                        .send(WriteOp::update("Page", page_id.clone(), json!({ "ocr_text": ocr.text, "ocr_cost_usd": ocr.cost_usd })))
                        .await;
                }
                self.completed_pages.insert(page_id.clone());
            }
            UnitTag::Metadata => {
                if let ResultPayload::Chat(c) = &result.payload {
                    let parsed: Value = serde_json::from_str(&c.text).unwrap_or_else(|_| json!({ "metadata_raw": c.text }));
                    ctx.sink.send(WriteOp::update("Book", self.book_id.clone(), parsed)).await;
                }
                self.metadata_done = true;
            }
            UnitTag::TocFind => {
                if let ResultPayload::Chat(c) = &result.payload {
                    let pages: Value = serde_json::from_str(&c.text).unwrap_or_else(|_| json!([]));
                    ctx.sink
                        .send(WriteOp::create("ToC", json!({ "book_id": self.book_id, "toc_pages": pages, "finalized": false })))
                        .await;
                }
                self.toc_found = true;
            }
            UnitTag::TocExtract => {
                if let ResultPayload::Chat(c) = &result.payload {
                    if let Ok(Value::Array(entries)) = serde_json::from_str::<Value>(&c.text) {
                        for entry in entries {
                            let title = entry.get("title").cloned().unwrap_or(Value::Null);
                            let page_number = entry.get("page_number").cloned().unwrap_or(Value::Null);
                            ctx.sink
                                .send(WriteOp::create(
                                    "TocEntry",
                                    json!({ "book_id": self.book_id, "title": title, "page_number": page_number, "linked_page_id": null }),
                                ))
                                .await;
                        }
                    }
                }
                self.toc_extracted = true;
            }
            UnitTag::TocLink => {
                if let ResultPayload::Chat(c) = &result.payload {
                    if let Ok(Value::Array(links)) = serde_json::from_str::<Value>(&c.text) {
                        for link in links {
                            if let (Some(id), Some(page_id)) =
                                (link.get("id").and_then(Value::as_str), link.get("page_id").and_then(Value::as_str))
                            {
                                ctx.sink.send(WriteOp::update("TocEntry", id, json!({ "linked_page_id": page_id }))).await;
                            }
                        }
                    }
                }
                self.toc_linked = true;
            }
            UnitTag::TocFinalize => {
                if let Some(toc) = self.toc_doc(ctx).await {
                    let toc_id = toc.get("id").and_then(Value::as_str).unwrap_or_default();
                    ctx.sink.send(WriteOp::update("ToC", toc_id, json!({ "finalized": true }))).await;
                }
                self.toc_finalized = true;
            }
            UnitTag::Structure => {
                if let ResultPayload::Chat(c) = &result.payload {
                    if let Ok(Value::Array(chapters)) = serde_json::from_str::<Value>(&c.text) {
                        for (order, chapter) in chapters.into_iter().enumerate() {
                            ctx.sink
                                .send(WriteOp::create(
                                    "Chapter",
                                    json!({ "book_id": self.book_id, "order": order, "structure_text": chapter, "polished": false }),
                                ))
                                .await;
                        }
                    }
                }
                self.structure_done = true;
            }
            UnitTag::Polish { chapter_id } => {
                if let ResultPayload::Chat(c) = &result.payload {
                    ctx.sink
                        .send(WriteOp::update("Chapter", chapter_id.clone(), json!({ "polished_text": c.text, "polished": true })))
                        .await;
                }
                self.polished_chapters.insert(chapter_id.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancelToken;
    use crate::document_store::fake::FakeDocumentStore;
    use crate::model::ResultPayload;
    use crate::sink::WriteSink;
    use std::sync::Arc;

    fn test_ctx() -> (ServiceContext, Arc<FakeDocumentStore>) {
        let store = Arc::new(FakeDocumentStore::new());
        let cancel = CancelToken::new();
        let (sink, _handle) = WriteSink::spawn(store.clone(), Default::default(), cancel.clone());
        let ctx = ServiceContext::new(
            store.clone(),
            sink,
            Arc::new(crate::registry::ConfigStore::new_empty()),
            cancel,
        );
        (ctx, store)
    }

    #[tokio::test]
    async fn resume_emits_units_only_for_missing_ocr_pages() {
        let (ctx, store) = test_ctx();
        for i in 0..10 {
            let done = i < 5;
            let mut doc = json!({ "book_id": "book-1", "page_number": i });
            if done {
                doc["ocr_text"] = json!("already done");
            }
            store.create("Page", doc).await.unwrap();
        }

        let mut job = BookProcessingJob::new("book-1", None, None);
        job.set_record_id("job-1".to_string());
        let units = job.start(&ctx).await;
        assert_eq!(units.len(), 5);
        assert!(units.iter().all(|u| u.kind == WorkKind::Ocr));
    }

    #[tokio::test]
    async fn fully_complete_book_resumes_with_zero_units() {
        let (ctx, store) = test_ctx();
        let book = store.create("Book", json!({ "title": "T", "author": "A" })).await.unwrap();
        for i in 0..3 {
            store.create("Page", json!({ "book_id": book, "page_number": i, "ocr_text": "x" })).await.unwrap();
        }
        let toc = store.create("ToC", json!({ "book_id": book, "finalized": true })).await.unwrap();
        let entry = store
            .create("TocEntry", json!({ "toc_id": toc, "title": "Ch1", "page_number": 0, "linked_page_id": "p0" }))
            .await
            .unwrap();
        let _ = entry;
        store.create("Chapter", json!({ "book_id": book, "polished": true })).await.unwrap();

        let mut job = BookProcessingJob::new(book, None, None);
        job.set_record_id("job-2".to_string());
        let units = job.start(&ctx).await;
        assert!(units.is_empty());
        assert!(job.done());
    }

    #[tokio::test]
    async fn ocr_result_updates_page_and_unblocks_next_stage_once_all_resolve() {
        let (ctx, store) = test_ctx();
        let p1 = store.create("Page", json!({ "book_id": "book-9", "page_number": 0 })).await.unwrap();

        let mut job = BookProcessingJob::new("book-9", None, None);
        job.set_record_id("job-3".to_string());
        let units = job.start(&ctx).await;
        assert_eq!(units.len(), 1);

        let result = WorkResult {
            unit_id: units[0].id.clone(),
            job_id: "job-3".to_string(),
            success: true,
            error: None,
            payload: ResultPayload::Ocr(crate::model::OcrResult { text: "hello".to_string(), cost_usd: 0.01 }),
            attribution: None,
        };
        let _ = job.on_complete(&ctx, result).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let page = store.get("Page", &p1).await.unwrap().unwrap();
        assert_eq!(page.get("ocr_text").and_then(Value::as_str), Some("hello"));
    }
}

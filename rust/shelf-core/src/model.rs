//! Data model shared across the scheduler, pools, jobs, and the write sink.
//!
//! Mirrors spec.md §3. `JobRecord` is durable (round-trips through the
//! document store); `WorkUnit` and `WorkResult` are ephemeral, in-memory
//! only, and never themselves persisted — jobs persist whatever artifacts
//! they derive from a result via the write sink.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stable identifier for a durable job record. Assigned by the document
/// store on `create`, never invented client-side, so resumption can trust
/// it as a foreign key for per-page/per-entry artifacts.
pub type JobId = String;

/// Identifier for a work unit, unique within its owning job only.
pub type UnitId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Durable job record, stored in the `Job` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub submitted_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<String>,
    /// Free-form metadata used to reconstruct the job on resume (e.g. book
    /// id, configured provider names, stage cursor).
    pub metadata: HashMap<String, serde_json::Value>,
}

impl JobRecord {
    pub fn new_running(id: JobId, job_type: impl Into<String>, metadata: HashMap<String, serde_json::Value>) -> Self {
        Self {
            id,
            job_type: job_type.into(),
            status: JobStatus::Running,
            submitted_at: chrono::Utc::now(),
            started_at: Some(chrono::Utc::now()),
            ended_at: None,
            error: None,
            metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Llm,
    Ocr,
    Tts,
    Cpu,
}

impl WorkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkKind::Llm => "llm",
            WorkKind::Ocr => "ocr",
            WorkKind::Tts => "tts",
            WorkKind::Cpu => "cpu",
        }
    }
}

/// Optional `{book, page, stage, prompt}` tuple stamped on a work unit so
/// pool-emitted Metric/LLMCall records can be correlated (spec.md §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attribution {
    pub book_id: Option<String>,
    pub page_id: Option<String>,
    pub stage: Option<String>,
    pub item_key: Option<String>,
    pub prompt_key: Option<String>,
    pub prompt_cid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Option<Vec<ChatToolSchema>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrRequest {
    pub image_bytes: Vec<u8>,
    pub page_number: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsRequest {
    pub text: String,
    pub voice: String,
}

/// Kind-specific payload for a work unit. The CPU variant is intentionally
/// opaque — audio concatenation and XHTML assembly bodies are out of scope
/// (spec.md §1); the core only needs to route and bound their concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkPayload {
    Chat(ChatRequest),
    Ocr(OcrRequest),
    Tts(TtsRequest),
    Cpu(serde_json::Value),
}

#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub id: UnitId,
    pub job_id: JobId,
    pub kind: WorkKind,
    /// Explicit provider-name selector, or `None` to route to any pool of
    /// matching kind (preferring the first registered).
    pub provider: Option<String>,
    pub payload: WorkPayload,
    pub attribution: Option<Attribution>,
    /// Attempts already consumed by a previous dispatch of the *same*
    /// logical unit id; used only for diagnostics, retries are internal
    /// to the pool and never change the unit's identity.
    pub attempt: u32,
}

impl WorkUnit {
    pub fn new(job_id: JobId, kind: WorkKind, payload: WorkPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id,
            kind,
            provider: None,
            payload,
            attribution: None,
            attempt: 0,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_attribution(mut self, attribution: Attribution) -> Self {
        self.attribution = Some(attribution);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResult {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub tool_calls: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    pub text: String,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsResult {
    pub audio: Vec<u8>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResultPayload {
    Chat(ChatResult),
    Ocr(OcrResult),
    Tts(TtsResult),
    Cpu(serde_json::Value),
    /// No payload: used for synthetic failures (routing, queue-full,
    /// cancellation, retries exhausted without a kind-specific body).
    None,
}

#[derive(Debug, Clone)]
pub struct WorkResult {
    pub unit_id: UnitId,
    pub job_id: JobId,
    pub success: bool,
    pub error: Option<String>,
    pub payload: ResultPayload,
    pub attribution: Option<Attribution>,
}

impl WorkResult {
    pub fn failure(unit: &WorkUnit, error: impl Into<String>) -> Self {
        Self {
            unit_id: unit.id.clone(),
            job_id: unit.job_id.clone(),
            success: false,
            error: Some(error.into()),
            payload: ResultPayload::None,
            attribution: unit.attribution.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOpKind {
    Create,
    Update,
    Delete,
}

/// A single write issued against the document store, routed through the
/// sink (spec.md §4.6, §3).
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub op: WriteOpKind,
    pub collection: String,
    /// Required for update/delete; assigned by the store on create unless
    /// the caller pre-assigns a client-generated id (both are valid; the
    /// store tolerates idempotent re-creation, spec.md §6).
    pub document_id: Option<String>,
    pub document: serde_json::Value,
}

impl WriteOp {
    pub fn create(collection: impl Into<String>, document: serde_json::Value) -> Self {
        Self {
            op: WriteOpKind::Create,
            collection: collection.into(),
            document_id: None,
            document,
        }
    }

    pub fn update(collection: impl Into<String>, document_id: impl Into<String>, document: serde_json::Value) -> Self {
        Self {
            op: WriteOpKind::Update,
            collection: collection.into(),
            document_id: Some(document_id.into()),
            document,
        }
    }

    pub fn delete(collection: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            op: WriteOpKind::Delete,
            collection: collection.into(),
            document_id: Some(document_id.into()),
            document: serde_json::Value::Null,
        }
    }
}

/// Durable configuration entry, `Config` collection (spec.md §3, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: ConfigValue,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Scalar(serde_json::Value),
    List(Vec<serde_json::Value>),
}

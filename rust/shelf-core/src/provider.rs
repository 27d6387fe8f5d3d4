//! The provider client contract (spec.md §6): the narrow capability set
//! any bound OCR/LLM/TTS client must implement. Bodies live outside this
//! crate; only the interface is pinned here.

use async_trait::async_trait;
use std::time::Duration;

use crate::model::{ChatRequest, ChatResult, ChatToolSchema, OcrResult, TtsResult};

/// Error classification a provider call can surface. The pool, not the
/// provider client, decides retriable-vs-terminal using this shape plus
/// the raw message (spec.md §4.2 step 3).
#[derive(Debug, Clone)]
pub enum ProviderErrorKind {
    /// HTTP 500/502/503/504 or an equivalent transient server error.
    ServerError(u16),
    /// 429 or a structured rate-limit signal; carries `retry-after` when
    /// the provider supplied one.
    RateLimited { retry_after: Option<Duration> },
    Timeout,
    ConnectionFailed,
    /// Structured parse failure on an otherwise-successful HTTP response
    /// (e.g. the model did not return valid JSON for a tool call).
    JsonParse,
    /// 4xx other than 429, auth failures, and anything else non-retriable.
    Terminal,
}

#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn terminal(message: impl Into<String>) -> Self {
        Self { kind: ProviderErrorKind::Terminal, message: message.into() }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::ServerError(_)
                | ProviderErrorKind::RateLimited { .. }
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::ConnectionFailed
                | ProviderErrorKind::JsonParse
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self.kind {
            ProviderErrorKind::RateLimited { retry_after } => retry_after,
            _ => None,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::RateLimited { .. })
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Capability set required from any bound provider client (spec.md §6).
/// `requests_per_second`/`max_concurrency`/`max_retries` returning 0 means
/// "use the pool default"; the registry resolves those at pool-build time.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn name(&self) -> &str;
    fn requests_per_second(&self) -> f64;
    fn max_concurrency(&self) -> usize;
    fn max_retries(&self) -> u32;

    async fn chat(&self, req: &ChatRequest) -> ProviderResult<ChatResult> {
        let _ = req;
        Err(ProviderError::terminal(format!("{} does not implement chat", self.name())))
    }

    async fn chat_with_tools(&self, req: &ChatRequest, tools: &[ChatToolSchema]) -> ProviderResult<ChatResult> {
        let _ = (req, tools);
        Err(ProviderError::terminal(format!("{} does not implement chat_with_tools", self.name())))
    }

    async fn process_image(&self, bytes: &[u8], page_num: u32) -> ProviderResult<OcrResult> {
        let _ = (bytes, page_num);
        Err(ProviderError::terminal(format!("{} does not implement process_image", self.name())))
    }

    async fn synthesize(&self, text: &str, voice: &str, params: &serde_json::Value) -> ProviderResult<TtsResult> {
        let _ = (text, voice, params);
        Err(ProviderError::terminal(format!("{} does not implement synthesize", self.name())))
    }
}

//! Crate-wide error taxonomy.
//!
//! Unit-local failures (a failed provider call, a parse error) never
//! surface as a `ShelfError` — they stay inside `WorkResult::error` per the
//! data model. This type covers the error kinds from spec.md §7 that are
//! not representable as a per-unit result: routing, job construction,
//! persistence, cancellation, and configuration.

use thiserror::Error;

pub type ShelfResult<T> = Result<T, ShelfError>;

#[derive(Error, Debug)]
pub enum ShelfError {
    /// No registered pool matches a work unit's (kind, provider) selector.
    #[error("no pool matches kind={kind:?} provider={provider:?}")]
    Routing {
        kind: &'static str,
        provider: Option<String>,
    },

    /// A job's `start` failed before the scheduler could return from `submit`.
    #[error("job construction failed: {0}")]
    JobConstruction(String),

    /// Document-store I/O failed in a context that cannot retry internally
    /// (e.g. creating the initial job record during `submit`).
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A duplicate name was registered (pool or job-type factory).
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// The operation observed cancellation of the shared token.
    #[error("cancelled")]
    Cancelled,

    /// Provider registry / configuration-store reconstruction failed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for conditions that don't fit a narrower variant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for ShelfError {
    fn from(err: reqwest::Error) -> Self {
        ShelfError::Persistence(err.to_string())
    }
}

//! Error types for the mail-finance pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {

    // =============================
    // Core Pipeline Errors
    // =============================

    /// Network / rate-limit trouble at the mail source. Retryable with
    /// backoff; the cursor must not advance past the failed window.
    #[error("Transient source error: {0}")]
    TransientSource(String),

    /// Credential invalid, expired beyond refresh, or revoked by the user.
    /// Halts sync for the affected mailbox only.
    #[error("Auth error: {0}")]
    Auth(String),

    /// Extraction produced output that violates the expected schema or
    /// could not be parsed. The message is marked failed; the batch
    /// continues.
    #[error("Extraction mismatch: {0}")]
    ExtractionMismatch(String),

    /// Two writers observed on one dedup key. Cannot happen under correct
    /// single-writer discipline; if it does, it is a bug, not user error.
    #[error("Reconciliation conflict: {0}")]
    ReconciliationConflict(String),

    #[error("Vault error: {0}")]
    Vault(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether a retry at the next scheduled run can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientSource(_) | PipelineError::Http(_)
        )
    }
}

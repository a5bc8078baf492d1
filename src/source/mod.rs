//! Mail source adapters
//!
//! The pipeline is polymorphic over one capability: list message ids
//! past a cursor, fetch one message. One adapter per provider; adding a
//! provider never touches the pipeline.

use crate::error::PipelineError;
use crate::models::SyncCursor;
use crate::vault::Credential;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod gmail;
pub mod mock;

pub use gmail::GmailSource;
pub use mock::MockMailSource;

/// Failure modes a provider is allowed to surface. Everything else is a
/// bug in the adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// Access token no longer accepted; the caller refreshes the
    /// credential and retries.
    #[error("source auth expired")]
    AuthExpired,

    /// Provider asked us to back off. Not a pipeline failure.
    #[error("source rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient source failure: {0}")]
    Transient(String),
}

impl From<SourceError> for PipelineError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::AuthExpired => PipelineError::Auth("source auth expired".to_string()),
            SourceError::RateLimited { .. } => {
                PipelineError::TransientSource("rate limited".to_string())
            }
            SourceError::Transient(msg) => PipelineError::TransientSource(msg),
        }
    }
}

/// Listing entry: id plus the provider timestamp used for watermarking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSummary {
    pub provider_message_id: String,
    pub internal_date_ms: i64,
}

/// One finite page of listings, in provider order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessageSummary>,
    pub next_page_token: Option<String>,
}

/// Full message content as the provider returned it. The pipeline turns
/// this into a `RawMessage` (fingerprint, status) before persisting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedMessage {
    pub provider_message_id: String,
    pub internal_date_ms: i64,
    pub from_header: String,
    pub subject: String,
    pub snippet: String,
    pub body_text: String,
    pub list_unsubscribe: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Capability interface every mail provider implements.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// List message summaries strictly past the cursor watermark, oldest
    /// first, one finite page at a time.
    async fn list_messages_since(
        &self,
        credential: &Credential,
        cursor: SyncCursor,
        page_token: Option<String>,
        page_size: usize,
    ) -> std::result::Result<MessagePage, SourceError>;

    /// Fetch one message's content by provider id.
    async fn fetch_message(
        &self,
        credential: &Credential,
        provider_message_id: &str,
    ) -> std::result::Result<FetchedMessage, SourceError>;
}

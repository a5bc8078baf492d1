//! In-memory mail source for development and tests
//!
//! Deterministic: listings come back oldest-first past the watermark,
//! page tokens are plain offsets, and injected failures surface exactly
//! once.

use super::{FetchedMessage, MailSource, MessagePage, MessageSummary, SourceError};
use crate::models::SyncCursor;
use crate::vault::Credential;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

pub struct MockMailSource {
    messages: Arc<RwLock<Vec<FetchedMessage>>>,
    fail_next: Arc<Mutex<Option<SourceError>>>,
    fail_fetch_of: Arc<Mutex<Option<(String, SourceError)>>>,
}

impl MockMailSource {
    pub fn new() -> Self {
        Self {
            messages: Arc::new(RwLock::new(Vec::new())),
            fail_next: Arc::new(Mutex::new(None)),
            fail_fetch_of: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn seed(&self, mut messages: Vec<FetchedMessage>) {
        let mut store = self.messages.write().await;
        store.append(&mut messages);
        store.sort_by_key(|m| m.internal_date_ms);
    }

    /// Make the next list or fetch call fail with the given error.
    pub async fn fail_once(&self, error: SourceError) {
        *self.fail_next.lock().await = Some(error);
    }

    /// Make the next fetch of one specific message fail (crash-window
    /// simulation for resumability tests).
    pub async fn fail_fetch_of(&self, provider_message_id: &str, error: SourceError) {
        *self.fail_fetch_of.lock().await = Some((provider_message_id.to_string(), error));
    }

    async fn take_injected_failure(&self) -> Option<SourceError> {
        self.fail_next.lock().await.take()
    }
}

impl Default for MockMailSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailSource for MockMailSource {
    async fn list_messages_since(
        &self,
        _credential: &Credential,
        cursor: SyncCursor,
        page_token: Option<String>,
        page_size: usize,
    ) -> std::result::Result<MessagePage, SourceError> {
        if let Some(err) = self.take_injected_failure().await {
            return Err(err);
        }

        let offset: usize = page_token
            .as_deref()
            .map(|t| t.parse().map_err(|_| SourceError::Transient("bad page token".into())))
            .transpose()?
            .unwrap_or(0);

        let store = self.messages.read().await;
        let past_cursor: Vec<MessageSummary> = store
            .iter()
            .filter(|m| m.internal_date_ms > cursor.watermark_ms)
            .map(|m| MessageSummary {
                provider_message_id: m.provider_message_id.clone(),
                internal_date_ms: m.internal_date_ms,
            })
            .collect();

        let page: Vec<MessageSummary> =
            past_cursor.iter().skip(offset).take(page_size).cloned().collect();

        let next_page_token = if offset + page.len() < past_cursor.len() {
            Some((offset + page.len()).to_string())
        } else {
            None
        };

        Ok(MessagePage {
            messages: page,
            next_page_token,
        })
    }

    async fn fetch_message(
        &self,
        _credential: &Credential,
        provider_message_id: &str,
    ) -> std::result::Result<FetchedMessage, SourceError> {
        if let Some(err) = self.take_injected_failure().await {
            return Err(err);
        }

        {
            let mut targeted = self.fail_fetch_of.lock().await;
            if targeted.as_ref().map(|(id, _)| id == provider_message_id).unwrap_or(false) {
                let (_, err) = targeted.take().expect("checked above");
                return Err(err);
            }
        }

        let store = self.messages.read().await;
        store
            .iter()
            .find(|m| m.provider_message_id == provider_message_id)
            .cloned()
            .ok_or_else(|| {
                SourceError::Transient(format!("unknown message {}", provider_message_id))
            })
    }
}

/// Build a plausible receipt message for seeding tests and demos.
pub fn sample_message(
    id: &str,
    internal_date_ms: i64,
    from_header: &str,
    subject: &str,
    body_text: &str,
) -> FetchedMessage {
    FetchedMessage {
        provider_message_id: id.to_string(),
        internal_date_ms,
        from_header: from_header.to_string(),
        subject: subject.to_string(),
        snippet: body_text.chars().take(120).collect(),
        body_text: body_text.to_string(),
        list_unsubscribe: None,
        fetched_at: chrono::Utc::now(),
    }
}

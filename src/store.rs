//! Raw message store
//!
//! Persists fetched messages and drives their status machine:
//! fetched → classified → extracted | skipped | failed. Content is
//! immutable once stored; a terminal message is never replaced and never
//! transitions again.

use crate::error::PipelineError;
use crate::models::{MessageStatus, RawMessage};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a freshly fetched message. If the message already exists,
    /// the stored copy wins and is returned unchanged (idempotent
    /// re-fetch; never re-extraction).
    async fn insert_fetched(&self, message: RawMessage) -> Result<RawMessage>;

    async fn get(
        &self,
        mailbox_id: Uuid,
        provider_message_id: &str,
    ) -> Result<Option<RawMessage>>;

    /// Transition a message's status. Terminal statuses reject further
    /// transitions.
    async fn set_status(
        &self,
        mailbox_id: Uuid,
        provider_message_id: &str,
        status: MessageStatus,
    ) -> Result<()>;

    /// Failed extractions surface for manual review instead of silently
    /// dropping.
    async fn needs_review(&self, mailbox_id: Uuid) -> Result<Vec<RawMessage>>;

    async fn status_counts(&self, mailbox_id: Uuid) -> Result<HashMap<MessageStatus, usize>>;
}

pub struct InMemoryMessageStore {
    messages: Arc<RwLock<HashMap<(Uuid, String), RawMessage>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            messages: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert_fetched(&self, message: RawMessage) -> Result<RawMessage> {
        let key = (message.mailbox_id, message.provider_message_id.clone());
        let mut messages = self.messages.write().await;
        let stored = messages.entry(key).or_insert(message);
        Ok(stored.clone())
    }

    async fn get(
        &self,
        mailbox_id: Uuid,
        provider_message_id: &str,
    ) -> Result<Option<RawMessage>> {
        let messages = self.messages.read().await;
        Ok(messages
            .get(&(mailbox_id, provider_message_id.to_string()))
            .cloned())
    }

    async fn set_status(
        &self,
        mailbox_id: Uuid,
        provider_message_id: &str,
        status: MessageStatus,
    ) -> Result<()> {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(&(mailbox_id, provider_message_id.to_string()))
            .ok_or_else(|| {
                PipelineError::NotFound(format!("message {} not stored", provider_message_id))
            })?;

        if message.status.is_terminal() {
            return Err(PipelineError::Store(format!(
                "message {} is terminal ({}); refusing transition to {}",
                provider_message_id, message.status, status
            )));
        }

        message.status = status;
        Ok(())
    }

    async fn needs_review(&self, mailbox_id: Uuid) -> Result<Vec<RawMessage>> {
        let messages = self.messages.read().await;
        let mut out: Vec<RawMessage> = messages
            .values()
            .filter(|m| m.mailbox_id == mailbox_id && m.status == MessageStatus::Failed)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.internal_date_ms);
        Ok(out)
    }

    async fn status_counts(&self, mailbox_id: Uuid) -> Result<HashMap<MessageStatus, usize>> {
        let messages = self.messages.read().await;
        let mut counts = HashMap::new();
        for message in messages.values().filter(|m| m.mailbox_id == mailbox_id) {
            *counts.entry(message.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(mailbox_id: Uuid, id: &str, status: MessageStatus) -> RawMessage {
        RawMessage {
            mailbox_id,
            provider_message_id: id.to_string(),
            fetched_at: Utc::now(),
            internal_date_ms: 1_700_000_000_000,
            from_header: "a@b.com".to_string(),
            subject: "s".to_string(),
            snippet: String::new(),
            body_text: "b".to_string(),
            list_unsubscribe: None,
            fingerprint: "f".to_string(),
            status,
        }
    }

    #[tokio::test]
    async fn test_duplicate_insert_keeps_original() {
        let store = InMemoryMessageStore::new();
        let mailbox = Uuid::new_v4();

        let mut original = message(mailbox, "m1", MessageStatus::Fetched);
        original.subject = "original".to_string();
        store.insert_fetched(original).await.unwrap();
        store
            .set_status(mailbox, "m1", MessageStatus::Extracted)
            .await
            .unwrap();

        let mut refetch = message(mailbox, "m1", MessageStatus::Fetched);
        refetch.subject = "refetched".to_string();
        let stored = store.insert_fetched(refetch).await.unwrap();

        assert_eq!(stored.subject, "original");
        assert_eq!(stored.status, MessageStatus::Extracted);
    }

    #[tokio::test]
    async fn test_terminal_status_rejects_transition() {
        let store = InMemoryMessageStore::new();
        let mailbox = Uuid::new_v4();
        store
            .insert_fetched(message(mailbox, "m1", MessageStatus::Fetched))
            .await
            .unwrap();
        store
            .set_status(mailbox, "m1", MessageStatus::Skipped)
            .await
            .unwrap();

        let err = store
            .set_status(mailbox, "m1", MessageStatus::Classified)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Store(_)));
    }

    #[tokio::test]
    async fn test_needs_review_lists_failed_in_order() {
        let store = InMemoryMessageStore::new();
        let mailbox = Uuid::new_v4();

        let mut m1 = message(mailbox, "m1", MessageStatus::Fetched);
        m1.internal_date_ms = 2_000;
        let mut m2 = message(mailbox, "m2", MessageStatus::Fetched);
        m2.internal_date_ms = 1_000;

        store.insert_fetched(m1).await.unwrap();
        store.insert_fetched(m2).await.unwrap();
        store.set_status(mailbox, "m1", MessageStatus::Failed).await.unwrap();
        store.set_status(mailbox, "m2", MessageStatus::Failed).await.unwrap();

        let review = store.needs_review(mailbox).await.unwrap();
        let ids: Vec<&str> = review.iter().map(|m| m.provider_message_id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m1"]);
    }
}

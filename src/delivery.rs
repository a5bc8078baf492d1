//! Delivery boundary (stub)
//!
//! The core decides what to send and when; transport belongs to an
//! external collaborator. The recording implementation is what tests and
//! the demo binary observe.

use crate::models::{AlertEvent, DraftEmail};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn enqueue_notification(&self, alert: &AlertEvent) -> Result<()>;
    async fn enqueue_email(&self, draft: &DraftEmail) -> Result<()>;
}

/// Records every enqueue without sending anything.
pub struct RecordingDelivery {
    notifications: Arc<RwLock<Vec<AlertEvent>>>,
    emails: Arc<RwLock<Vec<DraftEmail>>>,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self {
            notifications: Arc::new(RwLock::new(Vec::new())),
            emails: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn notifications(&self) -> Vec<AlertEvent> {
        self.notifications.read().await.clone()
    }

    pub async fn emails(&self) -> Vec<DraftEmail> {
        self.emails.read().await.clone()
    }
}

impl Default for RecordingDelivery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn enqueue_notification(&self, alert: &AlertEvent) -> Result<()> {
        info!(
            alert_id = %alert.alert_id,
            kind = ?alert.kind,
            "Notification enqueued (stub)"
        );
        self.notifications.write().await.push(alert.clone());
        Ok(())
    }

    async fn enqueue_email(&self, draft: &DraftEmail) -> Result<()> {
        info!(
            draft_id = %draft.draft_id,
            to = draft.to_email.as_deref().unwrap_or("<unresolved>"),
            "Email enqueued (stub)"
        );
        self.emails.write().await.push(draft.clone());
        Ok(())
    }
}

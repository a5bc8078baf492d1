//! Draft composer
//!
//! Turns a user-approved action against a reconciled fact into a draft
//! outbound email. Template rendering is deterministic and always
//! succeeds; the LLM rewrite is a best-effort polish that falls back to
//! the template on any trouble. Drafts never auto-send.

use crate::delivery::Delivery;
use crate::error::PipelineError;
use crate::extraction::LlmProvider;
use crate::models::{ActionKind, DraftEmail, DraftStatus, DraftTone, FinancialFact};
use crate::reconcile::{normalize_merchant, FactStore};
use crate::Result;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_SUBJECT: &str = "Request for Refund / Cancellation";

/// User-approved action to draft an email for.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub fact_id: Uuid,
    pub action: ActionKind,
    pub reason: String,
    pub tone: DraftTone,
}

/// Known vendor support addresses, keyed by normalized merchant.
#[derive(Debug, Clone, Default)]
pub struct VendorDirectory {
    support_emails: HashMap<String, String>,
}

impl VendorDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, merchant: &str, support_email: &str) {
        self.support_emails
            .insert(normalize_merchant(merchant), support_email.to_string());
    }

    pub fn lookup(&self, merchant: &str) -> Option<&str> {
        self.support_emails
            .get(&normalize_merchant(merchant))
            .map(String::as_str)
    }
}

pub struct DraftComposer {
    fact_store: Arc<FactStore>,
    directory: VendorDirectory,
    llm: Option<Arc<dyn LlmProvider>>,
    delivery: Arc<dyn Delivery>,
    drafts: Arc<RwLock<HashMap<Uuid, DraftEmail>>>,
}

impl DraftComposer {
    pub fn new(
        fact_store: Arc<FactStore>,
        directory: VendorDirectory,
        llm: Option<Arc<dyn LlmProvider>>,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        Self {
            fact_store,
            directory,
            llm,
            delivery,
            drafts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Compose a draft for a user action. The template render cannot
    /// fail; only an unknown fact id is an error.
    pub async fn compose(&self, request: ActionRequest) -> Result<DraftEmail> {
        let fact = self
            .fact_store
            .get(request.fact_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("fact {}", request.fact_id)))?;

        let (subject, body) = render_template(&fact, &request);
        let (subject, body) = self.maybe_rewrite(subject, body, &fact).await;

        let draft = DraftEmail {
            draft_id: Uuid::new_v4(),
            fact_id: fact.fact_id,
            action: request.action,
            tone: request.tone,
            to_email: self.directory.lookup(&fact.merchant).map(String::from),
            subject,
            body,
            status: DraftStatus::Drafted,
            created_at: chrono::Utc::now(),
        };

        let mut drafts = self.drafts.write().await;
        drafts.insert(draft.draft_id, draft.clone());
        Ok(draft)
    }

    /// Best-effort LLM polish. Any failure, absence, or implausible
    /// output returns the template text unchanged.
    async fn maybe_rewrite(
        &self,
        subject: String,
        body: String,
        fact: &FinancialFact,
    ) -> (String, String) {
        let Some(provider) = &self.llm else {
            return (subject, body);
        };

        let prompt = format!(
            "Rewrite this customer-support email to be clear and polite. \
             Keep every factual detail (merchant, amount, date) unchanged. \
             Return JSON with keys subject and body.\n\nSUBJECT: {}\nBODY:\n{}",
            subject, body
        );
        let schema = json!({
            "type": "object",
            "properties": {
                "subject": {"type": "string"},
                "body": {"type": "string"}
            },
            "required": ["subject", "body"]
        });

        match provider.infer(&prompt, &schema).await {
            Some(output) => {
                let rewritten_subject = output.get("subject").and_then(|v| v.as_str());
                let rewritten_body = output.get("body").and_then(|v| v.as_str());
                match (rewritten_subject, rewritten_body) {
                    (Some(s), Some(b))
                        if !s.trim().is_empty()
                            && !b.trim().is_empty()
                            && b.contains(fact.merchant.as_str()) =>
                    {
                        debug!(fact_id = %fact.fact_id, "LLM rewrite applied");
                        (s.to_string(), b.to_string())
                    }
                    _ => {
                        warn!(fact_id = %fact.fact_id, "LLM rewrite dropped required facts; keeping template");
                        (subject, body)
                    }
                }
            }
            None => (subject, body),
        }
    }

    /// User approval; the draft text freezes here.
    pub async fn approve(&self, draft_id: Uuid) -> Result<DraftEmail> {
        let mut drafts = self.drafts.write().await;
        let draft = drafts
            .get_mut(&draft_id)
            .ok_or_else(|| PipelineError::NotFound(format!("draft {}", draft_id)))?;

        if draft.status != DraftStatus::Drafted {
            return Err(PipelineError::InvalidInput(format!(
                "draft {} is not awaiting approval",
                draft_id
            )));
        }
        draft.status = DraftStatus::Approved;
        Ok(draft.clone())
    }

    /// Record that delivery was requested. Actual transport is stubbed.
    pub async fn mark_sent(&self, draft_id: Uuid) -> Result<DraftEmail> {
        let draft = {
            let drafts = self.drafts.read().await;
            drafts
                .get(&draft_id)
                .cloned()
                .ok_or_else(|| PipelineError::NotFound(format!("draft {}", draft_id)))?
        };

        if draft.status != DraftStatus::Approved {
            return Err(PipelineError::InvalidInput(format!(
                "draft {} was never approved",
                draft_id
            )));
        }

        self.delivery.enqueue_email(&draft).await?;

        let mut drafts = self.drafts.write().await;
        let stored = drafts
            .get_mut(&draft_id)
            .ok_or_else(|| PipelineError::NotFound(format!("draft {}", draft_id)))?;
        stored.status = DraftStatus::SentStub;
        Ok(stored.clone())
    }

    pub async fn get(&self, draft_id: Uuid) -> Option<DraftEmail> {
        let drafts = self.drafts.read().await;
        drafts.get(&draft_id).cloned()
    }
}

fn render_template(fact: &FinancialFact, request: &ActionRequest) -> (String, String) {
    let merchant = if fact.merchant.is_empty() {
        "Support"
    } else {
        fact.merchant.as_str()
    };
    let amount = match (fact.amount, fact.currency.as_deref()) {
        (Some(a), Some(c)) => format!("{} {:.2}", c, a),
        (Some(a), None) => format!("{:.2}", a),
        _ => "the recent charge".to_string(),
    };
    let date = fact
        .date
        .map(|d| d.to_string())
        .unwrap_or_else(|| "the recent date".to_string());
    let intent = match request.action {
        ActionKind::Refund => "a refund",
        ActionKind::Cancel => "a cancellation",
    };

    let body = match request.tone {
        DraftTone::Strict => format!(
            "Hello {} Support,\n\n\
             I am requesting {} for the charge of {} on {}.\n\
             Reason: {}\n\n\
             Please confirm the outcome and any reference number.\n\n\
             Regards,",
            merchant, intent, amount, date, request.reason
        ),
        DraftTone::Friendly => format!(
            "Hi {} Team,\n\n\
             Could you please help with {} for {} from {}?\n\
             Reason: {}\n\n\
             Thanks,",
            merchant, intent, amount, date, request.reason
        ),
        DraftTone::Neutral => format!(
            "Hello {} Support,\n\n\
             I'd like to request {} for the charge of {} on {}.\n\
             Reason: {}\n\n\
             Please confirm once processed.\n\n\
             Thank you,",
            merchant, intent, amount, date, request.reason
        ),
    };

    (DEFAULT_SUBJECT.to_string(), body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::delivery::RecordingDelivery;
    use crate::models::{ExtractedRecord, ExtractionMethod, FieldConfidence, RecordKind};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::Value;

    async fn store_with_fact() -> (Arc<FactStore>, Uuid) {
        let store = Arc::new(FactStore::in_memory(&PipelineConfig::default()));
        let candidate = ExtractedRecord {
            record_id: Uuid::new_v4(),
            mailbox_id: Uuid::new_v4(),
            source_message_id: "m1".to_string(),
            kind: RecordKind::Subscription,
            merchant: Some("Netflix".to_string()),
            amount: Some(15.49),
            currency: Some("USD".to_string()),
            date: NaiveDate::from_ymd_opt(2026, 1, 15),
            category: None,
            renewal_date: None,
            trial_end_date: None,
            recurrence_hint_days: None,
            confidence: FieldConfidence {
                merchant: 0.9,
                amount: 0.9,
                date: 0.9,
            },
            method: ExtractionMethod::Rule,
            extracted_at: chrono::Utc::now(),
        };
        let change = store.reconcile(&candidate).await.unwrap();
        (store, change.fact.fact_id)
    }

    fn request(fact_id: Uuid, tone: DraftTone) -> ActionRequest {
        ActionRequest {
            fact_id,
            action: ActionKind::Cancel,
            reason: "No longer needed".to_string(),
            tone,
        }
    }

    #[tokio::test]
    async fn test_template_contains_the_facts() {
        let (store, fact_id) = store_with_fact().await;
        let mut directory = VendorDirectory::new();
        directory.insert("Netflix", "support@netflix.com");
        let composer = DraftComposer::new(
            store,
            directory,
            None,
            Arc::new(RecordingDelivery::new()),
        );

        let draft = composer.compose(request(fact_id, DraftTone::Neutral)).await.unwrap();
        assert_eq!(draft.status, DraftStatus::Drafted);
        assert_eq!(draft.to_email.as_deref(), Some("support@netflix.com"));
        assert!(draft.body.contains("Netflix"));
        assert!(draft.body.contains("USD 15.49"));
        assert!(draft.body.contains("2026-01-15"));
        assert!(draft.body.contains("No longer needed"));
    }

    #[tokio::test]
    async fn test_tones_render_differently() {
        let (store, fact_id) = store_with_fact().await;
        let composer = DraftComposer::new(
            store,
            VendorDirectory::new(),
            None,
            Arc::new(RecordingDelivery::new()),
        );

        let friendly = composer
            .compose(request(fact_id, DraftTone::Friendly))
            .await
            .unwrap();
        let strict = composer
            .compose(request(fact_id, DraftTone::Strict))
            .await
            .unwrap();
        assert_ne!(friendly.body, strict.body);
        assert!(friendly.body.starts_with("Hi "));
        assert!(strict.body.contains("I am requesting"));
    }

    #[tokio::test]
    async fn test_broken_rewrite_keeps_template() {
        struct LossyLlm;
        #[async_trait]
        impl LlmProvider for LossyLlm {
            async fn infer(&self, _prompt: &str, _schema: &Value) -> Option<Value> {
                // Drops the merchant name: must be rejected.
                Some(json!({"subject": "Hi", "body": "please refund me"}))
            }
        }

        let (store, fact_id) = store_with_fact().await;
        let composer = DraftComposer::new(
            store,
            VendorDirectory::new(),
            Some(Arc::new(LossyLlm)),
            Arc::new(RecordingDelivery::new()),
        );

        let draft = composer.compose(request(fact_id, DraftTone::Neutral)).await.unwrap();
        assert_eq!(draft.subject, DEFAULT_SUBJECT);
        assert!(draft.body.contains("Netflix"));
    }

    #[tokio::test]
    async fn test_send_requires_approval() {
        let (store, fact_id) = store_with_fact().await;
        let delivery = Arc::new(RecordingDelivery::new());
        let composer = DraftComposer::new(store, VendorDirectory::new(), None, delivery.clone());

        let draft = composer.compose(request(fact_id, DraftTone::Neutral)).await.unwrap();

        // Unapproved drafts never reach delivery.
        let err = composer.mark_sent(draft.draft_id).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
        assert!(delivery.emails().await.is_empty());

        composer.approve(draft.draft_id).await.unwrap();
        let sent = composer.mark_sent(draft.draft_id).await.unwrap();
        assert_eq!(sent.status, DraftStatus::SentStub);
        assert_eq!(delivery.emails().await.len(), 1);
    }
}

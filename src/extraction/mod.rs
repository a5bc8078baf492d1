//! Extraction engine
//!
//! Two-tier strategy: deterministic rule parsers run first and are free;
//! the LLM provider is consulted only when rules come up empty or below
//! the confidence threshold, and only when one is configured. An empty
//! result set is how a message earns `failed` status upstream.

use crate::classifier::TemplateHint;
use crate::config::PipelineConfig;
use crate::models::{ExtractedRecord, RawMessage};
use std::sync::Arc;
use tracing::{debug, warn};

pub mod apple;
pub mod llm;
pub mod rules;

pub use llm::{provider_from_config, LlmProvider};

pub struct ExtractionEngine {
    rule_confidence: f32,
    llm_default_confidence: f32,
    llm_fallback_threshold: f32,
    llm: Option<Arc<dyn LlmProvider>>,
}

impl ExtractionEngine {
    pub fn new(config: &PipelineConfig, llm: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            rule_confidence: config.rule_confidence,
            llm_default_confidence: config.llm_default_confidence,
            llm_fallback_threshold: config.llm_fallback_threshold,
            llm,
        }
    }

    /// Extract candidate records from one classified message. Returns an
    /// empty list when neither tier produced anything usable.
    pub async fn extract(
        &self,
        message: &RawMessage,
        hints: &[TemplateHint],
    ) -> Vec<ExtractedRecord> {
        let mut rule_record = rules::extract(message, self.rule_confidence);

        // Platform receipts: swap the platform for the purchased item.
        if hints.contains(&TemplateHint::AppleReceipt) {
            if let Some(item) = apple::parse_line_item(&message.body_text) {
                // No generic signal at all still leaves a priced line item:
                // start from a bare rule record carrying the message
                // coordinates.
                let record = rule_record.get_or_insert_with(|| empty_rule_record(message));
                record.merchant = Some(item.description.clone());
                record.confidence.merchant = self.rule_confidence;
                if record.amount.is_none() {
                    record.amount = Some(item.amount);
                    record.currency = Some(item.currency.clone());
                    record.confidence.amount = self.rule_confidence;
                }
            }
        }

        let rule_is_enough = rule_record
            .as_ref()
            .map(|r| r.amount.is_some() && r.confidence.overall() >= self.llm_fallback_threshold)
            .unwrap_or(false);

        if rule_is_enough {
            debug!(
                message_id = %message.provider_message_id,
                "Rule extraction sufficient, skipping LLM"
            );
            return rule_record.into_iter().collect();
        }

        // Rules came up short. Ask the LLM if one is configured; rule-only
        // mode simply returns whatever the rules found.
        let Some(provider) = &self.llm else {
            return rule_record.into_iter().collect();
        };

        let prompt = llm::extraction_prompt(message);
        let schema = llm::receipt_schema();

        let llm_record = match provider.infer(&prompt, &schema).await {
            Some(output) => {
                let record =
                    llm::record_from_output(message, output, self.llm_default_confidence);
                if record.is_none() {
                    warn!(
                        message_id = %message.provider_message_id,
                        "LLM output violated the receipt schema; treating as no-match"
                    );
                }
                record
            }
            None => None,
        };

        rule_record.into_iter().chain(llm_record).collect()
    }
}

fn empty_rule_record(message: &RawMessage) -> ExtractedRecord {
    use crate::models::{ExtractionMethod, FieldConfidence, RecordKind};
    ExtractedRecord {
        record_id: uuid::Uuid::new_v4(),
        mailbox_id: message.mailbox_id,
        source_message_id: message.provider_message_id.clone(),
        kind: RecordKind::Transaction,
        merchant: None,
        amount: None,
        currency: None,
        date: message.internal_date(),
        category: None,
        renewal_date: None,
        trial_end_date: None,
        recurrence_hint_days: None,
        confidence: FieldConfidence::zero(),
        method: ExtractionMethod::Rule,
        extracted_at: chrono::Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractionMethod, MessageStatus, RecordKind};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};
    use uuid::Uuid;

    fn message(from: &str, subject: &str, body: &str) -> RawMessage {
        RawMessage {
            mailbox_id: Uuid::new_v4(),
            provider_message_id: "m1".to_string(),
            fetched_at: Utc::now(),
            internal_date_ms: 1_700_000_000_000,
            from_header: from.to_string(),
            subject: subject.to_string(),
            snippet: body.chars().take(120).collect(),
            body_text: body.to_string(),
            list_unsubscribe: None,
            fingerprint: String::new(),
            status: MessageStatus::Fetched,
        }
    }

    struct CannedLlm {
        output: Value,
    }

    #[async_trait]
    impl LlmProvider for CannedLlm {
        async fn infer(&self, _prompt: &str, _schema: &Value) -> Option<Value> {
            Some(self.output.clone())
        }
    }

    struct SilentLlm;

    #[async_trait]
    impl LlmProvider for SilentLlm {
        async fn infer(&self, _prompt: &str, _schema: &Value) -> Option<Value> {
            None
        }
    }

    #[tokio::test]
    async fn test_rule_match_skips_llm() {
        // A provider that would panic if consulted.
        struct PanickingLlm;
        #[async_trait]
        impl LlmProvider for PanickingLlm {
            async fn infer(&self, _prompt: &str, _schema: &Value) -> Option<Value> {
                panic!("LLM must not be called when rules are sufficient");
            }
        }

        let engine = ExtractionEngine::new(&PipelineConfig::default(), Some(Arc::new(PanickingLlm)));
        let msg = message(
            "Netflix <info@netflix.com>",
            "Your receipt",
            "Subscription charged $15.49",
        );
        let records = engine.extract(&msg, &[]).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, ExtractionMethod::Rule);
    }

    #[tokio::test]
    async fn test_llm_fallback_when_rules_find_nothing() {
        let engine = ExtractionEngine::new(
            &PipelineConfig::default(),
            Some(Arc::new(CannedLlm {
                output: json!({
                    "vendor": "Acme Pro",
                    "amount": 29.0,
                    "currency": "USD",
                    "transaction_date": "2026-01-15",
                    "is_subscription": true
                }),
            })),
        );
        // No amount marker and no display name, so rules yield nothing.
        let msg = message("billing@acme.example", "Thanks", "your plan is now active");
        let records = engine.extract(&msg, &[]).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, ExtractionMethod::Llm);
        assert_eq!(records[0].kind, RecordKind::Subscription);
    }

    #[tokio::test]
    async fn test_rule_only_mode_returns_rule_output() {
        let engine = ExtractionEngine::new(&PipelineConfig::default(), None);
        let msg = message(
            "Uber Receipts <noreply@uber.com>",
            "Trip receipt",
            "Total $23.80",
        );
        let records = engine.extract(&msg, &[]).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, ExtractionMethod::Rule);
    }

    #[tokio::test]
    async fn test_rule_only_mode_no_match_is_empty() {
        let engine = ExtractionEngine::new(&PipelineConfig::default(), None);
        let msg = message("", "hello", "no amounts here");
        let records = engine.extract(&msg, &[]).await;
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_silent_llm_degrades_to_rule_output() {
        let engine = ExtractionEngine::new(&PipelineConfig::default(), Some(Arc::new(SilentLlm)));
        let msg = message("billing@acme.example", "Thanks", "your plan is now active");
        let records = engine.extract(&msg, &[]).await;
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_apple_hint_prefers_line_item_merchant() {
        let engine = ExtractionEngine::new(&PipelineConfig::default(), None);
        let msg = message(
            "Apple <no_reply@email.apple.com>",
            "Your receipt from Apple",
            "App Store\nDisney+ (Monthly) - $13.99\nTotal: $13.99",
        );
        let records = engine
            .extract(&msg, &[crate::classifier::TemplateHint::AppleReceipt])
            .await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].merchant.as_deref(), Some("Disney+ (Monthly)"));
    }
}

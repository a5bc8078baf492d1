//! LLM-assisted extraction provider
//!
//! Optional second tier. The provider contract is a single call:
//! `infer(prompt, schema)` returning structured output or nothing.
//! Absence of a configured provider is a supported configuration, and a
//! provider failure is always a no-result, never a pipeline failure.

use crate::config::PipelineConfig;
use crate::models::{
    ExtractedRecord, ExtractionMethod, FieldConfidence, RawMessage, RecordKind,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Structured-inference capability. One variant per provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Run structured inference. `None` means the provider had no usable
    /// answer; errors are reserved for misuse, not provider trouble.
    async fn infer(&self, prompt: &str, schema: &Value) -> Option<Value>;
}

/// Build the provider selected by config, if any. Rule-only mode is the
/// default and needs no provider at all.
pub fn provider_from_config(config: &PipelineConfig) -> Option<Arc<dyn LlmProvider>> {
    match config.llm_provider.as_str() {
        "openai_chat_completions" if !config.openai_api_key.is_empty() => {
            Some(Arc::new(OpenAiChatProvider::new(
                config.openai_api_key.clone(),
                config.openai_base_url.clone(),
                config.openai_model.clone(),
                config.request_timeout,
            )))
        }
        _ => None,
    }
}

/// Output schema the provider must satisfy.
pub fn receipt_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "vendor": {"type": "string"},
            "amount": {"type": "number"},
            "currency": {"type": "string"},
            "transaction_date": {"type": "string"},
            "category": {"type": ["string", "null"]},
            "is_subscription": {"type": "boolean"},
            "trial_end_date": {"type": ["string", "null"]},
            "renewal_date": {"type": ["string", "null"]},
            "confidence": {
                "type": "object",
                "additionalProperties": {"type": "number"}
            }
        },
        "required": ["vendor", "amount", "currency", "transaction_date"]
    })
}

/// Extraction prompt for one message, mirroring what the classifier knew.
pub fn extraction_prompt(message: &RawMessage) -> String {
    format!(
        "EMAIL_FROM: {}\nEMAIL_SUBJECT: {}\nEMAIL_SNIPPET: {}\nLIST_UNSUBSCRIBE: {}\nEMAIL_TEXT: {}",
        message.from_header,
        message.subject,
        message.snippet,
        message.list_unsubscribe.as_deref().unwrap_or(""),
        message.body_text.chars().take(6000).collect::<String>(),
    )
}

const SYSTEM_PROMPT: &str = "Extract structured purchase/subscription info from emails. \
Only set is_subscription when the email confirms an actual purchase, subscription or trial \
the user has; never for marketing offers or solicitations. \
If LIST_UNSUBSCRIBE is present, treat the email as promotional unless it clearly confirms \
a charge with an amount or an explicit renewal/trial date. \
If the email is an Apple, Google Play, Amazon, PayPal or Microsoft receipt, extract the \
purchased app/service name as the vendor instead of the platform name. \
Dates are YYYY-MM-DD. If a field is unknown, set it to null. \
Return ONLY valid JSON matching the schema.";

//
// ================= OpenAI-compatible provider =================
//

/// Chat-completions provider (connection-pooled).
pub struct OpenAiChatProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiChatProvider {
    pub fn new(api_key: String, base_url: String, model: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key,
            base_url,
            model,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiChatProvider {
    async fn infer(&self, prompt: &str, schema: &Value) -> Option<Value> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": format!("{}\nSchema: {}", SYSTEM_PROMPT, schema)},
                {"role": "user", "content": prompt},
            ],
        });

        info!(model = %self.model, "Calling LLM extraction provider");

        let response = match self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!("LLM request failed: {}", e);
                return None;
            }
        };

        if !response.status().is_success() {
            warn!(status = %response.status(), "LLM provider returned error status");
            return None;
        }

        let body: ChatCompletionResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!("LLM response parse error: {}", e);
                return None;
            }
        };

        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())?;

        serde_json::from_str(content).ok()
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

//
// ================= Output validation =================
//

#[derive(Debug, Deserialize)]
struct LlmReceipt {
    vendor: String,
    amount: f64,
    currency: String,
    transaction_date: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    is_subscription: bool,
    #[serde(default)]
    trial_end_date: Option<String>,
    #[serde(default)]
    renewal_date: Option<String>,
    #[serde(default)]
    confidence: Option<LlmConfidence>,
}

#[derive(Debug, Deserialize)]
struct LlmConfidence {
    #[serde(default)]
    vendor: Option<f32>,
    #[serde(default)]
    amount: Option<f32>,
    #[serde(default)]
    date: Option<f32>,
}

fn parse_date(value: Option<&str>) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value?, "%Y-%m-%d").ok()
}

/// Validate LLM output against the schema and shape it into a candidate
/// record. Schema violations are a no-match, not an error.
pub fn record_from_output(
    message: &RawMessage,
    output: Value,
    default_confidence: f32,
) -> Option<ExtractedRecord> {
    let receipt: LlmReceipt = serde_json::from_value(output).ok()?;
    let date = parse_date(Some(receipt.transaction_date.as_str()))?;

    if receipt.vendor.trim().is_empty() || !receipt.amount.is_finite() || receipt.amount < 0.0 {
        return None;
    }

    let reported = receipt.confidence.unwrap_or(LlmConfidence {
        vendor: None,
        amount: None,
        date: None,
    });

    Some(ExtractedRecord {
        record_id: Uuid::new_v4(),
        mailbox_id: message.mailbox_id,
        source_message_id: message.provider_message_id.clone(),
        kind: if receipt.is_subscription {
            RecordKind::Subscription
        } else {
            RecordKind::Transaction
        },
        merchant: Some(receipt.vendor.chars().take(256).collect()),
        amount: Some(receipt.amount),
        currency: Some(receipt.currency.to_uppercase()),
        date: Some(date),
        category: receipt.category,
        renewal_date: parse_date(receipt.renewal_date.as_deref()),
        trial_end_date: parse_date(receipt.trial_end_date.as_deref()),
        recurrence_hint_days: None,
        confidence: FieldConfidence {
            merchant: reported.vendor.unwrap_or(default_confidence),
            amount: reported.amount.unwrap_or(default_confidence),
            date: reported.date.unwrap_or(default_confidence),
        },
        method: ExtractionMethod::Llm,
        extracted_at: chrono::Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageStatus;
    use chrono::Utc;

    fn message() -> RawMessage {
        RawMessage {
            mailbox_id: Uuid::new_v4(),
            provider_message_id: "m1".to_string(),
            fetched_at: Utc::now(),
            internal_date_ms: 1_700_000_000_000,
            from_header: "Acme <billing@acme.com>".to_string(),
            subject: "Receipt".to_string(),
            snippet: String::new(),
            body_text: "Thanks for your purchase".to_string(),
            list_unsubscribe: None,
            fingerprint: String::new(),
            status: MessageStatus::Fetched,
        }
    }

    #[test]
    fn test_valid_output_becomes_llm_record() {
        let output = json!({
            "vendor": "Acme Pro",
            "amount": 29.0,
            "currency": "usd",
            "transaction_date": "2026-01-15",
            "is_subscription": true,
            "renewal_date": "2026-02-15",
            "confidence": {"vendor": 0.8, "amount": 0.7}
        });

        let record = record_from_output(&message(), output, 0.6).unwrap();
        assert_eq!(record.method, ExtractionMethod::Llm);
        assert_eq!(record.kind, RecordKind::Subscription);
        assert_eq!(record.currency.as_deref(), Some("USD"));
        assert_eq!(record.confidence.merchant, 0.8);
        // Unreported field falls back to the configured default.
        assert_eq!(record.confidence.date, 0.6);
        assert_eq!(record.renewal_date, NaiveDate::from_ymd_opt(2026, 2, 15));
    }

    #[test]
    fn test_schema_violation_is_no_match() {
        // Missing required amount.
        let output = json!({
            "vendor": "Acme Pro",
            "currency": "USD",
            "transaction_date": "2026-01-15"
        });
        assert!(record_from_output(&message(), output, 0.6).is_none());

        // Unparseable date.
        let output = json!({
            "vendor": "Acme Pro",
            "amount": 29.0,
            "currency": "USD",
            "transaction_date": "January 15th"
        });
        assert!(record_from_output(&message(), output, 0.6).is_none());
    }

    #[test]
    fn test_provider_from_config_defaults_to_none() {
        let config = PipelineConfig::default();
        assert!(provider_from_config(&config).is_none());
    }
}

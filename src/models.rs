//! Core data models for the mail-finance pipeline

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MailProvider {
    Gmail,
    Mock,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MailboxStatus {
    Active,
    Paused,
    Revoked,
}

/// Processing status of a fetched message. `Extracted`, `Skipped` and
/// `Failed` are terminal: the message is never re-fetched or re-run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Fetched,
    Classified,
    Extracted,
    Skipped,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Extracted | MessageStatus::Skipped | MessageStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Transaction,
    Subscription,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    Rule,
    Llm,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    RenewalUpcoming,
    Anomaly,
    ActionRequired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Scheduled,
    Fired,
    Cancelled,
    Suppressed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Drafted,
    Approved,
    SentStub,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DraftTone {
    Neutral,
    Friendly,
    Strict,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Refund,
    Cancel,
}

//
// ================= Mailbox =================
//

/// Provider-side position of an incremental sync. The watermark is the
/// highest committed `internal_date_ms`; providers list strictly past it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncCursor {
    pub watermark_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailbox {
    pub mailbox_id: Uuid,
    pub owner_id: Uuid,
    pub provider: MailProvider,
    pub address: String,
    pub status: MailboxStatus,
    pub created_at: DateTime<Utc>,
}

//
// ================= RawMessage =================
//

/// A fetched message. Content is immutable once fetched; only `status`
/// transitions afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub mailbox_id: Uuid,
    pub provider_message_id: String,
    pub fetched_at: DateTime<Utc>,
    pub internal_date_ms: i64,
    pub from_header: String,
    pub subject: String,
    pub snippet: String,
    pub body_text: String,
    pub list_unsubscribe: Option<String>,
    /// sha-256 of the content, stable across re-fetches of the same message.
    pub fingerprint: String,
    pub status: MessageStatus,
}

impl RawMessage {
    /// Timestamp the provider assigned to the message, as a UTC date.
    pub fn internal_date(&self) -> Option<NaiveDate> {
        DateTime::<Utc>::from_timestamp_millis(self.internal_date_ms).map(|dt| dt.date_naive())
    }
}

//
// ================= ExtractedRecord =================
//

/// Per-field confidence attached to every extraction attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FieldConfidence {
    pub merchant: f32,
    pub amount: f32,
    pub date: f32,
}

impl FieldConfidence {
    pub fn zero() -> Self {
        Self {
            merchant: 0.0,
            amount: 0.0,
            date: 0.0,
        }
    }

    /// Best single-field confidence; the engine's fallback trigger compares
    /// this against the configured threshold.
    pub fn overall(&self) -> f32 {
        self.merchant.max(self.amount).max(self.date)
    }
}

/// Candidate financial record from one extraction attempt. Never mutated;
/// superseded by reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub record_id: Uuid,
    pub mailbox_id: Uuid,
    pub source_message_id: String,
    pub kind: RecordKind,
    pub merchant: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub date: Option<NaiveDate>,
    pub category: Option<String>,
    pub renewal_date: Option<NaiveDate>,
    pub trial_end_date: Option<NaiveDate>,
    pub recurrence_hint_days: Option<i64>,
    pub confidence: FieldConfidence,
    pub method: ExtractionMethod,
    pub extracted_at: DateTime<Utc>,
}

//
// ================= FinancialFact =================
//

/// Provenance of the value currently winning a fact field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FieldSource {
    pub method: ExtractionMethod,
    pub confidence: f32,
    pub extracted_at: DateTime<Utc>,
}

/// Canonical, reconciled record of one real-world financial event.
/// Exactly one fact exists per dedup key; `revision` increments on every
/// merge and the fact is never deleted, only superseded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialFact {
    pub fact_id: Uuid,
    pub dedup_key: String,
    pub kind: RecordKind,
    pub merchant: String,
    pub merchant_key: String,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub date: Option<NaiveDate>,
    pub category: Option<String>,
    pub renewal_date: Option<NaiveDate>,
    pub trial_end_date: Option<NaiveDate>,
    /// Billing cycle in days, explicit from extraction or inferred from
    /// contributor charge-date gaps.
    pub recurrence_days: Option<i64>,
    pub amount_source: Option<FieldSource>,
    pub date_source: Option<FieldSource>,
    pub merchant_source: Option<FieldSource>,
    pub contributors: Vec<Uuid>,
    /// Charge amounts observed across contributors, for anomaly baselining.
    pub amount_history: Vec<f64>,
    /// Charge dates observed across contributors, for cadence inference.
    pub date_history: Vec<NaiveDate>,
    pub revision: u64,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

//
// ================= AlertEvent =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alert_id: Uuid,
    pub fact_id: Uuid,
    pub kind: AlertKind,
    pub status: AlertStatus,
    pub trigger_at: DateTime<Utc>,
    pub title: String,
    pub body: String,
    /// Fact revision this alert was derived from.
    pub fact_revision: u64,
    pub created_at: DateTime<Utc>,
}

//
// ================= DraftEmail =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftEmail {
    pub draft_id: Uuid,
    pub fact_id: Uuid,
    pub action: ActionKind,
    pub tone: DraftTone,
    pub to_email: Option<String>,
    pub subject: String,
    pub body: String,
    pub status: DraftStatus,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageStatus::Fetched => "fetched",
            MessageStatus::Classified => "classified",
            MessageStatus::Extracted => "extracted",
            MessageStatus::Skipped => "skipped",
            MessageStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertStatus::Scheduled => "scheduled",
            AlertStatus::Fired => "fired",
            AlertStatus::Cancelled => "cancelled",
            AlertStatus::Suppressed => "suppressed",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordKind::Transaction => "transaction",
            RecordKind::Subscription => "subscription",
        };
        write!(f, "{}", s)
    }
}

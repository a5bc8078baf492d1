//! Rule-based receipt parsing
//!
//! Deterministic, zero-cost first tier of extraction. Pulls merchant,
//! amount, currency, date and subscription signals out of headers,
//! snippet and body with fixed patterns.

use crate::models::{
    ExtractedRecord, ExtractionMethod, FieldConfidence, RawMessage, RecordKind,
};
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

lazy_static! {
    /// Currency marker followed by an amount, e.g. "$15.49", "EUR 9,99".
    pub static ref AMOUNT_RE: Regex =
        Regex::new(r"(?i)(?P<currency>\$|€|£|USD|AUD|EUR|GBP|CAD)\s?(?P<amount>\d{1,6}(?:[.,]\d{2})?)")
            .expect("amount pattern is valid");

    /// Explicit renewal dates, e.g. "renews on 2026-03-05".
    static ref RENEWAL_DATE_RE: Regex =
        Regex::new(r"(?i)renew(?:al|s)?(?:\s+date)?\D{0,12}(\d{4}-\d{2}-\d{2})")
            .expect("renewal pattern is valid");

    /// Trial end dates, e.g. "trial ends 2026-02-14".
    static ref TRIAL_END_RE: Regex =
        Regex::new(r"(?i)trial\s+(?:ends?|expires?)\D{0,12}(\d{4}-\d{2}-\d{2})")
            .expect("trial pattern is valid");
}

const SUBSCRIPTION_KEYWORDS: &[&str] = &[
    "subscription",
    "renewal",
    "trial",
    "free trial",
    "recurring",
    "membership",
    "subscribe",
    "auto-renew",
    "active subscription",
    "subscribed",
];

const TRANSPORT_KEYWORDS: &[&str] = &["uber", "lyft", "taxi"];
const ENTERTAINMENT_KEYWORDS: &[&str] = &["netflix", "spotify", "hulu", "prime video", "disney"];

pub fn currency_code(symbol: &str) -> Option<&'static str> {
    match symbol.to_uppercase().as_str() {
        "$" | "USD" => Some("USD"),
        "€" | "EUR" => Some("EUR"),
        "£" | "GBP" => Some("GBP"),
        "AUD" => Some("AUD"),
        "CAD" => Some("CAD"),
        _ => None,
    }
}

/// Parse a matched amount. The pattern only admits a separator followed
/// by exactly two digits, so a comma there is a decimal comma.
pub fn parse_amount(raw: &str) -> Option<f64> {
    raw.replace(',', ".").parse().ok()
}

/// First currency-marked amount in a text blob.
pub fn find_amount(text: &str) -> Option<(f64, &'static str)> {
    let caps = AMOUNT_RE.captures(text)?;
    let amount = parse_amount(caps.name("amount")?.as_str())?;
    let currency = currency_code(caps.name("currency")?.as_str())?;
    Some((amount, currency))
}

/// Display name before the `<addr>` part of a From header.
pub fn vendor_from_header(from_header: &str) -> Option<String> {
    let name = from_header.split('<').next().unwrap_or("").trim().trim_matches('"');
    if name.is_empty() {
        return None;
    }
    Some(name.chars().take(256).collect())
}

fn find_date(re: &Regex, text: &str) -> Option<NaiveDate> {
    let caps = re.captures(text)?;
    NaiveDate::parse_from_str(caps.get(1)?.as_str(), "%Y-%m-%d").ok()
}

/// Generic receipt rule parser. Returns None when nothing usable was
/// found, sending the message to the LLM fallback.
pub fn extract(message: &RawMessage, rule_confidence: f32) -> Option<ExtractedRecord> {
    let blob = format!(
        "{} {} {}",
        message.subject, message.snippet, message.body_text
    );
    let blob_lower = blob.to_lowercase();

    let merchant = vendor_from_header(&message.from_header);
    let amount_currency = find_amount(&blob);
    let date = message.internal_date();

    let is_subscription = SUBSCRIPTION_KEYWORDS.iter().any(|k| blob_lower.contains(k));
    let renewal_date = find_date(&RENEWAL_DATE_RE, &blob);
    let trial_end_date = find_date(&TRIAL_END_RE, &blob);

    let category = if TRANSPORT_KEYWORDS.iter().any(|k| blob_lower.contains(k)) {
        Some("Transport".to_string())
    } else if ENTERTAINMENT_KEYWORDS.iter().any(|k| blob_lower.contains(k)) {
        Some("Entertainment".to_string())
    } else {
        None
    };

    // A display name alone is not a financial record. Without a priced
    // charge or an explicit renewal/trial date the message belongs to
    // the LLM fallback.
    if amount_currency.is_none() && renewal_date.is_none() && trial_end_date.is_none() {
        return None;
    }

    let confidence = FieldConfidence {
        merchant: if merchant.is_some() { rule_confidence } else { 0.0 },
        amount: if amount_currency.is_some() { rule_confidence } else { 0.0 },
        date: if date.is_some() { rule_confidence } else { 0.0 },
    };

    Some(ExtractedRecord {
        record_id: Uuid::new_v4(),
        mailbox_id: message.mailbox_id,
        source_message_id: message.provider_message_id.clone(),
        kind: if is_subscription {
            RecordKind::Subscription
        } else {
            RecordKind::Transaction
        },
        merchant,
        amount: amount_currency.map(|(a, _)| a),
        currency: amount_currency.map(|(_, c)| c.to_string()),
        date,
        category,
        renewal_date,
        trial_end_date,
        recurrence_hint_days: None,
        confidence,
        method: ExtractionMethod::Rule,
        extracted_at: chrono::Utc::now(),
    })
}

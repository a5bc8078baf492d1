//! Finance relevance classifier
//!
//! Decides whether a fetched message is finance-related and which
//! extraction templates apply. Deterministic for identical input: no
//! network calls, no clock reads, bounded work per message, so a crashed
//! run re-classifies to the same decision.

use crate::extraction::rules::AMOUNT_RE;
use crate::models::RawMessage;

/// Extraction templates a message can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TemplateHint {
    Receipt,
    AppleReceipt,
    SubscriptionNotice,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub relevant: bool,
    pub template_hints: Vec<TemplateHint>,
}

/// Static keyword lists — zero allocation
const FINANCE_KEYWORDS: &[&str] = &[
    // Receipts & orders
    "receipt", "invoice", "order confirmation", "your order", "purchase",
    // Charges
    "payment", "charged", "billed", "charge", "amount due", "statement",
    // Subscriptions
    "subscription", "renewal", "renew", "trial", "membership", "plan",
];

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

const RECEIPT_KEYWORDS: &[&str] = &[
    "receipt", "invoice", "your order", "order confirmation", "purchase", "payment received",
];

const APPLE_SENDER_MARKERS: &[&str] = &["apple.com", "itunes.com", "appstore"];

const APPLE_SUBJECT_MARKERS: &[&str] =
    &["receipt", "invoice", "your order", "app store", "purchase"];

/// Senders that never carry actionable financial facts.
const DENY_DOMAINS: &[&str] = &[
    "facebookmail.com",
    "linkedin.com",
    "twitter.com",
    "x.com",
    "pinterest.com",
];

/// Senders whose mail is finance-relevant even with weak keyword signal.
const ALLOW_DOMAINS: &[&str] = &[
    "apple.com",
    "itunes.com",
    "paypal.com",
    "stripe.com",
    "netflix.com",
    "spotify.com",
    "amazon.com",
];

/// How much body text participates in classification. Keeps per-message
/// work bounded regardless of attachment-sized bodies.
const BODY_SCAN_LIMIT: usize = 4096;

pub struct FinanceClassifier;

impl FinanceClassifier {
    /// Classify a message as finance-relevant (or not) with template hints.
    pub fn classify(message: &RawMessage) -> Classification {
        let sender = message.from_header.to_lowercase();
        let sender_domain = sender_domain(&sender);

        if let Some(domain) = sender_domain.as_deref() {
            if DENY_DOMAINS.iter().any(|d| domain.ends_with(d)) {
                return Classification {
                    relevant: false,
                    template_hints: Vec::new(),
                };
            }
        }

        let body_prefix: String = message
            .body_text
            .chars()
            .take(BODY_SCAN_LIMIT)
            .collect::<String>()
            .to_lowercase();
        let blob = format!(
            "{} {} {}",
            message.subject.to_lowercase(),
            message.snippet.to_lowercase(),
            body_prefix
        );

        let keyword_score = FINANCE_KEYWORDS
            .iter()
            .filter(|kw| blob.contains(**kw))
            .count();

        let has_amount = AMOUNT_RE.is_match(&blob);
        let allowlisted = sender_domain
            .as_deref()
            .map(|domain| ALLOW_DOMAINS.iter().any(|d| domain.ends_with(d)))
            .unwrap_or(false);

        // Mass mail without a concrete amount is promotional, not a record
        // of money moving.
        if message.list_unsubscribe.is_some() && !has_amount {
            return Classification {
                relevant: false,
                template_hints: Vec::new(),
            };
        }

        let relevant = keyword_score >= 2
            || (keyword_score >= 1 && has_amount)
            || (allowlisted && (keyword_score >= 1 || has_amount));

        if !relevant {
            return Classification {
                relevant: false,
                template_hints: Vec::new(),
            };
        }

        let mut template_hints = Vec::new();
        if is_apple_receipt(&message.subject.to_lowercase(), &sender) {
            template_hints.push(TemplateHint::AppleReceipt);
        }
        if RECEIPT_KEYWORDS.iter().any(|kw| blob.contains(*kw)) || has_amount {
            template_hints.push(TemplateHint::Receipt);
        }
        if SUBSCRIPTION_KEYWORDS.iter().any(|kw| blob.contains(*kw)) {
            template_hints.push(TemplateHint::SubscriptionNotice);
        }

        Classification {
            relevant,
            template_hints,
        }
    }
}

fn sender_domain(from_header: &str) -> Option<String> {
    let at = from_header.rfind('@')?;
    let tail = &from_header[at + 1..];
    let end = tail
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '-'))
        .unwrap_or(tail.len());
    let domain = &tail[..end];
    if domain.contains('.') {
        Some(domain.to_string())
    } else {
        None
    }
}

/// Apple receipt gate: Apple-ish sender plus a receipt-ish subject.
fn is_apple_receipt(subject: &str, sender: &str) -> bool {
    let apple_sender =
        APPLE_SENDER_MARKERS.iter().any(|m| sender.contains(m)) || subject.contains("apple");
    apple_sender && APPLE_SUBJECT_MARKERS.iter().any(|m| subject.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageStatus;
    use chrono::Utc;
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

    #[test]
    fn test_receipt_with_amount_is_relevant() {
        let msg = message(
            "Netflix <info@mailer.netflix.com>",
            "Your Netflix receipt",
            "Your subscription renewed. We charged $15.49.",
        );
        let c = FinanceClassifier::classify(&msg);
        assert!(c.relevant);
        assert!(c.template_hints.contains(&TemplateHint::Receipt));
        assert!(c.template_hints.contains(&TemplateHint::SubscriptionNotice));
    }

    #[test]
    fn test_social_notification_is_irrelevant() {
        let msg = message(
            "LinkedIn <updates@linkedin.com>",
            "You appeared in 5 searches",
            "See who viewed your profile",
        );
        let c = FinanceClassifier::classify(&msg);
        assert!(!c.relevant);
        assert!(c.template_hints.is_empty());
    }

    #[test]
    fn test_newsletter_without_amount_is_irrelevant() {
        let mut msg = message(
            "Deals <deals@shop.example.com>",
            "Try our premium plan today",
            "Upgrade your membership and save",
        );
        msg.list_unsubscribe = Some("<mailto:unsub@shop.example.com>".to_string());
        let c = FinanceClassifier::classify(&msg);
        assert!(!c.relevant);
    }

    #[test]
    fn test_apple_receipt_hint() {
        let msg = message(
            "Apple <no_reply@email.apple.com>",
            "Your receipt from Apple",
            "App Store\nDisney+ (Monthly)  $13.99\nTotal: $13.99",
        );
        let c = FinanceClassifier::classify(&msg);
        assert!(c.relevant);
        assert!(c.template_hints.contains(&TemplateHint::AppleReceipt));
    }

    #[test]
    fn test_classification_is_deterministic() {
        let msg = message(
            "Spotify <no-reply@spotify.com>",
            "Payment receipt",
            "Your Premium subscription renewed for $10.99",
        );
        let first = FinanceClassifier::classify(&msg);
        let second = FinanceClassifier::classify(&msg);
        assert_eq!(first.relevant, second.relevant);
        assert_eq!(first.template_hints, second.template_hints);
    }
}

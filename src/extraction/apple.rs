//! Apple receipt line-item parsing
//!
//! Platform receipts (App Store, iTunes) bill through Apple but the fact
//! the user cares about is the purchased service. This parser walks the
//! receipt body for the first priced line item and surfaces that item as
//! the merchant instead of "Apple".

use super::rules::{currency_code, parse_amount, AMOUNT_RE};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ORDER_ID_RE: Regex =
        Regex::new(r"(?i)(?:Order ID|Order Number|Document No\.?)\s*[:#]?\s*([A-Z0-9\-]+)")
            .expect("order id pattern is valid");
}

/// A priced line item pulled from an Apple receipt body.
#[derive(Debug, Clone, PartialEq)]
pub struct AppleLineItem {
    pub description: String,
    pub amount: f64,
    pub currency: String,
    pub order_id: Option<String>,
}

const DESC_TRIM: &[char] = &[' ', '-', ':', '\t'];

/// Subtotal/total rows are bookkeeping, not purchased items.
fn is_total_line(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["total", "subtotal", "tax", "balance", "amount charged"]
        .iter()
        .any(|k| lower.contains(k))
}

/// Find the first non-total priced line. Receipts sometimes put the item
/// name on its own line above the price, so an empty description falls
/// back to the previous line.
pub fn parse_line_item(body_text: &str) -> Option<AppleLineItem> {
    let order_id = ORDER_ID_RE
        .captures(body_text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    let mut previous = "";
    for line in body_text.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        for caps in AMOUNT_RE.captures_iter(line) {
            let whole = caps.get(0)?;
            let mut desc = line[..whole.start()].trim_matches(DESC_TRIM).to_string();
            if desc.is_empty() && !previous.is_empty() {
                desc = previous.trim_matches(DESC_TRIM).to_string();
            }
            if desc.is_empty() || is_total_line(&desc) || is_total_line(line) {
                continue;
            }

            let amount = parse_amount(caps.name("amount")?.as_str())?;
            let currency = currency_code(caps.name("currency")?.as_str())?;
            return Some(AppleLineItem {
                description: desc.chars().take(256).collect(),
                amount,
                currency: currency.to_string(),
                order_id,
            });
        }
        previous = line;
    }
    None
}

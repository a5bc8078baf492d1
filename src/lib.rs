//! Finance Autopilot core
//!
//! Mailbox ingestion-and-extraction pipeline:
//! - Pulls mail incrementally under delegated OAuth, resumable per mailbox
//! - Classifies finance-relevant messages deterministically
//! - Extracts structured records rules-first with an optional LLM fallback
//! - Reconciles candidates into canonical FinancialFacts (one per dedup key)
//! - Schedules renewal and anomaly alerts from reconciled facts
//! - Drafts refund/cancellation emails for user review (never auto-sends)
//!
//! PIPELINE:
//! FETCH → CLASSIFY → EXTRACT → RECONCILE → ALERT → (delivery stub)

pub mod alerts;
pub mod classifier;
pub mod config;
pub mod cursor;
pub mod delivery;
pub mod draft;
pub mod error;
pub mod extraction;
pub mod fingerprint;
pub mod models;
pub mod pipeline;
pub mod reconcile;
pub mod source;
pub mod store;
pub mod vault;

pub use error::Result;

// Re-export common types
pub use classifier::{Classification, FinanceClassifier, TemplateHint};
pub use models::*;

//! Dedup & reconciliation store
//!
//! Canonicalizes candidate records into FinancialFacts. One fact per
//! dedup key; merges are field-by-field by confidence with rule-derived
//! amount/date always outranking LLM-derived values. Reconciliations on
//! the same key serialize through a per-key writer lock; different keys
//! never contend. Facts live in memory by default, or in Postgres when
//! `DATABASE_URL`/`POSTGRES_URL` is set (lazy pool, schema created on
//! first use, in-memory fallback if the pool cannot be built).

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::{
    ExtractedRecord, ExtractionMethod, FieldSource, FinancialFact, RecordKind,
};
use crate::Result;
use chrono::{Datelike, NaiveDate, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

//
// ================= Merchant normalization =================
//

const NOISE_TOKENS: &[&str] = &[
    "payment", "payments", "purchase", "purchases", "receipt", "invoice", "order",
    "confirm", "confirmation", "subscription", "subs", "billing", "bill", "charges",
];

const SEPARATORS: &[char] = &[
    '•', '·', '|', '/', '\\', ',', ';', '—', '-', '_', ':', '(', ')', '[', ']', '{', '}', '*',
];

/// Normalize a merchant string so recurring charges group together.
/// Conservative on purpose: over-merging is worse than under-merging.
pub fn normalize_merchant(raw: &str) -> String {
    let mut s = raw.trim().to_lowercase();
    if s.is_empty() {
        return s;
    }

    for sep in SEPARATORS {
        s = s.replace(*sep, " ");
    }

    let mut parts: Vec<&str> = s
        .split_whitespace()
        .filter(|p| !NOISE_TOKENS.contains(p))
        .collect();

    // Trailing digits are usually a card suffix.
    while parts.last().map(|p| p.chars().all(|c| c.is_ascii_digit())).unwrap_or(false) {
        parts.pop();
    }

    let key = parts.into_iter().take(6).collect::<Vec<_>>().join(" ");
    if key.is_empty() {
        s.trim().to_string()
    } else {
        key
    }
}

//
// ================= Dedup key =================
//

/// Derive the dedup key for a candidate. Reproducible across restarts:
/// pure arithmetic over normalized fields, no hashing state.
pub fn dedup_key(
    merchant_key: &str,
    amount: Option<f64>,
    currency: Option<&str>,
    date: Option<NaiveDate>,
    kind: RecordKind,
    window_days: i64,
) -> String {
    let minor_units = amount
        .map(|a| ((a * 100.0).round() as i64).to_string())
        .unwrap_or_else(|| "none".to_string());
    let bucket = date
        .map(|d| (i64::from(d.num_days_from_ce()).div_euclid(window_days)).to_string())
        .unwrap_or_else(|| "none".to_string());
    let currency = currency.map(|c| c.to_uppercase()).unwrap_or_else(|| "none".to_string());

    format!("{}:{}:{}:{}:{}", kind, merchant_key, currency, minor_units, bucket)
}

/// Result of one reconciliation, handed to the alert scheduler.
#[derive(Debug, Clone)]
pub struct FactChange {
    pub fact: FinancialFact,
    pub created: bool,
}

//
// ================= Merge policy =================
//

/// Whether a new field value displaces the current winner.
/// Rule-derived always outranks LLM-derived; within a method the higher
/// confidence wins; on a tie, the most recent extraction wins.
fn wins(new: &FieldSource, current: &FieldSource) -> bool {
    match (new.method, current.method) {
        (ExtractionMethod::Rule, ExtractionMethod::Llm) => true,
        (ExtractionMethod::Llm, ExtractionMethod::Rule) => false,
        _ => {
            if new.confidence != current.confidence {
                new.confidence > current.confidence
            } else {
                new.extracted_at >= current.extracted_at
            }
        }
    }
}

/// Median gap in days between successive distinct charge dates, or None
/// below two dates. Used as the inferred billing cycle.
fn median_gap_days(dates: &[NaiveDate]) -> Option<i64> {
    let mut sorted: Vec<NaiveDate> = dates.to_vec();
    sorted.sort();
    sorted.dedup();
    if sorted.len() < 2 {
        return None;
    }
    let mut gaps: Vec<i64> = sorted
        .windows(2)
        .map(|w| (w[1] - w[0]).num_days())
        .filter(|g| *g > 0)
        .collect();
    if gaps.is_empty() {
        return None;
    }
    gaps.sort();
    Some(gaps[gaps.len() / 2])
}

//
// ================= Store =================
//

enum FactBackend {
    InMemory {
        facts: Arc<RwLock<HashMap<String, FinancialFact>>>,
    },
    Postgres {
        pool: PgPool,
        schema_ready: Arc<OnceCell<()>>,
    },
}

pub struct FactStore {
    backend: FactBackend,
    /// One writer per dedup key. Entries are created on first touch and
    /// never removed; the pipeline holds a lock only across the
    /// read-merge-write below, never across a suspend point that blocks
    /// on the network.
    key_locks: Arc<RwLock<HashMap<String, Arc<Mutex<()>>>>>,
    dedup_window_days: i64,
    recurrence_min_days: i64,
    recurrence_max_days: i64,
}

impl FactStore {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            backend: build_backend(),
            key_locks: Arc::new(RwLock::new(HashMap::new())),
            dedup_window_days: config.dedup_window_days,
            recurrence_min_days: config.recurrence_min_days,
            recurrence_max_days: config.recurrence_max_days,
        }
    }

    /// In-memory store regardless of environment (tests, demos).
    pub fn in_memory(config: &PipelineConfig) -> Self {
        Self {
            backend: FactBackend::InMemory {
                facts: Arc::new(RwLock::new(HashMap::new())),
            },
            key_locks: Arc::new(RwLock::new(HashMap::new())),
            dedup_window_days: config.dedup_window_days,
            recurrence_min_days: config.recurrence_min_days,
            recurrence_max_days: config.recurrence_max_days,
        }
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.key_locks.read().await;
            if let Some(lock) = locks.get(key) {
                return lock.clone();
            }
        }
        let mut locks = self.key_locks.write().await;
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Reconcile one candidate into its canonical fact.
    pub async fn reconcile(&self, candidate: &ExtractedRecord) -> Result<FactChange> {
        let merchant_raw = candidate.merchant.as_deref().unwrap_or("");
        let merchant_key = normalize_merchant(merchant_raw);
        if merchant_key.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "candidate {} has no merchant to key on",
                candidate.record_id
            )));
        }

        let key = dedup_key(
            &merchant_key,
            candidate.amount,
            candidate.currency.as_deref(),
            candidate.date,
            candidate.kind,
            self.dedup_window_days,
        );

        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        let existing = self.load(&key).await?;
        let expected_revision = existing.as_ref().map(|f| f.revision).unwrap_or(0);

        let (fact, created) = match existing {
            Some(mut fact) => {
                self.merge_into(&mut fact, candidate);
                (fact, false)
            }
            None => (self.create_fact(&key, &merchant_key, candidate), true),
        };

        self.save(&fact, expected_revision).await?;

        debug!(
            dedup_key = %key,
            revision = fact.revision,
            created = created,
            "Fact reconciled"
        );

        Ok(FactChange { fact, created })
    }

    fn create_fact(
        &self,
        key: &str,
        merchant_key: &str,
        candidate: &ExtractedRecord,
    ) -> FinancialFact {
        let now = Utc::now();
        let source = |confidence: f32| FieldSource {
            method: candidate.method,
            confidence,
            extracted_at: candidate.extracted_at,
        };

        let mut fact = FinancialFact {
            fact_id: Uuid::new_v4(),
            dedup_key: key.to_string(),
            kind: candidate.kind,
            merchant: candidate.merchant.clone().unwrap_or_else(|| merchant_key.to_string()),
            merchant_key: merchant_key.to_string(),
            amount: candidate.amount,
            currency: candidate.currency.clone(),
            date: candidate.date,
            category: candidate.category.clone(),
            renewal_date: candidate.renewal_date,
            trial_end_date: candidate.trial_end_date,
            recurrence_days: candidate.recurrence_hint_days,
            amount_source: candidate.amount.map(|_| source(candidate.confidence.amount)),
            date_source: candidate.date.map(|_| source(candidate.confidence.date)),
            merchant_source: candidate.merchant.as_ref().map(|_| source(candidate.confidence.merchant)),
            contributors: vec![candidate.record_id],
            amount_history: candidate.amount.into_iter().collect(),
            date_history: candidate.date.into_iter().collect(),
            revision: 1,
            first_seen_at: now,
            updated_at: now,
        };
        self.refresh_recurrence(&mut fact);
        fact
    }

    fn merge_into(&self, fact: &mut FinancialFact, candidate: &ExtractedRecord) {
        let source = |confidence: f32| FieldSource {
            method: candidate.method,
            confidence,
            extracted_at: candidate.extracted_at,
        };

        if let Some(amount) = candidate.amount {
            let new_source = source(candidate.confidence.amount);
            let take = fact
                .amount_source
                .map(|current| wins(&new_source, &current))
                .unwrap_or(true);
            if take {
                fact.amount = Some(amount);
                if candidate.currency.is_some() {
                    fact.currency = candidate.currency.clone();
                }
                fact.amount_source = Some(new_source);
            }
            fact.amount_history.push(amount);
        }

        if let Some(date) = candidate.date {
            let new_source = source(candidate.confidence.date);
            let take = fact
                .date_source
                .map(|current| wins(&new_source, &current))
                .unwrap_or(true);
            if take {
                fact.date = Some(date);
                fact.date_source = Some(new_source);
            }
            if !fact.date_history.contains(&date) {
                fact.date_history.push(date);
            }
        }

        if let Some(merchant) = &candidate.merchant {
            let new_source = source(candidate.confidence.merchant);
            let take = fact
                .merchant_source
                .map(|current| wins(&new_source, &current))
                .unwrap_or(true);
            if take {
                fact.merchant = merchant.clone();
                fact.merchant_source = Some(new_source);
            }
        }

        if fact.category.is_none() {
            fact.category = candidate.category.clone();
        }
        if let Some(renewal) = candidate.renewal_date {
            // Explicit renewal dates: keep the latest one known.
            if fact.renewal_date.map(|d| renewal > d).unwrap_or(true) {
                fact.renewal_date = Some(renewal);
            }
        }
        if let Some(trial_end) = candidate.trial_end_date {
            if fact.trial_end_date.map(|d| trial_end > d).unwrap_or(true) {
                fact.trial_end_date = Some(trial_end);
            }
        }
        if candidate.recurrence_hint_days.is_some() {
            fact.recurrence_days = candidate.recurrence_hint_days;
        }
        if candidate.kind == RecordKind::Subscription {
            fact.kind = RecordKind::Subscription;
        }

        if !fact.contributors.contains(&candidate.record_id) {
            fact.contributors.push(candidate.record_id);
        }
        fact.revision += 1;
        fact.updated_at = Utc::now();
        self.refresh_recurrence(fact);
    }

    /// Infer the billing cycle from charge-date gaps when no explicit
    /// hint exists; cycles outside the configured range are noise.
    fn refresh_recurrence(&self, fact: &mut FinancialFact) {
        if fact.recurrence_days.is_some() {
            return;
        }
        if let Some(gap) = median_gap_days(&fact.date_history) {
            if gap >= self.recurrence_min_days && gap <= self.recurrence_max_days {
                fact.recurrence_days = Some(gap);
            }
        }
    }

    //
    // ================= Backend plumbing =================
    //

    async fn ensure_schema_if_needed(&self) -> Result<()> {
        let FactBackend::Postgres { pool, schema_ready } = &self.backend else {
            return Ok(());
        };

        schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS financial_facts (
                      dedup_key TEXT PRIMARY KEY,
                      fact_id UUID NOT NULL,
                      revision BIGINT NOT NULL,
                      fact TEXT NOT NULL,
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                PipelineError::Store(format!("failed to initialize fact schema: {}", e))
            })?;

        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<FinancialFact>> {
        match &self.backend {
            FactBackend::InMemory { facts } => {
                let facts = facts.read().await;
                Ok(facts.get(key).cloned())
            }
            FactBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                let row = sqlx::query("SELECT fact FROM financial_facts WHERE dedup_key = $1")
                    .bind(key)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| PipelineError::Store(format!("fact load failed: {}", e)))?;

                match row {
                    Some(row) => {
                        let raw: String = row
                            .try_get("fact")
                            .map_err(|e| PipelineError::Store(format!("fact column: {}", e)))?;
                        Ok(Some(serde_json::from_str(&raw)?))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    async fn save(&self, fact: &FinancialFact, expected_revision: u64) -> Result<()> {
        match &self.backend {
            FactBackend::InMemory { facts } => {
                let mut facts = facts.write().await;
                if let Some(current) = facts.get(&fact.dedup_key) {
                    if current.revision != expected_revision {
                        // Should not happen under the per-key writer lock.
                        return Err(PipelineError::ReconciliationConflict(format!(
                            "fact {} moved from revision {} to {} underneath a writer",
                            fact.dedup_key, expected_revision, current.revision
                        )));
                    }
                }
                facts.insert(fact.dedup_key.clone(), fact.clone());
                Ok(())
            }
            FactBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                let serialized = serde_json::to_string(fact)?;
                let result = sqlx::query(
                    r#"
                    INSERT INTO financial_facts (dedup_key, fact_id, revision, fact, updated_at)
                    VALUES ($1, $2, $3, $4, NOW())
                    ON CONFLICT (dedup_key) DO UPDATE
                      SET fact_id = EXCLUDED.fact_id,
                          revision = EXCLUDED.revision,
                          fact = EXCLUDED.fact,
                          updated_at = NOW()
                      WHERE financial_facts.revision = $5
                    "#,
                )
                .bind(&fact.dedup_key)
                .bind(fact.fact_id)
                .bind(fact.revision as i64)
                .bind(&serialized)
                .bind(expected_revision as i64)
                .execute(pool)
                .await
                .map_err(|e| PipelineError::Store(format!("fact save failed: {}", e)))?;

                if result.rows_affected() == 0 {
                    return Err(PipelineError::ReconciliationConflict(format!(
                        "fact {} was not at expected revision {}",
                        fact.dedup_key, expected_revision
                    )));
                }
                Ok(())
            }
        }
    }

    pub async fn get(&self, fact_id: Uuid) -> Result<Option<FinancialFact>> {
        match &self.backend {
            FactBackend::InMemory { facts } => {
                let facts = facts.read().await;
                Ok(facts.values().find(|f| f.fact_id == fact_id).cloned())
            }
            FactBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                let row = sqlx::query("SELECT fact FROM financial_facts WHERE fact_id = $1")
                    .bind(fact_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| PipelineError::Store(format!("fact load failed: {}", e)))?;
                match row {
                    Some(row) => {
                        let raw: String = row
                            .try_get("fact")
                            .map_err(|e| PipelineError::Store(format!("fact column: {}", e)))?;
                        Ok(Some(serde_json::from_str(&raw)?))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    pub async fn all(&self) -> Result<Vec<FinancialFact>> {
        match &self.backend {
            FactBackend::InMemory { facts } => {
                let facts = facts.read().await;
                let mut out: Vec<FinancialFact> = facts.values().cloned().collect();
                out.sort_by(|a, b| a.dedup_key.cmp(&b.dedup_key));
                Ok(out)
            }
            FactBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                let rows = sqlx::query("SELECT fact FROM financial_facts ORDER BY dedup_key")
                    .fetch_all(pool)
                    .await
                    .map_err(|e| PipelineError::Store(format!("fact list failed: {}", e)))?;
                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    let raw: String = row
                        .try_get("fact")
                        .map_err(|e| PipelineError::Store(format!("fact column: {}", e)))?;
                    out.push(serde_json::from_str(&raw)?);
                }
                Ok(out)
            }
        }
    }
}

fn build_backend() -> FactBackend {
    let database_url = env::var("POSTGRES_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .ok();

    if let Some(url) = database_url {
        match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(&url)
        {
            Ok(pool) => {
                info!("Fact store backend: postgres");
                return FactBackend::Postgres {
                    pool,
                    schema_ready: Arc::new(OnceCell::new()),
                };
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres fact backend, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Fact store backend: in-memory");
    FactBackend::InMemory {
        facts: Arc::new(RwLock::new(HashMap::new())),
    }
}

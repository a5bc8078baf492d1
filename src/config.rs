//! Pipeline configuration
//!
//! Every product tolerance lives here rather than as a hard-coded
//! constant: dedup bucketing, anomaly thresholds, renewal lead time,
//! confidence defaults. Loaded from the environment; the binary calls
//! `dotenv` first so a local `.env` works too.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Width of the dedup date bucket, in days. Candidates whose dates
    /// land in the same bucket can reconcile into one fact.
    pub dedup_window_days: i64,
    /// Confidence attached to every rule-derived field.
    pub rule_confidence: f32,
    /// Default confidence for LLM-derived fields when the provider does
    /// not report one.
    pub llm_default_confidence: f32,
    /// Below this overall confidence the engine tries the LLM fallback.
    pub llm_fallback_threshold: f32,
    /// z-score at which a charge counts as anomalous.
    pub anomaly_z_threshold: f64,
    /// Minimum historical amounts before anomaly scoring activates.
    pub anomaly_min_samples: usize,
    /// Days before a renewal date that the renewal alert should fire.
    pub renewal_lead_days: i64,
    /// A recomputed trigger within this many hours of the scheduled one
    /// does not force a cancel-and-replace.
    pub reschedule_tolerance_hours: i64,
    /// Inferred billing cycles outside this range are discarded.
    pub recurrence_min_days: i64,
    pub recurrence_max_days: i64,
    /// Messages listed per source page.
    pub sync_page_size: usize,
    /// How far back the first sync of a mailbox reaches.
    pub sync_lookback_days: i64,
    /// Bound on any single source or LLM request.
    pub request_timeout: Duration,
    /// Search query the Gmail adapter applies on top of the watermark.
    pub gmail_query: String,
    /// LLM provider selection: "none" or "openai_chat_completions".
    pub llm_provider: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_model: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedup_window_days: 7,
            rule_confidence: 0.9,
            llm_default_confidence: 0.6,
            llm_fallback_threshold: 0.5,
            anomaly_z_threshold: 3.0,
            anomaly_min_samples: 5,
            renewal_lead_days: 1,
            reschedule_tolerance_hours: 12,
            recurrence_min_days: 7,
            recurrence_max_days: 400,
            sync_page_size: 100,
            sync_lookback_days: 90,
            request_timeout: Duration::from_secs(30),
            gmail_query: "(receipt OR invoice OR \"payment received\" OR subscription \
                          OR renewal OR trial OR \"order confirmation\")"
                .to_string(),
            llm_provider: "none".to_string(),
            openai_api_key: String::new(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_model: "gpt-4o-mini".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Build a config from environment variables, falling back to the
    /// defaults above for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            dedup_window_days: env_parse("DEDUP_WINDOW_DAYS", defaults.dedup_window_days),
            rule_confidence: env_parse("RULE_CONFIDENCE", defaults.rule_confidence),
            llm_default_confidence: env_parse(
                "LLM_DEFAULT_CONFIDENCE",
                defaults.llm_default_confidence,
            ),
            llm_fallback_threshold: env_parse(
                "LLM_FALLBACK_THRESHOLD",
                defaults.llm_fallback_threshold,
            ),
            anomaly_z_threshold: env_parse("ANOMALY_Z_THRESHOLD", defaults.anomaly_z_threshold),
            anomaly_min_samples: env_parse("ANOMALY_MIN_SAMPLES", defaults.anomaly_min_samples),
            renewal_lead_days: env_parse("RENEWAL_LEAD_DAYS", defaults.renewal_lead_days),
            reschedule_tolerance_hours: env_parse(
                "RESCHEDULE_TOLERANCE_HOURS",
                defaults.reschedule_tolerance_hours,
            ),
            recurrence_min_days: env_parse("RECURRENCE_MIN_DAYS", defaults.recurrence_min_days),
            recurrence_max_days: env_parse("RECURRENCE_MAX_DAYS", defaults.recurrence_max_days),
            sync_page_size: env_parse("SYNC_PAGE_SIZE", defaults.sync_page_size),
            sync_lookback_days: env_parse("SYNC_LOOKBACK_DAYS", defaults.sync_lookback_days),
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECS", 30u64)),
            gmail_query: env::var("GMAIL_QUERY").unwrap_or(defaults.gmail_query),
            llm_provider: env::var("LLM_PROVIDER").unwrap_or(defaults.llm_provider),
            openai_api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            openai_base_url: env::var("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            openai_model: env::var("OPENAI_MODEL").unwrap_or(defaults.openai_model),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = PipelineConfig::default();
        assert!(cfg.dedup_window_days >= 1);
        assert!(cfg.rule_confidence > cfg.llm_default_confidence);
        assert!(cfg.recurrence_min_days < cfg.recurrence_max_days);
        assert_eq!(cfg.llm_provider, "none");
    }

    #[test]
    fn test_env_parse_falls_back() {
        assert_eq!(env_parse("DEFINITELY_UNSET_VAR_12345", 42i64), 42);
    }
}

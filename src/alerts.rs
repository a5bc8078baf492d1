//! Alert scheduler
//!
//! Derives future-dated alerts from reconciled facts and maintains the
//! due-queue. Per event the machine is scheduled → fired | cancelled |
//! suppressed; a fired event is never mutated, stale schedules are
//! cancelled and replaced rather than edited in place.

use crate::config::PipelineConfig;
use crate::delivery::Delivery;
use crate::models::{AlertEvent, AlertKind, AlertStatus, FinancialFact, RecordKind};
use crate::reconcile::FactChange;
use crate::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Wording that marks a charge as suspicious regardless of amount.
const SCAM_KEYWORDS: &[&str] = &[
    "gift card",
    "bitcoin",
    "crypto",
    "urgent",
    "suspended",
    "account locked",
    "verification code",
];

pub struct AlertScheduler {
    renewal_lead_days: i64,
    reschedule_tolerance: Duration,
    anomaly_z_threshold: f64,
    anomaly_min_samples: usize,
    alerts: Arc<RwLock<HashMap<Uuid, AlertEvent>>>,
    /// Last fact revision that produced an anomaly alert, per fact.
    anomaly_marks: Arc<RwLock<HashMap<Uuid, u64>>>,
    delivery: Arc<dyn Delivery>,
}

impl AlertScheduler {
    pub fn new(config: &PipelineConfig, delivery: Arc<dyn Delivery>) -> Self {
        Self {
            renewal_lead_days: config.renewal_lead_days,
            reschedule_tolerance: Duration::hours(config.reschedule_tolerance_hours),
            anomaly_z_threshold: config.anomaly_z_threshold,
            anomaly_min_samples: config.anomaly_min_samples,
            alerts: Arc::new(RwLock::new(HashMap::new())),
            anomaly_marks: Arc::new(RwLock::new(HashMap::new())),
            delivery,
        }
    }

    /// React to one fact revision: reschedule the renewal alert if the
    /// expected trigger moved, and score the revision for anomalies.
    pub async fn apply(&self, change: &FactChange, now: DateTime<Utc>) -> Result<()> {
        self.reschedule_renewal(&change.fact, now).await?;
        self.score_anomaly(&change.fact).await?;
        Ok(())
    }

    async fn reschedule_renewal(&self, fact: &FinancialFact, now: DateTime<Utc>) -> Result<()> {
        if fact.kind != RecordKind::Subscription {
            return Ok(());
        }

        let expected = self.expected_renewal_trigger(fact, now);

        let mut alerts = self.alerts.write().await;
        let existing: Option<Uuid> = alerts
            .values()
            .find(|a| {
                a.fact_id == fact.fact_id
                    && a.kind == AlertKind::RenewalUpcoming
                    && a.status == AlertStatus::Scheduled
            })
            .map(|a| a.alert_id);

        match (existing, expected) {
            (None, Some(trigger_at)) => {
                let alert = self.renewal_alert(fact, trigger_at);
                info!(
                    fact_id = %fact.fact_id,
                    trigger_at = %trigger_at,
                    "Renewal alert scheduled"
                );
                alerts.insert(alert.alert_id, alert);
            }
            (Some(alert_id), Some(trigger_at)) => {
                let stale = {
                    let current = &alerts[&alert_id];
                    (current.trigger_at - trigger_at).abs() > self.reschedule_tolerance
                };
                if stale {
                    // Cancel-and-replace; scheduled events are never
                    // silently edited.
                    if let Some(current) = alerts.get_mut(&alert_id) {
                        current.status = AlertStatus::Cancelled;
                    }
                    let alert = self.renewal_alert(fact, trigger_at);
                    info!(
                        fact_id = %fact.fact_id,
                        trigger_at = %trigger_at,
                        "Stale renewal alert cancelled and replaced"
                    );
                    alerts.insert(alert.alert_id, alert);
                }
            }
            (Some(alert_id), None) => {
                // The fact no longer supports a trigger (subscription
                // gone quiet or renewal date removed).
                if let Some(current) = alerts.get_mut(&alert_id) {
                    current.status = AlertStatus::Cancelled;
                    debug!(fact_id = %fact.fact_id, "Renewal alert cancelled");
                }
            }
            (None, None) => {}
        }

        Ok(())
    }

    /// Next renewal − lead time, as a UTC instant. Explicit renewal dates
    /// outrank trial ends, which outrank cadence prediction.
    fn expected_renewal_trigger(
        &self,
        fact: &FinancialFact,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let today = now.date_naive();

        let renewal = fact
            .renewal_date
            .filter(|d| *d >= today)
            .or_else(|| fact.trial_end_date.filter(|d| *d >= today))
            .or_else(|| self.predicted_renewal(fact, today))?;

        let trigger_date = renewal - Duration::days(self.renewal_lead_days);
        Some(
            trigger_date
                .and_hms_opt(0, 0, 0)
                .expect("midnight is a valid time")
                .and_utc(),
        )
    }

    /// Cadence prediction: last charge + cycle, rolled forward past
    /// missed cycles (bounded, as bad inputs must not loop forever).
    fn predicted_renewal(&self, fact: &FinancialFact, today: NaiveDate) -> Option<NaiveDate> {
        let cycle = fact.recurrence_days?;
        let last = fact.date_history.iter().max().copied().or(fact.date)?;

        let mut next = last + Duration::days(cycle);
        for _ in 0..24 {
            if next >= today {
                return Some(next);
            }
            next += Duration::days(cycle);
        }
        Some(next)
    }

    fn renewal_alert(&self, fact: &FinancialFact, trigger_at: DateTime<Utc>) -> AlertEvent {
        let amount = match (fact.amount, fact.currency.as_deref()) {
            (Some(a), Some(c)) => format!("{} {:.2}", c, a),
            (Some(a), None) => format!("{:.2}", a),
            _ => "an amount".to_string(),
        };
        AlertEvent {
            alert_id: Uuid::new_v4(),
            fact_id: fact.fact_id,
            kind: AlertKind::RenewalUpcoming,
            status: AlertStatus::Scheduled,
            trigger_at,
            title: format!("Upcoming renewal: {}", fact.merchant),
            body: format!(
                "Your {} subscription renews soon for {}.",
                fact.merchant, amount
            ),
            fact_revision: fact.revision,
            created_at: Utc::now(),
        }
    }

    async fn score_anomaly(&self, fact: &FinancialFact) -> Result<()> {
        let Some(amount) = fact.amount else {
            return Ok(());
        };

        // Baseline is everything observed before this revision's charge.
        let history = &fact.amount_history;
        if history.len() < 2 {
            return self.keyword_only_anomaly(fact).await;
        }
        let (latest, baseline) = history.split_last().expect("len checked above");

        let mut reasons: Vec<String> = Vec::new();
        if baseline.len() >= self.anomaly_min_samples {
            if let Some(z) = z_score(*latest, baseline) {
                if z >= self.anomaly_z_threshold {
                    reasons.push(format!(
                        "amount {:.2} is {:.1}\u{03c3} from this merchant's baseline",
                        amount, z
                    ));
                }
            }
        }
        if let Some(keyword) = scam_keyword(&fact.merchant) {
            reasons.push(format!("suspicious wording: \"{}\"", keyword));
        }

        if reasons.is_empty() {
            return Ok(());
        }
        self.create_anomaly_alert(fact, reasons.join("; ")).await
    }

    async fn keyword_only_anomaly(&self, fact: &FinancialFact) -> Result<()> {
        if let Some(keyword) = scam_keyword(&fact.merchant) {
            return self
                .create_anomaly_alert(fact, format!("suspicious wording: \"{}\"", keyword))
                .await;
        }
        Ok(())
    }

    async fn create_anomaly_alert(&self, fact: &FinancialFact, reason: String) -> Result<()> {
        // At most one anomaly alert per anomalous revision.
        {
            let marks = self.anomaly_marks.read().await;
            if marks.get(&fact.fact_id) == Some(&fact.revision) {
                return Ok(());
            }
        }

        let alert = AlertEvent {
            alert_id: Uuid::new_v4(),
            fact_id: fact.fact_id,
            kind: AlertKind::Anomaly,
            status: AlertStatus::Scheduled,
            trigger_at: Utc::now(),
            title: format!("Unusual charge: {}", fact.merchant),
            body: reason,
            fact_revision: fact.revision,
            created_at: Utc::now(),
        };

        info!(fact_id = %fact.fact_id, revision = fact.revision, "Anomaly alert created");

        let mut alerts = self.alerts.write().await;
        let mut marks = self.anomaly_marks.write().await;
        alerts.insert(alert.alert_id, alert);
        marks.insert(fact.fact_id, fact.revision);
        Ok(())
    }

    /// Hand every due scheduled alert to the delivery stub and mark it
    /// fired. Returns the fired events.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Result<Vec<AlertEvent>> {
        let due: Vec<AlertEvent> = {
            let alerts = self.alerts.read().await;
            alerts
                .values()
                .filter(|a| a.status == AlertStatus::Scheduled && a.trigger_at <= now)
                .cloned()
                .collect()
        };

        let mut fired = Vec::with_capacity(due.len());
        for mut alert in due {
            // Delivery happens outside the map lock.
            self.delivery.enqueue_notification(&alert).await?;
            alert.status = AlertStatus::Fired;
            let mut alerts = self.alerts.write().await;
            alerts.insert(alert.alert_id, alert.clone());
            fired.push(alert);
        }
        Ok(fired)
    }

    /// User opt-out for a scheduled alert.
    pub async fn suppress(&self, alert_id: Uuid) -> Result<()> {
        let mut alerts = self.alerts.write().await;
        if let Some(alert) = alerts.get_mut(&alert_id) {
            if alert.status == AlertStatus::Scheduled {
                alert.status = AlertStatus::Suppressed;
            }
        }
        Ok(())
    }

    pub async fn alerts_for_fact(&self, fact_id: Uuid) -> Vec<AlertEvent> {
        let alerts = self.alerts.read().await;
        let mut out: Vec<AlertEvent> = alerts
            .values()
            .filter(|a| a.fact_id == fact_id)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.created_at);
        out
    }

    pub async fn all(&self) -> Vec<AlertEvent> {
        let alerts = self.alerts.read().await;
        let mut out: Vec<AlertEvent> = alerts.values().cloned().collect();
        out.sort_by_key(|a| a.created_at);
        out
    }
}

fn z_score(amount: f64, baseline: &[f64]) -> Option<f64> {
    if baseline.is_empty() {
        return None;
    }
    let n = baseline.len() as f64;
    let mean = baseline.iter().sum::<f64>() / n;
    let variance = baseline.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n;
    let stdev = variance.sqrt();
    if stdev <= 0.0 {
        return None;
    }
    Some(((amount - mean) / stdev).abs())
}

fn scam_keyword(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    SCAM_KEYWORDS.iter().copied().find(|k| lower.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::RecordingDelivery;
    use crate::models::{ExtractionMethod, FieldSource};

    fn scheduler() -> (AlertScheduler, Arc<RecordingDelivery>) {
        let delivery = Arc::new(RecordingDelivery::new());
        let scheduler = AlertScheduler::new(&PipelineConfig::default(), delivery.clone());
        (scheduler, delivery)
    }

    fn subscription_fact(renewal: Option<NaiveDate>, revision: u64) -> FinancialFact {
        let now = Utc::now();
        FinancialFact {
            fact_id: Uuid::new_v4(),
            dedup_key: "subscription:netflix:USD:1549:0".to_string(),
            kind: RecordKind::Subscription,
            merchant: "Netflix".to_string(),
            merchant_key: "netflix".to_string(),
            amount: Some(15.49),
            currency: Some("USD".to_string()),
            date: None,
            category: None,
            renewal_date: renewal,
            trial_end_date: None,
            recurrence_days: None,
            amount_source: Some(FieldSource {
                method: ExtractionMethod::Rule,
                confidence: 0.9,
                extracted_at: now,
            }),
            date_source: None,
            merchant_source: None,
            contributors: vec![Uuid::new_v4()],
            amount_history: vec![15.49],
            date_history: vec![],
            revision,
            first_seen_at: now,
            updated_at: now,
        }
    }

    fn change(fact: FinancialFact) -> FactChange {
        FactChange { fact, created: false }
    }

    #[tokio::test]
    async fn test_renewal_alert_scheduled_with_lead_time() {
        let (scheduler, _) = scheduler();
        let now = Utc::now();
        let renewal = now.date_naive() + Duration::days(30);
        let fact = subscription_fact(Some(renewal), 1);

        scheduler.apply(&change(fact.clone()), now).await.unwrap();

        let alerts = scheduler.alerts_for_fact(fact.fact_id).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].status, AlertStatus::Scheduled);
        assert_eq!(
            alerts[0].trigger_at.date_naive(),
            renewal - Duration::days(1)
        );
    }

    #[tokio::test]
    async fn test_moved_renewal_cancels_and_replaces() {
        let (scheduler, _) = scheduler();
        let now = Utc::now();
        let mut fact = subscription_fact(Some(now.date_naive() + Duration::days(30)), 1);

        scheduler.apply(&change(fact.clone()), now).await.unwrap();

        fact.renewal_date = Some(now.date_naive() + Duration::days(45));
        fact.revision = 2;
        scheduler.apply(&change(fact.clone()), now).await.unwrap();

        let alerts = scheduler.alerts_for_fact(fact.fact_id).await;
        let cancelled: Vec<_> = alerts
            .iter()
            .filter(|a| a.status == AlertStatus::Cancelled)
            .collect();
        let scheduled: Vec<_> = alerts
            .iter()
            .filter(|a| a.status == AlertStatus::Scheduled)
            .collect();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(scheduled.len(), 1);
        assert_eq!(
            scheduled[0].trigger_at.date_naive(),
            now.date_naive() + Duration::days(44)
        );
    }

    #[tokio::test]
    async fn test_unmoved_renewal_is_left_alone() {
        let (scheduler, _) = scheduler();
        let now = Utc::now();
        let mut fact = subscription_fact(Some(now.date_naive() + Duration::days(30)), 1);

        scheduler.apply(&change(fact.clone()), now).await.unwrap();
        fact.revision = 2;
        scheduler.apply(&change(fact.clone()), now).await.unwrap();

        assert_eq!(scheduler.alerts_for_fact(fact.fact_id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_cadence_prediction_schedules_renewal() {
        let (scheduler, _) = scheduler();
        let now = Utc::now();
        let mut fact = subscription_fact(None, 1);
        fact.recurrence_days = Some(30);
        fact.date_history = vec![now.date_naive() - Duration::days(10)];

        scheduler.apply(&change(fact.clone()), now).await.unwrap();

        let alerts = scheduler.alerts_for_fact(fact.fact_id).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(
            alerts[0].trigger_at.date_naive(),
            now.date_naive() + Duration::days(19)
        );
    }

    #[tokio::test]
    async fn test_due_alert_fires_once() {
        let (scheduler, delivery) = scheduler();
        let now = Utc::now();
        let fact = subscription_fact(Some(now.date_naive()), 1);

        scheduler.apply(&change(fact.clone()), now).await.unwrap();

        let fired = scheduler.fire_due(now + Duration::days(1)).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].status, AlertStatus::Fired);
        assert_eq!(delivery.notifications().await.len(), 1);

        // A second pass finds nothing scheduled.
        let fired = scheduler.fire_due(now + Duration::days(2)).await.unwrap();
        assert!(fired.is_empty());
        assert_eq!(delivery.notifications().await.len(), 1);
    }

    #[tokio::test]
    async fn test_anomalous_amount_alerts_once_per_revision() {
        let (scheduler, _) = scheduler();
        let now = Utc::now();
        let mut fact = subscription_fact(None, 7);
        fact.kind = RecordKind::Transaction;
        fact.amount = Some(250.0);
        fact.amount_history = vec![15.0, 15.0, 16.0, 15.0, 15.5, 15.0, 250.0];

        scheduler.apply(&change(fact.clone()), now).await.unwrap();
        // Re-application of the same revision (crash replay) is a no-op.
        scheduler.apply(&change(fact.clone()), now).await.unwrap();

        let alerts = scheduler.alerts_for_fact(fact.fact_id).await;
        let anomalies: Vec<_> = alerts
            .iter()
            .filter(|a| a.kind == AlertKind::Anomaly)
            .collect();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].fact_revision, 7);
    }

    #[tokio::test]
    async fn test_steady_amounts_do_not_alert() {
        let (scheduler, _) = scheduler();
        let now = Utc::now();
        let mut fact = subscription_fact(None, 6);
        fact.kind = RecordKind::Transaction;
        fact.amount_history = vec![15.0, 15.49, 15.49, 15.0, 15.49, 15.49];

        scheduler.apply(&change(fact.clone()), now).await.unwrap();
        let anomalies: Vec<_> = scheduler
            .alerts_for_fact(fact.fact_id)
            .await
            .into_iter()
            .filter(|a| a.kind == AlertKind::Anomaly)
            .collect();
        assert!(anomalies.is_empty());
    }

    #[tokio::test]
    async fn test_suppress_opts_out() {
        let (scheduler, delivery) = scheduler();
        let now = Utc::now();
        let fact = subscription_fact(Some(now.date_naive()), 1);
        scheduler.apply(&change(fact.clone()), now).await.unwrap();

        let alert_id = scheduler.alerts_for_fact(fact.fact_id).await[0].alert_id;
        scheduler.suppress(alert_id).await.unwrap();

        let fired = scheduler.fire_due(now + Duration::days(2)).await.unwrap();
        assert!(fired.is_empty());
        assert!(delivery.notifications().await.is_empty());
    }
}

//! Per-mailbox sync pipeline
//!
//! fetch → classify → extract → reconcile → alert, as one idempotent,
//! re-entrant task function keyed by mailbox id. Each mailbox runs in a
//! single logical lane (its stages never race themselves); different
//! mailboxes sync concurrently. Every message commits to the cursor
//! store individually once it reaches a terminal status, so a crash or
//! cancellation anywhere leaves only the uncommitted tail to redo.

use crate::alerts::AlertScheduler;
use crate::classifier::FinanceClassifier;
use crate::config::PipelineConfig;
use crate::cursor::SyncCursorStore;
use crate::error::PipelineError;
use crate::extraction::ExtractionEngine;
use crate::fingerprint::message_fingerprint;
use crate::models::{
    Mailbox, MailboxStatus, MessageStatus, RawMessage, SyncCursor,
};
use crate::reconcile::FactStore;
use crate::source::{FetchedMessage, MailSource, SourceError};
use crate::store::MessageStore;
use crate::vault::{Credential, CredentialVault};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

//
// ================= Mailbox registry =================
//

/// Linked mailboxes and their lifecycle status.
pub struct MailboxRegistry {
    mailboxes: Arc<RwLock<HashMap<Uuid, Mailbox>>>,
}

impl MailboxRegistry {
    pub fn new() -> Self {
        Self {
            mailboxes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, mailbox: Mailbox) {
        let mut mailboxes = self.mailboxes.write().await;
        mailboxes.insert(mailbox.mailbox_id, mailbox);
    }

    pub async fn get(&self, mailbox_id: Uuid) -> Option<Mailbox> {
        let mailboxes = self.mailboxes.read().await;
        mailboxes.get(&mailbox_id).cloned()
    }

    pub async fn set_status(&self, mailbox_id: Uuid, status: MailboxStatus) {
        let mut mailboxes = self.mailboxes.write().await;
        if let Some(mailbox) = mailboxes.get_mut(&mailbox_id) {
            mailbox.status = status;
        }
    }
}

impl Default for MailboxRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//
// ================= Sync report =================
//

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub fetched: usize,
    pub skipped: usize,
    pub extracted: usize,
    pub failed: usize,
    pub facts_created: usize,
    pub facts_merged: usize,
    /// Set when the run stopped early (cancellation, paused mailbox).
    pub halted: Option<String>,
}

enum MessageOutcome {
    Skipped,
    Extracted { created: usize, merged: usize },
    Failed,
    AlreadyDone,
}

//
// ================= Sync service =================
//

pub struct SyncService {
    registry: Arc<MailboxRegistry>,
    vault: Arc<dyn CredentialVault>,
    source: Arc<dyn MailSource>,
    cursor_store: Arc<dyn SyncCursorStore>,
    message_store: Arc<dyn MessageStore>,
    extraction: Arc<ExtractionEngine>,
    fact_store: Arc<FactStore>,
    scheduler: Arc<AlertScheduler>,
    page_size: usize,
    /// One lane per mailbox; entries are created on first sync.
    lanes: Arc<RwLock<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl SyncService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &PipelineConfig,
        registry: Arc<MailboxRegistry>,
        vault: Arc<dyn CredentialVault>,
        source: Arc<dyn MailSource>,
        cursor_store: Arc<dyn SyncCursorStore>,
        message_store: Arc<dyn MessageStore>,
        extraction: Arc<ExtractionEngine>,
        fact_store: Arc<FactStore>,
        scheduler: Arc<AlertScheduler>,
    ) -> Self {
        Self {
            registry,
            vault,
            source,
            cursor_store,
            message_store,
            extraction,
            fact_store,
            scheduler,
            page_size: config.sync_page_size,
            lanes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn lane(&self, mailbox_id: Uuid) -> Arc<Mutex<()>> {
        {
            let lanes = self.lanes.read().await;
            if let Some(lane) = lanes.get(&mailbox_id) {
                return lane.clone();
            }
        }
        let mut lanes = self.lanes.write().await;
        lanes.entry(mailbox_id).or_default().clone()
    }

    /// Run one incremental sync for a mailbox. Safe to call again at any
    /// time, including after a crash or mid-run cancellation.
    pub async fn sync_mailbox(&self, mailbox_id: Uuid) -> Result<SyncReport> {
        let (_tx, rx) = watch::channel(false);
        self.sync_mailbox_cancellable(mailbox_id, rx).await
    }

    /// As `sync_mailbox`, stopping cleanly between messages once the
    /// cancel channel reads true.
    pub async fn sync_mailbox_cancellable(
        &self,
        mailbox_id: Uuid,
        cancel: watch::Receiver<bool>,
    ) -> Result<SyncReport> {
        let lane = self.lane(mailbox_id).await;
        let _lane_guard = lane.lock().await;

        let mailbox = self
            .registry
            .get(mailbox_id)
            .await
            .ok_or_else(|| PipelineError::NotFound(format!("mailbox {}", mailbox_id)))?;

        match mailbox.status {
            MailboxStatus::Active => {}
            MailboxStatus::Paused | MailboxStatus::Revoked => {
                return Ok(SyncReport {
                    halted: Some(format!("mailbox is {:?}", mailbox.status).to_lowercase()),
                    ..SyncReport::default()
                });
            }
        }

        let mut credential = match self.vault.get_active_credential(mailbox_id).await {
            Ok(credential) => credential,
            Err(err @ PipelineError::Auth(_)) => {
                warn!(mailbox_id = %mailbox_id, "Credential revoked; halting mailbox");
                self.registry.set_status(mailbox_id, MailboxStatus::Revoked).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let resume = self.cursor_store.resume_point(mailbox_id).await?;
        let mut watermark = resume.cursor.watermark_ms;
        let mut report = SyncReport::default();

        info!(
            mailbox_id = %mailbox_id,
            watermark_ms = watermark,
            in_flight = resume.in_flight.len(),
            "Sync run starting"
        );

        // Uncommitted tail from a prior run goes first.
        for id in &resume.in_flight {
            if *cancel.borrow() {
                report.halted = Some("cancelled".to_string());
                return Ok(report);
            }
            self.run_one(&mailbox, &credential, id, &mut watermark, &mut report)
                .await?;
        }

        // Then walk the provider listing past the watermark.
        let mut page_token: Option<String> = None;
        loop {
            if *cancel.borrow() {
                report.halted = Some("cancelled".to_string());
                return Ok(report);
            }

            let page = self
                .list_with_refresh(
                    mailbox_id,
                    &mut credential,
                    SyncCursor { watermark_ms: watermark },
                    page_token.clone(),
                )
                .await?;

            let new_ids: Vec<String> = {
                let mut out = Vec::new();
                for summary in &page.messages {
                    if !self
                        .cursor_store
                        .is_committed(mailbox_id, &summary.provider_message_id)
                        .await?
                    {
                        out.push(summary.provider_message_id.clone());
                    }
                }
                out
            };
            self.cursor_store.begin_batch(mailbox_id, &new_ids).await?;

            for id in &new_ids {
                if *cancel.borrow() {
                    report.halted = Some("cancelled".to_string());
                    return Ok(report);
                }
                self.run_one(&mailbox, &credential, id, &mut watermark, &mut report)
                    .await?;
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        info!(
            mailbox_id = %mailbox_id,
            fetched = report.fetched,
            extracted = report.extracted,
            skipped = report.skipped,
            failed = report.failed,
            "Sync run complete"
        );

        Ok(report)
    }

    /// List one page, refreshing the credential from the vault once if
    /// the provider rejects the current token (an external refresher may
    /// have rotated it).
    async fn list_with_refresh(
        &self,
        mailbox_id: Uuid,
        credential: &mut Credential,
        cursor: SyncCursor,
        page_token: Option<String>,
    ) -> Result<crate::source::MessagePage> {
        match self
            .source
            .list_messages_since(credential, cursor, page_token.clone(), self.page_size)
            .await
        {
            Ok(page) => Ok(page),
            Err(SourceError::AuthExpired) => {
                debug!(mailbox_id = %mailbox_id, "Source rejected token; re-reading vault");
                match self.vault.get_active_credential(mailbox_id).await {
                    Ok(fresh) => {
                        *credential = fresh;
                        let page = self
                            .source
                            .list_messages_since(credential, cursor, page_token, self.page_size)
                            .await
                            .map_err(|e| {
                                if matches!(e, SourceError::AuthExpired) {
                                    warn!(
                                        mailbox_id = %mailbox_id,
                                        "Source still rejects the refreshed token; halting mailbox"
                                    );
                                }
                                PipelineError::from(e)
                            })?;
                        Ok(page)
                    }
                    Err(err @ PipelineError::Auth(_)) => {
                        self.registry.set_status(mailbox_id, MailboxStatus::Revoked).await;
                        Err(err)
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Process one message through to a terminal status, then commit it
    /// to the cursor store. Extraction trouble is per-message and never
    /// aborts the run; source trouble propagates with the cursor
    /// untouched past the committed prefix.
    async fn run_one(
        &self,
        mailbox: &Mailbox,
        credential: &Credential,
        provider_message_id: &str,
        watermark: &mut i64,
        report: &mut SyncReport,
    ) -> Result<()> {
        if self
            .cursor_store
            .is_committed(mailbox.mailbox_id, provider_message_id)
            .await?
        {
            return Ok(());
        }

        let message = self
            .obtain_message(mailbox, credential, provider_message_id)
            .await?;

        let outcome = if message.status.is_terminal() {
            // Processed by a prior run that crashed before committing.
            MessageOutcome::AlreadyDone
        } else {
            report.fetched += 1;
            self.process(&message).await
        };

        match outcome {
            MessageOutcome::Skipped => report.skipped += 1,
            MessageOutcome::Extracted { created, merged } => {
                report.extracted += 1;
                report.facts_created += created;
                report.facts_merged += merged;
            }
            MessageOutcome::Failed => report.failed += 1,
            MessageOutcome::AlreadyDone => {}
        }

        // Terminal either way: commit, moving the watermark forward.
        *watermark = (*watermark).max(message.internal_date_ms);
        self.cursor_store
            .advance(
                mailbox.mailbox_id,
                SyncCursor { watermark_ms: *watermark },
                &[provider_message_id.to_string()],
            )
            .await?;

        Ok(())
    }

    /// Reuse the stored copy when we already fetched this message; a
    /// terminal message is never fetched again.
    async fn obtain_message(
        &self,
        mailbox: &Mailbox,
        credential: &Credential,
        provider_message_id: &str,
    ) -> Result<RawMessage> {
        if let Some(stored) = self
            .message_store
            .get(mailbox.mailbox_id, provider_message_id)
            .await?
        {
            return Ok(stored);
        }

        let fetched = self
            .source
            .fetch_message(credential, provider_message_id)
            .await
            .map_err(PipelineError::from)?;

        let raw = into_raw_message(mailbox.mailbox_id, fetched);
        self.message_store.insert_fetched(raw.clone()).await
    }

    async fn process(&self, message: &RawMessage) -> MessageOutcome {
        let classification = FinanceClassifier::classify(message);
        if !classification.relevant {
            debug!(
                message_id = %message.provider_message_id,
                "Message not finance-relevant; skipping permanently"
            );
            let _ = self
                .message_store
                .set_status(
                    message.mailbox_id,
                    &message.provider_message_id,
                    MessageStatus::Skipped,
                )
                .await;
            return MessageOutcome::Skipped;
        }

        let _ = self
            .message_store
            .set_status(
                message.mailbox_id,
                &message.provider_message_id,
                MessageStatus::Classified,
            )
            .await;

        let records = self
            .extraction
            .extract(message, &classification.template_hints)
            .await;

        if records.is_empty() {
            warn!(
                message_id = %message.provider_message_id,
                "No extraction produced a record; marking failed for review"
            );
            let _ = self
                .message_store
                .set_status(
                    message.mailbox_id,
                    &message.provider_message_id,
                    MessageStatus::Failed,
                )
                .await;
            return MessageOutcome::Failed;
        }

        let mut created = 0;
        let mut merged = 0;
        let mut reconciled_any = false;
        for record in &records {
            match self.fact_store.reconcile(record).await {
                Ok(change) => {
                    reconciled_any = true;
                    if change.created {
                        created += 1;
                    } else {
                        merged += 1;
                    }
                    // The reconciliation lock is released; fact-changed
                    // notification flows to the scheduler in-lane.
                    if let Err(e) = self.scheduler.apply(&change, chrono::Utc::now()).await {
                        warn!(
                            fact_id = %change.fact.fact_id,
                            "Alert scheduling failed: {}", e
                        );
                    }
                }
                Err(PipelineError::InvalidInput(reason)) => {
                    debug!(
                        message_id = %message.provider_message_id,
                        "Unreconcilable candidate: {}", reason
                    );
                }
                Err(e) => {
                    warn!(
                        message_id = %message.provider_message_id,
                        "Reconciliation error: {}", e
                    );
                }
            }
        }

        let final_status = if reconciled_any {
            MessageStatus::Extracted
        } else {
            MessageStatus::Failed
        };
        let _ = self
            .message_store
            .set_status(
                message.mailbox_id,
                &message.provider_message_id,
                final_status,
            )
            .await;

        if reconciled_any {
            MessageOutcome::Extracted { created, merged }
        } else {
            MessageOutcome::Failed
        }
    }
}

fn into_raw_message(mailbox_id: Uuid, fetched: FetchedMessage) -> RawMessage {
    let fingerprint = message_fingerprint(
        &fetched.provider_message_id,
        &fetched.from_header,
        &fetched.subject,
        &fetched.body_text,
    );
    RawMessage {
        mailbox_id,
        provider_message_id: fetched.provider_message_id,
        fetched_at: fetched.fetched_at,
        internal_date_ms: fetched.internal_date_ms,
        from_header: fetched.from_header,
        subject: fetched.subject,
        snippet: fetched.snippet,
        body_text: fetched.body_text,
        list_unsubscribe: fetched.list_unsubscribe,
        fingerprint,
        status: MessageStatus::Fetched,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertScheduler;
    use crate::delivery::RecordingDelivery;
    use crate::source::mock::{sample_message, MockMailSource};
    use crate::source::SourceError;
    use crate::store::InMemoryMessageStore;
    use crate::vault::{Credential, InMemoryVault, PlaintextCipher};
    use chrono::NaiveDate;

    struct Harness {
        service: SyncService,
        registry: Arc<MailboxRegistry>,
        vault: Arc<InMemoryVault>,
        source: Arc<MockMailSource>,
        cursor_store: Arc<crate::cursor::InMemoryCursorStore>,
        message_store: Arc<InMemoryMessageStore>,
        fact_store: Arc<FactStore>,
        scheduler: Arc<AlertScheduler>,
        mailbox_id: Uuid,
    }

    async fn harness() -> Harness {
        let config = PipelineConfig::default();
        let registry = Arc::new(MailboxRegistry::new());
        let vault = Arc::new(InMemoryVault::new(Arc::new(PlaintextCipher)));
        let source = Arc::new(MockMailSource::new());
        let cursor_store = Arc::new(crate::cursor::InMemoryCursorStore::new());
        let message_store = Arc::new(InMemoryMessageStore::new());
        let fact_store = Arc::new(FactStore::in_memory(&config));
        let delivery = Arc::new(RecordingDelivery::new());
        let scheduler = Arc::new(AlertScheduler::new(&config, delivery));
        let extraction = Arc::new(ExtractionEngine::new(&config, None));

        let mailbox_id = Uuid::new_v4();
        registry
            .register(Mailbox {
                mailbox_id,
                owner_id: Uuid::new_v4(),
                provider: crate::models::MailProvider::Mock,
                address: "user@example.com".to_string(),
                status: MailboxStatus::Active,
                created_at: chrono::Utc::now(),
            })
            .await;
        vault
            .store(
                mailbox_id,
                Credential {
                    access_token: "tok".to_string(),
                    refresh_token: None,
                    expires_at: None,
                },
            )
            .await;

        let service = SyncService::new(
            &config,
            registry.clone(),
            vault.clone(),
            source.clone(),
            cursor_store.clone(),
            message_store.clone(),
            extraction,
            fact_store.clone(),
            scheduler.clone(),
        );

        Harness {
            service,
            registry,
            vault,
            source,
            cursor_store,
            message_store,
            fact_store,
            scheduler,
            mailbox_id,
        }
    }

    /// A date whose day number is divisible by the default 7-day dedup
    /// window, so it shares a bucket with the two days after it.
    fn bucket_aligned_date() -> NaiveDate {
        NaiveDate::from_num_days_from_ce_opt(739_620).unwrap()
    }

    fn ms_at(date: NaiveDate, secs: u32) -> i64 {
        date.and_hms_opt(0, 0, secs)
            .unwrap()
            .and_utc()
            .timestamp_millis()
    }

    async fn seed_netflix_pair(harness: &Harness) {
        let d1 = bucket_aligned_date();
        let d2 = d1 + chrono::Duration::days(3);
        harness
            .source
            .seed(vec![
                sample_message(
                    "m1",
                    ms_at(d1, 0),
                    "Netflix <info@mailer.netflix.com>",
                    "Your Netflix receipt",
                    "Your subscription renewed. We charged $15.49.",
                ),
                sample_message(
                    "m2",
                    ms_at(d2, 0),
                    "Netflix <info@mailer.netflix.com>",
                    "Your Netflix receipt",
                    "Your subscription renewed. We charged $15.49.",
                ),
            ])
            .await;
    }

    #[tokio::test]
    async fn test_two_nearby_receipts_become_one_fact() {
        let harness = harness().await;
        seed_netflix_pair(&harness).await;

        let report = harness.service.sync_mailbox(harness.mailbox_id).await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.extracted, 2);
        assert_eq!(report.facts_created, 1);
        assert_eq!(report.facts_merged, 1);

        let facts = harness.fact_store.all().await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].contributors.len(), 2);
        assert_eq!(facts[0].revision, 2);
    }

    #[tokio::test]
    async fn test_second_sync_over_unchanged_window_is_a_no_op() {
        let harness = harness().await;
        seed_netflix_pair(&harness).await;

        harness.service.sync_mailbox(harness.mailbox_id).await.unwrap();
        let facts_before = harness.fact_store.all().await.unwrap();

        let report = harness.service.sync_mailbox(harness.mailbox_id).await.unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(report.extracted, 0);

        let facts_after = harness.fact_store.all().await.unwrap();
        assert_eq!(facts_after.len(), facts_before.len());
        assert_eq!(facts_after[0].revision, facts_before[0].revision);

        // No duplicate raw messages either.
        let counts = harness
            .message_store
            .status_counts(harness.mailbox_id)
            .await
            .unwrap();
        assert_eq!(counts.values().sum::<usize>(), 2);
    }

    #[tokio::test]
    async fn test_interrupted_run_resumes_without_reprocessing() {
        let harness = harness().await;
        seed_netflix_pair(&harness).await;
        harness
            .source
            .fail_fetch_of("m2", SourceError::Transient("socket dropped".to_string()))
            .await;

        let err = harness.service.sync_mailbox(harness.mailbox_id).await.unwrap_err();
        assert!(matches!(err, PipelineError::TransientSource(_)));

        // m1 committed, m2 left in flight.
        assert!(harness
            .cursor_store
            .is_committed(harness.mailbox_id, "m1")
            .await
            .unwrap());
        let point = harness.cursor_store.resume_point(harness.mailbox_id).await.unwrap();
        assert_eq!(point.in_flight, vec!["m2".to_string()]);

        let report = harness.service.sync_mailbox(harness.mailbox_id).await.unwrap();
        assert_eq!(report.fetched, 1);

        // Exactly one contribution per message: m1 was not reprocessed.
        let facts = harness.fact_store.all().await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].revision, 2);
        assert_eq!(facts[0].contributors.len(), 2);
    }

    #[tokio::test]
    async fn test_rule_only_mode_fails_soft_on_unparseable_mail() {
        let harness = harness().await;
        let date = bucket_aligned_date();
        harness
            .source
            .seed(vec![
                sample_message(
                    "m1",
                    ms_at(date, 0),
                    "Netflix <info@mailer.netflix.com>",
                    "Your Netflix receipt",
                    "Your subscription renewed. We charged $15.49.",
                ),
                // Finance-relevant wording but nothing the rules can use,
                // and no LLM configured.
                sample_message(
                    "m2",
                    ms_at(date, 30),
                    "billing@acme.example",
                    "Receipt for your purchase",
                    "thank you for your order",
                ),
            ])
            .await;

        let report = harness.service.sync_mailbox(harness.mailbox_id).await.unwrap();
        assert_eq!(report.extracted, 1);
        assert_eq!(report.failed, 1);

        // The rule-matched message still produced a fact.
        assert_eq!(harness.fact_store.all().await.unwrap().len(), 1);

        // The other surfaces for manual review rather than crashing the run.
        let review = harness.message_store.needs_review(harness.mailbox_id).await.unwrap();
        assert_eq!(review.len(), 1);
        assert_eq!(review[0].provider_message_id, "m2");
    }

    #[tokio::test]
    async fn test_irrelevant_mail_is_skipped_permanently() {
        let harness = harness().await;
        harness
            .source
            .seed(vec![sample_message(
                "m1",
                ms_at(bucket_aligned_date(), 0),
                "LinkedIn <updates@linkedin.com>",
                "You appeared in 5 searches",
                "See who viewed your profile",
            )])
            .await;

        let report = harness.service.sync_mailbox(harness.mailbox_id).await.unwrap();
        assert_eq!(report.skipped, 1);

        // A later run neither refetches nor reclassifies it.
        let report = harness.service.sync_mailbox(harness.mailbox_id).await.unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(report.skipped, 0);
    }

    #[tokio::test]
    async fn test_revoked_credential_halts_only_this_mailbox() {
        let harness = harness().await;
        seed_netflix_pair(&harness).await;
        harness.vault.revoke(harness.mailbox_id).await.unwrap();

        let err = harness.service.sync_mailbox(harness.mailbox_id).await.unwrap_err();
        assert!(matches!(err, PipelineError::Auth(_)));

        let mailbox = harness.registry.get(harness.mailbox_id).await.unwrap();
        assert_eq!(mailbox.status, MailboxStatus::Revoked);

        // Subsequent runs are a clean halt, not an error storm.
        let report = harness.service.sync_mailbox(harness.mailbox_id).await.unwrap();
        assert!(report.halted.is_some());
    }

    #[tokio::test]
    async fn test_expired_token_retries_after_vault_reread() {
        let harness = harness().await;
        seed_netflix_pair(&harness).await;
        harness.source.fail_once(SourceError::AuthExpired).await;

        let report = harness.service.sync_mailbox(harness.mailbox_id).await.unwrap();
        assert_eq!(report.extracted, 2);
    }

    #[tokio::test]
    async fn test_rate_limit_leaves_cursor_unchanged() {
        let harness = harness().await;
        seed_netflix_pair(&harness).await;
        harness
            .source
            .fail_once(SourceError::RateLimited { retry_after: None })
            .await;

        let err = harness.service.sync_mailbox(harness.mailbox_id).await.unwrap_err();
        assert!(matches!(err, PipelineError::TransientSource(_)));

        let point = harness.cursor_store.resume_point(harness.mailbox_id).await.unwrap();
        assert_eq!(point.cursor.watermark_ms, 0);

        // Backoff over; next run drains the window.
        let report = harness.service.sync_mailbox(harness.mailbox_id).await.unwrap();
        assert_eq!(report.extracted, 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_resumable_state() {
        let harness = harness().await;
        seed_netflix_pair(&harness).await;

        let (tx, rx) = watch::channel(true);
        let report = harness
            .service
            .sync_mailbox_cancellable(harness.mailbox_id, rx)
            .await
            .unwrap();
        assert_eq!(report.halted.as_deref(), Some("cancelled"));
        assert_eq!(report.fetched, 0);
        drop(tx);

        let report = harness.service.sync_mailbox(harness.mailbox_id).await.unwrap();
        assert_eq!(report.extracted, 2);
        assert_eq!(harness.fact_store.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subscription_sync_schedules_renewal_alert() {
        let harness = harness().await;
        let date = chrono::Utc::now().date_naive();
        let renewal = date + chrono::Duration::days(30);
        harness
            .source
            .seed(vec![sample_message(
                "m1",
                ms_at(date, 0),
                "Netflix <info@mailer.netflix.com>",
                "Your Netflix receipt",
                &format!(
                    "Your subscription renewed. We charged $15.49. Renews on {}.",
                    renewal
                ),
            )])
            .await;

        harness.service.sync_mailbox(harness.mailbox_id).await.unwrap();

        let facts = harness.fact_store.all().await.unwrap();
        assert_eq!(facts.len(), 1);
        let alerts = harness.scheduler.alerts_for_fact(facts[0].fact_id).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].status, crate::models::AlertStatus::Scheduled);
        assert_eq!(
            alerts[0].trigger_at.date_naive(),
            renewal - chrono::Duration::days(1)
        );
    }
}

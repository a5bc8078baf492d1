use chrono::{Duration, Utc};
use finance_autopilot::{
    alerts::AlertScheduler,
    config::PipelineConfig,
    cursor::InMemoryCursorStore,
    delivery::RecordingDelivery,
    draft::{ActionRequest, DraftComposer, VendorDirectory},
    extraction::{provider_from_config, ExtractionEngine},
    models::{ActionKind, DraftTone, MailProvider, Mailbox, MailboxStatus},
    pipeline::{MailboxRegistry, SyncService},
    reconcile::FactStore,
    source::mock::{sample_message, MockMailSource},
    store::{InMemoryMessageStore, MessageStore},
    vault::{Credential, InMemoryVault, PlaintextCipher},
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Finance Autopilot pipeline starting");

    let config = PipelineConfig::from_env();
    let llm = provider_from_config(&config);
    info!(
        llm_configured = llm.is_some(),
        "Extraction mode: {}",
        if llm.is_some() { "rules + LLM fallback" } else { "rules only" }
    );

    // Wire the components
    let registry = Arc::new(MailboxRegistry::new());
    let vault = Arc::new(InMemoryVault::new(Arc::new(PlaintextCipher)));
    let source = Arc::new(MockMailSource::new());
    let cursor_store = Arc::new(InMemoryCursorStore::new());
    let message_store = Arc::new(InMemoryMessageStore::new());
    let fact_store = Arc::new(FactStore::new(&config));
    let delivery = Arc::new(RecordingDelivery::new());
    let scheduler = Arc::new(AlertScheduler::new(&config, delivery.clone()));
    let extraction = Arc::new(ExtractionEngine::new(&config, llm.clone()));

    // Link a demo mailbox
    let mailbox_id = Uuid::new_v4();
    registry
        .register(Mailbox {
            mailbox_id,
            owner_id: Uuid::new_v4(),
            provider: MailProvider::Mock,
            address: "demo@example.com".to_string(),
            status: MailboxStatus::Active,
            created_at: Utc::now(),
        })
        .await;
    vault
        .store(
            mailbox_id,
            Credential {
                access_token: "demo-token".to_string(),
                refresh_token: Some("demo-refresh".to_string()),
                expires_at: None,
            },
        )
        .await;

    // Seed a plausible inbox window
    let today = Utc::now().date_naive();
    let ms = |days_ago: i64| {
        (today - Duration::days(days_ago))
            .and_hms_opt(9, 30, 0)
            .expect("valid time")
            .and_utc()
            .timestamp_millis()
    };
    source
        .seed(vec![
            sample_message(
                "msg-001",
                ms(35),
                "Netflix <info@mailer.netflix.com>",
                "Your Netflix receipt",
                "Your subscription renewed. We charged $15.49.",
            ),
            sample_message(
                "msg-002",
                ms(5),
                "Netflix <info@mailer.netflix.com>",
                "Your Netflix receipt",
                &format!(
                    "Your subscription renewed. We charged $15.49. Renews on {}.",
                    today + Duration::days(25)
                ),
            ),
            sample_message(
                "msg-003",
                ms(3),
                "Apple <no_reply@email.apple.com>",
                "Your receipt from Apple",
                "App Store\nOrder ID: MKV7XJ2L9\nDisney+ (Monthly) - $13.99\nTotal: $13.99",
            ),
            sample_message(
                "msg-004",
                ms(2),
                "Uber Receipts <noreply@uber.com>",
                "Your Saturday trip",
                "Thanks for riding. Total $23.80.",
            ),
            sample_message(
                "msg-005",
                ms(1),
                "LinkedIn <updates@linkedin.com>",
                "You appeared in 5 searches",
                "See who viewed your profile this week",
            ),
        ])
        .await;

    let service = SyncService::new(
        &config,
        registry,
        vault,
        source,
        cursor_store,
        message_store.clone(),
        extraction,
        fact_store.clone(),
        scheduler.clone(),
    );

    // One incremental sync pass
    let report = service.sync_mailbox(mailbox_id).await?;
    println!("\n=== SYNC REPORT ===");
    println!(
        "fetched: {}  extracted: {}  skipped: {}  failed: {}",
        report.fetched, report.extracted, report.skipped, report.failed
    );
    println!(
        "facts created: {}  facts merged: {}",
        report.facts_created, report.facts_merged
    );

    println!("\n=== FINANCIAL FACTS ===");
    let facts = fact_store.all().await?;
    for fact in &facts {
        println!(
            "- {} [{}] {} {}  rev {}  contributors {}",
            fact.merchant,
            fact.kind,
            fact.currency.as_deref().unwrap_or("?"),
            fact.amount.map(|a| format!("{:.2}", a)).unwrap_or_else(|| "?".into()),
            fact.revision,
            fact.contributors.len()
        );
    }

    println!("\n=== ALERTS ===");
    for alert in scheduler.all().await {
        println!(
            "- [{}] {} (trigger {})",
            alert.status,
            alert.title,
            alert.trigger_at.format("%Y-%m-%d")
        );
    }

    // Fire anything already due and show the delivery stub's view
    let fired = scheduler.fire_due(Utc::now()).await?;
    if !fired.is_empty() {
        println!("\nfired {} alert(s) to the delivery stub", fired.len());
    }

    // Draft a cancellation against the first subscription fact
    if let Some(subscription) = facts
        .iter()
        .find(|f| f.kind == finance_autopilot::models::RecordKind::Subscription)
    {
        let mut directory = VendorDirectory::new();
        directory.insert("Netflix", "support@netflix.com");
        let composer = DraftComposer::new(fact_store.clone(), directory, llm, delivery.clone());

        let draft = composer
            .compose(ActionRequest {
                fact_id: subscription.fact_id,
                action: ActionKind::Cancel,
                reason: "No longer using the service".to_string(),
                tone: DraftTone::Friendly,
            })
            .await?;

        println!("\n=== DRAFT ({:?}) ===", draft.status);
        println!("To: {}", draft.to_email.as_deref().unwrap_or("<unresolved>"));
        println!("Subject: {}", draft.subject);
        println!("{}", draft.body);
    }

    let review = message_store.needs_review(mailbox_id).await?;
    if !review.is_empty() {
        println!("\n{} message(s) need manual review", review.len());
    }

    Ok(())
}

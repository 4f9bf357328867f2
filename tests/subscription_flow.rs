use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use neurochat_bot::config::Settings;
use neurochat_bot::domain::PaymentStatus;
use neurochat_bot::payments::{MockPaymentProvider, PaymentMonitor, PaymentProvider};
use neurochat_bot::services::{
    create_purchase, ensure_user, open_turn, record_answer, Notifier, Quota,
};
use neurochat_bot::storage::{InMemoryStorage, NewUser, StorageProvider, UsageKind};
use serde_json::json;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingNotifier {
    activated: Mutex<Vec<(i64, String)>>,
    failed: Mutex<Vec<(i64, String)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn subscription_activated(&self, user_id: i64, plan_title: &str, _expires_at: DateTime<Utc>) {
        if let Ok(mut sent) = self.activated.lock() {
            sent.push((user_id, plan_title.to_string()));
        }
    }

    async fn payment_failed(&self, user_id: i64, reason: &str) {
        if let Ok(mut sent) = self.failed.lock() {
            sent.push((user_id, reason.to_string()));
        }
    }
}

fn settings() -> Settings {
    serde_json::from_value(json!({
        "bot_token": "dummy",
        "storage_backend": "memory",
        "payment_provider": "mock",
        "trial_days": 3,
        "trial_max_requests": 2,
        "trial_max_images": 1,
        "referral_bonus_days": 5,
    }))
    .expect("valid settings")
}

fn profile(id: i64) -> NewUser {
    NewUser {
        id,
        username: Some(format!("user{id}")),
        ..NewUser::default()
    }
}

#[tokio::test]
async fn test_trial_quota_is_enforced() -> Result<()> {
    let store = InMemoryStorage::new();
    let settings = settings();
    let now = Utc::now();

    ensure_user(&store, &settings, profile(10), None, now).await?;

    let quota = Quota::load(&store, &settings, 10, now).await?;
    assert!(quota.active);
    assert!(quota.allows_request());
    assert!(quota.allows_image());

    for question in ["Привет", "Как дела?"] {
        let reservation = quota.reserve(&store, 10, UsageKind::Request).await?;
        assert!(reservation.is_some());
        let turn = open_turn(&store, &settings, 10, question).await?;
        record_answer(&store, turn.session_id, "Ответ").await?;
    }
    // The snapshot is stale, the stored counter still refuses
    assert!(quota.reserve(&store, 10, UsageKind::Request).await?.is_none());

    let picture = quota.reserve(&store, 10, UsageKind::Image).await?;
    assert!(picture.is_some());
    assert!(quota.reserve(&store, 10, UsageKind::Image).await?.is_none());

    let quota = Quota::load(&store, &settings, 10, now).await?;
    assert!(!quota.allows_request());
    assert!(!quota.allows_image());

    // A picture that never arrived is not charged
    if let Some(picture) = picture {
        picture.release(&store).await;
    }
    let quota = Quota::load(&store, &settings, 10, now).await?;
    assert!(quota.allows_image());

    let after_trial = now + TimeDelta::days(4);
    let quota = Quota::load(&store, &settings, 10, after_trial).await?;
    assert!(!quota.active);
    Ok(())
}

#[tokio::test]
async fn test_paid_plan_flow_with_referral_bonus() -> Result<()> {
    let store = Arc::new(InMemoryStorage::new());
    let settings = Arc::new(settings());
    let now = Utc::now();

    let referrer = ensure_user(store.as_ref(), &settings, profile(1), None, now).await?;
    let invited = ensure_user(
        store.as_ref(),
        &settings,
        profile(2),
        Some(&referrer.referral_code),
        now,
    )
    .await?;
    assert_eq!(invited.referred_by, Some(1));
    let referrer_expiry = store
        .get_subscription(1)
        .await?
        .and_then(|s| s.expires_at)
        .expect("trial expiry");

    // Use up the trial before paying
    let quota = Quota::load(store.as_ref(), &settings, 2, now).await?;
    assert!(quota.reserve(store.as_ref(), 2, UsageKind::Image).await?.is_some());

    let provider = Arc::new(MockPaymentProvider::new());
    let purchase = create_purchase(store.as_ref(), provider.as_ref(), 2, "pro_plus", now).await?;
    assert_eq!(purchase.payment.status, PaymentStatus::Pending);
    assert!(purchase.invoice.confirmation_url.starts_with("https://"));

    let notifier = Arc::new(RecordingNotifier::default());
    let monitor = PaymentMonitor::new(
        store.clone(),
        provider as Arc<dyn PaymentProvider>,
        notifier.clone(),
        settings.clone(),
    );

    let report = monitor.check_pending().await?;
    assert_eq!(report.checked, 1);
    assert_eq!(report.activated, 1);

    let sub = store.get_subscription(2).await?.expect("subscription");
    assert_eq!(sub.plan_code.as_deref(), Some("pro_plus"));
    assert!(!sub.is_trial);
    let usage = store.get_usage(2).await?.expect("usage");
    assert_eq!(usage.used_images, 0);

    let bonus_expiry = store
        .get_subscription(1)
        .await?
        .and_then(|s| s.expires_at)
        .expect("referrer expiry");
    assert_eq!(bonus_expiry - referrer_expiry, TimeDelta::days(5));

    let activated = notifier.activated.lock().expect("lock").clone();
    assert_eq!(activated.len(), 1);
    assert_eq!(activated[0].0, 2);

    // Settled payments are not processed again
    let report = monitor.check_pending().await?;
    assert_eq!(report.checked, 0);
    assert_eq!(notifier.activated.lock().expect("lock").len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_self_referral_is_ignored() -> Result<()> {
    let store = InMemoryStorage::new();
    let settings = settings();
    let code = profile(7).referral_code();

    let user = ensure_user(&store, &settings, profile(7), Some(&code), Utc::now()).await?;
    assert_eq!(user.referred_by, None);
    Ok(())
}

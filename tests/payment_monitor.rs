use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use neurochat_bot::config::Settings;
use neurochat_bot::domain::{Mode, PaymentStatus};
use neurochat_bot::payments::{Invoice, PaymentError, PaymentMonitor, PaymentProvider};
use neurochat_bot::services::{create_purchase, ensure_user, Notifier};
use neurochat_bot::storage::{
    ChatSession, InMemoryStorage, NewPayment, NewUser, Payment, Stats, StorageError,
    StorageProvider, StoredMessage, Subscription, Usage, UsageKind, User,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Gateway with scripted statuses per payment ID
struct ScriptedGateway {
    statuses: Mutex<HashMap<String, PaymentStatus>>,
    next_id: Mutex<u32>,
}

impl ScriptedGateway {
    fn new() -> Self {
        Self {
            statuses: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
        }
    }

    fn set(&self, payment_id: &str, status: PaymentStatus) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.insert(payment_id.to_string(), status);
        }
    }
}

#[async_trait]
impl PaymentProvider for ScriptedGateway {
    async fn create_invoice(
        &self,
        _user_id: i64,
        _plan_code: &str,
        _amount_rub: u32,
        _description: &str,
    ) -> Result<Invoice, PaymentError> {
        let mut next = self
            .next_id
            .lock()
            .map_err(|e| PaymentError::Api(e.to_string()))?;
        *next += 1;
        Ok(Invoice {
            confirmation_url: format!("https://pay.example/{next}"),
            payment_id: format!("scripted-{next}"),
        })
    }

    async fn check_status(&self, payment_id: &str) -> Result<PaymentStatus, PaymentError> {
        let statuses = self
            .statuses
            .lock()
            .map_err(|e| PaymentError::Api(e.to_string()))?;
        statuses
            .get(payment_id)
            .copied()
            .ok_or_else(|| PaymentError::Network("gateway timeout".to_string()))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// In-memory store whose first `failures` settlements hit a database error
struct FlakyStore {
    inner: InMemoryStorage,
    failures: AtomicUsize,
}

impl FlakyStore {
    fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryStorage::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl StorageProvider for FlakyStore {
    async fn get_user(&self, user_id: i64) -> Result<Option<User>, StorageError> {
        self.inner.get_user(user_id).await
    }
    async fn find_user_by_referral_code(&self, code: &str) -> Result<Option<User>, StorageError> {
        self.inner.find_user_by_referral_code(code).await
    }
    async fn create_user_with_trial(
        &self,
        user: NewUser,
        trial_expires_at: DateTime<Utc>,
    ) -> Result<User, StorageError> {
        self.inner.create_user_with_trial(user, trial_expires_at).await
    }
    async fn set_user_blocked(&self, user_id: i64, blocked: bool) -> Result<bool, StorageError> {
        self.inner.set_user_blocked(user_id, blocked).await
    }
    async fn count_users(&self) -> Result<u64, StorageError> {
        self.inner.count_users().await
    }
    async fn list_user_ids(&self) -> Result<Vec<i64>, StorageError> {
        self.inner.list_user_ids().await
    }
    async fn get_subscription(&self, user_id: i64) -> Result<Option<Subscription>, StorageError> {
        self.inner.get_subscription(user_id).await
    }
    async fn get_usage(&self, user_id: i64) -> Result<Option<Usage>, StorageError> {
        self.inner.get_usage(user_id).await
    }
    async fn put_subscription(
        &self,
        subscription: Subscription,
        reset_usage: bool,
    ) -> Result<(), StorageError> {
        self.inner.put_subscription(subscription, reset_usage).await
    }
    async fn reserve_usage(
        &self,
        user_id: i64,
        kind: UsageKind,
        limit: Option<u32>,
    ) -> Result<bool, StorageError> {
        self.inner.reserve_usage(user_id, kind, limit).await
    }
    async fn release_usage(&self, user_id: i64, kind: UsageKind) -> Result<(), StorageError> {
        self.inner.release_usage(user_id, kind).await
    }
    async fn create_chat_session(
        &self,
        user_id: i64,
        title: &str,
        mode: Mode,
    ) -> Result<ChatSession, StorageError> {
        self.inner.create_chat_session(user_id, title, mode).await
    }
    async fn active_chat_session(&self, user_id: i64) -> Result<Option<ChatSession>, StorageError> {
        self.inner.active_chat_session(user_id).await
    }
    async fn list_chat_sessions(
        &self,
        user_id: i64,
        limit: u32,
    ) -> Result<Vec<ChatSession>, StorageError> {
        self.inner.list_chat_sessions(user_id, limit).await
    }
    async fn activate_chat_session(
        &self,
        user_id: i64,
        session_id: i64,
    ) -> Result<bool, StorageError> {
        self.inner.activate_chat_session(user_id, session_id).await
    }
    async fn store_message(
        &self,
        session_id: i64,
        role: &str,
        content: &str,
    ) -> Result<(), StorageError> {
        self.inner.store_message(session_id, role, content).await
    }
    async fn get_history(
        &self,
        session_id: i64,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        self.inner.get_history(session_id, limit).await
    }
    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment, StorageError> {
        self.inner.insert_payment(payment).await
    }
    async fn pending_payments(&self) -> Result<Vec<Payment>, StorageError> {
        self.inner.pending_payments().await
    }
    async fn transition_payment(
        &self,
        payment_id: i64,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> Result<bool, StorageError> {
        self.inner.transition_payment(payment_id, from, to).await
    }
    async fn settle_payment(
        &self,
        payment_id: i64,
        subscription: Subscription,
    ) -> Result<bool, StorageError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.settle_payment(payment_id, subscription).await
    }
    async fn stats(&self, now: DateTime<Utc>) -> Result<Stats, StorageError> {
        self.inner.stats(now).await
    }
    async fn check_connection(&self) -> Result<(), StorageError> {
        self.inner.check_connection().await
    }
}

#[derive(Default)]
struct RecordingNotifier {
    activated: Mutex<Vec<i64>>,
    failed: Mutex<Vec<(i64, String)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn subscription_activated(&self, user_id: i64, _plan_title: &str, _expires_at: DateTime<Utc>) {
        if let Ok(mut sent) = self.activated.lock() {
            sent.push(user_id);
        }
    }

    async fn payment_failed(&self, user_id: i64, reason: &str) {
        if let Ok(mut sent) = self.failed.lock() {
            sent.push((user_id, reason.to_string()));
        }
    }
}

fn settings() -> Arc<Settings> {
    Arc::new(
        serde_json::from_value(json!({
            "bot_token": "dummy",
            "storage_backend": "memory",
            "payment_provider": "mock",
            "payment_check_interval_min": 0.001,
        }))
        .expect("valid settings"),
    )
}

struct Harness {
    store: Arc<InMemoryStorage>,
    gateway: Arc<ScriptedGateway>,
    notifier: Arc<RecordingNotifier>,
    monitor: Arc<PaymentMonitor>,
}

async fn harness(users: &[i64]) -> Result<Harness> {
    let store = Arc::new(InMemoryStorage::new());
    let settings = settings();
    for &id in users {
        ensure_user(
            store.as_ref(),
            &settings,
            NewUser {
                id,
                ..NewUser::default()
            },
            None,
            Utc::now(),
        )
        .await?;
    }
    let gateway = Arc::new(ScriptedGateway::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let monitor = Arc::new(PaymentMonitor::new(
        store.clone(),
        gateway.clone(),
        notifier.clone(),
        settings,
    ));
    Ok(Harness {
        store,
        gateway,
        notifier,
        monitor,
    })
}

#[tokio::test]
async fn test_mixed_statuses_in_one_pass() -> Result<()> {
    let h = harness(&[1, 2, 3, 4]).await?;
    let now = Utc::now();

    let paid = create_purchase(h.store.as_ref(), h.gateway.as_ref(), 1, "pro_lite", now).await?;
    let canceled = create_purchase(h.store.as_ref(), h.gateway.as_ref(), 2, "pro_lite", now).await?;
    let waiting = create_purchase(h.store.as_ref(), h.gateway.as_ref(), 3, "pro_plus", now).await?;
    let unreachable =
        create_purchase(h.store.as_ref(), h.gateway.as_ref(), 4, "pro_plus", now).await?;

    h.gateway.set(&paid.invoice.payment_id, PaymentStatus::Succeeded);
    h.gateway.set(&canceled.invoice.payment_id, PaymentStatus::Canceled);
    h.gateway.set(&waiting.invoice.payment_id, PaymentStatus::WaitingForCapture);
    assert!(!unreachable.invoice.payment_id.is_empty());

    let report = h.monitor.check_pending().await?;
    assert_eq!(report.checked, 4);
    assert_eq!(report.activated, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors, 1);

    assert_eq!(*h.notifier.activated.lock().expect("lock"), vec![1]);
    let failed = h.notifier.failed.lock().expect("lock").clone();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, 2);

    let pending: Vec<i64> = h
        .store
        .pending_payments()
        .await?
        .into_iter()
        .map(|p| p.user_id)
        .collect();
    assert_eq!(pending.len(), 2);
    assert!(pending.contains(&3));
    assert!(pending.contains(&4));
    Ok(())
}

#[tokio::test]
async fn test_foreign_provider_payments_are_skipped() -> Result<()> {
    let h = harness(&[5]).await?;
    h.store
        .insert_payment(NewPayment {
            user_id: 5,
            provider: "yookassa".to_string(),
            provider_payment_id: "2d8f-old".to_string(),
            plan_code: "pro_lite".to_string(),
            amount_rub: 499,
        })
        .await?;

    let report = h.monitor.check_pending().await?;
    assert_eq!(report.checked, 0);
    assert_eq!(h.store.pending_payments().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_background_loop_activates_and_stops() -> Result<()> {
    let h = harness(&[6]).await?;
    let purchase =
        create_purchase(h.store.as_ref(), h.gateway.as_ref(), 6, "pro_premium", Utc::now()).await?;
    h.gateway
        .set(&purchase.invoice.payment_id, PaymentStatus::Succeeded);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(h.monitor.clone().run(cancel.clone()));

    let mut activated = false;
    for _ in 0..50 {
        let sub = h.store.get_subscription(6).await?;
        if sub.and_then(|s| s.plan_code).as_deref() == Some("pro_premium") {
            activated = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(activated);

    cancel.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(5), task).await??;
    Ok(())
}

#[tokio::test]
async fn test_failed_settlement_is_retried_next_pass() -> Result<()> {
    let store = Arc::new(FlakyStore::new(1));
    let settings = settings();
    let profile = NewUser {
        id: 8,
        ..NewUser::default()
    };
    ensure_user(store.as_ref(), &settings, profile, None, Utc::now()).await?;
    let gateway = Arc::new(ScriptedGateway::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let monitor = PaymentMonitor::new(store.clone(), gateway.clone(), notifier.clone(), settings);

    let purchase =
        create_purchase(store.as_ref(), gateway.as_ref(), 8, "pro_plus", Utc::now()).await?;
    gateway.set(&purchase.invoice.payment_id, PaymentStatus::Succeeded);

    let first = monitor.check_pending().await?;
    assert_eq!((first.activated, first.errors), (0, 1));
    assert_eq!(store.pending_payments().await?.len(), 1);
    let sub = store.get_subscription(8).await?.expect("trial subscription");
    assert!(sub.is_trial);
    assert!(activated_users(&notifier).is_empty());

    let second = monitor.check_pending().await?;
    assert_eq!((second.checked, second.activated, second.errors), (1, 1, 0));
    let sub = store.get_subscription(8).await?.expect("paid subscription");
    assert_eq!(sub.plan_code.as_deref(), Some("pro_plus"));
    assert!(!sub.is_trial);
    assert!(store.pending_payments().await?.is_empty());
    assert_eq!(activated_users(&notifier), vec![8]);
    Ok(())
}

fn activated_users(notifier: &RecordingNotifier) -> Vec<i64> {
    notifier.activated.lock().expect("lock").clone()
}

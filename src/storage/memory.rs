use super::{
    referral_code_for, ChatSession, NewPayment, NewUser, Payment, Stats, StorageError,
    StorageProvider, StoredMessage, Subscription, Usage, UsageKind, User,
};
use crate::domain::{Mode, PaymentStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    users: HashMap<i64, User>,
    subscriptions: HashMap<i64, Subscription>,
    usage: HashMap<i64, Usage>,
    sessions: Vec<ChatSession>,
    messages: Vec<StoredMessage>,
    payments: Vec<Payment>,
    next_session_id: i64,
    next_message_id: i64,
    next_payment_id: i64,
}

fn counter_mut(usage: &mut Usage, kind: UsageKind) -> &mut u32 {
    match kind {
        UsageKind::Request => &mut usage.used_requests,
        UsageKind::Image => &mut usage.used_images,
    }
}

impl Tables {
    fn write_subscription(&mut self, subscription: Subscription, reset_usage: bool) {
        let user_id = subscription.user_id;
        self.subscriptions.insert(user_id, subscription);
        if reset_usage {
            self.usage.insert(
                user_id,
                Usage {
                    user_id,
                    ..Usage::default()
                },
            );
        }
    }
}

/// Process-local storage with the same semantics as [`super::MySqlStorage`].
///
/// All tables live behind one lock, so each trait call is atomic.
#[derive(Default)]
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
}

impl InMemoryStorage {
    /// Creates an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorage {
    async fn get_user(&self, user_id: i64) -> Result<Option<User>, StorageError> {
        Ok(self.tables.read().await.users.get(&user_id).cloned())
    }

    async fn find_user_by_referral_code(
        &self,
        code: &str,
    ) -> Result<Option<User>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.referral_code == code)
            .cloned())
    }

    async fn create_user_with_trial(
        &self,
        user: NewUser,
        trial_expires_at: DateTime<Utc>,
    ) -> Result<User, StorageError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.users.get(&user.id) {
            return Ok(existing.clone());
        }

        let created = User {
            id: user.id,
            username: user.username,
            first_name: user.first_name,
            last_name: user.last_name,
            created_at: Utc::now(),
            is_blocked: false,
            referral_code: referral_code_for(user.id),
            referred_by: user.referred_by,
        };
        tables.users.insert(created.id, created.clone());
        tables.subscriptions.insert(
            created.id,
            Subscription {
                user_id: created.id,
                plan_code: None,
                expires_at: Some(trial_expires_at),
                is_trial: true,
            },
        );
        tables.usage.insert(
            created.id,
            Usage {
                user_id: created.id,
                ..Usage::default()
            },
        );
        Ok(created)
    }

    async fn set_user_blocked(&self, user_id: i64, blocked: bool) -> Result<bool, StorageError> {
        let mut tables = self.tables.write().await;
        Ok(tables.users.get_mut(&user_id).is_some_and(|u| {
            u.is_blocked = blocked;
            true
        }))
    }

    async fn count_users(&self) -> Result<u64, StorageError> {
        Ok(self.tables.read().await.users.len() as u64)
    }

    async fn list_user_ids(&self) -> Result<Vec<i64>, StorageError> {
        let tables = self.tables.read().await;
        let mut ids: Vec<i64> = tables
            .users
            .values()
            .filter(|u| !u.is_blocked)
            .map(|u| u.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn get_subscription(&self, user_id: i64) -> Result<Option<Subscription>, StorageError> {
        Ok(self.tables.read().await.subscriptions.get(&user_id).cloned())
    }

    async fn get_usage(&self, user_id: i64) -> Result<Option<Usage>, StorageError> {
        Ok(self.tables.read().await.usage.get(&user_id).copied())
    }

    async fn put_subscription(
        &self,
        subscription: Subscription,
        reset_usage: bool,
    ) -> Result<(), StorageError> {
        self.tables
            .write()
            .await
            .write_subscription(subscription, reset_usage);
        Ok(())
    }

    async fn reserve_usage(
        &self,
        user_id: i64,
        kind: UsageKind,
        limit: Option<u32>,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables.write().await;
        let usage = tables.usage.entry(user_id).or_insert(Usage {
            user_id,
            ..Usage::default()
        });
        let counter = counter_mut(usage, kind);
        if limit.is_some_and(|max| *counter >= max) {
            return Ok(false);
        }
        *counter = counter.saturating_add(1);
        Ok(true)
    }

    async fn release_usage(&self, user_id: i64, kind: UsageKind) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        if let Some(usage) = tables.usage.get_mut(&user_id) {
            let counter = counter_mut(usage, kind);
            *counter = counter.saturating_sub(1);
        }
        Ok(())
    }

    async fn create_chat_session(
        &self,
        user_id: i64,
        title: &str,
        mode: Mode,
    ) -> Result<ChatSession, StorageError> {
        let mut tables = self.tables.write().await;
        for session in tables.sessions.iter_mut().filter(|s| s.user_id == user_id) {
            session.is_active = false;
        }
        tables.next_session_id += 1;
        let session = ChatSession {
            id: tables.next_session_id,
            user_id,
            title: title.to_string(),
            mode,
            created_at: Utc::now(),
            is_active: true,
        };
        tables.sessions.push(session.clone());
        Ok(session)
    }

    async fn active_chat_session(&self, user_id: i64) -> Result<Option<ChatSession>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .iter()
            .rev()
            .find(|s| s.user_id == user_id && s.is_active)
            .cloned())
    }

    async fn list_chat_sessions(
        &self,
        user_id: i64,
        limit: u32,
    ) -> Result<Vec<ChatSession>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .iter()
            .rev()
            .filter(|s| s.user_id == user_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn activate_chat_session(
        &self,
        user_id: i64,
        session_id: i64,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables.write().await;
        let owned = tables
            .sessions
            .iter()
            .any(|s| s.id == session_id && s.user_id == user_id);
        if !owned {
            return Ok(false);
        }
        for session in tables.sessions.iter_mut().filter(|s| s.user_id == user_id) {
            session.is_active = session.id == session_id;
        }
        Ok(true)
    }

    async fn store_message(
        &self,
        session_id: i64,
        role: &str,
        content: &str,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        if !tables.sessions.iter().any(|s| s.id == session_id) {
            return Err(StorageError::NotFound(format!("chat session {session_id}")));
        }
        tables.next_message_id += 1;
        let message = StoredMessage {
            id: tables.next_message_id,
            session_id,
            role: role.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        tables.messages.push(message);
        Ok(())
    }

    async fn get_history(
        &self,
        session_id: i64,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let tables = self.tables.read().await;
        let mut newest: Vec<StoredMessage> = tables
            .messages
            .iter()
            .rev()
            .filter(|m| m.session_id == session_id)
            .take(limit as usize)
            .cloned()
            .collect();
        newest.reverse();
        Ok(newest)
    }

    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment, StorageError> {
        let mut tables = self.tables.write().await;
        tables.next_payment_id += 1;
        let stored = Payment {
            id: tables.next_payment_id,
            user_id: payment.user_id,
            provider: payment.provider,
            provider_payment_id: payment.provider_payment_id,
            plan_code: payment.plan_code,
            amount_rub: payment.amount_rub,
            status: PaymentStatus::Pending,
            created_at: Utc::now(),
        };
        tables.payments.push(stored.clone());
        Ok(stored)
    }

    async fn pending_payments(&self) -> Result<Vec<Payment>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Pending)
            .cloned()
            .collect())
    }

    async fn transition_payment(
        &self,
        payment_id: i64,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables.write().await;
        match tables
            .payments
            .iter_mut()
            .find(|p| p.id == payment_id && p.status == from)
        {
            Some(payment) => {
                payment.status = to;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn settle_payment(
        &self,
        payment_id: i64,
        subscription: Subscription,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables.write().await;
        let Some(payment) = tables
            .payments
            .iter_mut()
            .find(|p| p.id == payment_id && p.status == PaymentStatus::Pending)
        else {
            return Ok(false);
        };
        payment.status = PaymentStatus::Succeeded;
        tables.write_subscription(subscription, true);
        Ok(true)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<Stats, StorageError> {
        let tables = self.tables.read().await;
        let active = |s: &&Subscription| s.expires_at.is_some_and(|e| e > now);
        let succeeded: Vec<&Payment> = tables
            .payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Succeeded)
            .collect();
        Ok(Stats {
            users: tables.users.len() as u64,
            blocked_users: tables.users.values().filter(|u| u.is_blocked).count() as u64,
            active_subscriptions: tables.subscriptions.values().filter(active).count() as u64,
            paid_subscriptions: tables
                .subscriptions
                .values()
                .filter(active)
                .filter(|s| !s.is_trial)
                .count() as u64,
            pending_payments: tables
                .payments
                .iter()
                .filter(|p| p.status == PaymentStatus::Pending)
                .count() as u64,
            succeeded_payments: succeeded.len() as u64,
            revenue_rub: succeeded.iter().map(|p| u64::from(p.amount_rub)).sum(),
        })
    }

    async fn check_connection(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

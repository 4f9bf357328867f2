use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Delivers payment outcomes to users.
///
/// Implementations swallow and log delivery errors: a user who blocked the
/// bot must not stall payment processing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Subscription was paid and activated
    async fn subscription_activated(&self, user_id: i64, plan_title: &str, expires_at: DateTime<Utc>);

    /// Payment was canceled or expired
    async fn payment_failed(&self, user_id: i64, reason: &str);
}

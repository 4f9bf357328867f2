use crate::config::{Settings, REFERRAL_FALLBACK_PLAN};
use crate::storage::{StorageError, StorageProvider, Subscription};
use chrono::{DateTime, TimeDelta, Utc};
use tracing::info;

/// Grants `referral_bonus_days` to the user who invited a paying customer.
///
/// A running subscription is extended; an expired one restarts from `now`.
/// A referrer without any subscription gets the fallback paid plan.
///
/// # Errors
///
/// Returns a `StorageError` if the subscription could not be written.
pub async fn apply_referral_bonus(
    store: &dyn StorageProvider,
    settings: &Settings,
    referrer_id: i64,
    now: DateTime<Utc>,
) -> Result<Subscription, StorageError> {
    let bonus = TimeDelta::days(i64::from(settings.referral_bonus_days));

    let mut sub = store
        .get_subscription(referrer_id)
        .await?
        .unwrap_or_else(|| Subscription {
            user_id: referrer_id,
            plan_code: Some(REFERRAL_FALLBACK_PLAN.to_string()),
            expires_at: None,
            is_trial: false,
        });

    sub.expires_at = Some(match sub.expires_at {
        Some(exp) if exp > now => exp + bonus,
        _ => now + bonus,
    });

    store.put_subscription(sub.clone(), false).await?;
    info!(
        referrer_id,
        days = settings.referral_bonus_days,
        "Applied referral bonus"
    );
    Ok(sub)
}

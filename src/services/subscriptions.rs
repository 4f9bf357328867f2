//! Subscription lifecycle: registration with a trial, activity checks,
//! limits and the proration used when a paid plan replaces another one.

use crate::config::{find_plan, Plan, Settings};
use crate::domain::Limits;
use crate::storage::{NewUser, StorageError, StorageProvider, Subscription, Usage, User};
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tracing::{debug, info};

const MS_PER_DAY: f64 = 86_400_000.0;

/// Errors of subscription operations
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// Plan code missing from the catalog
    #[error("Unknown plan: {0}")]
    UnknownPlan(String),
    /// Underlying storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Converts a fractional number of days into a duration with millisecond precision
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn days_to_delta(days: f64) -> TimeDelta {
    TimeDelta::milliseconds((days * MS_PER_DAY).round() as i64)
}

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let ms = (to - from).num_milliseconds() as f64;
    ms / MS_PER_DAY
}

/// Registers a user on first contact.
///
/// New users get a trial that ends `trial_days` after `now`. A referral code
/// of another existing user is recorded as `referred_by`; unknown codes and
/// self-referrals are ignored. Existing users are returned unchanged.
///
/// # Errors
///
/// Returns a `StorageError` if the database is unavailable.
pub async fn ensure_user(
    store: &dyn StorageProvider,
    settings: &Settings,
    profile: NewUser,
    referral_code: Option<&str>,
    now: DateTime<Utc>,
) -> Result<User, StorageError> {
    if let Some(user) = store.get_user(profile.id).await? {
        return Ok(user);
    }

    let mut profile = profile;
    if let Some(code) = referral_code.map(str::trim).filter(|c| !c.is_empty()) {
        match store.find_user_by_referral_code(code).await? {
            Some(referrer) if referrer.id != profile.id => {
                profile.referred_by = Some(referrer.id);
            }
            Some(_) => debug!(user_id = profile.id, "Ignoring self-referral"),
            None => debug!(user_id = profile.id, code, "Unknown referral code"),
        }
    }

    let trial_end = now + TimeDelta::days(i64::from(settings.trial_days));
    let user = store.create_user_with_trial(profile, trial_end).await?;
    info!(
        user_id = user.id,
        referred_by = ?user.referred_by,
        "Registered new user with trial"
    );
    Ok(user)
}

/// A subscription is active while its expiry lies in the future
#[must_use]
pub fn is_active(sub: Option<&Subscription>, now: DateTime<Utc>) -> bool {
    sub.and_then(|s| s.expires_at).is_some_and(|exp| exp > now)
}

/// Limits granted by a subscription
#[must_use]
pub fn limits_for(sub: Option<&Subscription>, settings: &Settings) -> Limits {
    let Some(sub) = sub else {
        return Limits::NONE;
    };
    if sub.is_trial {
        return Limits {
            max_requests: Some(settings.trial_max_requests),
            max_images: Some(settings.trial_max_images),
            max_text_len: settings.trial_max_text_len,
        };
    }
    sub.plan_code
        .as_deref()
        .and_then(find_plan)
        .map_or(Limits::NONE, Plan::limits)
}

/// Result of replacing one plan with another.
///
/// All day counts are fractional. `converted_days`, `bonus_days_req` and
/// `bonus_days_img` split the extra days for display and sum to
/// `total_days - new_plan.duration_days`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanChange {
    /// Plan being replaced, if its value was taken into account
    pub old_plan: Option<&'static Plan>,
    /// Plan being bought
    pub new_plan: &'static Plan,
    /// Days left on the old plan, clamped to its duration
    pub leftover_days: f64,
    /// Extra days attributed to unused time
    pub converted_days: f64,
    /// Extra days attributed to unused requests
    pub bonus_days_req: f64,
    /// Extra days attributed to unused images
    pub bonus_days_img: f64,
    /// Length of the new subscription
    pub total_days: f64,
    /// Expiry of the new subscription
    pub expires_at: DateTime<Utc>,
}

impl PlanChange {
    fn plain(
        old_plan: Option<&'static Plan>,
        new_plan: &'static Plan,
        leftover_days: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let total_days = f64::from(new_plan.duration_days);
        Self {
            old_plan,
            new_plan,
            leftover_days,
            converted_days: 0.0,
            bonus_days_req: 0.0,
            bonus_days_img: 0.0,
            total_days,
            expires_at: now + days_to_delta(total_days),
        }
    }

    /// Days added on top of the new plan's duration
    #[must_use]
    pub fn extra_days(&self) -> f64 {
        self.converted_days + self.bonus_days_req + self.bonus_days_img
    }
}

/// Share of a finite positive limit already spent, capped at 1
fn used_ratio(used: u32, limit: Option<u32>) -> Option<f64> {
    match limit {
        Some(max) if max > 0 => Some((f64::from(used) / f64::from(max)).min(1.0)),
        _ => None,
    }
}

/// Converts the unused value of the old plan into days of the new one.
///
/// The used share of the old plan is the largest of the time, request and
/// image shares, so the carried value never exceeds the old price. The
/// result depends only on its arguments.
#[must_use]
pub fn compute_plan_change(
    old_plan: Option<&'static Plan>,
    expires_at: Option<DateTime<Utc>>,
    usage: Option<&Usage>,
    new_plan: &'static Plan,
    now: DateTime<Utc>,
) -> PlanChange {
    let (Some(old), Some(expires_at)) = (old_plan, expires_at) else {
        return PlanChange::plain(None, new_plan, 0.0, now);
    };
    if expires_at <= now || old.duration_days == 0 {
        return PlanChange::plain(None, new_plan, 0.0, now);
    }

    let old_duration = f64::from(old.duration_days);
    let leftover_days = days_between(now, expires_at).clamp(0.0, old_duration);
    let time_unused = leftover_days / old_duration;

    let req_used = usage.and_then(|u| used_ratio(u.used_requests, old.max_requests));
    let img_used = usage.and_then(|u| used_ratio(u.used_images, old.max_images));

    let used_fraction = [Some(1.0 - time_unused), req_used, img_used]
        .into_iter()
        .flatten()
        .fold(0.0_f64, f64::max)
        .clamp(0.0, 1.0);
    let leftover_fraction = 1.0 - used_fraction;

    if leftover_fraction <= 0.0 || new_plan.price_rub == 0 || new_plan.duration_days == 0 {
        return PlanChange::plain(Some(old), new_plan, leftover_days, now);
    }

    let price_per_day_new = f64::from(new_plan.price_rub) / f64::from(new_plan.duration_days);
    let extra_days = leftover_fraction * f64::from(old.price_rub) / price_per_day_new;

    let comp_time = time_unused;
    let comp_req = req_used.map_or(0.0, |r| 1.0 - r);
    let comp_img = img_used.map_or(0.0, |r| 1.0 - r);
    let comp_sum = comp_time + comp_req + comp_img;

    let (converted_days, bonus_days_req, bonus_days_img) = if comp_sum > 0.0 && extra_days > 0.0 {
        (
            extra_days * comp_time / comp_sum,
            extra_days * comp_req / comp_sum,
            extra_days * comp_img / comp_sum,
        )
    } else {
        (0.0, 0.0, 0.0)
    };

    let total_days = f64::from(new_plan.duration_days) + extra_days;
    PlanChange {
        old_plan: Some(old),
        new_plan,
        leftover_days,
        converted_days,
        bonus_days_req,
        bonus_days_img,
        total_days,
        expires_at: now + days_to_delta(total_days),
    }
}

fn paid_plan_of(sub: &Subscription) -> Option<&'static Plan> {
    if sub.is_trial {
        return None;
    }
    sub.plan_code.as_deref().and_then(find_plan)
}

/// Preview of what buying `plan_code` would give the user right now.
///
/// Uses the same computation as [`activate_paid_plan`].
///
/// # Errors
///
/// Returns `UnknownPlan` for codes outside the catalog and `Storage` on
/// database failures.
pub async fn preview_plan_change(
    store: &dyn StorageProvider,
    user_id: i64,
    plan_code: &str,
    now: DateTime<Utc>,
) -> Result<PlanChange, SubscriptionError> {
    let new_plan =
        find_plan(plan_code).ok_or_else(|| SubscriptionError::UnknownPlan(plan_code.to_string()))?;

    let Some(sub) = store.get_subscription(user_id).await? else {
        return Ok(PlanChange::plain(None, new_plan, 0.0, now));
    };
    let Some(old_plan) = paid_plan_of(&sub) else {
        return Ok(PlanChange::plain(None, new_plan, 0.0, now));
    };

    let usage = store.get_usage(user_id).await?;
    Ok(compute_plan_change(
        Some(old_plan),
        sub.expires_at,
        usage.as_ref(),
        new_plan,
        now,
    ))
}

/// Computes the subscription a paid plan activation would write.
///
/// A user without a running paid plan gets the plain plan duration. A user
/// switching from a running paid plan gets the prorated duration. Nothing is
/// written.
///
/// # Errors
///
/// Returns `UnknownPlan` for codes outside the catalog and `Storage` on
/// database failures.
pub async fn paid_subscription(
    store: &dyn StorageProvider,
    user_id: i64,
    plan_code: &str,
    now: DateTime<Utc>,
) -> Result<Subscription, SubscriptionError> {
    let new_plan =
        find_plan(plan_code).ok_or_else(|| SubscriptionError::UnknownPlan(plan_code.to_string()))?;
    let current = store.get_subscription(user_id).await?;

    let running_paid = current
        .as_ref()
        .filter(|s| is_active(Some(*s), now))
        .and_then(paid_plan_of);

    let expires_at = match (running_paid, current.as_ref()) {
        (Some(old_plan), Some(sub)) => {
            let usage = store.get_usage(user_id).await?;
            let change =
                compute_plan_change(Some(old_plan), sub.expires_at, usage.as_ref(), new_plan, now);
            info!(
                user_id,
                from = old_plan.code,
                to = new_plan.code,
                extra_days = change.extra_days(),
                "Prorating plan change"
            );
            change.expires_at
        }
        _ => now + TimeDelta::days(i64::from(new_plan.duration_days)),
    };

    Ok(Subscription {
        user_id,
        plan_code: Some(new_plan.code.to_string()),
        expires_at: Some(expires_at),
        is_trial: false,
    })
}

/// Activates a paid plan and resets usage in the same write.
///
/// # Errors
///
/// Returns `UnknownPlan` for codes outside the catalog and `Storage` on
/// database failures.
pub async fn activate_paid_plan(
    store: &dyn StorageProvider,
    user_id: i64,
    plan_code: &str,
    now: DateTime<Utc>,
) -> Result<Subscription, SubscriptionError> {
    let subscription = paid_subscription(store, user_id, plan_code, now).await?;
    store.put_subscription(subscription.clone(), true).await?;
    info!(user_id, plan = plan_code, expires_at = ?subscription.expires_at, "Activated paid plan");
    Ok(subscription)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;
    use crate::storage::{InMemoryStorage, MockStorageProvider, UsageKind};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn plan(code: &str) -> &'static Plan {
        find_plan(code).expect("plan in catalog")
    }

    fn profile(id: i64) -> NewUser {
        NewUser {
            id,
            username: Some(format!("user{id}")),
            ..NewUser::default()
        }
    }

    #[test]
    fn test_is_active_requires_future_expiry() {
        let mut sub = Subscription {
            user_id: 1,
            plan_code: None,
            expires_at: None,
            is_trial: true,
        };
        assert!(!is_active(None, now()));
        assert!(!is_active(Some(&sub), now()));
        sub.expires_at = Some(now());
        assert!(!is_active(Some(&sub), now()));
        sub.expires_at = Some(now() + TimeDelta::seconds(1));
        assert!(is_active(Some(&sub), now()));
    }

    #[test]
    fn test_limits_for_variants() {
        let settings = test_settings();
        assert_eq!(limits_for(None, &settings), Limits::NONE);

        let trial = Subscription {
            user_id: 1,
            plan_code: None,
            expires_at: Some(now()),
            is_trial: true,
        };
        let limits = limits_for(Some(&trial), &settings);
        assert_eq!(limits.max_requests, Some(settings.trial_max_requests));
        assert_eq!(limits.max_images, Some(settings.trial_max_images));

        let paid = Subscription {
            plan_code: Some("pro_plus".to_string()),
            is_trial: false,
            ..trial.clone()
        };
        assert_eq!(limits_for(Some(&paid), &settings), plan("pro_plus").limits());

        let unknown = Subscription {
            plan_code: Some("gold".to_string()),
            is_trial: false,
            ..trial
        };
        assert_eq!(limits_for(Some(&unknown), &settings), Limits::NONE);
    }

    #[test]
    fn test_plan_change_without_old_plan() {
        let change = compute_plan_change(None, None, None, plan("pro_plus"), now());
        assert!(change.old_plan.is_none());
        assert!((change.total_days - 30.0).abs() < f64::EPSILON);
        assert_eq!(change.expires_at, now() + TimeDelta::days(30));
    }

    #[test]
    fn test_plan_change_expired_old_plan() {
        let change = compute_plan_change(
            Some(plan("pro_lite")),
            Some(now() - TimeDelta::hours(1)),
            None,
            plan("pro_plus"),
            now(),
        );
        assert!(change.old_plan.is_none());
        assert!((change.total_days - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_plan_change_half_used_lite_to_plus() {
        // 5 of 10 days left, nothing spent: half of 499 RUB carried over
        let usage = Usage {
            user_id: 1,
            used_requests: 0,
            used_images: 0,
        };
        let change = compute_plan_change(
            Some(plan("pro_lite")),
            Some(now() + TimeDelta::days(5)),
            Some(&usage),
            plan("pro_plus"),
            now(),
        );
        let expected_extra = 0.5 * 499.0 / (1290.0 / 30.0);
        assert!((change.extra_days() - expected_extra).abs() < 1e-9);
        assert!((change.total_days - (30.0 + expected_extra)).abs() < 1e-9);
        assert!((change.leftover_days - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_plan_change_usage_dominates_time() {
        // Time says 10% used, images say 100% used
        let usage = Usage {
            user_id: 1,
            used_requests: 10,
            used_images: 20,
        };
        let change = compute_plan_change(
            Some(plan("pro_lite")),
            Some(now() + TimeDelta::days(9)),
            Some(&usage),
            plan("pro_plus"),
            now(),
        );
        assert!(change.extra_days().abs() < f64::EPSILON);
        assert!((change.total_days - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_plan_change_leftover_clamped_to_old_duration() {
        let change = compute_plan_change(
            Some(plan("pro_lite")),
            Some(now() + TimeDelta::days(40)),
            None,
            plan("pro_plus"),
            now(),
        );
        assert!((change.leftover_days - 10.0).abs() < f64::EPSILON);
        let max_extra = 499.0 / (1290.0 / 30.0);
        assert!(change.extra_days() <= max_extra + 1e-9);
    }

    #[tokio::test]
    async fn test_ensure_user_is_idempotent_and_records_referrer() {
        let store = InMemoryStorage::new();
        let settings = test_settings();

        let referrer = ensure_user(&store, &settings, profile(1), None, now())
            .await
            .expect("register referrer");
        let invited = ensure_user(&store, &settings, profile(2), Some(&referrer.referral_code), now())
            .await
            .expect("register invited");
        assert_eq!(invited.referred_by, Some(1));

        let again = ensure_user(&store, &settings, profile(2), Some("ref999"), now())
            .await
            .expect("second contact");
        assert_eq!(again, invited);

        let sub = store
            .get_subscription(2)
            .await
            .expect("query")
            .expect("trial exists");
        assert!(sub.is_trial);
        assert_eq!(sub.expires_at, Some(now() + TimeDelta::days(3)));
    }

    #[tokio::test]
    async fn test_ensure_user_ignores_self_referral() {
        let mut store = MockStorageProvider::new();
        store.expect_get_user().returning(|_| Ok(None));
        store.expect_find_user_by_referral_code().returning(|code| {
            Ok(Some(User {
                id: 7,
                username: None,
                first_name: None,
                last_name: None,
                created_at: Utc::now(),
                is_blocked: false,
                referral_code: code.to_string(),
                referred_by: None,
            }))
        });
        store
            .expect_create_user_with_trial()
            .withf(|user, _| user.id == 7 && user.referred_by.is_none())
            .times(1)
            .returning(|user, _| {
                Ok(User {
                    id: user.id,
                    username: None,
                    first_name: None,
                    last_name: None,
                    created_at: Utc::now(),
                    is_blocked: false,
                    referral_code: user.referral_code(),
                    referred_by: user.referred_by,
                })
            });

        let user = ensure_user(&store, &test_settings(), profile(7), Some("ref7"), now())
            .await
            .expect("registered");
        assert_eq!(user.referred_by, None);
    }

    #[tokio::test]
    async fn test_activate_from_trial_gives_plain_duration_and_resets_usage() {
        let store = InMemoryStorage::new();
        ensure_user(&store, &test_settings(), profile(5), None, now())
            .await
            .expect("registered");
        store
            .reserve_usage(5, UsageKind::Request, None)
            .await
            .expect("reserve");

        let sub = activate_paid_plan(&store, 5, "pro_lite", now())
            .await
            .expect("activated");
        assert!(!sub.is_trial);
        assert_eq!(sub.plan_code.as_deref(), Some("pro_lite"));
        assert_eq!(sub.expires_at, Some(now() + TimeDelta::days(10)));

        let usage = store.get_usage(5).await.expect("query").expect("usage row");
        assert_eq!(usage.used_requests, 0);
    }

    #[tokio::test]
    async fn test_activate_matches_preview() {
        let store = InMemoryStorage::new();
        ensure_user(&store, &test_settings(), profile(9), None, now())
            .await
            .expect("registered");
        store
            .put_subscription(
                Subscription {
                    user_id: 9,
                    plan_code: Some("pro_lite".to_string()),
                    expires_at: Some(now() + TimeDelta::days(6)),
                    is_trial: false,
                },
                true,
            )
            .await
            .expect("seed plan");

        let preview = preview_plan_change(&store, 9, "pro_premium", now())
            .await
            .expect("preview");
        let sub = activate_paid_plan(&store, 9, "pro_premium", now())
            .await
            .expect("activated");
        assert_eq!(sub.expires_at, Some(preview.expires_at));
        assert!(preview.total_days > 90.0);
    }

    #[tokio::test]
    async fn test_unknown_plan_is_rejected() {
        let store = InMemoryStorage::new();
        let err = activate_paid_plan(&store, 1, "gold", now())
            .await
            .expect_err("unknown plan");
        assert!(matches!(err, SubscriptionError::UnknownPlan(code) if code == "gold"));
    }

    fn any_plan() -> impl Strategy<Value = &'static Plan> {
        prop::sample::select(crate::config::PLANS.iter().collect::<Vec<_>>())
    }

    proptest! {
        #[test]
        fn prop_carried_value_never_exceeds_old_price(
            old in any_plan(),
            new in any_plan(),
            left_minutes in 0i64..(120 * 24 * 60),
            used_requests in 0u32..2000,
            used_images in 0u32..100,
        ) {
            let usage = Usage { user_id: 1, used_requests, used_images };
            let change = compute_plan_change(
                Some(old),
                Some(now() + TimeDelta::minutes(left_minutes)),
                Some(&usage),
                new,
                now(),
            );
            let per_day = f64::from(new.price_rub) / f64::from(new.duration_days);
            prop_assert!(change.extra_days() * per_day <= f64::from(old.price_rub) + 1e-6);
            prop_assert!(change.total_days >= f64::from(new.duration_days));
            prop_assert!((change.total_days - f64::from(new.duration_days) - change.extra_days()).abs() < 1e-6);
        }
    }
}

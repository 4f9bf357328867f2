//! Quota checks and reservations.

use super::subscriptions::{is_active, limits_for};
use crate::config::Settings;
use crate::domain::Limits;
use crate::storage::{StorageError, StorageProvider, Subscription, Usage, UsageKind};
use chrono::{DateTime, Utc};
use tracing::warn;

/// Snapshot of what a user may do right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    /// Current subscription row
    pub subscription: Option<Subscription>,
    /// Subscription has not expired
    pub active: bool,
    /// Limits of the current plan
    pub limits: Limits,
    /// Counters of the current period
    pub usage: Usage,
}

impl Quota {
    /// Loads subscription and usage of a user.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the database is unavailable.
    pub async fn load(
        store: &dyn StorageProvider,
        settings: &Settings,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Self, StorageError> {
        let subscription = store.get_subscription(user_id).await?;
        let usage = store.get_usage(user_id).await?.unwrap_or(Usage {
            user_id,
            ..Usage::default()
        });
        Ok(Self {
            active: is_active(subscription.as_ref(), now),
            limits: limits_for(subscription.as_ref(), settings),
            subscription,
            usage,
        })
    }

    /// Active and below the request limit
    #[must_use]
    pub fn allows_request(&self) -> bool {
        self.active && can_spend_request(&self.limits, &self.usage)
    }

    /// Active and below the image limit
    #[must_use]
    pub fn allows_image(&self) -> bool {
        self.active && can_spend_image(&self.limits, &self.usage)
    }

    /// Takes one unit of `kind` from the quota in storage.
    ///
    /// The check runs against the stored counter, not this snapshot, so
    /// messages still in flight count too. Returns `None` when the plan is
    /// inactive or the limit is reached.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the counter could not be updated.
    pub async fn reserve(
        &self,
        store: &dyn StorageProvider,
        user_id: i64,
        kind: UsageKind,
    ) -> Result<Option<Reservation>, StorageError> {
        if !self.active {
            return Ok(None);
        }
        let limit = match kind {
            UsageKind::Request => self.limits.max_requests,
            UsageKind::Image => self.limits.max_images,
        };
        let taken = store.reserve_usage(user_id, kind, limit).await?;
        Ok(taken.then_some(Reservation { user_id, kind }))
    }
}

fn below(limit: Option<u32>, used: u32) -> bool {
    limit.is_none_or(|max| used < max)
}

/// True when the request limit is unlimited or not reached
#[must_use]
pub fn can_spend_request(limits: &Limits, usage: &Usage) -> bool {
    below(limits.max_requests, usage.used_requests)
}

/// True when the image limit is unlimited or not reached
#[must_use]
pub fn can_spend_image(limits: &Limits, usage: &Usage) -> bool {
    below(limits.max_images, usage.used_images)
}

/// One unit of quota taken before the work it pays for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// Owner of the counter
    pub user_id: i64,
    /// Counter the unit was taken from
    pub kind: UsageKind,
}

impl Reservation {
    /// Gives the unit back after the work failed or was dropped
    pub async fn release(self, store: &dyn StorageProvider) {
        if let Err(e) = store.release_usage(self.user_id, self.kind).await {
            warn!(user_id = self.user_id, kind = ?self.kind, "Quota refund failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;
    use crate::services::subscriptions::ensure_user;
    use crate::storage::{InMemoryStorage, NewUser};

    #[test]
    fn test_unlimited_always_allows() {
        let limits = Limits {
            max_requests: None,
            max_images: Some(2),
            max_text_len: 100,
        };
        let usage = Usage {
            user_id: 1,
            used_requests: 1_000_000,
            used_images: 2,
        };
        assert!(can_spend_request(&limits, &usage));
        assert!(!can_spend_image(&limits, &usage));
    }

    #[test]
    fn test_zero_limits_deny() {
        assert!(!can_spend_request(&Limits::NONE, &Usage::default()));
        assert!(!can_spend_image(&Limits::NONE, &Usage::default()));
    }

    #[tokio::test]
    async fn test_quota_exhausts_trial_images() {
        let store = InMemoryStorage::new();
        let settings = test_settings();
        let now = Utc::now();
        ensure_user(
            &store,
            &settings,
            NewUser {
                id: 3,
                ..NewUser::default()
            },
            None,
            now,
        )
        .await
        .expect("registered");

        for _ in 0..settings.trial_max_images {
            let quota = Quota::load(&store, &settings, 3, now).await.expect("quota");
            assert!(quota.allows_image());
            let taken = quota
                .reserve(&store, 3, UsageKind::Image)
                .await
                .expect("reserve");
            assert!(taken.is_some());
        }

        let quota = Quota::load(&store, &settings, 3, now).await.expect("quota");
        assert!(!quota.allows_image());
        assert!(quota.allows_request());
        assert_eq!(quota.usage.used_images, settings.trial_max_images);
    }

    #[tokio::test]
    async fn test_stale_snapshot_cannot_overspend() {
        let store = InMemoryStorage::new();
        let mut settings = test_settings();
        settings.trial_max_requests = 2;
        let now = Utc::now();
        ensure_user(
            &store,
            &settings,
            NewUser {
                id: 4,
                ..NewUser::default()
            },
            None,
            now,
        )
        .await
        .expect("registered");

        // Three messages loaded the quota before any of them was answered
        let snapshot = Quota::load(&store, &settings, 4, now).await.expect("quota");
        assert!(snapshot.allows_request());
        let mut taken = Vec::new();
        for _ in 0..3 {
            taken.push(
                snapshot
                    .reserve(&store, 4, UsageKind::Request)
                    .await
                    .expect("reserve"),
            );
        }
        assert_eq!(taken.iter().filter(|r| r.is_some()).count(), 2);
        assert_eq!(taken[2], None);

        // A failed answer hands its unit back
        if let Some(first) = taken[0] {
            first.release(&store).await;
        }
        let retry = snapshot
            .reserve(&store, 4, UsageKind::Request)
            .await
            .expect("reserve");
        assert_eq!(
            retry,
            Some(Reservation {
                user_id: 4,
                kind: UsageKind::Request
            })
        );
        let usage = store.get_usage(4).await.expect("query").unwrap_or_default();
        assert_eq!(usage.used_requests, 2);
    }

    #[tokio::test]
    async fn test_inactive_plan_reserves_nothing() {
        let store = InMemoryStorage::new();
        let quota = Quota::load(&store, &test_settings(), 405, Utc::now())
            .await
            .expect("quota");
        let taken = quota
            .reserve(&store, 405, UsageKind::Image)
            .await
            .expect("reserve");
        assert!(taken.is_none());
        assert!(store.get_usage(405).await.expect("query").is_none());
    }

    #[tokio::test]
    async fn test_quota_inactive_without_subscription() {
        let store = InMemoryStorage::new();
        let quota = Quota::load(&store, &test_settings(), 404, Utc::now())
            .await
            .expect("quota");
        assert!(!quota.active);
        assert!(!quota.allows_request());
    }
}

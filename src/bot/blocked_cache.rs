//! Cooldown for "you are blocked" notices.
//!
//! A blocked user who keeps writing gets the notice once per cooldown
//! period; further attempts are dropped silently.

use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Remembers when a blocked user was last told about the block
#[derive(Clone)]
pub struct BlockedNoticeCache {
    /// user_id -> () with automatic expiry after the cooldown
    cache: Cache<i64, ()>,
    cooldown: Duration,
    silenced_count: Arc<AtomicU64>,
}

impl BlockedNoticeCache {
    /// Creates a new cache.
    ///
    /// An entry lives for `cooldown_secs`, capped by `ttl_secs`.
    ///
    /// ```
    /// use neurochat_bot::bot::BlockedNoticeCache;
    ///
    /// let cache = BlockedNoticeCache::new(1200, 7200, 10_000);
    /// assert_eq!(cache.cooldown().as_secs(), 1200);
    /// ```
    #[must_use]
    pub fn new(cooldown_secs: u64, ttl_secs: u64, max_capacity: u64) -> Self {
        let cooldown = Duration::from_secs(cooldown_secs);
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(cooldown.min(Duration::from_secs(ttl_secs)))
            .build();

        Self {
            cache,
            cooldown,
            silenced_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns true if the user has not been notified within the cooldown.
    ///
    /// Silenced attempts are counted; every 100th one is logged.
    pub async fn should_send(&self, user_id: i64, user_name: &str) -> bool {
        if self.cache.get(&user_id).await.is_none() {
            return true;
        }

        let count = self.silenced_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count.is_multiple_of(100) {
            debug!(
                "⛔️ Silenced {} blocked user messages (recent: user {} - {})",
                count, user_id, user_name
            );
        }
        false
    }

    /// Starts the cooldown after a notice was delivered
    pub async fn mark_sent(&self, user_id: i64) {
        self.cache.insert(user_id, ()).await;
    }

    /// Forgets a user, used when the user is unblocked
    pub async fn forget(&self, user_id: i64) {
        self.cache.invalidate(&user_id).await;
    }

    /// Number of users currently in cooldown
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Total number of silenced attempts
    #[must_use]
    pub fn silenced_count(&self) -> u64 {
        self.silenced_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_attempt_should_send() {
        let cache = BlockedNoticeCache::new(60, 120, 100);
        assert!(cache.should_send(12345, "TestUser").await);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_second_attempt() {
        let cache = BlockedNoticeCache::new(60, 120, 100);

        assert!(cache.should_send(12345, "TestUser").await);
        cache.mark_sent(12345).await;

        assert!(!cache.should_send(12345, "TestUser").await);
    }

    #[tokio::test]
    async fn test_different_users_independent() {
        let cache = BlockedNoticeCache::new(60, 120, 100);

        cache.mark_sent(111).await;
        assert!(cache.should_send(222, "User2").await);
    }

    #[tokio::test]
    async fn test_silenced_count_and_forget() {
        let cache = BlockedNoticeCache::new(60, 120, 100);
        cache.mark_sent(12345).await;

        for _ in 0..5 {
            cache.should_send(12345, "TestUser").await;
        }
        assert_eq!(cache.silenced_count(), 5);

        cache.forget(12345).await;
        assert!(cache.should_send(12345, "TestUser").await);
    }

    #[tokio::test]
    async fn test_entry_count() {
        let cache = BlockedNoticeCache::new(60, 120, 100);

        cache.mark_sent(111).await;
        cache.mark_sent(222).await;
        cache.cache.run_pending_tasks().await;

        assert_eq!(cache.entry_count(), 2);
    }

    #[tokio::test]
    async fn test_cooldown_expires() {
        let cache = BlockedNoticeCache::new(1, 120, 100);
        cache.mark_sent(7).await;
        assert!(!cache.should_send(7, "Recent").await);
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(cache.should_send(7, "Expired").await);
    }
}

use super::blocked_cache::BlockedNoticeCache;
use crate::config::Settings;
use crate::llm::{ChatProvider, ImageProvider};
use crate::payments::{PaymentMonitor, PaymentProvider};
use crate::queue::WorkerPool;
use crate::services::SafetyGuard;
use crate::storage::{NewUser, StorageProvider};
use std::sync::Arc;
use teloxide::types::{Message, User};
use tracing::warn;

/// Shared services handed to every handler through `dptree`
pub struct AppContext {
    pub store: Arc<dyn StorageProvider>,
    pub settings: Arc<Settings>,
    pub chat: Arc<dyn ChatProvider>,
    pub images: Arc<dyn ImageProvider>,
    pub payments: Arc<dyn PaymentProvider>,
    pub monitor: Arc<PaymentMonitor>,
    /// Runs assistant answers
    pub chat_pool: WorkerPool,
    /// Runs image generation and edits
    pub image_pool: WorkerPool,
    pub guard: SafetyGuard,
    pub blocked_notices: BlockedNoticeCache,
}

impl AppContext {
    /// Returns true if the user is registered and blocked.
    ///
    /// Storage failures count as "not blocked" so an outage does not lock
    /// everybody out.
    pub async fn is_blocked(&self, user_id: i64) -> bool {
        match self.store.get_user(user_id).await {
            Ok(user) => user.is_some_and(|u| u.is_blocked),
            Err(e) => {
                warn!(user_id, "Blocked check failed: {e}");
                false
            }
        }
    }

    #[must_use]
    pub fn is_admin(&self, user_id: i64) -> bool {
        self.settings.is_admin(user_id)
    }
}

/// Safe extraction of the user ID from a message.
/// Returns 0 if the user information is missing.
#[must_use]
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

/// Username, or first name when there is none
#[must_use]
pub fn get_user_name(msg: &Message) -> String {
    msg.from.as_ref().map_or_else(|| "Unknown".to_string(), display_name)
}

/// Name used in logs
#[must_use]
pub fn display_name(user: &User) -> String {
    user.username
        .clone()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| user.first_name.clone())
}

/// Profile stored on first contact
#[must_use]
pub fn profile_of(user: &User) -> NewUser {
    NewUser {
        id: user.id.0.cast_signed(),
        username: user.username.clone(),
        first_name: Some(user.first_name.clone()).filter(|n| !n.is_empty()),
        last_name: user.last_name.clone(),
        referred_by: None,
    }
}

//! Persistence layer.
//!
//! [`StorageProvider`] is the only way services touch data. Every operation
//! that has to change several rows atomically is a single trait method, so
//! each backend can run it inside one transaction.

mod memory;
mod mysql;

pub use memory::InMemoryStorage;
pub use mysql::MySqlStorage;

use crate::domain::{Mode, PaymentStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// Error reported by the database driver
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    /// A referenced row does not exist
    #[error("Not found: {0}")]
    NotFound(String),
    /// A stored value could not be decoded
    #[error("Corrupted record: {0}")]
    Corrupted(String),
}

/// Telegram user known to the bot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Telegram user ID
    pub id: i64,
    /// Telegram @username
    pub username: Option<String>,
    /// First name
    pub first_name: Option<String>,
    /// Last name
    pub last_name: Option<String>,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// Blocked users are ignored by the bot
    pub is_blocked: bool,
    /// Code other users pass to `/start`
    pub referral_code: String,
    /// User who invited this one
    pub referred_by: Option<i64>,
}

/// Data needed to register a user
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewUser {
    /// Telegram user ID
    pub id: i64,
    /// Telegram @username
    pub username: Option<String>,
    /// First name
    pub first_name: Option<String>,
    /// Last name
    pub last_name: Option<String>,
    /// Inviting user, already resolved from the referral code
    pub referred_by: Option<i64>,
}

impl NewUser {
    /// Referral code assigned to this user
    #[must_use]
    pub fn referral_code(&self) -> String {
        referral_code_for(self.id)
    }
}

/// Referral code of a user ID
#[must_use]
pub fn referral_code_for(user_id: i64) -> String {
    format!("ref{user_id}")
}

/// Subscription row, one per user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Owner
    pub user_id: i64,
    /// Paid plan code, `None` for the trial
    pub plan_code: Option<String>,
    /// Expiry, always UTC
    pub expires_at: Option<DateTime<Utc>>,
    /// Trial flag
    pub is_trial: bool,
}

/// Quota counters for the current subscription period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Owner
    pub user_id: i64,
    /// Requests spent
    pub used_requests: u32,
    /// Images spent
    pub used_images: u32,
}

/// Which usage counter an operation touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    /// Chat request
    Request,
    /// Image generation or edit
    Image,
}

/// Conversation thread of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    /// Session ID
    pub id: i64,
    /// Owner
    pub user_id: i64,
    /// Display title
    pub title: String,
    /// Mode the session was opened in
    pub mode: Mode,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// At most one session per user is active
    pub is_active: bool,
}

/// Stored chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Message ID
    pub id: i64,
    /// Session the message belongs to
    pub session_id: i64,
    /// `user` or `assistant`
    pub role: String,
    /// Text content
    pub content: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Invoice registered with a payment gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Local ID
    pub id: i64,
    /// Paying user
    pub user_id: i64,
    /// Gateway name
    pub provider: String,
    /// Gateway payment ID
    pub provider_payment_id: String,
    /// Purchased plan
    pub plan_code: String,
    /// Amount in roubles
    pub amount_rub: u32,
    /// Current status
    pub status: PaymentStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Data needed to register an invoice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    /// Paying user
    pub user_id: i64,
    /// Gateway name
    pub provider: String,
    /// Gateway payment ID
    pub provider_payment_id: String,
    /// Purchased plan
    pub plan_code: String,
    /// Amount in roubles
    pub amount_rub: u32,
}

/// Aggregates for the admin panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Stats {
    /// Registered users
    pub users: u64,
    /// Blocked users
    pub blocked_users: u64,
    /// Subscriptions that have not expired
    pub active_subscriptions: u64,
    /// Paid subscriptions that have not expired
    pub paid_subscriptions: u64,
    /// Invoices waiting for payment
    pub pending_payments: u64,
    /// Completed payments
    pub succeeded_payments: u64,
    /// Sum of completed payments, in roubles
    pub revenue_rub: u64,
}

/// Interface for persistent storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Returns a user by Telegram ID
    async fn get_user(&self, user_id: i64) -> Result<Option<User>, StorageError>;
    /// Resolves a referral code into its owner
    async fn find_user_by_referral_code(&self, code: &str)
        -> Result<Option<User>, StorageError>;
    /// Creates the user with a trial subscription and zeroed usage.
    /// Returns the existing user unchanged if the ID is already registered.
    async fn create_user_with_trial(
        &self,
        user: NewUser,
        trial_expires_at: DateTime<Utc>,
    ) -> Result<User, StorageError>;
    /// Blocks or unblocks a user, returns false if the user is unknown
    async fn set_user_blocked(&self, user_id: i64, blocked: bool) -> Result<bool, StorageError>;
    /// Number of registered users
    async fn count_users(&self) -> Result<u64, StorageError>;
    /// IDs of all users that are not blocked
    async fn list_user_ids(&self) -> Result<Vec<i64>, StorageError>;

    /// Returns the subscription of a user
    async fn get_subscription(&self, user_id: i64) -> Result<Option<Subscription>, StorageError>;
    /// Returns the usage counters of a user
    async fn get_usage(&self, user_id: i64) -> Result<Option<Usage>, StorageError>;
    /// Inserts or replaces a subscription, optionally zeroing usage in the same transaction
    async fn put_subscription(
        &self,
        subscription: Subscription,
        reset_usage: bool,
    ) -> Result<(), StorageError>;
    /// Atomically increments one usage counter while it is below `limit`.
    /// `None` means unlimited. Returns false if the limit was already reached.
    async fn reserve_usage(
        &self,
        user_id: i64,
        kind: UsageKind,
        limit: Option<u32>,
    ) -> Result<bool, StorageError>;
    /// Decrements one usage counter, never below zero
    async fn release_usage(&self, user_id: i64, kind: UsageKind) -> Result<(), StorageError>;

    /// Deactivates the current session and opens a new active one
    async fn create_chat_session(
        &self,
        user_id: i64,
        title: &str,
        mode: Mode,
    ) -> Result<ChatSession, StorageError>;
    /// Returns the active session of a user
    async fn active_chat_session(&self, user_id: i64) -> Result<Option<ChatSession>, StorageError>;
    /// Newest sessions first
    async fn list_chat_sessions(
        &self,
        user_id: i64,
        limit: u32,
    ) -> Result<Vec<ChatSession>, StorageError>;
    /// Makes a session active if it belongs to the user
    async fn activate_chat_session(
        &self,
        user_id: i64,
        session_id: i64,
    ) -> Result<bool, StorageError>;

    /// Appends a message to a session
    async fn store_message(
        &self,
        session_id: i64,
        role: &str,
        content: &str,
    ) -> Result<(), StorageError>;
    /// Last `limit` messages of a session, oldest first
    async fn get_history(
        &self,
        session_id: i64,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StorageError>;

    /// Registers a pending invoice
    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment, StorageError>;
    /// All invoices still waiting for payment
    async fn pending_payments(&self) -> Result<Vec<Payment>, StorageError>;
    /// Compare-and-set of the payment status.
    /// Returns true only if this call moved the row from `from` to `to`.
    async fn transition_payment(
        &self,
        payment_id: i64,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> Result<bool, StorageError>;
    /// Moves a pending payment to `succeeded` and writes the paid subscription
    /// with zeroed usage in the same transaction.
    /// Returns false and writes nothing if the payment is no longer pending.
    async fn settle_payment(
        &self,
        payment_id: i64,
        subscription: Subscription,
    ) -> Result<bool, StorageError>;

    /// Aggregates for the admin panel
    async fn stats(&self, now: DateTime<Utc>) -> Result<Stats, StorageError>;
    /// Checks that the backend answers
    async fn check_connection(&self) -> Result<(), StorageError>;
}

/// Keeps the newest messages whose combined length fits into `max_chars`.
///
/// Order is preserved. Length is counted in characters.
#[must_use]
pub fn trim_history(messages: Vec<StoredMessage>, max_chars: usize) -> Vec<StoredMessage> {
    let mut total = 0usize;
    let mut keep_from = messages.len();
    for (idx, msg) in messages.iter().enumerate().rev() {
        let len = msg.content.chars().count();
        if total + len > max_chars {
            break;
        }
        total += len;
        keep_from = idx;
    }
    messages.into_iter().skip(keep_from).collect()
}

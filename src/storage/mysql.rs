use super::{
    referral_code_for, ChatSession, NewPayment, NewUser, Payment, Stats, StorageError,
    StorageProvider, StoredMessage, Subscription, Usage, UsageKind, User,
};
use crate::domain::{Mode, PaymentStatus};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::mysql::{MySqlConnection, MySqlPool, MySqlPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{error, info};

const MAX_CONNECTIONS: u32 = 10;
const ACQUIRE_TIMEOUT_SECS: u64 = 10;

#[derive(FromRow)]
struct UserRow {
    id: i64,
    username: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    created_at: NaiveDateTime,
    is_blocked: bool,
    referral_code: String,
    referred_by: Option<i64>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            username: row.username,
            first_name: row.first_name,
            last_name: row.last_name,
            created_at: row.created_at.and_utc(),
            is_blocked: row.is_blocked,
            referral_code: row.referral_code,
            referred_by: row.referred_by,
        }
    }
}

#[derive(FromRow)]
struct SubscriptionRow {
    user_id: i64,
    plan_code: Option<String>,
    expires_at: Option<NaiveDateTime>,
    is_trial: bool,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            user_id: row.user_id,
            plan_code: row.plan_code,
            expires_at: row.expires_at.map(|t| t.and_utc()),
            is_trial: row.is_trial,
        }
    }
}

#[derive(FromRow)]
struct UsageRow {
    user_id: i64,
    used_requests: u32,
    used_images: u32,
}

#[derive(FromRow)]
struct ChatSessionRow {
    id: i64,
    user_id: i64,
    title: String,
    mode: String,
    created_at: NaiveDateTime,
    is_active: bool,
}

impl TryFrom<ChatSessionRow> for ChatSession {
    type Error = StorageError;

    fn try_from(row: ChatSessionRow) -> Result<Self, Self::Error> {
        let mode: Mode = row
            .mode
            .parse()
            .map_err(|e| StorageError::Corrupted(format!("chat session {}: {e}", row.id)))?;
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            mode,
            created_at: row.created_at.and_utc(),
            is_active: row.is_active,
        })
    }
}

#[derive(FromRow)]
struct MessageRow {
    id: i64,
    session_id: i64,
    role: String,
    content: String,
    created_at: NaiveDateTime,
}

#[derive(FromRow)]
struct PaymentRow {
    id: i64,
    user_id: i64,
    provider: String,
    provider_payment_id: String,
    plan_code: String,
    amount_rub: u32,
    status: String,
    created_at: NaiveDateTime,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = StorageError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let status: PaymentStatus = row
            .status
            .parse()
            .map_err(|e| StorageError::Corrupted(format!("payment {}: {e}", row.id)))?;
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            provider: row.provider,
            provider_payment_id: row.provider_payment_id,
            plan_code: row.plan_code,
            amount_rub: row.amount_rub,
            status,
            created_at: row.created_at.and_utc(),
        })
    }
}

const USER_COLUMNS: &str =
    "id, username, first_name, last_name, created_at, is_blocked, referral_code, referred_by";
const SESSION_COLUMNS: &str = "id, user_id, title, mode, created_at, is_active";
const PAYMENT_COLUMNS: &str =
    "id, user_id, provider, provider_payment_id, plan_code, amount_rub, status, created_at";

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn to_id(value: u64) -> Result<i64, StorageError> {
    i64::try_from(value).map_err(|_| StorageError::Corrupted(format!("id out of range: {value}")))
}

const fn usage_column(kind: UsageKind) -> &'static str {
    match kind {
        UsageKind::Request => "used_requests",
        UsageKind::Image => "used_images",
    }
}

/// Upserts the subscription row, optionally zeroing usage
async fn write_subscription(
    conn: &mut MySqlConnection,
    subscription: &Subscription,
    reset_usage: bool,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO user_subscriptions (user_id, plan_code, expires_at, is_trial) \
         VALUES (?, ?, ?, ?) \
         ON DUPLICATE KEY UPDATE plan_code = VALUES(plan_code), \
         expires_at = VALUES(expires_at), is_trial = VALUES(is_trial)",
    )
    .bind(subscription.user_id)
    .bind(&subscription.plan_code)
    .bind(subscription.expires_at.map(|t| t.naive_utc()))
    .bind(subscription.is_trial)
    .execute(&mut *conn)
    .await?;

    if reset_usage {
        sqlx::query(
            "INSERT INTO `usage` (user_id, used_requests, used_images) VALUES (?, 0, 0) \
             ON DUPLICATE KEY UPDATE used_requests = 0, used_images = 0",
        )
        .bind(subscription.user_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// MariaDB / MySQL storage backed by an sqlx connection pool
pub struct MySqlStorage {
    pool: MySqlPool,
}

impl MySqlStorage {
    /// Connects to the database and applies pending migrations
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Database` if the connection fails, or
    /// `StorageError::Migration` if the schema cannot be migrated.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database migrations applied.");

        Ok(Self { pool })
    }

    /// Wraps an existing pool without running migrations
    #[must_use]
    pub const fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    async fn fetch_user(&self, user_id: i64) -> Result<Option<User>, StorageError> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(User::from))
    }

    /// Increments one counter in a single statement while it is below `limit`
    async fn bump_usage(
        &self,
        user_id: i64,
        kind: UsageKind,
        limit: Option<u32>,
    ) -> Result<bool, StorageError> {
        let column = usage_column(kind);
        let affected = sqlx::query(&format!(
            "UPDATE `usage` SET {column} = {column} + 1 \
             WHERE user_id = ? AND (? IS NULL OR {column} < ?)"
        ))
        .bind(user_id)
        .bind(limit)
        .bind(limit)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    async fn count(&self, sql: &str) -> Result<u64, StorageError> {
        let value: i64 = sqlx::query_scalar(sql).fetch_one(&self.pool).await?;
        Ok(to_count(value))
    }
}

#[async_trait]
impl StorageProvider for MySqlStorage {
    async fn get_user(&self, user_id: i64) -> Result<Option<User>, StorageError> {
        self.fetch_user(user_id).await
    }

    async fn find_user_by_referral_code(
        &self,
        code: &str,
    ) -> Result<Option<User>, StorageError> {
        let row: Option<UserRow> = sqlx::query_as(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE referral_code = ?"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    async fn create_user_with_trial(
        &self,
        user: NewUser,
        trial_expires_at: DateTime<Utc>,
    ) -> Result<User, StorageError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT IGNORE INTO users (id, username, first_name, last_name, referral_code, referred_by) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(referral_code_for(user.id))
        .bind(user.referred_by)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            sqlx::query(
                "INSERT INTO user_subscriptions (user_id, plan_code, expires_at, is_trial) \
                 VALUES (?, NULL, ?, TRUE)",
            )
            .bind(user.id)
            .bind(trial_expires_at.naive_utc())
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO `usage` (user_id, used_requests, used_images) VALUES (?, 0, 0)")
                .bind(user.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        self.fetch_user(user.id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("user {}", user.id)))
    }

    async fn set_user_blocked(&self, user_id: i64, blocked: bool) -> Result<bool, StorageError> {
        if self.fetch_user(user_id).await?.is_none() {
            return Ok(false);
        }
        sqlx::query("UPDATE users SET is_blocked = ? WHERE id = ?")
            .bind(blocked)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    async fn count_users(&self) -> Result<u64, StorageError> {
        self.count("SELECT COUNT(*) FROM users").await
    }

    async fn list_user_ids(&self) -> Result<Vec<i64>, StorageError> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM users WHERE is_blocked = FALSE ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    async fn get_subscription(&self, user_id: i64) -> Result<Option<Subscription>, StorageError> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            "SELECT user_id, plan_code, expires_at, is_trial FROM user_subscriptions WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Subscription::from))
    }

    async fn get_usage(&self, user_id: i64) -> Result<Option<Usage>, StorageError> {
        let row: Option<UsageRow> =
            sqlx::query_as("SELECT user_id, used_requests, used_images FROM `usage` WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| Usage {
            user_id: r.user_id,
            used_requests: r.used_requests,
            used_images: r.used_images,
        }))
    }

    async fn put_subscription(
        &self,
        subscription: Subscription,
        reset_usage: bool,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        write_subscription(&mut tx, &subscription, reset_usage).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reserve_usage(
        &self,
        user_id: i64,
        kind: UsageKind,
        limit: Option<u32>,
    ) -> Result<bool, StorageError> {
        if self.bump_usage(user_id, kind, limit).await? {
            return Ok(true);
        }
        // Limit reached, or no usage row yet
        sqlx::query(
            "INSERT IGNORE INTO `usage` (user_id, used_requests, used_images) VALUES (?, 0, 0)",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        self.bump_usage(user_id, kind, limit).await
    }

    async fn release_usage(&self, user_id: i64, kind: UsageKind) -> Result<(), StorageError> {
        let column = usage_column(kind);
        sqlx::query(&format!(
            "UPDATE `usage` SET {column} = {column} - 1 WHERE user_id = ? AND {column} > 0"
        ))
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_chat_session(
        &self,
        user_id: i64,
        title: &str,
        mode: Mode,
    ) -> Result<ChatSession, StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE chat_sessions SET is_active = FALSE WHERE user_id = ? AND is_active = TRUE")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        let id = sqlx::query(
            "INSERT INTO chat_sessions (user_id, title, mode, is_active) VALUES (?, ?, ?, TRUE)",
        )
        .bind(user_id)
        .bind(title)
        .bind(mode.as_str())
        .execute(&mut *tx)
        .await?
        .last_insert_id();

        let row: ChatSessionRow =
            sqlx::query_as(&format!("SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE id = ?"))
                .bind(to_id(id)?)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn active_chat_session(&self, user_id: i64) -> Result<Option<ChatSession>, StorageError> {
        let row: Option<ChatSessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions \
             WHERE user_id = ? AND is_active = TRUE ORDER BY id DESC LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ChatSession::try_from).transpose()
    }

    async fn list_chat_sessions(
        &self,
        user_id: i64,
        limit: u32,
    ) -> Result<Vec<ChatSession>, StorageError> {
        let rows: Vec<ChatSessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE user_id = ? ORDER BY id DESC LIMIT ?"
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ChatSession::try_from).collect()
    }

    async fn activate_chat_session(
        &self,
        user_id: i64,
        session_id: i64,
    ) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;

        let owned: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chat_sessions WHERE id = ? AND user_id = ?")
                .bind(session_id)
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;
        if owned == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE chat_sessions SET is_active = (id = ?) WHERE user_id = ?")
            .bind(session_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn store_message(
        &self,
        session_id: i64,
        role: &str,
        content: &str,
    ) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO messages (session_id, role, content) VALUES (?, ?, ?)")
            .bind(session_id)
            .bind(role)
            .bind(content)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_history(
        &self,
        session_id: i64,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, session_id, role, content, created_at FROM messages \
             WHERE session_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .rev()
            .map(|r| StoredMessage {
                id: r.id,
                session_id: r.session_id,
                role: r.role,
                content: r.content,
                created_at: r.created_at.and_utc(),
            })
            .collect())
    }

    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment, StorageError> {
        let id = sqlx::query(
            "INSERT INTO payments (user_id, provider, provider_payment_id, plan_code, amount_rub, status) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(payment.user_id)
        .bind(&payment.provider)
        .bind(&payment.provider_payment_id)
        .bind(&payment.plan_code)
        .bind(payment.amount_rub)
        .bind(PaymentStatus::Pending.as_str())
        .execute(&self.pool)
        .await?
        .last_insert_id();

        let row: PaymentRow =
            sqlx::query_as(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?"))
                .bind(to_id(id)?)
                .fetch_one(&self.pool)
                .await?;
        row.try_into()
    }

    async fn pending_payments(&self) -> Result<Vec<Payment>, StorageError> {
        let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE status = ? ORDER BY id"
        ))
        .bind(PaymentStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Payment::try_from).collect()
    }

    async fn transition_payment(
        &self,
        payment_id: i64,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> Result<bool, StorageError> {
        let affected = sqlx::query("UPDATE payments SET status = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(payment_id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected == 1)
    }

    async fn settle_payment(
        &self,
        payment_id: i64,
        subscription: Subscription,
    ) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query("UPDATE payments SET status = ? WHERE id = ? AND status = ?")
            .bind(PaymentStatus::Succeeded.as_str())
            .bind(payment_id)
            .bind(PaymentStatus::Pending.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if affected != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        write_subscription(&mut tx, &subscription, true).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<Stats, StorageError> {
        let now = now.naive_utc();

        let active: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM user_subscriptions WHERE expires_at > ?")
                .bind(now)
                .fetch_one(&self.pool)
                .await?;
        let paid: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM user_subscriptions WHERE expires_at > ? AND is_trial = FALSE",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        let revenue: i64 = sqlx::query_scalar(
            "SELECT CAST(COALESCE(SUM(amount_rub), 0) AS SIGNED) FROM payments WHERE status = 'succeeded'",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(Stats {
            users: self.count("SELECT COUNT(*) FROM users").await?,
            blocked_users: self
                .count("SELECT COUNT(*) FROM users WHERE is_blocked = TRUE")
                .await?,
            active_subscriptions: to_count(active),
            paid_subscriptions: to_count(paid),
            pending_payments: self
                .count("SELECT COUNT(*) FROM payments WHERE status = 'pending'")
                .await?,
            succeeded_payments: self
                .count("SELECT COUNT(*) FROM payments WHERE status = 'succeeded'")
                .await?,
            revenue_rub: to_count(revenue),
        })
    }

    async fn check_connection(&self) -> Result<(), StorageError> {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => {
                info!("Database connection check passed.");
                Ok(())
            }
            Err(e) => {
                error!("Database connection check failed: {}", e);
                Err(e.into())
            }
        }
    }
}

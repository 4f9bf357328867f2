use super::views::{activated_keyboard, payment_failed_text, subscription_activated_text};
use crate::config::Settings;
use crate::services::Notifier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tracing::{error, info};

/// Delivers payment outcomes to users through the bot
pub struct TelegramNotifier {
    bot: Bot,
    settings: Arc<Settings>,
}

impl TelegramNotifier {
    #[must_use]
    pub const fn new(bot: Bot, settings: Arc<Settings>) -> Self {
        Self { bot, settings }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn subscription_activated(&self, user_id: i64, plan_title: &str, expires_at: DateTime<Utc>) {
        let text = subscription_activated_text(plan_title, expires_at, &self.settings);
        let sent = crate::utils::retry_telegram_operation(|| async {
            self.bot
                .send_message(ChatId(user_id), text.clone())
                .parse_mode(ParseMode::Html)
                .reply_markup(activated_keyboard())
                .await
                .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
        })
        .await;

        match sent {
            Ok(_) => info!(user_id, plan = plan_title, "Activation notice sent"),
            Err(e) => error!(user_id, "Failed to send activation notice: {e}"),
        }
    }

    async fn payment_failed(&self, user_id: i64, reason: &str) {
        if let Err(e) = super::resilient::send_message_resilient(
            &self.bot,
            ChatId(user_id),
            payment_failed_text(reason),
            None,
        )
        .await
        {
            error!(user_id, "Failed to send payment failure notice: {e}");
        }
    }
}

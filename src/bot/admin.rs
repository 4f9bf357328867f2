//! Admin commands: statistics, blocking, payment checks and broadcasts.

use super::context::{get_user_id_safe, AppContext};
use super::handlers::BotDialogue;
use super::resilient::send_message_resilient;
use super::state::State;
use super::views::{admin_keyboard, broadcast_report, stats_text, ADMIN_PANEL, BROADCAST_CANCEL};
use crate::config::BROADCAST_DELAY_MS;
use crate::payments::CheckReport;
use anyhow::Result;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tracing::{debug, error, info, warn};

/// Sends the admin menu
///
/// # Errors
///
/// Returns an error if the message cannot be sent.
pub async fn show_admin_panel(bot: &Bot, chat_id: ChatId) -> Result<()> {
    bot.send_message(chat_id, ADMIN_PANEL)
        .parse_mode(ParseMode::Html)
        .reply_markup(admin_keyboard())
        .await?;
    Ok(())
}

/// Sends aggregated statistics
///
/// # Errors
///
/// Returns an error if storage or the Telegram API fails.
pub async fn show_stats(bot: &Bot, chat_id: ChatId, ctx: &AppContext) -> Result<()> {
    let stats = ctx.store.stats(Utc::now()).await?;
    send_message_resilient(bot, chat_id, stats_text(&stats), Some(ParseMode::Html)).await?;
    Ok(())
}

/// User management hint with the current user count
///
/// # Errors
///
/// Returns an error if users cannot be counted.
pub async fn users_text(ctx: &AppContext) -> Result<String> {
    let users = ctx.store.count_users().await?;
    Ok(format!(
        "👤 <b>Пользователи</b>\n\nВсего: {users}\n\n\
         Заблокировать: /block &lt;id&gt;\nРазблокировать: /unblock &lt;id&gt;"
    ))
}

/// Parses the argument of `/block` and `/unblock`
#[must_use]
pub fn parse_user_id(arg: &str) -> Option<i64> {
    arg.trim().parse::<i64>().ok().filter(|id| *id > 0)
}

/// Blocks or unblocks a user by Telegram ID
///
/// # Errors
///
/// Returns an error if storage or the Telegram API fails.
pub async fn set_blocked(
    bot: &Bot,
    chat_id: ChatId,
    ctx: &AppContext,
    arg: &str,
    blocked: bool,
) -> Result<()> {
    let command = if blocked { "block" } else { "unblock" };
    let Some(user_id) = parse_user_id(arg) else {
        send_message_resilient(bot, chat_id, format!("Использование: /{command} <id>"), None)
            .await?;
        return Ok(());
    };

    let reply = if ctx.store.set_user_blocked(user_id, blocked).await? {
        info!(user_id, blocked, "User block flag changed");
        if blocked {
            format!("⛔️ Пользователь {user_id} заблокирован.")
        } else {
            ctx.blocked_notices.forget(user_id).await;
            format!("✅ Пользователь {user_id} разблокирован.")
        }
    } else {
        format!("Пользователь {user_id} не найден.")
    };
    send_message_resilient(bot, chat_id, reply, None).await?;
    Ok(())
}

/// Summary of a manual payment check
#[must_use]
pub fn check_report_text(report: &CheckReport) -> String {
    format!(
        "💳 Проверка платежей завершена.\n\
         Проверено: {}\nАктивировано: {}\nОтменено: {}\nОшибок: {}",
        report.checked, report.activated, report.failed, report.errors
    )
}

/// Runs one pass of the payment monitor on demand
///
/// # Errors
///
/// Returns an error if the report cannot be sent.
pub async fn check_payments(bot: &Bot, chat_id: ChatId, ctx: &AppContext) -> Result<()> {
    let text = match ctx.monitor.check_pending().await {
        Ok(report) => check_report_text(&report),
        Err(e) => {
            error!("Manual payment check failed: {e}");
            "❗ Не удалось проверить платежи. Смотрите логи.".to_string()
        }
    };
    send_message_resilient(bot, chat_id, text, None).await?;
    Ok(())
}

/// Waits for the broadcast text
///
/// # Errors
///
/// Returns an error if the dialogue or the Telegram API fails.
pub async fn begin_broadcast(bot: &Bot, chat_id: ChatId, dialogue: &BotDialogue) -> Result<()> {
    dialogue.update(State::AwaitingBroadcast).await?;
    send_message_resilient(
        bot,
        chat_id,
        format!("📣 Отправьте текст рассылки одним сообщением или «{BROADCAST_CANCEL}»."),
        None,
    )
    .await?;
    Ok(())
}

/// Handles the text sent while a broadcast is awaited
///
/// # Errors
///
/// Returns an error if storage, the dialogue or the Telegram API fails.
pub async fn handle_broadcast_text(
    bot: Bot,
    msg: Message,
    dialogue: BotDialogue,
    ctx: Arc<AppContext>,
) -> Result<()> {
    let admin_id = get_user_id_safe(&msg);
    dialogue.update(State::Start).await?;

    if !ctx.is_admin(admin_id) {
        warn!(user_id = admin_id, "Broadcast text from non-admin ignored");
        return Ok(());
    }
    let Some(text) = msg.text().map(str::trim).filter(|t| !t.is_empty()) else {
        send_message_resilient(&bot, msg.chat.id, "Рассылка отменена: нужен текст.", None).await?;
        return Ok(());
    };
    if text == BROADCAST_CANCEL {
        send_message_resilient(&bot, msg.chat.id, "Рассылка отменена.", None).await?;
        return Ok(());
    }

    let user_ids = ctx.store.list_user_ids().await?;
    info!(admin_id, recipients = user_ids.len(), "Broadcast started");
    send_message_resilient(
        &bot,
        msg.chat.id,
        format!("📣 Рассылка запущена для {} пользователей.", user_ids.len()),
        None,
    )
    .await?;

    let text = text.to_string();
    let report_chat = msg.chat.id;
    tokio::spawn(async move {
        let (delivered, failed) = broadcast_to(
            &user_ids,
            Duration::from_millis(BROADCAST_DELAY_MS),
            |user_id| {
                let bot = bot.clone();
                let text = text.clone();
                async move {
                    bot.send_message(ChatId(user_id), text).await?;
                    Ok::<(), anyhow::Error>(())
                }
            },
        )
        .await;
        info!(admin_id, delivered, failed, "Broadcast finished");
        if let Err(e) =
            send_message_resilient(&bot, report_chat, broadcast_report(delivered, failed), None)
                .await
        {
            error!(admin_id, "Failed to send broadcast report: {e}");
        }
    });
    Ok(())
}

/// Sends to every user in order, pausing `delay` between messages.
/// Returns the delivered and failed counts.
pub async fn broadcast_to<F, Fut>(user_ids: &[i64], delay: Duration, mut send: F) -> (usize, usize)
where
    F: FnMut(i64) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut delivered = 0;
    let mut failed = 0;
    for (idx, &user_id) in user_ids.iter().enumerate() {
        if idx > 0 {
            tokio::time::sleep(delay).await;
        }
        match send(user_id).await {
            Ok(()) => delivered += 1,
            Err(e) => {
                failed += 1;
                debug!(user_id, "Broadcast delivery failed: {e}");
            }
        }
    }
    (delivered, failed)
}

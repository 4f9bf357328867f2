//! Telegram calls with automatic retry on transient failures.
//!
//! Sends go through [`crate::utils::retry_telegram_operation`]; edits degrade
//! gracefully because a failed progress edit must never abort a job.

use super::messaging::TELEGRAM_MESSAGE_LIMIT;
use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InputFile, Message, MessageId, ParseMode};
use tracing::{debug, warn};

const ERROR_NOT_MODIFIED: &str = "message is not modified";
const ERROR_NOT_FOUND: &str = "message to edit not found";

/// Send a message, retrying on network failures.
///
/// # Errors
///
/// Returns the last error once every retry is exhausted.
pub async fn send_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    text: impl Into<String>,
    parse_mode: Option<ParseMode>,
) -> Result<Message> {
    let text = text.into();
    crate::utils::retry_telegram_operation(|| async {
        let mut req = bot.send_message(chat_id, text.clone());
        if let Some(pm) = parse_mode {
            req = req.parse_mode(pm);
        }
        req.await
            .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
    })
    .await
}

/// Send an encoded picture, retrying on network failures.
///
/// # Errors
///
/// Returns the last error once every retry is exhausted.
pub async fn send_photo_resilient(
    bot: &Bot,
    chat_id: ChatId,
    bytes: Vec<u8>,
    file_name: &str,
    caption: &str,
) -> Result<Message> {
    crate::utils::retry_telegram_operation(|| async {
        let photo = InputFile::memory(bytes.clone()).file_name(file_name.to_string());
        bot.send_photo(chat_id, photo)
            .caption(caption)
            .await
            .map_err(|e| anyhow::anyhow!("Telegram photo error: {e}"))
    })
    .await
}

/// Edit a message, retrying on network failures.
///
/// # Errors
///
/// Returns the last error once every retry is exhausted.
pub async fn edit_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    text: impl Into<String>,
    parse_mode: Option<ParseMode>,
) -> Result<Message> {
    let text = text.into();
    crate::utils::retry_telegram_operation(|| async {
        let mut req = bot.edit_message_text(chat_id, msg_id, text.clone());
        if let Some(pm) = parse_mode {
            req = req.parse_mode(pm);
        }
        req.await
            .map_err(|e| anyhow::anyhow!("Telegram edit error: {e}"))
    })
    .await
}

/// Shortens text that does not fit into one message
fn fit_for_edit(text: &str) -> String {
    if text.chars().count() > TELEGRAM_MESSAGE_LIMIT {
        let truncated = crate::utils::truncate_str(text, TELEGRAM_MESSAGE_LIMIT);
        format!("{truncated}…")
    } else {
        text.to_string()
    }
}

/// Edit a message with graceful degradation.
///
/// Oversized text is truncated. "Not modified" and "not found" answers are
/// expected while streaming and only logged at debug level.
///
/// Returns true if the message was edited.
pub async fn edit_message_safe_resilient(
    bot: &Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    text: &str,
    parse_mode: Option<ParseMode>,
) -> bool {
    match edit_message_resilient(bot, chat_id, msg_id, fit_for_edit(text), parse_mode).await {
        Ok(_) => true,
        Err(e) => {
            let err_msg = e.to_string();
            if err_msg.contains(ERROR_NOT_MODIFIED) || err_msg.contains(ERROR_NOT_FOUND) {
                debug!("Message update skipped: {err_msg}");
            } else {
                warn!("Failed to edit message after retries: {e}");
            }
            false
        }
    }
}

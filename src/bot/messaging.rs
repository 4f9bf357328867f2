//! Delivery of long, formatted model answers.

use super::resilient::{edit_message_safe_resilient, send_message_resilient};
use crate::utils;
use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{ChatId, MessageId, ParseMode};

/// Maximum message length for Telegram with safety margin.
/// The official limit is 4096; formatting tags need some room.
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4000;

/// Splits raw Markdown and converts every part to Telegram HTML.
///
/// Splitting happens first so that code fences are closed per part.
#[must_use]
pub fn format_parts(text: &str) -> Vec<String> {
    utils::split_long_message(text, TELEGRAM_MESSAGE_LIMIT)
        .iter()
        .map(|part| utils::format_text(part))
        .collect()
}

/// Sends a long message by splitting it into several HTML messages.
///
/// # Errors
///
/// Returns an error if any part fails to send after retries.
pub async fn send_long_message(bot: &Bot, chat_id: ChatId, text: &str) -> Result<()> {
    for part in format_parts(text) {
        send_message_resilient(bot, chat_id, part, Some(ParseMode::Html)).await?;
    }
    Ok(())
}

/// Replaces a placeholder with the final answer.
///
/// The first part is written into the placeholder, the rest is sent as new
/// messages. If the placeholder cannot be edited, every part is sent.
///
/// # Errors
///
/// Returns an error if a new message fails to send after retries.
pub async fn finish_answer(
    bot: &Bot,
    chat_id: ChatId,
    placeholder: MessageId,
    text: &str,
) -> Result<()> {
    let mut parts = format_parts(text).into_iter();
    if let Some(first) = parts.next() {
        if !edit_message_safe_resilient(bot, chat_id, placeholder, &first, Some(ParseMode::Html))
            .await
        {
            send_message_resilient(bot, chat_id, first, Some(ParseMode::Html)).await?;
        }
    }
    for part in parts {
        send_message_resilient(bot, chat_id, part, Some(ParseMode::Html)).await?;
    }
    Ok(())
}

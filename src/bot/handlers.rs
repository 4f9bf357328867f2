//! Commands, panels and inline button callbacks.

use super::admin;
use super::callbacks::{AdminAction, CallbackAction, Panel};
use super::commands::Command;
use super::context::{get_user_id_safe, profile_of, AppContext};
use super::resilient::send_message_resilient;
use super::state::State;
use super::views::{
    admin_keyboard, back_keyboard, buy_keyboard, chat_list_keyboard, chat_list_text, help_text,
    invoice_text, mode_switched_text, modes_keyboard, referral_keyboard, referral_link,
    referral_text, render_status, subscriptions_keyboard, subscriptions_text,
    top_panel_keyboard, ACCESS_RESTRICTED, ADMIN_PANEL, CHAT_LIST_SIZE, COMMANDS_HELP,
};
use crate::domain::Mode;
use crate::services::{create_purchase, ensure_user, is_active, PurchaseError, NEW_CHAT_TITLE};
use crate::storage::User;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardMarkup, Me, MessageId, ParseMode};
use tracing::{info, warn};

/// Type alias for dialogue
pub type BotDialogue = Dialogue<State, InMemStorage<State>>;

/// Reply to admin commands from regular users
pub const ADMIN_ONLY: &str = "🚫 У вас нет доступа к админ-панели.";

const CHAT_CREATED: &str = "✅ Создан новый чат. Теперь можно отправлять сообщения.";

/// Registers the sender on first contact and returns the stored user.
///
/// # Errors
///
/// Returns an error if the message has no sender or storage fails.
pub async fn register_sender(
    ctx: &AppContext,
    msg: &Message,
    referral_code: Option<&str>,
) -> Result<User> {
    let from = msg
        .from
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("Message without sender"))?;
    let user = ensure_user(
        ctx.store.as_ref(),
        &ctx.settings,
        profile_of(from),
        referral_code,
        Utc::now(),
    )
    .await?;
    Ok(user)
}

async fn status_panel(ctx: &AppContext, user_id: i64) -> Result<String> {
    let sub = ctx.store.get_subscription(user_id).await?;
    let usage = ctx.store.get_usage(user_id).await?;
    Ok(render_status(
        sub.as_ref(),
        usage.as_ref(),
        &ctx.settings,
        Utc::now(),
    ))
}

async fn send_panel(
    bot: &Bot,
    chat_id: ChatId,
    text: String,
    keyboard: InlineKeyboardMarkup,
) -> Result<()> {
    bot.send_message(chat_id, text)
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboard)
        .await?;
    Ok(())
}

/// Replaces the panel under a button, sending a new one if the edit fails
async fn edit_panel(
    bot: &Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    text: String,
    keyboard: InlineKeyboardMarkup,
) -> Result<()> {
    let edited = bot
        .edit_message_text(chat_id, msg_id, text.clone())
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboard.clone())
        .await;
    if let Err(e) = edited {
        warn!(chat_id = chat_id.0, "Panel edit failed, sending a new one: {e}");
        send_panel(bot, chat_id, text, keyboard).await?;
    }
    Ok(())
}

/// `/start [referral code]`: registers the user and shows the subscription panel
async fn start(
    bot: &Bot,
    msg: &Message,
    me: &Me,
    dialogue: &BotDialogue,
    ctx: &AppContext,
    referral_code: &str,
) -> Result<()> {
    let referral = Some(referral_code.trim()).filter(|c| !c.is_empty());
    let user = register_sender(ctx, msg, referral).await?;
    dialogue.update(State::Start).await?;

    let status = status_panel(ctx, user.id).await?;
    send_panel(
        bot,
        msg.chat.id,
        status,
        top_panel_keyboard(me.username(), &user.referral_code),
    )
    .await
}

async fn show_subscription_panel(
    bot: &Bot,
    msg: &Message,
    me: &Me,
    ctx: &AppContext,
) -> Result<()> {
    let user = register_sender(ctx, msg, None).await?;
    let status = status_panel(ctx, user.id).await?;
    send_panel(
        bot,
        msg.chat.id,
        status,
        top_panel_keyboard(me.username(), &user.referral_code),
    )
    .await
}

/// Opens a fresh assistant session
async fn open_new_chat(ctx: &AppContext, user_id: i64) -> Result<()> {
    let session = ctx
        .store
        .create_chat_session(user_id, NEW_CHAT_TITLE, Mode::Assistant)
        .await?;
    info!(user_id, session_id = session.id, "New chat created");
    Ok(())
}

/// Handles bot commands
///
/// # Errors
///
/// Returns an error if storage or the Telegram API fails.
pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    me: Me,
    dialogue: BotDialogue,
    ctx: Arc<AppContext>,
) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    let chat_id = msg.chat.id;

    if cmd.is_admin_only() && !ctx.is_admin(user_id) {
        warn!(user_id, command = ?cmd, "Admin command from non-admin");
        send_message_resilient(&bot, chat_id, ADMIN_ONLY, None).await?;
        return Ok(());
    }

    match cmd {
        Command::Start(code) => start(&bot, &msg, &me, &dialogue, &ctx, &code).await?,
        Command::Mode => {
            bot.send_message(chat_id, "Выберите режим:")
                .reply_markup(modes_keyboard())
                .await?;
        }
        Command::Subscription => show_subscription_panel(&bot, &msg, &me, &ctx).await?,
        Command::Help => {
            send_panel(
                &bot,
                chat_id,
                COMMANDS_HELP.to_string(),
                back_keyboard("⬅️ Главное меню"),
            )
            .await?;
        }
        Command::New => {
            register_sender(&ctx, &msg, None).await?;
            open_new_chat(&ctx, user_id).await?;
            send_message_resilient(&bot, chat_id, CHAT_CREATED, None).await?;
        }
        Command::Admin => admin::show_admin_panel(&bot, chat_id).await?,
        Command::CheckPayments => admin::check_payments(&bot, chat_id, &ctx).await?,
        Command::Block(arg) => admin::set_blocked(&bot, chat_id, &ctx, &arg, true).await?,
        Command::Unblock(arg) => admin::set_blocked(&bot, chat_id, &ctx, &arg, false).await?,
        Command::Stats => admin::show_stats(&bot, chat_id, &ctx).await?,
    }
    Ok(())
}

/// Where a button was pressed
struct Pressed<'a> {
    bot: &'a Bot,
    query: &'a CallbackQuery,
    chat_id: ChatId,
    msg_id: MessageId,
    user: User,
}

impl Pressed<'_> {
    async fn answer(&self, text: Option<&str>) -> Result<()> {
        let mut req = self.bot.answer_callback_query(self.query.id.clone());
        if let Some(text) = text {
            req = req.text(text);
        }
        req.await?;
        Ok(())
    }

    async fn edit(&self, text: String, keyboard: InlineKeyboardMarkup) -> Result<()> {
        edit_panel(self.bot, self.chat_id, self.msg_id, text, keyboard).await
    }

    async fn say(&self, text: &str) -> Result<()> {
        send_message_resilient(self.bot, self.chat_id, text, Some(ParseMode::Html)).await?;
        Ok(())
    }
}

/// Handles inline button presses
///
/// # Errors
///
/// Returns an error if storage or the Telegram API fails.
pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    me: Me,
    dialogues: Arc<InMemStorage<State>>,
    ctx: Arc<AppContext>,
) -> Result<()> {
    let action = match q.data.as_deref().map(str::parse::<CallbackAction>) {
        Some(Ok(action)) => action,
        other => {
            warn!(data = ?q.data, error = ?other.and_then(Result::err), "Unknown callback");
            bot.answer_callback_query(q.id.clone())
                .text("Неизвестная команда")
                .await?;
            return Ok(());
        }
    };
    let Some((chat_id, msg_id)) = q.message.as_ref().map(|m| (m.chat().id, m.id())) else {
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    };

    let user_id = q.from.id.0.cast_signed();
    if ctx.is_blocked(user_id).await {
        bot.answer_callback_query(q.id.clone())
            .text("⛔️ Доступ запрещён")
            .await?;
        return Ok(());
    }
    let user = ensure_user(
        ctx.store.as_ref(),
        &ctx.settings,
        profile_of(&q.from),
        None,
        Utc::now(),
    )
    .await?;

    let pressed = Pressed {
        bot: &bot,
        query: &q,
        chat_id,
        msg_id,
        user,
    };
    info!(user_id, action = %action, "Callback");

    match action {
        CallbackAction::Panel(panel) => show_panel(&pressed, panel, &me, &ctx).await,
        CallbackAction::SwitchMode(mode) => switch_mode(&pressed, mode, &ctx).await,
        CallbackAction::ShowSubscriptions => {
            pressed
                .edit(subscriptions_text(), subscriptions_keyboard())
                .await?;
            pressed.answer(None).await
        }
        CallbackAction::Buy(plan_code) => buy(&pressed, &plan_code, &ctx).await,
        CallbackAction::NewChat => {
            open_new_chat(&ctx, user_id).await?;
            pressed.say("Создан новый чат. Пишите сообщение.").await?;
            pressed.answer(None).await
        }
        CallbackAction::ListChats => list_chats(&pressed, &ctx).await,
        CallbackAction::ActivateChat(session_id) => {
            if ctx.store.activate_chat_session(user_id, session_id).await? {
                pressed
                    .say(&format!("✔️ Активирован чат #{session_id}"))
                    .await?;
                pressed.answer(None).await
            } else {
                pressed.answer(Some("Чат не найден")).await
            }
        }
        CallbackAction::Admin(action) => {
            let dialogue = BotDialogue::new(dialogues, chat_id);
            admin_action(&pressed, action, &dialogue, &ctx).await
        }
    }
}

async fn show_panel(pressed: &Pressed<'_>, panel: Panel, me: &Me, ctx: &AppContext) -> Result<()> {
    match panel {
        Panel::Main => {
            let status = status_panel(ctx, pressed.user.id).await?;
            let keyboard = top_panel_keyboard(me.username(), &pressed.user.referral_code);
            pressed.edit(status, keyboard).await?;
            pressed.answer(None).await
        }
        Panel::Mode => {
            pressed
                .edit("Выберите режим:".to_string(), modes_keyboard())
                .await?;
            pressed.answer(Some("Выберите режим")).await
        }
        Panel::Help => {
            let text = help_text(&ctx.settings.support_username);
            pressed.edit(text, back_keyboard("⬅️ Главное меню")).await?;
            pressed.answer(None).await
        }
        Panel::Referral => {
            let link = referral_link(me.username(), &pressed.user.referral_code);
            let text = referral_text(&link, &ctx.settings);
            pressed.edit(text, referral_keyboard(&link)).await?;
            pressed.answer(None).await
        }
        Panel::Admin => {
            if !ctx.is_admin(pressed.user.id) {
                return pressed.answer(Some(ADMIN_ONLY)).await;
            }
            pressed
                .edit(ADMIN_PANEL.to_string(), admin_keyboard())
                .await?;
            pressed.answer(None).await
        }
    }
}

/// Opens a session in `mode`, or offers plans when the subscription has expired
async fn switch_mode(pressed: &Pressed<'_>, mode: Mode, ctx: &AppContext) -> Result<()> {
    let user_id = pressed.user.id;
    let sub = ctx.store.get_subscription(user_id).await?;
    if !is_active(sub.as_ref(), Utc::now()) {
        info!(user_id, mode = %mode, "Mode switch without active subscription");
        pressed
            .edit(ACCESS_RESTRICTED.to_string(), InlineKeyboardMarkup::default())
            .await?;
        send_panel(
            pressed.bot,
            pressed.chat_id,
            subscriptions_text(),
            subscriptions_keyboard(),
        )
        .await?;
        return pressed.answer(None).await;
    }

    let session = ctx
        .store
        .create_chat_session(user_id, &mode.session_title(), mode)
        .await?;
    info!(user_id, mode = %mode, session_id = session.id, "Mode switched");
    pressed.say(&mode_switched_text(mode)).await?;
    pressed.answer(None).await
}

async fn buy(pressed: &Pressed<'_>, plan_code: &str, ctx: &AppContext) -> Result<()> {
    let purchase = create_purchase(
        ctx.store.as_ref(),
        ctx.payments.as_ref(),
        pressed.user.id,
        plan_code,
        Utc::now(),
    )
    .await;

    match purchase {
        Ok(purchase) => {
            send_panel(
                pressed.bot,
                pressed.chat_id,
                invoice_text(&purchase.change),
                buy_keyboard(&purchase.invoice.confirmation_url),
            )
            .await?;
            pressed.answer(None).await
        }
        Err(PurchaseError::UnknownPlan(code)) => {
            warn!(user_id = pressed.user.id, plan = %code, "Unknown plan requested");
            pressed.answer(Some("Неизвестный тариф")).await
        }
        Err(e) => {
            warn!(user_id = pressed.user.id, plan = plan_code, "Invoice creation failed: {e}");
            pressed
                .say("❗ Не удалось создать счёт. Попробуйте позже.")
                .await?;
            pressed.answer(None).await
        }
    }
}

async fn list_chats(pressed: &Pressed<'_>, ctx: &AppContext) -> Result<()> {
    let sessions = ctx
        .store
        .list_chat_sessions(pressed.user.id, CHAT_LIST_SIZE)
        .await?;
    let text = chat_list_text(&sessions);
    if sessions.is_empty() {
        pressed.say(&text).await?;
    } else {
        send_panel(
            pressed.bot,
            pressed.chat_id,
            text,
            chat_list_keyboard(sessions.first().map(|s| s.id)),
        )
        .await?;
    }
    pressed.answer(None).await
}

async fn admin_action(
    pressed: &Pressed<'_>,
    action: AdminAction,
    dialogue: &BotDialogue,
    ctx: &AppContext,
) -> Result<()> {
    if !ctx.is_admin(pressed.user.id) {
        return pressed.answer(Some(ADMIN_ONLY)).await;
    }
    match action {
        AdminAction::Users => {
            let text = admin::users_text(ctx).await?;
            pressed.say(&text).await?;
        }
        AdminAction::Broadcast => {
            admin::begin_broadcast(pressed.bot, pressed.chat_id, dialogue).await?;
        }
        AdminAction::Stats => admin::show_stats(pressed.bot, pressed.chat_id, ctx).await?,
    }
    pressed.answer(None).await
}

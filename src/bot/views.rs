//! Texts and inline keyboards shown to users.
//!
//! Everything here is pure, so panels can be tested without Telegram.

use super::callbacks::{AdminAction, CallbackAction, Panel};
use crate::config::{Plan, Settings, PLANS};
use crate::domain::Mode;
use crate::services::{is_active, limits_for, PlanChange};
use crate::storage::{ChatSession, Stats, Subscription, Usage};
use crate::utils::{format_days_hours, format_msk};
use chrono::{DateTime, Utc};
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

/// Blocks in the progress bar
pub const PROGRESS_BLOCKS: u32 = 9;

/// Number of chats listed in the chat panel
pub const CHAT_LIST_SIZE: u32 = 10;

/// Reply sent while a broadcast is awaited to cancel it
pub const BROADCAST_CANCEL: &str = "Отмена";

fn button(text: &str, action: &CallbackAction) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(text.to_string(), action.data())
}

/// Link button, or a button back to the main panel if `url` is malformed
fn url_button(text: &str, url: &str) -> InlineKeyboardButton {
    match reqwest::Url::parse(url) {
        Ok(url) => InlineKeyboardButton::url(text.to_string(), url),
        Err(_) => button(text, &CallbackAction::Panel(Panel::Main)),
    }
}

fn limit_or_infinity(used: u32, max: Option<u32>) -> String {
    max.map_or_else(|| "∞".to_string(), |max| format!("{used}/{max}"))
}

fn plan_limit(max: Option<u32>) -> String {
    max.map_or_else(|| "∞".to_string(), |max| max.to_string())
}

/// Button label of a mode
#[must_use]
pub const fn mode_label(mode: Mode) -> &'static str {
    match mode {
        Mode::Assistant => "💬 Ассистент",
        Mode::Image => "🎨 Генерация",
        Mode::Editor => "🛠 Редактор фото",
        Mode::AddPeople => "➕ Добавить людей",
        Mode::CelebritySelfie => "🤳 Селфи со звёздой",
    }
}

/// Link that opens the bot with a referral code
#[must_use]
pub fn referral_link(bot_username: &str, referral_code: &str) -> String {
    format!("https://t.me/{bot_username}?start={referral_code}")
}

/// Subscription panel: status, plan, expiry and limits
#[must_use]
pub fn render_status(
    sub: Option<&Subscription>,
    usage: Option<&Usage>,
    settings: &Settings,
    now: DateTime<Utc>,
) -> String {
    let active_sub = sub.filter(|s| is_active(Some(*s), now));
    let Some(active) = active_sub else {
        let plan_name = if sub.is_some_and(|s| s.is_trial) {
            "Пробный период истёк"
        } else {
            "Нет"
        };
        return format!(
            "<b>Подписка:</b> 🔴 Неактивна\n\
             <b>Тариф:</b> {plan_name}\n\
             <b>Действует до:</b> —\n\
             <b>Лимиты:</b> Запросы: 0 / Изображения: 0"
        );
    };

    let plan_name = if active.is_trial {
        "Trial".to_string()
    } else {
        let code = active.plan_code.as_deref().unwrap_or("trial");
        crate::config::find_plan(code).map_or_else(|| code.to_string(), |p| p.title.to_string())
    };
    let expires = active.expires_at.map_or_else(|| "—".to_string(), format_msk);
    let limits = limits_for(Some(active), settings);
    let used_requests = usage.map_or(0, |u| u.used_requests);
    let used_images = usage.map_or(0, |u| u.used_images);

    format!(
        "<b>Подписка:</b> 🟢 Активна\n\
         <b>Тариф:</b> {plan_name}\n\
         <b>Действует до:</b> {expires} МСК\n\
         <b>Лимиты:</b> Запросы: {}, Изобр.: {}",
        limit_or_infinity(used_requests, limits.max_requests),
        limit_or_infinity(used_images, limits.max_images),
    )
}

/// Short description of a plan
#[must_use]
pub fn format_plan_info(plan: &Plan) -> String {
    let requests = plan
        .max_requests
        .map_or_else(|| "Запросы: ∞".to_string(), |n| format!("Запросы: до {n}"));
    let images = plan
        .max_images
        .map_or_else(|| "Генерации: ∞".to_string(), |n| format!("Генерации: до {n}"));
    format!(
        "<b>{}</b>\nСтоимость: <b>{} ₽</b> / {} дней\n{requests} • {images} • Длина запроса: до {} символов",
        plan.title, plan.price_rub, plan.duration_days, plan.max_text_len
    )
}

/// Plan catalog text
#[must_use]
pub fn subscriptions_text() -> String {
    let plans: Vec<String> = PLANS.iter().map(format_plan_info).collect();
    format!(
        "💳 <b>Доступные подписки</b>\n\n{}\n\nВыберите нужный тариф для оплаты.",
        plans.join("\n\n")
    )
}

/// Shown instead of a mode switch when the subscription is not active
pub const ACCESS_RESTRICTED: &str = "🚫 <b>Доступ ограничен</b>\n\n\
💎 <b>Оформите подписку</b> чтобы получить доступ ко всем функциям:";

/// Invoice text with the proration preview
#[must_use]
pub fn invoice_text(change: &PlanChange) -> String {
    let plan = change.new_plan;
    let mut text = format!(
        "🧾 <b>Счёт на оплату</b>\n\n\
         <b>Тариф:</b> {}\n\
         <b>Стоимость:</b> {} ₽ за {} дней\n\
         <b>Что входит:</b>\n\
         • Запросы: {}\n\
         • Генерации изображений: {}\n\
         • Длина запроса: до {} символов\n",
        plan.title,
        plan.price_rub,
        plan.duration_days,
        plan_limit(plan.max_requests),
        plan_limit(plan.max_images),
        plan.max_text_len,
    );

    if let Some(old) = change.old_plan {
        if change.extra_days() > 0.0 {
            text.push_str(&format!(
                "\n🔄 <b>Перенос остатка {}:</b> +{}\n",
                old.title,
                format_days_hours(change.extra_days())
            ));
            for (label, days) in [
                ("за оставшееся время", change.converted_days),
                ("за неиспользованные запросы", change.bonus_days_req),
                ("за неиспользованные генерации", change.bonus_days_img),
            ] {
                if days > 0.0 {
                    text.push_str(&format!("• {label}: {}\n", format_days_hours(days)));
                }
            }
        }
    }

    text.push_str(&format!(
        "\n<b>Итого:</b> {} (до {} МСК, если оплатить сейчас)\n\n\
         Нажмите кнопку ниже, чтобы перейти к оплате 👇",
        format_days_hours(change.total_days),
        format_msk(change.expires_at)
    ));
    text
}

/// Answer to `/help`
pub const COMMANDS_HELP: &str = "ℹ️ <b>Помощь</b>\n\n\
Команды:\n\
• /start — главное меню\n\
• /mode — выбор режима\n\
• /subscription — информация о подписке\n\
• /new — новый чат\n\n\
Просто отправьте текст, и бот ответит вам 🤖";

/// Help panel with the support contact
#[must_use]
pub fn help_text(support_username: &str) -> String {
    format!(
        "ℹ️ <b>Помощь</b>\n\n\
         Доступные команды:\n\
         • /start — главное меню\n\
         • /new — новый чат\n\
         • /mode — выбрать режим\n\
         • /subscription — информация о подписке\n\
         • Просто отправьте текст — и получите ответ\n\n\
         Поддержка: @{support_username}"
    )
}

/// Referral program description
#[must_use]
pub fn referral_text(link: &str, settings: &Settings) -> String {
    format!(
        "👫 <b>Приглашайте друзей и получайте бонусы!</b>\n\n\
         Ваша реферальная ссылка:\n<code>{link}</code>\n\n\
         За каждого друга, который оплатит подписку:\n\
         • <b>Вам</b> – +{} к подписке\n\
         • <b>Другу</b> – {} бесплатного доступа\n\n\
         Просто поделитесь ссылкой с друзьями!",
        format_days_hours(f64::from(settings.referral_bonus_days)),
        format_days_hours(f64::from(settings.trial_days))
    )
}

/// Confirmation of a mode switch
#[must_use]
pub fn mode_switched_text(mode: Mode) -> String {
    format!("Режим переключен: {}", mode_label(mode))
}

/// Chat list, newest first
#[must_use]
pub fn chat_list_text(sessions: &[ChatSession]) -> String {
    if sessions.is_empty() {
        return "У вас пока нет сохранённых чатов.".to_string();
    }
    let lines: Vec<String> = sessions
        .iter()
        .map(|s| {
            let mark = if s.is_active { "🟢" } else { "⚪️" };
            format!(
                "{mark} <b>{}</b> — {} (#{})",
                html_escape::encode_text(&s.title),
                s.mode,
                s.id
            )
        })
        .collect();
    format!("📁 <b>Ваши чаты</b>\n{}", lines.join("\n"))
}

/// Admin panel header
pub const ADMIN_PANEL: &str = "🛡 <b>Админ-панель</b>\n\n\
1️⃣ Управление пользователями: /block и /unblock с ID\n\
2️⃣ Рассылки\n\
3️⃣ Проверка платежей: /check_payments\n\n\
⚙️ Доступ только для администраторов.";

/// Aggregated statistics for admins
#[must_use]
pub fn stats_text(stats: &Stats) -> String {
    format!(
        "📊 <b>Статистика</b>\n\n\
         Пользователей: {} (заблокировано: {})\n\
         Активных подписок: {} (платных: {})\n\
         Платежей в ожидании: {}\n\
         Успешных платежей: {} на сумму {} ₽",
        stats.users,
        stats.blocked_users,
        stats.active_subscriptions,
        stats.paid_subscriptions,
        stats.pending_payments,
        stats.succeeded_payments,
        stats.revenue_rub
    )
}

/// Result of a broadcast
#[must_use]
pub fn broadcast_report(delivered: usize, failed: usize) -> String {
    format!("📣 Рассылка завершена.\nДоставлено: {delivered}\nОшибок: {failed}")
}

/// Filled and empty blocks for `percent`
#[must_use]
pub fn progress_bar(percent: u32) -> String {
    let percent = percent.min(100);
    let filled = percent * PROGRESS_BLOCKS / 100;
    let empty = PROGRESS_BLOCKS - filled;
    format!("{}{}", "▰".repeat(filled as usize), "▱".repeat(empty as usize))
}

/// Progress message of an image job
#[must_use]
pub fn progress_text(title: &str, percent: u32) -> String {
    if percent >= 100 {
        return format!("📸 Готово!\n{}  100%", progress_bar(100));
    }
    format!("{title}\n{}  {percent}%", progress_bar(percent))
}

/// Sent when the payment monitor activates a plan
#[must_use]
pub fn subscription_activated_text(
    plan_title: &str,
    expires_at: DateTime<Utc>,
    settings: &Settings,
) -> String {
    format!(
        "🚀 Ваша подписка успешно активирована!\n\
         Тариф: {plan_title} до {} МСК.\n\
         Спасибо, что выбрали наш сервис!\n\n\
         👫 Приглашайте друзей и получайте бонусы:\n\
         • Вам – +{} бесплатно за каждого приглашённого друга с оплаченной подпиской\n\
         • Вашим друзьям – {} бесплатного доступа\n\n\
         Если у вас возникнут вопросы, мы всегда рады помочь!\n\
         Приятного пользования! 🫶",
        format_msk(expires_at),
        format_days_hours(f64::from(settings.referral_bonus_days)),
        format_days_hours(f64::from(settings.trial_days))
    )
}

/// Sent when a payment is canceled or expires
#[must_use]
pub fn payment_failed_text(reason: &str) -> String {
    format!(
        "❌ Платеж не прошел\n\nПричина: {reason}\n\n\
         Пожалуйста, попробуйте еще раз или обратитесь в поддержку."
    )
}

/// Keyboard under the subscription panel
#[must_use]
pub fn top_panel_keyboard(bot_username: &str, referral_code: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            button("💳 Продлить подписку", &CallbackAction::ShowSubscriptions),
            button("🎛 Режим", &CallbackAction::Panel(Panel::Mode)),
        ],
        vec![url_button(
            "👥 Пригласить",
            &referral_link(bot_username, referral_code),
        )],
        vec![
            button("🆕 Новый чат", &CallbackAction::NewChat),
            button("🗂 Мои чаты", &CallbackAction::ListChats),
        ],
        vec![
            button("❓ Помощь", &CallbackAction::Panel(Panel::Help)),
            button("🛡 Админ-панель", &CallbackAction::Panel(Panel::Admin)),
        ],
    ])
}

/// Mode picker
#[must_use]
pub fn modes_keyboard() -> InlineKeyboardMarkup {
    let rows = Mode::ALL
        .chunks(2)
        .map(|pair| {
            pair.iter()
                .map(|&mode| button(mode_label(mode), &CallbackAction::SwitchMode(mode)))
                .collect()
        })
        .collect::<Vec<Vec<_>>>();
    InlineKeyboardMarkup::new(rows)
}

/// One buy button per plan and a way back
#[must_use]
pub fn subscriptions_keyboard() -> InlineKeyboardMarkup {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = PLANS
        .iter()
        .map(|plan| {
            vec![button(
                &format!("Купить {}", plan.title),
                &CallbackAction::Buy(plan.code.to_string()),
            )]
        })
        .collect();
    rows.push(vec![button(
        "⬅️ Главное меню",
        &CallbackAction::Panel(Panel::Main),
    )]);
    InlineKeyboardMarkup::new(rows)
}

/// Pay link under an invoice
#[must_use]
pub fn buy_keyboard(pay_url: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![url_button("💳 Оплатить", pay_url)],
        vec![button("⬅️ Назад", &CallbackAction::ShowSubscriptions)],
    ])
}

/// Single button back to the main panel
#[must_use]
pub fn back_keyboard(label: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![button(
        label,
        &CallbackAction::Panel(Panel::Main),
    )]])
}

/// Chat list actions. `newest` is the first listed session.
#[must_use]
pub fn chat_list_keyboard(newest: Option<i64>) -> InlineKeyboardMarkup {
    let mut rows = Vec::with_capacity(2);
    if let Some(id) = newest {
        rows.push(vec![button(
            "Активировать первый",
            &CallbackAction::ActivateChat(id),
        )]);
    }
    rows.push(vec![button("Создать новый", &CallbackAction::NewChat)]);
    InlineKeyboardMarkup::new(rows)
}

/// Admin menu
#[must_use]
pub fn admin_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            button("👤 Пользователи", &CallbackAction::Admin(AdminAction::Users)),
            button("📣 Рассылка", &CallbackAction::Admin(AdminAction::Broadcast)),
        ],
        vec![button(
            "📊 Статистика",
            &CallbackAction::Admin(AdminAction::Stats),
        )],
        vec![button("⬅️ Главное меню", &CallbackAction::Panel(Panel::Main))],
    ])
}

/// Share button for the referral link
#[must_use]
pub fn referral_keyboard(link: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::switch_inline_query(
            "📤 Поделиться ссылкой",
            format!("Присоединяйся! {link}"),
        )],
        vec![button("⬅️ Назад", &CallbackAction::Panel(Panel::Main))],
    ])
}

/// Follow-up buttons under the activation notice
#[must_use]
pub fn activated_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![button(
            "👫 Пригласить друга",
            &CallbackAction::Panel(Panel::Referral),
        )],
        vec![button("❓ Помощь", &CallbackAction::Panel(Panel::Help))],
    ])
}

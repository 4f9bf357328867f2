//! Text, photo and voice messages in the active chat mode.
//!
//! Assistant answers run on the chat pool, pictures on the image pool. Both
//! jobs report back to the user on their own, so the update handler returns
//! as soon as the job is queued.

use super::context::{get_user_name, AppContext};
use super::handlers::register_sender;
use super::messaging::{finish_answer, send_long_message};
use super::resilient::{edit_message_safe_resilient, send_message_resilient, send_photo_resilient};
use super::views::{progress_text, subscriptions_keyboard};
use crate::config::{CHAT_MAX_TOKENS, CHAT_TEMPERATURE, STREAM_EDIT_INTERVAL_MS};
use crate::domain::Mode;
use crate::llm::{ImageProvider, LlmError, Message as ChatMessage};
use crate::queue::WorkerPool;
use crate::services::{
    current_mode, open_turn, record_answer, Quota, Reservation, SafetyDecision, SafetyGuard,
};
use crate::storage::UsageKind;
use anyhow::Result;
use chrono::Utc;
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{FileMeta, MessageId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Highest percentage shown while an image job is still running
pub const PROGRESS_CAP: u32 = 80;

const THINKING: &str = "🤔 Думаю…";
const REQUEST_LIMIT: &str =
    "❗ Лимит запросов исчерпан. Оформите подписку или дождитесь продления.";
const IMAGE_LIMIT: &str =
    "❗ Лимит изображений исчерпан. Оформите подписку или дождитесь продления.";
const EDITOR_NEEDS_PHOTO: &str =
    "🛠 Пришлите фото, а в подписи опишите, что нужно изменить.";
const POOL_UNAVAILABLE: &str = "⏳ Сервис сейчас недоступен. Попробуйте позже.";
const DEFAULT_PHOTO_QUESTION: &str = "Опиши, что изображено на фото.";

/// Lets through at most one message edit per interval
#[derive(Debug, Clone)]
pub struct EditThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl EditThrottle {
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns true and remembers `now` if an edit is allowed at `now`
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Next value of the progress animation: +1 and +2 in turn, capped at [`PROGRESS_CAP`]
#[must_use]
pub const fn next_progress(percent: u32, tick: u32) -> u32 {
    let step = if tick % 2 == 0 { 1 } else { 2 };
    let next = percent + step;
    if next > PROGRESS_CAP {
        PROGRESS_CAP
    } else {
        next
    }
}

/// Picture request handed to the image pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageJob {
    Generate {
        prompt: String,
    },
    Edit {
        photo: Vec<u8>,
        instruction: String,
    },
    AddPeople {
        photo: Option<Vec<u8>>,
        description: String,
    },
    CelebritySelfie {
        photo: Option<Vec<u8>>,
        name: String,
    },
}

impl ImageJob {
    /// Job for a text prompt, `None` for modes that need something else
    #[must_use]
    pub fn from_text(mode: Mode, text: &str) -> Option<Self> {
        let text = text.trim().to_string();
        match mode {
            Mode::Image => Some(Self::Generate { prompt: text }),
            Mode::AddPeople => Some(Self::AddPeople {
                photo: None,
                description: text,
            }),
            Mode::CelebritySelfie => Some(Self::CelebritySelfie {
                photo: None,
                name: text,
            }),
            Mode::Assistant | Mode::Editor => None,
        }
    }

    /// Job for a photo with an optional caption
    #[must_use]
    pub fn from_photo(mode: Mode, photo: Vec<u8>, caption: Option<&str>) -> Self {
        let caption = caption.map(str::trim).filter(|c| !c.is_empty());
        let or_default = |default: &str| caption.unwrap_or(default).to_string();
        match mode {
            Mode::Editor => Self::Edit {
                photo,
                instruction: or_default("Слегка улучшить качество и цвет."),
            },
            Mode::AddPeople => Self::AddPeople {
                photo: Some(photo),
                description: or_default(
                    "Добавить двух людей на задний план, естественная композиция.",
                ),
            },
            Mode::CelebritySelfie => Self::CelebritySelfie {
                photo: Some(photo),
                name: or_default("Известная личность"),
            },
            Mode::Image | Mode::Assistant => Self::Edit {
                photo,
                instruction: "Улучшить изображение.".to_string(),
            },
        }
    }

    /// First line of the progress message
    #[must_use]
    pub const fn progress_title(&self) -> &'static str {
        match self {
            Self::Generate { .. } => "🎨 Генерирую изображение…",
            Self::Edit { .. } => "🛠 Редактирую изображение…",
            Self::AddPeople { .. } => "➕ Добавляю людей…",
            Self::CelebritySelfie { .. } => "🤳 Создаю селфи…",
        }
    }

    #[must_use]
    pub const fn file_name(&self) -> &'static str {
        match self {
            Self::Generate { .. } => "generated.png",
            Self::Edit { .. } => "edit.png",
            Self::AddPeople { .. } | Self::CelebritySelfie { .. } => "result.png",
        }
    }

    /// Runs the job against the image provider
    ///
    /// # Errors
    ///
    /// Returns the provider error unchanged.
    pub async fn run(self, images: &dyn ImageProvider) -> Result<Vec<u8>, LlmError> {
        match self {
            Self::Generate { prompt } => images.generate(&prompt).await,
            Self::Edit { photo, instruction } => images.edit(photo, &instruction).await,
            Self::AddPeople { photo, description } => images.add_people(photo, &description).await,
            Self::CelebritySelfie { photo, name } => images.celebrity_selfie(photo, &name).await,
        }
    }
}

/// Takes one unit of quota, or sends the limit message and returns `None`
async fn reserve_or_deny(
    bot: &Bot,
    chat_id: ChatId,
    ctx: &AppContext,
    quota: &Quota,
    user_id: i64,
    kind: UsageKind,
) -> Result<Option<Reservation>> {
    let reservation = quota.reserve(ctx.store.as_ref(), user_id, kind).await?;
    if reservation.is_none() {
        let text = match kind {
            UsageKind::Request => REQUEST_LIMIT,
            UsageKind::Image => IMAGE_LIMIT,
        };
        deny(bot, chat_id, text).await?;
    }
    Ok(reservation)
}

/// Queues a job paid for by `reservation`.
///
/// The job resolves to true once the result reached the user. Anything else,
/// including a pool that no longer accepts work, hands the unit back.
async fn submit_job<F>(
    ctx: &AppContext,
    bot: &Bot,
    chat_id: ChatId,
    pool: &WorkerPool,
    reservation: Reservation,
    job: F,
) -> Result<()>
where
    F: Future<Output = Result<bool>> + Send + 'static,
{
    let store = ctx.store.clone();
    let settled = async move {
        let outcome = job.await;
        if !matches!(outcome, Ok(true)) {
            reservation.release(store.as_ref()).await;
        }
        outcome.map(drop)
    };
    if let Err(e) = pool.submit(settled) {
        warn!(pool = pool.name(), "Job rejected: {e}");
        reservation.release(ctx.store.as_ref()).await;
        send_message_resilient(bot, chat_id, POOL_UNAVAILABLE, None).await?;
    }
    Ok(())
}

async fn deny(bot: &Bot, chat_id: ChatId, text: &str) -> Result<()> {
    bot.send_message(chat_id, text)
        .reply_markup(subscriptions_keyboard())
        .await?;
    Ok(())
}

/// Downloads a Telegram file into memory
async fn download(bot: &Bot, file: &FileMeta) -> Result<Vec<u8>> {
    crate::utils::retry_telegram_operation(|| async {
        let remote = bot.get_file(file.id.clone()).await?;
        let mut buf = Vec::new();
        bot.download_file(&remote.path, &mut buf).await?;
        Ok(buf)
    })
    .await
}

/// Sends a denial and returns false if the text is too long for the plan
async fn length_allowed(
    bot: &Bot,
    chat_id: ChatId,
    ctx: &AppContext,
    text: &str,
    quota: &Quota,
) -> Result<bool> {
    match ctx.guard.check_text_length(text, quota.limits.max_text_len) {
        SafetyDecision::Allowed => Ok(true),
        SafetyDecision::Denied(reason) => {
            send_message_resilient(bot, chat_id, reason, None).await?;
            Ok(false)
        }
    }
}

async fn celebrity_allowed(bot: &Bot, chat_id: ChatId, ctx: &AppContext, name: &str) -> Result<bool> {
    match ctx.guard.check_celebrity_selfie(name) {
        SafetyDecision::Allowed => Ok(true),
        SafetyDecision::Denied(reason) => {
            info!(chat_id = chat_id.0, "Celebrity request denied");
            send_message_resilient(bot, chat_id, reason, None).await?;
            Ok(false)
        }
    }
}

/// Handles a text message in the active mode
///
/// # Errors
///
/// Returns an error if storage or the Telegram API fails.
pub async fn handle_text(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> Result<()> {
    let Some(text) = msg.text().map(str::trim).filter(|t| !t.is_empty()) else {
        return Ok(());
    };
    let chat_id = msg.chat.id;
    if text.starts_with('/') {
        send_message_resilient(&bot, chat_id, "Неизвестная команда. Список команд: /help", None)
            .await?;
        return Ok(());
    }

    let user = register_sender(&ctx, &msg, None).await?;
    let mode = current_mode(ctx.store.as_ref(), user.id).await?;
    let quota = Quota::load(ctx.store.as_ref(), &ctx.settings, user.id, Utc::now()).await?;
    debug!(user_id = user.id, user = %get_user_name(&msg), mode = %mode, "Text message");

    if mode.is_image() && !quota.allows_image() {
        return deny(&bot, chat_id, IMAGE_LIMIT).await;
    }
    if !mode.is_image() && !quota.allows_request() {
        return deny(&bot, chat_id, REQUEST_LIMIT).await;
    }
    if !length_allowed(&bot, chat_id, &ctx, text, &quota).await? {
        return Ok(());
    }

    if mode == Mode::Assistant {
        let Some(reservation) =
            reserve_or_deny(&bot, chat_id, &ctx, &quota, user.id, UsageKind::Request).await?
        else {
            return Ok(());
        };
        let job = run_assistant_turn(ctx.clone(), bot.clone(), chat_id, user.id, text.to_string());
        return submit_job(&ctx, &bot, chat_id, &ctx.chat_pool, reservation, job).await;
    }
    if mode == Mode::CelebritySelfie && !celebrity_allowed(&bot, chat_id, &ctx, text).await? {
        return Ok(());
    }
    let Some(job) = ImageJob::from_text(mode, text) else {
        send_message_resilient(&bot, chat_id, EDITOR_NEEDS_PHOTO, None).await?;
        return Ok(());
    };
    let Some(reservation) =
        reserve_or_deny(&bot, chat_id, &ctx, &quota, user.id, UsageKind::Image).await?
    else {
        return Ok(());
    };
    let run = run_image_job(ctx.clone(), bot.clone(), chat_id, user.id, mode, job);
    submit_job(&ctx, &bot, chat_id, &ctx.image_pool, reservation, run).await
}

/// Handles a photo in the active mode
///
/// # Errors
///
/// Returns an error if storage, the download or the Telegram API fails.
pub async fn handle_photo(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> Result<()> {
    let Some(photo) = msg.photo().and_then(<[_]>::last) else {
        return Ok(());
    };
    let chat_id = msg.chat.id;
    let caption = msg.caption().map(str::trim).filter(|c| !c.is_empty());

    let user = register_sender(&ctx, &msg, None).await?;
    let mode = current_mode(ctx.store.as_ref(), user.id).await?;
    let quota = Quota::load(ctx.store.as_ref(), &ctx.settings, user.id, Utc::now()).await?;
    debug!(user_id = user.id, user = %get_user_name(&msg), mode = %mode, "Photo message");

    if !quota.allows_image() {
        return deny(&bot, chat_id, IMAGE_LIMIT).await;
    }
    if mode == Mode::Assistant && !quota.allows_request() {
        return deny(&bot, chat_id, REQUEST_LIMIT).await;
    }
    if let Some(caption) = caption {
        if !length_allowed(&bot, chat_id, &ctx, caption, &quota).await? {
            return Ok(());
        }
    }

    let bytes = download(&bot, &photo.file).await?;
    if mode == Mode::Assistant {
        let Some(reservation) =
            reserve_or_deny(&bot, chat_id, &ctx, &quota, user.id, UsageKind::Request).await?
        else {
            return Ok(());
        };
        let question = caption.unwrap_or(DEFAULT_PHOTO_QUESTION).to_string();
        let job = run_photo_question(ctx.clone(), bot.clone(), chat_id, user.id, bytes, question);
        return submit_job(&ctx, &bot, chat_id, &ctx.chat_pool, reservation, job).await;
    }

    let job = ImageJob::from_photo(mode, bytes, caption);
    if let ImageJob::CelebritySelfie { name, .. } = &job {
        if !celebrity_allowed(&bot, chat_id, &ctx, name).await? {
            return Ok(());
        }
    }
    let Some(reservation) =
        reserve_or_deny(&bot, chat_id, &ctx, &quota, user.id, UsageKind::Image).await?
    else {
        return Ok(());
    };
    let run = run_image_job(ctx.clone(), bot.clone(), chat_id, user.id, mode, job);
    submit_job(&ctx, &bot, chat_id, &ctx.image_pool, reservation, run).await
}

/// Outcome of checking a voice transcript
#[derive(Debug, PartialEq, Eq)]
enum Transcript {
    /// Goes to the assistant like a typed message
    Prompt(String),
    /// Reply sent instead of an answer
    Rejected(String),
}

/// Applies the same checks as typed text to a transcript
fn review_transcript(guard: &SafetyGuard, raw: &str, max_text_len: u32) -> Transcript {
    let text = raw.trim();
    if text.is_empty() {
        return Transcript::Rejected("🎙 Не удалось разобрать речь.".to_string());
    }
    match guard.check_text_length(text, max_text_len) {
        SafetyDecision::Allowed => Transcript::Prompt(text.to_string()),
        SafetyDecision::Denied(reason) => Transcript::Rejected(reason),
    }
}

/// Handles a voice message. Only the assistant understands speech.
///
/// # Errors
///
/// Returns an error if storage, the download or the Telegram API fails.
pub async fn handle_voice(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> Result<()> {
    let Some(voice) = msg.voice() else {
        return Ok(());
    };
    let chat_id = msg.chat.id;

    let user = register_sender(&ctx, &msg, None).await?;
    let mode = current_mode(ctx.store.as_ref(), user.id).await?;
    if mode != Mode::Assistant {
        send_message_resilient(
            &bot,
            chat_id,
            "🎙 Голосовые сообщения понимает только режим ассистента.",
            None,
        )
        .await?;
        return Ok(());
    }
    let quota = Quota::load(ctx.store.as_ref(), &ctx.settings, user.id, Utc::now()).await?;
    if !quota.allows_request() {
        return deny(&bot, chat_id, REQUEST_LIMIT).await;
    }

    let audio = download(&bot, &voice.file).await?;
    let mime = voice
        .mime_type
        .as_ref()
        .map_or_else(|| "audio/ogg".to_string(), ToString::to_string);
    let Some(reservation) =
        reserve_or_deny(&bot, chat_id, &ctx, &quota, user.id, UsageKind::Request).await?
    else {
        return Ok(());
    };
    let job = {
        let ctx = ctx.clone();
        let bot = bot.clone();
        let user_id = user.id;
        let max_text_len = quota.limits.max_text_len;
        async move {
            let raw = ctx.chat.transcribe_audio(audio, "voice.ogg", &mime).await?;
            let text = match review_transcript(&ctx.guard, &raw, max_text_len) {
                Transcript::Prompt(text) => text,
                Transcript::Rejected(reason) => {
                    send_message_resilient(&bot, chat_id, reason, None).await?;
                    return Ok(false);
                }
            };
            info!(user_id, chars = text.chars().count(), "Voice transcribed");
            send_message_resilient(&bot, chat_id, format!("🎙 {text}"), None).await?;
            run_assistant_turn(ctx, bot, chat_id, user_id, text).await
        }
    };
    submit_job(&ctx, &bot, chat_id, &ctx.chat_pool, reservation, job).await
}

/// Streams the model answer into `msg_id`, editing at most once per interval
async fn stream_answer(
    ctx: &AppContext,
    bot: &Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    messages: &[ChatMessage],
) -> Result<String, LlmError> {
    let mut stream = ctx
        .chat
        .stream_chat(messages, CHAT_MAX_TOKENS, CHAT_TEMPERATURE)
        .await?;
    let mut throttle = EditThrottle::new(Duration::from_millis(STREAM_EDIT_INTERVAL_MS));
    let mut answer = String::new();

    while let Some(delta) = stream.next().await {
        match delta {
            Ok(delta) => answer.push_str(&delta),
            Err(e) if answer.is_empty() => return Err(e),
            Err(e) => {
                warn!(chat_id = chat_id.0, "Stream interrupted, keeping partial answer: {e}");
                break;
            }
        }
        if !answer.trim().is_empty() && throttle.ready(Instant::now()) {
            edit_message_safe_resilient(bot, chat_id, msg_id, &answer, None).await;
        }
    }
    Ok(answer)
}

/// One assistant turn: context, streamed answer and history.
/// Resolves to true once the answer was delivered.
async fn run_assistant_turn(
    ctx: Arc<AppContext>,
    bot: Bot,
    chat_id: ChatId,
    user_id: i64,
    text: String,
) -> Result<bool> {
    let turn = open_turn(ctx.store.as_ref(), &ctx.settings, user_id, &text).await?;
    let placeholder = send_message_resilient(&bot, chat_id, THINKING, None).await?;

    let answer = match stream_answer(&ctx, &bot, chat_id, placeholder.id, &turn.messages).await {
        Ok(answer) if !answer.trim().is_empty() => answer,
        Ok(_) => {
            warn!(user_id, "Model returned an empty answer");
            edit_message_safe_resilient(
                &bot,
                chat_id,
                placeholder.id,
                "❗ Модель вернула пустой ответ. Попробуйте ещё раз.",
                None,
            )
            .await;
            return Ok(false);
        }
        Err(e) => {
            warn!(user_id, "Assistant request failed: {e}");
            let text = format!("❗ Ошибка: {e}");
            edit_message_safe_resilient(&bot, chat_id, placeholder.id, &text, None).await;
            return Ok(false);
        }
    };

    finish_answer(&bot, chat_id, placeholder.id, &answer).await?;
    info!(user_id, session_id = turn.session_id, chars = answer.chars().count(), "Answer sent");
    if let Err(e) = record_answer(ctx.store.as_ref(), turn.session_id, &answer).await {
        warn!(user_id, "Answer delivered but not saved to history: {e}");
    }
    Ok(true)
}

/// Answers a question about a photo with the chat model
async fn run_photo_question(
    ctx: Arc<AppContext>,
    bot: Bot,
    chat_id: ChatId,
    user_id: i64,
    photo: Vec<u8>,
    question: String,
) -> Result<bool> {
    let placeholder = send_message_resilient(&bot, chat_id, THINKING, None).await?;
    match ctx.chat.analyze_image(photo, &question).await {
        Ok(answer) => {
            finish_answer(&bot, chat_id, placeholder.id, &answer).await?;
            Ok(true)
        }
        Err(e) => {
            warn!(user_id, "Photo analysis failed: {e}");
            let text = format!("❗ Ошибка: {e}");
            if !edit_message_safe_resilient(&bot, chat_id, placeholder.id, &text, None).await {
                send_long_message(&bot, chat_id, &text).await?;
            }
            Ok(false)
        }
    }
}

/// Animates the progress message until `cancel` fires
fn spawn_progress(
    bot: Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    title: &'static str,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_millis(STREAM_EDIT_INTERVAL_MS);
        let mut percent = 0;
        let mut tick = 0;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
            let next = next_progress(percent, tick);
            tick += 1;
            if next == percent {
                continue;
            }
            percent = next;
            if let Err(e) = bot
                .edit_message_text(chat_id, msg_id, progress_text(title, percent))
                .await
            {
                debug!(chat_id = chat_id.0, "Progress edit skipped: {e}");
            }
        }
    })
}

/// Runs a picture job with an animated progress message.
/// Resolves to true once the picture was delivered.
async fn run_image_job(
    ctx: Arc<AppContext>,
    bot: Bot,
    chat_id: ChatId,
    user_id: i64,
    mode: Mode,
    job: ImageJob,
) -> Result<bool> {
    let title = job.progress_title();
    let file_name = job.file_name();
    let progress = send_message_resilient(&bot, chat_id, progress_text(title, 0), None).await?;

    let cancel = CancellationToken::new();
    let animation = spawn_progress(bot.clone(), chat_id, progress.id, title, cancel.clone());
    let result = job.run(ctx.images.as_ref()).await;
    cancel.cancel();
    if let Err(e) = animation.await {
        debug!("Progress task ended abnormally: {e}");
    }

    match result {
        Ok(picture) => {
            edit_message_safe_resilient(&bot, chat_id, progress.id, &progress_text(title, 100), None)
                .await;
            let caption = format!("Готово! Режим: {mode}");
            send_photo_resilient(&bot, chat_id, picture, file_name, &caption).await?;
            info!(user_id, mode = %mode, "Image delivered");
            Ok(true)
        }
        Err(e) => {
            warn!(user_id, mode = %mode, "Image job failed: {e}");
            let text = format!("❗ Ошибка: {e}");
            edit_message_safe_resilient(&bot, chat_id, progress.id, &text, None).await;
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockImageProvider;
    use mockall::predicate::eq;

    #[test]
    fn test_transcript_goes_through_length_check() {
        let guard = SafetyGuard::new(false);

        assert_eq!(
            review_transcript(&guard, "  Какая погода в Казани?  ", 100),
            Transcript::Prompt("Какая погода в Казани?".to_string())
        );
        assert_eq!(
            review_transcript(&guard, " \n ", 100),
            Transcript::Rejected("🎙 Не удалось разобрать речь.".to_string())
        );

        let dictation = "слово ".repeat(50);
        match review_transcript(&guard, &dictation, 40) {
            Transcript::Rejected(reason) => assert!(reason.contains("> 40")),
            Transcript::Prompt(_) => panic!("long dictation must be rejected"),
        }
    }

    #[test]
    fn test_throttle_allows_one_edit_per_interval() {
        let mut throttle = EditThrottle::new(Duration::from_secs(1));
        let start = Instant::now();

        assert!(throttle.ready(start));
        assert!(!throttle.ready(start + Duration::from_millis(300)));
        assert!(!throttle.ready(start + Duration::from_millis(999)));
        assert!(throttle.ready(start + Duration::from_millis(1000)));
        assert!(!throttle.ready(start + Duration::from_millis(1500)));
        assert!(throttle.ready(start + Duration::from_millis(2100)));
    }

    #[test]
    fn test_progress_alternates_and_caps() {
        assert_eq!(next_progress(0, 0), 1);
        assert_eq!(next_progress(1, 1), 3);
        assert_eq!(next_progress(79, 0), 80);
        assert_eq!(next_progress(79, 1), 80);
        assert_eq!(next_progress(80, 0), 80);

        let mut percent = 0;
        for tick in 0..200 {
            let next = next_progress(percent, tick);
            assert!(next >= percent);
            assert!(next <= PROGRESS_CAP);
            percent = next;
        }
        assert_eq!(percent, PROGRESS_CAP);
    }

    #[test]
    fn test_text_jobs_per_mode() {
        assert_eq!(
            ImageJob::from_text(Mode::Image, " кот в космосе "),
            Some(ImageJob::Generate {
                prompt: "кот в космосе".to_string()
            })
        );
        assert_eq!(
            ImageJob::from_text(Mode::CelebritySelfie, "Юрий Гагарин"),
            Some(ImageJob::CelebritySelfie {
                photo: None,
                name: "Юрий Гагарин".to_string()
            })
        );
        assert!(ImageJob::from_text(Mode::Editor, "сделай ярче").is_none());
        assert!(ImageJob::from_text(Mode::Assistant, "привет").is_none());
    }

    #[test]
    fn test_photo_jobs_use_caption_or_default() {
        let photo = vec![1, 2, 3];
        assert_eq!(
            ImageJob::from_photo(Mode::Editor, photo.clone(), None),
            ImageJob::Edit {
                photo: photo.clone(),
                instruction: "Слегка улучшить качество и цвет.".to_string()
            }
        );
        assert_eq!(
            ImageJob::from_photo(Mode::Editor, photo.clone(), Some("  убрать фон ")),
            ImageJob::Edit {
                photo: photo.clone(),
                instruction: "убрать фон".to_string()
            }
        );
        assert_eq!(
            ImageJob::from_photo(Mode::CelebritySelfie, photo.clone(), Some(" ")),
            ImageJob::CelebritySelfie {
                photo: Some(photo.clone()),
                name: "Известная личность".to_string()
            }
        );
        assert_eq!(
            ImageJob::from_photo(Mode::Image, photo.clone(), Some("игнорируется")),
            ImageJob::Edit {
                photo,
                instruction: "Улучшить изображение.".to_string()
            }
        );
    }

    #[test]
    fn test_job_labels() {
        let job = ImageJob::Generate {
            prompt: "закат".to_string(),
        };
        assert_eq!(job.file_name(), "generated.png");
        assert!(job.progress_title().starts_with("🎨"));
    }

    #[tokio::test]
    async fn test_edit_job_calls_provider_edit() {
        let mut images = MockImageProvider::new();
        images
            .expect_edit()
            .with(eq(vec![7u8, 7]), eq("убрать фон"))
            .times(1)
            .returning(|_, _| Ok(vec![9, 9, 9]));

        let job = ImageJob::Edit {
            photo: vec![7, 7],
            instruction: "убрать фон".to_string(),
        };
        assert_eq!(job.run(&images).await.expect("picture"), vec![9, 9, 9]);
    }

    #[tokio::test]
    async fn test_generate_job_propagates_errors() {
        let mut images = MockImageProvider::new();
        images
            .expect_generate()
            .returning(|_| Err(LlmError::ApiError("content policy".to_string())));

        let job = ImageJob::Generate {
            prompt: "что-то".to_string(),
        };
        let err = job.run(&images).await.expect_err("provider failed");
        assert!(err.to_string().contains("content policy"));
    }
}

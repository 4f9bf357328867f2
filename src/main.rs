use dotenvy::dotenv;
use neurochat_bot::bot::context::get_user_id_safe;
use neurochat_bot::bot::{
    admin, chat, handlers, AppContext, BlockedNoticeCache, BotDialogue, Command, State,
    TelegramNotifier,
};
use neurochat_bot::config::{Settings, StorageBackend};
use neurochat_bot::llm;
use neurochat_bot::payments::{self, PaymentMonitor};
use neurochat_bot::queue::WorkerPool;
use neurochat_bot::services::SafetyGuard;
use neurochat_bot::storage::{InMemoryStorage, MySqlStorage, StorageProvider};
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, Me};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting sensitive data
struct RedactionPatterns {
    token1: Regex,
    token2: Regex,
    token3: Regex,
    yookassa_env: Regex,
    basic_auth: Regex,
    db_password: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token1: Regex::new(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)(/['\s]*)")?,
            token2: Regex::new(r"([0-9]{8,10}:[A-Za-z0-9_-]{35})")?,
            token3: Regex::new(r"(bot[0-9]{8,10}:)[A-Za-z0-9_-]+")?,
            yookassa_env: Regex::new(r"YOOKASSA_SECRET_KEY=[^\s&]+")?,
            basic_auth: Regex::new(r"(Basic )[A-Za-z0-9+/=]{8,}")?,
            db_password: Regex::new(r"(mysql://[^:/@\s]+:)[^@\s]+(@)")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        output = self
            .token1
            .replace_all(&output, "$1[TELEGRAM_TOKEN]$3")
            .to_string();
        output = self
            .token2
            .replace_all(&output, "[TELEGRAM_TOKEN]")
            .to_string();
        output = self
            .token3
            .replace_all(&output, "$1[TELEGRAM_TOKEN]")
            .to_string();
        output = self
            .yookassa_env
            .replace_all(&output, "YOOKASSA_SECRET_KEY=[MASKED]")
            .to_string();
        output = self
            .basic_auth
            .replace_all(&output, "${1}[MASKED]")
            .to_string();
        output = self
            .db_password
            .replace_all(&output, "${1}[MASKED]${2}")
            .to_string();
        output
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<F> RedactingMakeWriter<F> {
    const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), self.patterns.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    dotenv().ok();

    // Initialize redaction patterns early (before logging)
    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);

    init_logging(patterns);

    info!("Starting Neurochat bot...");

    let settings = init_settings();
    let store = init_storage(&settings).await;

    let chat_provider = llm::build_chat_provider(&settings).unwrap_or_else(|e| {
        error!("Failed to configure chat provider: {}", e);
        std::process::exit(1);
    });
    let image_provider = llm::build_image_provider(&settings).unwrap_or_else(|e| {
        error!("Failed to configure image provider: {}", e);
        std::process::exit(1);
    });
    let payment_provider = payments::build_provider(&settings).unwrap_or_else(|e| {
        error!("Failed to configure payment provider: {}", e);
        std::process::exit(1);
    });
    info!(provider = payment_provider.name(), "Providers initialized.");

    let bot = Bot::new(settings.bot_token.clone());

    let notifier = Arc::new(TelegramNotifier::new(bot.clone(), settings.clone()));
    let monitor = Arc::new(PaymentMonitor::new(
        store.clone(),
        payment_provider.clone(),
        notifier,
        settings.clone(),
    ));

    let ctx = Arc::new(AppContext {
        store,
        settings: settings.clone(),
        chat: chat_provider,
        images: image_provider,
        payments: payment_provider,
        monitor: monitor.clone(),
        chat_pool: WorkerPool::start("chat", settings.workers_chat),
        image_pool: WorkerPool::start("images", settings.workers_images),
        guard: SafetyGuard::new(settings.block_celebrity_selfie),
        blocked_notices: init_blocked_notices(&settings),
    });

    let shutdown = CancellationToken::new();
    let monitor_task = tokio::spawn(monitor.run(shutdown.clone()));

    let bot_state = InMemStorage::<State>::new();
    let handler = setup_handler();

    info!("Bot is running...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![ctx.clone(), bot_state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Shutting down...");
    shutdown.cancel();
    if let Err(e) = monitor_task.await {
        warn!("Payment monitor ended abnormally: {}", e);
    }
    ctx.chat_pool.shutdown().await;
    ctx.image_pool.shutdown().await;

    Ok(())
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter::new(io::stderr, patterns);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Arc<Settings> {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

async fn init_storage(settings: &Settings) -> Arc<dyn StorageProvider> {
    let store: Arc<dyn StorageProvider> = match settings.storage_backend {
        StorageBackend::Mysql => match MySqlStorage::connect(&settings.database_url).await {
            Ok(s) => {
                info!("MySQL storage initialized.");
                Arc::new(s)
            }
            Err(e) => {
                error!("Failed to initialize MySQL storage: {}", e);
                std::process::exit(1);
            }
        },
        StorageBackend::Memory => {
            warn!("Using in-memory storage, data is lost on restart.");
            Arc::new(InMemoryStorage::new())
        }
    };
    if let Err(e) = store.check_connection().await {
        error!("Storage connection check failed: {}", e);
        std::process::exit(1);
    }
    store
}

fn init_blocked_notices(settings: &Settings) -> BlockedNoticeCache {
    info!(
        "Initializing BlockedNoticeCache (cooldown: {}s, ttl: {}s, max_size: {})",
        settings.blocked_notice_cooldown_secs,
        settings.blocked_notice_ttl_secs,
        settings.blocked_notice_max_entries
    );
    BlockedNoticeCache::new(
        settings.blocked_notice_cooldown_secs,
        settings.blocked_notice_ttl_secs,
        settings.blocked_notice_max_entries,
    )
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handle_callback))
        .branch(
            Update::filter_message().branch(
                dptree::filter_async(|msg: Message, ctx: Arc<AppContext>| async move {
                    !ctx.is_blocked(get_user_id_safe(&msg)).await
                })
                .enter_dialogue::<Message, InMemStorage<State>, State>()
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint(handle_command),
                )
                .branch(dptree::case![State::AwaitingBroadcast].endpoint(handle_broadcast))
                .branch(
                    dptree::case![State::Start]
                        .branch(
                            Update::filter_message()
                                .filter(|msg: Message| msg.text().is_some())
                                .endpoint(handle_start_text),
                        )
                        .branch(
                            Update::filter_message()
                                .filter(|msg: Message| msg.voice().is_some())
                                .endpoint(handle_start_voice),
                        )
                        .branch(
                            Update::filter_message()
                                .filter(|msg: Message| msg.photo().is_some())
                                .endpoint(handle_start_photo),
                        ),
                ),
            ),
        )
        .branch(
            // Blocked users, and messages nobody above handles
            Update::filter_message().endpoint(handle_blocked),
        )
}

async fn handle_blocked(
    bot: Bot,
    msg: Message,
    ctx: Arc<AppContext>,
) -> Result<(), teloxide::RequestError> {
    let user_id = get_user_id_safe(&msg);
    if !ctx.is_blocked(user_id).await {
        return respond(());
    }
    let user_name = msg
        .from
        .as_ref()
        .map(|u| u.first_name.clone())
        .unwrap_or_else(|| "Unknown".to_string());

    // Check if we should send a message (cooldown period passed or first attempt)
    if ctx.blocked_notices.should_send(user_id, &user_name).await {
        info!(
            "⛔️ Message from blocked user {} ({}). Sending denial message.",
            user_id, user_name
        );

        if let Err(e) = bot
            .send_message(msg.chat.id, "⛔️ Ваш доступ к боту ограничен.")
            .await
        {
            error!("Failed to send access denied message to {}: {}", user_id, e);
        } else {
            ctx.blocked_notices.mark_sent(user_id).await;
        }
    }

    respond(())
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    me: Me,
    dialogue: BotDialogue,
    ctx: Arc<AppContext>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = Box::pin(handlers::handle_command(bot, msg, cmd, me, dialogue, ctx)).await {
        error!("Command error: {}", e);
    }
    respond(())
}

async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    me: Me,
    bot_state: Arc<InMemStorage<State>>,
    ctx: Arc<AppContext>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = Box::pin(handlers::handle_callback(bot, q, me, bot_state, ctx)).await {
        error!("Callback handler error: {}", e);
    }
    respond(())
}

async fn handle_broadcast(
    bot: Bot,
    msg: Message,
    dialogue: BotDialogue,
    ctx: Arc<AppContext>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = admin::handle_broadcast_text(bot, msg, dialogue, ctx).await {
        error!("Broadcast handler error: {}", e);
    }
    respond(())
}

async fn handle_start_text(
    bot: Bot,
    msg: Message,
    ctx: Arc<AppContext>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = Box::pin(chat::handle_text(bot, msg, ctx)).await {
        error!("Text handler error: {}", e);
    }
    respond(())
}

async fn handle_start_voice(
    bot: Bot,
    msg: Message,
    ctx: Arc<AppContext>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = Box::pin(chat::handle_voice(bot, msg, ctx)).await {
        error!("Voice handler error: {}", e);
    }
    respond(())
}

async fn handle_start_photo(
    bot: Bot,
    msg: Message,
    ctx: Arc<AppContext>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = Box::pin(chat::handle_photo(bot, msg, ctx)).await {
        error!("Photo handler error: {}", e);
    }
    respond(())
}

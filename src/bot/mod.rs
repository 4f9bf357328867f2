/// Admin commands and broadcasts
pub mod admin;
/// Cooldown of the "access denied" notice for blocked users
pub mod blocked_cache;
/// Inline button payloads
pub mod callbacks;
/// Text, photo and voice messages in the active mode
pub mod chat;
/// Bot commands
pub mod commands;
/// Services shared by all handlers
pub mod context;
/// Commands, panels and callbacks
pub mod handlers;
/// Long message delivery
pub mod messaging;
/// Payment notices sent from the background monitor
pub mod notifier;
/// Telegram calls with retries
pub mod resilient;
/// User state and dialogue management
pub mod state;
/// Texts and keyboards
pub mod views;

pub use blocked_cache::BlockedNoticeCache;
pub use commands::Command;
pub use context::AppContext;
pub use handlers::BotDialogue;
pub use notifier::TelegramNotifier;
pub use state::State;

use teloxide::utils::command::BotCommands;

/// Supported commands for the bot
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Команды:")]
pub enum Command {
    /// Register and show the subscription panel. The argument is a referral code.
    #[command(description = "главное меню")]
    Start(String),
    /// Mode picker
    #[command(description = "выбор режима")]
    Mode,
    /// Subscription status
    #[command(description = "информация о подписке")]
    Subscription,
    /// Command list
    #[command(description = "помощь")]
    Help,
    /// Start a new assistant chat
    #[command(description = "новый чат")]
    New,
    /// Admin panel
    #[command(description = "админ-панель")]
    Admin,
    /// Force a pending payment check
    #[command(rename = "check_payments", description = "проверить платежи")]
    CheckPayments,
    /// Block a user by ID
    #[command(description = "заблокировать пользователя")]
    Block(String),
    /// Unblock a user by ID
    #[command(description = "разблокировать пользователя")]
    Unblock(String),
    /// Admin statistics
    #[command(description = "статистика")]
    Stats,
}

impl Command {
    /// Commands that only administrators may run
    #[must_use]
    pub const fn is_admin_only(&self) -> bool {
        matches!(
            self,
            Self::Admin | Self::CheckPayments | Self::Block(_) | Self::Unblock(_) | Self::Stats
        )
    }
}

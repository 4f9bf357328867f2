//! Typed inline button payloads.
//!
//! Every `callback_data` the bot emits is produced by [`CallbackAction::data`]
//! and read back with [`str::parse`].

use crate::domain::{Mode, ParseError};
use std::fmt;
use std::str::FromStr;

/// Panels reachable from the top menu
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Panel {
    /// Subscription status with the top keyboard
    Main,
    /// Mode picker
    Mode,
    /// Help text
    Help,
    /// Referral link and share button
    Referral,
    /// Admin menu
    Admin,
}

impl Panel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Mode => "mode",
            Self::Help => "help",
            Self::Referral => "referral",
            Self::Admin => "admin",
        }
    }
}

/// Admin menu actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    /// User count
    Users,
    /// Ask for a broadcast text
    Broadcast,
    /// Aggregated statistics
    Stats,
}

impl AdminAction {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Broadcast => "broadcast",
            Self::Stats => "stats",
        }
    }
}

/// Parsed inline button payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    /// `panel:<name>`
    Panel(Panel),
    /// `mode:<mode>`
    SwitchMode(Mode),
    /// `subs:show`
    ShowSubscriptions,
    /// `buy:<plan>`, the code is validated by the handler
    Buy(String),
    /// `chat:new`
    NewChat,
    /// `chat:list`
    ListChats,
    /// `chat:activate:<id>`
    ActivateChat(i64),
    /// `admin:<action>`
    Admin(AdminAction),
}

impl CallbackAction {
    /// Serialized form placed into `callback_data`
    #[must_use]
    pub fn data(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CallbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Panel(panel) => write!(f, "panel:{}", panel.as_str()),
            Self::SwitchMode(mode) => write!(f, "mode:{mode}"),
            Self::ShowSubscriptions => f.write_str("subs:show"),
            Self::Buy(plan) => write!(f, "buy:{plan}"),
            Self::NewChat => f.write_str("chat:new"),
            Self::ListChats => f.write_str("chat:list"),
            Self::ActivateChat(id) => write!(f, "chat:activate:{id}"),
            Self::Admin(action) => write!(f, "admin:{}", action.as_str()),
        }
    }
}

impl FromStr for CallbackAction {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || ParseError::new("callback", s);
        let (prefix, rest) = s.split_once(':').ok_or_else(unknown)?;

        let action = match (prefix, rest) {
            ("panel", "main") => Self::Panel(Panel::Main),
            ("panel", "mode") => Self::Panel(Panel::Mode),
            ("panel", "help") => Self::Panel(Panel::Help),
            ("panel", "referral") => Self::Panel(Panel::Referral),
            ("panel", "admin") => Self::Panel(Panel::Admin),
            ("mode", mode) => Self::SwitchMode(mode.parse()?),
            ("subs", "show") => Self::ShowSubscriptions,
            ("buy", plan) if !plan.is_empty() => Self::Buy(plan.to_string()),
            ("chat", "new") => Self::NewChat,
            ("chat", "list") => Self::ListChats,
            ("chat", rest) => {
                let id = rest
                    .strip_prefix("activate:")
                    .and_then(|id| id.parse().ok())
                    .ok_or_else(unknown)?;
                Self::ActivateChat(id)
            }
            ("admin", "users") => Self::Admin(AdminAction::Users),
            ("admin", "broadcast") => Self::Admin(AdminAction::Broadcast),
            ("admin", "stats") => Self::Admin(AdminAction::Stats),
            _ => return Err(unknown()),
        };
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_payloads() {
        assert_eq!(
            "panel:referral".parse::<CallbackAction>(),
            Ok(CallbackAction::Panel(Panel::Referral))
        );
        assert_eq!(
            "mode:celebrity_selfie".parse::<CallbackAction>(),
            Ok(CallbackAction::SwitchMode(Mode::CelebritySelfie))
        );
        assert_eq!(
            "buy:pro_plus".parse::<CallbackAction>(),
            Ok(CallbackAction::Buy("pro_plus".to_string()))
        );
        assert_eq!(
            "chat:activate:15".parse::<CallbackAction>(),
            Ok(CallbackAction::ActivateChat(15))
        );
        assert_eq!(
            "admin:broadcast".parse::<CallbackAction>(),
            Ok(CallbackAction::Admin(AdminAction::Broadcast))
        );
    }

    #[test]
    fn test_reject_unknown_payloads() {
        for raw in [
            "",
            "panel",
            "panel:settings",
            "mode:video",
            "buy:",
            "chat:activate:abc",
            "chat:delete:1",
            "retry_no_loop",
        ] {
            assert!(raw.parse::<CallbackAction>().is_err(), "{raw} accepted");
        }
    }

    #[test]
    fn test_data_is_parsed_back() {
        let actions = [
            CallbackAction::Panel(Panel::Main),
            CallbackAction::SwitchMode(Mode::AddPeople),
            CallbackAction::ShowSubscriptions,
            CallbackAction::Buy("pro_lite".to_string()),
            CallbackAction::NewChat,
            CallbackAction::ListChats,
            CallbackAction::ActivateChat(3),
            CallbackAction::Admin(AdminAction::Stats),
        ];
        for action in actions {
            assert_eq!(action.data().parse::<CallbackAction>(), Ok(action));
        }
    }

    #[test]
    fn test_payload_fits_telegram_limit() {
        let longest = CallbackAction::ActivateChat(i64::MAX).data();
        assert!(longest.len() <= 64);
    }
}

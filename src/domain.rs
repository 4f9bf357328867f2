//! Core value types shared by storage, services and the bot.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Returned when a string does not name a known variant
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct ParseError {
    kind: &'static str,
    value: String,
}

impl ParseError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// What the bot does with incoming text and photos
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Streaming chat with the language model
    #[default]
    Assistant,
    /// Text-to-image generation
    Image,
    /// Photo editing by instruction
    Editor,
    /// Adds a celebrity into a selfie
    CelebritySelfie,
    /// Adds people into a photo
    AddPeople,
}

impl Mode {
    /// Every mode in menu order
    pub const ALL: [Self; 5] = [
        Self::Assistant,
        Self::Image,
        Self::Editor,
        Self::AddPeople,
        Self::CelebritySelfie,
    ];

    /// Database and callback token
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Assistant => "assistant",
            Self::Image => "image",
            Self::Editor => "editor",
            Self::CelebritySelfie => "celebrity_selfie",
            Self::AddPeople => "add_people",
        }
    }

    /// True for modes that spend the image quota
    #[must_use]
    pub const fn is_image(self) -> bool {
        !matches!(self, Self::Assistant)
    }

    /// Title of a chat session opened in this mode
    #[must_use]
    pub fn session_title(self) -> String {
        let raw = self.as_str();
        let mut chars = raw.chars();
        let capitalized = chars.next().map_or_else(String::new, |first| {
            first.to_uppercase().collect::<String>() + chars.as_str()
        });
        format!("{capitalized} чат")
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ParseError::new("mode", s))
    }
}

/// Quotas of the current subscription. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Limits {
    /// Request quota
    pub max_requests: Option<u32>,
    /// Image quota
    pub max_images: Option<u32>,
    /// Prompt length limit, in characters
    pub max_text_len: u32,
}

impl Limits {
    /// No access at all
    pub const NONE: Self = Self {
        max_requests: Some(0),
        max_images: Some(0),
        max_text_len: 0,
    };
}

/// Payment lifecycle as reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Invoice created, waiting for the user
    Pending,
    /// Two-stage payment authorised but not captured
    WaitingForCapture,
    /// Money received
    Succeeded,
    /// Payment declined or cancelled
    Canceled,
    /// Invoice lifetime ran out
    Expired,
}

impl PaymentStatus {
    /// Database and gateway token
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::WaitingForCapture => "waiting_for_capture",
            Self::Succeeded => "succeeded",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        }
    }

    /// True once the payment cannot change anymore
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Succeeded | Self::Canceled | Self::Expired)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "waiting_for_capture" => Ok(Self::WaitingForCapture),
            "succeeded" => Ok(Self::Succeeded),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "expired" => Ok(Self::Expired),
            other => Err(ParseError::new("payment status", other)),
        }
    }
}

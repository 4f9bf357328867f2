//! Content checks applied before a request reaches a provider.

/// Outcome of a safety check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    /// Request may proceed
    Allowed,
    /// Request is rejected with a user-facing reason
    Denied(String),
}

impl SafetyDecision {
    /// Returns true if the request may proceed
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Simple rule-based guard
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyGuard {
    block_celebrity_selfie: bool,
}

impl SafetyGuard {
    /// Creates a guard; `block_celebrity_selfie` rejects every celebrity request
    #[must_use]
    pub const fn new(block_celebrity_selfie: bool) -> Self {
        Self {
            block_celebrity_selfie,
        }
    }

    /// Rejects texts longer than `max_len` characters
    #[must_use]
    pub fn check_text_length(&self, text: &str, max_len: u32) -> SafetyDecision {
        let len = text.chars().count();
        if len > max_len as usize {
            return SafetyDecision::Denied(format!(
                "Превышена длина текста ({len} > {max_len}). Укоротите запрос."
            ));
        }
        SafetyDecision::Allowed
    }

    #[must_use]
    pub fn check_celebrity_selfie(&self, _celebrity_name: &str) -> SafetyDecision {
        if self.block_celebrity_selfie {
            return SafetyDecision::Denied(
                "Создание реалистичных изображений с участием знаменитостей ограничено политиками. Выберите другой режим."
                    .to_string(),
            );
        }
        SafetyDecision::Allowed
    }
}

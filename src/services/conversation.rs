//! Chat sessions and the context sent to the model.

use crate::config::Settings;
use crate::domain::Mode;
use crate::llm::Message;
use crate::storage::{trim_history, ChatSession, StorageError, StorageProvider};

/// Title of sessions opened with `/new` or the "new chat" button
pub const NEW_CHAT_TITLE: &str = "Новый чат";

/// One assistant turn that is waiting for the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    /// Session the turn is stored in
    pub session_id: i64,
    /// System prompt, trimmed history and the new user message
    pub messages: Vec<Message>,
}

/// Mode of the active session, `assistant` when there is none.
///
/// # Errors
///
/// Returns a `StorageError` if the session cannot be loaded.
pub async fn current_mode(store: &dyn StorageProvider, user_id: i64) -> Result<Mode, StorageError> {
    Ok(store
        .active_chat_session(user_id)
        .await?
        .map_or(Mode::Assistant, |s| s.mode))
}

/// Active session of the user, opening an assistant session if needed.
///
/// # Errors
///
/// Returns a `StorageError` if the session cannot be loaded or created.
pub async fn active_session(
    store: &dyn StorageProvider,
    user_id: i64,
) -> Result<ChatSession, StorageError> {
    match store.active_chat_session(user_id).await? {
        Some(session) => Ok(session),
        None => {
            store
                .create_chat_session(user_id, NEW_CHAT_TITLE, Mode::Assistant)
                .await
        }
    }
}

/// Stores the user message and builds the model context.
///
/// History is limited to `history_limit` messages and to
/// `history_max_chars` characters including the new message, which is
/// always kept.
///
/// # Errors
///
/// Returns a `StorageError` if the database is unavailable.
pub async fn open_turn(
    store: &dyn StorageProvider,
    settings: &Settings,
    user_id: i64,
    text: &str,
) -> Result<Conversation, StorageError> {
    let session = active_session(store, user_id).await?;
    let history = store.get_history(session.id, settings.history_limit).await?;
    let budget = settings
        .history_max_chars
        .saturating_sub(text.chars().count());
    let history = trim_history(history, budget);

    store.store_message(session.id, "user", text).await?;

    let mut messages = Vec::with_capacity(history.len() + 2);
    if let Some(system) = settings
        .system_message
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        messages.push(Message::system(system));
    }
    messages.extend(history.into_iter().map(|m| match m.role.as_str() {
        "user" => Message::user(&m.content),
        _ => Message::assistant(&m.content),
    }));
    messages.push(Message::user(text));

    Ok(Conversation {
        session_id: session.id,
        messages,
    })
}

/// Stores the model answer.
///
/// The request was already reserved when the turn was queued.
///
/// # Errors
///
/// Returns a `StorageError` if the answer cannot be written.
pub async fn record_answer(
    store: &dyn StorageProvider,
    session_id: i64,
    answer: &str,
) -> Result<(), StorageError> {
    store.store_message(session_id, "assistant", answer).await
}

//! Model providers
//!
//! [`ChatProvider`] serves assistant answers, voice transcription and photo
//! questions. [`ImageProvider`] generates and edits pictures. Both talk to an
//! OpenAI-compatible endpoint picked by `llm_backend`.

mod common;
pub(crate) mod http_utils;
mod images;
mod openai_compat;

pub use images::{decode_data_url, ChatImageProvider, ImagesApiProvider};
pub use openai_compat::OpenAiChatProvider;

use crate::config::{LlmBackend, Settings};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors that can occur during LLM operations
#[derive(Debug, Error)]
pub enum LlmError {
    /// Error returned by the provider's API
    #[error("API error: {0}")]
    ApiError(String),
    /// Error during network communication
    #[error("Network error: {0}")]
    NetworkError(String),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    JsonError(String),
    /// Missing provider configuration or API key
    #[error("Missing client/API key: {0}")]
    MissingConfig(String),
    /// Any other unexpected error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// A message in an LLM conversation
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    /// `system`, `user` or `assistant`
    pub role: String,
    /// Text content of the message
    pub content: String,
}

impl Message {
    /// Create a new user message
    #[must_use]
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }

    /// Create a new assistant message
    #[must_use]
    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
        }
    }

    /// Create a new system message
    #[must_use]
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }
}

/// Stream of answer text deltas
pub type TextStream = BoxStream<'static, Result<String, LlmError>>;

/// Text model operations
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    /// Generate a complete answer
    async fn chat(
        &self,
        messages: &[Message],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, LlmError>;

    /// Generate an answer as a stream of text deltas
    async fn stream_chat(
        &self,
        messages: &[Message],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<TextStream, LlmError>;

    /// Answer a question about a picture
    async fn analyze_image(&self, image_bytes: Vec<u8>, question: &str) -> Result<String, LlmError>;

    /// Transcribe a voice message
    async fn transcribe_audio(
        &self,
        audio_bytes: Vec<u8>,
        file_name: &str,
        mime_type: &str,
    ) -> Result<String, LlmError>;
}

/// Prompt used when people are added to a photo
#[must_use]
pub fn add_people_prompt(description: &str) -> String {
    format!("На основе исходного фото, добавь людей: {description}. Сохрани стиль и реалистичность.")
}

/// Prompt used for a selfie with a famous person
#[must_use]
pub fn celebrity_selfie_prompt(celebrity_name: &str) -> String {
    format!(
        "Создай реалистичное селфи двух людей. Один выглядит как {celebrity_name}, второй - обычный человек. \
Фотография должна выглядеть как настоящее селфи, естественное освещение, высокое качество."
    )
}

/// Picture model operations. Every method returns encoded image bytes.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ImageProvider: Send + Sync {
    /// Text-to-image generation
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>, LlmError>;

    /// Edit a picture following an instruction
    async fn edit(&self, image_bytes: Vec<u8>, instruction: &str) -> Result<Vec<u8>, LlmError>;

    /// Add people to a photo, or draw a new scene when there is no photo
    async fn add_people(
        &self,
        image_bytes: Option<Vec<u8>>,
        description: &str,
    ) -> Result<Vec<u8>, LlmError> {
        let prompt = add_people_prompt(description);
        match image_bytes {
            Some(bytes) => self.edit(bytes, &prompt).await,
            None => self.generate(&prompt).await,
        }
    }

    /// Selfie with a famous person, from a photo or from text only
    async fn celebrity_selfie(
        &self,
        image_bytes: Option<Vec<u8>>,
        celebrity_name: &str,
    ) -> Result<Vec<u8>, LlmError> {
        let prompt = celebrity_selfie_prompt(celebrity_name);
        match image_bytes {
            Some(bytes) => self.edit(bytes, &prompt).await,
            None => self.generate(&prompt).await,
        }
    }
}

fn endpoint(settings: &Settings) -> Result<(String, String), LlmError> {
    let (key, base) = settings.llm_endpoint();
    let key = key
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| LlmError::MissingConfig(format!("{:?} API key", settings.llm_backend)))?;
    Ok((key, base))
}

/// Builds the chat provider for the configured backend.
///
/// # Errors
///
/// Returns `LlmError::MissingConfig` if the backend has no API key.
pub fn build_chat_provider(settings: &Settings) -> Result<Arc<dyn ChatProvider>, LlmError> {
    let (key, base) = endpoint(settings)?;
    info!(backend = ?settings.llm_backend, model = %settings.chat_model, "Chat provider configured");
    Ok(Arc::new(OpenAiChatProvider::new(
        key,
        base,
        settings.chat_model.clone(),
        settings.transcription_model.clone(),
        settings.llm_http_timeout_secs,
    )))
}

/// Builds the image provider for the configured backend.
///
/// OpenAI serves the Images API; AITUNNEL returns pictures from chat completions.
///
/// # Errors
///
/// Returns `LlmError::MissingConfig` if the backend has no API key.
pub fn build_image_provider(settings: &Settings) -> Result<Arc<dyn ImageProvider>, LlmError> {
    let (key, base) = endpoint(settings)?;
    info!(backend = ?settings.llm_backend, model = %settings.image_model, "Image provider configured");
    let provider: Arc<dyn ImageProvider> = match settings.llm_backend {
        LlmBackend::Openai => Arc::new(ImagesApiProvider::new(
            key,
            base,
            settings.image_model.clone(),
            settings.image_http_timeout_secs,
        )),
        LlmBackend::Aitunnel => Arc::new(ChatImageProvider::new(
            key,
            base,
            settings.image_model.clone(),
            settings.image_http_timeout_secs,
        )),
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;

    #[test]
    fn test_missing_key_is_reported() {
        let settings = test_settings();
        assert!(matches!(
            build_chat_provider(&settings),
            Err(LlmError::MissingConfig(_))
        ));
    }

    #[test]
    fn test_providers_build_with_key() {
        let mut settings = test_settings();
        settings.aitunnel_api_key = Some("sk-test".to_string());
        settings.llm_backend = LlmBackend::Aitunnel;
        assert!(build_chat_provider(&settings).is_ok());
        assert!(build_image_provider(&settings).is_ok());
    }

    /// Records which primitive the default methods call
    #[derive(Default)]
    struct RecordingImages {
        calls: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ImageProvider for RecordingImages {
        async fn generate(&self, prompt: &str) -> Result<Vec<u8>, LlmError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(format!("generate:{prompt}"));
            }
            Ok(vec![1])
        }

        async fn edit(&self, image_bytes: Vec<u8>, instruction: &str) -> Result<Vec<u8>, LlmError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(format!("edit:{instruction}"));
            }
            Ok(image_bytes)
        }
    }

    #[tokio::test]
    async fn test_add_people_without_photo_generates() {
        let provider = RecordingImages::default();
        let bytes = provider
            .add_people(None, "двое друзей")
            .await
            .expect("generated");
        assert_eq!(bytes, vec![1]);

        let calls = provider.calls.lock().expect("lock").clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("generate:"));
        assert!(calls[0].contains("двое друзей"));
    }

    #[tokio::test]
    async fn test_celebrity_selfie_with_photo_edits() {
        let provider = RecordingImages::default();
        let bytes = provider
            .celebrity_selfie(Some(vec![9, 9]), "Известная личность")
            .await
            .expect("edited");
        assert_eq!(bytes, vec![9, 9]);

        let calls = provider.calls.lock().expect("lock").clone();
        assert!(calls[0].starts_with("edit:"));
        assert!(calls[0].contains("Известная личность"));
    }
}

//! Chat provider for OpenAI-compatible APIs (OpenAI, AITUNNEL).
//!
//! Completions and streaming go through async-openai; vision questions and
//! transcription are plain reqwest calls against the same base URL.

use super::common::{build_openai_messages, extract_openai_response};
use super::http_utils::{self, extract_text_content, send_json_request, send_multipart_request};
use super::{ChatProvider, LlmError, Message, TextStream};
use async_openai::{
    config::OpenAIConfig, types::chat::CreateChatCompletionRequestArgs, Client,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::Client as HttpClient;
use serde_json::json;
use tracing::debug;

const VISION_MAX_TOKENS: u32 = 1000;

/// Chat, vision and speech-to-text over one OpenAI-compatible endpoint
pub struct OpenAiChatProvider {
    client: Client<OpenAIConfig>,
    http_client: HttpClient,
    api_key: String,
    api_base: String,
    model: String,
    transcription_model: String,
}

impl OpenAiChatProvider {
    /// Create a new provider for `api_base`
    #[must_use]
    pub fn new(
        api_key: String,
        api_base: String,
        model: String,
        transcription_model: String,
        timeout_secs: u64,
    ) -> Self {
        let api_base = api_base.trim_end_matches('/').to_string();
        let config = OpenAIConfig::new()
            .with_api_key(api_key.clone())
            .with_api_base(api_base.clone());
        Self {
            client: Client::with_config(config),
            http_client: http_utils::create_http_client(timeout_secs),
            api_key,
            api_base,
            model,
            transcription_model,
        }
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.api_key)
    }
}

/// Request body of a vision question
fn vision_body(model: &str, image_bytes: &[u8], question: &str) -> serde_json::Value {
    let data_url = format!("data:image/jpeg;base64,{}", BASE64.encode(image_bytes));
    json!({
        "model": model,
        "messages": [
            {
                "role": "user",
                "content": [
                    {"type": "text", "text": question},
                    {
                        "type": "image_url",
                        "image_url": {"url": data_url, "detail": "high"}
                    }
                ]
            }
        ],
        "max_tokens": VISION_MAX_TOKENS
    })
}

#[async_trait]
impl ChatProvider for OpenAiChatProvider {
    async fn chat(
        &self,
        messages: &[Message],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(build_openai_messages(messages)?)
            .max_tokens(max_tokens)
            .temperature(temperature)
            .build()
            .map_err(|e| LlmError::Unknown(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        extract_openai_response(&response)
    }

    async fn stream_chat(
        &self,
        messages: &[Message],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<TextStream, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(build_openai_messages(messages)?)
            .max_tokens(max_tokens)
            .temperature(temperature)
            .stream(true)
            .build()
            .map_err(|e| LlmError::Unknown(e.to_string()))?;

        debug!(model = %self.model, messages = messages.len(), "Opening completion stream");
        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        let deltas = stream.filter_map(|chunk| async move {
            match chunk {
                Ok(response) => response
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                    .filter(|text| !text.is_empty())
                    .map(Ok),
                Err(e) => Some(Err(LlmError::ApiError(e.to_string()))),
            }
        });
        Ok(deltas.boxed())
    }

    async fn analyze_image(&self, image_bytes: Vec<u8>, question: &str) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = vision_body(&self.model, &image_bytes, question);
        let res_json = send_json_request(&self.http_client, &url, &body, Some(&self.auth())).await?;
        extract_text_content(&res_json, &["choices", "0", "message", "content"])
    }

    async fn transcribe_audio(
        &self,
        audio_bytes: Vec<u8>,
        file_name: &str,
        mime_type: &str,
    ) -> Result<String, LlmError> {
        let url = format!("{}/audio/transcriptions", self.api_base);
        let part = Part::bytes(audio_bytes)
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .map_err(|e| LlmError::Unknown(e.to_string()))?;
        let form = Form::new()
            .text("model", self.transcription_model.clone())
            .part("file", part);

        let res_json = send_multipart_request(&self.http_client, &url, form, Some(&self.auth())).await?;
        let text = extract_text_content(&res_json, &["text"])?;
        debug!(chars = text.chars().count(), "Voice transcribed");
        Ok(text)
    }
}

//! Conversions between [`Message`] and async-openai request types.

use super::{LlmError, Message};
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionResponse,
};

/// Builds the request message list, keeping roles and order.
///
/// Unknown roles are sent as assistant messages.
///
/// # Errors
///
/// Returns `LlmError::Unknown` if message building fails.
pub fn build_openai_messages(
    history: &[Message],
) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
    history
        .iter()
        .map(|msg| {
            let built: ChatCompletionRequestMessage = match msg.role.as_str() {
                "system" => ChatCompletionRequestSystemMessageArgs::default()
                    .content(msg.content.clone())
                    .build()
                    .map_err(|e| LlmError::Unknown(e.to_string()))?
                    .into(),
                "user" => ChatCompletionRequestUserMessageArgs::default()
                    .content(msg.content.clone())
                    .build()
                    .map_err(|e| LlmError::Unknown(e.to_string()))?
                    .into(),
                _ => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(msg.content.clone())
                    .build()
                    .map_err(|e| LlmError::Unknown(e.to_string()))?
                    .into(),
            };
            Ok(built)
        })
        .collect()
}

/// Extracts text content from a chat completion response
///
/// # Errors
///
/// Returns `LlmError::ApiError` if the response is empty.
pub fn extract_openai_response(
    response: &CreateChatCompletionResponse,
) -> Result<String, LlmError> {
    response
        .choices
        .first()
        .and_then(|c| c.message.content.clone())
        .ok_or_else(|| LlmError::ApiError("Empty response".to_string()))
}

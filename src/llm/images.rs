//! Image providers.

use super::http_utils::{self, extract_text_content, send_json_request, send_multipart_request};
use super::{ImageProvider, LlmError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::multipart::{Form, Part};
use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use tracing::debug;

const IMAGE_SIZE: &str = "1024x1024";

/// Decodes a `data:image/...;base64,` URL into raw bytes.
///
/// # Errors
///
/// Returns `LlmError::ApiError` if the URL is not an inline image or the
/// payload is not valid base64.
pub fn decode_data_url(url: &str) -> Result<Vec<u8>, LlmError> {
    if !url.starts_with("data:image") {
        return Err(LlmError::ApiError(
            "Unexpected image format in response".to_string(),
        ));
    }
    let (_, payload) = url
        .split_once(',')
        .ok_or_else(|| LlmError::ApiError("Malformed data URL".to_string()))?;
    BASE64
        .decode(payload.trim())
        .map_err(|e| LlmError::ApiError(format!("Invalid base64 image: {e}")))
}

fn decode_b64_json(response: &Value) -> Result<Vec<u8>, LlmError> {
    let b64 = extract_text_content(response, &["data", "0", "b64_json"])?;
    BASE64
        .decode(b64)
        .map_err(|e| LlmError::ApiError(format!("Invalid base64 image: {e}")))
}

/// OpenAI Images API (`/images/generations` and `/images/edits`)
pub struct ImagesApiProvider {
    http_client: HttpClient,
    api_key: String,
    api_base: String,
    model: String,
}

impl ImagesApiProvider {
    /// Create a new provider
    #[must_use]
    pub fn new(api_key: String, api_base: String, model: String, timeout_secs: u64) -> Self {
        Self {
            http_client: http_utils::create_http_client(timeout_secs),
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
            model,
        }
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.api_key)
    }
}

#[async_trait]
impl ImageProvider for ImagesApiProvider {
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>, LlmError> {
        let url = format!("{}/images/generations", self.api_base);
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "size": IMAGE_SIZE,
            "n": 1
        });
        debug!(model = %self.model, "Generating image");
        let response = send_json_request(&self.http_client, &url, &body, Some(&self.auth())).await?;
        decode_b64_json(&response)
    }

    async fn edit(&self, image_bytes: Vec<u8>, instruction: &str) -> Result<Vec<u8>, LlmError> {
        let url = format!("{}/images/edits", self.api_base);
        let image = Part::bytes(image_bytes)
            .file_name("image.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| LlmError::Unknown(e.to_string()))?;
        let form = Form::new()
            .text("model", self.model.clone())
            .text("prompt", instruction.to_string())
            .text("size", IMAGE_SIZE)
            .part("image", image);

        debug!(model = %self.model, "Editing image");
        let response = send_multipart_request(&self.http_client, &url, form, Some(&self.auth())).await?;
        decode_b64_json(&response)
    }
}

/// Images through chat completions with `modalities: ["image", "text"]`,
/// as served by AITUNNEL
pub struct ChatImageProvider {
    http_client: HttpClient,
    api_key: String,
    api_base: String,
    model: String,
}

impl ChatImageProvider {
    /// Create a new provider
    #[must_use]
    pub fn new(api_key: String, api_base: String, model: String, timeout_secs: u64) -> Self {
        Self {
            http_client: http_utils::create_http_client(timeout_secs),
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
            model,
        }
    }

    async fn request_image(&self, content: Value) -> Result<Vec<u8>, LlmError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": content}],
            "modalities": ["image", "text"]
        });
        let auth = format!("Bearer {}", self.api_key);
        let response = send_json_request(&self.http_client, &url, &body, Some(&auth)).await?;
        let data_url = extract_text_content(
            &response,
            &["choices", "0", "message", "images", "0", "image_url", "url"],
        )
        .map_err(|_| LlmError::ApiError("Model returned no image".to_string()))?;
        decode_data_url(&data_url)
    }
}

#[async_trait]
impl ImageProvider for ChatImageProvider {
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>, LlmError> {
        debug!(model = %self.model, "Generating image via chat completions");
        self.request_image(json!(prompt)).await
    }

    async fn edit(&self, image_bytes: Vec<u8>, instruction: &str) -> Result<Vec<u8>, LlmError> {
        let data_url = format!("data:image/jpeg;base64,{}", BASE64.encode(&image_bytes));
        debug!(model = %self.model, "Editing image via chat completions");
        self.request_image(json!([
            {"type": "text", "text": instruction},
            {"type": "image_url", "image_url": {"url": data_url, "detail": "high"}}
        ]))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_data_url() {
        let bytes = decode_data_url("data:image/png;base64,iVBORw==").expect("valid url");
        assert_eq!(bytes, vec![0x89, 0x50, 0x4E, 0x47]);
    }

    #[test]
    fn test_decode_data_url_rejects_remote_links() {
        assert!(decode_data_url("https://cdn.example.com/a.png").is_err());
        assert!(decode_data_url("data:image/png;base64").is_err());
        assert!(decode_data_url("data:image/png;base64,@@@").is_err());
    }

    #[test]
    fn test_decode_b64_json_reads_first_item() {
        let response = json!({"data": [{"b64_json": "AQID"}]});
        assert_eq!(decode_b64_json(&response).ok(), Some(vec![1, 2, 3]));
        assert!(decode_b64_json(&json!({"data": []})).is_err());
    }
}

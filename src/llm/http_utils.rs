//! HTTP helpers shared by the reqwest-based providers.

use crate::llm::LlmError;
use reqwest::multipart::Form;
use reqwest::{Client as HttpClient, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;

const MAX_ERROR_BODY: usize = 500;

/// Creates an HTTP client with a request timeout.
///
/// Falls back to a default client if the builder fails.
#[must_use]
pub fn create_http_client(timeout_secs: u64) -> HttpClient {
    HttpClient::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_else(|_| HttpClient::new())
}

/// Sends a POST request with a JSON body and returns the parsed JSON response.
///
/// # Errors
///
/// Returns `LlmError::NetworkError` on connectivity issues, `LlmError::ApiError` on non-success status codes,
/// or `LlmError::JsonError` if parsing fails.
pub async fn send_json_request(
    client: &HttpClient,
    url: &str,
    body: &Value,
    auth_header: Option<&str>,
) -> Result<Value, LlmError> {
    send(with_auth(client.post(url).json(body), auth_header)).await
}

/// Sends a POST request with a multipart body and returns the parsed JSON response.
///
/// # Errors
///
/// Same as [`send_json_request`].
pub async fn send_multipart_request(
    client: &HttpClient,
    url: &str,
    form: Form,
    auth_header: Option<&str>,
) -> Result<Value, LlmError> {
    send(with_auth(client.post(url).multipart(form), auth_header)).await
}

fn with_auth(request: RequestBuilder, auth_header: Option<&str>) -> RequestBuilder {
    match auth_header {
        Some(auth) => request.header("Authorization", auth),
        None => request,
    }
}

async fn send(request: RequestBuilder) -> Result<Value, LlmError> {
    let response = request
        .send()
        .await
        .map_err(|e| LlmError::NetworkError(e.to_string()))?;
    parse_json_response(response).await
}

/// Checks the status and decodes the JSON body of a response.
///
/// # Errors
///
/// Returns `LlmError::ApiError` on non-success status codes and
/// `LlmError::JsonError` if the body is not JSON.
pub async fn parse_json_response(response: Response) -> Result<Value, LlmError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::ApiError(summarize_error_body(status, &body)));
    }

    response
        .json()
        .await
        .map_err(|e| LlmError::JsonError(e.to_string()))
}

/// One-line description of a failed response.
///
/// Proxy HTML error pages are replaced by a note, long bodies are cut.
#[must_use]
pub fn summarize_error_body(status: reqwest::StatusCode, body: &str) -> String {
    let head = body.trim_start();
    let is_html = ["<!DOCTYPE", "<html", "<HTML"]
        .iter()
        .any(|prefix| head.starts_with(prefix));

    if is_html {
        return format!("API error: {status} (Server returned HTML error page)");
    }

    if body.chars().count() > MAX_ERROR_BODY {
        let cut = crate::utils::truncate_str(body, MAX_ERROR_BODY);
        format!("API error: {status} - {cut}... (truncated)")
    } else {
        format!("API error: {status} - {body}")
    }
}

/// Walks a JSON value by keys and array indices and returns the string at the end.
///
/// ```ignore
/// let url = extract_text_content(&json, &["choices", "0", "message", "content"])?;
/// ```
///
/// # Errors
///
/// Returns `LlmError::ApiError` if the path is invalid or the target is not a string.
pub fn extract_text_content(response: &Value, path: &[&str]) -> Result<String, LlmError> {
    let mut current = response;

    for segment in path {
        current = match segment.parse::<usize>() {
            Ok(index) => current.get(index).ok_or_else(|| {
                LlmError::ApiError(format!("Invalid path: missing index {index}"))
            })?,
            Err(_) => current.get(*segment).ok_or_else(|| {
                LlmError::ApiError(format!("Invalid path: missing key {segment}"))
            })?,
        };
    }

    current
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| LlmError::ApiError(format!("Expected string at path, got: {current:?}")))
}

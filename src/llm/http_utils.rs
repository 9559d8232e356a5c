//! HTTP utilities for LLM providers
//!
//! Provides common HTTP request/response handling for provider implementations.

use crate::llm::LlmError;
use reqwest::Client as HttpClient;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

/// Creates an HTTP client with the given request timeout.
///
/// This prevents infinite hangs when the API is slow or unresponsive.
#[must_use]
pub fn create_http_client(timeout_secs: u64) -> HttpClient {
    HttpClient::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_else(|_| HttpClient::new())
}

/// Sends an HTTP POST request with JSON body and returns parsed JSON response.
///
/// # Arguments
/// * `client` - HTTP client to use
/// * `url` - Target URL
/// * `body` - JSON body to send
/// * `headers` - Additional headers as key-value pairs
///
/// # Errors
///
/// Returns `LlmError::Timeout` or `LlmError::NetworkError` on connectivity issues,
/// `LlmError::RateLimit` on 429, `LlmError::ServerError` on 5xx,
/// `LlmError::ApiError` on other non-success status codes,
/// or `LlmError::JsonError` if parsing fails.
pub async fn send_json_request(
    client: &HttpClient,
    url: &str,
    body: &Value,
    headers: &[(&str, &str)],
) -> Result<Value, LlmError> {
    let mut request = client.post(url).json(body);

    for (key, value) in headers {
        request = request.header(*key, *value);
    }

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            LlmError::Timeout(e.without_url().to_string())
        } else {
            LlmError::NetworkError(e.without_url().to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let wait_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let error_text = response.text().await.unwrap_or_default();
        let message = clean_error_body(status, &error_text);

        return Err(match status {
            StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimit { wait_secs, message },
            s if s.is_server_error() => LlmError::ServerError(message),
            _ => LlmError::ApiError(message),
        });
    }

    response
        .json()
        .await
        .map_err(|e| LlmError::JsonError(e.to_string()))
}

/// Shortens an error body for logging, hiding HTML error pages from proxies.
fn clean_error_body(status: StatusCode, error_text: &str) -> String {
    let trimmed = error_text.trim_start();
    let is_html = trimmed.starts_with("<!DOCTYPE")
        || trimmed.starts_with("<html")
        || trimmed.starts_with("<HTML");

    if is_html {
        format!("{status} (Server returned HTML error page)")
    } else if error_text.chars().count() > 500 {
        format!(
            "{status} - {}... (truncated)",
            crate::utils::truncate_str(error_text, 500)
        )
    } else {
        format!("{status} - {error_text}")
    }
}

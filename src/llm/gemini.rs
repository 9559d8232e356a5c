//! Gemini `generateContent` provider

use super::http_utils::{create_http_client, send_json_request};
use super::{LlmError, LlmProvider, Turn};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// LLM provider implementation for Google Gemini
pub struct GeminiProvider {
    http_client: HttpClient,
    api_key: String,
}

impl GeminiProvider {
    /// Create a new Gemini provider instance
    #[must_use]
    pub fn new(api_key: String, timeout_secs: u64) -> Self {
        Self {
            http_client: create_http_client(timeout_secs),
            api_key,
        }
    }

    fn build_body(history: &[Turn], user_message: &str) -> Value {
        let mut contents: Vec<Value> = history
            .iter()
            .map(|turn| {
                json!({
                    "role": turn.role.as_str(),
                    "parts": [{"text": turn.text}]
                })
            })
            .collect();
        contents.push(json!({
            "role": "user",
            "parts": [{"text": user_message}]
        }));

        json!({
            "contents": contents,
            "safetySettings": [
                {"category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_MEDIUM_AND_ABOVE"},
                {"category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_MEDIUM_AND_ABOVE"},
                {"category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_MEDIUM_AND_ABOVE"},
                {"category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_MEDIUM_AND_ABOVE"}
            ]
        })
    }

    /// Concatenates the text parts of the first candidate.
    fn extract_reply(response: &Value) -> Result<String, LlmError> {
        if let Some(reason) = response
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
        {
            return Err(LlmError::Blocked(reason.to_string()));
        }

        let candidate = response
            .pointer("/candidates/0")
            .ok_or_else(|| LlmError::ApiError("Response has no candidates".to_string()))?;

        let parts = candidate
            .pointer("/content/parts")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                let reason = candidate
                    .get("finishReason")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                LlmError::Blocked(format!("no content (finish reason: {reason})"))
            })?;

        Ok(parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect())
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn chat_completion(
        &self,
        history: &[Turn],
        user_message: &str,
        model_id: &str,
    ) -> Result<String, LlmError> {
        if self.api_key.is_empty() {
            return Err(LlmError::MissingConfig("GEMINI_API_KEY".to_string()));
        }

        let url = format!("{GEMINI_API_BASE}/models/{model_id}:generateContent");
        let body = Self::build_body(history, user_message);

        let res_json = send_json_request(
            &self.http_client,
            &url,
            &body,
            &[("x-goog-api-key", self.api_key.as_str())],
        )
        .await?;

        Self::extract_reply(&res_json)
    }
}

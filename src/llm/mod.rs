//! Generative-text providers and the reply generator
//!
//! [`LlmProvider`] is the raw backend call. [`ResponseGenerator`] wraps it with
//! persona injection, retries on transient failures, and a fixed fallback so
//! callers always get text back.

pub mod gemini;
mod http_utils;

use crate::config::{
    GENERATION_FALLBACK_MESSAGE, LLM_INITIAL_BACKOFF_MS, LLM_MAX_BACKOFF_MS,
    PERSONA_ACKNOWLEDGEMENT, PERSONA_INSTRUCTION_PREFIX,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, error, warn};

/// Errors that can occur during LLM operations
#[derive(Debug, Error)]
pub enum LlmError {
    /// Error returned by the provider's API (4xx)
    #[error("API error: {0}")]
    ApiError(String),
    /// Provider-side failure (5xx)
    #[error("Server error: {0}")]
    ServerError(String),
    /// Error during network communication
    #[error("Network error: {0}")]
    NetworkError(String),
    /// The request did not complete in time
    #[error("Timeout: {0}")]
    Timeout(String),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    JsonError(String),
    /// Missing provider configuration or API key
    #[error("Missing client/API key: {0}")]
    MissingConfig(String),
    /// Rate limit exceeded (429), optionally with a wait time
    #[error("Rate limit exceeded: {message} (wait: {wait_secs:?}s)")]
    RateLimit {
        /// Retry-After duration in seconds, if provided by the server
        wait_secs: Option<u64>,
        /// Error message from the server
        message: String,
    },
    /// The provider refused to answer
    #[error("Blocked: {0}")]
    Blocked(String),
    /// The provider answered with no text
    #[error("Empty response")]
    EmptyResponse,
}

impl LlmError {
    /// Whether repeating the same request may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ServerError(_) | Self::NetworkError(_) | Self::Timeout(_) | Self::RateLimit { .. }
        )
    }
}

/// Author of a conversation turn, as the backend sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Anyone talking to the persona
    User,
    /// The persona itself
    Model,
}

impl Role {
    /// Wire name of the role
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }
}

/// One role-labelled message of conversation context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Who said it
    pub role: Role,
    /// What was said
    pub text: String,
}

impl Turn {
    /// A user turn
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    /// A model turn
    #[must_use]
    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

/// Interface for generative-text backends
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate the next model turn after `history` followed by `user_message`
    async fn chat_completion(
        &self,
        history: &[Turn],
        user_message: &str,
        model_id: &str,
    ) -> Result<String, LlmError>;
}

/// Produces reply text for a prompt, never failing towards the caller
pub struct ResponseGenerator {
    provider: Arc<dyn LlmProvider>,
    model_id: String,
    max_retries: usize,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
}

impl ResponseGenerator {
    /// Create a generator over `provider` using `model_id`
    #[must_use]
    pub fn new(provider: Arc<dyn LlmProvider>, model_id: impl Into<String>, max_retries: usize) -> Self {
        Self {
            provider,
            model_id: model_id.into(),
            max_retries,
            initial_backoff_ms: LLM_INITIAL_BACKOFF_MS,
            max_backoff_ms: LLM_MAX_BACKOFF_MS,
        }
    }

    /// Override the retry backoff bounds
    #[must_use]
    pub const fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    /// Model used for generation
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Prepends the persona instruction as a synthetic user/model exchange.
    ///
    /// The supplied history is kept exactly as given, oldest first.
    #[must_use]
    pub fn build_history(history: &[Turn], persona_instruction: Option<&str>) -> Vec<Turn> {
        let mut turns = Vec::with_capacity(history.len() + 2);
        if let Some(instruction) = persona_instruction {
            turns.push(Turn::user(format!("{PERSONA_INSTRUCTION_PREFIX}{instruction}")));
            turns.push(Turn::model(PERSONA_ACKNOWLEDGEMENT));
        }
        turns.extend_from_slice(history);
        turns
    }

    /// Generate a reply, returning the fallback apology on any failure
    pub async fn generate(
        &self,
        prompt: &str,
        history: &[Turn],
        persona_instruction: Option<&str>,
    ) -> String {
        match self.try_generate(prompt, history, persona_instruction).await {
            Ok(text) => text,
            Err(e) => {
                error!(model = %self.model_id, "Error generating response: {}", e);
                GENERATION_FALLBACK_MESSAGE.to_string()
            }
        }
    }

    /// Generate a reply, retrying transient failures
    ///
    /// # Errors
    ///
    /// Returns the last provider error, or `LlmError::EmptyResponse` when the
    /// backend produced only whitespace.
    pub async fn try_generate(
        &self,
        prompt: &str,
        history: &[Turn],
        persona_instruction: Option<&str>,
    ) -> Result<String, LlmError> {
        let turns = Self::build_history(history, persona_instruction);

        let retry_strategy = ExponentialBackoff::from_millis(self.initial_backoff_ms)
            .max_delay(Duration::from_millis(self.max_backoff_ms))
            .map(jitter)
            .take(self.max_retries);

        let provider = self.provider.as_ref();
        let turns = turns.as_slice();
        let model_id = self.model_id.as_str();

        let text = RetryIf::spawn(
            retry_strategy,
            || async move { provider.chat_completion(turns, prompt, model_id).await },
            |e: &LlmError| {
                let transient = e.is_transient();
                if transient {
                    warn!("Transient generation failure, retrying: {}", e);
                }
                transient
            },
        )
        .await?;

        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        debug!(chars = text.chars().count(), "Generated response");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn generator(mock: MockLlmProvider, retries: usize) -> ResponseGenerator {
        ResponseGenerator::new(Arc::new(mock), "test-model", retries).with_backoff(1, 2)
    }

    #[test]
    fn test_persona_injected_as_leading_exchange() {
        let history = vec![Turn::user("hi"), Turn::model("hello")];
        let turns = ResponseGenerator::build_history(&history, Some("You are Luna."));

        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0], Turn::user("System Instruction: You are Luna."));
        assert_eq!(
            turns[1],
            Turn::model("Understood. I will follow these instructions.")
        );
        assert_eq!(&turns[2..], history.as_slice());
    }

    #[test]
    fn test_history_untouched_without_persona() {
        let history = vec![Turn::user("a"), Turn::user("a"), Turn::model("b")];
        assert_eq!(ResponseGenerator::build_history(&history, None), history);
    }

    #[tokio::test]
    async fn test_generate_passes_prompt_and_model() {
        let mut mock = MockLlmProvider::new();
        mock.expect_chat_completion()
            .with(always(), eq("hello"), eq("test-model"))
            .times(1)
            .returning(|turns, _, _| {
                assert_eq!(turns.len(), 2);
                Ok("Hi there!".to_string())
            });

        let reply = generator(mock, 2)
            .generate("hello", &[], Some("You are Luna."))
            .await;
        assert_eq!(reply, "Hi there!");
    }

    #[tokio::test]
    async fn test_permanent_error_falls_back_without_retry() {
        let mut mock = MockLlmProvider::new();
        mock.expect_chat_completion()
            .times(1)
            .returning(|_, _, _| Err(LlmError::ApiError("400 - bad request".to_string())));

        let reply = generator(mock, 3).generate("hello", &[], None).await;
        assert_eq!(reply, GENERATION_FALLBACK_MESSAGE);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut mock = MockLlmProvider::new();
        mock.expect_chat_completion().returning(move |_, _, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(LlmError::NetworkError("connection reset".to_string()))
            } else {
                Ok("recovered".to_string())
            }
        });

        let reply = generator(mock, 2).generate("hello", &[], None).await;
        assert_eq!(reply, "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let mut mock = MockLlmProvider::new();
        mock.expect_chat_completion()
            .times(3)
            .returning(|_, _, _| Err(LlmError::Timeout("deadline".to_string())));

        let reply = generator(mock, 2).generate("hello", &[], None).await;
        assert_eq!(reply, GENERATION_FALLBACK_MESSAGE);
    }

    #[tokio::test]
    async fn test_blank_text_falls_back() {
        let mut mock = MockLlmProvider::new();
        mock.expect_chat_completion()
            .returning(|_, _, _| Ok("  \n".to_string()));

        let gen = generator(mock, 0);
        assert!(matches!(
            gen.try_generate("hello", &[], None).await,
            Err(LlmError::EmptyResponse)
        ));
        assert_eq!(gen.generate("hello", &[], None).await, GENERATION_FALLBACK_MESSAGE);
    }
}

//! Per-message decision pipeline
//!
//! Runs one inbound message through the bot filter, scope filter, consent
//! gate, cooldown, context assembly, generation and reply. Nothing in here
//! returns an error: every failure ends as a logged event and, where the
//! user is waiting on an answer, a fixed reply.

use super::outcome::{IgnoreReason, PipelineOutcome};
use super::rate_limiter::RateLimiter;
use crate::character::Character;
use crate::config::{
    HistoryScope, Settings, CONSENT_GRANTED_MESSAGE, CONSENT_KEYWORD, CONSENT_REQUEST_MESSAGE,
    EMPTY_PROMPT_PLACEHOLDER, PIPELINE_FAILURE_MESSAGE, RATE_LIMITED_MESSAGE,
};
use crate::consent::{ConsentRecord, ConsentStore, ConsentUpdate};
use crate::gateway::{GatewayError, GatewaySession, HistoryMessage, InboundMessage};
use crate::llm::{ResponseGenerator, Turn};
use crate::utils::{retry_gateway_operation, split_reply_chunks, strip_own_mention};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Tunables of the pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Prior messages fetched as context
    pub history_limit: u8,
    /// Which prior messages count as context
    pub history_scope: HistoryScope,
    /// Longest single reply message, in characters
    pub max_chunk_chars: usize,
    /// Minimum spacing between routed messages of one user
    pub rate_limit_cooldown: Duration,
    /// Users tracked by the cooldown ledger at once
    pub rate_limit_capacity: u64,
}

impl PipelineSettings {
    /// Pipeline tunables from the loaded settings
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            history_limit: settings.history_limit(),
            history_scope: settings.history_scope,
            max_chunk_chars: settings.reply_chunk_chars(),
            rate_limit_cooldown: settings.rate_limit_cooldown(),
            rate_limit_capacity: settings.rate_limit_capacity,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Message pipeline of one connection, owning that connection's cooldown ledger
pub struct MessagePipeline {
    consent: Arc<dyn ConsentStore>,
    generator: Arc<ResponseGenerator>,
    rate_limiter: RateLimiter,
    settings: PipelineSettings,
}

impl MessagePipeline {
    /// Create a pipeline with an empty cooldown ledger
    #[must_use]
    pub fn new(
        consent: Arc<dyn ConsentStore>,
        generator: Arc<ResponseGenerator>,
        settings: PipelineSettings,
    ) -> Self {
        let rate_limiter =
            RateLimiter::new(settings.rate_limit_cooldown, settings.rate_limit_capacity);
        Self {
            consent,
            generator,
            rate_limiter,
            settings,
        }
    }

    /// Runs `message` through every step and reports where it ended.
    ///
    /// `character` is the persona snapshot current when the message arrived.
    pub async fn handle(
        &self,
        session: &dyn GatewaySession,
        character: &Character,
        message: &InboundMessage,
    ) -> PipelineOutcome {
        if message.author_is_bot {
            return PipelineOutcome::Ignored(IgnoreReason::FromBot);
        }

        let self_id = session.self_id();
        if !message.is_dm && !message.mentions(&self_id) {
            return PipelineOutcome::Ignored(IgnoreReason::OutOfScope);
        }

        let user_id = message.author_id.as_str();
        let body = strip_own_mention(&message.content, &self_id);

        if !self.has_consented(user_id).await {
            return self.consent_gate(session, message, &body).await;
        }

        if !self.rate_limiter.try_acquire(user_id).await {
            info!(
                character_id = %character.id,
                user_id = %user_id,
                rejected = self.rate_limiter.rejected_count(),
                tracked = self.rate_limiter.entry_count(),
                "Rate limited message"
            );
            self.reply(session, message, RATE_LIMITED_MESSAGE).await;
            return PipelineOutcome::RateLimited;
        }

        if let Err(e) = session.start_typing(&message.channel_id).await {
            debug!(channel_id = %message.channel_id, "Typing indicator failed: {}", e);
        }

        let turns = match self.assemble_context(session, &self_id, message).await {
            Ok(turns) => turns,
            Err(e) => {
                warn!(
                    character_id = %character.id,
                    channel_id = %message.channel_id,
                    "Failed to fetch conversation context, replying without it: {}", e
                );
                Vec::new()
            }
        };

        let prompt = if body.is_empty() {
            EMPTY_PROMPT_PLACEHOLDER
        } else {
            body.as_str()
        };

        let text = self
            .generator
            .generate(prompt, &turns, character.persona_instruction())
            .await;

        let chunks = split_reply_chunks(&text, self.settings.max_chunk_chars);
        let total = chunks.len();
        for (sent, chunk) in chunks.iter().enumerate() {
            if let Err(e) = self.send(session, message, chunk).await {
                error!(
                    character_id = %character.id,
                    channel_id = %message.channel_id,
                    "Failed to send reply part {}/{}: {}", sent + 1, total, e
                );
                return PipelineOutcome::DispatchFailed { sent };
            }
        }

        if let Err(e) = self
            .consent
            .update(user_id, ConsentUpdate::touch(Utc::now()))
            .await
        {
            warn!(user_id = %user_id, "Failed to refresh last interaction: {}", e);
        }

        debug!(
            character_id = %character.id,
            user_id = %user_id,
            chunks = total,
            "Replied"
        );
        PipelineOutcome::Replied { chunks: total }
    }

    /// Reads consent, treating a failed read as not consented
    async fn has_consented(&self, user_id: &str) -> bool {
        match self.consent.get(user_id).await {
            Ok(record) => record.is_some_and(|r| r.has_consented),
            Err(e) => {
                warn!(user_id = %user_id, "Consent lookup failed, asking again: {}", e);
                false
            }
        }
    }

    async fn consent_gate(
        &self,
        session: &dyn GatewaySession,
        message: &InboundMessage,
        body: &str,
    ) -> PipelineOutcome {
        let user_id = message.author_id.as_str();

        if !body.eq_ignore_ascii_case(CONSENT_KEYWORD) {
            self.reply(session, message, CONSENT_REQUEST_MESSAGE).await;
            return PipelineOutcome::ConsentRequested;
        }

        let record = ConsentRecord::granted(user_id, Utc::now());
        if let Err(e) = self.consent.set(user_id, record).await {
            error!(user_id = %user_id, "Failed to store consent: {}", e);
            self.reply(session, message, PIPELINE_FAILURE_MESSAGE).await;
            return PipelineOutcome::Failed;
        }

        info!(user_id = %user_id, "User granted consent");
        self.reply(session, message, CONSENT_GRANTED_MESSAGE).await;
        PipelineOutcome::ConsentGranted
    }

    /// Prior messages as turns, oldest first
    async fn assemble_context(
        &self,
        session: &dyn GatewaySession,
        self_id: &str,
        message: &InboundMessage,
    ) -> Result<Vec<Turn>, GatewayError> {
        let history = session
            .fetch_recent_messages(
                &message.channel_id,
                self.settings.history_limit,
                &message.message_id,
            )
            .await?;

        Ok(history_to_turns(
            history,
            self_id,
            &message.author_id,
            self.settings.history_scope,
        ))
    }

    async fn send(
        &self,
        session: &dyn GatewaySession,
        message: &InboundMessage,
        text: &str,
    ) -> Result<(), GatewayError> {
        retry_gateway_operation("send reply", || {
            session.send_reply(&message.channel_id, &message.message_id, text)
        })
        .await
    }

    /// Sends a fixed notice, logging delivery failure
    async fn reply(&self, session: &dyn GatewaySession, message: &InboundMessage, text: &str) {
        if let Err(e) = self.send(session, message, text).await {
            error!(channel_id = %message.channel_id, "Failed to send notice: {}", e);
        }
    }
}

/// Labels history for the generator.
///
/// Messages by `self_id` become model turns, everything else a user turn.
/// Blank messages are dropped. With [`HistoryScope::Author`] only the
/// sender's and this bot's messages are kept.
#[must_use]
pub fn history_to_turns(
    history: Vec<HistoryMessage>,
    self_id: &str,
    sender_id: &str,
    scope: HistoryScope,
) -> Vec<Turn> {
    history
        .into_iter()
        .filter(|m| !m.content.trim().is_empty())
        .filter(|m| match scope {
            HistoryScope::Channel => true,
            HistoryScope::Author => m.author_id == self_id || m.author_id == sender_id,
        })
        .map(|m| {
            if m.author_id == self_id {
                Turn::model(m.content)
            } else {
                Turn::user(m.content)
            }
        })
        .collect()
}

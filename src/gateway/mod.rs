//! Chat gateway abstraction
//!
//! A [`Gateway`] logs in with a bot credential and hands back a live
//! [`GatewaySession`] plus the stream of inbound messages it receives.
//! Identifiers are Discord snowflakes carried as strings.

pub mod discord;
pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by gateway sessions
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The credential was rejected or the session never became ready
    #[error("Login failed: {0}")]
    Login(String),
    /// A call over an established session failed
    #[error("Transport error: {0}")]
    Transport(String),
    /// An identifier could not be parsed
    #[error("Invalid id: {0}")]
    InvalidId(String),
    /// The session has been shut down
    #[error("Session closed")]
    Closed,
}

/// A message delivered to the bot account
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InboundMessage {
    /// Message id
    pub message_id: String,
    /// Channel the message was posted in
    pub channel_id: String,
    /// Sender account id
    pub author_id: String,
    /// Whether the sender is a bot account (including this one)
    pub author_is_bot: bool,
    /// Whether the message is a direct message
    pub is_dm: bool,
    /// Accounts explicitly mentioned in the message
    pub mentioned_ids: Vec<String>,
    /// Raw message body
    pub content: String,
}

impl InboundMessage {
    /// Whether `account_id` is among the explicit mentions
    #[must_use]
    pub fn mentions(&self, account_id: &str) -> bool {
        self.mentioned_ids.iter().any(|id| id == account_id)
    }
}

/// A prior message fetched as conversation context
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistoryMessage {
    /// Message id
    pub message_id: String,
    /// Sender account id
    pub author_id: String,
    /// Message body
    pub content: String,
}

/// A freshly established session and its inbound message stream
pub struct GatewayConnection {
    /// Handle used to act on the session
    pub session: Arc<dyn GatewaySession>,
    /// Messages received by the session, in arrival order
    pub events: mpsc::Receiver<InboundMessage>,
}

/// Something that can open bot sessions from a credential
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Log in with `credential` and wait until the session is ready
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Login` if the credential is rejected or the
    /// session cannot be established.
    async fn connect(&self, credential: &str) -> Result<GatewayConnection, GatewayError>;
}

/// A live bot session
#[async_trait]
pub trait GatewaySession: Send + Sync {
    /// Account id of the logged-in bot
    fn self_id(&self) -> String;

    /// Up to `limit` messages posted in `channel_id` before `before_message_id`,
    /// oldest first
    async fn fetch_recent_messages(
        &self,
        channel_id: &str,
        limit: u8,
        before_message_id: &str,
    ) -> Result<Vec<HistoryMessage>, GatewayError>;

    /// Post `text` in `channel_id` as a reply to `reply_to_message_id`
    async fn send_reply(
        &self,
        channel_id: &str,
        reply_to_message_id: &str,
        text: &str,
    ) -> Result<(), GatewayError>;

    /// Show the typing indicator in `channel_id`
    async fn start_typing(&self, channel_id: &str) -> Result<(), GatewayError>;

    /// Replace the bot account's avatar with the image at `url`
    async fn set_avatar(&self, url: &str) -> Result<(), GatewayError>;

    /// Close the session; no further messages are delivered afterwards
    async fn shutdown(&self);
}

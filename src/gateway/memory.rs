//! In-process gateway
//!
//! Sessions live entirely in memory: messages are injected with
//! [`MemorySession::deliver`] and replies are recorded instead of sent.
//! Used by the test suites to drive connections without Discord.

use super::{
    Gateway, GatewayConnection, GatewayError, GatewaySession, HistoryMessage, InboundMessage,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// A reply recorded by a [`MemorySession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentReply {
    /// Channel the reply went to
    pub channel_id: String,
    /// Message being replied to
    pub reply_to: String,
    /// Reply body
    pub text: String,
}

type ChannelLog = Arc<Mutex<HashMap<String, Vec<HistoryMessage>>>>;

/// Gateway whose accounts are registered up front
#[derive(Default)]
pub struct MemoryGateway {
    accounts: Mutex<HashMap<String, String>>,
    sessions: Mutex<Vec<Arc<MemorySession>>>,
    channels: ChannelLog,
    next_message_id: Arc<AtomicU64>,
    connect_delay: Mutex<Duration>,
}

impl MemoryGateway {
    /// Gateway with no accounts
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `credential` as the login for `account_id`
    pub async fn register(&self, credential: &str, account_id: &str) {
        self.accounts
            .lock()
            .await
            .insert(credential.to_string(), account_id.to_string());
    }

    /// Delay every subsequent login by `delay`
    pub async fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().await = delay;
    }

    /// Every session opened with `credential`, oldest first
    pub async fn sessions_for(&self, credential: &str) -> Vec<Arc<MemorySession>> {
        self.sessions
            .lock()
            .await
            .iter()
            .filter(|s| s.credential == credential)
            .cloned()
            .collect()
    }

    /// Most recent session opened with `credential`
    pub async fn latest_session(&self, credential: &str) -> Option<Arc<MemorySession>> {
        self.sessions_for(credential).await.pop()
    }

    /// Number of successful logins
    pub async fn connect_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Number of sessions that have not been shut down
    pub async fn open_session_count(&self) -> usize {
        self.sessions
            .lock()
            .await
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }

    /// Append a message to a channel's history without delivering it
    pub async fn post_history(&self, channel_id: &str, author_id: &str, content: &str) -> String {
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst) + 1;
        let message_id = message_id.to_string();
        self.channels
            .lock()
            .await
            .entry(channel_id.to_string())
            .or_default()
            .push(HistoryMessage {
                message_id: message_id.clone(),
                author_id: author_id.to_string(),
                content: content.to_string(),
            });
        message_id
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn connect(&self, credential: &str) -> Result<GatewayConnection, GatewayError> {
        let delay = *self.connect_delay.lock().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let account_id = self
            .accounts
            .lock()
            .await
            .get(credential)
            .cloned()
            .ok_or_else(|| GatewayError::Login("unknown credential".to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        let session = Arc::new(MemorySession {
            credential: credential.to_string(),
            self_id: account_id,
            inbound: Mutex::new(Some(tx)),
            channels: self.channels.clone(),
            next_message_id: self.next_message_id.clone(),
            sent: Mutex::new(Vec::new()),
            avatars: Mutex::new(Vec::new()),
            typing: AtomicUsize::new(0),
            send_budget: AtomicUsize::new(usize::MAX),
            fail_history: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.sessions.lock().await.push(session.clone());

        Ok(GatewayConnection {
            session,
            events: rx,
        })
    }
}

/// One in-memory bot session
pub struct MemorySession {
    credential: String,
    self_id: String,
    inbound: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    channels: ChannelLog,
    next_message_id: Arc<AtomicU64>,
    sent: Mutex<Vec<SentReply>>,
    avatars: Mutex<Vec<String>>,
    typing: AtomicUsize,
    send_budget: AtomicUsize,
    fail_history: AtomicBool,
    closed: AtomicBool,
}

impl MemorySession {
    /// Post `message` in its channel and hand it to the session's consumer.
    ///
    /// A blank `message_id` is filled in. Returns the id, or `None` when the
    /// session is closed.
    pub async fn deliver(&self, mut message: InboundMessage) -> Option<String> {
        if message.message_id.is_empty() {
            let id = self.next_message_id.fetch_add(1, Ordering::SeqCst) + 1;
            message.message_id = id.to_string();
        }
        let message_id = message.message_id.clone();

        let tx = self.inbound.lock().await.clone()?;
        self.channels
            .lock()
            .await
            .entry(message.channel_id.clone())
            .or_default()
            .push(HistoryMessage {
                message_id: message_id.clone(),
                author_id: message.author_id.clone(),
                content: message.content.clone(),
            });
        tx.send(message).await.ok()?;
        Some(message_id)
    }

    /// Replies sent so far, in order
    pub async fn sent(&self) -> Vec<SentReply> {
        self.sent.lock().await.clone()
    }

    /// Reply bodies sent so far, in order
    pub async fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .map(|r| r.text.clone())
            .collect()
    }

    /// Avatar URLs applied so far, in order
    pub async fn avatars(&self) -> Vec<String> {
        self.avatars.lock().await.clone()
    }

    /// Number of typing indicators shown
    #[must_use]
    pub fn typing_count(&self) -> usize {
        self.typing.load(Ordering::SeqCst)
    }

    /// Make every later `send_reply` fail, or succeed again
    pub fn fail_sends(&self, fail: bool) {
        let budget = if fail { 0 } else { usize::MAX };
        self.send_budget.store(budget, Ordering::SeqCst);
    }

    /// Let the next `sends` replies through, then fail every later one
    pub fn fail_sends_after(&self, sends: usize) {
        self.send_budget.store(sends, Ordering::SeqCst);
    }

    /// Make every later history fetch fail, or succeed again
    pub fn fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    /// Whether `shutdown` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewaySession for MemorySession {
    fn self_id(&self) -> String {
        self.self_id.clone()
    }

    async fn fetch_recent_messages(
        &self,
        channel_id: &str,
        limit: u8,
        before_message_id: &str,
    ) -> Result<Vec<HistoryMessage>, GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::Closed);
        }
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("history unavailable".to_string()));
        }
        let channels = self.channels.lock().await;
        let Some(log) = channels.get(channel_id) else {
            return Ok(Vec::new());
        };
        let end = log
            .iter()
            .position(|m| m.message_id == before_message_id)
            .unwrap_or(log.len());
        let start = end.saturating_sub(usize::from(limit));
        Ok(log[start..end].to_vec())
    }

    async fn send_reply(
        &self,
        channel_id: &str,
        reply_to_message_id: &str,
        text: &str,
    ) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::Closed);
        }
        let admitted = self
            .send_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| match budget {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if !admitted {
            return Err(GatewayError::Transport("send rejected".to_string()));
        }

        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.channels
            .lock()
            .await
            .entry(channel_id.to_string())
            .or_default()
            .push(HistoryMessage {
                message_id: id.to_string(),
                author_id: self.self_id.clone(),
                content: text.to_string(),
            });
        self.sent.lock().await.push(SentReply {
            channel_id: channel_id.to_string(),
            reply_to: reply_to_message_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn start_typing(&self, _channel_id: &str) -> Result<(), GatewayError> {
        self.typing.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_avatar(&self, url: &str) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::Closed);
        }
        self.avatars.lock().await.push(url.to_string());
        Ok(())
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.inbound.lock().await.take();
    }
}

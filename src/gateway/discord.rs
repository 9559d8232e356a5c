//! Discord gateway over serenity
//!
//! Each [`DiscordGateway::connect`] builds its own serenity client, runs it on
//! a background task and resolves once the `ready` event arrives.

use super::{
    Gateway, GatewayConnection, GatewayError, GatewaySession, HistoryMessage, InboundMessage,
};
use async_trait::async_trait;
use serenity::all::{
    ChannelId, Client, Context, CreateAttachment, CreateMessage, EditProfile, EventHandler,
    GatewayIntents, GetMessages, Http, Message, MessageId, Ready, ShardManager, UserId,
};
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// How long a login may take before it is abandoned
const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);
/// Inbound messages buffered per session
const EVENT_BUFFER: usize = 256;

/// Opens Discord bot sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscordGateway;

impl DiscordGateway {
    /// Intents needed to see guild messages, their content, and DMs
    #[must_use]
    pub fn intents() -> GatewayIntents {
        GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
            | GatewayIntents::DIRECT_MESSAGES
    }
}

struct Handler {
    events: mpsc::Sender<InboundMessage>,
    ready: Mutex<Option<oneshot::Sender<UserId>>>,
}

#[serenity::async_trait]
impl EventHandler for Handler {
    async fn message(&self, _ctx: Context, msg: Message) {
        let inbound = InboundMessage {
            message_id: msg.id.to_string(),
            channel_id: msg.channel_id.to_string(),
            author_id: msg.author.id.to_string(),
            author_is_bot: msg.author.bot,
            is_dm: msg.guild_id.is_none(),
            mentioned_ids: msg.mentions.iter().map(|u| u.id.to_string()).collect(),
            content: msg.content,
        };
        if self.events.send(inbound).await.is_err() {
            debug!("Dropping message, session consumer is gone");
        }
    }

    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(bot = %ready.user.name, "Discord session ready");
        if let Some(tx) = self.ready.lock().await.take() {
            let _ = tx.send(ready.user.id);
        }
    }
}

#[async_trait]
impl Gateway for DiscordGateway {
    async fn connect(&self, credential: &str) -> Result<GatewayConnection, GatewayError> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();

        let handler = Handler {
            events: events_tx,
            ready: Mutex::new(Some(ready_tx)),
        };

        let mut client = Client::builder(credential, Self::intents())
            .event_handler(handler)
            .await
            .map_err(|e| GatewayError::Login(e.to_string()))?;

        let http = client.http.clone();
        let shard_manager = client.shard_manager.clone();

        // The client (and with it the ready sender) is dropped when start()
        // returns, which is how a rejected credential surfaces below.
        let runner = tokio::spawn(async move {
            if let Err(e) = client.start().await {
                error!("Discord client stopped: {}", e);
            }
        });

        let self_id = match tokio::time::timeout(LOGIN_TIMEOUT, ready_rx).await {
            Ok(Ok(id)) => id,
            Ok(Err(_)) => {
                runner.abort();
                return Err(GatewayError::Login(
                    "session closed before becoming ready".to_string(),
                ));
            }
            Err(_) => {
                shard_manager.shutdown_all().await;
                runner.abort();
                return Err(GatewayError::Login(format!(
                    "no ready event within {LOGIN_TIMEOUT:?}"
                )));
            }
        };

        let session = DiscordSession {
            http,
            shard_manager,
            self_id,
            runner: Mutex::new(Some(runner)),
        };

        Ok(GatewayConnection {
            session: Arc::new(session),
            events: events_rx,
        })
    }
}

/// A logged-in Discord bot
pub struct DiscordSession {
    http: Arc<Http>,
    shard_manager: Arc<ShardManager>,
    self_id: UserId,
    runner: Mutex<Option<JoinHandle<()>>>,
}

fn snowflake(raw: &str) -> Result<NonZeroU64, GatewayError> {
    raw.parse::<NonZeroU64>()
        .map_err(|_| GatewayError::InvalidId(raw.to_string()))
}

fn transport(e: serenity::Error) -> GatewayError {
    GatewayError::Transport(e.to_string())
}

#[async_trait]
impl GatewaySession for DiscordSession {
    fn self_id(&self) -> String {
        self.self_id.to_string()
    }

    async fn fetch_recent_messages(
        &self,
        channel_id: &str,
        limit: u8,
        before_message_id: &str,
    ) -> Result<Vec<HistoryMessage>, GatewayError> {
        let channel = ChannelId::from(snowflake(channel_id)?);
        let before = MessageId::from(snowflake(before_message_id)?);

        let mut messages = channel
            .messages(&*self.http, GetMessages::new().before(before).limit(limit))
            .await
            .map_err(transport)?;

        // Discord returns newest first
        messages.reverse();

        Ok(messages
            .into_iter()
            .map(|m| HistoryMessage {
                message_id: m.id.to_string(),
                author_id: m.author.id.to_string(),
                content: m.content,
            })
            .collect())
    }

    async fn send_reply(
        &self,
        channel_id: &str,
        reply_to_message_id: &str,
        text: &str,
    ) -> Result<(), GatewayError> {
        let channel = ChannelId::from(snowflake(channel_id)?);
        let reply_to = MessageId::from(snowflake(reply_to_message_id)?);

        let builder = CreateMessage::new()
            .content(text)
            .reference_message((channel, reply_to));

        channel
            .send_message(&*self.http, builder)
            .await
            .map(|_| ())
            .map_err(transport)
    }

    async fn start_typing(&self, channel_id: &str) -> Result<(), GatewayError> {
        let channel = ChannelId::from(snowflake(channel_id)?);
        channel.broadcast_typing(&*self.http).await.map_err(transport)
    }

    async fn set_avatar(&self, url: &str) -> Result<(), GatewayError> {
        let attachment = CreateAttachment::url(&*self.http, url)
            .await
            .map_err(transport)?;
        let mut user = self.http.get_current_user().await.map_err(transport)?;
        user.edit(&*self.http, EditProfile::new().avatar(&attachment))
            .await
            .map_err(transport)
    }

    async fn shutdown(&self) {
        self.shard_manager.shutdown_all().await;
        if let Some(runner) = self.runner.lock().await.take() {
            if let Err(e) = runner.await {
                debug!("Discord runner ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intents_cover_guilds_and_dms() {
        let intents = DiscordGateway::intents();
        assert!(intents.contains(GatewayIntents::MESSAGE_CONTENT));
        assert!(intents.contains(GatewayIntents::DIRECT_MESSAGES));
        assert!(intents.contains(GatewayIntents::GUILD_MESSAGES));
    }

    #[test]
    fn test_snowflake_rejects_garbage() {
        assert!(snowflake("123456789012345678").is_ok());
        assert!(matches!(snowflake("0"), Err(GatewayError::InvalidId(_))));
        assert!(matches!(snowflake("abc"), Err(GatewayError::InvalidId(_))));
    }
}

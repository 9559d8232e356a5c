//! Lifecycle of one persona's gateway session
//!
//! Start and stop are serialized by a lifecycle lock. Every stop bumps a
//! command epoch; a start that finds the epoch moved on since it was issued
//! abandons (or tears down) the session it was opening, so a stop issued
//! while a login is still in flight always ends in `Stopped`.
//!
//! The live session slot has its own short-lived lock and is never held
//! across a login, so character updates do not wait on the gateway.

use super::outcome::PipelineOutcome;
use super::pipeline::MessagePipeline;
use crate::character::Character;
use crate::gateway::{Gateway, GatewaySession, InboundMessage};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live session
    Stopped,
    /// A gateway session is established and dispatching messages
    Running,
}

/// Outcome of one handled message, as published to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandledMessage {
    /// Id of the inbound message
    pub message_id: String,
    /// Sender of the inbound message
    pub author_id: String,
    /// Where the pipeline ended
    pub outcome: PipelineOutcome,
}

struct ActiveSession {
    session: Arc<dyn GatewaySession>,
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
}

/// One persona's live connection
pub struct BotConnection {
    character_id: String,
    character: Arc<RwLock<Character>>,
    gateway: Arc<dyn Gateway>,
    pipeline: Arc<MessagePipeline>,
    lifecycle: Mutex<()>,
    active: Mutex<Option<ActiveSession>>,
    epoch: AtomicU64,
    start_count: AtomicUsize,
    state: watch::Sender<ConnectionState>,
    outcomes: broadcast::Sender<HandledMessage>,
}

impl BotConnection {
    /// A stopped connection for `character`
    #[must_use]
    pub fn new(
        character: Character,
        gateway: Arc<dyn Gateway>,
        pipeline: Arc<MessagePipeline>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Stopped);
        let (outcomes, _) = broadcast::channel(64);
        Self {
            character_id: character.id.clone(),
            character: Arc::new(RwLock::new(character)),
            gateway,
            pipeline,
            lifecycle: Mutex::new(()),
            active: Mutex::new(None),
            epoch: AtomicU64::new(0),
            start_count: AtomicUsize::new(0),
            state,
            outcomes,
        }
    }

    /// Identity of the character this connection serves
    #[must_use]
    pub fn character_id(&self) -> &str {
        &self.character_id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Receiver for the outcome of every message handled from now on
    #[must_use]
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<HandledMessage> {
        self.outcomes.subscribe()
    }

    /// Sessions successfully established over the connection's lifetime
    #[must_use]
    pub fn start_count(&self) -> usize {
        self.start_count.load(Ordering::SeqCst)
    }

    /// Credential of the held character snapshot
    pub async fn current_credential(&self) -> String {
        self.character.read().await.bot_token.clone()
    }

    /// Copy of the held character snapshot
    pub async fn character(&self) -> Character {
        self.character.read().await.clone()
    }

    /// Establishes the session unless already running.
    ///
    /// Failures are logged and leave the connection stopped.
    pub async fn start(&self) {
        let ticket = self.epoch.load(Ordering::SeqCst);
        self.start_with_ticket(ticket).await;
    }

    /// Issues a start without waiting for it.
    ///
    /// The command is ordered against stops at call time, not when the task
    /// first runs.
    pub fn spawn_start(self: &Arc<Self>) -> JoinHandle<()> {
        let ticket = self.epoch.load(Ordering::SeqCst);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.start_with_ticket(ticket).await })
    }

    /// Tears the session down if one is live
    pub async fn stop(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.stop_active().await;
    }

    /// Issues a stop without waiting for it; any start issued earlier is
    /// superseded immediately
    pub fn spawn_stop(self: &Arc<Self>) -> JoinHandle<()> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.stop_active().await })
    }

    /// Replaces the character snapshot without touching the session.
    ///
    /// A changed avatar is pushed to the live session on a best-effort basis.
    /// During a login the change is picked up once the session is up.
    pub async fn update_character(&self, character: Character) {
        let previous_avatar = {
            let mut held = self.character.write().await;
            let previous = held.avatar_url.clone();
            *held = character;
            previous
        };

        let avatar = self.character.read().await.avatar_url.clone();
        if avatar == previous_avatar {
            return;
        }
        let Some(url) = avatar.filter(|u| !u.trim().is_empty()) else {
            return;
        };

        let session = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|active| active.session.clone());
        if let Some(session) = session {
            self.spawn_avatar_sync(session, url);
        }
    }

    async fn start_with_ticket(&self, ticket: u64) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.active.lock().await.is_some() {
            debug!(character_id = %self.character_id, "Already running");
            return;
        }
        if self.superseded(ticket) {
            debug!(character_id = %self.character_id, "Start superseded by stop");
            return;
        }

        let character = self.character.read().await.clone();
        if !character.is_connectable() {
            warn!(character_id = %self.character_id, "Not starting: inactive or missing token");
            return;
        }

        info!(
            character_id = %self.character_id,
            name = %character.name,
            token = %character.credential_fingerprint(),
            "Starting bot"
        );

        let connection = match self.gateway.connect(&character.bot_token).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(
                    character_id = %self.character_id,
                    token = %character.credential_fingerprint(),
                    "Failed to start bot: {}", e
                );
                return;
            }
        };

        if self.superseded(ticket) {
            info!(character_id = %self.character_id, "Stopped while logging in, closing session");
            connection.session.shutdown().await;
            return;
        }

        let cancel = CancellationToken::new();
        let dispatcher =
            self.spawn_dispatcher(connection.session.clone(), connection.events, cancel.clone());

        *self.active.lock().await = Some(ActiveSession {
            session: connection.session.clone(),
            cancel,
            dispatcher,
        });
        self.start_count.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Running);
        info!(
            character_id = %self.character_id,
            bot_id = %connection.session.self_id(),
            "Bot running"
        );

        // Read after publishing the slot so an update racing the login is not lost
        let avatar = self.character.read().await.avatar_url.clone();
        if let Some(url) = avatar.filter(|u| !u.trim().is_empty()) {
            self.spawn_avatar_sync(connection.session, url);
        }
    }

    async fn stop_active(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(active) = self.active.lock().await.take() else {
            return;
        };

        active.cancel.cancel();
        active.session.shutdown().await;
        if let Err(e) = active.dispatcher.await {
            debug!(character_id = %self.character_id, "Dispatcher ended abnormally: {}", e);
        }

        self.state.send_replace(ConnectionState::Stopped);
        info!(character_id = %self.character_id, "Bot stopped");
    }

    fn superseded(&self, ticket: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != ticket
    }

    /// Hands each inbound message to its own pipeline task
    fn spawn_dispatcher(
        &self,
        session: Arc<dyn GatewaySession>,
        mut events: mpsc::Receiver<InboundMessage>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let character = self.character.clone();
        let pipeline = self.pipeline.clone();
        let outcomes = self.outcomes.clone();
        let character_id = self.character_id.clone();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = cancel.cancelled() => break,
                    message = events.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                let session = session.clone();
                let character = character.clone();
                let pipeline = pipeline.clone();
                let outcomes = outcomes.clone();
                tokio::spawn(async move {
                    let snapshot = character.read().await.clone();
                    let outcome = pipeline.handle(session.as_ref(), &snapshot, &message).await;
                    let _ = outcomes.send(HandledMessage {
                        message_id: message.message_id,
                        author_id: message.author_id,
                        outcome,
                    });
                });
            }
            debug!(character_id = %character_id, "Dispatcher finished");
        })
    }

    fn spawn_avatar_sync(&self, session: Arc<dyn GatewaySession>, url: String) {
        let character_id = self.character_id.clone();
        tokio::spawn(async move {
            match session.set_avatar(&url).await {
                Ok(()) => info!(character_id = %character_id, "Avatar synced"),
                Err(e) => warn!(character_id = %character_id, "Avatar sync failed: {}", e),
            }
        });
    }
}

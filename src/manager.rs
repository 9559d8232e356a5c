//! Connection registry
//!
//! Applies the character change feed to the set of live connections so that
//! exactly one connection exists per active character holding a token.
//! Start and stop are issued to the connections without waiting on them;
//! each connection reports its own state.

use crate::bot::{BotConnection, MessagePipeline, PipelineSettings};
use crate::character::{Character, CharacterEvent};
use crate::consent::ConsentStore;
use crate::gateway::Gateway;
use crate::llm::ResponseGenerator;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// Builds connections sharing one gateway, consent store and generator
pub struct ConnectionFactory {
    gateway: Arc<dyn Gateway>,
    consent: Arc<dyn ConsentStore>,
    generator: Arc<ResponseGenerator>,
    settings: PipelineSettings,
}

impl ConnectionFactory {
    /// Create a factory
    #[must_use]
    pub fn new(
        gateway: Arc<dyn Gateway>,
        consent: Arc<dyn ConsentStore>,
        generator: Arc<ResponseGenerator>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            gateway,
            consent,
            generator,
            settings,
        }
    }

    /// A stopped connection for `character` with its own cooldown ledger
    #[must_use]
    pub fn build(&self, character: Character) -> Arc<BotConnection> {
        let pipeline = MessagePipeline::new(
            self.consent.clone(),
            self.generator.clone(),
            self.settings.clone(),
        );
        Arc::new(BotConnection::new(
            character,
            self.gateway.clone(),
            Arc::new(pipeline),
        ))
    }
}

/// Map of character id to live connection
pub struct ConnectionRegistry {
    factory: ConnectionFactory,
    connections: Mutex<HashMap<String, Arc<BotConnection>>>,
}

impl ConnectionRegistry {
    /// An empty registry
    #[must_use]
    pub fn new(factory: ConnectionFactory) -> Self {
        Self {
            factory,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Applies one change-feed event
    pub async fn handle_event(&self, event: CharacterEvent) {
        match event {
            CharacterEvent::Added(character) => self.on_character_added(character).await,
            CharacterEvent::Modified(character) => self.on_character_modified(character).await,
            CharacterEvent::Removed(id) => self.on_character_removed(&id).await,
        }
    }

    /// Consumes events in order until the feed closes
    pub async fn run(&self, mut events: mpsc::Receiver<CharacterEvent>) {
        info!("Connection registry listening for character changes");
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        info!("Character feed closed, registry stops listening");
    }

    /// Starts a connection for a new character.
    ///
    /// Inactive or tokenless characters and already registered ids are skipped.
    pub async fn on_character_added(&self, character: Character) {
        let mut connections = self.connections.lock().await;
        self.add_locked(&mut connections, character);
    }

    /// Reconciles an edited character with its connection.
    ///
    /// Deactivation removes, activation adds, a new token replaces the
    /// connection, and anything else is pushed into the running connection.
    pub async fn on_character_modified(&self, character: Character) {
        let mut connections = self.connections.lock().await;
        let existing = connections.get(&character.id).cloned();

        let Some(connection) = existing else {
            if character.is_connectable() {
                self.add_locked(&mut connections, character);
            } else {
                debug!(character_id = %character.id, "Ignoring change of unregistered inactive character");
            }
            return;
        };

        if !character.is_connectable() {
            info!(character_id = %character.id, "Character deactivated, stopping bot");
            Self::remove_locked(&mut connections, &character.id);
            return;
        }

        if connection.current_credential().await != character.bot_token {
            info!(
                character_id = %character.id,
                token = %character.credential_fingerprint(),
                "Token changed, restarting bot"
            );
            Self::remove_locked(&mut connections, &character.id);
            self.add_locked(&mut connections, character);
            return;
        }

        debug!(character_id = %character.id, "Updating character in place");
        connection.update_character(character).await;
    }

    /// Stops and forgets the connection of a deleted character
    pub async fn on_character_removed(&self, character_id: &str) {
        let mut connections = self.connections.lock().await;
        if Self::remove_locked(&mut connections, character_id) {
            info!(character_id = %character_id, "Character removed, stopping bot");
        }
    }

    /// Connection registered for `character_id`
    pub async fn get(&self, character_id: &str) -> Option<Arc<BotConnection>> {
        self.connections.lock().await.get(character_id).cloned()
    }

    /// Registered character ids, sorted
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered connections
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Whether no connection is registered
    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Stops every connection and waits for each to finish
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.connections.lock().await.drain().collect();
        info!("Stopping {} bots", drained.len());
        for (_, connection) in drained {
            connection.stop().await;
        }
    }

    fn add_locked(&self, connections: &mut HashMap<String, Arc<BotConnection>>, character: Character) {
        if !character.is_connectable() {
            info!(character_id = %character.id, name = %character.name, "Skipping inactive or tokenless character");
            return;
        }
        if connections.contains_key(&character.id) {
            debug!(character_id = %character.id, "Bot already registered");
            return;
        }

        let id = character.id.clone();
        let connection = self.factory.build(character);
        connection.spawn_start();
        connections.insert(id, connection);
    }

    fn remove_locked(
        connections: &mut HashMap<String, Arc<BotConnection>>,
        character_id: &str,
    ) -> bool {
        match connections.remove(character_id) {
            Some(connection) => {
                connection.spawn_stop();
                true
            }
            None => false,
        }
    }
}

//! Change feed over the character collection
//!
//! Lists the character documents on an interval and turns version
//! differences into added/modified/removed events. A single task produces
//! every event, so events for one document are always delivered in order.

use super::{CharacterSource, StorageError};
use crate::character::CharacterEvent;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Polling change feed of character documents
pub struct CharacterFeed {
    source: Arc<dyn CharacterSource>,
    /// id -> last delivered version
    known: HashMap<String, String>,
}

impl CharacterFeed {
    /// Create a feed that has not delivered anything yet
    #[must_use]
    pub fn new(source: Arc<dyn CharacterSource>) -> Self {
        Self {
            source,
            known: HashMap::new(),
        }
    }

    /// Lists the collection once and returns the events since the last poll.
    ///
    /// The first poll reports every existing document as added. A document
    /// that fails to load is skipped and retried on the next poll.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing itself fails.
    pub async fn poll(&mut self) -> Result<Vec<CharacterEvent>, StorageError> {
        let mut listing = self.source.list_character_versions().await?;
        listing.sort_by(|a, b| a.id.cmp(&b.id));

        let mut events = Vec::new();
        let present: HashSet<String> = listing.iter().map(|d| d.id.clone()).collect();

        for doc in listing {
            let previous = self.known.get(&doc.id);
            if previous == Some(&doc.version) {
                continue;
            }
            let is_new = previous.is_none();

            match self.source.load_character(&doc.id).await {
                Ok(Some(character)) => {
                    self.known.insert(doc.id.clone(), doc.version);
                    events.push(if is_new {
                        CharacterEvent::Added(character)
                    } else {
                        CharacterEvent::Modified(character)
                    });
                }
                Ok(None) => {
                    // Deleted between listing and load
                    if self.known.remove(&doc.id).is_some() {
                        events.push(CharacterEvent::Removed(doc.id));
                    }
                }
                Err(e) => warn!(character_id = %doc.id, "Failed to load character: {}", e),
            }
        }

        let mut removed: Vec<String> = self
            .known
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();
        removed.sort();
        for id in removed {
            self.known.remove(&id);
            events.push(CharacterEvent::Removed(id));
        }

        Ok(events)
    }

    /// Polls on `interval` and forwards events to `tx` until cancelled or the
    /// receiver is dropped.
    pub fn spawn(
        mut self,
        interval: Duration,
        tx: mpsc::Sender<CharacterEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Starting character feed (interval: {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let events = match self.poll().await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!("Character listing failed: {}", e);
                        continue;
                    }
                };

                if !events.is_empty() {
                    debug!("Character feed produced {} events", events.len());
                }

                for event in events {
                    if tx.send(event).await.is_err() {
                        info!("Character feed receiver dropped, stopping feed.");
                        return;
                    }
                }
            }
            info!("Character feed stopped.");
        })
    }
}

//! Character documents flowing through the polling feed into the registry

use async_trait::async_trait;
use icord_manager::bot::PipelineSettings;
use icord_manager::character::Character;
use icord_manager::consent::InMemoryConsentStore;
use icord_manager::gateway::memory::MemoryGateway;
use icord_manager::llm::{LlmError, LlmProvider, ResponseGenerator, Turn};
use icord_manager::manager::{ConnectionFactory, ConnectionRegistry};
use icord_manager::storage::{CharacterFeed, CharacterSource, DocumentVersion, StorageError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

struct SilentProvider;

#[async_trait]
impl LlmProvider for SilentProvider {
    async fn chat_completion(
        &self,
        _history: &[Turn],
        _user_message: &str,
        _model_id: &str,
    ) -> Result<String, LlmError> {
        Err(LlmError::EmptyResponse)
    }
}

#[derive(Default)]
struct Documents {
    docs: Mutex<HashMap<String, (u32, Character)>>,
}

impl Documents {
    async fn put(&self, character: Character) {
        let mut docs = self.docs.lock().await;
        let version = docs.get(&character.id).map_or(1, |(v, _)| v + 1);
        docs.insert(character.id.clone(), (version, character));
    }

    async fn delete(&self, id: &str) {
        self.docs.lock().await.remove(id);
    }
}

#[async_trait]
impl CharacterSource for Documents {
    async fn list_character_versions(&self) -> Result<Vec<DocumentVersion>, StorageError> {
        Ok(self
            .docs
            .lock()
            .await
            .iter()
            .map(|(id, (version, _))| DocumentVersion {
                id: id.clone(),
                version: version.to_string(),
            })
            .collect())
    }

    async fn load_character(&self, id: &str) -> Result<Option<Character>, StorageError> {
        Ok(self.docs.lock().await.get(id).map(|(_, c)| c.clone()))
    }
}

fn character(id: &str, token: &str, active: bool) -> Character {
    Character {
        id: id.to_string(),
        name: id.to_uppercase(),
        bot_token: token.to_string(),
        is_active: active,
        ..Character::default()
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[tokio::test]
async fn registry_converges_to_active_documents() {
    let gateway = Arc::new(MemoryGateway::new());
    gateway.register("tok-a", "1").await;
    gateway.register("tok-b", "2").await;
    gateway.register("tok-b2", "3").await;

    let generator = ResponseGenerator::new(Arc::new(SilentProvider), "test-model", 0);
    let registry = Arc::new(ConnectionRegistry::new(ConnectionFactory::new(
        gateway.clone(),
        Arc::new(InMemoryConsentStore::new()),
        Arc::new(generator),
        PipelineSettings::default(),
    )));

    let documents = Arc::new(Documents::default());
    documents.put(character("a", "tok-a", true)).await;
    documents.put(character("b", "tok-b", true)).await;
    documents.put(character("draft", "", true)).await;
    documents.put(character("off", "tok-a", false)).await;

    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(16);
    let feed = CharacterFeed::new(documents.clone()).spawn(
        Duration::from_millis(20),
        tx,
        cancel.clone(),
    );
    let consumer = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.run(rx).await })
    };

    eventually(|| {
        let registry = registry.clone();
        async move { registry.ids().await == vec!["a", "b"] }
    })
    .await;

    documents.put(character("b", "tok-b2", true)).await;
    documents.delete("a").await;

    eventually(|| {
        let registry = registry.clone();
        async move {
            match registry.get("b").await {
                Some(b) => b.current_credential().await == "tok-b2" && registry.len().await == 1,
                None => false,
            }
        }
    })
    .await;

    eventually(|| {
        let gateway = gateway.clone();
        async move { gateway.open_session_count().await == 1 }
    })
    .await;

    cancel.cancel();
    feed.await.expect("feed join");
    consumer.await.expect("registry join");
    registry.shutdown().await;
    eventually(|| {
        let gateway = gateway.clone();
        async move { gateway.open_session_count().await == 0 }
    })
    .await;
}

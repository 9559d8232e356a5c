//! End-to-end behaviour of the registry and connections over the in-memory gateway

use async_trait::async_trait;
use icord_manager::bot::{ConnectionState, HandledMessage, PipelineOutcome, PipelineSettings};
use icord_manager::character::{Character, CharacterEvent};
use icord_manager::config::{
    CONSENT_GRANTED_MESSAGE, CONSENT_REQUEST_MESSAGE, RATE_LIMITED_MESSAGE,
};
use icord_manager::consent::{ConsentStore, InMemoryConsentStore};
use icord_manager::gateway::memory::MemoryGateway;
use icord_manager::gateway::InboundMessage;
use icord_manager::llm::{LlmError, LlmProvider, ResponseGenerator, Turn};
use icord_manager::manager::{ConnectionFactory, ConnectionRegistry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Counts calls and answers with a fixed line
#[derive(Default)]
struct CountingProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmProvider for CountingProvider {
    async fn chat_completion(
        &self,
        _history: &[Turn],
        user_message: &str,
        _model_id: &str,
    ) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("Luna says hi to: {user_message}"))
    }
}

struct Harness {
    gateway: Arc<MemoryGateway>,
    consent: Arc<InMemoryConsentStore>,
    provider: Arc<CountingProvider>,
    registry: ConnectionRegistry,
}

async fn harness() -> Harness {
    let gateway = Arc::new(MemoryGateway::new());
    gateway.register("tok1", "1001").await;
    gateway.register("tok2", "1002").await;

    let consent = Arc::new(InMemoryConsentStore::new());
    let provider = Arc::new(CountingProvider::default());
    let generator = ResponseGenerator::new(provider.clone(), "test-model", 0);
    let factory = ConnectionFactory::new(
        gateway.clone(),
        consent.clone(),
        Arc::new(generator),
        PipelineSettings {
            rate_limit_cooldown: Duration::from_millis(300),
            ..PipelineSettings::default()
        },
    );

    Harness {
        gateway,
        consent,
        provider,
        registry: ConnectionRegistry::new(factory),
    }
}

fn luna(token: &str) -> Character {
    Character {
        id: "c1".to_string(),
        name: "Luna".to_string(),
        bot_token: token.to_string(),
        system_instruction: "You are Luna.".to_string(),
        is_active: true,
        ..Character::default()
    }
}

fn dm(author: &str, content: &str) -> InboundMessage {
    InboundMessage {
        channel_id: format!("dm-{author}"),
        author_id: author.to_string(),
        is_dm: true,
        content: content.to_string(),
        ..InboundMessage::default()
    }
}

async fn wait_state(h: &Harness, id: &str, state: ConnectionState) {
    let connection = h.registry.get(id).await.expect("registered");
    let mut rx = connection.watch_state();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
        .await
        .expect("state reached in time")
        .expect("sender alive");
}

async fn next_outcome(rx: &mut broadcast::Receiver<HandledMessage>) -> PipelineOutcome {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("message handled in time")
        .expect("outcome")
        .outcome
}

#[tokio::test]
async fn credential_rotation_replaces_the_connection() {
    let h = harness().await;

    h.registry
        .handle_event(CharacterEvent::Added(luna("tok1")))
        .await;
    wait_state(&h, "c1", ConnectionState::Running).await;
    let first = h.registry.get("c1").await.expect("c1");
    assert_eq!(first.current_credential().await, "tok1");

    h.registry
        .handle_event(CharacterEvent::Modified(luna("tok2")))
        .await;
    wait_state(&h, "c1", ConnectionState::Running).await;

    let second = h.registry.get("c1").await.expect("c1");
    assert_eq!(second.current_credential().await, "tok2");
    assert_eq!(h.registry.ids().await, vec!["c1"]);

    let mut old_state = first.watch_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        old_state.wait_for(|s| *s == ConnectionState::Stopped),
    )
    .await
    .expect("old connection stopped")
    .expect("sender alive");

    let old_session = h.gateway.latest_session("tok1").await.expect("tok1 session");
    assert!(old_session.is_closed());
    assert_eq!(h.gateway.open_session_count().await, 1);
}

#[tokio::test]
async fn consent_then_conversation() {
    let h = harness().await;
    h.registry.on_character_added(luna("tok1")).await;
    wait_state(&h, "c1", ConnectionState::Running).await;

    let connection = h.registry.get("c1").await.expect("c1");
    let mut outcomes = connection.subscribe_outcomes();
    let session = h.gateway.latest_session("tok1").await.expect("session");

    session.deliver(dm("u1", "hello")).await.expect("delivered");
    assert_eq!(next_outcome(&mut outcomes).await, PipelineOutcome::ConsentRequested);

    session.deliver(dm("u1", "!consent")).await.expect("delivered");
    assert_eq!(next_outcome(&mut outcomes).await, PipelineOutcome::ConsentGranted);

    assert_eq!(
        session.sent_texts().await,
        vec![CONSENT_REQUEST_MESSAGE, CONSENT_GRANTED_MESSAGE]
    );
    let record = h.consent.get("u1").await.expect("get").expect("record");
    assert!(record.has_consented);
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);

    session.deliver(dm("u1", "how are you?")).await.expect("delivered");
    assert_eq!(
        next_outcome(&mut outcomes).await,
        PipelineOutcome::Replied { chunks: 1 }
    );
    let sent = session.sent_texts().await;
    assert_eq!(sent.last().map(String::as_str), Some("Luna says hi to: how are you?"));
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cooldown_blocks_then_releases() {
    let h = harness().await;
    h.consent
        .set(
            "u2",
            icord_manager::consent::ConsentRecord::granted("u2", chrono::Utc::now()),
        )
        .await
        .expect("set");
    h.registry.on_character_added(luna("tok1")).await;
    wait_state(&h, "c1", ConnectionState::Running).await;

    let connection = h.registry.get("c1").await.expect("c1");
    let mut outcomes = connection.subscribe_outcomes();
    let session = h.gateway.latest_session("tok1").await.expect("session");

    session.deliver(dm("u2", "one")).await.expect("delivered");
    assert!(next_outcome(&mut outcomes).await.generated());

    session.deliver(dm("u2", "two")).await.expect("delivered");
    assert_eq!(next_outcome(&mut outcomes).await, PipelineOutcome::RateLimited);
    assert_eq!(session.sent_texts().await.last().map(String::as_str), Some(RATE_LIMITED_MESSAGE));
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    session.deliver(dm("u2", "three")).await.expect("delivered");
    assert!(next_outcome(&mut outcomes).await.generated());
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn granting_consent_twice_keeps_one_record() {
    let h = harness().await;
    h.registry.on_character_added(luna("tok1")).await;
    wait_state(&h, "c1", ConnectionState::Running).await;

    let connection = h.registry.get("c1").await.expect("c1");
    let mut outcomes = connection.subscribe_outcomes();
    let session = h.gateway.latest_session("tok1").await.expect("session");

    session.deliver(dm("u3", "!consent")).await.expect("delivered");
    assert_eq!(next_outcome(&mut outcomes).await, PipelineOutcome::ConsentGranted);

    // Once consented the keyword is an ordinary message
    session.deliver(dm("u3", "!consent")).await.expect("delivered");
    assert!(next_outcome(&mut outcomes).await.generated());

    h.consent
        .set(
            "u3",
            icord_manager::consent::ConsentRecord::granted("u3", chrono::Utc::now()),
        )
        .await
        .expect("set");
    assert_eq!(h.consent.len().await, 1);
    assert!(h.consent.get("u3").await.expect("get").expect("record").has_consented);
}

#[tokio::test]
async fn messages_to_other_accounts_are_ignored() {
    let h = harness().await;
    h.registry.on_character_added(luna("tok1")).await;
    wait_state(&h, "c1", ConnectionState::Running).await;

    let connection = h.registry.get("c1").await.expect("c1");
    let mut outcomes = connection.subscribe_outcomes();
    let session = h.gateway.latest_session("tok1").await.expect("session");

    let mut guild = dm("u4", "<@2002> hey");
    guild.is_dm = false;
    guild.mentioned_ids = vec!["2002".to_string()];
    session.deliver(guild).await.expect("delivered");
    assert!(matches!(
        next_outcome(&mut outcomes).await,
        PipelineOutcome::Ignored(_)
    ));

    let mut bot = dm("1002", "beep");
    bot.author_is_bot = true;
    session.deliver(bot).await.expect("delivered");
    assert!(matches!(
        next_outcome(&mut outcomes).await,
        PipelineOutcome::Ignored(_)
    ));

    assert!(session.sent().await.is_empty());
}

//! Seeds the sample "Luna" character into the object store.
//!
//! Existing characters of the same owner are deleted first so repeated runs
//! leave exactly one sample. The owner is read from `SEED_OWNER_ID`, and
//! `SEED_BOT_TOKEN`/`SEED_CLIENT_ID` attach a Discord application if set.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use icord_manager::character::Character;
use icord_manager::config::Settings;
use icord_manager::storage::{character_key, CharacterSource, R2Storage};
use tracing::info;
use uuid::Uuid;

const DEFAULT_OWNER_ID: &str = "938707540613673020";

fn sample_character(owner_id: &str) -> Character {
    let mut character = Character {
        id: Uuid::new_v4().to_string(),
        owner_id: owner_id.to_string(),
        name: "Luna".to_string(),
        nickname: Some("Lu".to_string()),
        bot_token: std::env::var("SEED_BOT_TOKEN").unwrap_or_default(),
        client_id: std::env::var("SEED_CLIENT_ID").unwrap_or_default(),
        personality: "Cheerful, curious, and slightly mischievous.".to_string(),
        tone: "Energetic and friendly".to_string(),
        appearance: "A digital avatar with glowing blue hair.".to_string(),
        age: "AI years".to_string(),
        gender: "Female".to_string(),
        story: "Luna was created to bring joy to Discord servers.".to_string(),
        example_dialogue: "User: Hi! Luna: Hello there! Ready for an adventure?".to_string(),
        goal: "To make everyone smile.".to_string(),
        is_active: true,
        ..Character::default()
    };
    character.system_instruction = character.compile_system_instruction();
    character
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let owner_id = std::env::var("SEED_OWNER_ID").unwrap_or_else(|_| DEFAULT_OWNER_ID.to_string());
    let settings = Settings::new().context("Failed to load configuration")?;
    let storage = R2Storage::new(&settings)
        .await
        .context("Failed to initialize R2 storage")?;

    let mut stale = Vec::new();
    for doc in storage
        .list_character_versions()
        .await
        .context("Failed to list characters")?
    {
        let character = storage
            .load_character(&doc.id)
            .await
            .with_context(|| format!("Failed to load character {}", doc.id))?;
        if character.is_some_and(|c| c.owner_id == owner_id) {
            stale.push(character_key(&doc.id));
        }
    }
    storage
        .delete_objects(&stale)
        .await
        .context("Failed to delete old characters")?;
    info!("Cleared {} old characters for user {}", stale.len(), owner_id);

    let character = sample_character(&owner_id);
    storage
        .save_json(&character_key(&character.id), &character)
        .await
        .context("Failed to save character")?;

    info!(
        "Character \"{}\" ({}) created for user {}",
        character.name, character.id, owner_id
    );
    Ok(())
}

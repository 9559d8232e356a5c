//! Character records and change-feed events
//!
//! A character is a persona configuration plus the Discord credential of the
//! bot account that plays it. Records are owned by the dashboard; this crate
//! only observes them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A persona configuration as stored by the dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    /// Document identity, assigned by the store and never changed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Discord ID of the creator
    #[serde(default)]
    pub owner_id: String,
    /// Display name
    pub name: String,
    /// Optional nickname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    /// Discord bot token
    #[serde(default)]
    pub bot_token: String,
    /// Discord application (client) ID
    #[serde(default)]
    pub client_id: String,
    /// Personality description
    #[serde(default)]
    pub personality: String,
    /// Speaking style
    #[serde(default)]
    pub tone: String,
    /// Appearance description
    #[serde(default)]
    pub appearance: String,
    /// Stated age
    #[serde(default)]
    pub age: String,
    /// Stated gender
    #[serde(default)]
    pub gender: String,
    /// Backstory
    #[serde(default)]
    pub story: String,
    /// Sample exchange in the persona's voice
    #[serde(default)]
    pub example_dialogue: String,
    /// What the persona tries to achieve
    #[serde(default)]
    pub goal: String,
    /// Avatar image URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Compiled persona prompt. Opaque to this crate.
    #[serde(default)]
    pub system_instruction: String,
    /// Documents without the flag are active
    #[serde(default = "default_active")]
    pub is_active: bool,
}

const fn default_active() -> bool {
    true
}

impl Character {
    /// Whether a live connection may exist for this character
    #[must_use]
    pub fn is_connectable(&self) -> bool {
        self.is_active && !self.bot_token.trim().is_empty()
    }

    /// Short, non-reversible fingerprint of the bot token for logs
    #[must_use]
    pub fn credential_fingerprint(&self) -> String {
        fingerprint(&self.bot_token)
    }

    /// Persona instruction, or `None` when blank
    #[must_use]
    pub fn persona_instruction(&self) -> Option<&str> {
        let trimmed = self.system_instruction.trim();
        (!trimmed.is_empty()).then_some(self.system_instruction.as_str())
    }

    /// Renders the dashboard's system-instruction template from the persona fields.
    ///
    /// Running connections never call this; it is used when new records are
    /// authored outside the dashboard.
    #[must_use]
    pub fn compile_system_instruction(&self) -> String {
        let nickname = self
            .nickname
            .as_deref()
            .filter(|n| !n.is_empty())
            .map(|n| format!(" (nickname: {n})"))
            .unwrap_or_default();

        format!(
            "Role: You are a Discord bot named \"{name}\"{nickname}.\n\
             Personality: {personality}\n\
             Speaking Style/Tone: {tone}\n\
             Goal: {goal}\n\
             \n\
             Instructions:\n\
             - You are chatting with users on Discord.\n\
             - Maintain your persona at all times.\n\
             - Respond in the language the user speaks (default to Japanese if unsure).\n\
             - Keep responses concise and suitable for a chat interface.\n\
             - Do not break character.",
            name = self.name,
            personality = self.personality,
            tone = self.tone,
            goal = self.goal,
        )
    }
}

/// Hex-encoded first 8 bytes of the SHA-256 of a secret
#[must_use]
pub fn fingerprint(secret: &str) -> String {
    if secret.is_empty() {
        return "none".to_string();
    }
    Sha256::digest(secret.as_bytes())
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// One change observed on the character collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CharacterEvent {
    /// A document appeared (also emitted for every document on the first listing)
    Added(Character),
    /// An existing document changed
    Modified(Character),
    /// A document disappeared
    Removed(String),
}

impl CharacterEvent {
    /// Identity of the affected character
    #[must_use]
    pub fn character_id(&self) -> &str {
        match self {
            Self::Added(c) | Self::Modified(c) => &c.id,
            Self::Removed(id) => id,
        }
    }
}

//! Configuration and settings management
//!
//! Loads settings from config files and environment variables and defines
//! the fixed user-facing strings of the message pipeline.

use config::{Config, ConfigError, Environment, File};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;
use tracing::warn;

/// Which prior channel messages are handed to the generator as context
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryScope {
    /// Every non-empty message in the channel. Messages by this connection's
    /// own account become `model` turns, everything else a single `user` role.
    #[default]
    Channel,
    /// Only the sender's own messages and this connection's replies.
    Author,
}

/// Application settings loaded from config files and environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Gemini API key
    pub gemini_api_key: Option<String>,
    /// Gemini model used for replies
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,

    /// Port of the health-check HTTP server
    #[serde(skip_deserializing, default = "default_port")]
    pub port: u16,

    /// Days of inactivity after which a consent record is purged
    #[serde(skip_deserializing, default = "default_data_retention_days")]
    pub data_retention_days: u32,
    /// Hours between retention sweeps
    #[serde(skip_deserializing, default = "default_sweep_interval_hours")]
    pub sweep_interval_hours: u64,

    /// Minimum gap between two routed messages of the same user
    #[serde(skip_deserializing, default = "default_rate_limit_cooldown_ms")]
    pub rate_limit_cooldown_ms: u64,
    /// Maximum number of users tracked by one connection's rate limiter
    #[serde(skip_deserializing, default = "default_rate_limit_capacity")]
    pub rate_limit_capacity: u64,

    /// Number of prior channel messages fetched as context
    #[serde(skip_deserializing, default = "default_history_window")]
    pub history_window: u32,
    /// Context filtering policy
    #[serde(skip_deserializing)]
    pub history_scope: HistoryScope,
    /// Maximum characters per outgoing Discord message
    #[serde(skip_deserializing, default = "default_max_reply_chunk_chars")]
    pub max_reply_chunk_chars: usize,

    /// Timeout of a single generation HTTP request
    #[serde(skip_deserializing, default = "default_llm_http_timeout_secs")]
    pub llm_http_timeout_secs: u64,
    /// Retries of a transiently failing generation request
    #[serde(skip_deserializing, default = "default_llm_max_retries")]
    pub llm_max_retries: usize,

    /// Seconds between listings of the character documents
    #[serde(skip_deserializing, default = "default_character_poll_interval_secs")]
    pub character_poll_interval_secs: u64,

    /// R2 Storage access key ID
    pub r2_access_key_id: Option<String>,
    /// R2 Storage secret access key
    pub r2_secret_access_key: Option<String>,
    /// R2 Storage endpoint URL
    pub r2_endpoint_url: Option<String>,
    /// R2 Storage bucket name
    pub r2_bucket_name: Option<String>,
}

fn default_gemini_model() -> String {
    DEFAULT_GEMINI_MODEL.to_string()
}

const fn default_port() -> u16 {
    3000
}

const fn default_data_retention_days() -> u32 {
    30
}

const fn default_sweep_interval_hours() -> u64 {
    24
}

const fn default_rate_limit_cooldown_ms() -> u64 {
    2000
}

const fn default_rate_limit_capacity() -> u64 {
    10_000
}

const fn default_history_window() -> u32 {
    10
}

const fn default_max_reply_chunk_chars() -> usize {
    DISCORD_MESSAGE_LIMIT
}

const fn default_llm_http_timeout_secs() -> u64 {
    30
}

const fn default_llm_max_retries() -> usize {
    2
}

const fn default_character_poll_interval_secs() -> u64 {
    15
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            gemini_model: default_gemini_model(),
            port: default_port(),
            data_retention_days: default_data_retention_days(),
            sweep_interval_hours: default_sweep_interval_hours(),
            rate_limit_cooldown_ms: default_rate_limit_cooldown_ms(),
            rate_limit_capacity: default_rate_limit_capacity(),
            history_window: default_history_window(),
            history_scope: HistoryScope::default(),
            max_reply_chunk_chars: default_max_reply_chunk_chars(),
            llm_http_timeout_secs: default_llm_http_timeout_secs(),
            llm_max_retries: default_llm_max_retries(),
            character_poll_interval_secs: default_character_poll_interval_secs(),
            r2_access_key_id: None,
            r2_secret_access_key: None,
            r2_endpoint_url: None,
            r2_bucket_name: None,
        }
    }
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use icord_manager::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if a source cannot be read. Unusable tunables
    /// fall back to their defaults instead.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Not checked into git
            .add_source(File::with_name("config/local").required(false))
            // Eg.. `APP__PORT=8080 ./target/app` would set the `port` key
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Plain UPPER_SNAKE_CASE variables; empty ones count as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        let mut settings = Self::from_config(&s)?;

        // The plain environment source can miss keys on some platforms
        for (slot, var) in [
            (&mut settings.r2_endpoint_url, "R2_ENDPOINT_URL"),
            (&mut settings.r2_access_key_id, "R2_ACCESS_KEY_ID"),
            (&mut settings.r2_secret_access_key, "R2_SECRET_ACCESS_KEY"),
            (&mut settings.r2_bucket_name, "R2_BUCKET_NAME"),
            (&mut settings.gemini_api_key, "GEMINI_API_KEY"),
        ] {
            if slot.is_none() {
                if let Ok(val) = std::env::var(var) {
                    if !val.is_empty() {
                        *slot = Some(val);
                    }
                }
            }
        }

        Ok(settings)
    }

    /// Settings from an already layered `Config`.
    ///
    /// Tunables are read one by one; a value that does not parse is logged
    /// and replaced by its default.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the credential keys cannot be deserialized.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut settings: Self = config.clone().try_deserialize()?;

        settings.port = tunable(config, "port", settings.port);
        settings.data_retention_days =
            tunable(config, "data_retention_days", settings.data_retention_days);
        settings.sweep_interval_hours =
            tunable(config, "sweep_interval_hours", settings.sweep_interval_hours);
        settings.rate_limit_cooldown_ms =
            tunable(config, "rate_limit_cooldown_ms", settings.rate_limit_cooldown_ms);
        settings.rate_limit_capacity =
            tunable(config, "rate_limit_capacity", settings.rate_limit_capacity);
        settings.history_window = tunable(config, "history_window", settings.history_window);
        settings.history_scope = tunable(config, "history_scope", settings.history_scope);
        settings.max_reply_chunk_chars =
            tunable(config, "max_reply_chunk_chars", settings.max_reply_chunk_chars);
        settings.llm_http_timeout_secs =
            tunable(config, "llm_http_timeout_secs", settings.llm_http_timeout_secs);
        settings.llm_max_retries = tunable(config, "llm_max_retries", settings.llm_max_retries);
        settings.character_poll_interval_secs = tunable(
            config,
            "character_poll_interval_secs",
            settings.character_poll_interval_secs,
        );

        Ok(settings)
    }

    /// Cooldown between two routed messages of the same user
    #[must_use]
    pub const fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }

    /// Inactivity window after which consent records are purged
    #[must_use]
    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.data_retention_days))
    }

    /// Interval between two retention sweeps (never zero)
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_hours.max(1) * 60 * 60)
    }

    /// Interval between two character listings (never zero)
    #[must_use]
    pub fn character_poll_interval(&self) -> Duration {
        Duration::from_secs(self.character_poll_interval_secs.max(1))
    }

    /// Chunk size for outgoing replies, clamped to Discord's message limit
    #[must_use]
    pub fn reply_chunk_chars(&self) -> usize {
        self.max_reply_chunk_chars.clamp(1, DISCORD_MESSAGE_LIMIT)
    }

    /// History window clamped to what a single Discord history request returns
    #[must_use]
    pub fn history_limit(&self) -> u8 {
        u8::try_from(self.history_window.min(u32::from(DISCORD_HISTORY_LIMIT)))
            .unwrap_or(DISCORD_HISTORY_LIMIT)
    }
}

fn tunable<T: DeserializeOwned + Debug>(config: &Config, key: &str, default: T) -> T {
    match config.get::<T>(key) {
        Ok(value) => value,
        Err(ConfigError::NotFound(_)) => default,
        Err(e) => {
            warn!("Invalid value for {}, using default {:?}: {}", key, default, e);
            default
        }
    }
}

/// Default Gemini model
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash-exp";

/// Discord's hard limit for one message body
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;
/// Discord's hard limit for one message history request
pub const DISCORD_HISTORY_LIMIT: u8 = 100;

/// Initial backoff between generation retries
pub const LLM_INITIAL_BACKOFF_MS: u64 = 500;
/// Maximum backoff between generation retries
pub const LLM_MAX_BACKOFF_MS: u64 = 4000;

/// Attempts for reply dispatch on transient gateway errors
pub const GATEWAY_SEND_MAX_RETRIES: usize = 3;
/// Initial backoff between reply dispatch attempts
pub const GATEWAY_SEND_INITIAL_BACKOFF_MS: u64 = 500;
/// Maximum backoff between reply dispatch attempts
pub const GATEWAY_SEND_MAX_BACKOFF_MS: u64 = 4000;

/// Keyword a user types to grant consent
pub const CONSENT_KEYWORD: &str = "!consent";
/// Reply to an unconsented user
pub const CONSENT_REQUEST_MESSAGE: &str = "Before we chat, please consent to our data collection policy (messages are stored for 30 days for safety). Type `!consent` to agree.";
/// Reply after consent was recorded
pub const CONSENT_GRANTED_MESSAGE: &str =
    "Thank you! You have consented to the data collection policy. You can now chat with me.";
/// Reply to a user inside the cooldown window
pub const RATE_LIMITED_MESSAGE: &str =
    "You are sending messages too quickly. Please wait a moment.";
/// Reply when generation failed
pub const GENERATION_FALLBACK_MESSAGE: &str =
    "Sorry, I couldn't generate a response at this time. Please try again later.";
/// Reply when the pipeline failed unexpectedly after the gates
pub const PIPELINE_FAILURE_MESSAGE: &str =
    "I'm having a bit of trouble thinking right now. Try again later.";
/// Prompt used when a message was nothing but a mention
pub const EMPTY_PROMPT_PLACEHOLDER: &str = "Hello!";

/// Prefix of the synthetic user turn carrying the persona instruction
pub const PERSONA_INSTRUCTION_PREFIX: &str = "System Instruction: ";
/// Synthetic model turn acknowledging the persona instruction
pub const PERSONA_ACKNOWLEDGEMENT: &str = "Understood. I will follow these instructions.";

/// Body of the health-check endpoint
pub const HEALTH_MESSAGE: &str = "iCord.me Bot Manager is running!";

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_config_env_loading() -> Result<(), Box<dyn std::error::Error>> {
        env::set_var("RATE_LIMIT_COOLDOWN_MS", "1500");
        env::set_var("HISTORY_SCOPE", "author");
        env::set_var("R2_BUCKET_NAME", "");

        let settings = Settings::new()?;
        assert_eq!(settings.rate_limit_cooldown(), Duration::from_millis(1500));
        assert_eq!(settings.history_scope, HistoryScope::Author);
        // Empty values are treated as unset
        assert_eq!(settings.r2_bucket_name, None);

        env::remove_var("RATE_LIMIT_COOLDOWN_MS");
        env::remove_var("HISTORY_SCOPE");
        env::remove_var("R2_BUCKET_NAME");
        Ok(())
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.gemini_model, "gemini-2.0-flash-exp");
        assert_eq!(settings.rate_limit_cooldown(), Duration::from_millis(2000));
        assert_eq!(settings.history_limit(), 10);
        assert_eq!(settings.reply_chunk_chars(), 2000);
        assert_eq!(settings.retention_window(), chrono::Duration::days(30));
        assert_eq!(settings.sweep_interval(), Duration::from_secs(86_400));
        assert_eq!(settings.history_scope, HistoryScope::Channel);
    }

    #[test]
    fn test_invalid_tunables_fall_back_to_defaults() -> Result<(), ConfigError> {
        let config = Config::builder()
            .set_override("history_window", "lots")?
            .set_override("rate_limit_cooldown_ms", "-5")?
            .set_override("history_scope", "everyone")?
            .set_override("port", "8080")?
            .set_override("r2_bucket_name", "bucket")?
            .build()?;

        let settings = Settings::from_config(&config)?;
        assert_eq!(settings.history_limit(), 10);
        assert_eq!(settings.rate_limit_cooldown(), Duration::from_millis(2000));
        assert_eq!(settings.history_scope, HistoryScope::Channel);
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.r2_bucket_name.as_deref(), Some("bucket"));
        Ok(())
    }

    #[test]
    fn test_oversized_history_window_is_clamped() -> Result<(), ConfigError> {
        let config = Config::builder()
            .set_override("history_window", "300")?
            .build()?;

        let settings = Settings::from_config(&config)?;
        assert_eq!(settings.history_window, 300);
        assert_eq!(settings.history_limit(), DISCORD_HISTORY_LIMIT);
        Ok(())
    }

    #[test]
    fn test_clamping() {
        let settings = Settings {
            max_reply_chunk_chars: 10_000,
            history_window: 250,
            sweep_interval_hours: 0,
            ..Settings::default()
        };
        assert_eq!(settings.reply_chunk_chars(), DISCORD_MESSAGE_LIMIT);
        assert_eq!(settings.history_limit(), DISCORD_HISTORY_LIMIT);
        assert_eq!(settings.sweep_interval(), Duration::from_secs(3600));
    }
}

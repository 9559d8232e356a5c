use anyhow::{Context, Result};
use dotenvy::dotenv;
use icord_manager::bot::PipelineSettings;
use icord_manager::config::Settings;
use icord_manager::gateway::discord::DiscordGateway;
use icord_manager::llm::gemini::GeminiProvider;
use icord_manager::llm::ResponseGenerator;
use icord_manager::manager::{ConnectionFactory, ConnectionRegistry};
use icord_manager::storage::{CharacterFeed, R2Storage};
use icord_manager::sweeper::RetentionSweeper;
use icord_manager::server;
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Pending change-feed events buffered between the feed and the registry
const FEED_BUFFER: usize = 128;

/// Regex patterns for redacting sensitive data
struct RedactionPatterns {
    discord_token: Regex,
    discord_auth: Regex,
    gemini_key: Regex,
    key_param: Regex,
    r2_1: Regex,
    r2_2: Regex,
    r2_3: Regex,
    r2_4: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            discord_token: Regex::new(
                r"[A-Za-z0-9_-]{23,28}\.[A-Za-z0-9_-]{6,7}\.[A-Za-z0-9_-]{27,}",
            )?,
            discord_auth: Regex::new(r"(Bot )[A-Za-z0-9._-]{20,}")?,
            gemini_key: Regex::new(r"AIza[0-9A-Za-z_-]{35}")?,
            key_param: Regex::new(r"([?&]key=)[^\s&]+")?,
            r2_1: Regex::new(r"R2_ACCESS_KEY_ID=[^\s&]+")?,
            r2_2: Regex::new(r"R2_SECRET_ACCESS_KEY=[^\s&]+")?,
            r2_3: Regex::new(r"'aws_access_key_id': '[^']*'")?,
            r2_4: Regex::new(r"'aws_secret_access_key': '[^']*'")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        output = self
            .discord_auth
            .replace_all(&output, "$1[DISCORD_TOKEN]")
            .to_string();
        output = self
            .discord_token
            .replace_all(&output, "[DISCORD_TOKEN]")
            .to_string();
        output = self
            .gemini_key
            .replace_all(&output, "[GEMINI_KEY]")
            .to_string();
        output = self
            .key_param
            .replace_all(&output, "$1[MASKED]")
            .to_string();
        output = self
            .r2_1
            .replace_all(&output, "R2_ACCESS_KEY_ID=[MASKED]")
            .to_string();
        output = self
            .r2_2
            .replace_all(&output, "R2_SECRET_ACCESS_KEY=[MASKED]")
            .to_string();
        output = self
            .r2_3
            .replace_all(&output, "'aws_access_key_id': '[MASKED]'")
            .to_string();
        output = self
            .r2_4
            .replace_all(&output, "'aws_secret_access_key': '[MASKED]'")
            .to_string();
        output
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // Report the original length; the redacted text may be shorter or longer
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<F> RedactingMakeWriter<F> {
    const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), self.patterns.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenv().ok();

    // Initialize redaction patterns early (before logging)
    let patterns = Arc::new(
        RedactionPatterns::new().context("Failed to compile redaction patterns")?,
    );

    init_logging(patterns);

    info!("Starting iCord bot manager...");

    let settings = init_settings();
    let storage = init_storage(&settings).await;
    let generator = init_generator(&settings);

    let factory = ConnectionFactory::new(
        Arc::new(DiscordGateway),
        storage.clone(),
        generator,
        PipelineSettings::from_settings(&settings),
    );
    let registry = Arc::new(ConnectionRegistry::new(factory));
    let cancel = CancellationToken::new();

    let (feed_tx, feed_rx) = mpsc::channel(FEED_BUFFER);
    let feed = CharacterFeed::new(storage.clone()).spawn(
        settings.character_poll_interval(),
        feed_tx,
        cancel.clone(),
    );

    let registry_task = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.run(feed_rx).await })
    };

    let sweeper = RetentionSweeper::new(storage.clone(), settings.retention_window())
        .spawn(settings.sweep_interval(), cancel.clone());

    let health = tokio::spawn(server::serve(
        settings.port,
        cancel.clone().cancelled_owned(),
    ));

    info!("Bot manager is running...");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping...");
    cancel.cancel();

    for (name, task) in [("character feed", feed), ("retention sweeper", sweeper)] {
        if let Err(e) = task.await {
            warn!("{} task ended abnormally: {}", name, e);
        }
    }
    // The feed dropped its sender, so the registry loop has returned
    if let Err(e) = registry_task.await {
        warn!("Registry task ended abnormally: {}", e);
    }
    registry.shutdown().await;

    match health.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Health server failed: {}", e),
        Err(e) => warn!("Health server task ended abnormally: {}", e),
    }

    info!("Bot manager stopped.");
    Ok(())
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter::new(io::stderr, patterns);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Settings {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            s
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

async fn init_storage(settings: &Settings) -> Arc<R2Storage> {
    match R2Storage::new(settings).await {
        Ok(s) => {
            info!("R2 Storage initialized.");
            if s.check_connection().await.is_err() {
                error!("R2 Storage connection check returned error.");
            }
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to initialize R2 Storage: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_generator(settings: &Settings) -> Arc<ResponseGenerator> {
    let api_key = settings.gemini_api_key.clone().unwrap_or_default();
    if api_key.is_empty() {
        warn!("GEMINI_API_KEY is not set; every reply will be the fallback message.");
    }

    let provider = GeminiProvider::new(api_key, settings.llm_http_timeout_secs);
    info!("Response generator initialized (model: {}).", settings.gemini_model);

    Arc::new(ResponseGenerator::new(
        Arc::new(provider),
        settings.gemini_model.clone(),
        settings.llm_max_retries,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_discord_token() {
        let patterns = RedactionPatterns::new().expect("patterns");
        let token = "MTIzNDU2Nzg5MDEyMzQ1Njc4.GabcDE.abcdefghijklmnopqrstuvwxyz0123456";
        let line = format!("login with {token} failed");
        let redacted = patterns.redact(&line);
        assert!(!redacted.contains(token));
        assert!(redacted.contains("[DISCORD_TOKEN]"));

        let header = patterns.redact("Authorization: Bot abcdefghijklmnopqrstuvwxyz");
        assert_eq!(header, "Authorization: Bot [DISCORD_TOKEN]");
    }

    #[test]
    fn test_redacts_gemini_and_r2_secrets() {
        let patterns = RedactionPatterns::new().expect("patterns");
        let key = format!("AIza{}", "x".repeat(35));
        assert_eq!(patterns.redact(&format!("using {key}")), "using [GEMINI_KEY]");
        assert_eq!(
            patterns.redact("GET /v1beta/models?key=secret123&alt=sse"),
            "GET /v1beta/models?key=[MASKED]&alt=sse"
        );
        assert_eq!(
            patterns.redact("R2_SECRET_ACCESS_KEY=abc123 rest"),
            "R2_SECRET_ACCESS_KEY=[MASKED] rest"
        );
    }

    #[test]
    fn test_plain_text_untouched() {
        let patterns = RedactionPatterns::new().expect("patterns");
        let line = "character_id=c1 token=3f9a1c2b4d5e6f70 Bot running";
        assert_eq!(patterns.redact(line), line);
    }
}

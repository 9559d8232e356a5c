//! Utility functions for message text handling and retries.
//!
//! Regex patterns go through `lazy_regex!`, so they are validated at compile
//! time and built on first use.

// lazy_regex! is backed by once_cell
#![allow(clippy::non_std_lazy_statics)]

use lazy_regex::lazy_regex;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

/// Match a user mention token: `<@123>` or the legacy nickname form `<@!123>`
static RE_USER_MENTION: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"<@!?(\d+)>");

/// Splits a reply into ordered chunks of at most `max_chars` characters.
///
/// Chunks break on grapheme cluster boundaries and nothing is trimmed or
/// re-wrapped, so concatenating the chunks yields `text` exactly. A single
/// grapheme wider than `max_chars` is kept whole in its own chunk.
///
/// # Examples
///
/// ```
/// use icord_manager::utils::split_reply_chunks;
/// let parts = split_reply_chunks("abcdef", 4);
/// assert_eq!(parts, vec!["abcd", "ef"]);
/// assert_eq!(parts.concat(), "abcdef");
/// ```
#[must_use]
pub fn split_reply_chunks(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let max_chars = max_chars.max(1);

    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut chunk = String::new();
    let mut chunk_chars = 0;

    for grapheme in text.graphemes(true) {
        let width = grapheme.chars().count();
        if chunk_chars + width > max_chars && !chunk.is_empty() {
            parts.push(std::mem::take(&mut chunk));
            chunk_chars = 0;
        }
        chunk.push_str(grapheme);
        chunk_chars += width;
    }
    if !chunk.is_empty() {
        parts.push(chunk);
    }

    parts
}

/// Removes every mention of `self_id` from `content` and trims the result.
///
/// Mentions of other accounts are left in place.
///
/// # Examples
///
/// ```
/// use icord_manager::utils::strip_own_mention;
/// assert_eq!(strip_own_mention("<@42> hi <@7>", "42"), "hi <@7>");
/// ```
#[must_use]
pub fn strip_own_mention(content: &str, self_id: &str) -> String {
    RE_USER_MENTION
        .replace_all(content, |caps: &regex::Captures| {
            if caps.get(1).is_some_and(|id| id.as_str() == self_id) {
                String::new()
            } else {
                caps[0].to_string()
            }
        })
        .trim()
        .to_string()
}

/// Safely truncates a string to a maximum character length (not bytes).
///
/// This is UTF-8 safe and will not panic on multi-byte characters.
///
/// # Examples
///
/// ```
/// use icord_manager::utils::truncate_str;
/// let s = "Привет, мир!";
/// assert_eq!(truncate_str(s, 6), "Привет");
/// ```
pub fn truncate_str(s: impl AsRef<str>, max_chars: usize) -> String {
    let s = s.as_ref();
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.char_indices()
        .nth(max_chars)
        .map_or_else(|| s.to_string(), |(pos, _)| s[..pos].to_string())
}

/// Retry a chat gateway call with exponential backoff.
///
/// Used for sends that may fail on transient transport errors. Delays start
/// at 500ms, cap at 4s and carry jitter; attempts are bounded by
/// `GATEWAY_SEND_MAX_RETRIES` in `config.rs`.
///
/// # Errors
///
/// Returns the last error if every attempt fails.
///
/// # Examples
///
/// ```no_run
/// use icord_manager::utils::retry_gateway_operation;
///
/// # async fn example() -> Result<(), std::io::Error> {
/// retry_gateway_operation("send reply", || async {
///     Ok::<_, std::io::Error>(())
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_gateway_operation<F, Fut, T, E>(label: &str, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    use crate::config::{
        GATEWAY_SEND_INITIAL_BACKOFF_MS, GATEWAY_SEND_MAX_BACKOFF_MS, GATEWAY_SEND_MAX_RETRIES,
    };

    let retry_strategy = ExponentialBackoff::from_millis(GATEWAY_SEND_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(GATEWAY_SEND_MAX_BACKOFF_MS))
        .map(jitter)
        .take(GATEWAY_SEND_MAX_RETRIES);

    Retry::spawn(retry_strategy, operation).await.map_err(|e| {
        warn!(
            "Gateway operation '{}' failed after {} retries: {}",
            label, GATEWAY_SEND_MAX_RETRIES, e
        );
        e
    })
}

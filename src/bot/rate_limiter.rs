//! Per-user message cooldown
//!
//! A bounded cache of user ids whose entries expire after the cooldown.
//! Admission is a single atomic check-and-set, so two messages racing from
//! the same user cannot both get through.
//!
//! Once the ledger holds `max_capacity` users, moka evicts entries before
//! their cooldown ends. An evicted user is admitted again early, so the
//! capacity must exceed the number of users active within one cooldown.

use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Cooldown ledger owned by one connection
#[derive(Clone)]
pub struct RateLimiter {
    /// user_id -> () for users inside their cooldown window
    cache: Cache<String, ()>,
    cooldown: Duration,
    rejected_count: Arc<AtomicU64>,
}

impl RateLimiter {
    /// Creates a limiter allowing one routed message per `cooldown` per user,
    /// tracking at most `max_capacity` users at once
    ///
    /// # Examples
    ///
    /// ```
    /// use icord_manager::bot::RateLimiter;
    /// use std::time::Duration;
    ///
    /// let limiter = RateLimiter::new(Duration::from_millis(2000), 10_000);
    /// assert_eq!(limiter.cooldown(), Duration::from_millis(2000));
    /// ```
    #[must_use]
    pub fn new(cooldown: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(cooldown)
            .build();

        Self {
            cache,
            cooldown,
            rejected_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Admits the message and starts a new window, or rejects it.
    ///
    /// Returns `true` when `user_id` had no message admitted within the
    /// cooldown. A rejected attempt leaves the current window untouched.
    pub async fn try_acquire(&self, user_id: &str) -> bool {
        let entry = self.cache.entry(user_id.to_string()).or_insert(()).await;
        if entry.is_fresh() {
            return true;
        }

        let count = self.rejected_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count.is_multiple_of(100) {
            debug!(
                "Rate limited {} messages (recent: user {})",
                count, user_id
            );
        }
        false
    }

    /// Number of users currently inside a window
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Total rejected attempts
    #[must_use]
    pub fn rejected_count(&self) -> u64 {
        self.rejected_count.load(Ordering::Relaxed)
    }

    /// Configured cooldown
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

//! Retention sweeper
//!
//! Deletes consent records of users who have not interacted within the
//! retention window. Runs once at startup and then on a fixed interval.

use crate::consent::ConsentStore;
use crate::storage::StorageError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Periodic purge of stale consent records
pub struct RetentionSweeper {
    store: Arc<dyn ConsentStore>,
    retention: chrono::Duration,
}

impl RetentionSweeper {
    /// Sweeper removing records idle for longer than `retention`
    #[must_use]
    pub fn new(store: Arc<dyn ConsentStore>, retention: chrono::Duration) -> Self {
        Self { store, retention }
    }

    /// Deletes every record whose last interaction is older than
    /// `now - retention`, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns the store error if the query or the delete fails.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let cutoff = now - self.retention;
        let stale = self.store.inactive_since(cutoff).await?;
        if stale.is_empty() {
            info!("No consent records older than {}", cutoff);
            return Ok(0);
        }

        let user_ids: Vec<String> = stale.into_iter().map(|r| r.user_id).collect();
        let deleted = self.store.batch_delete(&user_ids).await?;
        info!("Deleted {} consent records idle since before {}", deleted, cutoff);
        Ok(deleted)
    }

    /// One sweep relative to the current time; failures are logged
    pub async fn run_once(&self) -> usize {
        match self.sweep_at(Utc::now()).await {
            Ok(deleted) => deleted,
            Err(e) => {
                error!("Retention sweep failed: {}", e);
                0
            }
        }
    }

    /// Sweeps immediately and then every `interval` until cancelled
    pub fn spawn(self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Starting retention sweeper (interval: {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                self.run_once().await;
            }
            info!("Retention sweeper stopped.");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::{ConsentRecord, InMemoryConsentStore, MockConsentStore};
    use chrono::Duration as ChronoDuration;

    fn record(user_id: &str, idle_days: i64, now: DateTime<Utc>) -> ConsentRecord {
        ConsentRecord::granted(user_id, now - ChronoDuration::days(idle_days))
    }

    #[tokio::test]
    async fn test_all_fresh_deletes_nothing() {
        let now = Utc::now();
        let mut store = MockConsentStore::new();
        store.expect_inactive_since().returning(|_| Ok(Vec::new()));
        store.expect_batch_delete().never();

        let sweeper = RetentionSweeper::new(Arc::new(store), ChronoDuration::days(30));
        assert_eq!(sweeper.sweep_at(now).await.expect("sweep"), 0);
    }

    #[tokio::test]
    async fn test_mixed_deletes_only_stale() {
        let now = Utc::now();
        let store = Arc::new(InMemoryConsentStore::new());
        for (user, idle) in [("fresh", 1), ("edge", 29), ("stale", 31), ("ancient", 400)] {
            store.set(user, record(user, idle, now)).await.expect("set");
        }

        let sweeper = RetentionSweeper::new(store.clone(), ChronoDuration::days(30));
        assert_eq!(sweeper.sweep_at(now).await.expect("sweep"), 2);

        assert!(store.get("fresh").await.expect("get").is_some());
        assert!(store.get("edge").await.expect("get").is_some());
        assert!(store.get("stale").await.expect("get").is_none());
        assert!(store.get("ancient").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_store_failure_is_logged_not_raised() {
        let mut store = MockConsentStore::new();
        store
            .expect_inactive_since()
            .returning(|_| Err(StorageError::S3List("timeout".to_string())));

        let sweeper = RetentionSweeper::new(Arc::new(store), ChronoDuration::days(30));
        assert_eq!(sweeper.run_once().await, 0);
    }

    #[tokio::test]
    async fn test_spawn_sweeps_at_startup() {
        let now = Utc::now();
        let store = Arc::new(InMemoryConsentStore::new());
        store.set("stale", record("stale", 45, now)).await.expect("set");

        let cancel = CancellationToken::new();
        let handle = RetentionSweeper::new(store.clone(), ChronoDuration::days(30))
            .spawn(Duration::from_secs(3600), cancel.clone());

        tokio::time::timeout(Duration::from_secs(2), async {
            while !store.is_empty().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("swept at startup");

        cancel.cancel();
        handle.await.expect("join");
    }
}

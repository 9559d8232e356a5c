//! End-user consent records
//!
//! A user must opt in before any of their messages reach the generator.
//! Records also carry the last interaction time used by the retention sweeper.

use crate::storage::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Consent state of one Discord user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRecord {
    /// Discord user ID
    #[serde(rename = "discordId")]
    pub user_id: String,
    /// Whether the user agreed to the data policy
    pub has_consented: bool,
    /// When consent was granted
    pub consent_date: DateTime<Utc>,
    /// Last routed exchange, drives retention
    pub last_interaction: DateTime<Utc>,
}

impl ConsentRecord {
    /// A fresh record granting consent at `now`
    #[must_use]
    pub fn granted(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            has_consented: true,
            consent_date: now,
            last_interaction: now,
        }
    }
}

/// Partial update applied to an existing record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsentUpdate {
    /// New consent flag
    pub has_consented: Option<bool>,
    /// New last interaction time
    pub last_interaction: Option<DateTime<Utc>>,
}

impl ConsentUpdate {
    /// Update touching only the last interaction time
    #[must_use]
    pub fn touch(now: DateTime<Utc>) -> Self {
        Self {
            last_interaction: Some(now),
            ..Self::default()
        }
    }

    /// Applies the present fields to `record`
    pub fn apply(self, record: &mut ConsentRecord) {
        if let Some(flag) = self.has_consented {
            record.has_consented = flag;
        }
        if let Some(ts) = self.last_interaction {
            record.last_interaction = ts;
        }
    }
}

/// Interface for consent persistence
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsentStore: Send + Sync {
    /// Load the record of a user, if any
    async fn get(&self, user_id: &str) -> Result<Option<ConsentRecord>, StorageError>;
    /// Create or fully overwrite the record of a user
    async fn set(&self, user_id: &str, record: ConsentRecord) -> Result<(), StorageError>;
    /// Partially update an existing record.
    ///
    /// Fails with [`StorageError::NotFound`] when the user has no record.
    async fn update(&self, user_id: &str, update: ConsentUpdate) -> Result<(), StorageError>;
    /// Delete the records of all listed users, returning how many were removed
    async fn batch_delete(&self, user_ids: &[String]) -> Result<usize, StorageError>;
    /// Records whose last interaction is strictly older than `cutoff`
    async fn inactive_since(&self, cutoff: DateTime<Utc>)
        -> Result<Vec<ConsentRecord>, StorageError>;
}

/// Process-local consent store
#[derive(Default)]
pub struct InMemoryConsentStore {
    records: RwLock<HashMap<String, ConsentRecord>>,
}

impl InMemoryConsentStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store holds no records
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ConsentStore for InMemoryConsentStore {
    async fn get(&self, user_id: &str) -> Result<Option<ConsentRecord>, StorageError> {
        Ok(self.records.read().await.get(user_id).cloned())
    }

    async fn set(&self, user_id: &str, record: ConsentRecord) -> Result<(), StorageError> {
        self.records
            .write()
            .await
            .insert(user_id.to_string(), record);
        Ok(())
    }

    async fn update(&self, user_id: &str, update: ConsentUpdate) -> Result<(), StorageError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(user_id)
            .ok_or_else(|| StorageError::NotFound(format!("consent record for {user_id}")))?;
        update.apply(record);
        Ok(())
    }

    async fn batch_delete(&self, user_ids: &[String]) -> Result<usize, StorageError> {
        let mut records = self.records.write().await;
        Ok(user_ids
            .iter()
            .filter(|id| records.remove(id.as_str()).is_some())
            .count())
    }

    async fn inactive_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ConsentRecord>, StorageError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.last_interaction < cutoff)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_update_missing_record_fails() {
        let store = InMemoryConsentStore::new();
        let result = store.update("u1", ConsentUpdate::touch(Utc::now())).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_set_twice_keeps_one_record() {
        let store = InMemoryConsentStore::new();
        let now = Utc::now();
        store
            .set("u1", ConsentRecord::granted("u1", now))
            .await
            .expect("set");
        store
            .set("u1", ConsentRecord::granted("u1", now + Duration::seconds(5)))
            .await
            .expect("set");

        assert_eq!(store.len().await, 1);
        let record = store.get("u1").await.expect("get").expect("record");
        assert!(record.has_consented);
    }

    #[tokio::test]
    async fn test_touch_only_moves_last_interaction() {
        let store = InMemoryConsentStore::new();
        let granted_at = Utc::now() - Duration::days(3);
        store
            .set("u1", ConsentRecord::granted("u1", granted_at))
            .await
            .expect("set");

        let now = Utc::now();
        store
            .update("u1", ConsentUpdate::touch(now))
            .await
            .expect("update");

        let record = store.get("u1").await.expect("get").expect("record");
        assert_eq!(record.consent_date, granted_at);
        assert_eq!(record.last_interaction, now);
    }

    #[tokio::test]
    async fn test_inactive_since_is_strict() {
        let store = InMemoryConsentStore::new();
        let cutoff = Utc::now();
        store
            .set("old", ConsentRecord::granted("old", cutoff - Duration::days(31)))
            .await
            .expect("set");
        store
            .set("edge", ConsentRecord::granted("edge", cutoff))
            .await
            .expect("set");

        let stale = store.inactive_since(cutoff).await.expect("query");
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].user_id, "old");
    }

    #[test]
    fn test_record_wire_format() {
        let now = Utc::now();
        let json = serde_json::to_value(ConsentRecord::granted("42", now)).expect("serialize");
        assert_eq!(json["discordId"], "42");
        assert_eq!(json["hasConsented"], true);
        assert!(json.get("lastInteraction").is_some());
    }
}

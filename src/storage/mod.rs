//! Storage layer for character documents and consent records
//!
//! Provides a persistent storage implementation using Cloudflare R2 / AWS S3.
//! Characters live under `characters/{id}.json`, consent records under
//! `consent/{user_id}.json`.

mod feed;

pub use feed::CharacterFeed;

use crate::character::Character;
use crate::config::Settings;
use crate::consent::{ConsentRecord, ConsentStore, ConsentUpdate};
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use aws_types::region::Region;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Prefix of character documents
pub const CHARACTERS_PREFIX: &str = "characters/";
/// Prefix of consent records
pub const CONSENT_PREFIX: &str = "consent/";

/// S3 accepts at most this many keys per batch delete
const DELETE_BATCH_LIMIT: usize = 1000;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Error retrieving object from S3
    #[error("S3 Get error: {0}")]
    S3Get(Box<SdkError<GetObjectError>>),
    /// Error putting or deleting objects in S3
    #[error("S3 put error: {0}")]
    S3Put(String),
    /// Error listing objects in S3
    #[error("S3 list error: {0}")]
    S3List(String),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration error (missing credentials, etc.)
    #[error("Configuration error: {0}")]
    Config(String),
    /// The document to update does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Identity and version tag of one character document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentVersion {
    /// Character identity
    pub id: String,
    /// Opaque version tag; changes whenever the document changes
    pub version: String,
}

/// Read access to the character collection
#[async_trait]
pub trait CharacterSource: Send + Sync {
    /// Identity and version of every character document
    async fn list_character_versions(&self) -> Result<Vec<DocumentVersion>, StorageError>;
    /// Load the current content of one character, `None` if it vanished
    async fn load_character(&self, id: &str) -> Result<Option<Character>, StorageError>;
}

/// R2-backed storage implementation
pub struct R2Storage {
    client: Client,
    bucket: String,
    cache: Cache<String, Arc<Vec<u8>>>,
}

impl R2Storage {
    /// Create a new R2 storage instance
    ///
    /// # Errors
    ///
    /// Returns an error if R2 configuration is missing.
    pub async fn new(settings: &Settings) -> Result<Self, StorageError> {
        let endpoint_url = settings
            .r2_endpoint_url
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_ENDPOINT_URL is missing".into()))?;
        let access_key = settings
            .r2_access_key_id
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_ACCESS_KEY_ID is missing".into()))?;
        let secret_key = settings
            .r2_secret_access_key
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_SECRET_ACCESS_KEY is missing".into()))?;
        let bucket = settings
            .r2_bucket_name
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_BUCKET_NAME is missing".into()))?;

        let credentials = Credentials::new(access_key, secret_key, None, None, "r2-storage");

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("auto"))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(endpoint_url)
            .force_path_style(true)
            .build();

        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(60 * 60))
            .time_to_idle(Duration::from_secs(30 * 60))
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: bucket.clone(),
            cache,
        })
    }

    /// Save data as JSON to R2
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization or S3 upload fails.
    pub async fn save_json<T: serde::Serialize + Sync>(
        &self,
        key: &str,
        data: &T,
    ) -> Result<(), StorageError> {
        let body_bytes = serde_json::to_string_pretty(data)?.into_bytes();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body_bytes.clone()))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StorageError::S3Put(e.to_string()))?;

        // Write-Through once the object is durable
        self.cache.insert(key.to_string(), Arc::new(body_bytes)).await;

        Ok(())
    }

    /// Load data from JSON in R2, serving from the cache when possible
    ///
    /// # Errors
    ///
    /// Returns an error if S3 download or JSON deserialization fails.
    pub async fn load_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        if let Some(cached_data) = self.cache.get(key).await {
            match serde_json::from_slice(&cached_data) {
                Ok(data) => return Ok(Some(data)),
                Err(e) => {
                    warn!("Cache deserialization failed for {}: {}", key, e);
                    self.cache.invalidate(key).await;
                }
            }
        }

        self.fetch_json(key).await
    }

    /// Load data from JSON in R2, bypassing and refreshing the cache
    ///
    /// # Errors
    ///
    /// Returns an error if S3 download or JSON deserialization fails.
    pub async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
                    .into_bytes();

                self.cache
                    .insert(key.to_string(), Arc::new(data.to_vec()))
                    .await;

                Ok(Some(serde_json::from_slice(&data)?))
            }
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => {
                self.cache.invalidate(key).await;
                Ok(None)
            }
            Err(e) => Err(StorageError::S3Get(Box::new(e))),
        }
    }

    /// List `(key, etag)` of every object under `prefix`
    ///
    /// # Errors
    ///
    /// Returns an error if any listing page fails.
    pub async fn list_objects(&self, prefix: &str) -> Result<Vec<(String, String)>, StorageError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StorageError::S3List(e.to_string()))?;

            for object in page.contents() {
                if let Some(key) = object.key() {
                    let etag = object.e_tag().unwrap_or_default();
                    objects.push((key.to_string(), etag.to_string()));
                }
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(objects)
    }

    /// Delete objects in batches
    ///
    /// # Errors
    ///
    /// Returns an error if a batch request fails.
    pub async fn delete_objects(&self, keys: &[String]) -> Result<(), StorageError> {
        for batch in keys.chunks(DELETE_BATCH_LIMIT) {
            let identifiers = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StorageError::S3Put(e.to_string()))?;

            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .quiet(true)
                .build()
                .map_err(|e| StorageError::S3Put(e.to_string()))?;

            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| StorageError::S3Put(e.to_string()))?;

            for key in batch {
                self.cache.invalidate(key).await;
            }
        }
        Ok(())
    }

    /// Check connection to R2 storage
    ///
    /// # Errors
    ///
    /// Returns a description of the failure if the bucket is unreachable.
    pub async fn check_connection(&self) -> Result<(), String> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!("Successfully connected to R2 storage.");
                Ok(())
            }
            Err(e) => {
                let err_msg = format!("R2 connectivity test failed: {e:#?}");
                error!("{}", err_msg);
                Err(err_msg)
            }
        }
    }
}

#[async_trait]
impl ConsentStore for R2Storage {
    async fn get(&self, user_id: &str) -> Result<Option<ConsentRecord>, StorageError> {
        self.load_json(&consent_key(user_id)).await
    }

    async fn set(&self, user_id: &str, record: ConsentRecord) -> Result<(), StorageError> {
        self.save_json(&consent_key(user_id), &record).await
    }

    async fn update(&self, user_id: &str, update: ConsentUpdate) -> Result<(), StorageError> {
        let key = consent_key(user_id);
        let mut record: ConsentRecord = self
            .load_json(&key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.clone()))?;
        update.apply(&mut record);
        self.save_json(&key, &record).await
    }

    async fn batch_delete(&self, user_ids: &[String]) -> Result<usize, StorageError> {
        let keys: Vec<String> = user_ids.iter().map(|id| consent_key(id)).collect();
        self.delete_objects(&keys).await?;
        Ok(keys.len())
    }

    async fn inactive_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ConsentRecord>, StorageError> {
        let mut stale = Vec::new();
        for (key, _) in self.list_objects(CONSENT_PREFIX).await? {
            match self.fetch_json::<ConsentRecord>(&key).await {
                Ok(Some(record)) if record.last_interaction < cutoff => stale.push(record),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable consent record {}: {}", key, e),
            }
        }
        debug!("{} consent records inactive since {}", stale.len(), cutoff);
        Ok(stale)
    }
}

#[async_trait]
impl CharacterSource for R2Storage {
    async fn list_character_versions(&self) -> Result<Vec<DocumentVersion>, StorageError> {
        Ok(self
            .list_objects(CHARACTERS_PREFIX)
            .await?
            .into_iter()
            .filter_map(|(key, etag)| {
                character_id_from_key(&key).map(|id| DocumentVersion {
                    id: id.to_string(),
                    version: etag,
                })
            })
            .collect())
    }

    async fn load_character(&self, id: &str) -> Result<Option<Character>, StorageError> {
        let character: Option<Character> = self.fetch_json(&character_key(id)).await?;
        Ok(character.map(|mut c| {
            c.id = id.to_string();
            c
        }))
    }
}

/// Returns the R2 key for a user's consent record
#[must_use]
pub fn consent_key(user_id: &str) -> String {
    format!("{CONSENT_PREFIX}{user_id}.json")
}

/// Returns the R2 key for a character document
#[must_use]
pub fn character_key(id: &str) -> String {
    format!("{CHARACTERS_PREFIX}{id}.json")
}

/// Extracts the character identity from a document key
#[must_use]
pub fn character_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(CHARACTERS_PREFIX)?
        .strip_suffix(".json")
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        assert_eq!(consent_key("123"), "consent/123.json");
        assert_eq!(character_key("c1"), "characters/c1.json");
    }

    #[test]
    fn test_character_id_from_key() {
        assert_eq!(character_id_from_key("characters/c1.json"), Some("c1"));
        assert_eq!(character_id_from_key("characters/.json"), None);
        assert_eq!(character_id_from_key("characters/nested/c1.json"), None);
        assert_eq!(character_id_from_key("characters/c1.txt"), None);
        assert_eq!(character_id_from_key("consent/c1.json"), None);
    }
}

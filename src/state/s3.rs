//! S3-based state storage backend.
//!
//! Each logical id is stored as its own object under
//! `<prefix>resources/<id>.json`; S3 writes are atomic per key, so
//! concurrent steps never clobber each other's records.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::{Result, StackError, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, check_takeover};
use super::store::StateStore;
use super::types::{LiveResource, StateSnapshot};

/// Directory holding one object per resource.
const RESOURCES_DIR: &str = "resources/";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn resource_key(&self, id: &str) -> String {
        format!("{}{RESOURCES_DIR}{id}.json", self.prefix)
    }

    fn lock_key(&self) -> String {
        format!("{}{LOCK_KEY}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    StateError::unavailable(format!("Failed to read S3 object {key}: {e}"))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StackError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object {key}: {e}"),
                    })
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::unavailable(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: String) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into_bytes().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::unavailable(format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::unavailable(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Lists every resource object key.
    async fn list_resource_keys(&self) -> Result<Vec<String>> {
        let prefix = format!("{}{RESOURCES_DIR}", self.prefix);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StateError::unavailable(format!("S3 list error: {e}")))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|o| o.key())
                    .filter(|k| k.ends_with(".json"))
                    .map(ToString::to_string),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    fn parse_record(key: &str, json: &str) -> Result<LiveResource> {
        serde_json::from_str(json).map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to parse {key}: {e}"),
            })
        })
    }

    fn parse_lock(json: &str) -> Result<LockInfo> {
        serde_json::from_str(json).map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to parse lock: {e}"),
            })
        })
    }
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn get(&self, id: &str) -> Result<Option<LiveResource>> {
        let key = self.resource_key(id);
        match self.get_object(&key).await? {
            Some(json) => Ok(Some(Self::parse_record(&key, &json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, id: &str, resource: LiveResource) -> Result<()> {
        let key = self.resource_key(id);
        debug!("Writing s3://{}/{key}", self.bucket);

        let content = serde_json::to_string_pretty(&resource)
            .map_err(|e| StateError::serialization(format!("Failed to serialize {id}: {e}")))?;

        self.put_object(&key, content).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let key = self.resource_key(id);
        debug!("Deleting s3://{}/{key}", self.bucket);
        self.delete_object(&key).await
    }

    async fn snapshot_all(&self) -> Result<StateSnapshot> {
        let keys = self.list_resource_keys().await?;
        info!(
            "Loading {} records from s3://{}/{}",
            keys.len(),
            self.bucket,
            self.prefix
        );

        let resource_prefix = format!("{}{RESOURCES_DIR}", self.prefix);
        let mut snapshot = BTreeMap::new();
        for key in keys {
            let Some(id) = key
                .strip_prefix(&resource_prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            // Listed objects can vanish before they are read.
            if let Some(json) = self.get_object(&key).await? {
                snapshot.insert(id.to_string(), Self::parse_record(&key, &json)?);
            }
        }

        Ok(snapshot)
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let key = self.lock_key();

        let existing = match self.get_object(&key).await? {
            Some(content) => Some(Self::parse_lock(&content)?),
            None => None,
        };
        check_takeover(existing.as_ref())?;

        let lock_info = LockInfo::new(holder);
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        self.put_object(&key, content).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let key = self.lock_key();

        if let Some(content) = self.get_object(&key).await? {
            let existing = Self::parse_lock(&content)?;
            if existing.lock_id == lock_id {
                self.delete_object(&key).await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }

        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        self.delete_object(&self.lock_key()).await
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        match self.get_object(&self.lock_key()).await? {
            Some(content) => Ok(Some(Self::parse_lock(&content)?)),
            None => Ok(None),
        }
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

//! S3-based state storage backend.
//!
//! This module provides remote state storage using AWS S3 (or compatible
//! services) for team use. Each logical resource is its own object under
//! `<prefix>resources/<name>.json`.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use crate::error::{ReconcileToolError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::{ResourceState, StateSnapshot};

/// Key segment holding per-resource entries.
const RESOURCES_KEY: &str = "resources/";

/// Lock object key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug, Clone)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

/// Normalises a key prefix to either empty or `segment/`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store using the ambient AWS configuration.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
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

    /// Key of the entry for a logical name.
    fn entry_key(&self, name: &str) -> String {
        format!("{}{RESOURCES_KEY}{name}.json", self.prefix)
    }

    /// Key of the lock object.
    fn lock_key(&self) -> String {
        format!("{}{LOCK_KEY}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self.client.get_object().bucket(&self.bucket).key(key).send().await;

        match result {
            Ok(response) => {
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::s3(format!("Failed to read S3 object {key}: {e}")))?;

                let content = String::from_utf8(bytes.to_vec())
                    .map_err(|e| StateError::corrupted(key, format!("Invalid UTF-8 in S3 object: {e}")))?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::s3(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 put error: {e}")))?;

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
            .map_err(|e| StateError::s3(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Lists every entry key under the resources prefix.
    async fn list_entry_keys(&self) -> Result<Vec<String>> {
        let prefix = format!("{}{RESOURCES_KEY}", self.prefix);
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| StateError::s3(format!("S3 list error: {e}")))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string))
                    .filter(|key| key.ends_with(".json")),
            );

            match response.next_continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }

    /// Extracts the logical name from an entry key.
    fn name_from_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.prefix)?
            .strip_prefix(RESOURCES_KEY)?
            .strip_suffix(".json")
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self, name: &str) -> Result<Option<ResourceState>> {
        let key = self.entry_key(name);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        match self.get_object(&key).await? {
            Some(json) => {
                let state = serde_json::from_str(&json)
                    .map_err(|e| StateError::corrupted(name, e.to_string()))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, name: &str, state: &ResourceState) -> Result<()> {
        let key = self.entry_key(name);

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state for {name}: {e}")))?;

        self.put_object(&key, &content).await?;

        info!("Saved state for {name} to s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let key = self.entry_key(name);
        self.delete_object(&key).await?;
        info!("Removed state for {name}");
        Ok(())
    }

    async fn snapshot(&self) -> Result<StateSnapshot> {
        let mut snapshot = StateSnapshot::new();

        for key in self.list_entry_keys().await? {
            let Some(name) = self.name_from_key(&key) else {
                continue;
            };

            match self.get_object(&key).await {
                Ok(Some(json)) => match serde_json::from_str::<ResourceState>(&json) {
                    Ok(state) => snapshot.insert(state),
                    Err(e) => {
                        warn!("State for {name} is corrupted: {e}");
                        snapshot.insert_corrupt(name, e.to_string());
                    }
                },
                Ok(None) => {}
                Err(ReconcileToolError::State(StateError::Corrupted { message, .. })) => {
                    warn!("State for {name} is corrupted: {message}");
                    snapshot.insert_corrupt(name, message);
                }
                Err(e) => return Err(e),
            }
        }

        debug!("Loaded {} state entries from s3://{}/{}", snapshot.len(), self.bucket, self.prefix);
        Ok(snapshot)
    }

    async fn clear(&self) -> Result<()> {
        info!("Clearing state in s3://{}/{}", self.bucket, self.prefix);

        for key in self.list_entry_keys().await? {
            self.delete_object(&key).await?;
        }
        self.delete_object(&self.lock_key()).await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let key = self.lock_key();

        if let Some(existing) = self.get_lock_info().await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            debug!("Expired lock found, taking over");
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id).for_operation(operation);
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        self.put_object(&key, &content).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.get_lock_info().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.lock_key()).await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.lock_id);
            }
        }

        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        let key = self.lock_key();

        if let Some(content) = self.get_object(&key).await? {
            let lock_info: LockInfo = serde_json::from_str(&content)
                .map_err(|e| StateError::corrupted(LOCK_KEY, format!("Failed to parse lock: {e}")))?;
            return Ok(Some(lock_info));
        }

        Ok(None)
    }

    async fn is_locked(&self) -> Result<bool> {
        if let Some(lock_info) = self.get_lock_info().await? {
            return Ok(!lock_info.is_expired());
        }
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(prefix: Option<&str>) -> S3StateStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .build();
        S3StateStore::with_client(Client::from_conf(config), "bucket", prefix)
    }

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("/team/prod/")), "team/prod/");
    }

    #[test]
    fn test_entry_keys() {
        let s3 = store(Some("app/prod"));
        assert_eq!(s3.entry_key("DbInstance"), "app/prod/resources/DbInstance.json");
        assert_eq!(s3.lock_key(), "app/prod/state.lock");
        assert_eq!(s3.name_from_key("app/prod/resources/DbInstance.json"), Some("DbInstance"));
        assert_eq!(s3.name_from_key("other/resources/DbInstance.json"), None);
    }
}

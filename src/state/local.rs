//! Local file-based state storage backend.
//!
//! Each logical resource is stored as its own JSON file under
//! `<base>/resources/`, written through a temp file, fsync and rename so a
//! crash never leaves a half-written entry behind.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{ReconcileToolError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::{ResourceState, StateSnapshot};

/// Default state directory name.
pub const STATE_DIR: &str = ".rds-reconcile";

/// Subdirectory holding one file per resource.
const RESOURCES_DIR: &str = "resources";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Directory of per-resource entries.
    resources_dir: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a store under `.rds-reconcile/<stage>` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new(stage: &str) -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| ReconcileToolError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR)
            .join(stage);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let resources_dir = base_dir.join(RESOURCES_DIR);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            resources_dir,
            lock_path,
        }
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the entry for a logical name.
    fn entry_path(&self, name: &str) -> PathBuf {
        self.resources_dir.join(format!("{name}.json"))
    }

    /// Ensures a directory exists.
    async fn ensure_dir(dir: &Path) -> Result<()> {
        if !dir.exists() {
            debug!("Creating state directory: {}", dir.display());
            fs::create_dir_all(dir).await.map_err(|e| {
                StateError::storage(format!("Failed to create state directory {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// Writes `content` to `path` through a temp file and an atomic rename.
    async fn write_atomic(path: &Path, content: &str) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to create {}: {e}", temp_path.display())))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::storage(format!("Failed to write {}: {e}", temp_path.display())))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::storage(format!("Failed to sync {}: {e}", temp_path.display())))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to rename {}: {e}", temp_path.display())))?;

        Ok(())
    }

    /// Parses an entry, naming it in the error.
    fn parse_entry(name: &str, content: &str) -> std::result::Result<ResourceState, StateError> {
        serde_json::from_str(content).map_err(|e| StateError::corrupted(name, e.to_string()))
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path)
            .await
            .map_err(|e| StateError::corrupted(LOCK_FILE, format!("Failed to read lock file: {e}")))?;

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(LOCK_FILE, format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self, name: &str) -> Result<Option<ResourceState>> {
        let path = self.entry_path(name);
        if !path.exists() {
            debug!("No state entry for {name}");
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| StateError::corrupted(name, format!("Failed to read {}: {e}", path.display())))?;

        Ok(Some(Self::parse_entry(name, &content)?))
    }

    async fn save(&self, name: &str, state: &ResourceState) -> Result<()> {
        Self::ensure_dir(&self.resources_dir).await?;

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state for {name}: {e}")))?;

        let path = self.entry_path(name);
        Self::write_atomic(&path, &content).await?;

        info!("Saved state for {name} to {}", path.display());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let path = self.entry_path(name);
        if path.exists() {
            fs::remove_file(&path)
                .await
                .map_err(|e| StateError::storage(format!("Failed to remove {}: {e}", path.display())))?;
            info!("Removed state for {name}");
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<StateSnapshot> {
        let mut snapshot = StateSnapshot::new();
        if !self.resources_dir.exists() {
            return Ok(snapshot);
        }

        let mut dir = fs::read_dir(&self.resources_dir)
            .await
            .map_err(|e| StateError::storage(format!("Failed to list {}: {e}", self.resources_dir.display())))?;

        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| StateError::storage(format!("Failed to list state entries: {e}")))?
        {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };

            match fs::read_to_string(&path).await {
                Ok(content) => match Self::parse_entry(&name, &content) {
                    Ok(state) => snapshot.insert(state),
                    Err(e) => {
                        warn!("{e}");
                        snapshot.insert_corrupt(&name, e.to_string());
                    }
                },
                Err(e) => {
                    warn!("Failed to read state entry {name}: {e}");
                    snapshot.insert_corrupt(&name, e.to_string());
                }
            }
        }

        debug!("Loaded {} state entries from {}", snapshot.len(), self.base_dir.display());
        Ok(snapshot)
    }

    async fn clear(&self) -> Result<()> {
        if self.resources_dir.exists() {
            info!("Clearing state in {}", self.base_dir.display());
            fs::remove_dir_all(&self.resources_dir)
                .await
                .map_err(|e| StateError::storage(format!("Failed to clear state: {e}")))?;
        }
        self.delete_lock_file().await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(ReconcileToolError::State(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }));
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

        Self::ensure_dir(&self.base_dir).await?;
        Self::write_atomic(&self.lock_path, &content)
            .await
            .map_err(|e| StateError::LockFailed { message: e.to_string() })?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.lock_id);
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn is_locked(&self) -> Result<bool> {
        if let Some(lock_info) = self.read_lock_file().await? {
            return Ok(!lock_info.is_expired());
        }
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn entry(name: &str) -> ResourceState {
        ResourceState::new(name, "aws:rds:SubnetGroup", &format!("{name}-id"), json!({"a": 1}), "hash")
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        store.save("DbSubnetGroup", &entry("DbSubnetGroup")).await.expect("Failed to save");

        let loaded = store
            .load("DbSubnetGroup")
            .await
            .expect("Failed to load")
            .expect("Entry should exist");

        assert_eq!(loaded.external_id, "DbSubnetGroup-id");
        assert_eq!(loaded.inputs, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();
        assert!(store.load("Missing").await.expect("Load should not fail").is_none());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let (store, _temp) = create_test_store();
        store.save("A", &entry("A")).await.expect("save");
        store.save("B", &entry("B")).await.expect("save");

        store.remove("A").await.expect("remove");
        store.remove("A").await.expect("second remove is a no-op");
        assert!(store.load("A").await.expect("load").is_none());

        store.clear().await.expect("clear");
        assert!(store.snapshot().await.expect("snapshot").is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_keeps_corrupt_entries() {
        let (store, temp) = create_test_store();
        store.save("Good", &entry("Good")).await.expect("save");

        let bad = temp.path().join(RESOURCES_DIR).join("Bad.json");
        std::fs::write(&bad, "{ not json").expect("write corrupt entry");

        let snapshot = store.snapshot().await.expect("snapshot");
        assert!(snapshot.resource("Good").is_some());
        assert!(snapshot.is_corrupt("Bad"));

        let err = store.load("Bad").await.expect_err("corrupt load should fail");
        assert!(matches!(err, ReconcileToolError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let (store, temp) = create_test_store();
        store.save("A", &entry("A")).await.expect("save");

        let names: Vec<String> = std::fs::read_dir(temp.path().join(RESOURCES_DIR))
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![String::from("A.json")]);
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store.acquire_lock("test-holder", "apply").await.expect("acquire");
        assert!(store.is_locked().await.expect("is_locked"));

        store.release_lock(&lock.lock_id).await.expect("release");
        assert!(!store.is_locked().await.expect("is_locked"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock = store.acquire_lock("holder-1", "apply").await.expect("first lock");
        let result = store.acquire_lock("holder-2", "destroy").await;
        assert!(matches!(
            result,
            Err(ReconcileToolError::State(StateError::LockedByOther { .. }))
        ));
    }
}

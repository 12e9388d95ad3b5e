//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Entries are keyed by logical name so concurrent executor tasks never
//! write the same key.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::{ResourceState, StateSnapshot};
use crate::error::Result;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the entry for a logical name.
    ///
    /// Returns `None` if nothing is stored and a `StateError::Corrupted`
    /// if the entry cannot be parsed.
    async fn load(&self, name: &str) -> Result<Option<ResourceState>>;

    /// Durably saves the entry for a logical name.
    async fn save(&self, name: &str, state: &ResourceState) -> Result<()>;

    /// Removes the entry for a logical name. Missing entries are ignored.
    async fn remove(&self, name: &str) -> Result<()>;

    /// Loads every stored entry, keeping unparseable ones as corrupt.
    async fn snapshot(&self) -> Result<StateSnapshot>;

    /// Removes every entry and the lock.
    async fn clear(&self) -> Result<()>;

    /// Acquires a lock on the state for `operation`.
    ///
    /// An empty `holder` is replaced by a generated process identifier.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases a lock on the state.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self, name: &str) -> Result<Option<ResourceState>> {
        (**self).load(name).await
    }

    async fn save(&self, name: &str, state: &ResourceState) -> Result<()> {
        (**self).save(name, state).await
    }

    async fn remove(&self, name: &str) -> Result<()> {
        (**self).remove(name).await
    }

    async fn snapshot(&self) -> Result<StateSnapshot> {
        (**self).snapshot().await
    }

    async fn clear(&self) -> Result<()> {
        (**self).clear().await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder, operation).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

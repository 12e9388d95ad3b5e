//! Provider abstraction.
//!
//! The [`Provider`] owns resource lifecycle on the cloud side; the executor
//! only calls it and records what it returns. The [`SecretStore`] reads and
//! writes secret payloads for Reference mode and secret versions.

mod http;
mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;
use crate::resource::Outputs;

pub use http::HttpProvider;
pub use simulated::{CallRecord, Operation, SimulatedProvider};

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// What the provider returns for a create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Created {
    /// Provider-assigned identifier.
    pub id: String,
    /// Outputs of the new resource.
    #[serde(default)]
    pub outputs: Outputs,
}

/// Cloud resource lifecycle operations.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a resource.
    async fn create(&self, resource_type: &str, name: &str, inputs: &Value) -> ProviderResult<Created>;

    /// Updates a resource in place.
    async fn update(&self, resource_type: &str, id: &str, inputs: &Value) -> ProviderResult<Outputs>;

    /// Deletes a resource. A missing resource yields `ProviderError::NotFound`.
    async fn delete(&self, resource_type: &str, id: &str) -> ProviderResult<()>;

    /// Reads an existing resource, `None` if it does not exist.
    async fn read(&self, resource_type: &str, id: &str) -> ProviderResult<Option<Outputs>>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Secret payload storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Reads a secret value, `None` if absent.
    async fn get(&self, id: &str) -> ProviderResult<Option<String>>;

    /// Writes a secret value.
    async fn put(&self, id: &str, value: &str) -> ProviderResult<()>;
}

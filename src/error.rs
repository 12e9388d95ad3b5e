//! Error types for the RDS reconciler.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph construction, state management, provider calls,
//! planning, and reconciliation.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the reconciler.
#[derive(Debug, Error)]
pub enum ReconcileToolError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
///
/// Every variant is fatal and raised before any provider call is made.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Two declarations share a logical name.
    #[error("Duplicate {resource_type} name: {name}")]
    DuplicateName {
        /// Kind of declaration (resource, database).
        resource_type: String,
        /// The duplicated name.
        name: String,
    },

    /// A logical name is malformed.
    #[error("Invalid logical name '{name}': {reason}")]
    InvalidName {
        /// The offending name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Dependency edges form a cycle.
    #[error("Dependency cycle detected: {cycle}")]
    CycleDetected {
        /// The cycle, rendered as `A -> B -> A`.
        cycle: String,
    },

    /// A dependency edge points to an undeclared resource.
    #[error("Resource '{from}' depends on undeclared resource '{to}'")]
    DanglingReference {
        /// Resource declaring the edge.
        from: String,
        /// Missing target.
        to: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// A stored entry could not be read or parsed.
    #[error("State for '{name}' is corrupted: {message}")]
    Corrupted {
        /// Logical name (or file) of the corrupted entry.
        name: String,
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Local filesystem error.
    #[error("State storage IO error: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },
}

/// Errors reported by a provider call.
///
/// These are local to the node that made the call and never abort
/// independent branches of a run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Authentication failed.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// API request failed.
    #[error("Provider request failed: {status} - {message}")]
    ApiRequestFailed {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// The provider throttled the request.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The resource does not exist on the provider side.
    #[error("Resource not found: {id}")]
    NotFound {
        /// External identifier.
        id: String,
    },

    /// The provider rejected the inputs.
    #[error("Provider rejected {resource_type}: {message}")]
    Rejected {
        /// Resource type of the call.
        resource_type: String,
        /// Reason given by the provider.
        message: String,
    },

    /// Network error.
    #[error("Network error communicating with provider: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from the provider.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The plan relies on baselines that could not be read.
    #[error("State for {resources} could not be read; rerun with --accept-corrupt to re-create them")]
    CorruptBaseline {
        /// Comma-separated logical names.
        resources: String,
    },

    /// An input reference could not be resolved from dependency outputs.
    #[error("Resource '{resource}' references '{reference}' which is not available")]
    UnresolvedReference {
        /// Resource whose inputs were being resolved.
        resource: String,
        /// The reference text.
        reference: String,
    },

    /// An input reference is malformed.
    #[error("Resource '{resource}' has a malformed reference '{reference}'")]
    MalformedReference {
        /// Resource declaring the reference.
        resource: String,
        /// The reference text.
        reference: String,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// An expected output is missing from state.
    #[error("Output '{output}' of '{resource}' is not available")]
    MissingOutput {
        /// Logical resource name.
        resource: String,
        /// Output key.
        output: String,
    },

    /// The proxy id was requested on a database without a proxy.
    #[error("Proxy is not enabled for {name}. Enable it with \"proxy: true\".")]
    ProxyNotEnabled {
        /// Component name.
        name: String,
    },

    /// The referenced database exposes no password secret.
    #[error("Failed to get password for MySQL {name}.")]
    PasswordUnavailable {
        /// Component name.
        name: String,
    },
}

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, ReconcileToolError>;

impl ReconcileToolError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this is a configuration problem detected before any
    /// provider call.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Plan(PlanError::MalformedReference { .. }))
    }

    /// Process exit code for this error: `2` for invalid configuration,
    /// `1` for everything else.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if self.is_configuration() { 2 } else { 1 }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error for a named entry.
    #[must_use]
    pub fn corrupted(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupted {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates an API request error.
    #[must_use]
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(resource_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            resource_type: resource_type.into(),
            message: message.into(),
        }
    }

    /// Returns true if the resource is already gone on the provider side.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

//! Program file types.
//!
//! These structs map to `rds-reconcile.yaml`. A program names its stage,
//! where state lives, how the executor runs, which provider it talks to,
//! and declares MySQL databases and any extra raw resources.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::planner::ReplacePolicy;
use crate::planner::DEFAULT_CONCURRENCY;
use crate::resource::ResourceSpec;

/// Root of a program file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgramConfig {
    /// Program identity.
    pub program: ProgramSection,
    /// State backend.
    #[serde(default)]
    pub state: StateConfig,
    /// Executor settings.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Provider settings.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// MySQL databases.
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
    /// Extra resource declarations, passed to the graph as-is.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// Program identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgramSection {
    /// Program name, lowercase with hyphens.
    pub name: String,
    /// Stage (e.g. "dev", "production").
    #[serde(default = "default_stage")]
    pub stage: String,
    /// Run in local development mode.
    #[serde(default)]
    pub dev: bool,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// Local state directory.
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket (required for the s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region.
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// One JSON file per resource in a local directory.
    #[default]
    Local,
    /// One object per resource in an S3 bucket.
    S3,
}

/// Executor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of nodes running at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Replacement ordering for types without their own default.
    #[serde(default)]
    pub replace_policy: ReplacePolicy,
}

/// Provider settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Provider implementation.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL of the HTTP provider.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Request timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Provider implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-process provider that fabricates ids and outputs.
    #[default]
    Simulated,
    /// JSON-over-HTTP provider.
    Http,
}

/// Raw options of a MySQL database.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Component name, used as the prefix of every resource it emits.
    pub name: String,
    /// MySQL engine version.
    #[serde(default)]
    pub version: Option<String>,
    /// Master username.
    #[serde(default)]
    pub username: Option<String>,
    /// Master password; generated when absent.
    #[serde(default)]
    pub password: Option<String>,
    /// Database name.
    #[serde(default)]
    pub database: Option<String>,
    /// Instance type without the `db.` prefix.
    #[serde(default)]
    pub instance: Option<String>,
    /// Maximum storage, e.g. "100 GB" or "2 TB".
    #[serde(default)]
    pub storage: Option<String>,
    /// Multi-AZ deployment.
    #[serde(default)]
    pub multi_az: Option<bool>,
    /// Number of read replicas.
    #[serde(default)]
    pub replicas: Option<u32>,
    /// RDS Proxy.
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// Network placement.
    #[serde(default)]
    pub vpc: Option<VpcConfig>,
    /// Local database used in dev mode.
    #[serde(default)]
    pub dev: Option<DevConfig>,
    /// Input overrides for generated resources.
    #[serde(default)]
    pub transform: TransformConfig,
    /// Existing database to reference instead of creating one.
    #[serde(default)]
    pub reference: Option<ReferenceConfig>,
}

/// `proxy: true` or `proxy: { credentials: [...] }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ProxyConfig {
    /// Enabled or disabled.
    Enabled(bool),
    /// Enabled with extra users.
    Credentials {
        /// Extra users the proxy authenticates.
        #[serde(default)]
        credentials: Vec<ProxyCredential>,
    },
}

/// Extra proxy user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyCredential {
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
}

/// Network placement.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VpcConfig {
    /// Private subnet ids.
    #[serde(default)]
    pub subnets: Vec<String>,
}

/// Local database settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DevConfig {
    /// Host, `localhost` by default.
    #[serde(default)]
    pub host: Option<String>,
    /// Port, 3306 by default.
    #[serde(default)]
    pub port: Option<u16>,
    /// Database name; inherits the top-level one.
    #[serde(default)]
    pub database: Option<String>,
    /// Username; inherits the top-level one.
    #[serde(default)]
    pub username: Option<String>,
    /// Password; inherits the top-level one.
    #[serde(default)]
    pub password: Option<String>,
}

/// Input overrides, shallow-merged over the generated inputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransformConfig {
    /// Subnet group inputs.
    #[serde(default)]
    pub subnet_group: Option<Map<String, Value>>,
    /// Parameter group inputs.
    #[serde(default)]
    pub parameter_group: Option<Map<String, Value>>,
    /// Instance inputs.
    #[serde(default)]
    pub instance: Option<Map<String, Value>>,
    /// Proxy inputs.
    #[serde(default)]
    pub proxy: Option<Map<String, Value>>,
}

/// Existing database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceConfig {
    /// Instance identifier.
    pub id: String,
    /// Proxy identifier.
    #[serde(default)]
    pub proxy_id: Option<String>,
}

fn default_stage() -> String {
    String::from("dev")
}

const fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            replace_policy: ReplacePolicy::default(),
        }
    }
}

impl ProgramConfig {
    /// Gets a database by component name.
    #[must_use]
    pub fn database(&self, name: &str) -> Option<&DatabaseConfig> {
        self.databases.iter().find(|d| d.name == name)
    }

    /// Number of declared databases.
    #[must_use]
    pub fn database_count(&self) -> usize {
        self.databases.len()
    }
}

impl ProxyConfig {
    /// Whether a proxy is requested.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        match self {
            Self::Enabled(enabled) => *enabled,
            Self::Credentials { .. } => true,
        }
    }

    /// Extra users, empty for `proxy: true`.
    #[must_use]
    pub fn credentials(&self) -> &[ProxyCredential] {
        match self {
            Self::Enabled(_) => &[],
            Self::Credentials { credentials } => credentials,
        }
    }
}

impl std::fmt::Display for StateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::S3 => write!(f, "s3"),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulated => write!(f, "simulated"),
            Self::Http => write!(f, "http"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_forms() {
        let enabled: ProxyConfig = serde_yaml::from_str("true").expect("bool");
        assert!(enabled.is_enabled());
        assert!(enabled.credentials().is_empty());

        let disabled: ProxyConfig = serde_yaml::from_str("false").expect("bool");
        assert!(!disabled.is_enabled());

        let with_users: ProxyConfig = serde_yaml::from_str(
            "credentials:\n  - username: metabase\n    password: secret\n",
        )
        .expect("credentials");
        assert!(with_users.is_enabled());
        assert_eq!(with_users.credentials()[0].username, "metabase");
    }

    #[test]
    fn test_defaults() {
        let config: ProgramConfig = serde_yaml::from_str("program:\n  name: my-app\n").expect("minimal");
        assert_eq!(config.program.stage, "dev");
        assert!(!config.program.dev);
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.execution.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.execution.replace_policy, ReplacePolicy::CreateBeforeDelete);
        assert_eq!(config.provider.kind, ProviderKind::Simulated);
        assert!(config.databases.is_empty());
    }

    #[test]
    fn test_unknown_database_option_rejected() {
        let yaml = "program:\n  name: app\ndatabases:\n  - name: Db\n    engine: postgres\n";
        assert!(serde_yaml::from_str::<ProgramConfig>(yaml).is_err());
    }
}

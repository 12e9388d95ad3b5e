//! Configuration module.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `rds-reconcile.yaml`
//! - Validation of programs before planning
//! - Hashing declared inputs for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, PROVIDER_TOKEN_VAR, find_config_file};
pub use spec::{
    DatabaseConfig, DevConfig, ExecutionConfig, ProgramConfig, ProgramSection, ProviderConfig, ProviderKind,
    ProxyConfig, ProxyCredential, ReferenceConfig, StateBackend, StateConfig, TransformConfig, VpcConfig,
};
pub use validator::{ConfigValidator, MAX_NAME_LEN, ValidationError, ValidationResult, is_valid_name};

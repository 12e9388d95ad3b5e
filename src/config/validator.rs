//! Program validation.
//!
//! Collects every problem in a program before anything is planned, so the
//! user sees all of them at once.

use crate::component::Mysql;
use crate::error::{ConfigError, ReconcileToolError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{ProgramConfig, ProviderKind, StateBackend};

/// Longest allowed logical name.
pub const MAX_NAME_LEN: usize = 128;

/// Validator for programs.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a program.
    ///
    /// # Errors
    ///
    /// Returns the first error if validation fails; [`Self::check`] returns
    /// all of them.
    pub fn validate(&self, config: &ProgramConfig) -> Result<ValidationResult> {
        let result = self.check(config);
        if let Some(first) = result.errors.first() {
            return Err(ReconcileToolError::Config(ConfigError::ValidationError {
                message: first.message.clone(),
                field: Some(first.field.clone()),
            }));
        }
        debug!("Program validation passed");
        Ok(result)
    }

    /// Collects every error and warning in a program.
    #[must_use]
    pub fn check(&self, config: &ProgramConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_program(config, &mut result);
        Self::validate_state(config, &mut result);
        Self::validate_execution(config, &mut result);
        Self::validate_provider(config, &mut result);
        Self::validate_databases(config, &mut result);
        Self::validate_resources(config, &mut result);

        result
    }

    fn validate_program(config: &ProgramConfig, result: &mut ValidationResult) {
        let program = &config.program;
        if program.name.is_empty() {
            result.error("program.name", "Program name cannot be empty");
        } else if !is_valid_program_name(&program.name) {
            result.error(
                "program.name",
                format!(
                    "Program name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    program.name
                ),
            );
        }

        if program.stage.is_empty() {
            result.error("program.stage", "Stage cannot be empty");
        }
    }

    fn validate_state(config: &ProgramConfig, result: &mut ValidationResult) {
        let state = &config.state;
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error("state.bucket", "S3 bucket name is required when using S3 backend");
                }
                if state.path.is_some() {
                    result.warnings.push(String::from("state.path is ignored by the s3 backend"));
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result.warnings.push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    fn validate_execution(config: &ProgramConfig, result: &mut ValidationResult) {
        let concurrency = config.execution.concurrency;
        if concurrency == 0 {
            result.error("execution.concurrency", "Concurrency must be at least 1");
        } else if concurrency > 64 {
            result
                .warnings
                .push(format!("execution.concurrency: {concurrency} parallel provider calls is unusual"));
        }
    }

    fn validate_provider(config: &ProgramConfig, result: &mut ValidationResult) {
        let provider = &config.provider;
        match provider.kind {
            ProviderKind::Http => match provider.endpoint.as_deref() {
                None | Some("") => result.error("provider.endpoint", "An endpoint is required for the http provider"),
                Some(endpoint) if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") => {
                    result.error(
                        "provider.endpoint",
                        format!("Endpoint '{endpoint}' must start with http:// or https://"),
                    );
                }
                Some(_) => {}
            },
            ProviderKind::Simulated => {
                if !config.program.dev && config.program.stage == "production" {
                    result
                        .warnings
                        .push(String::from("provider.kind: the simulated provider creates no real resources"));
                }
            }
        }

        if provider.timeout_secs == Some(0) {
            result.error("provider.timeout_secs", "Timeout must be at least 1 second");
        }
    }

    fn validate_databases(config: &ProgramConfig, result: &mut ValidationResult) {
        let mut seen = HashSet::new();

        for (i, db) in config.databases.iter().enumerate() {
            let prefix = format!("databases[{i}]");

            if !seen.insert(db.name.as_str()) {
                result.error(format!("{prefix}.name"), format!("Duplicate database name: {}", db.name));
            }
            if !is_valid_name(&db.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Database name '{}' is invalid. Must start with a letter and contain only letters, digits, '-' or '_'.",
                        db.name
                    ),
                );
                continue;
            }

            match Mysql::resolve(db, &config.program) {
                Ok(_) => {}
                Err(ConfigError::ValidationError { message, field }) => {
                    result.error(field.unwrap_or_else(|| prefix.clone()), message);
                }
                Err(e) => result.error(prefix.clone(), e.to_string()),
            }

            if db.reference.is_some() && (db.vpc.is_some() || db.proxy.is_some() || db.replicas.is_some()) {
                result.warnings.push(format!(
                    "{prefix}: {} references an existing database; provisioning options are ignored",
                    db.name
                ));
            }
            if db.dev.is_some() && !config.program.dev {
                debug!("{}: dev block unused outside dev mode", db.name);
            }
        }

        if config.databases.is_empty() && config.resources.is_empty() {
            result.warnings.push(String::from("No databases or resources declared"));
        }
    }

    fn validate_resources(config: &ProgramConfig, result: &mut ValidationResult) {
        for (i, resource) in config.resources.iter().enumerate() {
            if resource.resource_type.is_empty() {
                result.error(format!("resources[{i}].type"), "Resource type cannot be empty");
            }
            if !resource.inputs.is_object() {
                result.error(
                    format!("resources[{i}].inputs"),
                    format!("Inputs of '{}' must be a mapping", resource.name),
                );
            }
        }
    }
}

/// Whether `name` can be a logical resource or component name: a letter,
/// then letters, digits, `-` or `_`.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    name.len() <= MAX_NAME_LEN
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Validates a program name.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_program_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    let mut chars = name.chars();

    if let Some(first) = chars.next()
        && !first.is_ascii_lowercase()
    {
        return false;
    }

    for c in chars {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
            return false;
        }
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

//! Program file loading.
//!
//! Loads `rds-reconcile.yaml`, optionally preceded by a `.env` file, and
//! applies `RDSR_*` environment overrides on top.

use crate::error::{ConfigError, ReconcileToolError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::ProgramConfig;

/// Environment variable holding the HTTP provider bearer token.
pub const PROVIDER_TOKEN_VAR: &str = "RDSR_PROVIDER_TOKEN";

/// Program file loader.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Directory searched for `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory searched for `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a program file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ProgramConfig> {
        let path = path.as_ref();
        info!("Loading program from: {}", path.display());

        if !path.exists() {
            return Err(ReconcileToolError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ReconcileToolError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a program from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<ProgramConfig> {
        debug!("Parsing YAML program");

        let config: ProgramConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            ReconcileToolError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed program {} ({} databases, {} raw resources)",
            config.program.name,
            config.databases.len(),
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads a program file and applies environment overrides.
    ///
    /// Overrides use the form `RDSR_<SECTION>_<KEY>`, e.g.
    /// `RDSR_PROGRAM_STAGE`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an
    /// override has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<ProgramConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies overrides read through `var`.
    fn apply_env_overrides<F>(config: &mut ProgramConfig, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = var("RDSR_PROGRAM_NAME") {
            debug!("Overriding program.name from environment");
            config.program.name = name;
        }

        if let Some(stage) = var("RDSR_PROGRAM_STAGE") {
            debug!("Overriding program.stage from environment");
            config.program.stage = stage;
        }

        if let Some(dev) = var("RDSR_DEV") {
            debug!("Overriding program.dev from environment");
            config.program.dev = parse_bool("RDSR_DEV", &dev)?;
        }

        if let Some(bucket) = var("RDSR_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Some(prefix) = var("RDSR_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Some(endpoint) = var("RDSR_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            config.provider.endpoint = Some(endpoint);
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ReconcileToolError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the provider token from the environment, if set.
    #[must_use]
    pub fn get_provider_token() -> Option<String> {
        std::env::var(PROVIDER_TOKEN_VAR).ok().filter(|t| !t.is_empty())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ReconcileToolError::Config(ConfigError::validation(
            format!("{name} must be a boolean, got '{other}'"),
            name,
        ))),
    }
}

/// Program file names searched for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["rds-reconcile.yaml", "rds-reconcile.yml"];

/// Finds the program file in `start_dir` or one of its parents.
///
/// # Errors
///
/// Returns an error if no program file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found program file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ReconcileToolError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

//! Components that expand user options into resource declarations.

pub mod mysql;

pub use mysql::{LocalDatabase, Mysql, MysqlMode, MysqlOutputs, NewDatabase};

use tracing::debug;

use crate::config::ProgramConfig;
use crate::error::ConfigError;
use crate::resource::ResourceSpec;

/// Everything a program declares.
#[derive(Debug, Clone)]
pub struct Declarations {
    /// Resolved databases, in program order.
    pub databases: Vec<Mysql>,
    /// Resource declarations: database resources first, then raw ones.
    pub resources: Vec<ResourceSpec>,
}

impl Declarations {
    /// Expands a program.
    ///
    /// # Errors
    ///
    /// Returns an error if a database has invalid options.
    pub fn from_program(program: &ProgramConfig) -> Result<Self, ConfigError> {
        let mut databases = Vec::with_capacity(program.databases.len());
        let mut resources = Vec::new();

        for config in &program.databases {
            let mysql = Mysql::resolve(config, &program.program)?;
            let specs = mysql.resource_specs();
            debug!("{} ({}): {} resources", mysql.name(), mysql.mode(), specs.len());
            resources.extend(specs);
            databases.push(mysql);
        }
        resources.extend(program.resources.iter().cloned());

        Ok(Self { databases, resources })
    }

    /// Gets a database by component name.
    #[must_use]
    pub fn database(&self, name: &str) -> Option<&Mysql> {
        self.databases.iter().find(|d| d.name() == name)
    }
}

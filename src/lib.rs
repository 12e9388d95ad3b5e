// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # rds-reconcile
//!
//! A declarative, dependency-ordered reconciler for AWS RDS MySQL databases.
//!
//! ## Overview
//!
//! A program declares databases (and any extra resources) in YAML. Each
//! database expands into the resources it needs: password, secret, subnet
//! and parameter groups, instance, replicas and an optional proxy. The
//! reconciler then:
//!
//! - Builds a dependency graph from explicit dependencies and `${Name.output}` references
//! - Diffs the graph against recorded state into create, update, replace and delete actions
//! - Executes the plan concurrently, never starting a resource before its dependencies
//! - Records every successful provider call in per-resource state entries
//!
//! ## Modules
//!
//! - [`config`]: Program parsing and validation
//! - [`component`]: The MySQL component and its three modes
//! - [`planner`]: Graph, diff, plan and executor
//! - [`provider`]: Provider abstraction (HTTP and simulated)
//! - [`state`]: State storage backends (local, S3)
//! - [`reconciler`]: Plan/apply/destroy orchestration under the state lock
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! program:
//!   name: my-app
//!   stage: prod
//!
//! databases:
//!   - name: Database
//!     proxy: true
//!     vpc:
//!       subnets: [subnet-a, subnet-b]
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod component;
pub mod config;
pub mod error;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod resource;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use component::{Declarations, Mysql, MysqlMode, MysqlOutputs};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, ProgramConfig};
pub use error::{ReconcileToolError, Result};
pub use planner::{DiffEngine, Plan, PlanExecutor, ResourceGraph, RunReport, RunStatus};
pub use provider::{HttpProvider, Provider, SecretStore, SimulatedProvider};
pub use reconciler::{ApplyOptions, ApplyResult, Reconciler};
pub use resource::ResourceSpec;
pub use state::{LocalStateStore, ResourceState, S3StateStore, StateSnapshot, StateStore};

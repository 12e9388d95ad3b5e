//! Planning and execution.
//!
//! The [`ResourceGraph`] orders declarations, the [`DiffEngine`] compares
//! them with recorded state into a [`Plan`], and the [`PlanExecutor`]
//! applies the plan concurrently in dependency order.

mod diff;
mod executor;
mod graph;
mod plan;
mod schema;

pub use diff::DiffEngine;
pub use executor::{DEFAULT_CONCURRENCY, NodeOutcome, NodeStatus, PlanExecutor, RunReport, RunStatus};
pub use graph::{GraphNode, ResourceGraph};
pub use plan::{Action, FieldChange, Plan, ReplacePolicy, ResourcePlan, SENSITIVE_PLACEHOLDER};
pub use schema::{BUILTIN_SCHEMAS, SchemaRegistry, TypeSchema};

//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::component::MysqlOutputs;
use crate::config::{ValidationResult, ProgramConfig};
use crate::planner::{Action, NodeStatus, Plan, RunReport, RunStatus};
use crate::state::{ResourceState, StateEntry, StateSnapshot};

use super::commands::OutputFormat;

const MASK: &str = "********";

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan entry row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Run outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Message")]
    message: String,
}

/// State entry row for table display.
#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "Resource")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Inputs")]
    hash: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!("{} No changes required - infrastructure is up to date.\n", "✓".green());
        }

        let mut output = String::from("\nPlan\n\n");

        let rows: Vec<PlanRow> = plan
            .actionable()
            .into_iter()
            .map(|e| PlanRow {
                action: Self::format_action(e.action),
                resource: e.name.clone(),
                resource_type: e.resource_type.clone(),
                reason: Self::truncate(&e.description(), 60),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for entry in plan.actionable() {
                if entry.changes.is_empty() {
                    continue;
                }
                let _ = writeln!(output, "\n  {} {}", Self::format_action(entry.action), entry.name);
                for change in &entry.changes {
                    let marker = if change.forces_replacement {
                        " (forces replacement)".red().to_string()
                    } else if change.cascaded {
                        " (dependency replaced)".yellow().to_string()
                    } else {
                        String::new()
                    };
                    let _ = writeln!(
                        output,
                        "      {}: {} -> {}{marker}",
                        change.field,
                        Self::format_value(change.old_value.as_ref()),
                        Self::format_value(change.new_value.as_ref()),
                    );
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete\n",
            plan.count(Action::Create).to_string().green(),
            plan.count(Action::Update).to_string().yellow(),
            plan.count(Action::Replace).to_string().magenta(),
            plan.count(Action::Delete).to_string().red()
        );

        let corrupt = plan.corrupt_baselines();
        if !corrupt.is_empty() {
            let _ = write!(
                output,
                "\n{} Unreadable state for: {}\n   These will be recreated without a baseline; pass --accept-corrupt to apply.\n",
                "⚠".yellow(),
                corrupt.join(", ")
            );
        }

        output
    }

    /// Formats a run report.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                let status = match report.status {
                    RunStatus::Success => format!("{} Apply succeeded", "✓".green()),
                    RunStatus::Partial => format!("{} Apply partially succeeded", "⚠".yellow()),
                    RunStatus::Failed => format!("{} Apply failed", "✗".red()),
                };
                let mut output = format!("{status} in {}ms\n\n", report.duration_ms());

                let rows: Vec<OutcomeRow> = report
                    .outcomes
                    .iter()
                    .filter(|o| o.status != NodeStatus::Unchanged)
                    .map(|o| OutcomeRow {
                        resource: o.name.clone(),
                        action: o.action.to_string(),
                        status: Self::format_status(o.status),
                        id: o.external_id.clone().unwrap_or_default(),
                        message: Self::truncate(o.message.as_deref().unwrap_or(""), 60),
                    })
                    .collect();
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let _ = write!(
                    output,
                    "\n{} succeeded, {} failed, {} skipped, {} partial, {} cancelled, {} unchanged\n",
                    report.count(NodeStatus::Succeeded),
                    report.count(NodeStatus::Failed),
                    report.count(NodeStatus::Skipped),
                    report.count(NodeStatus::Partial),
                    report.count(NodeStatus::Cancelled),
                    report.count(NodeStatus::Unchanged),
                );
                output
            }
        }
    }

    /// Formats database outputs, masking passwords unless `show_secrets`.
    #[must_use]
    pub fn format_outputs(&self, outputs: &[MysqlOutputs], show_secrets: bool) -> String {
        let masked: Vec<MysqlOutputs> = outputs
            .iter()
            .cloned()
            .map(|mut o| {
                if !show_secrets {
                    o.password = MASK.to_string();
                }
                o
            })
            .collect();

        match self.format {
            OutputFormat::Json => {
                let map: serde_json::Map<String, serde_json::Value> = masked
                    .iter()
                    .map(|o| (o.name.clone(), serde_json::Value::Object(o.link_properties())))
                    .collect();
                serde_json::to_string_pretty(&map).unwrap_or_default()
            }
            OutputFormat::Text => {
                if masked.is_empty() {
                    return String::from("No databases declared.\n");
                }
                let mut output = String::new();
                for o in &masked {
                    let _ = writeln!(output, "{}", o.name.bold());
                    for (key, value) in o.link_properties() {
                        let value = value.as_str().map_or_else(|| value.to_string(), str::to_string);
                        let _ = writeln!(output, "   {key}: {value}");
                    }
                    if let Some(proxy_id) = &o.proxy_id {
                        let _ = writeln!(output, "   proxy_id: {proxy_id}");
                    }
                    let _ = writeln!(output, "   id: {}", o.id);
                }
                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, config: &ProgramConfig, result: &ValidationResult, warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Program is valid!", "✓".green());
                } else {
                    let _ = writeln!(output, "{} {} errors:", "✗".red(), result.error_count());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }
                if warnings && !result.warnings.is_empty() {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                let _ = writeln!(output, "\nProgram summary:");
                let _ = writeln!(output, "   Program: {}", config.program.name);
                let _ = writeln!(output, "   Stage: {}", config.program.stage);
                let _ = writeln!(output, "   Databases: {}", config.database_count());
                let _ = writeln!(output, "   Extra resources: {}", config.resources.len());
                output
            }
        }
    }

    /// Formats the recorded state.
    #[must_use]
    pub fn format_state(&self, snapshot: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => {
                let map: serde_json::Map<String, serde_json::Value> = snapshot
                    .iter()
                    .map(|(name, entry)| {
                        let value = match entry {
                            StateEntry::Present(state) => serde_json::to_value(state).unwrap_or_default(),
                            StateEntry::Corrupt { message } => serde_json::json!({ "corrupt": message }),
                        };
                        (name.clone(), value)
                    })
                    .collect();
                serde_json::to_string_pretty(&map).unwrap_or_default()
            }
            OutputFormat::Text => {
                if snapshot.is_empty() {
                    return String::from("No state found.\n");
                }
                let rows: Vec<StateRow> = snapshot
                    .iter()
                    .map(|(name, entry)| match entry {
                        StateEntry::Present(state) => StateRow {
                            name: name.clone(),
                            resource_type: state.resource_type.clone(),
                            id: state.external_id.clone(),
                            hash: state.inputs_hash.chars().take(8).collect(),
                            updated: state.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        },
                        StateEntry::Corrupt { message } => StateRow {
                            name: name.clone(),
                            resource_type: "unreadable".red().to_string(),
                            id: String::new(),
                            hash: String::new(),
                            updated: Self::truncate(message, 40),
                        },
                    })
                    .collect();
                format!("{}\n\n{} resources\n", Table::new(rows), snapshot.len())
            }
        }
    }

    /// Formats one recorded resource, masking sensitive inputs.
    #[must_use]
    pub fn format_resource(&self, state: &ResourceState) -> String {
        let mut state = state.clone();
        mask_sensitive(&mut state.inputs);
        mask_sensitive(&mut state.resolved_inputs);
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "{} ({})", state.logical_name.bold(), state.resource_type);
                let _ = writeln!(output, "   ID: {}", state.external_id);
                let _ = writeln!(output, "   Created: {}", state.created_at);
                let _ = writeln!(output, "   Updated: {}", state.updated_at);
                if !state.dependencies.is_empty() {
                    let _ = writeln!(output, "   Depends on: {}", state.dependencies.join(", "));
                }
                let _ = writeln!(
                    output,
                    "   Inputs:\n{}",
                    serde_json::to_string_pretty(&state.inputs).unwrap_or_default()
                );
                let _ = writeln!(
                    output,
                    "   Outputs:\n{}",
                    serde_json::to_string_pretty(&state.outputs).unwrap_or_default()
                );
                output
            }
        }
    }

    fn format_action(action: Action) -> String {
        match action {
            Action::Create => "+create".green().to_string(),
            Action::Update => "~update".yellow().to_string(),
            Action::Replace => "±replace".magenta().to_string(),
            Action::Delete => "-delete".red().to_string(),
            Action::NoOp => "no-op".dimmed().to_string(),
        }
    }

    fn format_status(status: NodeStatus) -> String {
        match status {
            NodeStatus::Succeeded => "succeeded".green().to_string(),
            NodeStatus::Unchanged => "unchanged".dimmed().to_string(),
            NodeStatus::Failed => "failed".red().to_string(),
            NodeStatus::Skipped | NodeStatus::Cancelled => status.to_string().yellow().to_string(),
            NodeStatus::Partial => "partial".magenta().to_string(),
        }
    }

    fn format_value(value: Option<&serde_json::Value>) -> String {
        value.map_or_else(|| String::from("(none)"), |v| Self::truncate(&v.to_string(), 60))
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{cut}...")
        }
    }
}

/// Replaces values of password-like keys with a mask, recursively.
fn mask_sensitive(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if matches!(key.as_str(), "password" | "secretString" | "result" | "token") {
                    *item = serde_json::Value::String(MASK.to_string());
                } else {
                    mask_sensitive(item);
                }
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(mask_sensitive),
        _ => {}
    }
}

//! Plan types.
//!
//! A [`Plan`] holds one [`ResourcePlan`] per logical resource: every node of
//! the graph in topological order, followed by deletes of resources that
//! are only present in state.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Placeholder shown instead of sensitive values.
pub const SENSITIVE_PLACEHOLDER: &str = "(sensitive)";

/// Per-resource decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Inputs unchanged.
    NoOp,
    /// Not in state.
    Create,
    /// Changed fields are all mutable in place.
    Update,
    /// An identity-defining field changed.
    Replace,
    /// In state, absent from the graph.
    Delete,
}

/// Order of the two sub-operations of a replace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacePolicy {
    /// Create the new resource, then delete the old one.
    #[default]
    CreateBeforeDelete,
    /// Delete the old resource, then create the new one.
    DeleteBeforeCreate,
}

/// A single field-level change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    /// Top-level input field.
    pub field: String,
    /// Previous declared value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    /// New declared value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    /// Whether changing this field forces replacement.
    pub forces_replacement: bool,
    /// Whether the change comes from a replaced dependency.
    pub cascaded: bool,
}

/// The decision for one logical resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourcePlan {
    /// Logical name.
    pub name: String,
    /// Resource type.
    pub resource_type: String,
    /// Decision.
    pub action: Action,
    /// Ordering for a replace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace_policy: Option<ReplacePolicy>,
    /// Field-level changes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<FieldChange>,
    /// Human-readable reason.
    pub reason: String,
    /// The stored baseline could not be read.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub corrupt_baseline: bool,
    /// Current provider id, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Graph dependencies, or stored dependencies for a delete.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Dependencies recorded at the previous apply.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stored_dependencies: Vec<String>,
}

/// A complete plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Plan {
    /// Entries in execution order.
    pub entries: Vec<ResourcePlan>,
}

impl Action {
    /// Returns true if the action calls the provider.
    #[must_use]
    pub const fn is_actionable(self) -> bool {
        !matches!(self, Self::NoOp)
    }
}

impl FieldChange {
    /// Creates a change, masking values when `sensitive`.
    #[must_use]
    pub fn new(
        field: &str,
        old_value: Option<&Value>,
        new_value: Option<&Value>,
        sensitive: bool,
    ) -> Self {
        let mask = |v: Option<&Value>| {
            v.map(|v| {
                if sensitive {
                    Value::String(SENSITIVE_PLACEHOLDER.to_string())
                } else {
                    v.clone()
                }
            })
        };
        Self {
            field: field.to_string(),
            old_value: mask(old_value),
            new_value: mask(new_value),
            forces_replacement: false,
            cascaded: false,
        }
    }

    /// Marks the change as identity-defining.
    #[must_use]
    pub const fn forcing(mut self, forces: bool) -> Self {
        self.forces_replacement = forces;
        self
    }

    /// Marks the change as coming from a replaced dependency.
    #[must_use]
    pub const fn cascading(mut self) -> Self {
        self.cascaded = true;
        self
    }
}

impl ResourcePlan {
    /// Creates an entry with no changes.
    #[must_use]
    pub fn new(name: &str, resource_type: &str, action: Action, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            action,
            replace_policy: None,
            changes: Vec::new(),
            reason: reason.into(),
            corrupt_baseline: false,
            external_id: None,
            dependencies: Vec::new(),
            stored_dependencies: Vec::new(),
        }
    }

    /// Returns a one-line description.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action {
            Action::NoOp => format!("No change for '{}'", self.name),
            Action::Create => format!("Create {} '{}'", self.resource_type, self.name),
            Action::Update => format!("Update {} '{}' in place", self.resource_type, self.name),
            Action::Replace => format!(
                "Replace {} '{}' ({})",
                self.resource_type,
                self.name,
                self.replace_policy.unwrap_or_default()
            ),
            Action::Delete => format!("Delete {} '{}'", self.resource_type, self.name),
        }
    }
}

impl Plan {
    /// Gets the entry for a logical name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourcePlan> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Counts entries with the given action.
    #[must_use]
    pub fn count(&self, action: Action) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }

    /// Returns true if any entry calls the provider.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(|e| e.action.is_actionable())
    }

    /// Entries that call the provider.
    #[must_use]
    pub fn actionable(&self) -> Vec<&ResourcePlan> {
        self.entries.iter().filter(|e| e.action.is_actionable()).collect()
    }

    /// Names of entries planned without a readable baseline.
    #[must_use]
    pub fn corrupt_baselines(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.corrupt_baseline)
            .map(|e| e.name.as_str())
            .collect()
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoOp => "no-op",
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ReplacePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CreateBeforeDelete => "create-before-delete",
            Self::DeleteBeforeCreate => "delete-before-create",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourcePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())?;
        if !self.changes.is_empty() {
            let fields: Vec<&str> = self.changes.iter().map(|c| c.field.as_str()).collect();
            write!(f, " [{}]", fields.join(", "))?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let actionable = self.actionable();
        if actionable.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan ({} changes):", actionable.len())?;
        for (i, entry) in actionable.iter().enumerate() {
            writeln!(f, "  {}. {entry}", i + 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sensitive_values_are_masked() {
        let change = FieldChange::new("password", Some(&json!("old")), Some(&json!("new")), true);
        assert_eq!(change.old_value, Some(json!(SENSITIVE_PLACEHOLDER)));
        assert_eq!(change.new_value, Some(json!(SENSITIVE_PLACEHOLDER)));

        let change = FieldChange::new("port", None, Some(&json!(3306)), false);
        assert_eq!(change.new_value, Some(json!(3306)));
    }

    #[test]
    fn test_plan_counts() {
        let plan = Plan {
            entries: vec![
                ResourcePlan::new("A", "t", Action::Create, "new"),
                ResourcePlan::new("B", "t", Action::NoOp, "unchanged"),
                ResourcePlan::new("C", "t", Action::Delete, "removed"),
            ],
        };
        assert_eq!(plan.count(Action::Create), 1);
        assert_eq!(plan.actionable().len(), 2);
        assert!(plan.has_changes());
        assert!(plan.to_string().starts_with("Plan (2 changes):"));
    }

    #[test]
    fn test_policy_serde_names() {
        let policy: ReplacePolicy = serde_json::from_value(json!("delete_before_create")).expect("parse");
        assert_eq!(policy, ReplacePolicy::DeleteBeforeCreate);
        assert_eq!(ReplacePolicy::default(), ReplacePolicy::CreateBeforeDelete);
        assert_eq!(Action::NoOp.to_string(), "no-op");
    }
}

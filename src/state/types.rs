//! State types for tracking applied resources.
//!
//! A [`ResourceState`] is the durable record the executor writes after a
//! provider call succeeds. A [`StateSnapshot`] is the view the diff engine
//! plans against; entries that failed to parse are kept as
//! [`StateEntry::Corrupt`] so that only the affected resource loses its
//! baseline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::resource::Outputs;

/// Current version of the state entry format.
pub const STATE_VERSION: &str = "1.0";

/// Last-applied record for a single logical resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceState {
    /// State format version.
    pub version: String,
    /// Logical name (unique key).
    pub logical_name: String,
    /// Resource type, e.g. `aws:rds:Instance`.
    pub resource_type: String,
    /// Identifier assigned by the provider.
    pub external_id: String,
    /// Declared inputs as submitted, references unresolved.
    pub inputs: Value,
    /// SHA-256 of the canonical declared inputs.
    pub inputs_hash: String,
    /// Inputs actually sent to the provider.
    #[serde(default)]
    pub resolved_inputs: Value,
    /// Outputs returned by the provider.
    #[serde(default)]
    pub outputs: Outputs,
    /// Dependencies at apply time, used to order deletes.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// When the resource was first created.
    pub created_at: DateTime<Utc>,
    /// When the entry was last written.
    pub updated_at: DateTime<Utc>,
}

/// A stored entry as seen by a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum StateEntry {
    /// Entry parsed successfully.
    Present(ResourceState),
    /// Entry exists but could not be read or parsed.
    Corrupt {
        /// What went wrong.
        message: String,
    },
}

/// All stored entries keyed by logical name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    entries: BTreeMap<String, StateEntry>,
}

impl ResourceState {
    /// Creates a new record for a freshly created resource.
    #[must_use]
    pub fn new(
        logical_name: &str,
        resource_type: &str,
        external_id: &str,
        inputs: Value,
        inputs_hash: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION.to_string(),
            logical_name: logical_name.to_string(),
            resource_type: resource_type.to_string(),
            external_id: external_id.to_string(),
            inputs,
            inputs_hash: inputs_hash.to_string(),
            resolved_inputs: Value::Null,
            outputs: Outputs::new(),
            dependencies: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the resolved inputs.
    #[must_use]
    pub fn with_resolved_inputs(mut self, resolved: Value) -> Self {
        self.resolved_inputs = resolved;
        self
    }

    /// Sets the provider outputs.
    #[must_use]
    pub fn with_outputs(mut self, outputs: Outputs) -> Self {
        self.outputs = outputs;
        self
    }

    /// Sets the dependency list.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Records an in-place update.
    pub fn record_update(&mut self, inputs: Value, inputs_hash: &str, resolved: Value, outputs: Outputs) {
        self.inputs = inputs;
        self.inputs_hash = inputs_hash.to_string();
        self.resolved_inputs = resolved;
        self.outputs = outputs;
        self.updated_at = Utc::now();
    }

    /// Looks up an output, treating `id` as the external identifier.
    #[must_use]
    pub fn output(&self, key: &str) -> Option<Value> {
        if key == "id" {
            return Some(Value::String(self.external_id.clone()));
        }
        self.outputs.get(key).cloned()
    }
}

impl StateSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a parsed entry.
    pub fn insert(&mut self, state: ResourceState) {
        self.entries
            .insert(state.logical_name.clone(), StateEntry::Present(state));
    }

    /// Inserts an entry that could not be parsed.
    pub fn insert_corrupt(&mut self, name: &str, message: impl Into<String>) {
        self.entries.insert(
            name.to_string(),
            StateEntry::Corrupt {
                message: message.into(),
            },
        );
    }

    /// Removes an entry.
    pub fn remove(&mut self, name: &str) -> Option<StateEntry> {
        self.entries.remove(name)
    }

    /// Gets the raw entry for a name.
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&StateEntry> {
        self.entries.get(name)
    }

    /// Gets a parsed entry for a name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceState> {
        match self.entries.get(name) {
            Some(StateEntry::Present(state)) => Some(state),
            _ => None,
        }
    }

    /// Returns true if the entry for `name` is corrupt.
    #[must_use]
    pub fn is_corrupt(&self, name: &str) -> bool {
        matches!(self.entries.get(name), Some(StateEntry::Corrupt { .. }))
    }

    /// Iterates over entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &StateEntry)> {
        self.entries.iter()
    }

    /// Iterates over parsed entries in name order.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceState> {
        self.entries.values().filter_map(|entry| match entry {
            StateEntry::Present(state) => Some(state),
            StateEntry::Corrupt { .. } => None,
        })
    }

    /// Returns all stored names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<ResourceState> for StateSnapshot {
    fn from_iter<T: IntoIterator<Item = ResourceState>>(iter: T) -> Self {
        let mut snapshot = Self::new();
        for state in iter {
            snapshot.insert(state);
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_id_is_external_id() {
        let mut outputs = Outputs::new();
        outputs.insert("endpoint".into(), json!("db.example:3306"));
        let state = ResourceState::new("DbInstance", "aws:rds:Instance", "db-1", json!({}), "h")
            .with_outputs(outputs);

        assert_eq!(state.output("id"), Some(json!("db-1")));
        assert_eq!(state.output("endpoint"), Some(json!("db.example:3306")));
        assert_eq!(state.output("missing"), None);
    }

    #[test]
    fn test_snapshot_corrupt_entries() {
        let mut snapshot = StateSnapshot::new();
        snapshot.insert(ResourceState::new("A", "t", "a-1", json!({}), "h"));
        snapshot.insert_corrupt("B", "expected value at line 1");

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.resource("A").is_some());
        assert!(snapshot.resource("B").is_none());
        assert!(snapshot.is_corrupt("B"));
        assert_eq!(snapshot.resources().count(), 1);
        assert_eq!(snapshot.names(), vec!["A", "B"]);
    }
}

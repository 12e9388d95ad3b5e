//! Diff engine for comparing desired declarations against stored state.
//!
//! The engine is a pure function of (graph, snapshot): the same inputs
//! always yield the same [`Plan`].

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::config::ConfigHasher;
use crate::state::{ResourceState, StateEntry, StateSnapshot};

use super::graph::{GraphNode, ResourceGraph};
use super::plan::{Action, FieldChange, Plan, ResourcePlan};
use super::schema::SchemaRegistry;

/// Engine for computing plans.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Input hasher.
    hasher: ConfigHasher,
    /// Type schemas and default policy.
    schemas: SchemaRegistry,
}

impl DiffEngine {
    /// Creates a diff engine with the built-in schemas.
    #[must_use]
    pub fn new() -> Self {
        Self::with_schemas(SchemaRegistry::builtin())
    }

    /// Creates a diff engine with a custom registry.
    #[must_use]
    pub const fn with_schemas(schemas: SchemaRegistry) -> Self {
        Self {
            hasher: ConfigHasher::new(),
            schemas,
        }
    }

    /// Returns the schema registry.
    #[must_use]
    pub const fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Computes the plan for `graph` against `snapshot`.
    #[must_use]
    pub fn compute(&self, graph: &ResourceGraph, snapshot: &StateSnapshot) -> Plan {
        let mut entries = Vec::with_capacity(graph.len());
        let mut planned: HashMap<String, Action> = HashMap::new();

        for node in graph.nodes() {
            let entry = match snapshot.entry(&node.spec.name) {
                None => self.plan_create(node, None),
                Some(StateEntry::Corrupt { message }) => self.plan_create(node, Some(message)),
                Some(StateEntry::Present(state)) => self.plan_existing(node, state, &planned),
            };
            debug!("{}: {}", entry.name, entry.action);
            planned.insert(entry.name.clone(), entry.action);
            entries.push(entry);
        }

        entries.extend(Self::plan_deletes(graph, snapshot));

        Plan { entries }
    }

    fn plan_create(&self, node: &GraphNode, corrupt: Option<&String>) -> ResourcePlan {
        let spec = &node.spec;
        let reason = corrupt.map_or_else(
            || String::from("not in state"),
            |message| format!("state entry unreadable ({message}); no baseline"),
        );

        let mut entry = ResourcePlan::new(&spec.name, &spec.resource_type, Action::Create, reason);
        entry.corrupt_baseline = corrupt.is_some();
        entry.dependencies.clone_from(&node.dependencies);
        entry.changes = fields_of(&spec.inputs)
            .into_iter()
            .map(|(field, value)| {
                FieldChange::new(
                    &field,
                    None,
                    Some(&value),
                    self.schemas.is_sensitive(&spec.resource_type, &field),
                )
            })
            .collect();
        entry
    }

    fn plan_existing(
        &self,
        node: &GraphNode,
        state: &ResourceState,
        planned: &HashMap<String, Action>,
    ) -> ResourcePlan {
        let spec = &node.spec;
        let mut entry = ResourcePlan::new(&spec.name, &spec.resource_type, Action::NoOp, "unchanged");
        entry.external_id = Some(state.external_id.clone());
        entry.dependencies.clone_from(&node.dependencies);
        entry.stored_dependencies.clone_from(&state.dependencies);

        if state.resource_type != spec.resource_type {
            entry.action = Action::Replace;
            entry.replace_policy = Some(self.schemas.policy_for(spec));
            entry.reason = format!("type changed from {}", state.resource_type);
            entry.changes.push(
                FieldChange::new(
                    "type",
                    Some(&Value::String(state.resource_type.clone())),
                    Some(&Value::String(spec.resource_type.clone())),
                    false,
                )
                .forcing(true),
            );
            return entry;
        }

        let sensitive = |field: &str| self.schemas.is_sensitive(&spec.resource_type, field);
        let mut changes = Vec::new();

        let new_hash = self.hasher.hash_inputs(&spec.inputs);
        if !ConfigHasher::hashes_match(&new_hash, &state.inputs_hash) || state.inputs != spec.inputs {
            let old_fields = fields_of(&state.inputs);
            let new_fields = fields_of(&spec.inputs);
            let keys: BTreeSet<&String> = old_fields.keys().chain(new_fields.keys()).collect();
            for key in keys {
                let old = old_fields.get(key);
                let new = new_fields.get(key);
                if old != new {
                    changes.push(
                        FieldChange::new(key, old, new, sensitive(key))
                            .forcing(self.schemas.forces_replacement(spec, key)),
                    );
                }
            }
        }

        // Fields pointing at a dependency that gets a new identity change too.
        let renewed: BTreeSet<&str> = node
            .dependencies
            .iter()
            .filter(|d| matches!(planned.get(d.as_str()), Some(Action::Replace | Action::Create)))
            .map(String::as_str)
            .collect();
        if !renewed.is_empty() {
            let fields = spec.referencing_fields().unwrap_or_default();
            let new_fields = fields_of(&spec.inputs);
            for (field, targets) in fields {
                if changes.iter().any(|c: &FieldChange| c.field == field) {
                    continue;
                }
                if targets.iter().any(|t| renewed.contains(t.as_str())) {
                    let value = new_fields.get(&field);
                    changes.push(
                        FieldChange::new(&field, value, value, sensitive(&field))
                            .forcing(self.schemas.forces_replacement(spec, &field))
                            .cascading(),
                    );
                }
            }
        }

        if changes.is_empty() {
            return entry;
        }

        let forced: Vec<&str> = changes
            .iter()
            .filter(|c| c.forces_replacement)
            .map(|c| c.field.as_str())
            .collect();

        if forced.is_empty() {
            entry.action = Action::Update;
            entry.reason = format!("{} field(s) changed in place", changes.len());
        } else {
            entry.action = Action::Replace;
            entry.replace_policy = Some(self.schemas.policy_for(spec));
            entry.reason = format!("{} forces replacement", forced.join(", "));
        }
        entry.changes = changes;
        entry
    }

    /// Deletes for stored entries absent from the graph, dependents first.
    fn plan_deletes(graph: &ResourceGraph, snapshot: &StateSnapshot) -> Vec<ResourcePlan> {
        let removed: BTreeMap<&str, &StateEntry> = snapshot
            .iter()
            .filter(|(name, _)| !graph.contains(name))
            .map(|(name, entry)| (name.as_str(), entry))
            .collect();

        let deps_of: BTreeMap<&str, Vec<&str>> = removed
            .iter()
            .map(|(name, entry)| {
                let deps = match entry {
                    StateEntry::Present(state) => state
                        .dependencies
                        .iter()
                        .map(String::as_str)
                        .filter(|d| removed.contains_key(d))
                        .collect(),
                    StateEntry::Corrupt { .. } => Vec::new(),
                };
                (*name, deps)
            })
            .collect();

        let mut users: BTreeMap<&str, usize> = removed.keys().map(|n| (*n, 0)).collect();
        for deps in deps_of.values() {
            for dep in deps {
                if let Some(count) = users.get_mut(dep) {
                    *count += 1;
                }
            }
        }

        let mut ready: BTreeSet<&str> = users.iter().filter(|(_, c)| **c == 0).map(|(n, _)| *n).collect();
        let mut order: Vec<&str> = Vec::with_capacity(removed.len());
        while let Some(name) = ready.pop_first() {
            order.push(name);
            for dep in deps_of.get(name).into_iter().flatten() {
                if let Some(count) = users.get_mut(dep) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dep);
                    }
                }
            }
        }
        for name in removed.keys() {
            if !order.contains(name) {
                order.push(*name);
            }
        }

        order
            .into_iter()
            .map(|name| match removed[name] {
                StateEntry::Present(state) => {
                    let mut entry = ResourcePlan::new(
                        name,
                        &state.resource_type,
                        Action::Delete,
                        "removed from program",
                    );
                    entry.external_id = Some(state.external_id.clone());
                    entry.dependencies.clone_from(&state.dependencies);
                    entry.stored_dependencies.clone_from(&state.dependencies);
                    entry
                }
                StateEntry::Corrupt { message } => {
                    let mut entry = ResourcePlan::new(
                        name,
                        "unknown",
                        Action::Delete,
                        format!("removed from program; state entry unreadable ({message})"),
                    );
                    entry.corrupt_baseline = true;
                    entry
                }
            })
            .collect()
    }
}

/// Top-level fields of an inputs value; non-objects become a single field.
fn fields_of(inputs: &Value) -> BTreeMap<String, Value> {
    match inputs {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Value::Null => BTreeMap::new(),
        other => BTreeMap::from([(String::from("inputs"), other.clone())]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ReplacePolicy;
    use crate::resource::ResourceSpec;
    use serde_json::json;

    fn applied(spec: &ResourceSpec, deps: &[&str]) -> ResourceState {
        ResourceState::new(
            &spec.name,
            &spec.resource_type,
            &format!("{}-id", spec.name),
            spec.inputs.clone(),
            &ConfigHasher::new().hash_inputs(&spec.inputs),
        )
        .with_dependencies(deps.iter().map(|d| (*d).to_string()).collect())
    }

    fn instance(inputs: Value) -> ResourceSpec {
        ResourceSpec::new("Db", "aws:rds:Instance", inputs)
    }

    #[test]
    fn test_absent_is_create_and_present_unchanged_is_noop() {
        let spec = instance(json!({"engine": "mysql", "instanceClass": "db.t4g.micro"}));
        let graph = ResourceGraph::build(vec![spec.clone()]).expect("graph");
        let engine = DiffEngine::new();

        let plan = engine.compute(&graph, &StateSnapshot::new());
        assert_eq!(plan.get("Db").expect("entry").action, Action::Create);

        let snapshot: StateSnapshot = [applied(&spec, &[])].into_iter().collect();
        let plan = engine.compute(&graph, &snapshot);
        assert_eq!(plan.get("Db").expect("entry").action, Action::NoOp);
        assert!(!plan.has_changes());
    }

    #[test]
    fn test_mutable_change_is_update() {
        let old = instance(json!({"engine": "mysql", "instanceClass": "db.t4g.micro"}));
        let new = instance(json!({"engine": "mysql", "instanceClass": "db.r6g.large"}));
        let graph = ResourceGraph::build(vec![new]).expect("graph");
        let snapshot: StateSnapshot = [applied(&old, &[])].into_iter().collect();

        let plan = DiffEngine::new().compute(&graph, &snapshot);
        let entry = plan.get("Db").expect("entry");
        assert_eq!(entry.action, Action::Update);
        assert_eq!(entry.changes.len(), 1);
        assert_eq!(entry.changes[0].field, "instanceClass");
    }

    #[test]
    fn test_identity_change_is_replace_with_type_policy() {
        let old = instance(json!({"engine": "mysql", "dbName": "app"}));
        let new = instance(json!({"engine": "mysql", "dbName": "app_v2"}));
        let graph = ResourceGraph::build(vec![new]).expect("graph");
        let snapshot: StateSnapshot = [applied(&old, &[])].into_iter().collect();

        let entry = DiffEngine::new().compute(&graph, &snapshot).entries.remove(0);
        assert_eq!(entry.action, Action::Replace);
        assert_eq!(entry.replace_policy, Some(ReplacePolicy::DeleteBeforeCreate));
    }

    #[test]
    fn test_sensitive_change_is_masked() {
        let old = instance(json!({"password": "hunter2"}));
        let new = instance(json!({"password": "correct-horse"}));
        let graph = ResourceGraph::build(vec![new]).expect("graph");
        let snapshot: StateSnapshot = [applied(&old, &[])].into_iter().collect();

        let plan = DiffEngine::new().compute(&graph, &snapshot);
        let change = &plan.get("Db").expect("entry").changes[0];
        assert_eq!(change.old_value, Some(json!("(sensitive)")));
        assert_eq!(change.new_value, Some(json!("(sensitive)")));
    }

    #[test]
    fn test_replaced_dependency_cascades_to_referencing_field() {
        let old_db = instance(json!({"engine": "mysql", "dbName": "app"}));
        let new_db = instance(json!({"engine": "mysql", "dbName": "other"}));
        let target = ResourceSpec::new(
            "Target",
            "aws:rds:ProxyTarget",
            json!({"dbProxyName": "proxy", "dbInstanceIdentifier": "${Db.identifier}"}),
        );

        let graph = ResourceGraph::build(vec![new_db, target.clone()]).expect("graph");
        let snapshot: StateSnapshot = [applied(&old_db, &[]), applied(&target, &["Db"])]
            .into_iter()
            .collect();

        let plan = DiffEngine::new().compute(&graph, &snapshot);
        let entry = plan.get("Target").expect("entry");
        assert_eq!(entry.action, Action::Replace);
        assert!(entry.changes[0].cascaded);
        assert_eq!(entry.changes[0].field, "dbInstanceIdentifier");
    }

    #[test]
    fn test_corrupt_entry_is_create_with_flag() {
        let spec = instance(json!({"engine": "mysql"}));
        let graph = ResourceGraph::build(vec![spec]).expect("graph");
        let mut snapshot = StateSnapshot::new();
        snapshot.insert_corrupt("Db", "EOF while parsing");

        let plan = DiffEngine::new().compute(&graph, &snapshot);
        let entry = plan.get("Db").expect("entry");
        assert_eq!(entry.action, Action::Create);
        assert!(entry.corrupt_baseline);
        assert_eq!(plan.corrupt_baselines(), vec!["Db"]);
    }

    #[test]
    fn test_deletes_are_ordered_dependents_first() {
        let group = ResourceSpec::new("Group", "aws:rds:SubnetGroup", json!({}));
        let db = instance(json!({}));
        let target = ResourceSpec::new("Target", "aws:rds:ProxyTarget", json!({}));
        let snapshot: StateSnapshot = [
            applied(&group, &[]),
            applied(&db, &["Group"]),
            applied(&target, &["Db"]),
        ]
        .into_iter()
        .collect();

        let graph = ResourceGraph::build(vec![]).expect("graph");
        let plan = DiffEngine::new().compute(&graph, &snapshot);
        let names: Vec<&str> = plan.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Target", "Db", "Group"]);
        assert!(plan.entries.iter().all(|e| e.action == Action::Delete));
    }

    #[test]
    fn test_diff_is_deterministic() {
        let specs = vec![
            ResourceSpec::new("A", "aws:rds:SubnetGroup", json!({"name": "a"})),
            ResourceSpec::new("B", "aws:rds:Instance", json!({"group": "${A.id}"})),
        ];
        let graph = ResourceGraph::build(specs.clone()).expect("graph");
        let snapshot: StateSnapshot = [applied(&specs[0], &[])].into_iter().collect();
        let engine = DiffEngine::new();

        assert_eq!(engine.compute(&graph, &snapshot), engine.compute(&graph, &snapshot));
    }
}

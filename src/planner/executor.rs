//! Plan executor.
//!
//! Walks the plan in dependency order and runs ready nodes concurrently on a
//! [`JoinSet`], bounded by a [`Semaphore`]. Each node resolves references
//! from its dependencies' outputs, calls the provider, and durably saves the
//! result before any dependent is released. Failures stay local to the node:
//! its dependents are skipped and independent branches keep going.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConfigHasher;
use crate::error::ProviderError;
use crate::provider::Provider;
use crate::resource::{Outputs, ResourceSpec, resolve_inputs};
use crate::state::{ResourceState, StateSnapshot, StateStore};

use super::graph::ResourceGraph;
use super::plan::{Action, Plan, ReplacePolicy, ResourcePlan};

/// Default number of nodes running at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Terminal status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Nothing to do.
    Unchanged,
    /// Provider call(s) and state write succeeded.
    Succeeded,
    /// The node failed; nothing was committed by this run.
    Failed,
    /// Not attempted because a prerequisite did not succeed.
    Skipped,
    /// First sub-operation of a replace committed, second failed.
    Partial,
    /// Not started before cancellation.
    Cancelled,
}

/// Outcome of a single plan entry.
#[derive(Debug, Clone, Serialize)]
pub struct NodeOutcome {
    /// Logical name.
    pub name: String,
    /// Resource type.
    pub resource_type: String,
    /// Planned action.
    pub action: Action,
    /// Terminal status.
    pub status: NodeStatus,
    /// Failure or skip reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Provider id after the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// When work on the node started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the node reached its terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether a live resource backs the node after the run.
    #[serde(skip)]
    resource_present: bool,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    /// Every actionable node succeeded.
    Success,
    /// Some nodes did not succeed.
    Partial,
    /// Every actionable node failed.
    Failed,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Overall status.
    pub status: RunStatus,
    /// One outcome per plan entry, in plan order.
    pub outcomes: Vec<NodeOutcome>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
}

/// Id and outputs of a resource, as seen by its dependents.
#[derive(Debug, Clone, Default)]
struct Resolved {
    external_id: String,
    outputs: Outputs,
}

/// Everything a node task needs, owned.
struct NodeJob {
    entry: ResourcePlan,
    spec: Option<ResourceSpec>,
    previous: Option<ResourceState>,
    upstream: HashMap<String, Resolved>,
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    hasher: Arc<ConfigHasher>,
}

/// Executor for plans.
pub struct PlanExecutor {
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    hasher: Arc<ConfigHasher>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.name())
            .field("store", &self.store.backend_type())
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl NodeStatus {
    /// Whether dependents may proceed.
    const fn releases_dependents(self, resource_present: bool) -> bool {
        match self {
            Self::Unchanged | Self::Succeeded => true,
            Self::Partial => resource_present,
            Self::Failed | Self::Skipped | Self::Cancelled => false,
        }
    }
}

impl NodeOutcome {
    fn new(entry: &ResourcePlan, status: NodeStatus) -> Self {
        Self {
            name: entry.name.clone(),
            resource_type: entry.resource_type.clone(),
            action: entry.action,
            status,
            message: None,
            external_id: entry.external_id.clone(),
            started_at: None,
            finished_at: None,
            resource_present: entry.external_id.is_some(),
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl PlanExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, store: Arc<dyn StateStore>) -> Self {
        Self {
            provider,
            store,
            hasher: Arc::new(ConfigHasher::new()),
            concurrency: DEFAULT_CONCURRENCY,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the concurrency limit (at least 1).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Uses `token` to stop scheduling new nodes.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Executes `plan`.
    ///
    /// `graph` supplies the declarations and `snapshot` the state the plan
    /// was computed against. Node failures are reported in the returned
    /// [`RunReport`]; this never fails as a whole.
    pub async fn execute(&self, graph: &ResourceGraph, plan: &Plan, snapshot: &StateSnapshot) -> RunReport {
        let started_at = Utc::now();
        let entries = &plan.entries;
        info!(
            "Executing plan: {} entries, {} actionable, concurrency {}",
            entries.len(),
            plan.actionable().len(),
            self.concurrency
        );

        let prerequisites = Self::prerequisites(entries);
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
        for (i, prereqs) in prerequisites.iter().enumerate() {
            for &p in prereqs {
                dependents[p].push(i);
            }
        }

        let mut waiting: Vec<usize> = prerequisites.iter().map(Vec::len).collect();
        let mut outcomes: Vec<Option<NodeOutcome>> = vec![None; entries.len()];
        let mut ready: BTreeSet<usize> = waiting
            .iter()
            .enumerate()
            .filter(|(_, w)| **w == 0)
            .map(|(i, _)| i)
            .collect();

        let mut resolved: HashMap<String, Resolved> = snapshot
            .resources()
            .map(|s| {
                (
                    s.logical_name.clone(),
                    Resolved {
                        external_id: s.external_id.clone(),
                        outputs: s.outputs.clone(),
                    },
                )
            })
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<(usize, NodeOutcome, Option<Resolved>)> = JoinSet::new();
        let mut running: HashMap<Id, usize> = HashMap::new();

        loop {
            while let Some(i) = ready.pop_first() {
                if self.cancel.is_cancelled() {
                    ready.insert(i);
                    break;
                }
                let entry = &entries[i];

                let blocked: Vec<&str> = prerequisites[i]
                    .iter()
                    .filter(|p| {
                        outcomes[**p]
                            .as_ref()
                            .is_none_or(|o| !o.status.releases_dependents(o.resource_present))
                    })
                    .map(|p| entries[*p].name.as_str())
                    .collect();

                let immediate = if !blocked.is_empty() {
                    warn!("Skipping {}: {} did not complete", entry.name, blocked.join(", "));
                    Some(
                        NodeOutcome::new(entry, NodeStatus::Skipped)
                            .with_message(format!("prerequisite {} did not complete", blocked.join(", "))),
                    )
                } else if entry.action == Action::NoOp {
                    Some(NodeOutcome::new(entry, NodeStatus::Unchanged))
                } else {
                    None
                };

                if let Some(outcome) = immediate {
                    outcomes[i] = Some(outcome);
                    Self::release(i, &dependents, &mut waiting, &mut ready);
                    continue;
                }

                let permit = tokio::select! {
                    permit = semaphore.clone().acquire_owned() => permit,
                    () = self.cancel.cancelled() => {
                        ready.insert(i);
                        break;
                    }
                };
                let Ok(permit) = permit else {
                    ready.insert(i);
                    break;
                };

                let job = NodeJob {
                    entry: entry.clone(),
                    spec: graph.get(&entry.name).cloned(),
                    previous: snapshot.resource(&entry.name).cloned(),
                    upstream: entry
                        .dependencies
                        .iter()
                        .filter_map(|d| resolved.get(d).map(|r| (d.clone(), r.clone())))
                        .collect(),
                    provider: Arc::clone(&self.provider),
                    store: Arc::clone(&self.store),
                    hasher: Arc::clone(&self.hasher),
                };

                debug!("Starting {} ({})", entry.name, entry.action);
                let handle = tasks.spawn(async move {
                    let _permit = permit;
                    let (outcome, output) = job.run().await;
                    (i, outcome, output)
                });
                running.insert(handle.id(), i);
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };

            match joined {
                Ok((id, (i, outcome, output))) => {
                    running.remove(&id);
                    if let Some(output) = output {
                        resolved.insert(entries[i].name.clone(), output);
                    } else if entries[i].action == Action::Delete || !outcome.resource_present {
                        resolved.remove(&entries[i].name);
                    }
                    outcomes[i] = Some(outcome);
                    Self::release(i, &dependents, &mut waiting, &mut ready);
                }
                Err(e) => {
                    let Some(i) = running.remove(&e.id()) else {
                        error!("Unknown node task aborted: {e}");
                        continue;
                    };
                    let entry = &entries[i];
                    error!("{} {} aborted: {e}", entry.action, entry.name);
                    outcomes[i] = Some(
                        NodeOutcome::new(entry, NodeStatus::Failed).with_message(format!("node task aborted: {e}")),
                    );
                    Self::release(i, &dependents, &mut waiting, &mut ready);
                }
            }
        }

        let cancelled = self.cancel.is_cancelled();
        let outcomes: Vec<NodeOutcome> = outcomes
            .into_iter()
            .zip(entries)
            .map(|(outcome, entry)| {
                outcome.unwrap_or_else(|| {
                    if cancelled {
                        NodeOutcome::new(entry, NodeStatus::Cancelled).with_message("run cancelled before start")
                    } else {
                        NodeOutcome::new(entry, NodeStatus::Skipped)
                            .with_message("ordering against other plan entries could not be satisfied")
                    }
                })
            })
            .collect();

        let report = RunReport {
            status: RunReport::status_of(&outcomes),
            outcomes,
            started_at,
            finished_at: Utc::now(),
        };
        info!("Run finished: {}", report.status);
        report
    }

    /// Scheduling prerequisites per entry, as plan indices.
    ///
    /// Graph nodes wait for their dependencies; a replaced node also waits
    /// for deletes of removed resources that used it. A delete waits for
    /// every entry whose previous apply used the deleted resource.
    fn prerequisites(entries: &[ResourcePlan]) -> Vec<Vec<usize>> {
        let index: HashMap<&str, usize> = entries.iter().enumerate().map(|(i, e)| (e.name.as_str(), i)).collect();

        entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let mut prereqs: BTreeSet<usize> = BTreeSet::new();
                if entry.action == Action::Delete {
                    for (j, other) in entries.iter().enumerate() {
                        if j != i && other.stored_dependencies.contains(&entry.name) {
                            prereqs.insert(j);
                        }
                    }
                } else {
                    prereqs.extend(entry.dependencies.iter().filter_map(|d| index.get(d.as_str()).copied()));
                    if entry.action == Action::Replace {
                        for (j, other) in entries.iter().enumerate() {
                            if other.action == Action::Delete && other.stored_dependencies.contains(&entry.name) {
                                prereqs.insert(j);
                            }
                        }
                    }
                }
                prereqs.into_iter().collect()
            })
            .collect()
    }

    fn release(i: usize, dependents: &[Vec<usize>], waiting: &mut [usize], ready: &mut BTreeSet<usize>) {
        for &d in &dependents[i] {
            waiting[d] -= 1;
            if waiting[d] == 0 {
                ready.insert(d);
            }
        }
    }
}

impl NodeJob {
    async fn run(self) -> (NodeOutcome, Option<Resolved>) {
        let started_at = Utc::now();
        let (mut outcome, output) = match self.entry.action {
            Action::NoOp => (NodeOutcome::new(&self.entry, NodeStatus::Unchanged), None),
            Action::Create => self.run_create().await,
            Action::Update => self.run_update().await,
            Action::Replace => self.run_replace().await,
            Action::Delete => self.run_delete().await,
        };
        outcome.started_at = Some(started_at);
        outcome.finished_at = Some(Utc::now());

        match outcome.status {
            NodeStatus::Failed => error!(
                "{} {} failed: {}",
                self.entry.action,
                self.entry.name,
                outcome.message.as_deref().unwrap_or("unknown error")
            ),
            NodeStatus::Partial => warn!(
                "{} {} partially applied: {}",
                self.entry.action,
                self.entry.name,
                outcome.message.as_deref().unwrap_or("")
            ),
            _ => info!("{} {} succeeded", self.entry.action, self.entry.name),
        }
        (outcome, output)
    }

    fn failed(&self, message: impl Into<String>) -> (NodeOutcome, Option<Resolved>) {
        (NodeOutcome::new(&self.entry, NodeStatus::Failed).with_message(message), None)
    }

    fn spec(&self) -> Result<&ResourceSpec, String> {
        self.spec
            .as_ref()
            .ok_or_else(|| format!("no declaration for {}", self.entry.name))
    }

    /// Substitutes dependency outputs into the declared inputs.
    fn resolve(&self, spec: &ResourceSpec) -> Result<Value, String> {
        let lookup = |r: &crate::resource::Reference| {
            let upstream = self.upstream.get(&r.resource)?;
            if r.output == "id" {
                return Some(Value::String(upstream.external_id.clone()));
            }
            upstream.outputs.get(&r.output).cloned()
        };
        resolve_inputs(&spec.name, &spec.inputs, &lookup).map_err(|e| e.to_string())
    }

    /// Creates the resource and saves its state.
    async fn create_and_save(&self, spec: &ResourceSpec, resolved: Value) -> Result<ResourceState, String> {
        info!("Creating {} {}", spec.resource_type, spec.name);
        let created = self
            .provider
            .create(&spec.resource_type, &spec.name, &resolved)
            .await
            .map_err(|e| e.to_string())?;

        let hash = self.hasher.hash_inputs(&spec.inputs);
        let mut state = ResourceState::new(&spec.name, &spec.resource_type, &created.id, spec.inputs.clone(), &hash)
            .with_resolved_inputs(resolved)
            .with_outputs(created.outputs)
            .with_dependencies(self.entry.dependencies.clone());
        if let Some(previous) = &self.previous {
            if previous.external_id == created.id {
                state.created_at = previous.created_at;
            }
        }

        self.store
            .save(&spec.name, &state)
            .await
            .map_err(|e| format!("created {} but failed to record it: {e}", created.id))?;
        Ok(state)
    }

    /// Deletes a resource; a resource that is already gone counts as deleted.
    async fn delete_remote(&self, resource_type: &str, id: &str) -> Result<(), ProviderError> {
        info!("Deleting {resource_type} {id} ({})", self.entry.name);
        match self.provider.delete(resource_type, id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("{id} already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn succeeded(&self, state: &ResourceState) -> (NodeOutcome, Option<Resolved>) {
        let mut outcome = NodeOutcome::new(&self.entry, NodeStatus::Succeeded);
        outcome.external_id = Some(state.external_id.clone());
        outcome.resource_present = true;
        (
            outcome,
            Some(Resolved {
                external_id: state.external_id.clone(),
                outputs: state.outputs.clone(),
            }),
        )
    }

    async fn run_create(&self) -> (NodeOutcome, Option<Resolved>) {
        let spec = match self.spec() {
            Ok(spec) => spec,
            Err(e) => return self.failed(e),
        };
        let resolved = match self.resolve(spec) {
            Ok(resolved) => resolved,
            Err(e) => return self.failed(e),
        };
        match self.create_and_save(spec, resolved).await {
            Ok(state) => self.succeeded(&state),
            Err(e) => self.failed(e),
        }
    }

    async fn run_update(&self) -> (NodeOutcome, Option<Resolved>) {
        let spec = match self.spec() {
            Ok(spec) => spec,
            Err(e) => return self.failed(e),
        };
        let Some(previous) = self.previous.clone() else {
            return self.failed(format!("no stored state for {}", spec.name));
        };
        let resolved = match self.resolve(spec) {
            Ok(resolved) => resolved,
            Err(e) => return self.failed(e),
        };

        info!("Updating {} {} ({})", spec.resource_type, spec.name, previous.external_id);
        let outputs = match self
            .provider
            .update(&spec.resource_type, &previous.external_id, &resolved)
            .await
        {
            Ok(outputs) => outputs,
            Err(e) => return self.failed(e.to_string()),
        };

        let mut state = previous;
        let hash = self.hasher.hash_inputs(&spec.inputs);
        state.record_update(spec.inputs.clone(), &hash, resolved, outputs);
        state.dependencies.clone_from(&self.entry.dependencies);

        match self.store.save(&spec.name, &state).await {
            Ok(()) => self.succeeded(&state),
            Err(e) => self.failed(format!("updated {} but failed to record it: {e}", state.external_id)),
        }
    }

    async fn run_replace(&self) -> (NodeOutcome, Option<Resolved>) {
        let spec = match self.spec() {
            Ok(spec) => spec,
            Err(e) => return self.failed(e),
        };
        let Some(previous) = self.previous.clone() else {
            return self.failed(format!("no stored state for {}", spec.name));
        };
        let resolved = match self.resolve(spec) {
            Ok(resolved) => resolved,
            Err(e) => return self.failed(e),
        };

        match self.entry.replace_policy.unwrap_or_default() {
            ReplacePolicy::CreateBeforeDelete => {
                let state = match self.create_and_save(spec, resolved).await {
                    Ok(state) => state,
                    Err(e) => return self.failed(e),
                };
                let (mut outcome, output) = self.succeeded(&state);
                if let Err(e) = self
                    .delete_remote(&previous.resource_type, &previous.external_id)
                    .await
                {
                    outcome.status = NodeStatus::Partial;
                    outcome.message = Some(format!(
                        "replacement {} is recorded; deleting previous {} failed: {e}",
                        state.external_id, previous.external_id
                    ));
                }
                (outcome, output)
            }
            ReplacePolicy::DeleteBeforeCreate => {
                if let Err(e) = self
                    .delete_remote(&previous.resource_type, &previous.external_id)
                    .await
                {
                    return self.failed(e.to_string());
                }
                if let Err(e) = self.store.remove(&spec.name).await {
                    let mut outcome = NodeOutcome::new(&self.entry, NodeStatus::Partial)
                        .with_message(format!(
                            "deleted {} but failed to update state: {e}",
                            previous.external_id
                        ));
                    outcome.resource_present = false;
                    return (outcome, None);
                }
                match self.create_and_save(spec, resolved).await {
                    Ok(state) => self.succeeded(&state),
                    Err(e) => {
                        let mut outcome = NodeOutcome::new(&self.entry, NodeStatus::Partial).with_message(
                            format!("deleted previous {}; creating replacement failed: {e}", previous.external_id),
                        );
                        outcome.external_id = None;
                        outcome.resource_present = false;
                        (outcome, None)
                    }
                }
            }
        }
    }

    async fn run_delete(&self) -> (NodeOutcome, Option<Resolved>) {
        if self.entry.corrupt_baseline {
            return self.failed("state entry is unreadable; inspect it and remove it with `state rm`");
        }
        let Some(id) = self.entry.external_id.clone() else {
            return self.failed("no provider id recorded");
        };

        if let Err(e) = self.delete_remote(&self.entry.resource_type, &id).await {
            return self.failed(e.to_string());
        }
        if let Err(e) = self.store.remove(&self.entry.name).await {
            return self.failed(format!("deleted {id} but failed to update state: {e}"));
        }

        let mut outcome = NodeOutcome::new(&self.entry, NodeStatus::Succeeded);
        outcome.external_id = None;
        outcome.resource_present = false;
        (outcome, None)
    }
}

impl RunReport {
    fn status_of(outcomes: &[NodeOutcome]) -> RunStatus {
        let actionable: Vec<&NodeOutcome> = outcomes.iter().filter(|o| o.action.is_actionable()).collect();
        if actionable.iter().all(|o| o.status == NodeStatus::Succeeded) {
            RunStatus::Success
        } else if actionable.iter().all(|o| o.status == NodeStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }

    /// Process exit code: `0` on success, `1` otherwise.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self.status {
            RunStatus::Success => 0,
            RunStatus::Partial | RunStatus::Failed => 1,
        }
    }

    /// Gets the outcome for a logical name.
    #[must_use]
    pub fn outcome(&self, name: &str) -> Option<&NodeOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    /// Counts outcomes with the given status.
    #[must_use]
    pub fn count(&self, status: NodeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Run duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unchanged => "unchanged",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Partial => "partial",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "Success",
            Self::Partial => "Partial",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

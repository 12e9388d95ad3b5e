//! Reconciler tying a program to its state and provider.
//!
//! Expands the program into declarations, builds the graph, diffs it
//! against the state store and executes the plan. `apply` and `destroy`
//! hold the state lock for the duration of the run.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::component::{Declarations, MysqlOutputs};
use crate::config::{ConfigHasher, ProgramConfig};
use crate::error::{PlanError, ReconcileToolError, Result};
use crate::planner::{DiffEngine, Plan, PlanExecutor, ResourceGraph, RunReport, SchemaRegistry};
use crate::provider::{Provider, SecretStore};
use crate::state::{StateSnapshot, StateStore, generate_holder_id};

/// Options for `apply` and `destroy`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Proceed even if some state entries are unreadable.
    pub accept_corrupt: bool,
}

/// Outcome of `apply` or `destroy`.
#[derive(Debug, serde::Serialize)]
pub struct ApplyResult {
    /// The plan that was executed.
    pub plan: Plan,
    /// Per-node outcomes.
    pub report: RunReport,
}

/// Reconciler for a single program.
pub struct Reconciler {
    /// Program.
    config: ProgramConfig,
    /// Expanded declarations.
    declarations: Declarations,
    /// Dependency graph of the declarations.
    graph: ResourceGraph,
    /// State store.
    store: Arc<dyn StateStore>,
    /// Provider.
    provider: Arc<dyn Provider>,
    /// Secret store.
    secrets: Arc<dyn SecretStore>,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Stops scheduling new nodes.
    cancel: CancellationToken,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("program", &self.config.program.name)
            .field("stage", &self.config.program.stage)
            .field("resources", &self.graph.len())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a database has invalid options or
    /// the declarations do not form a valid graph.
    pub fn new(
        config: ProgramConfig,
        store: Arc<dyn StateStore>,
        provider: Arc<dyn Provider>,
        secrets: Arc<dyn SecretStore>,
    ) -> Result<Self> {
        let declarations = Declarations::from_program(&config)?;
        let graph = ResourceGraph::build(declarations.resources.clone())?;
        let schemas = SchemaRegistry::builtin().with_default_policy(config.execution.replace_policy);

        info!(
            "Program {}/{}: {} databases, {} resources",
            config.program.name,
            config.program.stage,
            declarations.databases.len(),
            graph.len()
        );
        debug!("Program hash: {}", ConfigHasher::new().hash_program(&config));

        Ok(Self {
            config,
            declarations,
            graph,
            store,
            provider,
            secrets,
            diff_engine: DiffEngine::with_schemas(schemas),
            cancel: CancellationToken::new(),
        })
    }

    /// Uses `token` to stop scheduling new nodes.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Program.
    #[must_use]
    pub const fn config(&self) -> &ProgramConfig {
        &self.config
    }

    /// Expanded declarations.
    #[must_use]
    pub const fn declarations(&self) -> &Declarations {
        &self.declarations
    }

    /// Dependency graph.
    #[must_use]
    pub const fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    /// Computes the plan against the current state without changing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    pub async fn plan(&self) -> Result<Plan> {
        let snapshot = self.store.snapshot().await?;
        Ok(self.diff_engine.compute(&self.graph, &snapshot))
    }

    /// Computes the plan `destroy` would execute.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        let snapshot = self.store.snapshot().await?;
        let empty = ResourceGraph::build(Vec::new())?;
        Ok(self.diff_engine.compute(&empty, &snapshot))
    }

    /// Brings the provider in line with the program.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken, the state cannot be
    /// read, or unreadable state entries were not accepted. Node failures
    /// are reported in the result instead.
    pub async fn apply(&self, options: ApplyOptions) -> Result<ApplyResult> {
        self.locked("apply", options, &self.graph).await
    }

    /// Deletes every resource recorded in state.
    ///
    /// # Errors
    ///
    /// As for [`Self::apply`].
    pub async fn destroy(&self, options: ApplyOptions) -> Result<ApplyResult> {
        let empty = ResourceGraph::build(Vec::new())?;
        self.locked("destroy", options, &empty).await
    }

    /// Runs `graph` under the state lock, releasing it on every path.
    async fn locked(&self, operation: &str, options: ApplyOptions, graph: &ResourceGraph) -> Result<ApplyResult> {
        let holder = generate_holder_id();
        let lock = self.store.acquire_lock(&holder, operation).await?;
        debug!("Acquired {lock}");

        let result = self.run(graph, options).await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            error!("Failed to release state lock {}: {e}", lock.lock_id);
            if result.is_ok() {
                return Err(e);
            }
        }
        result
    }

    async fn run(&self, graph: &ResourceGraph, options: ApplyOptions) -> Result<ApplyResult> {
        let snapshot = self.store.snapshot().await?;
        let plan = self.diff_engine.compute(graph, &snapshot);

        let corrupt = plan.corrupt_baselines();
        if !corrupt.is_empty() {
            if !options.accept_corrupt {
                return Err(ReconcileToolError::Plan(PlanError::CorruptBaseline {
                    resources: corrupt.join(", "),
                }));
            }
            warn!("Proceeding without a baseline for {}", corrupt.join(", "));
        }

        if !plan.has_changes() {
            info!("No changes required - state is converged");
        }

        let report = PlanExecutor::new(Arc::clone(&self.provider), Arc::clone(&self.store))
            .with_concurrency(self.config.execution.concurrency)
            .with_cancellation(self.cancel.clone())
            .execute(graph, &plan, &snapshot)
            .await;

        Ok(ApplyResult { plan, report })
    }

    /// Resolves the connection attributes of every database.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or a database's outputs
    /// are unavailable.
    pub async fn outputs(&self) -> Result<Vec<MysqlOutputs>> {
        let snapshot: StateSnapshot = self.store.snapshot().await?;
        let mut outputs = Vec::with_capacity(self.declarations.databases.len());
        for database in &self.declarations.databases {
            outputs.push(
                database
                    .outputs(&snapshot, self.provider.as_ref(), self.secrets.as_ref())
                    .await?,
            );
        }
        Ok(outputs)
    }
}

impl ApplyResult {
    /// Process exit code for the run.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.report.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::planner::{Action, RunStatus};
    use crate::provider::SimulatedProvider;
    use crate::state::LocalStateStore;
    use tempfile::TempDir;

    const PROGRAM: &str = r"
program:
  name: my-app
databases:
  - name: Database
    proxy: true
    vpc:
      subnets: [subnet-a, subnet-b]
";

    fn reconciler(yaml: &str, dir: &TempDir, provider: &Arc<SimulatedProvider>) -> Reconciler {
        let config = ConfigParser::new().parse_yaml(yaml, None).expect("program");
        Reconciler::new(
            config,
            Arc::new(LocalStateStore::with_base_dir(dir.path())),
            provider.clone(),
            provider.clone(),
        )
        .expect("reconciler")
    }

    #[tokio::test]
    async fn test_apply_converges_and_exposes_outputs() {
        let dir = TempDir::new().expect("temp dir");
        let provider = Arc::new(SimulatedProvider::new());
        let reconciler = reconciler(PROGRAM, &dir, &provider);

        let result = reconciler.apply(ApplyOptions::default()).await.expect("apply");
        assert_eq!(result.report.status, RunStatus::Success);
        assert_eq!(result.exit_code(), 0);

        let replan = reconciler.plan().await.expect("plan");
        assert!(!replan.has_changes());

        let outputs = reconciler.outputs().await.expect("outputs");
        assert_eq!(outputs.len(), 1);
        let db = &outputs[0];
        assert_eq!(db.database, "my_app");
        assert_eq!(db.username, "root");
        assert_eq!(db.port, 3306);
        assert_eq!(db.password.len(), 32);
        assert!(db.host.ends_with("proxy-sim.rds.local"));
        assert!(db.proxy_id().is_ok());
    }

    #[tokio::test]
    async fn test_secret_payload_is_written() {
        let dir = TempDir::new().expect("temp dir");
        let provider = Arc::new(SimulatedProvider::new());
        let reconciler = reconciler(PROGRAM, &dir, &provider);
        reconciler.apply(ApplyOptions::default()).await.expect("apply");

        let secret_id = reconciler
            .store
            .load("DatabaseProxySecret")
            .await
            .expect("load")
            .expect("secret state")
            .external_id;
        let payload = provider.get(&secret_id).await.expect("get").expect("payload");
        let payload: serde_json::Value = serde_json::from_str(&payload).expect("json payload");
        assert_eq!(payload["username"], "root");
        assert_eq!(payload["password"].as_str().map(str::len), Some(32));
    }

    #[tokio::test]
    async fn test_user_text_with_dollar_braces_is_kept_verbatim() {
        let yaml = r"
program:
  name: my-app
databases:
  - name: Database
    password: 'pa${ss'
    replicas: 1
    proxy:
      credentials:
        - username: app.reader
          password: '${DatabaseInstance.endpoint}'
    vpc:
      subnets: [subnet-a]
";
        let dir = TempDir::new().expect("temp dir");
        let provider = Arc::new(SimulatedProvider::new());
        let reconciler = reconciler(yaml, &dir, &provider);

        let result = reconciler.apply(ApplyOptions::default()).await.expect("apply");
        assert_eq!(result.report.status, RunStatus::Success);

        let load = |name: &'static str| {
            let store = Arc::clone(&reconciler.store);
            async move { store.load(name).await.expect("load").expect(name) }
        };
        let instance = load("DatabaseInstance").await;
        assert_eq!(instance.resolved_inputs["password"], "pa${ss");
        let replica = load("DatabaseReplica0").await;
        assert_eq!(replica.resolved_inputs["password"], "pa${ss");

        let secret_id = load("DatabaseProxySecret").await.external_id;
        let payload = provider.get(&secret_id).await.expect("get").expect("payload");
        let payload: serde_json::Value = serde_json::from_str(&payload).expect("json payload");
        assert_eq!(payload["password"], "pa${ss");

        let reader_id = load("DatabaseProxySecretapp_reader").await.external_id;
        let payload = provider.get(&reader_id).await.expect("get").expect("payload");
        let payload: serde_json::Value = serde_json::from_str(&payload).expect("json payload");
        assert_eq!(payload["username"], "app.reader");
        assert_eq!(payload["password"], "${DatabaseInstance.endpoint}");

        let outputs = reconciler.outputs().await.expect("outputs");
        assert_eq!(outputs[0].password, "pa${ss");
        assert!(!reconciler.plan().await.expect("plan").has_changes());
    }

    #[tokio::test]
    async fn test_destroy_empties_state() {
        let dir = TempDir::new().expect("temp dir");
        let provider = Arc::new(SimulatedProvider::new());
        let reconciler = reconciler(PROGRAM, &dir, &provider);
        reconciler.apply(ApplyOptions::default()).await.expect("apply");
        assert!(provider.resource_count() > 0);

        let result = reconciler.destroy(ApplyOptions::default()).await.expect("destroy");
        assert_eq!(result.report.status, RunStatus::Success);
        assert!(result.plan.entries.iter().all(|e| e.action == Action::Delete));
        assert_eq!(provider.resource_count(), 0);
        assert!(reconciler.store.snapshot().await.expect("snapshot").is_empty());
        assert!(!reconciler.store.is_locked().await.expect("lock state"));
    }

    #[tokio::test]
    async fn test_corrupt_entry_requires_acceptance() {
        let dir = TempDir::new().expect("temp dir");
        let provider = Arc::new(SimulatedProvider::new());
        let reconciler = reconciler(PROGRAM, &dir, &provider);
        reconciler.apply(ApplyOptions::default()).await.expect("apply");

        std::fs::write(dir.path().join("resources").join("DatabaseSubnetGroup.json"), "{ not json").expect("corrupt");

        let err = reconciler.apply(ApplyOptions::default()).await.expect_err("refused");
        assert!(err.to_string().contains("DatabaseSubnetGroup"));
        assert!(!reconciler.store.is_locked().await.expect("lock state"));

        let result = reconciler
            .apply(ApplyOptions { accept_corrupt: true })
            .await
            .expect("accepted");
        let entry = result.plan.get("DatabaseSubnetGroup").expect("entry");
        assert_eq!(entry.action, Action::Create);
        assert!(entry.corrupt_baseline);
    }

    #[tokio::test]
    async fn test_apply_refused_while_locked() {
        let dir = TempDir::new().expect("temp dir");
        let provider = Arc::new(SimulatedProvider::new());
        let reconciler = reconciler(PROGRAM, &dir, &provider);

        let lock = reconciler.store.acquire_lock("someone-else", "apply").await.expect("lock");
        assert!(reconciler.apply(ApplyOptions::default()).await.is_err());
        assert!(provider.calls().is_empty());

        reconciler.store.release_lock(&lock.lock_id).await.expect("unlock");
        assert!(reconciler.apply(ApplyOptions::default()).await.is_ok());
    }

    #[test]
    fn test_invalid_program_is_configuration_error() {
        let dir = TempDir::new().expect("temp dir");
        let provider = Arc::new(SimulatedProvider::new());
        let config = ConfigParser::new()
            .parse_yaml(
                r"
program:
  name: my-app
resources:
  - name: A
    type: t
    depends_on: [B]
  - name: B
    type: t
    depends_on: [A]
",
                None,
            )
            .expect("program");

        let err = Reconciler::new(
            config,
            Arc::new(LocalStateStore::with_base_dir(dir.path())),
            provider.clone(),
            provider,
        )
        .expect_err("cycle");
        assert_eq!(err.exit_code(), 2);
    }
}

//! End-to-end reconcile scenarios against the simulated provider.

use std::sync::Arc;
use std::time::Duration;

use rds_reconcile::config::ConfigParser;
use rds_reconcile::error::ConfigError;
use rds_reconcile::planner::{
    Action, DiffEngine, NodeStatus, PlanExecutor, ReplacePolicy, ResourceGraph, RunReport, RunStatus,
};
use rds_reconcile::provider::{CallRecord, Operation, SimulatedProvider};
use rds_reconcile::reconciler::{ApplyOptions, Reconciler};
use rds_reconcile::resource::ResourceSpec;
use rds_reconcile::state::{LocalStateStore, StateStore};
use serde_json::json;
use tempfile::TempDir;

struct Harness {
    provider: Arc<SimulatedProvider>,
    store: Arc<LocalStateStore>,
    _dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        Self {
            provider: Arc::new(SimulatedProvider::new()),
            store: Arc::new(LocalStateStore::with_base_dir(dir.path())),
            _dir: dir,
        }
    }

    async fn apply_with(&self, specs: Vec<ResourceSpec>, concurrency: usize) -> RunReport {
        let graph = ResourceGraph::build(specs).expect("graph");
        let snapshot = self.store.snapshot().await.expect("snapshot");
        let plan = DiffEngine::new().compute(&graph, &snapshot);
        PlanExecutor::new(self.provider.clone(), self.store.clone())
            .with_concurrency(concurrency)
            .execute(&graph, &plan, &snapshot)
            .await
    }

    async fn apply(&self, specs: Vec<ResourceSpec>) -> RunReport {
        self.apply_with(specs, 4).await
    }
}

fn group(name: &str) -> ResourceSpec {
    ResourceSpec::new(name, "aws:rds:SubnetGroup", json!({"name": name.to_lowercase(), "subnetIds": ["a"]}))
}

fn instance(name: &str, group: &str) -> ResourceSpec {
    ResourceSpec::new(
        name,
        "aws:rds:Instance",
        json!({"engine": "mysql", "dbSubnetGroupName": format!("${{{group}.name}}")}),
    )
}

fn create_call<'a>(calls: &'a [CallRecord], name: &str) -> &'a CallRecord {
    calls
        .iter()
        .find(|c| c.operation == Operation::Create && c.name == name)
        .unwrap_or_else(|| panic!("no create call for {name}"))
}

#[test]
fn builder_rejects_cycles() {
    let err = ResourceGraph::build(vec![
        group("A").depends_on("C"),
        group("B").depends_on("A"),
        group("C").depends_on("B"),
    ])
    .expect_err("cycle");
    assert!(matches!(err, ConfigError::CycleDetected { .. }));
}

#[test]
fn builder_rejects_dangling_references() {
    let err = ResourceGraph::build(vec![instance("Db", "Missing")]).expect_err("dangling");
    assert!(matches!(
        err,
        ConfigError::DanglingReference { ref from, ref to } if from == "Db" && to == "Missing"
    ));
}

#[tokio::test]
async fn diff_is_idempotent() {
    let h = Harness::new();
    h.apply(vec![group("Group")]).await;

    let graph = tokio_test::assert_ok!(ResourceGraph::build(vec![
        ResourceSpec::new("Group", "aws:rds:SubnetGroup", json!({"name": "group", "subnetIds": ["a", "b"]})),
        instance("Db", "Group"),
    ]));
    let snapshot = h.store.snapshot().await.expect("snapshot");
    let engine = DiffEngine::new();

    let first = engine.compute(&graph, &snapshot);
    let second = engine.compute(&graph, &snapshot);
    assert_eq!(first, second);
    assert_eq!(first.get("Group").map(|e| e.action), Some(Action::Update));
    assert_eq!(first.get("Db").map(|e| e.action), Some(Action::Create));
}

#[tokio::test]
async fn apply_then_rediff_is_all_noop() {
    let h = Harness::new();
    let specs = vec![group("Group"), instance("Db", "Group"), group("Other")];
    let report = h.apply(specs.clone()).await;
    assert_eq!(report.status, RunStatus::Success);

    let graph = ResourceGraph::build(specs).expect("graph");
    let snapshot = h.store.snapshot().await.expect("snapshot");
    let plan = DiffEngine::new().compute(&graph, &snapshot);
    assert!(!plan.has_changes());
    assert!(plan.entries.iter().all(|e| e.action == Action::NoOp));
}

#[tokio::test]
async fn failed_dependency_skips_dependent() {
    let h = Harness::new();
    h.provider.fail_on(Operation::Create, "B");

    // A consumes B's output.
    let report = h
        .apply(vec![
            ResourceSpec::new("A", "aws:rds:Instance", json!({"groupId": "${B.id}"})),
            group("B"),
        ])
        .await;

    assert_eq!(report.outcome("B").map(|o| o.status), Some(NodeStatus::Failed));
    assert_eq!(report.outcome("A").map(|o| o.status), Some(NodeStatus::Skipped));
    assert_eq!(report.status, RunStatus::Partial);
    assert_eq!(report.exit_code(), 1);
    assert!(h.provider.calls_for("A").is_empty());
    assert!(h.store.load("A").await.expect("load").is_none());
}

#[tokio::test]
async fn rerun_after_failure_resumes_where_it_stopped() {
    let h = Harness::new();
    let specs = vec![group("Group"), instance("Db", "Group")];
    h.provider.fail_on(Operation::Create, "Db");

    let first = h.apply(specs.clone()).await;
    assert_eq!(first.status, RunStatus::Partial);
    assert!(h.store.load("Group").await.expect("load").is_some());

    h.provider.clear_fault(Operation::Create, "Db");
    let second = h.apply(specs).await;
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.outcome("Group").map(|o| o.status), Some(NodeStatus::Unchanged));
    assert_eq!(second.outcome("Db").map(|o| o.status), Some(NodeStatus::Succeeded));
    assert_eq!(h.provider.calls_for("Group").len(), 1);
}

#[tokio::test]
async fn identity_change_replaces_create_before_delete() {
    let h = Harness::new();
    h.apply(vec![group("Group"), instance("Db", "Group")]).await;
    let old_id = h.store.load("Group").await.expect("load").expect("state").external_id;

    let changed = vec![
        ResourceSpec::new("Group", "aws:rds:SubnetGroup", json!({"name": "renamed", "subnetIds": ["a"]})),
        instance("Db", "Group"),
    ];
    let graph = ResourceGraph::build(changed.clone()).expect("graph");
    let snapshot = h.store.snapshot().await.expect("snapshot");
    let plan = DiffEngine::new().compute(&graph, &snapshot);
    let entry = plan.get("Group").expect("group entry");
    assert_eq!(entry.action, Action::Replace);
    assert_eq!(entry.replace_policy, Some(ReplacePolicy::CreateBeforeDelete));

    let report = h.apply(changed).await;
    assert_eq!(report.status, RunStatus::Success);

    let ops: Vec<Operation> = h.provider.calls_for("Group").iter().map(|c| c.operation).collect();
    assert_eq!(ops, vec![Operation::Create, Operation::Create, Operation::Delete]);

    let new_state = h.store.load("Group").await.expect("load").expect("state");
    assert_ne!(new_state.external_id, old_id);
    assert!(h.provider.resource(&old_id).is_none());
    let db = h.store.load("Db").await.expect("load").expect("db");
    assert_eq!(db.resolved_inputs["dbSubnetGroupName"], json!("renamed"));
}

#[tokio::test]
async fn independent_resources_overlap() {
    let h = Harness::new();
    for name in ["A", "B", "C"] {
        h.provider.delay(name, Duration::from_millis(50));
    }

    let report = h.apply(vec![group("A"), group("B"), group("C")]).await;
    assert_eq!(report.status, RunStatus::Success);
    assert!(h.provider.max_in_flight() >= 2, "calls ran one at a time");
}

#[tokio::test]
async fn concurrency_limit_is_respected() {
    let h = Harness::new();
    for name in ["A", "B", "C"] {
        h.provider.delay(name, Duration::from_millis(20));
    }

    let report = h.apply_with(vec![group("A"), group("B"), group("C")], 1).await;
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(h.provider.max_in_flight(), 1);
}

#[tokio::test]
async fn dependencies_finish_before_dependents_start() {
    let h = Harness::new();
    // Diamond: Root -> (Left, Right) -> Leaf, with uneven latencies.
    h.provider.delay("Root", Duration::from_millis(30));
    h.provider.delay("Left", Duration::from_millis(60));
    h.provider.delay("Right", Duration::from_millis(10));

    let specs = vec![
        ResourceSpec::new("Leaf", "test:Leaf", json!({"left": "${Left.id}", "right": "${Right.id}"})),
        ResourceSpec::new("Left", "test:Node", json!({"root": "${Root.id}"})),
        ResourceSpec::new("Right", "test:Node", json!({})).depends_on("Root"),
        ResourceSpec::new("Root", "test:Node", json!({})),
    ];
    let report = h.apply(specs).await;
    assert_eq!(report.status, RunStatus::Success);

    let calls = h.provider.calls();
    for (dependency, dependent) in [("Root", "Left"), ("Root", "Right"), ("Left", "Leaf"), ("Right", "Leaf")] {
        let before = create_call(&calls, dependency);
        let after = create_call(&calls, dependent);
        assert!(
            before.finished <= after.started,
            "{dependent} started before {dependency} finished"
        );
    }
}

const PROGRAM: &str = r"
program:
  name: shop
databases:
  - name: Orders
    replicas: 1
    proxy:
      credentials:
        - username: reporting
          password: reporting-pass
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
async fn mysql_program_orders_proxy_after_its_prerequisites() {
    let dir = TempDir::new().expect("temp dir");
    let provider = Arc::new(SimulatedProvider::new());
    let result = reconciler(PROGRAM, &dir, &provider)
        .apply(ApplyOptions::default())
        .await
        .expect("apply");
    assert_eq!(result.report.status, RunStatus::Success);
    assert_eq!(provider.ids_of_type("aws:rds:Instance").len(), 2);
    assert_eq!(provider.ids_of_type("aws:secretsmanager:Secret").len(), 2);

    let calls = provider.calls();
    for (dependency, dependent) in [
        ("OrdersProxyRoleLookup", "OrdersProxy"),
        ("OrdersProxySecret", "OrdersProxy"),
        ("OrdersProxySecretreporting", "OrdersProxy"),
        ("OrdersInstance", "OrdersReplica0"),
        ("OrdersProxy", "OrdersProxyTarget"),
        ("OrdersInstance", "OrdersProxyTarget"),
    ] {
        assert!(
            create_call(&calls, dependency).finished <= create_call(&calls, dependent).started,
            "{dependent} started before {dependency} finished"
        );
    }
}

#[tokio::test]
async fn removing_a_replica_deletes_only_the_replica() {
    let dir = TempDir::new().expect("temp dir");
    let provider = Arc::new(SimulatedProvider::new());
    reconciler(PROGRAM, &dir, &provider)
        .apply(ApplyOptions::default())
        .await
        .expect("apply");

    let without_replica = PROGRAM.replace("    replicas: 1\n", "");
    let next = reconciler(&without_replica, &dir, &provider);
    let plan = next.plan().await.expect("plan");
    let actionable: Vec<(&str, Action)> = plan
        .actionable()
        .into_iter()
        .map(|e| (e.name.as_str(), e.action))
        .collect();
    assert_eq!(actionable, vec![("OrdersReplica0", Action::Delete)]);

    let result = next.apply(ApplyOptions::default()).await.expect("apply");
    assert_eq!(result.report.status, RunStatus::Success);
    assert!(!next.plan().await.expect("plan").has_changes());
}

//! End-to-end reconciliation cycles against the in-process provider.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use stackrecon::config::ConfigValidator;
use stackrecon::error::ProviderError;
use stackrecon::planner::{ChangeOp, StepAction, StepStatus};
use stackrecon::{
    ConfigHasher, ConfigParser, DiffEngine, GraphBuilder, MemoryStateStore, PlanExecutor,
    PlanScheduler, Reconciler, RetryPolicy, SimulatedProvider, StackConfig, StackError,
    StateStore,
};

const BASIC: &str = r"
stack:
  name: basic
resources:
  - id: role
    kind: role
    attributes: { role_name: exec, assumed_by: lambda.amazonaws.com }
  - id: table
    kind: table
    attributes: { table_name: stats, partition_key: resourceId }
  - id: function
    kind: function
    attributes:
      function_name: handler
      runtime: nodejs20.x
      handler: index.handler
      code: dist/function.zip
      role: ref(role, arn)
      environment:
        TABLE_NAME: ${ref(table, name)}
outputs:
  function_arn:
    value: ref(function, arn)
";

fn parse(yaml: &str) -> StackConfig {
    ConfigParser::new().parse_yaml(yaml, None).expect("parse")
}

fn wave_labels(plan: &stackrecon::ExecutionPlan) -> Vec<Vec<String>> {
    plan.wave_steps()
        .map(|wave| wave.iter().map(|s| s.label()).collect())
        .collect()
}

#[tokio::test]
async fn independent_roots_share_the_first_wave() {
    let config = parse(BASIC);
    let store = MemoryStateStore::new();
    let reconciler = Reconciler::new(&config, &store, Arc::new(SimulatedProvider::new()));

    let planned = reconciler.plan().await.expect("plan");
    assert_eq!(
        wave_labels(&planned.plan),
        vec![
            vec![String::from("create role"), String::from("create table")],
            vec![String::from("create function")],
        ]
    );
}

#[tokio::test]
async fn applied_stack_rediffs_to_no_changes() {
    let config = parse(BASIC);
    let store = MemoryStateStore::new();
    let provider = Arc::new(SimulatedProvider::new());
    let reconciler =
        Reconciler::new(&config, &store, provider.clone()).with_retry(RetryPolicy::immediate(3));

    let report = reconciler.apply(None).await.expect("apply");
    assert!(report.is_success());
    assert_eq!(report.summary.create, 3);
    assert_eq!(report.outputs["function_arn"], json!("arn:sim:function:handler"));
    assert_eq!(provider.resource_count(), 3);

    let live = provider.live_attributes("function").expect("function exists");
    assert_eq!(live["role"], json!("arn:sim:role:exec"));
    assert_eq!(live["environment"], json!({ "TABLE_NAME": "stats" }));

    let record = store.get("function").await.expect("get").expect("recorded");
    let deps: Vec<&str> = record.dependencies.iter().map(String::as_str).collect();
    assert_eq!(deps, ["role", "table"]);

    let again = reconciler.plan().await.expect("plan");
    assert!(again.plan.is_empty());
    assert!(
        again
            .plan
            .change_set
            .entries()
            .iter()
            .all(|e| e.op == ChangeOp::NoOp)
    );
}

#[tokio::test]
async fn diff_is_stable_across_runs() {
    let config = parse(BASIC);
    let store = MemoryStateStore::new();
    let reconciler = Reconciler::new(&config, &store, Arc::new(SimulatedProvider::new()));
    reconciler.apply(None).await.expect("apply");

    let snapshot = store.snapshot_all().await.expect("snapshot");
    let graph = GraphBuilder::new().build(&config).expect("graph");
    let first = DiffEngine::new().diff(&graph, &snapshot);
    let second = DiffEngine::new().diff(&graph, &snapshot);

    let hasher = ConfigHasher::new();
    assert_eq!(hasher.hash_change_set(&first), hasher.hash_change_set(&second));
    assert_eq!(first.summary(), second.summary());
}

#[tokio::test]
async fn replaced_table_takes_its_dependent_with_it() {
    let before = r"
stack:
  name: scaling
resources:
  - id: table
    kind: table
    attributes: { table_name: stats, partition_key: resourceId }
  - id: read_target
    kind: scalable_target
    attributes:
      resource_id: table/${ref(table, arn)}
      scalable_dimension: dynamodb:table:ReadCapacityUnits
      service_namespace: dynamodb
      min_capacity: 1
      max_capacity: 20
";
    let after = before.replace("partition_key: resourceId", "partition_key: tenantId");

    let store = MemoryStateStore::new();
    let provider = Arc::new(SimulatedProvider::new());
    let first = parse(before);
    Reconciler::new(&first, &store, provider.clone())
        .apply(None)
        .await
        .expect("first apply");

    let second = parse(&after);
    let reconciler = Reconciler::new(&second, &store, provider.clone());
    let planned = reconciler.plan().await.expect("plan");

    let table = planned.plan.change_set.get("table").expect("table entry");
    assert_eq!(table.op, ChangeOp::Replace);
    assert_eq!(table.changed_attributes, vec![String::from("partition_key")]);
    assert_eq!(
        wave_labels(&planned.plan),
        vec![
            vec![String::from("delete read_target")],
            vec![String::from("delete table")],
            vec![String::from("create table")],
            vec![String::from("create read_target")],
        ]
    );

    let report = reconciler.apply(None).await.expect("second apply");
    assert!(report.is_success());
    assert_eq!(provider.resource_count(), 2);
    let live = provider.live_attributes("table").expect("table exists");
    assert_eq!(live["partition_key"], json!("tenantId"));
}

#[tokio::test]
async fn throttled_create_exhausts_retries_without_stopping_its_wave() {
    let config = parse(BASIC);
    let store = MemoryStateStore::new();
    let provider = Arc::new(SimulatedProvider::new());
    provider.inject_fault("table", ProviderError::Throttled { retry_after_ms: 0 }, 10);

    let reconciler =
        Reconciler::new(&config, &store, provider.clone()).with_retry(RetryPolicy::immediate(3));
    let report = reconciler.apply(None).await.expect("apply runs to completion");

    assert!(!report.is_success());
    assert_eq!(provider.calls("table"), 3);

    let table = report
        .execution
        .for_resource("table")
        .next()
        .expect("table outcome");
    assert_eq!(table.status, StepStatus::Failed);
    assert_eq!(table.attempts, 3);
    assert!(
        table
            .error
            .as_deref()
            .is_some_and(|e| e.contains("Retries exhausted after 3 attempts"))
    );

    // `role` shares the wave; `function` needs the table's name.
    assert!(report.execution.resource_succeeded("role"));
    let function = report
        .execution
        .for_resource("function")
        .next()
        .expect("function outcome");
    assert_eq!(function.status, StepStatus::Skipped);
    assert_eq!(function.blocked_by.as_deref(), Some("create table"));

    assert!(store.get("role").await.expect("get").is_some());
    assert!(store.get("table").await.expect("get").is_none());

    // The next run picks up where this one stopped.
    let planned = reconciler.plan().await.expect("plan");
    assert_eq!(
        wave_labels(&planned.plan),
        vec![
            vec![String::from("create table")],
            vec![String::from("create function")],
        ]
    );
}

#[tokio::test]
async fn drift_lists_only_changed_attributes() {
    let config = parse(BASIC);
    let store = MemoryStateStore::new();
    let provider = Arc::new(SimulatedProvider::new());
    let reconciler = Reconciler::new(&config, &store, provider.clone());
    reconciler.apply(None).await.expect("apply");

    assert!(provider.edit_out_of_band("function", "runtime", json!("python3.12")));
    assert!(provider.remove_out_of_band("table"));

    let report = reconciler.check_drift().await.expect("drift");
    assert_eq!(report.checked, 3);
    assert_eq!(report.drifted.len(), 2);

    let function = report.get("function").expect("function drifted");
    assert_eq!(function.changed_attributes, vec![String::from("runtime")]);
    assert!(!function.missing);
    assert!(report.get("table").expect("table drifted").missing);
    assert!(report.get("role").is_none());
}

#[tokio::test]
async fn worker_pool_bounds_calls_in_flight() {
    let mut yaml = String::from("stack:\n  name: wide\nresources:\n");
    for i in 0..8 {
        yaml.push_str(&format!(
            "  - id: logs{i}\n    kind: log_group\n    attributes: {{ log_group_name: /logs/{i} }}\n"
        ));
    }
    let config = parse(&yaml);
    let graph = GraphBuilder::new().build(&config).expect("graph");
    let store = MemoryStateStore::new();
    let provider = Arc::new(SimulatedProvider::new().with_latency(Duration::from_millis(20)));

    let change_set = DiffEngine::new().diff(&graph, &store.snapshot_all().await.expect("snapshot"));
    let plan = PlanScheduler::new()
        .schedule(&change_set, &graph)
        .expect("schedule");
    assert_eq!(plan.waves.len(), 1);

    let result = PlanExecutor::new(provider.clone(), &store, &graph)
        .with_parallelism(3)
        .execute(&plan)
        .await
        .expect("execute");

    assert_eq!(result.succeeded, 8);
    assert!(provider.max_in_flight() <= 3);
    assert!(provider.max_in_flight() >= 2);
}

#[tokio::test]
async fn removed_resource_is_deleted_after_its_dependents() {
    let store = MemoryStateStore::new();
    let provider = Arc::new(SimulatedProvider::new());
    let first = parse(BASIC);
    Reconciler::new(&first, &store, provider.clone())
        .apply(None)
        .await
        .expect("first apply");

    // Drop the function; `role` and `table` stay.
    let trimmed = parse(
        r"
stack:
  name: basic
resources:
  - id: role
    kind: role
    attributes: { role_name: exec, assumed_by: lambda.amazonaws.com }
  - id: table
    kind: table
    attributes: { table_name: stats, partition_key: resourceId }
",
    );
    let report = Reconciler::new(&trimmed, &store, provider.clone())
        .apply(None)
        .await
        .expect("second apply");

    assert!(report.is_success());
    assert_eq!(report.summary.delete, 1);
    let delete = report
        .execution
        .for_resource("function")
        .next()
        .expect("delete outcome");
    assert_eq!(delete.action, StepAction::Delete);
    assert_eq!(provider.resource_count(), 2);
    assert!(store.get("function").await.expect("get").is_none());
}

#[tokio::test]
async fn starter_template_validates_and_applies() {
    let config = parse(include_str!("../templates/stack.yaml"));
    let validation = ConfigValidator::new().check(&config);
    assert!(validation.is_valid(), "{validation}");
    // The public function URL is reported.
    assert!(validation.warnings.iter().any(|w| w.contains("publicly invocable")));

    let store = MemoryStateStore::new();
    let provider = Arc::new(SimulatedProvider::new());
    let report = Reconciler::new(&config, &store, provider.clone())
        .with_retry(RetryPolicy::immediate(2))
        .apply(None)
        .await
        .expect("apply");

    assert!(report.is_success());
    assert_eq!(provider.resource_count(), config.resources.len());
    assert_eq!(report.outputs["function_version"], json!("1"));
    assert!(
        report.outputs["function_url"]
            .as_str()
            .is_some_and(|url| url.starts_with("https://"))
    );
}

#[tokio::test]
async fn saved_provider_carries_resources_into_the_next_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("simulated-provider.json");
    let store = MemoryStateStore::new();

    let config = parse(BASIC);
    let first = Arc::new(SimulatedProvider::new());
    Reconciler::new(&config, &store, first.clone())
        .apply(None)
        .await
        .expect("first apply");
    first.save(&path).await.expect("save");

    // A fresh process sees the same resources.
    let second = Arc::new(SimulatedProvider::load(&path).await.expect("load"));
    assert_eq!(second.resource_count(), 3);
    let drift = Reconciler::new(&config, &store, second.clone())
        .check_drift()
        .await
        .expect("drift");
    assert_eq!(drift.checked, 3);
    assert!(drift.drifted.is_empty());

    let updated = parse(&BASIC.replace(
        "partition_key: resourceId }",
        "partition_key: resourceId, read_capacity: 5 }",
    ));
    let report = Reconciler::new(&updated, &store, second.clone())
        .apply(None)
        .await
        .expect("second apply");
    assert!(report.is_success());
    assert_eq!(report.summary.update, 1);
    assert_eq!(second.resource_count(), 3);
    let live = second.live_attributes("table").expect("table exists");
    assert_eq!(live["read_capacity"], json!(5));
}

#[tokio::test]
async fn unreachable_provider_aborts_drift_check() {
    let config = parse(BASIC);
    let store = MemoryStateStore::new();
    let provider = Arc::new(SimulatedProvider::new());
    let reconciler = Reconciler::new(&config, &store, provider.clone());
    reconciler.apply(None).await.expect("apply");

    provider.set_unreachable(true);
    match reconciler.check_drift().await {
        Err(StackError::Provider(e)) => assert!(e.is_unreachable()),
        other => panic!("expected an unreachable provider, got {other:?}"),
    }
}

//! Plan executor.
//!
//! Applies an [`ExecutionPlan`] one wave at a time. Steps within a wave run
//! concurrently on a bounded worker pool; each wave is a barrier. Provider
//! failures are isolated per step: dependents of a failed step are skipped,
//! independent work carries on. Only a failed state write stops the run.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{ProviderError, ReconcileError, Result, StackError};
use crate::graph::{Attributes, OutputRef, ResourceGraph, ResourceKind};
use crate::provider::{CloudProvider, ProviderResource, ProviderResult, RetryPolicy};
use crate::state::{LiveResource, StateStore};

use super::diff::ChangeOp;
use super::plan::{ExecutionPlan, PlannedStep, StepAction};

/// Message recorded on steps that never ran because the run was cancelled.
pub const CANCELLED: &str = "run cancelled";

/// Cooperative cancellation flag, checked between waves.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Final status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The provider call and the state write both succeeded.
    Succeeded,
    /// The step was attempted and failed.
    Failed,
    /// The step never ran.
    Skipped,
}

/// Result of a single step.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    /// Step index in the plan.
    pub step: usize,
    /// Logical id.
    pub logical_id: String,
    /// Provider action.
    pub action: StepAction,
    /// Final status.
    pub status: StepStatus,
    /// Provider calls made.
    pub attempts: u32,
    /// Provider id after the step, if known.
    pub provider_id: Option<String>,
    /// Failure or skip reason.
    pub error: Option<String>,
    /// Label of the step that blocked this one.
    pub blocked_by: Option<String>,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionResult {
    /// One outcome per step, in step order.
    pub outcomes: Vec<StepOutcome>,
    /// Number of succeeded steps.
    pub succeeded: usize,
    /// Number of failed steps.
    pub failed: usize,
    /// Number of skipped steps.
    pub skipped: usize,
    /// Whether cancellation cut the run short.
    pub cancelled: bool,
}

/// What a worker task does for one step.
enum StepCall {
    Create {
        kind: ResourceKind,
        logical_id: String,
        attributes: Attributes,
    },
    Update {
        kind: ResourceKind,
        provider_id: String,
        attributes: Attributes,
    },
    Delete {
        kind: ResourceKind,
        provider_id: String,
    },
    /// Retained delete; nothing to send.
    Forget,
}

impl StepCall {
    async fn invoke(
        &self,
        provider: &dyn CloudProvider,
        retry: RetryPolicy,
        label: &str,
    ) -> (u32, ProviderResult<Option<ProviderResource>>) {
        match self {
            Self::Create {
                kind,
                logical_id,
                attributes,
            } => {
                let (attempts, result) = retry
                    .run(label, || provider.create(*kind, logical_id, attributes))
                    .await;
                (attempts, result.map(Some))
            }
            Self::Update {
                kind,
                provider_id,
                attributes,
            } => {
                let (attempts, result) = retry
                    .run(label, || provider.update(*kind, provider_id, attributes))
                    .await;
                (attempts, result.map(Some))
            }
            Self::Delete { kind, provider_id } => {
                let (attempts, result) = retry
                    .run(label, || async {
                        match provider.delete(*kind, provider_id).await {
                            // Already gone is as good as deleted.
                            Err(ProviderError::NotFound { .. }) => Ok(()),
                            other => other,
                        }
                    })
                    .await;
                (attempts, result.map(|()| None))
            }
            Self::Forget => (0, Ok(None)),
        }
    }
}

/// Executor for execution plans.
pub struct PlanExecutor<'a> {
    /// Provider every step talks to.
    provider: Arc<dyn CloudProvider>,
    /// State store updated after each step.
    store: &'a dyn StateStore,
    /// Desired-state graph the plan was built from.
    graph: &'a ResourceGraph,
    /// Worker pool size.
    max_parallelism: usize,
    /// Retry schedule for transient failures.
    retry: RetryPolicy,
    /// Checked between waves.
    cancel: CancelToken,
}

impl std::fmt::Debug for PlanExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.name())
            .field("store", &self.store.backend_type())
            .field("max_parallelism", &self.max_parallelism)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl<'a> PlanExecutor<'a> {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        store: &'a dyn StateStore,
        graph: &'a ResourceGraph,
    ) -> Self {
        Self {
            provider,
            store,
            graph,
            max_parallelism: 4,
            retry: RetryPolicy::default(),
            cancel: CancelToken::new(),
        }
    }

    /// Sets the worker pool size.
    #[must_use]
    pub fn with_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism.max(1);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Executes a plan.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read before the first wave,
    /// or [`ReconcileError::Aborted`] once the wave during which a state
    /// write failed has finished. Provider failures are reported per step
    /// and never returned here.
    pub async fn execute(&self, plan: &ExecutionPlan) -> Result<ExecutionResult> {
        info!(
            "Executing plan with {} steps in {} waves",
            plan.step_count(),
            plan.waves.len()
        );

        let mut records: HashMap<String, LiveResource> =
            self.store.snapshot_all().await?.into_iter().collect();
        let mut outcomes: Vec<Option<StepOutcome>> = vec![None; plan.steps.len()];
        let semaphore = Arc::new(Semaphore::new(self.max_parallelism));
        let mut cancelled = false;

        for (wave_index, wave) in plan.waves.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("Run cancelled before wave {}", wave_index + 1);
                cancelled = true;
                break;
            }
            debug!("Wave {}: {} steps", wave_index + 1, wave.len());

            let mut workers = JoinSet::new();
            let mut sent: HashMap<usize, Attributes> = HashMap::new();

            for &id in wave {
                let step = &plan.steps[id];

                if let Some(blocker) = step.predecessors.iter().find(|&&p| {
                    outcomes[p]
                        .as_ref()
                        .is_none_or(|o| o.status != StepStatus::Succeeded)
                }) {
                    let blocker = plan.steps[*blocker].label();
                    warn!("Skipping {}: blocked by {blocker}", step.label());
                    outcomes[id] = Some(StepOutcome::skipped(step, None, Some(blocker)));
                    continue;
                }

                let call = match self.prepare(step, &records) {
                    Ok(call) => call,
                    Err(e) => {
                        error!("{} failed: {e}", step.label());
                        outcomes[id] =
                            Some(StepOutcome::finished(step, 0, None, Some(e.to_string())));
                        continue;
                    }
                };
                if let StepCall::Create { attributes, .. } | StepCall::Update { attributes, .. } =
                    &call
                {
                    sent.insert(id, attributes.clone());
                }

                let provider = Arc::clone(&self.provider);
                let semaphore = Arc::clone(&semaphore);
                let retry = self.retry;
                let label = step.label();
                workers.spawn(async move {
                    // The semaphore is never closed.
                    let _permit = semaphore.acquire_owned().await;
                    let (attempts, result) = call.invoke(provider.as_ref(), retry, &label).await;
                    (id, attempts, result)
                });
            }

            let mut abort: Option<String> = None;

            while let Some(joined) = workers.join_next().await {
                let (id, attempts, result) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        error!("Worker task failed: {e}");
                        continue;
                    }
                };
                let step = &plan.steps[id];

                let outcome = match result {
                    Ok(resource) => {
                        match self
                            .commit(step, resource, sent.remove(&id), &mut records)
                            .await
                        {
                            Ok(provider_id) => {
                                info!("{} succeeded", step.label());
                                StepOutcome::finished(step, attempts, provider_id, None)
                            }
                            Err(e) => {
                                error!("{}: state write failed: {e}", step.label());
                                abort.get_or_insert_with(|| e.to_string());
                                StepOutcome::finished(
                                    step,
                                    attempts,
                                    None,
                                    Some(format!("state write failed: {e}")),
                                )
                            }
                        }
                    }
                    Err(e) => {
                        error!("{} failed after {attempts} attempt(s): {e}", step.label());
                        StepOutcome::finished(
                            step,
                            attempts,
                            step.prior_provider_id.clone(),
                            Some(e.to_string()),
                        )
                    }
                };
                outcomes[id] = Some(outcome);
            }

            for &id in wave {
                if outcomes[id].is_none() {
                    outcomes[id] = Some(StepOutcome::finished(
                        &plan.steps[id],
                        0,
                        None,
                        Some(String::from("worker task panicked")),
                    ));
                }
            }

            if let Some(reason) = abort {
                return Err(StackError::Reconcile(ReconcileError::Aborted {
                    wave: wave_index + 1,
                    reason,
                }));
            }
        }

        if !cancelled {
            self.refresh_unchanged(plan, &records)
                .await
                .map_err(|e| {
                    StackError::Reconcile(ReconcileError::Aborted {
                        wave: plan.waves.len(),
                        reason: e.to_string(),
                    })
                })?;
        }

        let outcomes: Vec<StepOutcome> = outcomes
            .into_iter()
            .zip(&plan.steps)
            .map(|(outcome, step)| {
                outcome.unwrap_or_else(|| {
                    StepOutcome::skipped(step, Some(String::from(CANCELLED)), None)
                })
            })
            .collect();

        let result = ExecutionResult::from_outcomes(outcomes, cancelled);
        info!(
            "Execution finished: {} succeeded, {} failed, {} skipped",
            result.succeeded, result.failed, result.skipped
        );
        Ok(result)
    }

    /// Resolves a step into the call its worker will make.
    fn prepare(
        &self,
        step: &PlannedStep,
        records: &HashMap<String, LiveResource>,
    ) -> ProviderResult<StepCall> {
        match step.action {
            StepAction::Delete if step.retain => Ok(StepCall::Forget),
            StepAction::Delete => {
                let provider_id = step
                    .prior_provider_id
                    .clone()
                    .ok_or_else(|| missing_record(&step.logical_id))?;
                Ok(StepCall::Delete {
                    kind: step.kind,
                    provider_id,
                })
            }
            StepAction::Create | StepAction::Update => {
                let node = self
                    .graph
                    .node(&step.logical_id)
                    .ok_or_else(|| missing_record(&step.logical_id))?;
                let attributes = node
                    .resolve_attributes(&|r: &OutputRef| {
                        records.get(&r.node).and_then(|live| live.output(&r.output))
                    })
                    .map_err(|r| ProviderError::UnresolvedValue {
                        id: r.node,
                        output: r.output,
                    })?;

                if step.action == StepAction::Create {
                    Ok(StepCall::Create {
                        kind: step.kind,
                        logical_id: step.logical_id.clone(),
                        attributes,
                    })
                } else {
                    let provider_id = step
                        .prior_provider_id
                        .clone()
                        .ok_or_else(|| missing_record(&step.logical_id))?;
                    Ok(StepCall::Update {
                        kind: step.kind,
                        provider_id,
                        attributes,
                    })
                }
            }
        }
    }

    /// Records a successful provider call in the store.
    async fn commit(
        &self,
        step: &PlannedStep,
        resource: Option<ProviderResource>,
        attributes: Option<Attributes>,
        records: &mut HashMap<String, LiveResource>,
    ) -> Result<Option<String>> {
        let id = step.logical_id.as_str();

        match (step.action, resource) {
            (StepAction::Create | StepAction::Update, Some(resource)) => {
                let mut live = LiveResource::new(resource.provider_id, step.kind);
                live.attributes = attributes.unwrap_or_default();
                if step.action == StepAction::Update
                    && let Some(prior) = records.get(id)
                {
                    live.outputs.clone_from(&prior.outputs);
                }
                live.outputs.extend(resource.outputs);
                if let Some(node) = self.graph.node(id) {
                    live.dependencies.clone_from(&node.depends_on);
                    live.retain_on_delete = node.lifecycle.retain_on_delete;
                }

                self.store.put(id, live.clone()).await?;
                let provider_id = live.provider_id.clone();
                records.insert(id.to_string(), live);
                Ok(Some(provider_id))
            }
            (StepAction::Delete, _) => {
                if step.retain {
                    info!("Retaining {id}; forgetting its record only");
                }
                // A create-before-destroy replacement already wrote the new record.
                let current = records.get(id).map(|r| r.provider_id.as_str());
                if current.is_none() || current == step.prior_provider_id.as_deref() {
                    self.store.delete(id).await?;
                    records.remove(id);
                }
                Ok(step.prior_provider_id.clone())
            }
            (_, None) => Err(StackError::Provider(ProviderError::InvalidResponse {
                message: format!("no resource returned for {}", step.label()),
            })),
        }
    }

    /// Rewrites unchanged records whose lifecycle or dependencies moved.
    async fn refresh_unchanged(
        &self,
        plan: &ExecutionPlan,
        records: &HashMap<String, LiveResource>,
    ) -> Result<()> {
        for entry in plan.change_set.entries() {
            if entry.op != ChangeOp::NoOp {
                continue;
            }
            let (Some(node), Some(record)) = (
                self.graph.node(&entry.logical_id),
                records.get(&entry.logical_id),
            ) else {
                continue;
            };
            if record.dependencies == node.depends_on
                && record.retain_on_delete == node.lifecycle.retain_on_delete
            {
                continue;
            }

            debug!("Refreshing record metadata for {}", entry.logical_id);
            let mut refreshed = record.clone();
            refreshed.dependencies.clone_from(&node.depends_on);
            refreshed.retain_on_delete = node.lifecycle.retain_on_delete;
            refreshed.last_reconciled = chrono::Utc::now();
            self.store.put(&entry.logical_id, refreshed).await?;
        }
        Ok(())
    }
}

fn missing_record(logical_id: &str) -> ProviderError {
    ProviderError::InvalidResponse {
        message: format!("no provider id recorded for {logical_id}"),
    }
}

impl StepOutcome {
    fn finished(
        step: &PlannedStep,
        attempts: u32,
        provider_id: Option<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            step: step.id,
            logical_id: step.logical_id.clone(),
            action: step.action,
            status: if error.is_none() {
                StepStatus::Succeeded
            } else {
                StepStatus::Failed
            },
            attempts,
            provider_id,
            error,
            blocked_by: None,
        }
    }

    fn skipped(step: &PlannedStep, error: Option<String>, blocked_by: Option<String>) -> Self {
        Self {
            step: step.id,
            logical_id: step.logical_id.clone(),
            action: step.action,
            status: StepStatus::Skipped,
            attempts: 0,
            provider_id: step.prior_provider_id.clone(),
            error,
            blocked_by,
        }
    }
}

impl ExecutionResult {
    fn from_outcomes(outcomes: Vec<StepOutcome>, cancelled: bool) -> Self {
        let count = |status| outcomes.iter().filter(|o| o.status == status).count();
        Self {
            succeeded: count(StepStatus::Succeeded),
            failed: count(StepStatus::Failed),
            skipped: count(StepStatus::Skipped),
            cancelled,
            outcomes,
        }
    }

    /// Returns true if every step succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    /// Outcomes for one logical id, in step order.
    pub fn for_resource<'r>(&'r self, logical_id: &'r str) -> impl Iterator<Item = &'r StepOutcome> {
        self.outcomes.iter().filter(move |o| o.logical_id == logical_id)
    }

    /// Returns true if every step for `logical_id` succeeded.
    #[must_use]
    pub fn resource_succeeded(&self, logical_id: &str) -> bool {
        let mut outcomes = self.for_resource(logical_id).peekable();
        outcomes.peek().is_some() && outcomes.all(|o| o.status == StepStatus::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::GraphBuilder;
    use crate::planner::{DiffEngine, PlanScheduler};
    use crate::provider::MockCloudProvider;
    use crate::state::{MemoryStateStore, MockStateStore, StateSnapshot};
    use serde_json::json;

    const STACK: &str = r"
stack:
  name: test
resources:
  - id: role
    kind: role
    attributes: { role_name: exec }
  - id: table
    kind: table
    attributes: { table_name: stats }
  - id: target
    kind: scalable_target
    attributes: { resource_id: 'table/${ref(table, name)}' }
";

    fn plan_for(yaml: &str, snapshot: &StateSnapshot) -> (ResourceGraph, ExecutionPlan) {
        let config = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
        let graph = GraphBuilder::new().build(&config).expect("graph");
        let change_set = DiffEngine::new().diff(&graph, snapshot);
        let plan = PlanScheduler::new().schedule(&change_set, &graph).expect("plan");
        (graph, plan)
    }

    fn created(id: &str, name: &str) -> ProviderResource {
        ProviderResource {
            provider_id: id.to_string(),
            attributes: Attributes::new(),
            outputs: [(String::from("name"), json!(name))].into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn test_creates_and_records_everything() {
        let (graph, plan) = plan_for(STACK, &StateSnapshot::new());
        let mut provider = MockCloudProvider::new();
        provider.expect_name().return_const("mock");
        provider
            .expect_create()
            .times(3)
            .returning(|_, logical_id, attributes| {
                if logical_id == "target" {
                    assert_eq!(attributes.get("resource_id"), Some(&json!("table/stats-tbl")));
                }
                Ok(created(&format!("{logical_id}-1"), "stats-tbl"))
            });

        let store = MemoryStateStore::new();
        let result = PlanExecutor::new(Arc::new(provider), &store, &graph)
            .with_retry(RetryPolicy::immediate(3))
            .execute(&plan)
            .await
            .expect("execute");

        assert!(result.is_success());
        assert_eq!(result.succeeded, 3);
        let snapshot = store.snapshot_all().await.expect("snapshot");
        assert_eq!(snapshot.len(), 3);
        let target = &snapshot["target"];
        assert_eq!(target.provider_id, "target-1");
        assert!(target.dependencies.contains("table"));
        assert_eq!(target.attributes["resource_id"], json!("table/stats-tbl"));
    }

    #[tokio::test]
    async fn test_throttled_step_fails_and_blocks_dependents() {
        let (graph, plan) = plan_for(STACK, &StateSnapshot::new());
        let mut provider = MockCloudProvider::new();
        provider.expect_name().return_const("mock");
        provider
            .expect_create()
            .withf(|_, logical_id, _| logical_id == "table")
            .times(3)
            .returning(|_, _, _| Err(ProviderError::Throttled { retry_after_ms: 0 }));
        provider
            .expect_create()
            .withf(|_, logical_id, _| logical_id == "role")
            .times(1)
            .returning(|_, _, _| Ok(created("role-1", "exec")));

        let store = MemoryStateStore::new();
        let result = PlanExecutor::new(Arc::new(provider), &store, &graph)
            .with_retry(RetryPolicy::immediate(3))
            .execute(&plan)
            .await
            .expect("execute");

        assert_eq!((result.succeeded, result.failed, result.skipped), (1, 1, 1));
        let table = result.for_resource("table").next().expect("table outcome");
        assert_eq!(table.attempts, 3);
        assert!(table.error.as_deref().is_some_and(|e| e.contains("Retries exhausted")));

        let target = result.for_resource("target").next().expect("target outcome");
        assert_eq!(target.status, StepStatus::Skipped);
        assert_eq!(target.blocked_by.as_deref(), Some("create table"));
        assert!(result.resource_succeeded("role"));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let (graph, plan) = plan_for(
            "stack:\n  name: t\nresources:\n  - id: role\n    kind: role\n",
            &StateSnapshot::new(),
        );
        let mut provider = MockCloudProvider::new();
        provider.expect_name().return_const("mock");
        provider
            .expect_create()
            .times(1)
            .returning(|_, _, _| Err(ProviderError::rejected(400, "bad role")));

        let store = MemoryStateStore::new();
        let result = PlanExecutor::new(Arc::new(provider), &store, &graph)
            .execute(&plan)
            .await
            .expect("execute");

        assert_eq!(result.failed, 1);
        assert_eq!(result.outcomes[0].attempts, 1);
        assert!(store.snapshot_all().await.expect("snapshot").is_empty());
    }

    #[tokio::test]
    async fn test_deletes_treat_missing_as_done_and_retained_as_forget() {
        let mut snapshot = StateSnapshot::new();
        snapshot.insert(String::from("old"), LiveResource::new("old-1", ResourceKind::Role));
        let mut kept = LiveResource::new("v-1", ResourceKind::FunctionVersion);
        kept.retain_on_delete = true;
        snapshot.insert(String::from("version"), kept);

        let (graph, plan) = plan_for("stack:\n  name: t\n", &snapshot);
        let mut provider = MockCloudProvider::new();
        provider.expect_name().return_const("mock");
        provider
            .expect_delete()
            .withf(|kind, id| *kind == ResourceKind::Role && id == "old-1")
            .times(1)
            .returning(|kind, id| {
                Err(ProviderError::NotFound {
                    kind: kind.to_string(),
                    provider_id: id.to_string(),
                })
            });

        let store = MemoryStateStore::with_records(snapshot);
        let result = PlanExecutor::new(Arc::new(provider), &store, &graph)
            .execute(&plan)
            .await
            .expect("execute");

        assert!(result.is_success());
        assert!(store.snapshot_all().await.expect("snapshot").is_empty());
    }

    #[tokio::test]
    async fn test_state_write_failure_aborts_after_wave() {
        let (graph, plan) = plan_for(STACK, &StateSnapshot::new());
        let mut provider = MockCloudProvider::new();
        provider.expect_name().return_const("mock");
        provider
            .expect_create()
            .times(2)
            .returning(|_, logical_id, _| Ok(created(&format!("{logical_id}-1"), "x")));

        let mut store = MockStateStore::new();
        store.expect_backend_type().return_const("mock");
        store
            .expect_snapshot_all()
            .returning(|| Ok(StateSnapshot::new()));
        store
            .expect_put()
            .returning(|_, _| Err(crate::error::StateError::unavailable("disk gone").into()));

        let err = PlanExecutor::new(Arc::new(provider), &store, &graph)
            .execute(&plan)
            .await
            .expect_err("aborted");
        assert!(matches!(
            err,
            StackError::Reconcile(ReconcileError::Aborted { wave: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_everything() {
        let (graph, plan) = plan_for(STACK, &StateSnapshot::new());
        let mut provider = MockCloudProvider::new();
        provider.expect_name().return_const("mock");

        let cancel = CancelToken::new();
        cancel.cancel();
        let store = MemoryStateStore::new();
        let result = PlanExecutor::new(Arc::new(provider), &store, &graph)
            .with_cancel_token(cancel)
            .execute(&plan)
            .await
            .expect("execute");

        assert!(result.cancelled);
        assert_eq!(result.skipped, 3);
        assert!(result.outcomes.iter().all(|o| o.error.as_deref() == Some(CANCELLED)));
    }

    #[tokio::test]
    async fn test_cancel_during_wave_finishes_the_wave() {
        let (graph, plan) = plan_for(STACK, &StateSnapshot::new());
        let cancel = CancelToken::new();

        // Cancelled while the first wave is in flight.
        let token = cancel.clone();
        let mut provider = MockCloudProvider::new();
        provider.expect_name().return_const("mock");
        provider
            .expect_create()
            .times(2)
            .returning(move |_, logical_id, _| {
                assert_ne!(logical_id, "target");
                if logical_id == "table" {
                    token.cancel();
                }
                Ok(created(&format!("{logical_id}-1"), "stats-tbl"))
            });

        let store = MemoryStateStore::new();
        let result = PlanExecutor::new(Arc::new(provider), &store, &graph)
            .with_cancel_token(cancel)
            .execute(&plan)
            .await
            .expect("execute");

        assert!(result.cancelled);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.skipped, 1);

        let target = result.for_resource("target").next().expect("target outcome");
        assert_eq!(target.status, StepStatus::Skipped);
        assert_eq!(target.error.as_deref(), Some(CANCELLED));

        let snapshot = store.snapshot_all().await.expect("snapshot");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["role"].provider_id, "role-1");
        assert_eq!(snapshot["table"].provider_id, "table-1");
        assert!(!snapshot.contains_key("target"));
    }

    #[tokio::test]
    async fn test_unreadable_store_is_fatal() {
        let (graph, plan) = plan_for(STACK, &StateSnapshot::new());
        let provider = MockCloudProvider::new();
        let store = MemoryStateStore::new();
        store.set_unavailable(true);

        let err = PlanExecutor::new(Arc::new(provider), &store, &graph)
            .execute(&plan)
            .await
            .expect_err("store down");
        assert!(matches!(err, StackError::State(_)));
    }
}

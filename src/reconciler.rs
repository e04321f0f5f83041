//! Reconciler driving one plan/apply cycle.
//!
//! Ties the pieces together: build the graph from the stack document, read
//! the recorded state, diff, schedule, execute, then check the resources
//! the run touched for drift and resolve the stack outputs.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{ConfigHasher, StackConfig};
use crate::drift::{DriftReport, DriftReporter};
use crate::error::{PlanError, Result, StackError};
use crate::graph::{GraphBuilder, OutputRef, ResourceGraph};
use crate::planner::{
    CancelToken, ChangeOp, ChangeSummary, DiffEngine, ExecutionPlan, ExecutionResult,
    PlanExecutor, PlanScheduler, StepAction, StepStatus,
};
use crate::provider::{CloudProvider, RetryPolicy};
use crate::state::{StateSnapshot, StateStore, generate_holder_id};

/// Reconciler for one stack.
pub struct Reconciler<'a> {
    /// Stack document.
    config: &'a StackConfig,
    /// State store.
    store: &'a dyn StateStore,
    /// Cloud provider.
    provider: Arc<dyn CloudProvider>,
    /// Retry schedule handed to the executor.
    retry: RetryPolicy,
    /// Cancellation token handed to the executor.
    cancel: CancelToken,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Plan scheduler.
    scheduler: PlanScheduler,
}

/// A computed plan with the graph it was built from.
#[derive(Debug, Clone)]
pub struct PlannedRun {
    /// Desired-state graph.
    pub graph: ResourceGraph,
    /// State as read from the store.
    pub snapshot: StateSnapshot,
    /// Ordered plan.
    pub plan: ExecutionPlan,
}

/// Result of an apply.
#[derive(Debug, Serialize)]
pub struct ApplyReport {
    /// Fingerprint of the plan that was executed.
    pub fingerprint: String,
    /// Counts per operation.
    pub summary: ChangeSummary,
    /// Per-step outcomes.
    pub execution: ExecutionResult,
    /// Drift found on touched and unchanged resources after the run.
    pub drift: Option<DriftReport>,
    /// Resolved stack outputs.
    pub outputs: BTreeMap<String, Value>,
}

impl std::fmt::Debug for Reconciler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("stack", &self.config.stack.name)
            .field("store", &self.store.backend_type())
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

impl<'a> Reconciler<'a> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(
        config: &'a StackConfig,
        store: &'a dyn StateStore,
        provider: Arc<dyn CloudProvider>,
    ) -> Self {
        Self {
            config,
            store,
            provider,
            retry: config.execution.retry.into(),
            cancel: CancelToken::new(),
            diff_engine: DiffEngine::new(),
            scheduler: PlanScheduler::new(),
        }
    }

    /// Overrides the retry policy from the stack document.
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

    /// Builds the desired-state graph.
    ///
    /// # Errors
    ///
    /// Returns a graph error for cycles, duplicates and bad references.
    pub fn graph(&self) -> Result<ResourceGraph> {
        Ok(GraphBuilder::new().build(self.config)?)
    }

    /// Computes the plan without touching the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid, the store cannot be read,
    /// or the change-set cannot be scheduled.
    pub async fn plan(&self) -> Result<PlannedRun> {
        info!("Planning stack {}", self.config.qualified_name());

        let graph = self.graph()?;
        let snapshot = self.store.snapshot_all().await?;
        let change_set = self.diff_engine.diff(&graph, &snapshot);
        let plan = self.scheduler.schedule(&change_set, &graph)?;

        let summary = change_set.summary();
        info!(
            "Plan: {} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            summary.create, summary.update, summary.replace, summary.delete, summary.no_op
        );

        Ok(PlannedRun {
            graph,
            snapshot,
            plan,
        })
    }

    /// Plans and applies under the state lock.
    ///
    /// When `expected_fingerprint` is given, the freshly computed plan must
    /// match it.
    ///
    /// # Errors
    ///
    /// Returns an error if planning fails, the plan is stale, the lock is
    /// held elsewhere, or a state write fails mid-run. Failed steps are
    /// reported in the [`ApplyReport`], not as an error.
    pub async fn apply(&self, expected_fingerprint: Option<&str>) -> Result<ApplyReport> {
        let lock = self.store.acquire_lock(&generate_holder_id()).await?;
        let result = self.apply_locked(expected_fingerprint).await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            error!("Failed to release state lock {}: {e}", lock.lock_id);
        }
        result
    }

    async fn apply_locked(&self, expected_fingerprint: Option<&str>) -> Result<ApplyReport> {
        let PlannedRun { graph, plan, .. } = self.plan().await?;

        if let Some(expected) = expected_fingerprint
            && !ConfigHasher::hashes_match(expected, &plan.fingerprint)
        {
            return Err(StackError::Plan(PlanError::StalePlan {
                expected: expected.to_string(),
                actual: plan.fingerprint.clone(),
            }));
        }

        if plan.is_empty() {
            info!("No changes required - state is converged");
        }

        let execution = PlanExecutor::new(Arc::clone(&self.provider), self.store, &graph)
            .with_parallelism(self.config.execution.max_parallelism)
            .with_retry(self.retry)
            .with_cancel_token(self.cancel.clone())
            .execute(&plan)
            .await?;

        let snapshot = self.store.snapshot_all().await?;

        let scope = post_apply_scope(&plan, &execution);
        let drift = match DriftReporter::new(self.provider.as_ref())
            .report(&graph, &snapshot, Some(&scope))
            .await
        {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Skipping post-apply drift check: {e}");
                None
            }
        };

        let outputs = resolve_outputs(&graph, &snapshot);

        Ok(ApplyReport {
            fingerprint: plan.fingerprint.clone(),
            summary: plan.change_set.summary(),
            execution,
            drift,
            outputs,
        })
    }

    /// Checks every recorded, declared resource for drift.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid, the store cannot be read, or
    /// the provider is unreachable.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!("Checking for drift in {}", self.config.qualified_name());

        let graph = self.graph()?;
        let snapshot = self.store.snapshot_all().await?;
        DriftReporter::new(self.provider.as_ref())
            .report(&graph, &snapshot, None)
            .await
    }
}

/// Resources whose creation steps all succeeded, plus unchanged ones.
fn post_apply_scope(plan: &ExecutionPlan, execution: &ExecutionResult) -> HashSet<String> {
    let mut scope: HashSet<String> = plan
        .change_set
        .entries()
        .iter()
        .filter(|e| e.op == ChangeOp::NoOp)
        .map(|e| e.logical_id.clone())
        .collect();

    let mut failed: HashSet<&str> = HashSet::new();
    for outcome in &execution.outcomes {
        if outcome.status != StepStatus::Succeeded {
            failed.insert(&outcome.logical_id);
        } else if outcome.action != StepAction::Delete {
            scope.insert(outcome.logical_id.clone());
        }
    }
    scope.retain(|id| !failed.contains(id.as_str()));
    scope
}

/// Resolves stack outputs against recorded state; unresolvable ones are left out.
fn resolve_outputs(graph: &ResourceGraph, snapshot: &StateSnapshot) -> BTreeMap<String, Value> {
    let lookup = |r: &OutputRef| snapshot.get(&r.node).and_then(|live| live.output(&r.output));

    graph
        .outputs()
        .iter()
        .filter_map(|output| match output.value.resolve(&lookup) {
            Ok(value) => Some((output.name.clone(), value)),
            Err(missing) => {
                warn!("Output {} unavailable: {missing} not recorded", output.name);
                None
            }
        })
        .collect()
}

impl ApplyReport {
    /// Returns true if every step succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.execution.is_success()
    }
}

impl std::fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.is_success() { "successful" } else { "failed" };
        writeln!(f, "Apply {status}:")?;
        writeln!(f, "  Succeeded: {}", self.execution.succeeded)?;
        writeln!(f, "  Failed: {}", self.execution.failed)?;
        writeln!(f, "  Skipped: {}", self.execution.skipped)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::provider::SimulatedProvider;
    use crate::state::MemoryStateStore;
    use serde_json::json;

    const STACK: &str = r"
stack:
  name: test
resources:
  - id: table
    kind: table
    attributes: { table_name: stats, partition_key: resourceId }
  - id: role
    kind: role
    attributes: { role_name: exec, assumed_by: lambda.amazonaws.com }
outputs:
  table_arn:
    value: ref(table, arn)
";

    fn config() -> StackConfig {
        ConfigParser::new().parse_yaml(STACK, None).expect("parse")
    }

    #[tokio::test]
    async fn test_apply_then_plan_is_empty() {
        let config = config();
        let store = MemoryStateStore::new();
        let provider = Arc::new(SimulatedProvider::new());
        let reconciler = Reconciler::new(&config, &store, provider).with_retry(RetryPolicy::immediate(2));

        let report = reconciler.apply(None).await.expect("apply");
        assert!(report.is_success());
        assert_eq!(report.summary.create, 2);
        assert_eq!(report.outputs["table_arn"], json!("arn:sim:table:stats"));
        assert!(report.drift.as_ref().is_some_and(DriftReport::is_clean));

        let again = reconciler.plan().await.expect("plan");
        assert!(again.plan.is_empty());
        assert_eq!(again.plan.change_set.summary().no_op, 2);
        assert!(store.lock_info().await.expect("lock").is_none());
    }

    #[tokio::test]
    async fn test_stale_fingerprint_is_refused() {
        let config = config();
        let store = MemoryStateStore::new();
        let provider = Arc::new(SimulatedProvider::new());
        let reconciler = Reconciler::new(&config, &store, provider.clone());

        let planned = reconciler.plan().await.expect("plan");
        let err = reconciler
            .apply(Some("0000000000000000"))
            .await
            .expect_err("stale");
        assert!(matches!(err, StackError::Plan(PlanError::StalePlan { .. })));
        assert_eq!(provider.resource_count(), 0);

        let report = reconciler
            .apply(Some(&planned.plan.fingerprint[..12]))
            .await
            .expect("matching fingerprint");
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_apply_refuses_when_locked() {
        let config = config();
        let store = MemoryStateStore::new();
        store.acquire_lock("someone-else").await.expect("lock");
        let reconciler = Reconciler::new(&config, &store, Arc::new(SimulatedProvider::new()));

        let err = reconciler.apply(None).await.expect_err("locked");
        assert!(matches!(err, StackError::State(_)));
    }

    #[tokio::test]
    async fn test_drift_after_out_of_band_edit() {
        let config = config();
        let store = MemoryStateStore::new();
        let provider = Arc::new(SimulatedProvider::new());
        let reconciler = Reconciler::new(&config, &store, provider.clone());
        reconciler.apply(None).await.expect("apply");

        assert!(provider.edit_out_of_band("role", "assumed_by", json!("ec2.amazonaws.com")));
        let report = reconciler.check_drift().await.expect("drift");
        assert_eq!(report.drifted.len(), 1);
        assert_eq!(
            report.drifted[0].changed_attributes,
            vec![String::from("assumed_by")]
        );
    }
}

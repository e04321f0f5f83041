//! Execution plan construction.
//!
//! Expands a change-set into provider-level steps, derives precedence edges
//! between them and layers the result into waves with Kahn's algorithm.
//! Within a wave no step depends on another; waves run in order.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::config::ConfigHasher;
use crate::error::PlanError;
use crate::graph::{ResourceGraph, ResourceKind};

use super::diff::{ChangeOp, ChangeSet, ReplacePolicy};

/// Provider-level action of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Create a resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete a resource.
    Delete,
}

/// One provider call for one logical id.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedStep {
    /// Index of this step in [`ExecutionPlan::steps`].
    pub id: usize,
    /// Logical id.
    pub logical_id: String,
    /// Resource kind the call is made for.
    pub kind: ResourceKind,
    /// Provider action.
    pub action: StepAction,
    /// Change-set operation the step belongs to.
    pub change: ChangeOp,
    /// Provider id of the existing resource, for updates and deletes.
    pub prior_provider_id: Option<String>,
    /// Delete only forgets the record.
    pub retain: bool,
    /// Steps that must succeed first.
    pub predecessors: Vec<usize>,
    /// (change-set position, sub-step ordinal); orders steps within a wave.
    #[serde(skip)]
    sort_key: (usize, usize),
}

/// An ordered, wave-layered plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// SHA-256 fingerprint of the change-set.
    pub fingerprint: String,
    /// The change-set the plan was built from.
    pub change_set: ChangeSet,
    /// All steps.
    pub steps: Vec<PlannedStep>,
    /// Step indices per wave.
    pub waves: Vec<Vec<usize>>,
}

/// Scheduler turning change-sets into plans.
#[derive(Debug, Default)]
pub struct PlanScheduler {
    hasher: ConfigHasher,
}

impl PlannedStep {
    /// Human-readable label, e.g. `delete table`.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{} {}", self.action, self.logical_id)
    }

    /// Returns true for create and update steps.
    #[must_use]
    pub const fn is_creation(&self) -> bool {
        matches!(self.action, StepAction::Create | StepAction::Update)
    }
}

/// Builds the predecessor lists; every edge is `before -> after`.
struct Edges {
    preds: Vec<BTreeSet<usize>>,
}

impl Edges {
    fn add(&mut self, before: usize, after: usize) {
        if before != after {
            self.preds[after].insert(before);
        }
    }
}

impl PlanScheduler {
    /// Creates a new scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Orders a change-set into waves.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Unschedulable`] naming the steps of a cycle if
    /// the precedence edges cannot be satisfied.
    pub fn schedule(
        &self,
        change_set: &ChangeSet,
        graph: &ResourceGraph,
    ) -> std::result::Result<ExecutionPlan, PlanError> {
        let mut steps = Vec::new();
        let mut creation: HashMap<&str, usize> = HashMap::new();
        let mut deletion: HashMap<&str, usize> = HashMap::new();

        for (position, entry) in change_set.entries().iter().enumerate() {
            let prior = entry.before.as_ref();
            let prior_id = prior.map(|b| b.provider_id.clone());
            let mut push = |action: StepAction, kind: ResourceKind, ordinal: usize, retain: bool| {
                let id = steps.len();
                steps.push(PlannedStep {
                    id,
                    logical_id: entry.logical_id.clone(),
                    kind,
                    action,
                    change: entry.op,
                    prior_provider_id: if action == StepAction::Create {
                        None
                    } else {
                        prior_id.clone()
                    },
                    retain,
                    predecessors: Vec::new(),
                    sort_key: (position, ordinal),
                });
                id
            };

            let old_kind = prior.map_or(entry.kind, |b| b.kind);
            let retained = prior.is_some_and(|b| b.retain_on_delete)
                || graph
                    .node(&entry.logical_id)
                    .is_some_and(|n| n.lifecycle.retain_on_delete);
            let id = entry.logical_id.as_str();

            match (entry.op, entry.replace_policy) {
                (ChangeOp::NoOp, _) => {}
                (ChangeOp::Create, _) => {
                    creation.insert(id, push(StepAction::Create, entry.kind, 0, false));
                }
                (ChangeOp::Update, _) => {
                    creation.insert(id, push(StepAction::Update, entry.kind, 0, false));
                }
                (ChangeOp::Delete, _) => {
                    deletion.insert(id, push(StepAction::Delete, old_kind, 0, retained));
                }
                (ChangeOp::Replace, Some(ReplacePolicy::CreateThenDelete)) => {
                    creation.insert(id, push(StepAction::Create, entry.kind, 0, false));
                    deletion.insert(id, push(StepAction::Delete, old_kind, 1, retained));
                }
                (ChangeOp::Replace, _) => {
                    deletion.insert(id, push(StepAction::Delete, old_kind, 0, retained));
                    creation.insert(id, push(StepAction::Create, entry.kind, 1, false));
                }
            }
        }

        let mut edges = Edges {
            preds: vec![BTreeSet::new(); steps.len()],
        };

        for entry in change_set.entries() {
            let id = entry.logical_id.as_str();
            let node = graph.node(id);
            let new_deps = node.map(|n| &n.depends_on);
            let old_deps = entry.before.as_ref().map(|b| &b.dependencies);

            // Creations follow the creations of what they depend on.
            if let (Some(&step), Some(deps)) = (creation.get(id), new_deps) {
                for dep in deps {
                    if let Some(&before) = creation.get(dep.as_str()) {
                        edges.add(before, step);
                    }
                }
            }

            if let Some(&step) = deletion.get(id) {
                // Deletes run in reverse creation order.
                let deps: BTreeSet<&String> = old_deps
                    .into_iter()
                    .flatten()
                    .chain(new_deps.into_iter().flatten())
                    .collect();
                for dep in deps {
                    if let Some(&after) = deletion.get(dep.as_str()) {
                        edges.add(step, after);
                    }
                }
            }

            // A surviving resource lets go of a dependency before it is deleted.
            if entry.op == ChangeOp::Update
                && let (Some(&step), Some(old), Some(new)) = (creation.get(id), old_deps, new_deps)
            {
                for dep in old.difference(new) {
                    if let Some(&after) = deletion.get(dep.as_str()) {
                        edges.add(step, after);
                    }
                }
            }

            if let (Some(&create), Some(&delete)) = (creation.get(id), deletion.get(id)) {
                match entry.replace_policy {
                    Some(ReplacePolicy::CreateThenDelete) => {
                        edges.add(create, delete);
                        // Dependents move over to the new resource first.
                        for dependent in graph.dependents(id) {
                            if let Some(&moved) = creation.get(dependent) {
                                edges.add(moved, delete);
                            }
                        }
                    }
                    _ => edges.add(delete, create),
                }
            }
        }

        for (step, preds) in steps.iter_mut().zip(&edges.preds) {
            step.predecessors = preds.iter().copied().collect();
        }

        let waves = layer(&steps)?;
        debug!("Scheduled {} steps in {} waves", steps.len(), waves.len());

        Ok(ExecutionPlan {
            created_at: Utc::now(),
            fingerprint: self.hasher.hash_change_set(change_set),
            change_set: change_set.clone(),
            steps,
            waves,
        })
    }
}

/// Kahn's algorithm, one layer at a time.
fn layer(steps: &[PlannedStep]) -> std::result::Result<Vec<Vec<usize>>, PlanError> {
    let mut indegree: Vec<usize> = steps.iter().map(|s| s.predecessors.len()).collect();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for step in steps {
        for &pred in &step.predecessors {
            successors[pred].push(step.id);
        }
    }

    let mut ready: Vec<usize> = (0..steps.len()).filter(|&i| indegree[i] == 0).collect();
    let mut placed = 0;
    let mut waves = Vec::new();

    while !ready.is_empty() {
        ready.sort_by_key(|&i| steps[i].sort_key);
        let mut next = Vec::new();
        for &i in &ready {
            for &succ in &successors[i] {
                indegree[succ] -= 1;
                if indegree[succ] == 0 {
                    next.push(succ);
                }
            }
        }
        placed += ready.len();
        waves.push(std::mem::replace(&mut ready, next));
    }

    if placed < steps.len() {
        return Err(PlanError::Unschedulable {
            steps: find_cycle(steps, &indegree),
        });
    }

    Ok(waves)
}

/// Walks predecessors among unplaced steps until one repeats.
fn find_cycle(steps: &[PlannedStep], indegree: &[usize]) -> Vec<String> {
    let remaining = |i: usize| indegree[i] > 0;
    let Some(start) = (0..steps.len()).find(|&i| remaining(i)) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut seen: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    // Every unplaced step has at least one unplaced predecessor.
    while let Some(&pred) = steps[current].predecessors.iter().find(|&&p| remaining(p)) {
        if let Some(&at) = seen.get(&pred) {
            // Reversed, the path runs in execution order.
            let mut cycle: Vec<String> = path[at..].iter().rev().map(|&i| steps[i].label()).collect();
            if let Some(first) = cycle.first().cloned() {
                cycle.push(first);
            }
            return cycle;
        }
        seen.insert(pred, path.len());
        path.push(pred);
        current = pred;
    }

    path.iter().map(|&i| steps[i].label()).collect()
}

impl ExecutionPlan {
    /// Returns true if the plan has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Steps of each wave, in order.
    pub fn wave_steps(&self) -> impl Iterator<Item = Vec<&PlannedStep>> {
        self.waves
            .iter()
            .map(|wave| wave.iter().map(|&i| &self.steps[i]).collect())
    }
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::GraphBuilder;
    use crate::planner::DiffEngine;
    use crate::state::{LiveResource, StateSnapshot};
    use serde_json::json;

    fn graph(yaml: &str) -> ResourceGraph {
        let config = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
        GraphBuilder::new().build(&config).expect("graph")
    }

    fn plan(yaml: &str, snapshot: &StateSnapshot) -> std::result::Result<ExecutionPlan, PlanError> {
        let g = graph(yaml);
        let change_set = DiffEngine::new().diff(&g, snapshot);
        PlanScheduler::new().schedule(&change_set, &g)
    }

    fn wave_labels(plan: &ExecutionPlan) -> Vec<Vec<String>> {
        plan.wave_steps()
            .map(|wave| wave.iter().map(|s| s.label()).collect())
            .collect()
    }

    fn record(
        provider_id: &str,
        kind: ResourceKind,
        attrs: serde_json::Value,
        deps: &[&str],
    ) -> LiveResource {
        let mut live = LiveResource::new(provider_id, kind);
        live.attributes = serde_json::from_value(attrs).expect("attrs");
        live.outputs.insert(String::from("arn"), json!(format!("arn:{provider_id}")));
        live.outputs.insert(String::from("name"), json!(provider_id));
        live.dependencies = deps.iter().map(|d| (*d).to_string()).collect();
        live
    }

    const BASIC: &str = r"
stack:
  name: test
resources:
  - id: role
    kind: role
    attributes: { role_name: exec }
  - id: table
    kind: table
    attributes: { table_name: stats }
  - id: function
    kind: function
    attributes: { role: 'ref(role, arn)' }
";

    #[test]
    fn test_independent_creates_share_a_wave() {
        let plan = plan(BASIC, &StateSnapshot::new()).expect("plan");
        assert_eq!(
            wave_labels(&plan),
            vec![
                vec![String::from("create role"), String::from("create table")],
                vec![String::from("create function")],
            ]
        );
        assert_eq!(plan.steps[2].predecessors, vec![0]);
    }

    #[test]
    fn test_no_changes_means_no_steps() {
        let mut snapshot = StateSnapshot::new();
        snapshot.insert(String::from("role"), record("role-1", ResourceKind::Role, json!({"role_name": "exec"}), &[]));
        snapshot.insert(String::from("table"), record("tbl-1", ResourceKind::Table, json!({"table_name": "stats"}), &[]));
        snapshot.insert(
            String::from("function"),
            record("fn-1", ResourceKind::Function, json!({"role": "arn:role-1"}), &["role"]),
        );

        let plan = plan(BASIC, &snapshot).expect("plan");
        assert!(plan.is_empty());
        assert!(plan.waves.is_empty());
    }

    #[test]
    fn test_replaced_table_orders_dependents() {
        let yaml = r"
stack:
  name: test
resources:
  - id: table
    kind: table
    attributes: { table_name: stats, partition_key: tenantId }
  - id: read_target
    kind: scalable_target
    attributes: { resource_id: 'table/${ref(table, name)}' }
";
        let mut snapshot = StateSnapshot::new();
        snapshot.insert(
            String::from("table"),
            record("tbl-1", ResourceKind::Table, json!({"table_name": "stats", "partition_key": "resourceId"}), &[]),
        );
        snapshot.insert(
            String::from("read_target"),
            record("st-1", ResourceKind::ScalableTarget, json!({"resource_id": "table/tbl-1"}), &["table"]),
        );

        let plan = plan(yaml, &snapshot).expect("plan");
        assert_eq!(
            wave_labels(&plan),
            vec![
                vec![String::from("delete read_target")],
                vec![String::from("delete table")],
                vec![String::from("create table")],
                vec![String::from("create read_target")],
            ]
        );
    }

    #[test]
    fn test_create_before_destroy_moves_dependents_first() {
        let yaml = r"
stack:
  name: test
resources:
  - id: version
    kind: function_version
    attributes: { function: fn-2 }
    lifecycle: { create_before_destroy: true }
  - id: alias
    kind: function_url
    attributes: { function: 'ref(version, qualified_arn)', auth_type: none }
";
        let mut snapshot = StateSnapshot::new();
        snapshot.insert(
            String::from("version"),
            record("v-1", ResourceKind::FunctionVersion, json!({"function": "fn-1"}), &[]),
        );
        snapshot.insert(
            String::from("alias"),
            record("url-1", ResourceKind::FunctionUrl, json!({"function": "arn:v-1", "auth_type": "none"}), &["version"]),
        );

        let plan = plan(yaml, &snapshot).expect("plan");
        // `alias` is replaced too (its function changes); it is deleted
        // before the old version, after being recreated.
        let labels = wave_labels(&plan);
        let position = |label: &str| {
            labels
                .iter()
                .position(|w| w.iter().any(|l| l == label))
                .expect("label present")
        };
        assert!(position("create version") < position("delete version"));
        assert!(position("delete alias") < position("delete version"));
        assert!(position("create alias") < position("delete version"));
    }

    #[test]
    fn test_conflicting_replace_policies_are_unschedulable() {
        let yaml = r"
stack:
  name: test
resources:
  - id: x
    kind: table
    attributes: { table_name: x2 }
  - id: y
    kind: table
    attributes: { table_name: 'y-${ref(x, name)}' }
    lifecycle: { create_before_destroy: true }
";
        let mut snapshot = StateSnapshot::new();
        snapshot.insert(String::from("x"), record("x", ResourceKind::Table, json!({"table_name": "x1"}), &[]));
        snapshot.insert(String::from("y"), record("y", ResourceKind::Table, json!({"table_name": "y-x"}), &["x"]));

        let err = plan(yaml, &snapshot).expect_err("cycle");
        let PlanError::Unschedulable { steps } = err else {
            panic!("expected unschedulable, got {err:?}");
        };
        assert_eq!(steps.first(), steps.last());
        for label in ["delete x", "create x", "create y", "delete y"] {
            assert!(steps.iter().any(|s| s == label), "{label} missing from {steps:?}");
        }
    }

    #[test]
    fn test_update_releases_dependency_before_its_delete() {
        let yaml = r"
stack:
  name: test
resources:
  - id: function
    kind: function
    attributes: { memory_size: 256 }
";
        let mut snapshot = StateSnapshot::new();
        snapshot.insert(
            String::from("function"),
            record("fn-1", ResourceKind::Function, json!({"memory_size": 128, "role": "arn:old"}), &["old_role"]),
        );
        snapshot.insert(String::from("old_role"), record("old", ResourceKind::Role, json!({}), &[]));

        let plan = plan(yaml, &snapshot).expect("plan");
        assert_eq!(
            wave_labels(&plan),
            vec![vec![String::from("update function")], vec![String::from("delete old_role")]]
        );
    }

    #[test]
    fn test_retained_delete_is_flagged() {
        let mut snapshot = StateSnapshot::new();
        let mut kept = record("v-1", ResourceKind::FunctionVersion, json!({}), &[]);
        kept.retain_on_delete = true;
        snapshot.insert(String::from("version"), kept);

        let plan = plan("stack:\n  name: test\n", &snapshot).expect("plan");
        assert_eq!(plan.steps.len(), 1);
        assert!(plan.steps[0].retain);
        assert_eq!(plan.steps[0].prior_provider_id.as_deref(), Some("v-1"));
    }
}

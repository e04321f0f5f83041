//! Diff engine for comparing desired vs recorded state.
//!
//! Produces a typed change-set: one entry per logical id, telling the
//! scheduler whether the resource is created, updated in place, replaced,
//! deleted or left alone.

use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::graph::{OutputRef, ResourceGraph, ResourceKind, ResourceNode};
use crate::state::{LiveResource, StateSnapshot};

/// Engine for computing change-sets.
#[derive(Debug, Default)]
pub struct DiffEngine;

/// Operation planned for one logical id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// Resource needs to be created.
    Create,
    /// Resource is changed in place.
    Update,
    /// Resource is destroyed and recreated.
    Replace,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoOp,
}

/// Ordering of the two halves of a replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacePolicy {
    /// Delete the old resource, then create the new one.
    DeleteThenCreate,
    /// Create the new resource, then delete the old one.
    CreateThenDelete,
}

/// A planned attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedValue {
    /// Value is known at plan time.
    Known(Value),
    /// Value depends on an output that does not exist yet.
    Unknown,
}

/// Change for a single logical id.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeSetEntry {
    /// Logical id.
    pub logical_id: String,
    /// Kind of the resource after the change (before, for deletes).
    pub kind: ResourceKind,
    /// Planned operation.
    pub op: ChangeOp,
    /// Recorded state, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<LiveResource>,
    /// Planned attributes; `None` for deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<BTreeMap<String, PlannedValue>>,
    /// Names of attributes whose value changes.
    pub changed_attributes: Vec<String>,
    /// Ordering policy for replacements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace_policy: Option<ReplacePolicy>,
}

/// The full change-set for one planning cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeSet {
    entries: Vec<ChangeSetEntry>,
}

/// Counts per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    /// Resources to create.
    pub create: usize,
    /// Resources to update in place.
    pub update: usize,
    /// Resources to replace.
    pub replace: usize,
    /// Resources to delete.
    pub delete: usize,
    /// Unchanged resources.
    pub no_op: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the change-set between the desired graph and the store.
    ///
    /// Nodes are visited dependencies-first so that a reference to a node
    /// being created or replaced is known to resolve to a new, not yet
    /// known, value.
    #[must_use]
    pub fn diff(&self, graph: &ResourceGraph, snapshot: &StateSnapshot) -> ChangeSet {
        let mut ops: HashMap<&str, ChangeOp> = HashMap::with_capacity(graph.len());
        let mut declared: Vec<(usize, ChangeSetEntry)> = Vec::with_capacity(graph.len());

        for node in graph.topological() {
            let entry = Self::diff_node(node, snapshot.get(&node.id), snapshot, &ops);
            debug!("{}: {}", node.id, entry.op);
            ops.insert(node.id.as_str(), entry.op);
            declared.push((node.index, entry));
        }

        declared.sort_by_key(|(index, _)| *index);
        let mut entries: Vec<ChangeSetEntry> = declared.into_iter().map(|(_, e)| e).collect();

        // BTreeMap iteration keeps deletes in logical-id order.
        for (id, live) in snapshot {
            if !graph.contains(id) {
                debug!("{id}: delete (no longer declared)");
                entries.push(ChangeSetEntry {
                    logical_id: id.clone(),
                    kind: live.kind,
                    op: ChangeOp::Delete,
                    before: Some(live.clone()),
                    after: None,
                    changed_attributes: Vec::new(),
                    replace_policy: None,
                });
            }
        }

        ChangeSet { entries }
    }

    fn diff_node(
        node: &ResourceNode,
        before: Option<&LiveResource>,
        snapshot: &StateSnapshot,
        ops: &HashMap<&str, ChangeOp>,
    ) -> ChangeSetEntry {
        let lookup = |r: &OutputRef| -> Option<Value> {
            match ops.get(r.node.as_str()) {
                Some(ChangeOp::Create | ChangeOp::Replace) => None,
                _ => snapshot.get(&r.node).and_then(|live| live.output(&r.output)),
            }
        };

        let after: BTreeMap<String, PlannedValue> = node
            .attributes
            .iter()
            .map(|(name, value)| {
                let planned = value
                    .resolve(&lookup)
                    .map_or(PlannedValue::Unknown, PlannedValue::Known);
                (name.clone(), planned)
            })
            .collect();

        let Some(before) = before else {
            return ChangeSetEntry {
                logical_id: node.id.clone(),
                kind: node.kind,
                op: ChangeOp::Create,
                before: None,
                changed_attributes: after.keys().cloned().collect(),
                after: Some(after),
                replace_policy: None,
            };
        };

        let changed = changed_attributes(&before.attributes, &after);
        let op = if before.kind != node.kind
            || changed.iter().any(|a| node.kind.requires_replacement(a))
        {
            ChangeOp::Replace
        } else if changed.is_empty() {
            ChangeOp::NoOp
        } else {
            ChangeOp::Update
        };

        let replace_policy = (op == ChangeOp::Replace).then_some(
            if node.lifecycle.create_before_destroy {
                ReplacePolicy::CreateThenDelete
            } else {
                ReplacePolicy::DeleteThenCreate
            },
        );

        ChangeSetEntry {
            logical_id: node.id.clone(),
            kind: node.kind,
            op,
            before: Some(before.clone()),
            after: Some(after),
            changed_attributes: changed,
            replace_policy,
        }
    }
}

/// Names of attributes that differ between the record and the plan, sorted.
fn changed_attributes(
    before: &BTreeMap<String, Value>,
    after: &BTreeMap<String, PlannedValue>,
) -> Vec<String> {
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter(|key| match (before.get(*key), after.get(*key)) {
            (Some(old), Some(PlannedValue::Known(new))) => old != new,
            (None, None) => false,
            _ => true,
        })
        .cloned()
        .collect()
}

impl ChangeSet {
    /// All entries: declared resources in declaration order, then deletes.
    #[must_use]
    pub fn entries(&self) -> &[ChangeSetEntry] {
        &self.entries
    }

    /// Looks an entry up by logical id.
    #[must_use]
    pub fn get(&self, logical_id: &str) -> Option<&ChangeSetEntry> {
        self.entries.iter().find(|e| e.logical_id == logical_id)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if anything other than `NoOp` is planned.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(|e| e.op != ChangeOp::NoOp)
    }

    /// Entries that require action.
    pub fn actionable(&self) -> impl Iterator<Item = &ChangeSetEntry> {
        self.entries.iter().filter(|e| e.op != ChangeOp::NoOp)
    }

    /// Counts entries per operation.
    #[must_use]
    pub fn summary(&self) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        for entry in &self.entries {
            match entry.op {
                ChangeOp::Create => summary.create += 1,
                ChangeOp::Update => summary.update += 1,
                ChangeOp::Replace => summary.replace += 1,
                ChangeOp::Delete => summary.delete += 1,
                ChangeOp::NoOp => summary.no_op += 1,
            }
        }
        summary
    }
}

impl ChangeOp {
    /// Wire name of the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        }
    }

    /// Plan marker shown next to each resource.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known(v) => write!(f, "{v}"),
            Self::Unknown => f.write_str("(known after apply)"),
        }
    }
}

impl Serialize for PlannedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Known(v) => v.serialize(serializer),
            Self::Unknown => serializer.serialize_str("(known after apply)"),
        }
    }
}

impl std::fmt::Display for ChangeSetEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.op.symbol(), self.logical_id, self.kind)?;
        if !self.changed_attributes.is_empty() && self.op != ChangeOp::Create {
            write!(f, " [{}]", self.changed_attributes.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::GraphBuilder;
    use serde_json::json;

    const STACK: &str = r"
stack:
  name: test
resources:
  - id: role
    kind: role
    attributes:
      role_name: exec
      assumed_by: lambda.amazonaws.com
  - id: table
    kind: table
    attributes:
      table_name: stats
      partition_key: resourceId
      read_capacity: 1
  - id: function
    kind: function
    attributes:
      function_name: handler
      role: ref(role, arn)
      environment:
        TABLE: ${ref(table, name)}
";

    fn graph(yaml: &str) -> ResourceGraph {
        let config = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
        GraphBuilder::new().build(&config).expect("graph")
    }

    fn record(id: &str, kind: ResourceKind, attrs: Value, outputs: Value) -> LiveResource {
        let mut live = LiveResource::new(id, kind);
        live.attributes = serde_json::from_value(attrs).expect("attrs");
        live.outputs = serde_json::from_value(outputs).expect("outputs");
        live
    }

    fn applied() -> StateSnapshot {
        let mut snapshot = StateSnapshot::new();
        snapshot.insert(
            String::from("role"),
            record(
                "role-1",
                ResourceKind::Role,
                json!({"role_name": "exec", "assumed_by": "lambda.amazonaws.com"}),
                json!({"arn": "arn:role/exec", "name": "exec"}),
            ),
        );
        snapshot.insert(
            String::from("table"),
            record(
                "table-2",
                ResourceKind::Table,
                json!({"table_name": "stats", "partition_key": "resourceId", "read_capacity": 1}),
                json!({"arn": "arn:table/stats", "name": "stats"}),
            ),
        );
        snapshot.insert(
            String::from("function"),
            record(
                "function-3",
                ResourceKind::Function,
                json!({
                    "function_name": "handler",
                    "role": "arn:role/exec",
                    "environment": {"TABLE": "stats"}
                }),
                json!({"arn": "arn:function/handler", "name": "handler"}),
            ),
        );
        snapshot
    }

    #[test]
    fn test_empty_store_creates_everything() {
        let change_set = DiffEngine::new().diff(&graph(STACK), &StateSnapshot::new());

        let ids: Vec<&str> = change_set.entries().iter().map(|e| e.logical_id.as_str()).collect();
        assert_eq!(ids, vec!["role", "table", "function"]);
        assert_eq!(change_set.summary().create, 3);

        let function = change_set.get("function").expect("function entry");
        let after = function.after.as_ref().expect("after");
        assert_eq!(after["role"], PlannedValue::Unknown);
        assert_eq!(after["function_name"], PlannedValue::Known(json!("handler")));
    }

    #[test]
    fn test_identical_state_is_no_op() {
        let change_set = DiffEngine::new().diff(&graph(STACK), &applied());
        assert!(!change_set.has_changes());
        assert_eq!(change_set.summary().no_op, 3);
    }

    #[test]
    fn test_diff_is_deterministic() {
        let g = graph(STACK);
        let mut snapshot = applied();
        snapshot.remove("function");
        snapshot.insert(
            String::from("old_logs"),
            record("lg-9", ResourceKind::LogGroup, json!({}), json!({})),
        );

        let engine = DiffEngine::new();
        let first = serde_json::to_string(&engine.diff(&g, &snapshot)).expect("serialize");
        let second = serde_json::to_string(&engine.diff(&g, &snapshot)).expect("serialize");
        assert_eq!(first, second);
    }

    #[test]
    fn test_in_place_update() {
        let yaml = STACK.replace("read_capacity: 1", "read_capacity: 5");
        let change_set = DiffEngine::new().diff(&graph(&yaml), &applied());

        let table = change_set.get("table").expect("table");
        assert_eq!(table.op, ChangeOp::Update);
        assert_eq!(table.changed_attributes, vec![String::from("read_capacity")]);
        assert_eq!(change_set.get("function").expect("function").op, ChangeOp::NoOp);
    }

    #[test]
    fn test_partition_key_forces_replace_and_ripples() {
        let yaml = STACK.replace("partition_key: resourceId", "partition_key: tenantId");
        let change_set = DiffEngine::new().diff(&graph(&yaml), &applied());

        let table = change_set.get("table").expect("table");
        assert_eq!(table.op, ChangeOp::Replace);
        assert_eq!(table.replace_policy, Some(ReplacePolicy::DeleteThenCreate));

        // The function interpolates the table name, which is unknown until
        // the new table exists.
        let function = change_set.get("function").expect("function");
        assert_eq!(function.op, ChangeOp::Update);
        assert_eq!(function.changed_attributes, vec![String::from("environment")]);
    }

    #[test]
    fn test_undeclared_records_are_deleted_in_id_order() {
        let mut snapshot = applied();
        snapshot.insert(String::from("zeta"), record("p-1", ResourceKind::Policy, json!({}), json!({})));
        snapshot.insert(String::from("alpha"), record("p-2", ResourceKind::Policy, json!({}), json!({})));

        let change_set = DiffEngine::new().diff(&graph(STACK), &snapshot);
        let deletes: Vec<&str> = change_set
            .entries()
            .iter()
            .filter(|e| e.op == ChangeOp::Delete)
            .map(|e| e.logical_id.as_str())
            .collect();
        assert_eq!(deletes, vec!["alpha", "zeta"]);
        assert!(change_set.entries()[3..].iter().all(|e| e.op == ChangeOp::Delete));
    }

    #[test]
    fn test_kind_change_forces_replace() {
        let mut snapshot = applied();
        if let Some(role) = snapshot.get_mut("role") {
            role.kind = ResourceKind::Policy;
        }
        let change_set = DiffEngine::new().diff(&graph(STACK), &snapshot);
        assert_eq!(change_set.get("role").expect("role").op, ChangeOp::Replace);
    }
}

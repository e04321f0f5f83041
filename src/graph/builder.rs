//! Resource graph construction.
//!
//! Turns the declared resources of a [`StackConfig`] into an immutable,
//! validated [`ResourceGraph`]. Construction is pure: no I/O, no provider
//! calls.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::config::StackConfig;
use crate::error::GraphError;

use super::node::{AttrValue, ResourceNode};

/// A declared stack output.
#[derive(Debug, Clone, PartialEq)]
pub struct StackOutput {
    /// Output name.
    pub name: String,
    /// Value expression.
    pub value: AttrValue,
    /// Optional description.
    pub description: Option<String>,
}

/// Immutable, validated resource graph.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    /// Nodes in declaration order.
    nodes: Vec<ResourceNode>,
    /// Logical id to position in `nodes`.
    index: HashMap<String, usize>,
    /// Positions in dependency order (dependencies first).
    topo_order: Vec<usize>,
    /// Declared stack outputs.
    outputs: Vec<StackOutput>,
}

/// Builder for resource graphs.
#[derive(Debug, Default)]
pub struct GraphBuilder;

/// DFS marks for cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the resource graph for a stack.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] for duplicate ids, malformed or unresolved
    /// references, self references, and dependency cycles.
    pub fn build(&self, config: &StackConfig) -> std::result::Result<ResourceGraph, GraphError> {
        let mut index = HashMap::with_capacity(config.resources.len());
        for (i, resource) in config.resources.iter().enumerate() {
            if index.insert(resource.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateId {
                    id: resource.id.clone(),
                });
            }
        }

        let mut nodes = Vec::with_capacity(config.resources.len());
        for (i, resource) in config.resources.iter().enumerate() {
            let mut attributes = BTreeMap::new();
            for (name, raw) in &resource.attributes {
                let value = AttrValue::parse(raw).map_err(|expression| {
                    GraphError::InvalidReference {
                        id: resource.id.clone(),
                        expression,
                    }
                })?;
                attributes.insert(name.clone(), value);
            }

            let mut depends_on: BTreeSet<String> = resource.depends_on.iter().cloned().collect();
            for value in attributes.values() {
                depends_on.extend(value.references().into_iter().map(|r| r.node.clone()));
            }

            for dep in &depends_on {
                if *dep == resource.id {
                    return Err(GraphError::SelfReference {
                        id: resource.id.clone(),
                    });
                }
                if !index.contains_key(dep) {
                    return Err(GraphError::UnresolvedReference {
                        from: resource.id.clone(),
                        missing: dep.clone(),
                    });
                }
            }

            nodes.push(ResourceNode {
                id: resource.id.clone(),
                kind: resource.kind,
                attributes,
                depends_on,
                lifecycle: resource.lifecycle,
                index: i,
            });
        }

        let mut outputs = Vec::with_capacity(config.outputs.len());
        for (name, output) in &config.outputs {
            let owner = format!("outputs.{name}");
            let value = AttrValue::parse(&output.value).map_err(|expression| {
                GraphError::InvalidReference {
                    id: owner.clone(),
                    expression,
                }
            })?;
            if let Some(missing) = value.references().into_iter().find(|r| !index.contains_key(&r.node)) {
                return Err(GraphError::UnresolvedReference {
                    from: owner,
                    missing: missing.node.clone(),
                });
            }
            outputs.push(StackOutput {
                name: name.clone(),
                value,
                description: output.description.clone(),
            });
        }

        let topo_order = topological_order(&nodes, &index)?;
        debug!("Built resource graph with {} nodes", nodes.len());

        Ok(ResourceGraph {
            nodes,
            index,
            topo_order,
            outputs,
        })
    }
}

/// Orders nodes dependencies-first with a three-color depth-first search.
///
/// Reaching an in-progress node means the current path loops back on
/// itself; the cycle is reported from that node around to itself.
fn topological_order(
    nodes: &[ResourceNode],
    index: &HashMap<String, usize>,
) -> std::result::Result<Vec<usize>, GraphError> {
    fn visit(
        at: usize,
        nodes: &[ResourceNode],
        index: &HashMap<String, usize>,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> std::result::Result<(), GraphError> {
        marks[at] = Mark::InProgress;
        path.push(at);

        for dep in &nodes[at].depends_on {
            let next = index[dep];
            match marks[next] {
                Mark::Done => {}
                Mark::InProgress => {
                    let start = path.iter().position(|&p| p == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|&p| nodes[p].id.clone()).collect();
                    cycle.push(nodes[next].id.clone());
                    return Err(GraphError::Cycle { path: cycle });
                }
                Mark::Unvisited => visit(next, nodes, index, marks, path, order)?,
            }
        }

        path.pop();
        marks[at] = Mark::Done;
        order.push(at);
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());
    let mut path = Vec::new();

    for start in 0..nodes.len() {
        if marks[start] == Mark::Unvisited {
            visit(start, nodes, index, &mut marks, &mut path, &mut order)?;
        }
    }

    Ok(order)
}

impl ResourceGraph {
    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks a node up by logical id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&ResourceNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Returns true if the graph declares `id`.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Declaration position of `id`.
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Nodes in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.iter()
    }

    /// Nodes in dependency order, dependencies first.
    pub fn topological(&self) -> impl Iterator<Item = &ResourceNode> {
        self.topo_order.iter().map(|&i| &self.nodes[i])
    }

    /// Logical ids of nodes that depend directly on `id`, in declaration order.
    #[must_use]
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.depends_on.contains(id))
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Declared stack outputs.
    #[must_use]
    pub fn outputs(&self) -> &[StackOutput] {
        &self.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigParser, Lifecycle, ResourceConfig};
    use crate::graph::ResourceKind;
    use serde_json::json;

    fn resource(id: &str, kind: ResourceKind, attributes: serde_json::Value) -> ResourceConfig {
        let attributes = attributes
            .as_object()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        ResourceConfig {
            id: id.to_string(),
            kind,
            attributes,
            depends_on: vec![],
            lifecycle: Lifecycle::default(),
        }
    }

    fn stack(resources: Vec<ResourceConfig>) -> StackConfig {
        let mut config = ConfigParser::new()
            .parse_yaml("stack:\n  name: test\n", None)
            .expect("minimal config");
        config.resources = resources;
        config
    }

    #[test]
    fn test_builds_acyclic_graph() {
        let config = stack(vec![
            resource("role", ResourceKind::Role, json!({"role_name": "exec"})),
            resource("table", ResourceKind::Table, json!({"table_name": "stats"})),
            resource("function", ResourceKind::Function, json!({"role": "ref(role, arn)"})),
        ]);

        let graph = GraphBuilder::new().build(&config).expect("graph");
        assert_eq!(graph.len(), 3);

        let node = graph.node("function").expect("function node");
        assert!(node.depends_on.contains("role"));
        assert_eq!(graph.dependents("role"), vec!["function"]);

        let order: Vec<&str> = graph.topological().map(|n| n.id.as_str()).collect();
        let role_pos = order.iter().position(|id| *id == "role");
        let fn_pos = order.iter().position(|id| *id == "function");
        assert!(role_pos < fn_pos);
    }

    #[test]
    fn test_cycle_is_named() {
        let config = stack(vec![
            resource("a", ResourceKind::Role, json!({"x": "ref(b, arn)"})),
            resource("b", ResourceKind::Role, json!({"x": "ref(c, arn)"})),
            resource("c", ResourceKind::Role, json!({"x": "ref(a, arn)"})),
        ]);

        let err = GraphBuilder::new().build(&config).expect_err("cycle");
        let GraphError::Cycle { path } = err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_eq!(path.first(), path.last());
        assert_eq!(path.len(), 4);
        for id in ["a", "b", "c"] {
            assert!(path.iter().any(|p| p == id));
        }
    }

    #[test]
    fn test_unresolved_reference() {
        let config = stack(vec![resource(
            "function",
            ResourceKind::Function,
            json!({"role": "ref(missing_role, arn)"}),
        )]);

        let err = GraphBuilder::new().build(&config).expect_err("unresolved");
        assert_eq!(
            err,
            GraphError::UnresolvedReference {
                from: String::from("function"),
                missing: String::from("missing_role"),
            }
        );
    }

    #[test]
    fn test_explicit_dependency_must_exist() {
        let mut function = resource("function", ResourceKind::Function, json!({}));
        function.depends_on = vec![String::from("log_group")];
        let err = GraphBuilder::new()
            .build(&stack(vec![function]))
            .expect_err("unresolved");
        assert!(matches!(err, GraphError::UnresolvedReference { .. }));
    }

    #[test]
    fn test_duplicate_and_self_reference() {
        let dup = stack(vec![
            resource("role", ResourceKind::Role, json!({})),
            resource("role", ResourceKind::Role, json!({})),
        ]);
        assert!(matches!(
            GraphBuilder::new().build(&dup),
            Err(GraphError::DuplicateId { .. })
        ));

        let selfish = stack(vec![resource("role", ResourceKind::Role, json!({"x": "ref(role, arn)"}))]);
        assert!(matches!(
            GraphBuilder::new().build(&selfish),
            Err(GraphError::SelfReference { .. })
        ));
    }

    #[test]
    fn test_policy_variables_are_not_references() {
        let config = stack(vec![
            resource("bucket_role", ResourceKind::Role, json!({"role_name": "uploads"})),
            resource(
                "pol",
                ResourceKind::Policy,
                json!({
                    "policy_name": "per-user",
                    "role": "ref(bucket_role, name)",
                    "statements": [{
                        "effect": "allow",
                        "actions": ["s3:PutObject"],
                        "resources": ["arn:aws:s3:::bucket/${aws:username}/*"]
                    }]
                }),
            ),
        ]);

        let graph = GraphBuilder::new().build(&config).expect("graph");
        let node = graph.node("pol").expect("policy node");
        assert_eq!(node.references().len(), 1);
        assert!(node.attributes["statements"].is_literal());
    }
}

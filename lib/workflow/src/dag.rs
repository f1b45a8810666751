//! The dependency graph derived from a workflow document.
//!
//! The `Dag` is a pure value: it is re-derived from the flow run's DSL
//! snapshot wherever it is needed and never persisted. Nodes are keyed by
//! their DAG-local id; when a document declares no edges the node list is
//! treated as a linear chain in document order.

use crate::definition::{EdgeDef, NodeDef, WorkflowDsl};
use crate::error::DslError;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// A parsed workflow dependency graph.
#[derive(Debug, Clone)]
pub struct Dag {
    graph: DiGraph<NodeDef, ()>,
    index: HashMap<String, NodeIndex>,
    order: Vec<String>,
    edges: Vec<EdgeDef>,
    deps: HashMap<String, Vec<String>>,
    successors: HashMap<String, Vec<String>>,
}

impl Dag {
    /// Parses a workflow document and derives its DAG.
    ///
    /// # Errors
    ///
    /// Fails on invalid YAML, an empty node list, a missing or duplicate
    /// node id, an edge naming an unknown node, or a cycle.
    pub fn parse(dsl: &str) -> Result<(WorkflowDsl, Dag), DslError> {
        let workflow: WorkflowDsl = serde_yaml::from_str(dsl).map_err(|e| DslError::Yaml {
            message: e.to_string(),
        })?;
        let dag = Self::from_workflow(&workflow)?;
        Ok((workflow, dag))
    }

    /// Derives the DAG from an already-parsed workflow document.
    ///
    /// # Errors
    ///
    /// Fails on an empty node list, a missing or duplicate node id, an
    /// edge naming an unknown node, or a cycle.
    pub fn from_workflow(workflow: &WorkflowDsl) -> Result<Dag, DslError> {
        if workflow.nodes.is_empty() {
            return Err(DslError::NoNodes);
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut order = Vec::with_capacity(workflow.nodes.len());

        for (i, node) in workflow.nodes.iter().enumerate() {
            if node.id.is_empty() {
                return Err(DslError::MissingNodeId { index: i });
            }
            if index.contains_key(&node.id) {
                return Err(DslError::DuplicateNodeId {
                    node_id: node.id.clone(),
                });
            }
            let idx = graph.add_node(node.clone());
            index.insert(node.id.clone(), idx);
            order.push(node.id.clone());
        }

        // Explicit edges, or a linear chain inferred from document order.
        let edges: Vec<EdgeDef> = if workflow.edges.is_empty() {
            order
                .windows(2)
                .map(|pair| EdgeDef {
                    from: pair[0].clone(),
                    to: pair[1].clone(),
                })
                .collect()
        } else {
            workflow.edges.clone()
        };

        let mut deps: HashMap<String, Vec<String>> = HashMap::new();
        let mut successors: HashMap<String, Vec<String>> = HashMap::new();

        for edge in &edges {
            let from_idx = *index
                .get(&edge.from)
                .ok_or_else(|| DslError::UnknownEdgeEndpoint {
                    node_id: edge.from.clone(),
                })?;
            let to_idx = *index
                .get(&edge.to)
                .ok_or_else(|| DslError::UnknownEdgeEndpoint {
                    node_id: edge.to.clone(),
                })?;
            graph.add_edge(from_idx, to_idx, ());
            deps.entry(edge.to.clone()).or_default().push(edge.from.clone());
            successors
                .entry(edge.from.clone())
                .or_default()
                .push(edge.to.clone());
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(DslError::CycleDetected);
        }

        Ok(Dag {
            graph,
            index,
            order,
            edges,
            deps,
            successors,
        })
    }

    /// Returns the node definition for the given id.
    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&NodeDef> {
        let idx = self.index.get(node_id)?;
        self.graph.node_weight(*idx)
    }

    /// Node ids in document order.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Normalized edges, including any inferred linear-chain edges.
    #[must_use]
    pub fn edges(&self) -> &[EdgeDef] {
        &self.edges
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Nodes with no incoming edges, in document order.
    pub fn entry_nodes(&self) -> Vec<&NodeDef> {
        self.order
            .iter()
            .filter(|id| self.dependencies(id).is_empty())
            .filter_map(|id| self.node(id))
            .collect()
    }

    /// Upstream node ids of the given node, in edge-declaration order.
    #[must_use]
    pub fn dependencies(&self, node_id: &str) -> &[String] {
        match self.deps.get(node_id) {
            Some(deps) => deps,
            None => &[],
        }
    }

    /// Downstream node ids of the given node, in edge-declaration order.
    #[must_use]
    pub fn successors(&self, node_id: &str) -> &[String] {
        match self.successors.get(node_id) {
            Some(successors) => successors,
            None => &[],
        }
    }

    /// The first predecessor of a node, used as the default rollback
    /// target on rejection. Returns `None` for entry nodes.
    #[must_use]
    pub fn previous_node(&self, node_id: &str) -> Option<&NodeDef> {
        let deps = self.dependencies(node_id);
        self.node(deps.first()?)
    }

    /// Returns true if the node exists in the graph.
    #[must_use]
    pub fn contains(&self, node_id: &str) -> bool {
        self.index.contains_key(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::NodeKind;

    const LINEAR: &str = r#"
name: three-step
nodes:
  - id: a
    name: A
    type: agent_task
  - id: b
    name: B
    type: agent_task
  - id: c
    name: C
    type: agent_task
"#;

    const FAN_OUT: &str = r#"
name: diamond
nodes:
  - id: a
    type: agent_task
  - id: b
    type: agent_task
  - id: c
    type: agent_task
  - id: d
    type: agent_task
edges:
  - { from: a, to: b }
  - { from: a, to: c }
  - { from: b, to: d }
  - { from: c, to: d }
"#;

    #[test]
    fn linear_chain_inferred_without_edges() {
        let (_, dag) = Dag::parse(LINEAR).expect("parse");
        assert_eq!(dag.node_count(), 3);
        assert_eq!(dag.edges().len(), 2);
        assert_eq!(dag.dependencies("b"), ["a"]);
        assert_eq!(dag.dependencies("c"), ["b"]);
        assert!(dag.dependencies("a").is_empty());
        assert_eq!(dag.successors("a"), ["b"]);
    }

    #[test]
    fn entry_nodes_have_no_dependencies() {
        let (_, dag) = Dag::parse(LINEAR).expect("parse");
        let entries = dag.entry_nodes();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "a");
    }

    #[test]
    fn diamond_edges_resolved() {
        let (_, dag) = Dag::parse(FAN_OUT).expect("parse");
        assert_eq!(dag.dependencies("d"), ["b", "c"]);
        assert_eq!(dag.successors("a"), ["b", "c"]);
        let entries = dag.entry_nodes();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "a");
    }

    #[test]
    fn previous_node_is_first_predecessor() {
        let (_, dag) = Dag::parse(FAN_OUT).expect("parse");
        assert_eq!(dag.previous_node("d").unwrap().id, "b");
        assert!(dag.previous_node("a").is_none());
    }

    #[test]
    fn rejects_empty_workflow() {
        let err = Dag::parse("name: empty\nnodes: []").unwrap_err();
        assert_eq!(err, DslError::NoNodes);
    }

    #[test]
    fn rejects_duplicate_node_id() {
        let yaml = r#"
nodes:
  - id: a
    type: agent_task
  - id: a
    type: agent_task
"#;
        let err = Dag::parse(yaml).unwrap_err();
        assert_eq!(
            err,
            DslError::DuplicateNodeId {
                node_id: "a".to_string()
            }
        );
    }

    #[test]
    fn rejects_unknown_edge_endpoint() {
        let yaml = r#"
nodes:
  - id: a
    type: agent_task
edges:
  - { from: a, to: ghost }
"#;
        let err = Dag::parse(yaml).unwrap_err();
        assert_eq!(
            err,
            DslError::UnknownEdgeEndpoint {
                node_id: "ghost".to_string()
            }
        );
    }

    #[test]
    fn rejects_cycle() {
        let yaml = r#"
nodes:
  - id: a
    type: agent_task
  - id: b
    type: agent_task
edges:
  - { from: a, to: b }
  - { from: b, to: a }
"#;
        let err = Dag::parse(yaml).unwrap_err();
        assert_eq!(err, DslError::CycleDetected);
    }

    #[test]
    fn node_lookup_carries_definition() {
        let (_, dag) = Dag::parse(LINEAR).expect("parse");
        let node = dag.node("b").expect("node b");
        assert_eq!(node.name, "B");
        assert_eq!(node.kind, NodeKind::AgentTask);
        assert!(dag.node("missing").is_none());
    }
}

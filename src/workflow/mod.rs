// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Workflow definitions: nodes, edges, and load-time validation.
//!
//! A workflow is a directed graph of typed nodes. Edges either name their
//! target directly or, out of a condition node, map routing-key values to
//! successors. Definitions are validated when the engine is built: endpoints
//! must exist, at most one edge may leave a node, conditional edges may only
//! leave condition nodes, and the graph must be acyclic once conditional
//! edges are collapsed to all their targets.

pub mod engine;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_WORKFLOW_ITERATIONS;
use crate::error::{Error, Result};

/// Terminal node sentinel.
pub const END: &str = "__end__";

/// The kind of a workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Runs a named agent's loop over the current state.
    Agent,
    /// Invokes a named tool with arguments from the state metadata.
    Tool,
    /// Routes by the state's routing key; executes nothing.
    Condition,
    /// Checkpoints with `awaiting_human` and halts.
    Human,
}

/// One workflow node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    /// Node kind.
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Agent binding, for agent nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Tool binding, for tool nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Checkpoint and halt before executing this node.
    #[serde(default)]
    pub interrupt_before: bool,
}

impl NodeDef {
    /// An agent node.
    #[must_use]
    pub fn agent(agent: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Agent,
            agent: Some(agent.into()),
            tool: None,
            interrupt_before: false,
        }
    }

    /// A tool node.
    #[must_use]
    pub fn tool(tool: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Tool,
            agent: None,
            tool: Some(tool.into()),
            interrupt_before: false,
        }
    }

    /// A condition node.
    #[must_use]
    pub fn condition() -> Self {
        Self {
            kind: NodeKind::Condition,
            agent: None,
            tool: None,
            interrupt_before: false,
        }
    }

    /// A human node.
    #[must_use]
    pub fn human() -> Self {
        Self {
            kind: NodeKind::Human,
            agent: None,
            tool: None,
            interrupt_before: false,
        }
    }

    /// Mark the node interrupt-before.
    #[must_use]
    pub fn with_interrupt_before(mut self) -> Self {
        self.interrupt_before = true;
        self
    }
}

/// Where an edge leads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EdgeTarget {
    /// Always taken.
    Direct(String),
    /// Routing-key value to successor, for condition nodes.
    Conditional(BTreeMap<String, String>),
}

/// One edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDef {
    /// Source node.
    pub from: String,
    /// Target node or conditional routing table.
    pub to: EdgeTarget,
}

impl EdgeDef {
    /// A direct edge.
    #[must_use]
    pub fn direct(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: EdgeTarget::Direct(to.into()),
        }
    }

    /// A conditional edge.
    #[must_use]
    pub fn conditional(from: impl Into<String>, routes: BTreeMap<String, String>) -> Self {
        Self {
            from: from.into(),
            to: EdgeTarget::Conditional(routes),
        }
    }
}

/// A composed execution pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier.
    pub name: String,
    /// Named nodes.
    pub nodes: BTreeMap<String, NodeDef>,
    /// Edges between nodes.
    pub edges: Vec<EdgeDef>,
    /// Starting node.
    pub entry_point: String,
    /// Checkpoint-eligible nodes (in addition to per-node flags).
    #[serde(default)]
    pub checkpoints: BTreeSet<String>,
    /// Global iteration cap.
    #[serde(default = "default_workflow_iterations")]
    pub max_iterations: u32,
}

fn default_workflow_iterations() -> u32 {
    DEFAULT_WORKFLOW_ITERATIONS
}

impl WorkflowDefinition {
    /// An empty workflow with an entry point.
    #[must_use]
    pub fn new(name: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            entry_point: entry_point.into(),
            checkpoints: BTreeSet::new(),
            max_iterations: DEFAULT_WORKFLOW_ITERATIONS,
        }
    }

    /// Add a node.
    #[must_use]
    pub fn with_node(mut self, name: impl Into<String>, node: NodeDef) -> Self {
        self.nodes.insert(name.into(), node);
        self
    }

    /// Add an edge.
    #[must_use]
    pub fn with_edge(mut self, edge: EdgeDef) -> Self {
        self.edges.push(edge);
        self
    }

    /// Add a node to the checkpoint set.
    #[must_use]
    pub fn with_checkpoint(mut self, node: impl Into<String>) -> Self {
        self.checkpoints.insert(node.into());
        self
    }

    /// Set the iteration cap.
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// The single outgoing edge of a node, if any.
    #[must_use]
    pub fn outgoing(&self, node: &str) -> Option<&EdgeDef> {
        self.edges.iter().find(|edge| edge.from == node)
    }

    /// Whether execution must checkpoint and halt before this node.
    #[must_use]
    pub fn should_interrupt(&self, name: &str) -> bool {
        self.checkpoints.contains(name)
            || self
                .nodes
                .get(name)
                .is_some_and(|node| node.interrupt_before || node.kind == NodeKind::Human)
    }

    /// Validate structure. Called by the engine at build time.
    pub fn validate(&self) -> Result<()> {
        if !self.nodes.contains_key(&self.entry_point) {
            return Err(Error::WorkflowValidation(format!(
                "entry point '{}' not found in nodes",
                self.entry_point
            )));
        }

        let mut edges_per_node: HashMap<&str, usize> = HashMap::new();
        for edge in &self.edges {
            let Some(source) = self.nodes.get(&edge.from) else {
                return Err(Error::WorkflowValidation(format!(
                    "edge source '{}' not found in nodes",
                    edge.from
                )));
            };
            *edges_per_node.entry(edge.from.as_str()).or_default() += 1;

            match &edge.to {
                EdgeTarget::Direct(to) => {
                    if to != END && !self.nodes.contains_key(to) {
                        return Err(Error::WorkflowValidation(format!(
                            "edge target '{to}' not found in nodes"
                        )));
                    }
                }
                EdgeTarget::Conditional(routes) => {
                    if source.kind != NodeKind::Condition {
                        return Err(Error::WorkflowValidation(format!(
                            "conditional edge out of non-condition node '{}'",
                            edge.from
                        )));
                    }
                    if routes.is_empty() {
                        return Err(Error::WorkflowValidation(format!(
                            "conditional edge out of '{}' has no routes",
                            edge.from
                        )));
                    }
                    for to in routes.values() {
                        if to != END && !self.nodes.contains_key(to) {
                            return Err(Error::WorkflowValidation(format!(
                                "edge target '{to}' not found in nodes"
                            )));
                        }
                    }
                }
            }
        }

        // At most one edge may apply per step.
        if let Some((node, count)) = edges_per_node.iter().find(|(_, count)| **count > 1) {
            return Err(Error::WorkflowValidation(format!(
                "node '{node}' has {count} outgoing edges; at most one may apply per step"
            )));
        }

        for (name, node) in &self.nodes {
            match node.kind {
                NodeKind::Agent if node.agent.is_none() => {
                    return Err(Error::WorkflowValidation(format!(
                        "agent node '{name}' has no agent binding"
                    )));
                }
                NodeKind::Tool if node.tool.is_none() => {
                    return Err(Error::WorkflowValidation(format!(
                        "tool node '{name}' has no tool binding"
                    )));
                }
                _ => {}
            }
        }

        for checkpoint in &self.checkpoints {
            if !self.nodes.contains_key(checkpoint) {
                return Err(Error::WorkflowValidation(format!(
                    "checkpoint node '{checkpoint}' not found in nodes"
                )));
            }
        }

        self.check_acyclic()
    }

    /// Kahn's algorithm over the graph with conditional edges collapsed to
    /// all their targets.
    fn check_acyclic(&self) -> Result<()> {
        let names: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        let index: HashMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (*n, i)).collect();

        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); names.len()];
        let mut indegree = vec![0usize; names.len()];
        for edge in &self.edges {
            let from = index[edge.from.as_str()];
            let targets: Vec<&str> = match &edge.to {
                EdgeTarget::Direct(to) => vec![to.as_str()],
                EdgeTarget::Conditional(routes) => routes.values().map(String::as_str).collect(),
            };
            for to in targets {
                if to == END {
                    continue;
                }
                let to = index[to];
                adjacency[from].push(to);
                indegree[to] += 1;
            }
        }

        let mut queue: VecDeque<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut visited = 0;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for &next in &adjacency[node] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if visited == names.len() {
            Ok(())
        } else {
            let cycle: Vec<&str> = indegree
                .iter()
                .enumerate()
                .filter(|(_, d)| **d > 0)
                .map(|(i, _)| names[i])
                .collect();
            Err(Error::CycleDetected {
                path: cycle.join(" -> "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::new("linear", "plan")
            .with_node("plan", NodeDef::agent("planner"))
            .with_node("act", NodeDef::agent("actor"))
            .with_edge(EdgeDef::direct("plan", "act"))
            .with_edge(EdgeDef::direct("act", END))
    }

    #[test]
    fn valid_linear_workflow() {
        linear().validate().unwrap();
    }

    #[test]
    fn missing_entry_point_is_rejected() {
        let workflow = WorkflowDefinition::new("w", "absent")
            .with_node("plan", NodeDef::agent("planner"));
        let err = workflow.validate().unwrap_err();
        assert!(matches!(err, Error::WorkflowValidation(_)));
    }

    #[test]
    fn dangling_edge_target_is_rejected() {
        let workflow = WorkflowDefinition::new("w", "plan")
            .with_node("plan", NodeDef::agent("planner"))
            .with_edge(EdgeDef::direct("plan", "ghost"));
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn two_edges_from_one_node_are_rejected() {
        let workflow = linear()
            .with_edge(EdgeDef::direct("plan", END));
        let err = workflow.validate().unwrap_err();
        assert!(err.to_string().contains("at most one"));
    }

    #[test]
    fn conditional_edge_requires_condition_node() {
        let workflow = WorkflowDefinition::new("w", "plan")
            .with_node("plan", NodeDef::agent("planner"))
            .with_node("a", NodeDef::agent("x"))
            .with_edge(EdgeDef::conditional(
                "plan",
                BTreeMap::from([("yes".to_string(), "a".to_string())]),
            ));
        let err = workflow.validate().unwrap_err();
        assert!(err.to_string().contains("non-condition"));
    }

    #[test]
    fn cycles_are_detected_with_conditionals_collapsed() {
        let workflow = WorkflowDefinition::new("w", "check")
            .with_node("check", NodeDef::condition())
            .with_node("work", NodeDef::agent("worker"))
            .with_edge(EdgeDef::conditional(
                "check",
                BTreeMap::from([
                    ("more".to_string(), "work".to_string()),
                    ("done".to_string(), END.to_string()),
                ]),
            ))
            .with_edge(EdgeDef::direct("work", "check"));
        let err = workflow.validate().unwrap_err();
        assert!(matches!(err, Error::CycleDetected { .. }));
    }

    #[test]
    fn unbound_agent_node_is_rejected() {
        let workflow = WorkflowDefinition::new("w", "n").with_node(
            "n",
            NodeDef {
                kind: NodeKind::Agent,
                agent: None,
                tool: None,
                interrupt_before: false,
            },
        );
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn unknown_checkpoint_node_is_rejected() {
        let workflow = linear().with_checkpoint("ghost");
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn interrupts_cover_flags_sets_and_human_nodes() {
        let workflow = WorkflowDefinition::new("w", "a")
            .with_node("a", NodeDef::agent("x").with_interrupt_before())
            .with_node("b", NodeDef::agent("y"))
            .with_node("h", NodeDef::human())
            .with_checkpoint("b");
        assert!(workflow.should_interrupt("a"));
        assert!(workflow.should_interrupt("b"));
        assert!(workflow.should_interrupt("h"));
        assert!(!workflow.should_interrupt("ghost"));
    }

    #[test]
    fn definition_round_trips_through_json() {
        let workflow = linear().with_checkpoint("act");
        let json = serde_json::to_string(&workflow).unwrap();
        let restored: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(workflow, restored);
    }

    #[test]
    fn edge_target_json_shapes() {
        let direct: EdgeTarget = serde_json::from_str("\"act\"").unwrap();
        assert_eq!(direct, EdgeTarget::Direct("act".to_string()));
        let conditional: EdgeTarget =
            serde_json::from_str(r#"{"approve": "act", "reject": "__end__"}"#).unwrap();
        assert!(matches!(conditional, EdgeTarget::Conditional(_)));
    }
}

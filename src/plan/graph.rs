//! Executable plan graphs.
//!
//! A plan is a directed graph of typed blocks with `success`/`failure`
//! edges. Graphs are validated structurally at load and again before
//! execution; unknown block types or malformed parameters never reach
//! the executor.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::navigation::pathfinder::TransitionStep;
use crate::navigation::unified::UnifiedGraph;

/// Block types a plan node can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Start,
    Success,
    Failure,
    Navigation,
    Action,
    Verification,
    Sleep,
    SetVariable,
    EvaluateCondition,
    Loop,
    Subgraph,
}

impl BlockKind {
    /// Terminal blocks end the walk and decide the overall result.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Blocks that can fail and therefore want a failure branch.
    pub fn is_fallible(&self) -> bool {
        matches!(
            self,
            Self::Navigation
                | Self::Action
                | Self::Verification
                | Self::SetVariable
                | Self::EvaluateCondition
                | Self::Loop
                | Self::Subgraph
        )
    }

    /// Lowercase prefix used in labels and generated node ids.
    pub fn label_prefix(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Navigation => "navigation",
            Self::Action => "action",
            Self::Verification => "verification",
            Self::Sleep => "sleep",
            Self::SetVariable => "set_variable",
            Self::EvaluateCondition => "evaluate_condition",
            Self::Loop => "loop",
            Self::Subgraph => "subgraph",
        }
    }
}

/// Which outgoing edge a block follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeHandle {
    Success,
    Failure,
}

/// Canvas position, carried for UI round-trips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Per-block payload. Field presence depends on the block kind; the
/// structural validator enforces the pairing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    /// Navigation: target label and resolved id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<String>,
    /// Navigation: pre-expanded transitions from the pathfinder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transitions: Option<Vec<TransitionStep>>,
    /// Action: command + params + settle delay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    /// Sleep
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Set-variable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_expr: Option<String>,
    /// Evaluate-condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operand_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_operand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_operand: Option<String>,
    /// Loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    /// Loop / subgraph body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Box<PlanGraph>>,
}

/// A plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BlockKind,
    #[serde(default)]
    pub position: Position,
    pub data: NodeData,
}

/// A directed edge with its source handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "sourceHandle")]
    pub source_handle: EdgeHandle,
    #[serde(rename = "type", default = "default_edge_type")]
    pub edge_type: String,
}

fn default_edge_type() -> String {
    "default".to_string()
}

/// The executable artifact: nodes plus success/failure wiring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanGraph {
    pub nodes: Vec<PlanNode>,
    pub edges: Vec<PlanEdge>,
}

static TERMINAL_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(START|SUCCESS|FAILURE)$").expect("invalid regex"));

static NUMBERED_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(navigation|action|verification|sleep|set_variable|evaluate_condition|loop|subgraph)_([1-9][0-9]*):(.+)$",
    )
    .expect("invalid regex")
});

/// Build the canonical label for a block.
pub fn make_label(kind: BlockKind, n: usize, target: &str) -> String {
    match kind {
        BlockKind::Start => "START".to_string(),
        BlockKind::Success => "SUCCESS".to_string(),
        BlockKind::Failure => "FAILURE".to_string(),
        _ => format!("{}_{}:{}", kind.label_prefix(), n, target),
    }
}

/// Check a label against the grammar for its block kind.
pub fn label_matches(kind: BlockKind, label: &str) -> bool {
    match kind {
        BlockKind::Start => label == "START",
        BlockKind::Success => label == "SUCCESS",
        BlockKind::Failure => label == "FAILURE",
        _ => NUMBERED_LABEL
            .captures(label)
            .map(|c| &c[1] == kind.label_prefix())
            .unwrap_or(false),
    }
}

/// Regex for any valid label, exported for property tests.
pub fn label_grammar() -> (&'static Regex, &'static Regex) {
    (&TERMINAL_LABEL, &NUMBERED_LABEL)
}

impl PlanGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The unique start node, if the graph has exactly one.
    pub fn start_node(&self) -> Option<&PlanNode> {
        let mut starts = self.nodes.iter().filter(|n| n.kind == BlockKind::Start);
        match (starts.next(), starts.next()) {
            (Some(node), None) => Some(node),
            _ => None,
        }
    }

    /// The outgoing edge of `node_id` with the given handle, if any.
    pub fn outgoing(&self, node_id: &str, handle: EdgeHandle) -> Option<&PlanEdge> {
        self.edges
            .iter()
            .find(|e| e.source == node_id && e.source_handle == handle)
    }

    /// All navigation nodes, in graph order.
    pub fn navigation_nodes(&self) -> impl Iterator<Item = &PlanNode> {
        self.nodes
            .iter()
            .filter(|n| n.kind == BlockKind::Navigation)
    }

    /// Structural validation: one start, a terminal, wired edges,
    /// label grammar, per-kind parameters, numbered labels increasing
    /// per type. Returns every defect, not just the first.
    pub fn validate(&self) -> Result<()> {
        let defects = self.collect_defects();
        if defects.is_empty() {
            Ok(())
        } else {
            Err(Error::invalid_input(defects.join("; ")))
        }
    }

    fn collect_defects(&self) -> Vec<String> {
        let mut defects = Vec::new();

        let start_count = self
            .nodes
            .iter()
            .filter(|n| n.kind == BlockKind::Start)
            .count();
        if start_count != 1 {
            defects.push(format!("expected exactly one start node, found {}", start_count));
        }

        if !self.nodes.iter().any(|n| n.kind.is_terminal()) {
            defects.push("graph has no success or failure terminal".to_string());
        }

        let mut ids = HashMap::new();
        for node in &self.nodes {
            if ids.insert(node.id.as_str(), ()).is_some() {
                defects.push(format!("duplicate node id {}", node.id));
            }
        }

        for edge in &self.edges {
            if !ids.contains_key(edge.source.as_str()) {
                defects.push(format!("edge {} has unknown source {}", edge.id, edge.source));
            }
            if !ids.contains_key(edge.target.as_str()) {
                defects.push(format!("edge {} has unknown target {}", edge.id, edge.target));
            }
        }

        // Non-start, non-terminal nodes must be wired in.
        for node in &self.nodes {
            if node.kind == BlockKind::Start || node.kind.is_terminal() {
                continue;
            }
            let has_incoming = self.edges.iter().any(|e| e.target == node.id);
            if !has_incoming {
                defects.push(format!("dangling node {}", node.id));
            }
        }

        // Labels: grammar plus per-type monotonic numbering.
        let mut last_number: HashMap<&'static str, u64> = HashMap::new();
        for node in &self.nodes {
            if !label_matches(node.kind, &node.data.label) {
                defects.push(format!(
                    "node {} label {:?} violates the label grammar",
                    node.id, node.data.label
                ));
                continue;
            }
            if let Some(captures) = NUMBERED_LABEL.captures(&node.data.label) {
                let n: u64 = captures[2].parse().unwrap_or(0);
                let prefix = node.kind.label_prefix();
                let last = last_number.entry(prefix).or_insert(0);
                if n <= *last {
                    defects.push(format!(
                        "label numbering for {} does not increase at node {}",
                        prefix, node.id
                    ));
                }
                *last = n;
            }
        }

        for node in &self.nodes {
            defects.extend(self.block_param_defects(node));
        }

        defects
    }

    fn block_param_defects(&self, node: &PlanNode) -> Vec<String> {
        let mut defects = Vec::new();
        let missing = |field: &str| format!("node {} missing {}", node.id, field);
        let data = &node.data;

        match node.kind {
            BlockKind::Navigation => {
                if data.target_node.is_none() {
                    defects.push(missing("target_node"));
                }
            }
            BlockKind::Action => {
                if data.command.is_none() {
                    defects.push(missing("command"));
                }
            }
            BlockKind::Verification => {
                if data.verification_type.is_none() {
                    defects.push(missing("verification_type"));
                }
            }
            BlockKind::Sleep => {
                if data.duration_ms.is_none() {
                    defects.push(missing("duration_ms"));
                }
            }
            BlockKind::SetVariable => {
                if data.name.is_none() {
                    defects.push(missing("name"));
                }
                if data.value_expr.is_none() {
                    defects.push(missing("value_expr"));
                }
            }
            BlockKind::EvaluateCondition => {
                for (field, present) in [
                    ("operand_type", data.operand_type.is_some()),
                    ("condition", data.condition.is_some()),
                    ("left_operand", data.left_operand.is_some()),
                    ("right_operand", data.right_operand.is_some()),
                ] {
                    if !present {
                        defects.push(missing(field));
                    }
                }
            }
            BlockKind::Loop => {
                if data.iterations.is_none() {
                    defects.push(missing("iterations"));
                }
                if data.body.is_none() {
                    defects.push(missing("body"));
                }
            }
            BlockKind::Subgraph => {
                if data.body.is_none() {
                    defects.push(missing("body"));
                }
            }
            BlockKind::Start | BlockKind::Success | BlockKind::Failure => {}
        }
        defects
    }

    /// Check every navigation target against the current unified graph.
    /// Returns the offending targets (empty means the plan is safe).
    pub fn unknown_navigation_targets(&self, graph: &UnifiedGraph) -> Vec<String> {
        let mut unknown = Vec::new();
        for node in self.navigation_nodes() {
            if let Some(target) = &node.data.target_node {
                if !graph.contains(target) {
                    unknown.push(target.clone());
                }
            }
        }
        // Nested bodies of loop/subgraph blocks may navigate too.
        for node in &self.nodes {
            if matches!(node.kind, BlockKind::Loop | BlockKind::Subgraph) {
                if let Some(body) = &node.data.body {
                    unknown.extend(body.unknown_navigation_targets(graph));
                }
            }
        }
        unknown
    }
}

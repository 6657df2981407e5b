//! Navigation tree model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One concrete device action on an edge (key press, ADB command, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeAction {
    pub command: String,
    #[serde(default)]
    pub params: Value,
    /// Settle delay after the action, in milliseconds
    #[serde(default)]
    pub delay_ms: u64,
}

impl EdgeAction {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            params: Value::Null,
            delay_ms: 0,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

/// A labelled screen or state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavNode {
    pub node_id: String,
    pub label: String,
    /// Nested subtree this node belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtree: Option<String>,
}

impl NavNode {
    pub fn new(node_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            label: label.into(),
            subtree: None,
        }
    }

    pub fn in_subtree(mut self, subtree: impl Into<String>) -> Self {
        self.subtree = Some(subtree.into());
        self
    }
}

/// A directed transition carrying ordered actions and optional reverse
/// actions. Edges may cross subtree boundaries; they carry no special
/// kind for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavEdge {
    pub edge_id: String,
    pub source: String,
    pub target: String,
    pub actions: Vec<EdgeAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reverse_actions: Vec<EdgeAction>,
}

/// A directed graph of screens and transitions, unique per
/// (team, interface).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NavigationTree {
    pub tree_id: String,
    /// The user interface this tree describes
    pub interface: String,
    /// Device model the interface is pinned to
    pub device_model: String,
    /// Entry node; defaults to the first inserted node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_node_id: Option<String>,
    pub nodes: Vec<NavNode>,
    pub edges: Vec<NavEdge>,
}

impl NavigationTree {
    pub fn new(
        tree_id: impl Into<String>,
        interface: impl Into<String>,
        device_model: impl Into<String>,
    ) -> Self {
        Self {
            tree_id: tree_id.into(),
            interface: interface.into(),
            device_model: device_model.into(),
            root_node_id: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Add a node. The first node becomes the root unless one was pinned.
    pub fn add_node(&mut self, node: NavNode) -> &mut Self {
        if self.root_node_id.is_none() && self.nodes.is_empty() {
            self.root_node_id = Some(node.node_id.clone());
        }
        self.nodes.push(node);
        self
    }

    /// Add an edge between existing nodes.
    pub fn add_edge(&mut self, edge: NavEdge) -> &mut Self {
        self.edges.push(edge);
        self
    }

    /// Convenience: add an edge with a single key-press action.
    pub fn connect(
        &mut self,
        edge_id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        actions: Vec<EdgeAction>,
    ) -> &mut Self {
        self.add_edge(NavEdge {
            edge_id: edge_id.into(),
            source: source.into(),
            target: target.into(),
            actions,
            reverse_actions: Vec::new(),
        })
    }

    pub fn node(&self, node_id: &str) -> Option<&NavNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// The entry node id.
    pub fn root(&self) -> Option<&str> {
        self.root_node_id
            .as_deref()
            .or_else(|| self.nodes.first().map(|n| n.node_id.as_str()))
    }
}

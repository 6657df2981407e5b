//! Unified navigation graph.
//!
//! The flattened, index-backed form of a navigation tree: adjacency by
//! node index, lookup by id and by label. Rebuilt whole on invalidation
//! and swapped in behind an `Arc`, so readers never observe a partially
//! built graph; the version number distinguishes rebuilds.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::navigation::tree::{NavEdge, NavNode, NavigationTree};

/// Flattened adjacency structure over a navigation tree.
#[derive(Debug, Clone)]
pub struct UnifiedGraph {
    /// Monotonic rebuild counter for the owning cache slot
    pub version: u64,
    pub interface: String,
    root_index: Option<usize>,
    nodes: Vec<NavNode>,
    edges: Vec<NavEdge>,
    by_id: HashMap<String, usize>,
    by_label: HashMap<String, Vec<usize>>,
    /// Outgoing edge indices per node, in tree insertion order
    adjacency: Vec<Vec<usize>>,
}

impl UnifiedGraph {
    /// Flatten a tree. Node and edge order is preserved, which makes
    /// pathfinding tie-breaks reproducible.
    pub fn build(tree: &NavigationTree, version: u64) -> Result<Self> {
        let mut by_id = HashMap::new();
        let mut by_label: HashMap<String, Vec<usize>> = HashMap::new();

        for (index, node) in tree.nodes.iter().enumerate() {
            if by_id.insert(node.node_id.clone(), index).is_some() {
                return Err(Error::invalid_input(format!(
                    "duplicate node id {} in tree {}",
                    node.node_id, tree.tree_id
                )));
            }
            by_label.entry(node.label.clone()).or_default().push(index);
        }

        let mut adjacency = vec![Vec::new(); tree.nodes.len()];
        for (edge_index, edge) in tree.edges.iter().enumerate() {
            let source = *by_id.get(&edge.source).ok_or_else(|| {
                Error::invalid_input(format!("edge {} references unknown source", edge.edge_id))
            })?;
            if !by_id.contains_key(&edge.target) {
                return Err(Error::invalid_input(format!(
                    "edge {} references unknown target",
                    edge.edge_id
                )));
            }
            adjacency[source].push(edge_index);
        }

        let root_index = tree.root().and_then(|id| by_id.get(id).copied());

        Ok(Self {
            version,
            interface: tree.interface.clone(),
            root_index,
            nodes: tree.nodes.clone(),
            edges: tree.edges.clone(),
            by_id,
            by_label,
            adjacency,
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_at(&self, index: usize) -> &NavNode {
        &self.nodes[index]
    }

    pub fn edge_at(&self, index: usize) -> &NavEdge {
        &self.edges[index]
    }

    /// Outgoing edge indices from a node, insertion-ordered.
    pub fn outgoing(&self, node_index: usize) -> &[usize] {
        &self.adjacency[node_index]
    }

    /// The tree's entry node index.
    pub fn root_index(&self) -> Option<usize> {
        self.root_index
    }

    /// All node labels, insertion-ordered.
    pub fn labels(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.label.clone()).collect()
    }

    /// Whether a node exists by id or unique label.
    pub fn contains(&self, node_ref: &str) -> bool {
        self.by_id.contains_key(node_ref)
            || self
                .by_label
                .get(node_ref)
                .map(|v| !v.is_empty())
                .unwrap_or(false)
    }

    /// Resolve a node reference to an index: ids win over labels, and an
    /// ambiguous label is a hard error here (disambiguation is the plan
    /// builder's job, not the pathfinder's).
    pub fn resolve(&self, node_ref: &str) -> Result<usize> {
        if let Some(index) = self.by_id.get(node_ref) {
            return Ok(*index);
        }
        match self.by_label.get(node_ref).map(|v| v.as_slice()) {
            Some([index]) => Ok(*index),
            Some(indices) if indices.len() > 1 => Err(Error::invalid_input(format!(
                "label {:?} is ambiguous ({} nodes)",
                node_ref,
                indices.len()
            ))),
            _ => Err(Error::not_found("node", node_ref)),
        }
    }
}

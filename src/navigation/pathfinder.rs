//! Shortest-path search with transition pre-expansion.
//!
//! Breadth-first over the unified graph, every edge a weight-1 step,
//! ties broken by insertion order. The result carries the concrete
//! action sequence of every edge so callers can embed it into plans and
//! never touch the tree again at runtime.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::navigation::tree::EdgeAction;
use crate::navigation::unified::UnifiedGraph;

/// One edge of a resolved path with its pre-expanded actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionStep {
    pub edge_id: String,
    pub from_node_id: String,
    pub from_label: String,
    pub to_node_id: String,
    pub to_label: String,
    pub actions: Vec<EdgeAction>,
}

/// An ordered path between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationPath {
    pub steps: Vec<TransitionStep>,
}

impl NavigationPath {
    /// Total number of device actions along the path.
    pub fn action_count(&self) -> usize {
        self.steps.iter().map(|s| s.actions.len()).sum()
    }

    /// Whether source and target were already the same node.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Find the shortest path from `source` (or the tree root when omitted)
/// to `target`. Both ends accept a node id or an unambiguous label.
pub fn find_path(
    graph: &UnifiedGraph,
    source: Option<&str>,
    target: &str,
) -> Result<NavigationPath> {
    let target_index = graph.resolve(target)?;
    let source_index = match source {
        Some(node_ref) => graph.resolve(node_ref)?,
        None => graph
            .root_index()
            .ok_or_else(|| Error::invalid_input("navigation tree has no nodes"))?,
    };

    if source_index == target_index {
        return Ok(NavigationPath { steps: Vec::new() });
    }

    // BFS with per-node predecessor edge; first visit wins, so insertion
    // order decides between equal-length paths.
    let mut predecessor: Vec<Option<usize>> = vec![None; graph.node_count()];
    let mut visited = vec![false; graph.node_count()];
    let mut queue = VecDeque::new();
    visited[source_index] = true;
    queue.push_back(source_index);

    'search: while let Some(current) = queue.pop_front() {
        for &edge_index in graph.outgoing(current) {
            let edge = graph.edge_at(edge_index);
            let next = graph.resolve(&edge.target)?;
            if visited[next] {
                continue;
            }
            visited[next] = true;
            predecessor[next] = Some(edge_index);
            if next == target_index {
                break 'search;
            }
            queue.push_back(next);
        }
    }

    if predecessor[target_index].is_none() {
        let from = graph.node_at(source_index).label.clone();
        let to = graph.node_at(target_index).label.clone();
        return Err(Error::Unreachable { from, to });
    }

    // Walk predecessors back to the source, then reverse.
    let mut steps = Vec::new();
    let mut cursor = target_index;
    while cursor != source_index {
        let edge_index = predecessor[cursor]
            .ok_or_else(|| Error::Internal("broken predecessor chain".into()))?;
        let edge = graph.edge_at(edge_index);
        let from_index = graph.resolve(&edge.source)?;
        let from = graph.node_at(from_index);
        let to = graph.node_at(cursor);
        steps.push(TransitionStep {
            edge_id: edge.edge_id.clone(),
            from_node_id: from.node_id.clone(),
            from_label: from.label.clone(),
            to_node_id: to.node_id.clone(),
            to_label: to.label.clone(),
            actions: edge.actions.clone(),
        });
        cursor = from_index;
    }
    steps.reverse();

    Ok(NavigationPath { steps })
}

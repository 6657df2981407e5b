//! Graph assembly from parsed steps.
//!
//! Deterministic construction: stable node ids, canonical labels,
//! success edges chaining consecutive steps, one shared failure
//! terminal fed by every fallible block. When the intent detected a
//! loop, the scoped range (everything from the first non-navigation
//! step) is compiled into a nested body graph under a `loop` block.

use crate::plan::graph::{
    make_label, BlockKind, EdgeHandle, NodeData, PlanEdge, PlanGraph, PlanNode, Position,
};
use crate::plan::intent::IntentPatterns;
use crate::plan::parser::PlanStep;

#[derive(Default)]
struct Counters {
    navigation: usize,
    action: usize,
    verification: usize,
    sleep: usize,
    looped: usize,
}

struct Assembly {
    graph: PlanGraph,
    counters: Counters,
    edge_seq: usize,
    failure_seq: usize,
    column: usize,
}

impl Assembly {
    fn new() -> Self {
        Self {
            graph: PlanGraph::new(),
            counters: Counters::default(),
            edge_seq: 0,
            failure_seq: 0,
            column: 0,
        }
    }

    fn position(&mut self) -> Position {
        let position = Position {
            x: self.column as f64 * 200.0,
            y: 0.0,
        };
        self.column += 1;
        position
    }

    fn push_node(&mut self, id: impl Into<String>, kind: BlockKind, data: NodeData) -> String {
        let id = id.into();
        let position = self.position();
        self.graph.nodes.push(PlanNode {
            id: id.clone(),
            kind,
            position,
            data,
        });
        id
    }

    fn chain(&mut self, source: &str, target: &str) {
        self.edge_seq += 1;
        self.graph.edges.push(PlanEdge {
            id: format!("e{}", self.edge_seq),
            source: source.to_string(),
            target: target.to_string(),
            source_handle: EdgeHandle::Success,
            edge_type: "default".to_string(),
        });
    }

    fn fail_to(&mut self, source: &str, failure_id: &str) {
        self.failure_seq += 1;
        self.graph.edges.push(PlanEdge {
            id: format!("f{}", self.failure_seq),
            source: source.to_string(),
            target: failure_id.to_string(),
            source_handle: EdgeHandle::Failure,
            edge_type: "default".to_string(),
        });
    }

    fn step_node(&mut self, step: &PlanStep) -> String {
        match step {
            PlanStep::Navigate { target } => {
                self.counters.navigation += 1;
                let n = self.counters.navigation;
                self.push_node(
                    format!("nav{}", n),
                    BlockKind::Navigation,
                    NodeData {
                        label: make_label(BlockKind::Navigation, n, target),
                        action_type: Some("navigation".to_string()),
                        target_node: Some(target.clone()),
                        ..NodeData::default()
                    },
                )
            }
            PlanStep::Action {
                command,
                description: _,
            } => {
                self.counters.action += 1;
                let n = self.counters.action;
                self.push_node(
                    format!("act{}", n),
                    BlockKind::Action,
                    NodeData {
                        label: make_label(BlockKind::Action, n, command),
                        action_type: Some("action".to_string()),
                        command: Some(command.clone()),
                        ..NodeData::default()
                    },
                )
            }
            PlanStep::Verify { verification_type } => {
                self.counters.verification += 1;
                let n = self.counters.verification;
                self.push_node(
                    format!("verify{}", n),
                    BlockKind::Verification,
                    NodeData {
                        label: make_label(BlockKind::Verification, n, verification_type),
                        verification_type: Some(verification_type.clone()),
                        ..NodeData::default()
                    },
                )
            }
            PlanStep::Sleep { duration_ms } => {
                self.counters.sleep += 1;
                let n = self.counters.sleep;
                self.push_node(
                    format!("sleep{}", n),
                    BlockKind::Sleep,
                    NodeData {
                        label: make_label(BlockKind::Sleep, n, &duration_ms.to_string()),
                        duration_ms: Some(*duration_ms),
                        ..NodeData::default()
                    },
                )
            }
        }
    }
}

fn step_is_fallible(step: &PlanStep) -> bool {
    !matches!(step, PlanStep::Sleep { .. })
}

/// Compile a flat step sequence into a graph (no loop wrapping).
fn assemble_sequence(steps: &[PlanStep]) -> PlanGraph {
    let mut assembly = Assembly::new();
    let start = assembly.push_node(
        "start",
        BlockKind::Start,
        NodeData {
            label: "START".to_string(),
            ..NodeData::default()
        },
    );

    let needs_failure = steps.iter().any(step_is_fallible);
    let mut fallible_nodes = Vec::new();
    let mut cursor = start;

    for step in steps {
        let node_id = assembly.step_node(step);
        assembly.chain(&cursor, &node_id);
        if step_is_fallible(step) {
            fallible_nodes.push(node_id.clone());
        }
        cursor = node_id;
    }

    let success = assembly.push_node(
        "success",
        BlockKind::Success,
        NodeData {
            label: "SUCCESS".to_string(),
            ..NodeData::default()
        },
    );
    assembly.chain(&cursor, &success);

    if needs_failure {
        let failure = assembly.push_node(
            "failure",
            BlockKind::Failure,
            NodeData {
                label: "FAILURE".to_string(),
                ..NodeData::default()
            },
        );
        for node_id in fallible_nodes {
            assembly.fail_to(&node_id, &failure);
        }
    }

    assembly.graph
}

/// Assemble a plan graph from parsed steps and the detected patterns.
pub fn assemble(steps: &[PlanStep], patterns: &IntentPatterns) -> PlanGraph {
    if !patterns.has_loop {
        return assemble_sequence(steps);
    }

    // Loop scope: leading navigations stay outside; everything from the
    // first non-navigation step becomes the body. A pure-navigation
    // prompt loops over all its steps.
    let split = steps
        .iter()
        .position(|s| !matches!(s, PlanStep::Navigate { .. }))
        .unwrap_or(0);
    let (outside, body_steps) = steps.split_at(split);
    if body_steps.is_empty() {
        return assemble_sequence(steps);
    }

    let body = assemble_sequence(body_steps);
    let iterations = patterns.loop_count.unwrap_or(1);

    let mut assembly = Assembly::new();
    let start = assembly.push_node(
        "start",
        BlockKind::Start,
        NodeData {
            label: "START".to_string(),
            ..NodeData::default()
        },
    );

    let mut fallible_nodes = Vec::new();
    let mut cursor = start;
    for step in outside {
        let node_id = assembly.step_node(step);
        assembly.chain(&cursor, &node_id);
        if step_is_fallible(step) {
            fallible_nodes.push(node_id.clone());
        }
        cursor = node_id;
    }

    assembly.counters.looped += 1;
    let n = assembly.counters.looped;
    let loop_id = assembly.push_node(
        format!("loop{}", n),
        BlockKind::Loop,
        NodeData {
            label: make_label(BlockKind::Loop, n, &iterations.to_string()),
            iterations: Some(iterations),
            body: Some(Box::new(body)),
            ..NodeData::default()
        },
    );
    assembly.chain(&cursor, &loop_id);
    fallible_nodes.push(loop_id.clone());

    let success = assembly.push_node(
        "success",
        BlockKind::Success,
        NodeData {
            label: "SUCCESS".to_string(),
            ..NodeData::default()
        },
    );
    assembly.chain(&loop_id, &success);

    let failure = assembly.push_node(
        "failure",
        BlockKind::Failure,
        NodeData {
            label: "FAILURE".to_string(),
            ..NodeData::default()
        },
    );
    for node_id in fallible_nodes {
        assembly.fail_to(&node_id, &failure);
    }

    assembly.graph
}

/// The trivial plan emitted by the exact-match short circuit:
/// start → navigation chain → success, nothing else.
pub fn trivial_navigation_plan(targets: &[String]) -> PlanGraph {
    let mut assembly = Assembly::new();
    let start = assembly.push_node(
        "start",
        BlockKind::Start,
        NodeData {
            label: "START".to_string(),
            ..NodeData::default()
        },
    );

    let mut cursor = start;
    for target in targets {
        let step = PlanStep::Navigate {
            target: target.clone(),
        };
        let node_id = assembly.step_node(&step);
        assembly.chain(&cursor, &node_id);
        cursor = node_id;
    }

    let success = assembly.push_node(
        "success",
        BlockKind::Success,
        NodeData {
            label: "SUCCESS".to_string(),
            ..NodeData::default()
        },
    );
    assembly.chain(&cursor, &success);

    assembly.graph
}

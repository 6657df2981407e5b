//! Plan post-processing.
//!
//! Two passes over an assembled graph: label enforcement rewrites every
//! label into the canonical grammar no matter what the LLM produced,
//! and target validation checks each navigation target against the
//! unified graph, auto-correcting through the fuzzy matcher or
//! surfacing a disambiguation request. A third pass pre-fetches the
//! transitions of every navigation block so the executor never touches
//! the tree.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::navigation::pathfinder::find_path;
use crate::navigation::unified::UnifiedGraph;
use crate::plan::fuzzy::{classify, FuzzyOutcome};
use crate::plan::graph::{make_label, BlockKind, PlanGraph};

/// One unresolved navigation target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ambiguity {
    pub original: String,
    pub suggestions: Vec<String>,
}

/// Outcome of navigation-target validation.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetValidation {
    Valid,
    NeedsDisambiguation(Vec<Ambiguity>),
}

/// Rewrite every label (including nested bodies) to the canonical form.
pub fn enforce_labels(graph: &mut PlanGraph) {
    let mut navigation = 0;
    let mut action = 0;
    let mut verification = 0;
    let mut sleep = 0;
    let mut set_variable = 0;
    let mut evaluate = 0;
    let mut looped = 0;
    let mut subgraph = 0;

    for node in &mut graph.nodes {
        let data = &mut node.data;
        data.label = match node.kind {
            BlockKind::Start => "START".to_string(),
            BlockKind::Success => "SUCCESS".to_string(),
            BlockKind::Failure => "FAILURE".to_string(),
            BlockKind::Navigation => {
                navigation += 1;
                let target = data.target_node.clone().unwrap_or_default();
                make_label(node.kind, navigation, &target)
            }
            BlockKind::Action => {
                action += 1;
                let command = data.command.clone().unwrap_or_default();
                make_label(node.kind, action, &command)
            }
            BlockKind::Verification => {
                verification += 1;
                let vtype = data.verification_type.clone().unwrap_or_default();
                make_label(node.kind, verification, &vtype)
            }
            BlockKind::Sleep => {
                sleep += 1;
                let duration = data.duration_ms.unwrap_or_default().to_string();
                make_label(node.kind, sleep, &duration)
            }
            BlockKind::SetVariable => {
                set_variable += 1;
                let name = data.name.clone().unwrap_or_default();
                make_label(node.kind, set_variable, &name)
            }
            BlockKind::EvaluateCondition => {
                evaluate += 1;
                let condition = data.condition.clone().unwrap_or_default();
                make_label(node.kind, evaluate, &condition)
            }
            BlockKind::Loop => {
                looped += 1;
                let iterations = data.iterations.unwrap_or_default().to_string();
                make_label(node.kind, looped, &iterations)
            }
            BlockKind::Subgraph => {
                subgraph += 1;
                make_label(node.kind, subgraph, "nested")
            }
        };

        if let Some(body) = data.body.as_mut() {
            enforce_labels(body);
        }
    }
}

/// Validate every navigation target against the unified graph,
/// substituting single fuzzy candidates silently. The plan never leaves
/// this stage referencing a node the graph does not know.
pub fn validate_targets(
    graph: &mut PlanGraph,
    unified: &UnifiedGraph,
    fuzzy_threshold: f64,
) -> TargetValidation {
    let labels = unified.labels();
    let mut ambiguities = Vec::new();
    validate_targets_inner(graph, unified, &labels, fuzzy_threshold, &mut ambiguities);
    if ambiguities.is_empty() {
        TargetValidation::Valid
    } else {
        TargetValidation::NeedsDisambiguation(ambiguities)
    }
}

fn validate_targets_inner(
    graph: &mut PlanGraph,
    unified: &UnifiedGraph,
    labels: &[String],
    fuzzy_threshold: f64,
    ambiguities: &mut Vec<Ambiguity>,
) {
    for node in &mut graph.nodes {
        if node.kind == BlockKind::Navigation {
            let Some(target) = node.data.target_node.clone() else {
                continue;
            };
            if let Ok(index) = unified.resolve(&target) {
                node.data.target_node_id = Some(unified.node_at(index).node_id.clone());
                continue;
            }
            match classify(&target, labels, fuzzy_threshold) {
                FuzzyOutcome::AutoCorrect(corrected) => {
                    tracing::debug!(original = %target, corrected = %corrected, "fuzzy-corrected navigation target");
                    if let Ok(index) = unified.resolve(&corrected) {
                        node.data.target_node_id = Some(unified.node_at(index).node_id.clone());
                    }
                    node.data.target_node = Some(corrected);
                }
                FuzzyOutcome::Disambiguate(suggestions) => {
                    ambiguities.push(Ambiguity {
                        original: target,
                        suggestions,
                    });
                }
                FuzzyOutcome::PassThrough => {
                    ambiguities.push(Ambiguity {
                        original: target,
                        suggestions: Vec::new(),
                    });
                }
            }
        }

        if let Some(body) = node.data.body.as_mut() {
            validate_targets_inner(body, unified, labels, fuzzy_threshold, ambiguities);
        }
    }
}

/// Embed pathfinder transitions into every navigation block, walking
/// the straight-line success order so each hop starts where the
/// previous one ended (the first starts at the tree root).
pub fn prefetch_transitions(graph: &mut PlanGraph, unified: &UnifiedGraph) -> Result<()> {
    let mut location: Option<String> = None;
    prefetch_inner(graph, unified, &mut location)
}

fn prefetch_inner(
    graph: &mut PlanGraph,
    unified: &UnifiedGraph,
    location: &mut Option<String>,
) -> Result<()> {
    for node in &mut graph.nodes {
        if node.kind == BlockKind::Navigation {
            let target = node
                .data
                .target_node
                .clone()
                .unwrap_or_default();
            let path = find_path(unified, location.as_deref(), &target)?;
            let target_index = unified.resolve(&target)?;
            let target_id = unified.node_at(target_index).node_id.clone();
            node.data.target_node_id = Some(target_id.clone());
            node.data.transitions = Some(path.steps);
            *location = Some(target_id);
        }
        if let Some(body) = node.data.body.as_mut() {
            prefetch_inner(body, unified, location)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigation::tree::{EdgeAction, NavNode, NavigationTree};
    use crate::plan::assemble::assemble;
    use crate::plan::intent::IntentPatterns;
    use crate::plan::parser::PlanStep;

    fn unified() -> UnifiedGraph {
        let mut tree = NavigationTree::new("t1", "tv_ui", "android_tv");
        tree.add_node(NavNode::new("n_home", "home"))
            .add_node(NavNode::new("n_live_tv", "live_tv"))
            .add_node(NavNode::new("n_live_radio", "live_radio"))
            .add_node(NavNode::new("n_settings", "settings"));
        tree.connect(
            "e1",
            "n_home",
            "n_live_tv",
            vec![EdgeAction::new("press_key:RIGHT")],
        );
        tree.connect(
            "e2",
            "n_home",
            "n_settings",
            vec![EdgeAction::new("press_key:DOWN")],
        );
        tree.connect(
            "e3",
            "n_home",
            "n_live_radio",
            vec![EdgeAction::new("press_key:LEFT")],
        );
        UnifiedGraph::build(&tree, 1).unwrap()
    }

    fn nav_plan(target: &str) -> PlanGraph {
        assemble(
            &[PlanStep::Navigate {
                target: target.to_string(),
            }],
            &IntentPatterns::default(),
        )
    }

    #[test]
    fn test_enforce_labels_rewrites_everything() {
        let mut graph = nav_plan("home");
        graph.nodes[1].data.label = "Go to the home screen".to_string();
        enforce_labels(&mut graph);
        assert_eq!(graph.nodes[1].data.label, "navigation_1:home");
        graph.validate().unwrap();
    }

    #[test]
    fn test_valid_target_resolves_id() {
        let unified = unified();
        let mut graph = nav_plan("settings");
        let outcome = validate_targets(&mut graph, &unified, 0.75);
        assert_eq!(outcome, TargetValidation::Valid);
        assert_eq!(
            graph.nodes[1].data.target_node_id.as_deref(),
            Some("n_settings")
        );
    }

    #[test]
    fn test_typo_silently_corrected() {
        let unified = unified();
        let mut graph = nav_plan("setings");
        let outcome = validate_targets(&mut graph, &unified, 0.75);
        assert_eq!(outcome, TargetValidation::Valid);
        assert_eq!(graph.nodes[1].data.target_node.as_deref(), Some("settings"));
    }

    #[test]
    fn test_ambiguous_target_surfaces_disambiguation() {
        let unified = unified();
        let mut graph = nav_plan("live");
        match validate_targets(&mut graph, &unified, 0.75) {
            TargetValidation::NeedsDisambiguation(ambiguities) => {
                assert_eq!(ambiguities.len(), 1);
                assert_eq!(ambiguities[0].original, "live");
                assert_eq!(ambiguities[0].suggestions, vec!["live_tv", "live_radio"]);
            }
            other => panic!("expected disambiguation, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_target_reported_without_suggestions() {
        let unified = unified();
        let mut graph = nav_plan("podcast_library");
        match validate_targets(&mut graph, &unified, 0.75) {
            TargetValidation::NeedsDisambiguation(ambiguities) => {
                assert!(ambiguities[0].suggestions.is_empty());
            }
            other => panic!("expected disambiguation, got {:?}", other),
        }
    }

    #[test]
    fn test_prefetch_embeds_transitions() {
        let unified = unified();
        let mut graph = nav_plan("live_tv");
        prefetch_transitions(&mut graph, &unified).unwrap();

        let transitions = graph.nodes[1].data.transitions.as_ref().unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].edge_id, "e1");
        assert_eq!(transitions[0].actions[0].command, "press_key:RIGHT");
    }

    #[test]
    fn test_prefetch_chains_locations() {
        let unified = unified();
        let steps = vec![
            PlanStep::Navigate {
                target: "settings".to_string(),
            },
            PlanStep::Navigate {
                target: "settings".to_string(),
            },
        ];
        let mut graph = assemble(&steps, &IntentPatterns::default());
        prefetch_transitions(&mut graph, &unified).unwrap();

        // Second hop starts where the first ended: empty path.
        let second = graph.nodes[2].data.transitions.as_ref().unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_prefetch_unreachable_fails() {
        let mut tree = NavigationTree::new("t1", "tv_ui", "android_tv");
        tree.add_node(NavNode::new("n_home", "home"))
            .add_node(NavNode::new("n_island", "island"));
        let unified = UnifiedGraph::build(&tree, 1).unwrap();

        let mut graph = nav_plan("island");
        assert!(prefetch_transitions(&mut graph, &unified).is_err());
    }
}

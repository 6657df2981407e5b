//! The block & graph executor.
//!
//! Walks a validated plan graph one block at a time on the owning
//! device worker. After each block the unique outgoing edge of the
//! required handle is followed; a missing edge terminates the
//! execution as failed with "unreachable branch". Cancellation is
//! checked between blocks and inside every suspension point.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::adapters::{ActionExecutor, CancelToken, VerificationExecutor};
use crate::error::{Error, Result};
use crate::execution::record::ExecutionRecord;
use crate::execution::variables::{
    evaluate_condition, OperandType, VariableMap, LAST_VERIFICATION,
};
use crate::plan::graph::{BlockKind, EdgeHandle, PlanGraph, PlanNode};

/// Executor tunables.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Hard cap on executed blocks per graph walk, a cycle backstop
    pub block_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { block_limit: 10_000 }
    }
}

/// Everything a graph walk needs from its surroundings.
pub struct ExecutionEnv {
    pub actions: Arc<dyn ActionExecutor>,
    pub verifier: Arc<dyn VerificationExecutor>,
    pub cancel: CancelToken,
    pub record: Arc<std::sync::RwLock<ExecutionRecord>>,
}

impl ExecutionEnv {
    pub fn log(&self, line: impl Into<String>) {
        if let Ok(mut record) = self.record.write() {
            record.log(line);
        }
    }

    fn set_progress(&self, progress: u8) {
        if let Ok(mut record) = self.record.write() {
            record.set_progress(progress);
        }
    }
}

/// Overall result of a graph walk.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub success: bool,
    pub error_msg: Option<String>,
}

impl Verdict {
    fn ok() -> Self {
        Self {
            success: true,
            error_msg: None,
        }
    }

    fn failed(error_msg: impl Into<String>) -> Self {
        Self {
            success: false,
            error_msg: Some(error_msg.into()),
        }
    }
}

struct BlockResult {
    ok: bool,
    detail: String,
}

impl BlockResult {
    fn ok(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    fn failed(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Execute a plan graph to a terminal verdict.
///
/// Errors are reserved for cancellation and malformed plans; an
/// ordinary block failure follows the failure edge instead.
pub async fn run_graph(
    graph: &PlanGraph,
    env: &ExecutionEnv,
    vars: &mut VariableMap,
    config: &ExecutorConfig,
) -> Result<Verdict> {
    graph.validate()?;

    let start = graph
        .start_node()
        .ok_or_else(|| Error::invalid_input("graph has no unique start node"))?;
    let total = graph.nodes.len().max(1);
    let mut current = start.id.clone();
    let mut executed = 0usize;
    let mut last_error: Option<String> = None;

    loop {
        if env.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if executed > config.block_limit {
            return Err(Error::Internal(format!(
                "block limit {} exceeded",
                config.block_limit
            )));
        }

        let node = graph
            .node(&current)
            .ok_or_else(|| Error::Internal(format!("walk reached unknown node {}", current)))?;

        match node.kind {
            BlockKind::Success => return Ok(Verdict::ok()),
            BlockKind::Failure => {
                return Ok(Verdict {
                    success: false,
                    error_msg: last_error.or_else(|| Some("reached failure terminal".to_string())),
                });
            }
            _ => {}
        }

        let result = execute_block(node, graph, env, vars, config).await?;
        executed += 1;
        env.set_progress(((executed * 100 / total) as u8).min(99));

        if !result.ok {
            env.log(format!("[{}] failed: {}", node.data.label, result.detail));
            last_error = Some(result.detail.clone());
        } else if !result.detail.is_empty() {
            env.log(format!("[{}] {}", node.data.label, result.detail));
        }

        let handle = if result.ok {
            EdgeHandle::Success
        } else {
            EdgeHandle::Failure
        };
        match graph.outgoing(&node.id, handle) {
            Some(edge) => current = edge.target.clone(),
            None => {
                return Ok(Verdict::failed("unreachable branch"));
            }
        }
    }
}

async fn execute_block(
    node: &PlanNode,
    _graph: &PlanGraph,
    env: &ExecutionEnv,
    vars: &mut VariableMap,
    config: &ExecutorConfig,
) -> Result<BlockResult> {
    let data = &node.data;
    match node.kind {
        BlockKind::Start => Ok(BlockResult::ok("")),
        BlockKind::Success | BlockKind::Failure => Ok(BlockResult::ok("")),

        BlockKind::Navigation => {
            let transitions = data.transitions.as_ref().ok_or_else(|| {
                Error::invalid_input(format!(
                    "navigation block {} has no pre-fetched transitions",
                    node.id
                ))
            })?;
            for step in transitions {
                for action in &step.actions {
                    let outcome = run_action(
                        env,
                        vars,
                        &action.command,
                        &action.params,
                        action.delay_ms,
                    )
                    .await?;
                    if !outcome.0 {
                        return Ok(BlockResult::failed(format!(
                            "transition {} ({} -> {}): {}",
                            step.edge_id, step.from_label, step.to_label, outcome.1
                        )));
                    }
                }
            }
            Ok(BlockResult::ok(format!(
                "arrived at {}",
                data.target_node.as_deref().unwrap_or("?")
            )))
        }

        BlockKind::Action => {
            let command = data
                .command
                .as_deref()
                .ok_or_else(|| Error::invalid_input("action block without command"))?;
            let params = data.params.clone().unwrap_or(Value::Null);
            let delay = data.delay_ms.unwrap_or(0);
            match run_action(env, vars, command, &params, delay).await {
                Ok((true, output)) => Ok(BlockResult::ok(output)),
                Ok((false, error)) => Ok(BlockResult::failed(error)),
                Err(Error::InvalidInput(msg)) => Ok(BlockResult::failed(msg)),
                Err(e) => Err(e),
            }
        }

        BlockKind::Verification => {
            let verification_type = data
                .verification_type
                .as_deref()
                .ok_or_else(|| Error::invalid_input("verification block without type"))?;
            let params = match &data.params {
                Some(p) => match vars.substitute_value(p) {
                    Ok(p) => p,
                    Err(e) => return Ok(BlockResult::failed(e.to_string())),
                },
                None => Value::Null,
            };
            let outcome = env
                .verifier
                .verify(
                    verification_type,
                    &params,
                    data.expected.as_ref(),
                    &env.cancel,
                )
                .await?;
            vars.set(LAST_VERIFICATION, outcome.observed.clone());
            if outcome.passed {
                Ok(BlockResult::ok(format!(
                    "{} passed ({})",
                    verification_type, outcome.observed
                )))
            } else {
                Ok(BlockResult::failed(format!(
                    "{} failed ({})",
                    verification_type,
                    outcome
                        .error
                        .unwrap_or_else(|| outcome.observed.to_string())
                )))
            }
        }

        BlockKind::Sleep => {
            let duration_ms = data
                .duration_ms
                .ok_or_else(|| Error::invalid_input("sleep block without duration_ms"))?;
            if !env.cancel.sleep(duration_ms).await {
                return Err(Error::Cancelled);
            }
            Ok(BlockResult::ok(format!("slept {}ms", duration_ms)))
        }

        BlockKind::SetVariable => {
            let name = data
                .name
                .as_deref()
                .ok_or_else(|| Error::invalid_input("set_variable block without name"))?;
            let expr = data
                .value_expr
                .as_deref()
                .ok_or_else(|| Error::invalid_input("set_variable block without value_expr"))?;
            let rendered = match vars.substitute(expr) {
                Ok(rendered) => rendered,
                Err(e) => return Ok(BlockResult::failed(e.to_string())),
            };
            let value = serde_json::from_str(&rendered).unwrap_or(Value::String(rendered));
            vars.set(name, value);
            Ok(BlockResult::ok(format!("{} set", name)))
        }

        BlockKind::EvaluateCondition => {
            let operand_type = data
                .operand_type
                .as_deref()
                .ok_or_else(|| Error::invalid_input("evaluate_condition without operand_type"))?;
            let condition = data
                .condition
                .as_deref()
                .ok_or_else(|| Error::invalid_input("evaluate_condition without condition"))?;
            let left = data.left_operand.as_deref().unwrap_or_default();
            let right = data.right_operand.as_deref().unwrap_or_default();

            let resolved = (|| -> Result<bool> {
                let operand_type = OperandType::parse(operand_type)?;
                let left = vars.substitute(left)?;
                let right = vars.substitute(right)?;
                evaluate_condition(operand_type, condition, &left, &right)
            })();

            match resolved {
                Ok(result) => {
                    vars.set("result_output", json!(result));
                    vars.set("result_success", json!(true));
                    vars.set("error_msg", json!(""));
                    // The boolean drives the branch.
                    if result {
                        Ok(BlockResult::ok("condition true"))
                    } else {
                        Ok(BlockResult::failed("condition false"))
                    }
                }
                Err(e) => {
                    vars.set("result_output", Value::Null);
                    vars.set("result_success", json!(false));
                    vars.set("error_msg", json!(e.to_string()));
                    Ok(BlockResult::failed(e.to_string()))
                }
            }
        }

        BlockKind::Loop => {
            let iterations = data
                .iterations
                .ok_or_else(|| Error::invalid_input("loop block without iterations"))?;
            let body = data
                .body
                .as_ref()
                .ok_or_else(|| Error::invalid_input("loop block without body"))?;
            for iteration in 0..iterations {
                let verdict = Box::pin(run_graph(body, env, vars, config)).await?;
                if !verdict.success {
                    return Ok(BlockResult::failed(format!(
                        "iteration {}/{}: {}",
                        iteration + 1,
                        iterations,
                        verdict.error_msg.unwrap_or_default()
                    )));
                }
            }
            Ok(BlockResult::ok(format!("{} iterations", iterations)))
        }

        BlockKind::Subgraph => {
            let body = data
                .body
                .as_ref()
                .ok_or_else(|| Error::invalid_input("subgraph block without body"))?;
            let verdict = Box::pin(run_graph(body, env, vars, config)).await?;
            if verdict.success {
                Ok(BlockResult::ok("subgraph completed"))
            } else {
                Ok(BlockResult::failed(
                    verdict.error_msg.unwrap_or_else(|| "subgraph failed".to_string()),
                ))
            }
        }
    }
}

/// Run one device action with variable substitution applied to the
/// command and every string parameter.
async fn run_action(
    env: &ExecutionEnv,
    vars: &VariableMap,
    command: &str,
    params: &Value,
    delay_ms: u64,
) -> Result<(bool, String)> {
    let command = vars.substitute(command)?;
    let params = vars.substitute_value(params)?;
    let outcome = env
        .actions
        .execute(&command, &params, delay_ms, &env.cancel)
        .await?;
    if outcome.success {
        Ok((true, outcome.output))
    } else {
        Ok((
            false,
            outcome
                .error
                .unwrap_or_else(|| format!("{} failed", command)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ScriptedActionExecutor, ScriptedVerifier};
    use crate::execution::record::{ExecutionRecord, OperationKind};
    use crate::plan::assemble::assemble;
    use crate::plan::graph::{NodeData, PlanEdge, PlanNode, Position};
    use crate::plan::intent::IntentPatterns;
    use crate::plan::parser::PlanStep;
    use crate::registry::DeviceKey;

    fn env() -> (ExecutionEnv, Arc<ScriptedActionExecutor>, Arc<ScriptedVerifier>) {
        let actions = Arc::new(ScriptedActionExecutor::new());
        let verifier = Arc::new(ScriptedVerifier::new());
        let record = Arc::new(std::sync::RwLock::new(ExecutionRecord::new(
            OperationKind::BlockSequence,
            DeviceKey::new("host1", "device1"),
        )));
        (
            ExecutionEnv {
                actions: actions.clone(),
                verifier: verifier.clone(),
                cancel: CancelToken::new(),
                record,
            },
            actions,
            verifier,
        )
    }

    fn steps_graph(steps: Vec<PlanStep>) -> PlanGraph {
        assemble(&steps, &IntentPatterns::default())
    }

    #[tokio::test]
    async fn test_action_sequence_success() {
        let (env, actions, _) = env();
        let graph = steps_graph(vec![
            PlanStep::Action {
                command: "press_key:UP".to_string(),
                description: None,
            },
            PlanStep::Action {
                command: "press_key:OK".to_string(),
                description: None,
            },
        ]);

        let mut vars = VariableMap::new();
        let verdict = run_graph(&graph, &env, &mut vars, &ExecutorConfig::default())
            .await
            .unwrap();
        assert!(verdict.success);
        assert_eq!(actions.executed(), vec!["press_key:UP", "press_key:OK"]);
    }

    #[tokio::test]
    async fn test_verification_failure_takes_failure_branch() {
        let (env, _, verifier) = env();
        verifier.set_verdict("check_audio", false);

        let graph = steps_graph(vec![
            PlanStep::Verify {
                verification_type: "check_audio".to_string(),
            },
            PlanStep::Action {
                command: "press_key:OK".to_string(),
                description: None,
            },
        ]);

        let mut vars = VariableMap::new();
        let verdict = run_graph(&graph, &env, &mut vars, &ExecutorConfig::default())
            .await
            .unwrap();
        assert!(!verdict.success);
        assert!(verdict.error_msg.unwrap().contains("check_audio"));
    }

    #[tokio::test]
    async fn test_failing_block_without_failure_edge_is_unreachable_branch() {
        let (env, actions, _) = env();
        actions.fail_command("press_key:OK", "remote not responding");

        // Build a graph whose action has no failure edge.
        let mut graph = steps_graph(vec![PlanStep::Action {
            command: "press_key:OK".to_string(),
            description: None,
        }]);
        graph.edges.retain(|e| e.source_handle == EdgeHandle::Success);

        let mut vars = VariableMap::new();
        let verdict = run_graph(&graph, &env, &mut vars, &ExecutorConfig::default())
            .await
            .unwrap();
        assert!(!verdict.success);
        assert_eq!(verdict.error_msg.as_deref(), Some("unreachable branch"));
    }

    #[tokio::test]
    async fn test_loop_zero_iterations_follows_success() {
        let (env, actions, _) = env();

        let patterns = IntentPatterns {
            has_loop: true,
            loop_count: Some(0),
            has_sequence: false,
            has_conditional: false,
        };
        let graph = assemble(
            &[PlanStep::Action {
                command: "zap".to_string(),
                description: None,
            }],
            &patterns,
        );

        let mut vars = VariableMap::new();
        let verdict = run_graph(&graph, &env, &mut vars, &ExecutorConfig::default())
            .await
            .unwrap();
        assert!(verdict.success);
        // Zero iterations: the body never ran.
        assert!(actions.executed().is_empty());
    }

    #[tokio::test]
    async fn test_loop_runs_body_n_times() {
        let (env, actions, _) = env();

        let patterns = IntentPatterns {
            has_loop: true,
            loop_count: Some(3),
            has_sequence: true,
            has_conditional: false,
        };
        let graph = assemble(
            &[PlanStep::Action {
                command: "zap".to_string(),
                description: None,
            }],
            &patterns,
        );

        let mut vars = VariableMap::new();
        let verdict = run_graph(&graph, &env, &mut vars, &ExecutorConfig::default())
            .await
            .unwrap();
        assert!(verdict.success);
        assert_eq!(actions.executed(), vec!["zap", "zap", "zap"]);
    }

    #[tokio::test]
    async fn test_sleep_cancellation() {
        let (env, _, _) = env();
        let cancel = env.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let graph = steps_graph(vec![
            PlanStep::Sleep {
                duration_ms: 10_000,
            },
            PlanStep::Action {
                command: "press_key:OK".to_string(),
                description: None,
            },
        ]);

        let mut vars = VariableMap::new();
        let started = std::time::Instant::now();
        let err = run_graph(&graph, &env, &mut vars, &ExecutorConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_subsequent_blocks_never_run_after_cancel() {
        let (env, actions, _) = env();
        env.cancel.cancel();

        let graph = steps_graph(vec![PlanStep::Action {
            command: "press_key:OK".to_string(),
            description: None,
        }]);

        let mut vars = VariableMap::new();
        let err = run_graph(&graph, &env, &mut vars, &ExecutorConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(actions.executed().is_empty());
    }

    fn condition_graph(left: &str, condition: &str, right: &str) -> PlanGraph {
        // start -> set x -> evaluate -> success, failure on false.
        let node = |id: &str, kind: BlockKind, data: NodeData| PlanNode {
            id: id.to_string(),
            kind,
            position: Position::default(),
            data,
        };
        let edge = |id: &str, source: &str, target: &str, handle: EdgeHandle| PlanEdge {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            source_handle: handle,
            edge_type: "default".to_string(),
        };
        PlanGraph {
            nodes: vec![
                node(
                    "start",
                    BlockKind::Start,
                    NodeData {
                        label: "START".to_string(),
                        ..NodeData::default()
                    },
                ),
                node(
                    "set1",
                    BlockKind::SetVariable,
                    NodeData {
                        label: "set_variable_1:x".to_string(),
                        name: Some("x".to_string()),
                        value_expr: Some("5".to_string()),
                        ..NodeData::default()
                    },
                ),
                node(
                    "cond1",
                    BlockKind::EvaluateCondition,
                    NodeData {
                        label: format!("evaluate_condition_1:{}", condition),
                        operand_type: Some("int".to_string()),
                        condition: Some(condition.to_string()),
                        left_operand: Some(left.to_string()),
                        right_operand: Some(right.to_string()),
                        ..NodeData::default()
                    },
                ),
                node(
                    "success",
                    BlockKind::Success,
                    NodeData {
                        label: "SUCCESS".to_string(),
                        ..NodeData::default()
                    },
                ),
                node(
                    "failure",
                    BlockKind::Failure,
                    NodeData {
                        label: "FAILURE".to_string(),
                        ..NodeData::default()
                    },
                ),
            ],
            edges: vec![
                edge("e1", "start", "set1", EdgeHandle::Success),
                edge("e2", "set1", "cond1", EdgeHandle::Success),
                edge("e3", "cond1", "success", EdgeHandle::Success),
                edge("f1", "cond1", "failure", EdgeHandle::Failure),
                edge("f2", "set1", "failure", EdgeHandle::Failure),
            ],
        }
    }

    #[tokio::test]
    async fn test_condition_true_branch() {
        let (env, _, _) = env();
        let graph = condition_graph("{x}", "<", "10");

        let mut vars = VariableMap::new();
        let verdict = run_graph(&graph, &env, &mut vars, &ExecutorConfig::default())
            .await
            .unwrap();
        assert!(verdict.success);
        assert_eq!(vars.get("result_output"), Some(&json!(true)));
        assert_eq!(vars.get("result_success"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_condition_false_branch() {
        let (env, _, _) = env();
        let graph = condition_graph("{x}", ">", "10");

        let mut vars = VariableMap::new();
        let verdict = run_graph(&graph, &env, &mut vars, &ExecutorConfig::default())
            .await
            .unwrap();
        assert!(!verdict.success);
        assert_eq!(vars.get("result_output"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn test_unresolved_variable_fails_block() {
        let (env, _, _) = env();
        let graph = condition_graph("{ghost}", "<", "10");

        let mut vars = VariableMap::new();
        let verdict = run_graph(&graph, &env, &mut vars, &ExecutorConfig::default())
            .await
            .unwrap();
        assert!(!verdict.success);
        assert_eq!(vars.get("result_success"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn test_verification_output_feeds_condition() {
        let (env, _, _) = env();

        // Verification writes last_verification; a condition reads it.
        let mut graph = condition_graph("{last_verification}", "==", "0");
        graph.nodes[1] = PlanNode {
            id: "set1".to_string(),
            kind: BlockKind::Verification,
            position: Position::default(),
            data: NodeData {
                label: "verification_1:check_audio".to_string(),
                verification_type: Some("check_audio".to_string()),
                ..NodeData::default()
            },
        };
        // Condition compares strings instead.
        graph.nodes[2].data.operand_type = Some("str".to_string());
        graph.nodes[2].data.condition = Some("contains".to_string());
        graph.nodes[2].data.left_operand = Some("{last_verification}".to_string());
        graph.nodes[2].data.right_operand = Some("check_audio".to_string());
        graph.nodes[2].data.label = "evaluate_condition_1:contains".to_string();

        let mut vars = VariableMap::new();
        let verdict = run_graph(&graph, &env, &mut vars, &ExecutorConfig::default())
            .await
            .unwrap();
        assert!(verdict.success);
    }

    #[tokio::test]
    async fn test_progress_and_logs_recorded() {
        let (env, _, _) = env();
        let graph = steps_graph(vec![PlanStep::Action {
            command: "press_key:OK".to_string(),
            description: None,
        }]);

        let mut vars = VariableMap::new();
        run_graph(&graph, &env, &mut vars, &ExecutorConfig::default())
            .await
            .unwrap();

        let record = env.record.read().unwrap();
        assert!(record.progress > 0);
        assert!(!record.logs.is_empty());
    }
}

//! Per-device workers.
//!
//! Every device owns exactly one worker task fed by a bounded FIFO
//! mailbox. The worker runs one execution record at a time to a
//! terminal state, which is the only concurrency guarantee clients may
//! assume: same-device executions serialize, different devices run in
//! parallel.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::adapters::{
    ActionExecutor, CancelToken, ScreenCapture, VerificationExecutor,
};
use crate::error::{Error, ErrorKind, Result};
use crate::execution::executor::{run_graph, ExecutionEnv, ExecutorConfig, Verdict};
use crate::execution::record::ExecutionRecord;
use crate::execution::variables::VariableMap;
use crate::navigation::pathfinder::TransitionStep;
use crate::persistence::{tables, Persistence};
use crate::plan::graph::PlanGraph;
use crate::registry::DeviceKey;

/// A device with its capability adapters, owned by the host process.
#[derive(Clone)]
pub struct DeviceHandle {
    pub key: DeviceKey,
    pub actions: Arc<dyn ActionExecutor>,
    pub verifier: Arc<dyn VerificationExecutor>,
    pub capture: Arc<dyn ScreenCapture>,
}

/// One action of a batch submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub command: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub delay_ms: u64,
}

/// One verification of a batch submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub verification_type: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
}

/// What a queued execution actually does.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Primary action sequence with optional recovery and cleanup
    /// companions.
    ActionBatch {
        actions: Vec<ActionRequest>,
        #[serde(default)]
        retry_actions: Vec<ActionRequest>,
        #[serde(default)]
        failure_actions: Vec<ActionRequest>,
    },
    /// Pre-expanded navigation to a target node.
    Navigation {
        target: String,
        transitions: Vec<TransitionStep>,
    },
    /// A batch of verifications; all must pass.
    Verification {
        verifications: Vec<VerificationRequest>,
    },
    /// A full plan graph.
    Graph { graph: PlanGraph },
}

/// A job queued on a device mailbox.
pub struct QueuedJob {
    pub record: Arc<std::sync::RwLock<ExecutionRecord>>,
    pub cancel: CancelToken,
    pub payload: JobPayload,
    /// Hard cap for this execution
    pub max_duration: Duration,
}

/// Spawn the worker task for a device. The worker exits when the
/// mailbox closes.
pub fn spawn_worker(
    handle: DeviceHandle,
    mut mailbox: mpsc::Receiver<QueuedJob>,
    config: ExecutorConfig,
    history: Option<Arc<dyn Persistence>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = mailbox.recv().await {
            run_job(&handle, job, &config, history.as_deref()).await;
        }
        tracing::debug!(device = %handle.key, "device worker stopped");
    })
}

async fn run_job(
    handle: &DeviceHandle,
    job: QueuedJob,
    config: &ExecutorConfig,
    history: Option<&dyn Persistence>,
) {
    let execution_id = {
        let mut record = job.record.write().expect("record lock poisoned");
        if job.cancel.is_cancelled() {
            record.cancel();
            return;
        }
        record.transition(crate::execution::record::ExecutionStatus::Running);
        record.execution_id
    };
    tracing::info!(execution = %execution_id, device = %handle.key, "execution started");

    let env = ExecutionEnv {
        actions: handle.actions.clone(),
        verifier: handle.verifier.clone(),
        cancel: job.cancel.clone(),
        record: job.record.clone(),
    };

    let cap = std::time::Duration::from_millis(job.max_duration.num_milliseconds().max(0) as u64);
    let outcome = tokio::time::timeout(cap, run_payload(&job.payload, &env, config)).await;

    {
        let mut record = job.record.write().expect("record lock poisoned");
        match outcome {
            Ok(Ok((verdict, result))) => {
                if verdict.success {
                    record.complete(result);
                } else {
                    // Block-level failure: message only, no taxonomy kind.
                    record.transition(crate::execution::record::ExecutionStatus::Failed);
                    record.result = Some(result);
                    record.error_msg =
                        Some(verdict.error_msg.unwrap_or_else(|| "failed".to_string()));
                }
            }
            Ok(Err(Error::Cancelled)) => record.cancel(),
            Ok(Err(e)) => record.fail(e.kind(), e.to_string()),
            Err(_elapsed) => {
                job.cancel.cancel();
                record.fail(
                    ErrorKind::Timeout,
                    format!("execution cap of {}s exceeded", cap.as_secs()),
                );
            }
        }
    }
    tracing::info!(execution = %execution_id, device = %handle.key, "execution finished");

    if let Some(store) = history {
        let snapshot = {
            let record = job.record.read().expect("record lock poisoned");
            json!(&*record)
        };
        let key = execution_id.to_string();
        if let Err(e) = store
            .upsert(tables::EXECUTION_HISTORY, &[&key], snapshot)
            .await
        {
            tracing::warn!(execution = %execution_id, error = %e, "failed to persist execution history");
        }
    }
}

async fn run_payload(
    payload: &JobPayload,
    env: &ExecutionEnv,
    config: &ExecutorConfig,
) -> Result<(Verdict, Value)> {
    match payload {
        JobPayload::Graph { graph } => {
            let mut vars = VariableMap::new();
            let verdict = run_graph(graph, env, &mut vars, config).await?;
            let result = json!({"success": verdict.success});
            Ok((verdict, result))
        }

        JobPayload::Navigation {
            target,
            transitions,
        } => {
            for step in transitions {
                for action in &step.actions {
                    if env.cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    let outcome = env
                        .actions
                        .execute(&action.command, &action.params, action.delay_ms, &env.cancel)
                        .await?;
                    if !outcome.success {
                        env.log(format!(
                            "navigation to {} failed on edge {}: {}",
                            target,
                            step.edge_id,
                            outcome.error.as_deref().unwrap_or("action failed")
                        ));
                        return Ok((
                            Verdict {
                                success: false,
                                error_msg: outcome.error,
                            },
                            json!({"target": target, "reached": false}),
                        ));
                    }
                }
                env.log(format!("transition {} -> {}", step.from_label, step.to_label));
            }
            Ok((
                Verdict {
                    success: true,
                    error_msg: None,
                },
                json!({"target": target, "reached": true}),
            ))
        }

        JobPayload::ActionBatch {
            actions,
            retry_actions,
            failure_actions,
        } => run_action_batch(actions, retry_actions, failure_actions, env).await,

        JobPayload::Verification { verifications } => {
            let mut results = Vec::new();
            let mut all_passed = true;
            for request in verifications {
                if env.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let outcome = env
                    .verifier
                    .verify(
                        &request.verification_type,
                        &request.params,
                        request.expected.as_ref(),
                        &env.cancel,
                    )
                    .await?;
                env.log(format!(
                    "{}: {}",
                    request.verification_type,
                    if outcome.passed { "passed" } else { "failed" }
                ));
                all_passed &= outcome.passed;
                results.push(json!({
                    "verification_type": request.verification_type,
                    "passed": outcome.passed,
                    "observed": outcome.observed,
                }));
            }
            Ok((
                Verdict {
                    success: all_passed,
                    error_msg: (!all_passed).then(|| "verification batch failed".to_string()),
                },
                json!({"results": results}),
            ))
        }
    }
}

/// Run a batch sequence; stop at the first failure.
async fn run_sequence(
    actions: &[ActionRequest],
    env: &ExecutionEnv,
) -> Result<std::result::Result<usize, String>> {
    for action in actions {
        if env.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let outcome = env
            .actions
            .execute(&action.command, &action.params, action.delay_ms, &env.cancel)
            .await?;
        env.log(format!(
            "{}: {}",
            action.command,
            if outcome.success { "ok" } else { "failed" }
        ));
        if !outcome.success {
            return Ok(Err(format!(
                "{} failed: {}",
                action.command,
                outcome.error.unwrap_or_default()
            )));
        }
    }
    Ok(Ok(actions.len()))
}

async fn run_action_batch(
    actions: &[ActionRequest],
    retry_actions: &[ActionRequest],
    failure_actions: &[ActionRequest],
    env: &ExecutionEnv,
) -> Result<(Verdict, Value)> {
    let primary = run_sequence(actions, env).await?;
    let failure = match primary {
        Ok(count) => {
            return Ok((
                Verdict {
                    success: true,
                    error_msg: None,
                },
                json!({"executed": count, "recovered": false}),
            ));
        }
        Err(message) => message,
    };

    // One replay of the companion sequence on a retryable failure.
    if !retry_actions.is_empty() {
        env.log("primary sequence failed, replaying retry_actions");
        if let Ok(count) = run_sequence(retry_actions, env).await? {
            return Ok((
                Verdict {
                    success: true,
                    error_msg: None,
                },
                json!({"executed": count, "recovered": true}),
            ));
        }
    }

    // Cleanup runs unconditionally after a non-recovered failure; its
    // own failures are logged and ignored.
    if !failure_actions.is_empty() {
        env.log("running failure_actions cleanup");
        let _ = run_sequence(failure_actions, env).await?;
    }

    Ok((
        Verdict {
            success: false,
            error_msg: Some(failure),
        },
        json!({"recovered": false}),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{NullCapture, ScriptedActionExecutor, ScriptedVerifier};
    use crate::execution::record::{ExecutionStatus, OperationKind};

    fn handle() -> (DeviceHandle, Arc<ScriptedActionExecutor>) {
        let actions = Arc::new(ScriptedActionExecutor::new());
        (
            DeviceHandle {
                key: DeviceKey::new("host1", "device1"),
                actions: actions.clone(),
                verifier: Arc::new(ScriptedVerifier::new()),
                capture: Arc::new(NullCapture),
            },
            actions,
        )
    }

    fn action(command: &str) -> ActionRequest {
        ActionRequest {
            command: command.to_string(),
            params: Value::Null,
            delay_ms: 0,
        }
    }

    fn job(payload: JobPayload) -> (QueuedJob, Arc<std::sync::RwLock<ExecutionRecord>>) {
        let record = Arc::new(std::sync::RwLock::new(ExecutionRecord::new(
            OperationKind::ActionBatch,
            DeviceKey::new("host1", "device1"),
        )));
        (
            QueuedJob {
                record: record.clone(),
                cancel: CancelToken::new(),
                payload,
                max_duration: Duration::seconds(30),
            },
            record,
        )
    }

    #[tokio::test]
    async fn test_batch_completes() {
        let (handle, actions) = handle();
        let (job, record) = job(JobPayload::ActionBatch {
            actions: vec![action("press_key:UP"), action("press_key:OK")],
            retry_actions: vec![],
            failure_actions: vec![],
        });

        run_job(&handle, job, &ExecutorConfig::default(), None).await;

        let record = record.read().unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(actions.executed().len(), 2);
        assert_eq!(record.result, Some(json!({"executed": 2, "recovered": false})));
    }

    #[tokio::test]
    async fn test_retry_actions_recover() {
        let (handle, actions) = handle();
        actions.fail_command("launch_app", "not installed");

        let (job, record) = job(JobPayload::ActionBatch {
            actions: vec![action("launch_app")],
            retry_actions: vec![action("press_key:HOME"), action("press_key:OK")],
            failure_actions: vec![action("press_key:BACK")],
        });

        run_job(&handle, job, &ExecutorConfig::default(), None).await;

        let record = record.read().unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.result, Some(json!({"executed": 2, "recovered": true})));
        // Cleanup never ran: the retry recovered.
        assert!(!actions.executed().contains(&"press_key:BACK".to_string()));
    }

    #[tokio::test]
    async fn test_failure_actions_run_after_unrecovered_failure() {
        let (handle, actions) = handle();
        actions.fail_command("launch_app", "not installed");
        actions.fail_command("press_key:HOME", "remote stuck");

        let (job, record) = job(JobPayload::ActionBatch {
            actions: vec![action("launch_app")],
            retry_actions: vec![action("press_key:HOME")],
            failure_actions: vec![action("press_key:BACK")],
        });

        run_job(&handle, job, &ExecutorConfig::default(), None).await;

        let record = record.read().unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.error_msg.as_ref().unwrap().contains("launch_app"));
        // Cleanup ran unconditionally.
        assert!(actions.executed().contains(&"press_key:BACK".to_string()));
    }

    #[tokio::test]
    async fn test_timeout_caps_execution() {
        let (handle, _) = handle();
        let (mut queued, record) = job(JobPayload::ActionBatch {
            actions: vec![ActionRequest {
                command: "press_key:OK".to_string(),
                params: Value::Null,
                delay_ms: 60_000,
            }],
            retry_actions: vec![],
            failure_actions: vec![],
        });
        queued.max_duration = Duration::milliseconds(100);

        run_job(&handle, queued, &ExecutorConfig::default(), None).await;

        let record = record.read().unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.error_kind, Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_pre_cancelled_job_never_runs() {
        let (handle, actions) = handle();
        let (queued, record) = job(JobPayload::ActionBatch {
            actions: vec![action("press_key:OK")],
            retry_actions: vec![],
            failure_actions: vec![],
        });
        queued.cancel.cancel();

        run_job(&handle, queued, &ExecutorConfig::default(), None).await;

        assert_eq!(record.read().unwrap().status, ExecutionStatus::Cancelled);
        assert!(actions.executed().is_empty());
    }

    #[tokio::test]
    async fn test_navigation_payload() {
        let (handle, actions) = handle();
        let (queued, record) = job(JobPayload::Navigation {
            target: "live".to_string(),
            transitions: vec![TransitionStep {
                edge_id: "e1".to_string(),
                from_node_id: "n_home".to_string(),
                from_label: "home".to_string(),
                to_node_id: "n_live".to_string(),
                to_label: "live".to_string(),
                actions: vec![crate::navigation::tree::EdgeAction::new("press_key:RIGHT")],
            }],
        });

        run_job(&handle, queued, &ExecutorConfig::default(), None).await;

        let record = record.read().unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(actions.executed(), vec!["press_key:RIGHT"]);
        assert_eq!(record.result, Some(json!({"target": "live", "reached": true})));
    }

    #[tokio::test]
    async fn test_history_persisted_on_terminal() {
        let (handle, _) = handle();
        let store: Arc<dyn Persistence> =
            Arc::new(crate::persistence::SqliteStore::in_memory().unwrap());
        let (queued, record) = job(JobPayload::ActionBatch {
            actions: vec![action("press_key:OK")],
            retry_actions: vec![],
            failure_actions: vec![],
        });

        run_job(&handle, queued, &ExecutorConfig::default(), Some(store.as_ref())).await;

        let id = record.read().unwrap().execution_id.to_string();
        let stored = store
            .get_by_key(tables::EXECUTION_HISTORY, &[&id])
            .await
            .unwrap();
        assert!(stored.is_some());
    }
}

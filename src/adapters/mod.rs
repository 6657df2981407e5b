//! Capability adapter contracts.
//!
//! The core drives devices through small polymorphic interfaces: action
//! execution (remote keys, ADB, web, desktop), verification, and screen
//! capture. Hosts register concrete implementations per device; the
//! scripted implementations here back tests and dry runs where no
//! hardware is attached.

pub mod llm;

pub use llm::{HttpLlmClient, LlmClient, LlmConfig, ScriptedLlm};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::error::Result;

/// Cooperative cancellation flag shared between a worker and its blocks.
///
/// Cancellation is best-effort: blocks check the flag between steps and
/// long-running adapters receive it so they can abort polling loops.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        // Re-check after registering to close the request/notify race.
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Sleep for `duration_ms`, returning early (false) if cancelled.
    pub async fn sleep(&self, duration_ms: u64) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(duration_ms)) => true,
            _ = self.cancelled() => false,
        }
    }
}

/// Outcome of a single device action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }
}

/// Outcome of a verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub passed: bool,
    /// What the device actually showed (text found, match score, ...)
    pub observed: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerificationOutcome {
    pub fn passed(observed: impl Into<Value>) -> Self {
        Self {
            passed: true,
            observed: observed.into(),
            error: None,
        }
    }

    pub fn failed(observed: impl Into<Value>) -> Self {
        Self {
            passed: false,
            observed: observed.into(),
            error: None,
        }
    }
}

/// Executes device actions (remote keys, ADB commands, web/desktop input).
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Run one command. `delay_ms` is the settle delay after the action;
    /// implementations honour the cancel token during it.
    async fn execute(
        &self,
        command: &str,
        params: &Value,
        delay_ms: u64,
        cancel: &CancelToken,
    ) -> Result<ActionOutcome>;
}

/// Runs verifications against the device's observed state.
#[async_trait]
pub trait VerificationExecutor: Send + Sync {
    async fn verify(
        &self,
        verification_type: &str,
        params: &Value,
        expected: Option<&Value>,
        cancel: &CancelToken,
    ) -> Result<VerificationOutcome>;
}

/// Captures the device screen for vision consumers.
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self) -> Result<Vec<u8>>;
}

/// Scripted action executor: succeeds by default, fails for commands
/// listed as failing, and records every dispatched command in order.
#[derive(Default)]
pub struct ScriptedActionExecutor {
    executed: Mutex<Vec<String>>,
    failing: Mutex<HashMap<String, String>>,
}

impl ScriptedActionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `command` fail with the given error message.
    pub fn fail_command(&self, command: impl Into<String>, error: impl Into<String>) {
        self.failing
            .lock()
            .expect("scripted executor lock")
            .insert(command.into(), error.into());
    }

    /// Clear a previously-registered failure (used to model recoveries).
    pub fn recover_command(&self, command: &str) {
        self.failing
            .lock()
            .expect("scripted executor lock")
            .remove(command);
    }

    /// Commands dispatched so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().expect("scripted executor lock").clone()
    }
}

#[async_trait]
impl ActionExecutor for ScriptedActionExecutor {
    async fn execute(
        &self,
        command: &str,
        _params: &Value,
        delay_ms: u64,
        cancel: &CancelToken,
    ) -> Result<ActionOutcome> {
        self.executed
            .lock()
            .expect("scripted executor lock")
            .push(command.to_string());

        if delay_ms > 0 && !cancel.sleep(delay_ms).await {
            return Ok(ActionOutcome::failed("cancelled during settle delay"));
        }

        let failing = self.failing.lock().expect("scripted executor lock");
        if let Some(error) = failing.get(command) {
            return Ok(ActionOutcome::failed(error.clone()));
        }
        Ok(ActionOutcome::ok(format!("executed {}", command)))
    }
}

/// Scripted verifier: looks up the verdict per verification type,
/// defaulting to pass.
#[derive(Default)]
pub struct ScriptedVerifier {
    verdicts: Mutex<HashMap<String, bool>>,
}

impl ScriptedVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_verdict(&self, verification_type: impl Into<String>, passed: bool) {
        self.verdicts
            .lock()
            .expect("scripted verifier lock")
            .insert(verification_type.into(), passed);
    }
}

#[async_trait]
impl VerificationExecutor for ScriptedVerifier {
    async fn verify(
        &self,
        verification_type: &str,
        _params: &Value,
        _expected: Option<&Value>,
        _cancel: &CancelToken,
    ) -> Result<VerificationOutcome> {
        let verdicts = self.verdicts.lock().expect("scripted verifier lock");
        let passed = verdicts.get(verification_type).copied().unwrap_or(true);
        if passed {
            Ok(VerificationOutcome::passed(format!(
                "{} observed",
                verification_type
            )))
        } else {
            Ok(VerificationOutcome::failed(format!(
                "{} not observed",
                verification_type
            )))
        }
    }
}

/// Screen capture stub returning an empty frame.
#[derive(Default)]
pub struct NullCapture;

#[async_trait]
impl ScreenCapture for NullCapture {
    async fn capture(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

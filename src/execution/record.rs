//! Execution records.
//!
//! One record per submitted operation, owned by the device worker and
//! snapshot by the status endpoint. Status transitions are monotonic:
//! pending → running → (completed | failed | cancelled), never back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::registry::DeviceKey;

/// Opaque execution identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The operation kinds sharing the uniform async model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ActionBatch,
    Navigation,
    Verification,
    Testcase,
    AiPrompt,
    Script,
    BlockSequence,
}

/// Lifecycle states of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self → next` is a legal (forward) transition.
    pub fn can_transition(&self, next: ExecutionStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Cancelled) => true,
            (Self::Running, s) if s.is_terminal() => true,
            _ => false,
        }
    }
}

/// Size-capped log buffer with head truncation: when full, the oldest
/// lines fall off and a marker notes the cut.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBuffer {
    lines: Vec<String>,
    bytes: usize,
    cap: usize,
    truncated: bool,
}

impl LogBuffer {
    /// Default capacity: 1 MiB.
    pub const DEFAULT_CAP: usize = 1024 * 1024;

    pub fn new(cap: usize) -> Self {
        Self {
            lines: Vec::new(),
            bytes: 0,
            cap,
            truncated: false,
        }
    }

    /// Append one line, evicting from the head if the cap is exceeded.
    pub fn push(&mut self, line: impl Into<String>) {
        let line = line.into();
        self.bytes += line.len() + 1;
        self.lines.push(line);
        while self.bytes > self.cap && self.lines.len() > 1 {
            let removed = self.lines.remove(0);
            self.bytes -= removed.len() + 1;
            self.truncated = true;
        }
    }

    /// Render the buffer; a truncation marker leads when lines were cut.
    pub fn render(&self) -> String {
        let body = self.lines.join("\n");
        if self.truncated {
            format!("[...log head truncated...]\n{}", body)
        } else {
            body
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAP)
    }
}

/// In-memory descriptor of one running operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub kind: OperationKind,
    pub status: ExecutionStatus,
    /// 0-100
    pub progress: u8,
    pub owner_device: DeviceKey,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub logs: LogBuffer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl ExecutionRecord {
    pub fn new(kind: OperationKind, owner_device: DeviceKey) -> Self {
        Self {
            execution_id: ExecutionId::generate(),
            kind,
            status: ExecutionStatus::Pending,
            progress: 0,
            owner_device,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            logs: LogBuffer::default(),
            error_kind: None,
            error_msg: None,
        }
    }

    /// Move to `next` if the transition is legal; returns whether it
    /// was applied. Illegal transitions are ignored, never applied.
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition(next) {
            return false;
        }
        self.status = next;
        match next {
            ExecutionStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => {
                self.completed_at = Some(Utc::now());
                if s == ExecutionStatus::Completed {
                    self.progress = 100;
                }
            }
            _ => {}
        }
        true
    }

    pub fn log(&mut self, line: impl Into<String>) {
        self.logs.push(line);
    }

    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
    }

    /// Terminal helpers.
    pub fn complete(&mut self, result: Value) {
        if self.transition(ExecutionStatus::Completed) {
            self.result = Some(result);
        }
    }

    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) {
        if self.transition(ExecutionStatus::Failed) {
            self.error_kind = Some(kind);
            self.error_msg = Some(message.into());
        }
    }

    pub fn cancel(&mut self) {
        if self.transition(ExecutionStatus::Cancelled) {
            self.error_kind = Some(ErrorKind::Cancelled);
            self.error_msg = Some("cancelled by operator".to_string());
        }
    }

    /// Read-only wire snapshot for the status endpoint.
    pub fn snapshot(&self) -> StatusResponse {
        StatusResponse {
            execution_id: self.execution_id,
            status: self.status,
            progress: self.progress,
            result: self.result.clone(),
            logs: if self.logs.is_empty() {
                None
            } else {
                Some(self.logs.render())
            },
            error_kind: self.error_kind,
            error_msg: self.error_msg.clone(),
        }
    }
}

/// The uniform status payload polled by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

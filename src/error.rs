//! Error types for devicelab-core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using devicelab-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error discriminant surfaced on the wire as `error_kind`.
///
/// Status responses always carry both the kind (machine-readable) and a
/// human-readable message. The set is closed; adapters map their own
/// failures onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    NotOwner,
    DeviceBusy,
    HostUnreachable,
    Infeasible,
    NotFound,
    Timeout,
    Cancelled,
    LlmUnavailable,
    ParseFailure,
    Internal,
}

impl ErrorKind {
    /// Whether a client may retry the operation without changes.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DeviceBusy | Self::HostUnreachable | Self::LlmUnavailable
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidInput => "invalid_input",
            Self::NotOwner => "not_owner",
            Self::DeviceBusy => "device_busy",
            Self::HostUnreachable => "host_unreachable",
            Self::Infeasible => "infeasible",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::LlmUnavailable => "llm_unavailable",
            Self::ParseFailure => "parse_failure",
            Self::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// Errors that can occur during core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing fields, malformed graph, label grammar violation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Device lock not held or revoked
    #[error("Not owner of device {device_id}")]
    NotOwner { device_id: String },

    /// Per-device queue full
    #[error("Device {device_id} is busy (queue full)")]
    DeviceBusy { device_id: String },

    /// Network failure reaching a host
    #[error("Host unreachable: {host_name} - {message}")]
    HostUnreachable { host_name: String, message: String },

    /// The plan pipeline determined the task cannot be expressed in context
    #[error("Infeasible: {analysis}")]
    Infeasible { analysis: String },

    /// Unknown device, tree, node, or execution id
    #[error("Not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    /// No path between two navigation nodes
    #[error("No navigation path from {from} to {to}")]
    Unreachable { from: String, to: String },

    /// Execution cap exceeded
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Cancelled by operator
    #[error("Cancelled by operator")]
    Cancelled,

    /// LLM API failure
    #[error("LLM error: {0}")]
    Llm(String),

    /// The LLM response could not yield any steps
    #[error("Step-list parse failure: {0}")]
    ParseFailure(String),

    /// Persistence adapter failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invariant violation, adapter bug
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The stable wire discriminant for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) | Self::Config(_) => ErrorKind::InvalidInput,
            Self::NotOwner { .. } => ErrorKind::NotOwner,
            Self::DeviceBusy { .. } => ErrorKind::DeviceBusy,
            Self::HostUnreachable { .. } => ErrorKind::HostUnreachable,
            Self::Infeasible { .. } => ErrorKind::Infeasible,
            Self::NotFound { .. } | Self::Unreachable { .. } => ErrorKind::NotFound,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Llm(_) => ErrorKind::LlmUnavailable,
            Self::ParseFailure(_) => ErrorKind::ParseFailure,
            Self::Storage(_) | Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Create an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a not-owner error.
    pub fn not_owner(device_id: impl Into<String>) -> Self {
        Self::NotOwner {
            device_id: device_id.into(),
        }
    }

    /// Create a host-unreachable error.
    pub fn host_unreachable(host_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HostUnreachable {
            host_name: host_name.into(),
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create an infeasible error carrying the pipeline's analysis.
    pub fn infeasible(analysis: impl Into<String>) -> Self {
        Self::Infeasible {
            analysis: analysis.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::invalid_input("missing prompt").kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(Error::not_owner("dev1").kind(), ErrorKind::NotOwner);
        assert_eq!(
            Error::not_found("device", "dev9").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(Error::timeout(1000).kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::HostUnreachable.is_transient());
        assert!(ErrorKind::DeviceBusy.is_transient());
        assert!(!ErrorKind::NotOwner.is_transient());
        assert!(!ErrorKind::Timeout.is_transient());
    }

    #[test]
    fn test_wire_format() {
        let kind = ErrorKind::HostUnreachable;
        assert_eq!(
            serde_json::to_string(&kind).unwrap(),
            "\"host_unreachable\""
        );
        assert_eq!(kind.to_string(), "host_unreachable");
    }
}

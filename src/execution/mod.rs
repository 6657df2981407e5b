//! Block & graph execution.
//!
//! A plan graph runs on the per-device worker that owns its record:
//! blocks execute strictly sequentially, edges select the next block by
//! outcome, cancellation cooperates at every suspension point, and the
//! job registry gives every operation the same submit → execution_id →
//! poll shape.

pub mod executor;
pub mod record;
pub mod registry;
pub mod variables;
pub mod worker;

pub use executor::{run_graph, ExecutionEnv, ExecutorConfig, Verdict};
pub use record::{
    ExecutionId, ExecutionRecord, ExecutionStatus, LogBuffer, OperationKind, StatusResponse,
};
pub use registry::{JobRegistry, RegistryConfig};
pub use variables::{evaluate_condition, OperandType, VariableMap, LAST_VERIFICATION};
pub use worker::{ActionRequest, DeviceHandle, JobPayload, QueuedJob, VerificationRequest};

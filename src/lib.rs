//! # devicelab-core
//!
//! Execution and navigation core for a distributed device-under-test
//! automation platform: a server orchestrates test cases, navigation
//! flows, and AI-generated plans across remote hosts, each driving
//! physical devices.
//!
//! ## Core Components
//!
//! - **Control**: exclusive per-device sessions and the host/device registry
//! - **Navigation**: unified navigation graphs, TTL cache, BFS pathfinding
//!   with transition pre-expansion
//! - **Plan**: the deterministic AI plan-builder pipeline around a single
//!   LLM call
//! - **Execution**: typed block graphs on per-device FIFO workers with a
//!   uniform submit → execution_id → poll job registry
//! - **Proxy**: stateless server-side routing to the owning host
//!
//! ## Example
//!
//! ```rust,ignore
//! use devicelab_core::{Ctx, HostRuntime, HostRuntimeConfig};
//!
//! let runtime = HostRuntime::new(store, llm, HostRuntimeConfig::default());
//! let ctx = Ctx::new("team1");
//!
//! let control = runtime.take_control(&ctx, "host1", "device1", Some("tv_ui")).await?;
//! let owner = ctx.with_token(control.token);
//! let id = runtime.execute_navigation(&owner, &device, "tv_ui", "live", None).await?;
//! let status = runtime.status(id)?;
//! ```

pub mod adapters;
pub mod api;
pub mod control;
pub mod error;
pub mod execution;
pub mod host;
pub mod navigation;
pub mod persistence;
pub mod plan;
pub mod proxy;
pub mod registry;
pub mod testcases;

// Re-exports for convenience
pub use adapters::{
    ActionExecutor, ActionOutcome, CancelToken, HttpLlmClient, LlmClient, LlmConfig, NullCapture,
    ScreenCapture, ScriptedActionExecutor, ScriptedLlm, ScriptedVerifier, VerificationExecutor,
    VerificationOutcome,
};
pub use control::{
    ControlSession, Ctx, SessionConfig, SessionManager, SessionToken, TakeControlResult,
};
pub use error::{Error, ErrorKind, Result};
pub use execution::{
    ActionRequest, DeviceHandle, ExecutionId, ExecutionRecord, ExecutionStatus, ExecutorConfig,
    JobPayload, JobRegistry, LogBuffer, OperationKind, RegistryConfig, StatusResponse,
    VariableMap, VerificationRequest,
};
pub use host::{HostRuntime, HostRuntimeConfig};
pub use navigation::{
    EdgeAction, NavEdge, NavNode, NavigationCache, NavigationCacheConfig, NavigationPath,
    NavigationTree, TransitionStep, UnifiedGraph,
};
pub use persistence::{Persistence, SqliteStore, StoredRecord};
pub use plan::{
    Ambiguity, BlockKind, ContextSignature, EdgeHandle, FilterConfig, GenerateRequest, Intent,
    LearnedMapping, LearnedMappings, PlanBuilder, PlanBuilderConfig, PlanCache, PlanCacheConfig,
    PlanCacheEntry, PlanContext, PlanEdge, PlanGraph, PlanNode, PlanOutcome, PlanResponse,
};
pub use proxy::{ProxyConfig, ServerProxy};
pub use registry::{
    ActionSpec, DeviceCapabilities, DeviceInfo, DeviceKey, DeviceRegistry, HostInfo, HostStatus,
    VerificationSpec,
};
pub use testcases::{Testcase, TestcaseStore, TestcaseSummary};

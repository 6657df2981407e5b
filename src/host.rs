//! Host runtime: the coordinator that owns every component.
//!
//! One `HostRuntime` per host process aggregates the device registry,
//! session layer, navigation cache, plan builder, job registry, and
//! test case store. Components never hold pointers to each other;
//! everything routes through this owner and refers to devices by key.
//! Every mutating device operation resolves the device, verifies the
//! caller's session, and admits the job through the registry; reads
//! skip the lock check.

use std::sync::Arc;

use crate::adapters::{ActionExecutor, LlmClient, ScreenCapture, VerificationExecutor};
use crate::control::{Ctx, SessionConfig, SessionManager, TakeControlResult};
use crate::error::{Error, Result};
use crate::execution::executor::ExecutorConfig;
use crate::execution::record::{ExecutionId, OperationKind, StatusResponse};
use crate::execution::registry::{JobRegistry, RegistryConfig};
use crate::execution::worker::{
    ActionRequest, DeviceHandle, JobPayload, VerificationRequest,
};
use crate::navigation::cache::NavigationCacheConfig;
use crate::navigation::pathfinder::find_path;
use crate::navigation::NavigationCache;
use crate::persistence::Persistence;
use crate::plan::builder::{GenerateRequest, PlanBuilder, PlanBuilderConfig, PlanOutcome};
use crate::plan::cache::{PlanCache, PlanCacheConfig};
use crate::plan::context::{ContextLoader, ContextLoaderConfig};
use crate::plan::graph::PlanGraph;
use crate::plan::mappings::LearnedMappings;
use crate::registry::{
    actions_for_device, verifications_for_device, ActionSpec, DeviceKey, DeviceRegistry,
    VerificationSpec,
};
use crate::testcases::{Testcase, TestcaseStore, TestcaseSummary};

/// Aggregate configuration for a host process.
#[derive(Debug, Clone, Default)]
pub struct HostRuntimeConfig {
    pub session: SessionConfig,
    pub nav_cache: NavigationCacheConfig,
    pub context: ContextLoaderConfig,
    pub plan: PlanBuilderConfig,
    pub plan_cache: PlanCacheConfig,
    pub registry: RegistryConfig,
    pub executor: ExecutorConfig,
}

/// The host-side core: sessions, navigation, planning, execution.
pub struct HostRuntime {
    pub registry: Arc<DeviceRegistry>,
    pub sessions: Arc<SessionManager>,
    pub nav_cache: Arc<NavigationCache>,
    pub jobs: Arc<JobRegistry>,
    pub builder: Arc<PlanBuilder>,
    pub plan_cache: Arc<PlanCache>,
    pub testcases: Arc<TestcaseStore>,
    store: Arc<dyn Persistence>,
}

impl HostRuntime {
    pub fn new(
        store: Arc<dyn Persistence>,
        llm: Arc<dyn LlmClient>,
        config: HostRuntimeConfig,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let nav_cache = Arc::new(NavigationCache::new(config.nav_cache));
        let sessions = Arc::new(SessionManager::new(
            registry.clone(),
            nav_cache.clone(),
            store.clone(),
            config.session,
        ));
        let context_loader = Arc::new(ContextLoader::new(
            registry.clone(),
            nav_cache.clone(),
            store.clone(),
            config.context,
        ));
        let plan_cache = Arc::new(PlanCache::new(store.clone(), config.plan_cache));
        let mappings = Arc::new(LearnedMappings::new(store.clone()));
        let builder = Arc::new(PlanBuilder::new(
            context_loader,
            nav_cache.clone(),
            store.clone(),
            plan_cache.clone(),
            mappings,
            llm,
            config.plan,
        ));
        let jobs = Arc::new(JobRegistry::new(
            config.registry,
            config.executor,
            Some(store.clone()),
        ));
        let testcases = Arc::new(TestcaseStore::new(store.clone()));

        Self {
            registry,
            sessions,
            nav_cache,
            jobs,
            builder,
            plan_cache,
            testcases,
            store,
        }
    }

    /// Register a device and its capability adapters, spawning its
    /// worker.
    pub fn attach_device(
        &self,
        host_name: &str,
        device_id: &str,
        device_model: &str,
        actions: Arc<dyn ActionExecutor>,
        verifier: Arc<dyn VerificationExecutor>,
        capture: Arc<dyn ScreenCapture>,
    ) -> Result<DeviceKey> {
        self.registry.register_host(host_name, "http://localhost");
        self.registry
            .register_device(host_name, device_id, device_model, None)?;
        let key = DeviceKey::new(host_name, device_id);
        self.jobs.register_device(DeviceHandle {
            key: key.clone(),
            actions,
            verifier,
            capture,
        });
        Ok(key)
    }

    // ==================== Control ====================

    pub async fn take_control(
        &self,
        ctx: &Ctx,
        host_name: &str,
        device_id: &str,
        tree_ref: Option<&str>,
    ) -> Result<TakeControlResult> {
        self.sessions
            .take_control(ctx, host_name, device_id, tree_ref)
            .await
    }

    pub async fn release_control(&self, ctx: &Ctx, host_name: &str, device_id: &str) {
        self.sessions.release_control(ctx, host_name, device_id).await
    }

    // ==================== Capability catalogs (no lock) ====================

    pub fn list_actions(&self, device: &DeviceKey) -> Result<Vec<ActionSpec>> {
        Ok(actions_for_device(&self.registry.device(device)?))
    }

    pub fn list_verifications(&self, device: &DeviceKey) -> Result<Vec<VerificationSpec>> {
        Ok(verifications_for_device(&self.registry.device(device)?))
    }

    /// Node labels of a team's interface (no lock).
    pub async fn navigation_nodes(&self, ctx: &Ctx, interface: &str) -> Result<Vec<String>> {
        let graph = self
            .nav_cache
            .get_or_build(&ctx.team_id, interface, self.store.as_ref())
            .await?;
        Ok(graph.labels())
    }

    /// Persist a navigation tree; the write invalidates the cached
    /// unified graph for its (team, interface) slot.
    pub async fn store_navigation_tree(
        &self,
        ctx: &Ctx,
        tree: &crate::navigation::tree::NavigationTree,
    ) -> Result<()> {
        self.nav_cache
            .store_tree(&ctx.team_id, tree, self.store.as_ref())
            .await
    }

    // ==================== Async operations ====================

    /// Async navigate-to-node: resolves the path now, executes on the
    /// device worker.
    pub async fn execute_navigation(
        &self,
        ctx: &Ctx,
        device: &DeviceKey,
        interface: &str,
        target: &str,
        source: Option<&str>,
    ) -> Result<ExecutionId> {
        self.sessions.verify_owner(ctx, device).await?;
        let graph = self
            .nav_cache
            .get_or_build(&ctx.team_id, interface, self.store.as_ref())
            .await?;
        let path = find_path(&graph, source, target)?;
        self.jobs.submit(
            OperationKind::Navigation,
            device,
            JobPayload::Navigation {
                target: target.to_string(),
                transitions: path.steps,
            },
        )
    }

    /// Async action batch with optional retry/cleanup companions.
    pub async fn execute_actions(
        &self,
        ctx: &Ctx,
        device: &DeviceKey,
        actions: Vec<ActionRequest>,
        retry_actions: Vec<ActionRequest>,
        failure_actions: Vec<ActionRequest>,
    ) -> Result<ExecutionId> {
        if actions.is_empty() {
            return Err(Error::invalid_input("action batch must not be empty"));
        }
        self.sessions.verify_owner(ctx, device).await?;
        self.jobs.submit(
            OperationKind::ActionBatch,
            device,
            JobPayload::ActionBatch {
                actions,
                retry_actions,
                failure_actions,
            },
        )
    }

    /// Async verification batch.
    pub async fn execute_verifications(
        &self,
        ctx: &Ctx,
        device: &DeviceKey,
        verifications: Vec<VerificationRequest>,
    ) -> Result<ExecutionId> {
        if verifications.is_empty() {
            return Err(Error::invalid_input("verification batch must not be empty"));
        }
        self.sessions.verify_owner(ctx, device).await?;
        self.jobs.submit(
            OperationKind::Verification,
            device,
            JobPayload::Verification { verifications },
        )
    }

    /// Generate a plan from a prompt (read-only: no lock required).
    pub async fn generate_plan(&self, ctx: &Ctx, request: &GenerateRequest) -> Result<PlanOutcome> {
        self.builder.generate(ctx, request).await
    }

    /// Run a plan graph. Pre-execution validation: structure plus every
    /// navigation target against the current unified graph.
    pub async fn execute_plan(
        &self,
        ctx: &Ctx,
        device: &DeviceKey,
        interface: &str,
        graph: PlanGraph,
        kind: OperationKind,
    ) -> Result<ExecutionId> {
        self.sessions.verify_owner(ctx, device).await?;
        graph.validate()?;

        let unified = self
            .nav_cache
            .get_or_build(&ctx.team_id, interface, self.store.as_ref())
            .await?;
        let unknown = graph.unknown_navigation_targets(&unified);
        if !unknown.is_empty() {
            return Err(Error::invalid_input(format!(
                "plan references unknown nodes: {}",
                unknown.join(", ")
            )));
        }

        self.jobs
            .submit(kind, device, JobPayload::Graph { graph })
    }

    /// Load a saved test case and run it.
    pub async fn run_testcase(
        &self,
        ctx: &Ctx,
        device: &DeviceKey,
        interface: &str,
        testcase_id: &str,
    ) -> Result<ExecutionId> {
        let testcase = self.testcases.load(ctx, testcase_id).await?;
        self.execute_plan(ctx, device, interface, testcase.graph, OperationKind::Testcase)
            .await
    }

    pub fn status(&self, execution_id: ExecutionId) -> Result<StatusResponse> {
        self.jobs.status(execution_id)
    }

    pub fn cancel(&self, execution_id: ExecutionId) -> Result<()> {
        self.jobs.cancel(execution_id)
    }

    // ==================== Test cases ====================

    pub async fn save_testcase(
        &self,
        ctx: &Ctx,
        name: &str,
        graph: PlanGraph,
        tags: Vec<String>,
    ) -> Result<Testcase> {
        self.testcases.save(ctx, name, graph, tags).await
    }

    pub async fn load_testcase(&self, ctx: &Ctx, testcase_id: &str) -> Result<Testcase> {
        self.testcases.load(ctx, testcase_id).await
    }

    pub async fn list_testcases(
        &self,
        ctx: &Ctx,
        tag: Option<&str>,
    ) -> Result<Vec<TestcaseSummary>> {
        self.testcases.list(ctx, tag).await
    }

    // ==================== Maintenance ====================

    /// One watchdog tick: sweep stale hosts, reap orphaned sessions,
    /// evict expired records, clean the plan cache.
    pub async fn maintenance_tick(&self) -> Result<()> {
        let swept = self.registry.sweep_stale();
        if !swept.is_empty() {
            tracing::warn!(hosts = ?swept, "hosts went offline");
        }
        self.sessions.reap_orphans().await;
        self.jobs.evict_terminal();
        self.plan_cache.cleanup().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{NullCapture, ScriptedActionExecutor, ScriptedLlm, ScriptedVerifier};
    use crate::execution::record::ExecutionStatus;
    use crate::navigation::tree::{EdgeAction, NavNode, NavigationTree};
    use crate::persistence::SqliteStore;
    use std::collections::HashMap;

    struct Fixture {
        runtime: HostRuntime,
        device: DeviceKey,
        actions: Arc<ScriptedActionExecutor>,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn Persistence> = Arc::new(SqliteStore::in_memory().unwrap());
        let llm = Arc::new(ScriptedLlm::new());
        let runtime = HostRuntime::new(store, llm, HostRuntimeConfig::default());

        let actions = Arc::new(ScriptedActionExecutor::new());
        let device = runtime
            .attach_device(
                "host1",
                "device1",
                "android_tv",
                actions.clone(),
                Arc::new(ScriptedVerifier::new()),
                Arc::new(NullCapture),
            )
            .unwrap();

        let mut tree = NavigationTree::new("tree1", "tv_ui", "android_tv");
        tree.add_node(NavNode::new("n_home", "home"))
            .add_node(NavNode::new("n_live", "live"));
        tree.connect(
            "e1",
            "n_home",
            "n_live",
            vec![EdgeAction::new("press_key:RIGHT")],
        );
        runtime
            .nav_cache
            .store_tree("team1", &tree, runtime.store.as_ref())
            .await
            .unwrap();

        Fixture {
            runtime,
            device,
            actions,
        }
    }

    async fn wait_terminal(runtime: &HostRuntime, id: ExecutionId) -> StatusResponse {
        for _ in 0..200 {
            let status = runtime.status(id).unwrap();
            if status.status.is_terminal() {
                return status;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("execution never terminal");
    }

    #[tokio::test]
    async fn test_end_to_end_generate_and_execute() {
        let fixture = fixture().await;
        let ctx = Ctx::new("team1");

        let control = fixture
            .runtime
            .take_control(&ctx, "host1", "device1", Some("tv_ui"))
            .await
            .unwrap();
        assert!(control.cache_ready);
        let owner = ctx.clone().with_token(control.token);

        let outcome = fixture
            .runtime
            .generate_plan(
                &owner,
                &GenerateRequest {
                    prompt: "live".to_string(),
                    host_name: "host1".to_string(),
                    device_id: "device1".to_string(),
                    interface: "tv_ui".to_string(),
                    resolutions: HashMap::new(),
                },
            )
            .await
            .unwrap();
        let plan = match outcome {
            PlanOutcome::Plan(plan) => plan,
            other => panic!("expected plan, got {:?}", other),
        };

        let id = fixture
            .runtime
            .execute_plan(
                &owner,
                &fixture.device,
                "tv_ui",
                plan.graph,
                OperationKind::AiPrompt,
            )
            .await
            .unwrap();
        let terminal = wait_terminal(&fixture.runtime, id).await;
        assert_eq!(terminal.status, ExecutionStatus::Completed);
        assert_eq!(fixture.actions.executed(), vec!["press_key:RIGHT"]);

        fixture.runtime.release_control(&owner, "host1", "device1").await;
    }

    #[tokio::test]
    async fn test_submission_without_lock_is_not_owner() {
        let fixture = fixture().await;
        let ctx = Ctx::new("team1");

        let err = fixture
            .runtime
            .execute_actions(
                &ctx,
                &fixture.device,
                vec![ActionRequest {
                    command: "press_key:OK".to_string(),
                    params: serde_json::Value::Null,
                    delay_ms: 0,
                }],
                vec![],
                vec![],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotOwner);
    }

    #[tokio::test]
    async fn test_revoked_token_cannot_submit() {
        let fixture = fixture().await;
        let ctx = Ctx::new("team1");

        let first = fixture
            .runtime
            .take_control(&ctx, "host1", "device1", None)
            .await
            .unwrap();
        let old_owner = ctx.clone().with_token(first.token);

        // Supersession revokes the first token.
        fixture
            .runtime
            .take_control(&ctx, "host1", "device1", None)
            .await
            .unwrap();

        let err = fixture
            .runtime
            .execute_navigation(&old_owner, &fixture.device, "tv_ui", "live", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotOwner);
    }

    #[tokio::test]
    async fn test_execute_plan_rejects_unknown_nodes() {
        let fixture = fixture().await;
        let ctx = Ctx::new("team1");
        let control = fixture
            .runtime
            .take_control(&ctx, "host1", "device1", None)
            .await
            .unwrap();
        let owner = ctx.clone().with_token(control.token);

        let graph =
            crate::plan::assemble::trivial_navigation_plan(&["nonexistent_node".to_string()]);
        let err = fixture
            .runtime
            .execute_plan(
                &owner,
                &fixture.device,
                "tv_ui",
                graph,
                OperationKind::BlockSequence,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_navigation_roundtrip() {
        let fixture = fixture().await;
        let ctx = Ctx::new("team1");
        let control = fixture
            .runtime
            .take_control(&ctx, "host1", "device1", Some("tv_ui"))
            .await
            .unwrap();
        let owner = ctx.clone().with_token(control.token);

        let id = fixture
            .runtime
            .execute_navigation(&owner, &fixture.device, "tv_ui", "live", None)
            .await
            .unwrap();
        let terminal = wait_terminal(&fixture.runtime, id).await;
        assert_eq!(terminal.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_testcase_save_and_run() {
        let fixture = fixture().await;
        let ctx = Ctx::new("team1");
        let control = fixture
            .runtime
            .take_control(&ctx, "host1", "device1", Some("tv_ui"))
            .await
            .unwrap();
        let owner = ctx.clone().with_token(control.token);

        // Build an executable graph via the builder so transitions are
        // embedded.
        let outcome = fixture
            .runtime
            .generate_plan(
                &owner,
                &GenerateRequest {
                    prompt: "live".to_string(),
                    host_name: "host1".to_string(),
                    device_id: "device1".to_string(),
                    interface: "tv_ui".to_string(),
                    resolutions: HashMap::new(),
                },
            )
            .await
            .unwrap();
        let plan = match outcome {
            PlanOutcome::Plan(plan) => plan,
            other => panic!("expected plan, got {:?}", other),
        };

        let saved = fixture
            .runtime
            .save_testcase(&owner, "go live", plan.graph, vec![])
            .await
            .unwrap();
        let id = fixture
            .runtime
            .run_testcase(&owner, &fixture.device, "tv_ui", &saved.testcase_id)
            .await
            .unwrap();
        let terminal = wait_terminal(&fixture.runtime, id).await;
        assert_eq!(terminal.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_capability_catalogs_require_no_lock() {
        let fixture = fixture().await;
        let actions = fixture.runtime.list_actions(&fixture.device).unwrap();
        assert!(actions.iter().any(|a| a.command == "zap"));

        let verifications = fixture
            .runtime
            .list_verifications(&fixture.device)
            .unwrap();
        assert!(verifications
            .iter()
            .any(|v| v.verification_type == "check_audio"));
    }

    #[tokio::test]
    async fn test_maintenance_tick() {
        let fixture = fixture().await;
        fixture.runtime.maintenance_tick().await.unwrap();
    }
}

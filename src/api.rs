//! HTTP+JSON surface over the host runtime.
//!
//! Every long-running endpoint follows the uniform async contract:
//! the handler resolves the device, checks the session where the
//! operation mutates device state, submits through the job registry,
//! and returns `{execution_id}` immediately; clients poll
//! `execution/status` until a terminal status. Disambiguation and
//! infeasibility are successful responses carrying structured
//! payloads, never HTTP errors.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::control::{Ctx, SessionToken};
use crate::error::{Error, ErrorKind};
use crate::execution::record::{ExecutionId, OperationKind};
use crate::execution::worker::{ActionRequest, VerificationRequest};
use crate::host::HostRuntime;
use crate::plan::builder::{GenerateRequest, PlanOutcome};
use crate::plan::graph::PlanGraph;
use crate::registry::DeviceKey;

/// Shared state of the API router.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<HostRuntime>,
}

/// Build the router for a host runtime.
pub fn router(runtime: Arc<HostRuntime>) -> Router {
    Router::new()
        .route("/control/take", post(control_take))
        .route("/control/release", post(control_release))
        .route("/control/locked", get(control_locked))
        .route("/capabilities/actions", get(capabilities_actions))
        .route("/capabilities/verifications", get(capabilities_verifications))
        .route("/navigation/nodes", get(navigation_nodes))
        .route("/navigation/execute", post(navigation_execute))
        .route("/actions/execute", post(actions_execute))
        .route("/verifications/execute", post(verifications_execute))
        .route("/plans/generate", post(plans_generate))
        .route("/plans/execute", post(plans_execute))
        .route("/testcases/save", post(testcases_save))
        .route("/testcases/load", get(testcases_load))
        .route("/testcases/list", get(testcases_list))
        .route("/execution/status", get(execution_status))
        .route("/execution/cancel", post(execution_cancel))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { runtime })
}

/// Error wrapper mapping the taxonomy onto HTTP statuses. The body
/// always carries both `error_kind` and `error_msg`.
struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::InvalidInput | ErrorKind::ParseFailure => StatusCode::BAD_REQUEST,
            ErrorKind::NotOwner => StatusCode::FORBIDDEN,
            ErrorKind::DeviceBusy => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::HostUnreachable | ErrorKind::LlmUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Cancelled => StatusCode::CONFLICT,
            ErrorKind::Infeasible | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error_kind": kind,
            "error_msg": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn ctx_from(team_id: &str, token: Option<SessionToken>) -> Ctx {
    let mut ctx = Ctx::new(team_id);
    ctx.token = token;
    ctx
}

// ==================== Control ====================

#[derive(Deserialize)]
struct TakeRequest {
    team_id: String,
    host_name: String,
    device_id: String,
    #[serde(default)]
    tree_id: Option<String>,
}

async fn control_take(
    State(state): State<AppState>,
    Json(request): Json<TakeRequest>,
) -> ApiResult<Json<Value>> {
    let ctx = ctx_from(&request.team_id, None);
    let result = state
        .runtime
        .take_control(
            &ctx,
            &request.host_name,
            &request.device_id,
            request.tree_id.as_deref(),
        )
        .await?;
    Ok(Json(json!({
        "session_id": result.session_id,
        "token": result.token,
        "cache_ready": result.cache_ready,
    })))
}

#[derive(Deserialize)]
struct ReleaseRequest {
    team_id: String,
    host_name: String,
    device_id: String,
    token: SessionToken,
}

async fn control_release(
    State(state): State<AppState>,
    Json(request): Json<ReleaseRequest>,
) -> ApiResult<Json<Value>> {
    let ctx = ctx_from(&request.team_id, Some(request.token));
    state
        .runtime
        .release_control(&ctx, &request.host_name, &request.device_id)
        .await;
    Ok(Json(json!({"released": true})))
}

async fn control_locked(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let sessions = state.runtime.sessions.locked_devices().await;
    let locked: Vec<Value> = sessions
        .iter()
        .map(|s| {
            json!({
                "device": s.device,
                "session_id": s.session_id,
                "team_id": s.team_id,
                "created_at": s.created_at,
                "cache_ready": s.cache_ready,
            })
        })
        .collect();
    Ok(Json(json!({"locked": locked})))
}

// ==================== Capabilities ====================

#[derive(Deserialize)]
struct DeviceQuery {
    host_name: String,
    device_id: String,
}

async fn capabilities_actions(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<Value>> {
    let key = DeviceKey::new(&query.host_name, &query.device_id);
    let actions = state.runtime.list_actions(&key)?;
    Ok(Json(json!({"actions": actions})))
}

async fn capabilities_verifications(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<Value>> {
    let key = DeviceKey::new(&query.host_name, &query.device_id);
    let verifications = state.runtime.list_verifications(&key)?;
    Ok(Json(json!({"verifications": verifications})))
}

// ==================== Navigation ====================

#[derive(Deserialize)]
struct NodesQuery {
    team_id: String,
    interface: String,
}

async fn navigation_nodes(
    State(state): State<AppState>,
    Query(query): Query<NodesQuery>,
) -> ApiResult<Json<Value>> {
    let ctx = ctx_from(&query.team_id, None);
    let nodes = state.runtime.navigation_nodes(&ctx, &query.interface).await?;
    Ok(Json(json!({"nodes": nodes})))
}

#[derive(Deserialize)]
struct NavigateRequest {
    team_id: String,
    token: SessionToken,
    host_name: String,
    device_id: String,
    interface: String,
    target_node: String,
    #[serde(default)]
    source_node: Option<String>,
}

async fn navigation_execute(
    State(state): State<AppState>,
    Json(request): Json<NavigateRequest>,
) -> ApiResult<Json<Value>> {
    let ctx = ctx_from(&request.team_id, Some(request.token));
    let key = DeviceKey::new(&request.host_name, &request.device_id);
    let execution_id = state
        .runtime
        .execute_navigation(
            &ctx,
            &key,
            &request.interface,
            &request.target_node,
            request.source_node.as_deref(),
        )
        .await?;
    Ok(Json(json!({"execution_id": execution_id})))
}

// ==================== Actions & verifications ====================

#[derive(Deserialize)]
struct ActionBatchRequest {
    team_id: String,
    token: SessionToken,
    host_name: String,
    device_id: String,
    actions: Vec<ActionRequest>,
    #[serde(default)]
    retry_actions: Vec<ActionRequest>,
    #[serde(default)]
    failure_actions: Vec<ActionRequest>,
}

async fn actions_execute(
    State(state): State<AppState>,
    Json(request): Json<ActionBatchRequest>,
) -> ApiResult<Json<Value>> {
    let ctx = ctx_from(&request.team_id, Some(request.token));
    let key = DeviceKey::new(&request.host_name, &request.device_id);
    let execution_id = state
        .runtime
        .execute_actions(
            &ctx,
            &key,
            request.actions,
            request.retry_actions,
            request.failure_actions,
        )
        .await?;
    Ok(Json(json!({"execution_id": execution_id})))
}

#[derive(Deserialize)]
struct VerificationBatchRequest {
    team_id: String,
    token: SessionToken,
    host_name: String,
    device_id: String,
    verifications: Vec<VerificationRequest>,
}

async fn verifications_execute(
    State(state): State<AppState>,
    Json(request): Json<VerificationBatchRequest>,
) -> ApiResult<Json<Value>> {
    let ctx = ctx_from(&request.team_id, Some(request.token));
    let key = DeviceKey::new(&request.host_name, &request.device_id);
    let execution_id = state
        .runtime
        .execute_verifications(&ctx, &key, request.verifications)
        .await?;
    Ok(Json(json!({"execution_id": execution_id})))
}

// ==================== Plans ====================

#[derive(Deserialize)]
struct GeneratePlanRequest {
    team_id: String,
    #[serde(flatten)]
    request: GenerateRequest,
}

async fn plans_generate(
    State(state): State<AppState>,
    Json(body): Json<GeneratePlanRequest>,
) -> ApiResult<Json<Value>> {
    let ctx = ctx_from(&body.team_id, None);
    match state.runtime.generate_plan(&ctx, &body.request).await {
        Ok(PlanOutcome::Plan(plan)) => Ok(Json(json!({
            "status": "ok",
            "graph": plan.graph,
            "analysis": plan.analysis,
            "fingerprint": plan.fingerprint,
            "cached": plan.cached,
        }))),
        Ok(PlanOutcome::NeedsDisambiguation {
            ambiguities,
            available_nodes,
            original_prompt,
        }) => Ok(Json(json!({
            "status": "needs_disambiguation",
            "ambiguities": ambiguities,
            "available_nodes": available_nodes,
            "original_prompt": original_prompt,
        }))),
        // Infeasibility is a structured success, not an HTTP error.
        Err(Error::Infeasible { analysis }) => Ok(Json(json!({
            "status": "infeasible",
            "analysis": analysis,
        }))),
        Err(e) => Err(e.into()),
    }
}

#[derive(Deserialize)]
struct ExecutePlanRequest {
    team_id: String,
    token: SessionToken,
    host_name: String,
    device_id: String,
    interface: String,
    graph: PlanGraph,
    #[serde(default = "default_plan_kind")]
    kind: OperationKind,
}

fn default_plan_kind() -> OperationKind {
    OperationKind::BlockSequence
}

async fn plans_execute(
    State(state): State<AppState>,
    Json(request): Json<ExecutePlanRequest>,
) -> ApiResult<Json<Value>> {
    let ctx = ctx_from(&request.team_id, Some(request.token));
    let key = DeviceKey::new(&request.host_name, &request.device_id);
    let execution_id = state
        .runtime
        .execute_plan(&ctx, &key, &request.interface, request.graph, request.kind)
        .await?;
    Ok(Json(json!({"execution_id": execution_id})))
}

// ==================== Test cases ====================

#[derive(Deserialize)]
struct SaveTestcaseRequest {
    team_id: String,
    name: String,
    graph: PlanGraph,
    #[serde(default)]
    tags: Vec<String>,
}

async fn testcases_save(
    State(state): State<AppState>,
    Json(request): Json<SaveTestcaseRequest>,
) -> ApiResult<Json<Value>> {
    let ctx = ctx_from(&request.team_id, None);
    let testcase = state
        .runtime
        .save_testcase(&ctx, &request.name, request.graph, request.tags)
        .await?;
    Ok(Json(json!({"testcase_id": testcase.testcase_id})))
}

#[derive(Deserialize)]
struct LoadTestcaseQuery {
    team_id: String,
    testcase_id: String,
}

async fn testcases_load(
    State(state): State<AppState>,
    Query(query): Query<LoadTestcaseQuery>,
) -> ApiResult<Json<Value>> {
    let ctx = ctx_from(&query.team_id, None);
    let testcase = state.runtime.load_testcase(&ctx, &query.testcase_id).await?;
    Ok(Json(json!(testcase)))
}

#[derive(Deserialize)]
struct ListTestcasesQuery {
    team_id: String,
    #[serde(default)]
    tag: Option<String>,
}

async fn testcases_list(
    State(state): State<AppState>,
    Query(query): Query<ListTestcasesQuery>,
) -> ApiResult<Json<Value>> {
    let ctx = ctx_from(&query.team_id, None);
    let testcases = state
        .runtime
        .list_testcases(&ctx, query.tag.as_deref())
        .await?;
    Ok(Json(json!({"testcases": testcases})))
}

// ==================== Execution ====================

#[derive(Deserialize)]
struct StatusQuery {
    execution_id: String,
}

async fn execution_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<Value>> {
    let execution_id = ExecutionId::parse(&query.execution_id)
        .ok_or_else(|| Error::invalid_input("malformed execution_id"))?;
    let status = state.runtime.status(execution_id)?;
    Ok(Json(json!(status)))
}

#[derive(Serialize, Deserialize)]
struct CancelRequest {
    execution_id: String,
}

async fn execution_cancel(
    State(state): State<AppState>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<Json<Value>> {
    let execution_id = ExecutionId::parse(&request.execution_id)
        .ok_or_else(|| Error::invalid_input("malformed execution_id"))?;
    state.runtime.cancel(execution_id)?;
    Ok(Json(json!({"cancelled": true})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{NullCapture, ScriptedActionExecutor, ScriptedLlm, ScriptedVerifier};
    use crate::host::HostRuntimeConfig;
    use crate::navigation::tree::{EdgeAction, NavNode, NavigationTree};
    use crate::persistence::{Persistence, SqliteStore};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> Router {
        let store: Arc<dyn Persistence> = Arc::new(SqliteStore::in_memory().unwrap());
        let runtime = Arc::new(HostRuntime::new(
            store,
            Arc::new(ScriptedLlm::new()),
            HostRuntimeConfig::default(),
        ));
        runtime
            .attach_device(
                "host1",
                "device1",
                "android_tv",
                Arc::new(ScriptedActionExecutor::new()),
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
            .store_navigation_tree(&crate::control::Ctx::new("team1"), &tree)
            .await
            .unwrap();

        router(runtime)
    }

    async fn request_json(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = match body {
            Some(body) => Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_take_then_locked() {
        let app = app().await;

        let (status, body) = request_json(
            &app,
            "POST",
            "/control/take",
            Some(json!({
                "team_id": "team1",
                "host_name": "host1",
                "device_id": "device1",
                "tree_id": "tv_ui",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cache_ready"], json!(true));
        assert!(body["session_id"].is_string());

        let (status, body) = request_json(&app, "GET", "/control/locked", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["locked"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_actions_without_lock_forbidden() {
        let app = app().await;

        let (status, body) = request_json(
            &app,
            "POST",
            "/actions/execute",
            Some(json!({
                "team_id": "team1",
                "token": uuid::Uuid::new_v4(),
                "host_name": "host1",
                "device_id": "device1",
                "actions": [{"command": "press_key:OK"}],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error_kind"], json!("not_owner"));
        assert!(body["error_msg"].is_string());
    }

    #[tokio::test]
    async fn test_submit_and_poll_roundtrip() {
        let app = app().await;

        let (_, take) = request_json(
            &app,
            "POST",
            "/control/take",
            Some(json!({
                "team_id": "team1",
                "host_name": "host1",
                "device_id": "device1",
            })),
        )
        .await;
        let token = take["token"].clone();

        let (status, submitted) = request_json(
            &app,
            "POST",
            "/actions/execute",
            Some(json!({
                "team_id": "team1",
                "token": token,
                "host_name": "host1",
                "device_id": "device1",
                "actions": [{"command": "press_key:OK"}],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let execution_id = submitted["execution_id"].as_str().unwrap().to_string();

        // Poll until terminal.
        let mut last = Value::Null;
        for _ in 0..100 {
            let (status, body) = request_json(
                &app,
                "GET",
                &format!("/execution/status?execution_id={}", execution_id),
                None,
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            if matches!(
                body["status"].as_str(),
                Some("completed") | Some("failed") | Some("cancelled")
            ) {
                last = body;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(last["status"], json!("completed"));
    }

    #[tokio::test]
    async fn test_unknown_execution_404() {
        let app = app().await;
        let (status, body) = request_json(
            &app,
            "GET",
            &format!("/execution/status?execution_id={}", uuid::Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_kind"], json!("not_found"));
    }

    #[tokio::test]
    async fn test_generate_plan_over_http() {
        let app = app().await;
        let (status, body) = request_json(
            &app,
            "POST",
            "/plans/generate",
            Some(json!({
                "team_id": "team1",
                "prompt": "home",
                "host_name": "host1",
                "device_id": "device1",
                "interface": "tv_ui",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["graph"]["nodes"][1]["data"]["label"], json!("navigation_1:home"));
    }

    #[tokio::test]
    async fn test_infeasible_is_structured_success() {
        let app = app().await;
        let (status, body) = request_json(
            &app,
            "POST",
            "/plans/generate",
            Some(json!({
                "team_id": "team1",
                "prompt": "go to the",
                "host_name": "host1",
                "device_id": "device1",
                "interface": "tv_ui",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("infeasible"));
        assert!(body["analysis"].is_string());
    }

    #[tokio::test]
    async fn test_capabilities_endpoint() {
        let app = app().await;
        let (status, body) = request_json(
            &app,
            "GET",
            "/capabilities/actions?host_name=host1&device_id=device1",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["actions"].as_array().unwrap().len() > 5);
    }
}

//! HTTP server: REST endpoints, tool endpoints and MCP.
//!
//! Every surface funnels into [`invoke_tool`], so a REST call and the
//! equivalent tool call return the same JSON and are audited the same way.
//!
//! # Endpoints
//!
//! | Method | Path | Tool |
//! |--------|------|------|
//! | `GET`  | `/api/radiation` | `query_radiation` |
//! | `GET`  | `/api/area` | `search_area` |
//! | `GET`  | `/api/tracks` | `list_tracks` |
//! | `GET`  | `/api/tracks/{track_id}` | `get_track` |
//! | `GET`  | `/api/sensors` | `list_sensors` |
//! | `GET`  | `/api/sensors/current` | `sensor_current` |
//! | `GET`  | `/api/sensors/{device_id}/history` | `sensor_history` |
//! | `GET`  | `/api/spectra` | `list_spectra` |
//! | `GET`  | `/api/spectra/{measurement_id}` | `get_spectrum` |
//! | `GET`  | `/api/stats/radiation` | `radiation_stats` |
//! | `GET`  | `/api/stats/extremes` | `extreme_readings` |
//! | `GET`  | `/api/stats/usage` | `query_usage` |
//! | `GET`  | `/api/status` | `db_info` |
//! | `GET`  | `/tools/list` | all tools with schemas |
//! | `POST` | `/tools/{name}` | any tool, JSON body |
//! | `GET`  | `/health` | liveness |
//! | `*`    | `/mcp` | MCP Streamable HTTP |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "backend_required", "message": "database connection required for get_spectrum: ..." } }
//! ```
//!
//! Statuses: 400 invalid parameter, 404 not found, 405 wrong method,
//! 408 deadline exceeded, 500 backend error, 503 backend unavailable.
//!
//! Callers that send `X-Session-Id` get AI session log records.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, MethodRouter},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::backend::Backends;
use crate::dispatch::{invoke_tool, Caller, ToolFailure};
use crate::mcp::mcp_service;
use crate::params::coerce_query;
use crate::traits::{ToolInfo, ToolRegistry};

/// Header carrying a client-chosen session identity.
pub const SESSION_HEADER: &str = "x-session-id";

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    tools: Arc<ToolRegistry>,
    backends: Backends,
}

impl AppState {
    pub fn new(tools: Arc<ToolRegistry>, backends: Backends) -> Self {
        Self { tools, backends }
    }
}

/// Starts the server with the built-in tools on `[server].bind`.
pub async fn run_server(backends: Backends) -> anyhow::Result<()> {
    run_server_with_tools(backends, Arc::new(ToolRegistry::with_builtins())).await
}

/// Starts the server with a caller-supplied registry, for embedders that
/// add their own [`crate::traits::Tool`] implementations.
pub async fn run_server_with_tools(
    backends: Backends,
    tools: Arc<ToolRegistry>,
) -> anyhow::Result<()> {
    let bind_addr = backends.config.server.bind.clone();
    let app = build_router(AppState::new(tools.clone(), backends));

    tracing::info!(tools = tools.len(), "registered tools");
    for t in tools.tools() {
        tracing::debug!(tool = t.name(), "POST /tools/{}", t.name());
    }

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("radquery listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Full application router. Public so tests can serve it on an ephemeral port.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mcp = mcp_service(state.tools.clone(), state.backends.clone());

    Router::new()
        .route("/api/radiation", query_route("query_radiation"))
        .route("/api/area", query_route("search_area"))
        .route("/api/tracks", query_route("list_tracks"))
        .route("/api/tracks/{track_id}", path_route("get_track"))
        .route("/api/sensors", query_route("list_sensors"))
        .route("/api/sensors/current", query_route("sensor_current"))
        .route("/api/sensors/{device_id}/history", path_route("sensor_history"))
        .route("/api/spectra", query_route("list_spectra"))
        .route("/api/spectra/{measurement_id}", path_route("get_spectrum"))
        .route("/api/stats/radiation", query_route("radiation_stats"))
        .route("/api/stats/extremes", query_route("extreme_readings"))
        .route("/api/stats/usage", query_route("query_usage"))
        .route("/api/status", query_route("db_info"))
        .route("/tools/list", only(get(handle_list_tools)))
        .route("/tools/{name}", only(post(handle_tool_call)))
        .route("/health", only(get(handle_health)))
        .nest_service("/mcp", mcp)
        .fallback(handle_not_found)
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

/// Wraps a [`ToolFailure`] as an HTTP response.
struct AppError(ToolFailure);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.body())).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError(ToolFailure::new(400, "bad_request", message))
}

async fn handle_not_found() -> AppError {
    AppError(ToolFailure::new(404, "not_found", "no such endpoint"))
}

async fn handle_method_not_allowed() -> AppError {
    AppError(ToolFailure::new(
        405,
        "method_not_allowed",
        "method not allowed for this endpoint",
    ))
}

/// Attach the JSON 405 fallback to a method router.
fn only(route: MethodRouter<AppState>) -> MethodRouter<AppState> {
    route.fallback(handle_method_not_allowed)
}

fn caller(headers: &HeaderMap, surface: &str) -> Caller {
    let agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    let session = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Caller::new(format!("{}:{}", surface, agent)).with_session(session)
}

// ============ REST ============

fn query_route(tool: &'static str) -> MethodRouter<AppState> {
    only(get(
        move |State(state): State<AppState>,
              headers: HeaderMap,
              Query(query): Query<HashMap<String, String>>| async move {
            rest_call(&state, tool, query, HashMap::new(), &headers).await
        },
    ))
}

fn path_route(tool: &'static str) -> MethodRouter<AppState> {
    only(get(
        move |State(state): State<AppState>,
              Path(path): Path<HashMap<String, String>>,
              headers: HeaderMap,
              Query(query): Query<HashMap<String, String>>| async move {
            rest_call(&state, tool, query, path, &headers).await
        },
    ))
}

/// Coerce query-string and path values with the tool's schema, then
/// dispatch. Path values win over query-string values of the same name.
async fn rest_call(
    state: &AppState,
    tool_name: &str,
    query: HashMap<String, String>,
    path: HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<Json<Value>, AppError> {
    let tool = state
        .tools
        .find(tool_name)
        .ok_or_else(|| AppError(ToolFailure::unknown_tool(tool_name)))?;
    let schema = tool.parameters_schema();

    let mut params = coerce_query(&schema, &query).map_err(|e| bad_request(e.to_string()))?;
    let from_path = coerce_query(&schema, &path).map_err(|e| bad_request(e.to_string()))?;
    if let (Value::Object(p), Value::Object(extra)) = (&mut params, from_path) {
        p.extend(extra);
    }

    invoke_tool(&state.tools, &state.backends, tool_name, params, &caller(headers, "rest"))
        .await
        .map(Json)
        .map_err(AppError)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: state.tools.infos(),
    })
}

// ============ POST /tools/{name} ============

/// Unified tool dispatch with a JSON body. Returns `{"result": ...}`.
async fn handle_tool_call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let params = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| bad_request(format!("request body is not valid JSON: {}", e)))?
    };
    let result = invoke_tool(&state.tools, &state.backends, &name, params, &caller(&headers, "tools"))
        .await
        .map_err(AppError)?;
    Ok(Json(serde_json::json!({ "result": result })))
}

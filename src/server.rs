//! HTTP tool API.
//!
//! Exposes the [`ToolRegistry`] as a JSON HTTP API and mounts the MCP
//! Streamable HTTP endpoint next to it.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/tools/list` | List all registered tools with schemas |
//! | `POST` | `/tools/{name}` | Call a tool by name |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `*`    | `/mcp` | MCP Streamable HTTP |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "index 'x' not found", "available_indexes": [] } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `invalid_input`, `file_load`, `no_text_column`, `no_valid_spaces` | 400 |
//! | `not_found` | 404 |
//! | `resource` | 502 |
//! | `server_unhealthy` | 503 |
//! | `internal` | 500 |
//!
//! # MCP client configuration
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "space-harness": {
//!       "command": "spx",
//!       "args": ["--config", "/path/to/spx.toml", "serve", "mcp"]
//!     }
//!   }
//! }
//! ```

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::error::RagError;
use crate::mcp::{streamable_service, McpBridge};
use crate::traits::{ToolContext, ToolRegistry};

#[derive(Clone)]
struct AppState {
    tools: Arc<ToolRegistry>,
    ctx: ToolContext,
}

/// Build the router without binding; tests serve it on an ephemeral port.
pub fn build_router(tools: Arc<ToolRegistry>, ctx: ToolContext) -> Router {
    let mcp = streamable_service(McpBridge::new(tools.clone(), ctx.clone()));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/{name}", post(handle_tool_call))
        .route("/health", get(handle_health))
        .nest_service("/mcp", mcp)
        .layer(cors)
        .with_state(AppState { tools, ctx })
}

/// Bind to `bind` and serve until the process is terminated.
pub async fn run_server(bind: &str, tools: Arc<ToolRegistry>, ctx: ToolContext) -> anyhow::Result<()> {
    for t in tools.tools() {
        tracing::info!(tool = t.name(), builtin = t.is_builtin(), "registered tool");
    }

    let app = build_router(tools, ctx);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "tool API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

struct AppError {
    status: StatusCode,
    body: Value,
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        Self {
            status: status_for(&err),
            body: err.to_json(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// HTTP status for an error code.
pub fn status_for(err: &RagError) -> StatusCode {
    match err {
        RagError::NotFound { .. } => StatusCode::NOT_FOUND,
        RagError::ServerUnhealthy { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RagError::Resource { .. } => StatusCode::BAD_GATEWAY,
        RagError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ if err.is_client_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
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
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub builtin: bool,
    pub parameters: Value,
}

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    let tools = state
        .tools
        .tools()
        .iter()
        .map(|t| ToolInfo {
            name: t.name().to_string(),
            description: t.description().to_string(),
            builtin: t.is_builtin(),
            parameters: t.parameters_schema(),
        })
        .collect();
    Json(ToolListResponse { tools })
}

// ============ POST /tools/{name} ============

/// Returns `{ "result": ... }`, or the error JSON with the status from
/// [`status_for`].
async fn handle_tool_call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    if state.tools.find(&name).is_none() {
        return Err(AppError {
            status: StatusCode::NOT_FOUND,
            body: serde_json::json!({
                "error": {
                    "code": "not_found",
                    "message": format!("no tool registered with name: {}", name),
                }
            }),
        });
    }

    let params = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            AppError::from(RagError::InvalidInput(format!("request body is not valid JSON: {}", e)))
        })?
    };
    let result = state.tools.call(&name, params, &state.ctx).await.map_err(|e| {
        tracing::warn!(tool = %name, code = e.code(), error = %e, "tool call failed");
        AppError::from(e)
    })?;

    Ok(Json(serde_json::json!({ "result": result })))
}

//! HTTP control plane for the engine.
//!
//! A thin local-only surface over the tool dispatcher: tools are invoked by
//! name with a JSON argument object and always answer with a JSON envelope.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use crate::store::WorkItemStore;
use crate::tools::{ToolDispatcher, TOOL_NAMES};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub tools: Arc<ToolDispatcher>,
    pub store: Arc<WorkItemStore>,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tools", get(list_tools))
        .route("/tools/{name}", post(call_tool))
        .route("/health", get(health_check))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server, bound to localhost only.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("tool surface listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

/// GET /health - storage reachability and row count.
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state
        .store
        .count_work_items(&crate::storage::ListFilter::default())
        .await
    {
        Ok(count) => Json(serde_json::json!({
            "status": "ok",
            "work_items": count,
        })),
        Err(e) => Json(serde_json::json!({
            "status": "degraded",
            "error": e.to_string(),
        })),
    }
}

/// GET /tools - the registered tool names.
async fn list_tools() -> impl IntoResponse {
    Json(serde_json::json!({ "tools": TOOL_NAMES }))
}

/// POST /tools/{name} - invoke a tool. Errors are structured responses,
/// never HTTP-level failures.
async fn call_tool(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<serde_json::Value>>,
) -> impl IntoResponse {
    let args = body.map(|Json(v)| v).unwrap_or(serde_json::json!({}));
    let response = state.tools.dispatch(&name, args).await;
    Json(response)
}

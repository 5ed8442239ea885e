//! Direct invocation endpoint.
//!
//! REST-style surface beside the MCP endpoint: `GET /tools` lists bound tool
//! names, `POST /tools/{name}` invokes one with the raw request body — any
//! bytes, JSON or not — and writes the raw guest output back. The guest's
//! return code does not affect the HTTP status; only host-side failures are
//! errors here.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::binder::{self, InvocationContext};
use crate::supervisor::ServerState;
use wharf_host::RegistryError;

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/tools", get(list_tools))
        .route("/tools/{name}", post(invoke_tool))
        .with_state(state)
}

async fn list_tools(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    Json(json!({ "tools": state.bindings.names() }))
}

async fn invoke_tool(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let Some(binding) = state.bindings.get(&name) else {
        return error_response(
            StatusCode::NOT_FOUND,
            "tool_not_found",
            &format!("tool not found: {name}"),
        );
    };

    let ctx = InvocationContext::new("direct", state.request_timeout, body.to_vec());

    match binder::dispatch(&state.registry, binding, ctx).await {
        Ok(outcome) => {
            if outcome.status != 0 {
                tracing::debug!(tool = %name, status = outcome.status, "Guest reported an error");
            }
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                outcome.output,
            )
                .into_response()
        }
        Err(e) => {
            tracing::warn!(tool = %name, error = %e, "Direct invocation failed");
            error_response(status_for(&e), e.code(), &e.to_string())
        }
    }
}

fn status_for(error: &RegistryError) -> StatusCode {
    match error {
        RegistryError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": { "code": code, "message": message } })),
    )
        .into_response()
}

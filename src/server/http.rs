//! HTTP transport for the gateway.
//!
//! `POST /mcp` accepts one JSON-RPC message per request and returns its
//! response (204 for notifications). `GET /healthz` exposes the registry
//! health payload for probes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::HangarError;
use crate::server::{tools, GatewayServer};

/// Build the gateway router.
pub fn router(server: GatewayServer) -> Router {
    Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/healthz", get(handle_healthz))
        .with_state(Arc::new(server))
}

async fn handle_mcp(
    State(server): State<Arc<GatewayServer>>,
    Json(message): Json<Value>,
) -> impl IntoResponse {
    match server.handle_message(message).await {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn handle_healthz(State(server): State<Arc<GatewayServer>>) -> impl IntoResponse {
    let payload = tools::dispatch_tool(server.context(), "hangar_health", &Value::Null).await;
    let status = if payload.get("status").and_then(Value::as_str) == Some("healthy") {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(payload))
}

/// Bind and serve until cancelled.
pub async fn run_http_server(
    server: GatewayServer,
    host: &str,
    port: u16,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let app = router(server);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        HangarError::Transport("gateway".to_string(), format!("failed to bind {addr}: {e}"))
    })?;

    tracing::info!(host = %host, port = %port, "http transport listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| HangarError::Transport("gateway".to_string(), e.to_string()))?;

    tracing::info!("http transport stopped");
    Ok(())
}

//! HTTP transport for the tool server using Axum.

use axum::{
    body::Body,
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::rpc::{codes, RpcError, RpcResponse};
use super::server::{McpServer, SERVER_NAME};

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the HTTP router: `POST /mcp` and `GET /health`.
pub fn build_router(server: McpServer) -> Router {
    Router::new()
        .route("/mcp", post(handle_rpc))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(server)
}

/// Every body gets HTTP 200 with an RPC response, including parse failures
/// and bodies over the size limit.
async fn handle_rpc(State(server): State<McpServer>, body: Body) -> Json<RpcResponse> {
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("Rejected RPC body: {}", e);
            return Json(RpcResponse::failure(
                Value::Null,
                RpcError::new(
                    codes::INVALID_REQUEST,
                    format!("Request body unreadable or larger than {} bytes", MAX_BODY_BYTES),
                ),
            ));
        }
    };
    match std::str::from_utf8(&bytes) {
        Ok(text) => Json(server.handle_json(text).await),
        Err(e) => Json(RpcResponse::failure(
            Value::Null,
            RpcError::new(codes::PARSE_ERROR, format!("Parse error: {}", e)),
        )),
    }
}

async fn health(State(server): State<McpServer>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "server": SERVER_NAME,
        "tools": server.tools().len(),
    }))
}

/// Serve the tool server until the process is stopped.
pub async fn run_server(server: McpServer, host: &str, port: u16) -> anyhow::Result<()> {
    let app = build_router(server);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid address {}:{}: {}", host, port, e))?;

    tracing::info!("Starting MCP server on http://{}/mcp", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

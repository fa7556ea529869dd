//! MCP tool server: JSON-RPC dispatch over the tool registry.

use serde_json::{json, Value};
use std::sync::Arc;

use super::rpc::{codes, RpcError, RpcRequest, RpcResponse, JSONRPC_VERSION};
use super::tools::ToolRegistry;
use crate::storage::Store;

pub const PROTOCOL_VERSION: &str = "2025-03-26";
pub const SERVER_NAME: &str = "switchboard-mcp";

/// Dispatches RPC requests to tools. Cloning shares the store and registry.
///
/// Every request yields a well-formed response; handler faults never escape.
#[derive(Clone)]
pub struct McpServer {
    store: Store,
    tools: Arc<ToolRegistry>,
}

impl McpServer {
    pub fn new(store: Store, tools: ToolRegistry) -> Self {
        Self {
            store,
            tools: Arc::new(tools),
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Handle a raw request body.
    pub async fn handle_json(&self, body: &str) -> RpcResponse {
        let value: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("Unparseable RPC body: {}", e);
                return RpcResponse::failure(
                    Value::Null,
                    RpcError::new(codes::PARSE_ERROR, format!("Parse error: {}", e)),
                );
            }
        };

        let id = value.get("id").cloned().unwrap_or(Value::Null);
        match serde_json::from_value::<RpcRequest>(value) {
            Ok(request) => self.handle(request).await,
            Err(e) => RpcResponse::failure(
                id,
                RpcError::new(codes::INVALID_REQUEST, format!("Invalid request: {}", e)),
            ),
        }
    }

    /// Handle a parsed request. The response id always equals the request id.
    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let id = request.id.clone();
        if request.jsonrpc != JSONRPC_VERSION {
            return RpcResponse::failure(
                id,
                RpcError::new(
                    codes::INVALID_REQUEST,
                    format!("Unsupported jsonrpc version '{}'", request.jsonrpc),
                ),
            );
        }

        tracing::debug!("RPC {} id={}", request.method, id);
        let outcome = match request.method.as_str() {
            "initialize" => Ok(self.initialize()),
            "tools/list" => Ok(self.list_tools()),
            "tools/call" => self.tools_call(&request.params).await,
            method => self.call_tool(method, request.params).await,
        };

        match outcome {
            Ok(result) => RpcResponse::success(id, result),
            Err(error) => {
                tracing::debug!("RPC {} failed: {} {}", request.method, error.code, error.message);
                RpcResponse::failure(id, error)
            }
        }
    }

    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {"name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION")},
        })
    }

    fn list_tools(&self) -> Value {
        let tools: Vec<Value> = self.tools.iter().map(|t| t.describe()).collect();
        json!({ "tools": tools })
    }

    async fn tools_call(&self, params: &Value) -> Result<Value, RpcError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::new(codes::INVALID_PARAMS, "tools/call requires a tool 'name'"))?;
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

        let result = self.call_tool(name, arguments).await?;
        Ok(json!({
            "content": [{"type": "text", "text": result.to_string()}],
            "structuredContent": result,
            "isError": false,
        }))
    }

    /// Look up, validate, and run one tool.
    pub async fn call_tool(&self, name: &str, params: Value) -> Result<Value, RpcError> {
        let tool = self.tools.get(name).cloned().ok_or_else(|| {
            RpcError::new(codes::METHOD_NOT_FOUND, format!("Method not found: {}", name))
        })?;

        let params = without_nulls(params);
        tool.validate(&params).map_err(|violations| {
            let message = violations
                .iter()
                .filter_map(|v| v["message"].as_str())
                .collect::<Vec<_>>()
                .join("; ");
            RpcError::new(codes::INVALID_PARAMS, format!("Invalid params: {}", message))
                .with_data(json!({"tool": name, "violations": violations}))
        })?;

        let store = self.store.clone();
        let tool_name = tool.name;
        let joined = tokio::task::spawn_blocking(move || tool.invoke(&store, &params)).await;

        match joined {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                tracing::debug!("Tool {} failed: {}", tool_name, e);
                Err(RpcError::from_error(tool_name, &e))
            }
            Err(e) => {
                tracing::error!("Tool {} panicked or was cancelled: {}", tool_name, e);
                Err(RpcError::new(codes::INTERNAL_ERROR, "Internal error")
                    .with_data(json!({"tool": tool_name})))
            }
        }
    }
}

/// Absent params and null-valued arguments both mean "not given".
fn without_nulls(params: Value) -> Value {
    match params {
        Value::Null => json!({}),
        Value::Object(map) => Value::Object(map.into_iter().filter(|(_, v)| !v.is_null()).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> McpServer {
        let store = Store::open_in_memory().unwrap();
        store.seed_sample_data().unwrap();
        McpServer::new(store, ToolRegistry::catalog(2).unwrap())
    }

    #[tokio::test]
    async fn test_direct_call() {
        let resp = server()
            .handle(RpcRequest::new(1, "get_customer", json!({"customer_id": 5})))
            .await;
        assert_eq!(resp.id, json!(1));
        assert_eq!(resp.result.unwrap()["email"], "user5@example.com");
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let resp = server().handle(RpcRequest::new("abc", "drop_tables", Value::Null)).await;
        assert_eq!(resp.id, json!("abc"));
        assert_eq!(resp.error.unwrap().code, codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let resp = server()
            .handle(RpcRequest::new(2, "get_customer", json!({"customer_id": "five"})))
            .await;
        let error = resp.error.unwrap();
        assert_eq!(error.code, codes::INVALID_PARAMS);
        let data = error.data.unwrap();
        assert_eq!(data["tool"], "get_customer");
        assert_eq!(data["violations"][0]["path"], "/customer_id");
    }

    #[tokio::test]
    async fn test_missing_and_null_params() {
        let server = server();
        let resp = server.handle(RpcRequest::new(5, "get_customer", Value::Null)).await;
        assert_eq!(resp.error.unwrap().code, codes::INVALID_PARAMS);

        let resp = server
            .handle(RpcRequest::new(6, "list_customers", json!({"status": null, "limit": 2})))
            .await;
        assert_eq!(resp.result.unwrap().as_array().unwrap().len(), 2);

        let resp = server.handle(RpcRequest::new(7, "get_open_tickets", Value::Null)).await;
        assert!(!resp.is_error());
    }

    #[tokio::test]
    async fn test_not_found_maps_to_application_code() {
        let resp = server()
            .handle(RpcRequest::new(3, "get_customer", json!({"customer_id": 999})))
            .await;
        let error = resp.error.unwrap();
        assert_eq!(error.code, codes::NOT_FOUND);
        assert!(error.message.contains("999"));
        assert_eq!(error.data.unwrap()["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_referential_error() {
        let resp = server()
            .handle(RpcRequest::new(
                4,
                "create_ticket",
                json!({"customer_id": 777, "issue": "Ghost", "priority": "high"}),
            ))
            .await;
        assert_eq!(resp.error.unwrap().code, codes::REFERENTIAL);
    }

    #[tokio::test]
    async fn test_parse_and_invalid_request() {
        let server = server();
        let resp = server.handle_json("{not json").await;
        assert_eq!(resp.error.unwrap().code, codes::PARSE_ERROR);
        assert_eq!(resp.id, Value::Null);

        let resp = server.handle_json(r#"{"id": 9, "params": {}}"#).await;
        assert_eq!(resp.id, json!(9));
        assert_eq!(resp.error.unwrap().code, codes::INVALID_REQUEST);

        let resp = server
            .handle_json(r#"{"jsonrpc": "1.0", "id": 10, "method": "tools/list"}"#)
            .await;
        assert_eq!(resp.error.unwrap().code, codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_mcp_methods() {
        let server = server();
        let init = server.handle(RpcRequest::new(1, "initialize", json!({}))).await;
        assert_eq!(init.result.unwrap()["serverInfo"]["name"], SERVER_NAME);

        let list = server.handle(RpcRequest::new(2, "tools/list", Value::Null)).await;
        let tools = list.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, server.tools().len());

        let call = server
            .handle(RpcRequest::new(
                3,
                "tools/call",
                json!({"name": "get_customer_history", "arguments": {"customer_id": 5}}),
            ))
            .await;
        let result = call.result.unwrap();
        assert_eq!(result["isError"], false);
        assert_eq!(result["structuredContent"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_calls() {
        let server = server();
        let mut handles = Vec::new();
        for i in 0..16u64 {
            let server = server.clone();
            handles.push(tokio::spawn(async move {
                server
                    .handle(RpcRequest::new(
                        i,
                        "update_customer",
                        json!({"customer_id": 6, "fields": {"phone": format!("+1-555-9{:03}", i)}}),
                    ))
                    .await
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let resp = handle.await.unwrap();
            assert_eq!(resp.id, json!(i as u64));
            assert!(!resp.is_error());
        }
    }
}

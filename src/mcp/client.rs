//! MCP client: typed tool calls with id correlation and bounded retries.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::rpc::{codes, RpcRequest, RpcResponse};
use super::server::McpServer;
use crate::error::{Error, Result};
use crate::storage::{Customer, CustomerStatus, OpenTicket, Priority, Ticket};

/// Failures below the RPC layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Server unreachable: {0}")]
    Unreachable(String),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// Carries one request to a tool server and returns its response.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn exchange(&self, request: RpcRequest) -> std::result::Result<RpcResponse, TransportError>;
}

/// Calls a server in the same process.
pub struct LocalTransport {
    server: McpServer,
}

impl LocalTransport {
    pub fn new(server: McpServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl McpTransport for LocalTransport {
    async fn exchange(&self, request: RpcRequest) -> std::result::Result<RpcResponse, TransportError> {
        Ok(self.server.handle(request).await)
    }
}

/// Posts requests to a remote `/mcp` endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn exchange(&self, request: RpcRequest) -> std::result::Result<RpcResponse, TransportError> {
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    TransportError::Unreachable(self.url.clone())
                } else {
                    TransportError::Http(e)
                }
            })?;

        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; at most `max_retries + 1` attempts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay after failed attempt `attempt` (1-based): initial × 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Tool caller used by agents.
pub struct McpClient {
    transport: Arc<dyn McpTransport>,
    policy: RetryPolicy,
    next_id: AtomicU64,
    in_flight: Mutex<HashSet<u64>>,
}

impl McpClient {
    pub fn new(transport: Arc<dyn McpTransport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            next_id: AtomicU64::new(1),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn local(server: McpServer, policy: RetryPolicy) -> Self {
        Self::new(Arc::new(LocalTransport::new(server)), policy)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call a tool. RPC error objects become `Upstream`; transport failures
    /// that outlast the retry policy become `Unavailable`.
    pub async fn call_tool(&self, name: &str, params: Value) -> Result<Value> {
        let attempts = self.policy.attempts();
        let mut last_error: Option<Error> = None;

        for attempt in 1..=attempts {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.track(id)?;

            let outcome = self
                .transport
                .exchange(RpcRequest::new(id, name, params.clone()))
                .await;
            self.untrack(id);

            match outcome {
                Ok(response) => {
                    if response.id != json!(id) {
                        return Err(Error::Protocol(format!(
                            "response id {} does not match request id {}",
                            response.id, id
                        )));
                    }
                    match response.into_result() {
                        Ok(result) => return Ok(result),
                        Err(rpc) if codes::is_retryable(rpc.code) => {
                            tracing::warn!(
                                "Tool {} attempt {}/{} failed with retryable code {}: {}",
                                name,
                                attempt,
                                attempts,
                                rpc.code,
                                rpc.message
                            );
                            last_error = Some(rpc.into());
                        }
                        Err(rpc) => return Err(rpc.into()),
                    }
                }
                Err(e) => {
                    tracing::warn!("Tool {} attempt {}/{} failed: {}", name, attempt, attempts, e);
                    last_error = Some(Error::Unavailable {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.policy.backoff(attempt)).await;
            }
        }

        Err(last_error.unwrap_or(Error::Unavailable {
            attempts,
            message: format!("tool {} was never attempted", name),
        }))
    }

    // An id is outstanding from send until its response is matched.
    fn track(&self, id: u64) -> Result<()> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| Error::Protocol("in-flight table poisoned".to_string()))?;
        if !in_flight.insert(id) {
            return Err(Error::Protocol(format!("request id {} already in flight", id)));
        }
        Ok(())
    }

    fn untrack(&self, id: u64) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&id);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|s| s.len()).unwrap_or(0)
    }

    async fn call_typed<T: DeserializeOwned>(&self, name: &str, params: Value) -> Result<T> {
        let value = self.call_tool(name, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn list_tools(&self) -> Result<Value> {
        self.call_tool("tools/list", Value::Null).await
    }

    pub async fn get_customer(&self, customer_id: i64) -> Result<Customer> {
        self.call_typed("get_customer", json!({"customer_id": customer_id}))
            .await
    }

    pub async fn list_customers(&self, status: Option<CustomerStatus>, limit: Option<u32>) -> Result<Vec<Customer>> {
        let mut params = json!({});
        if let Some(status) = status {
            params["status"] = json!(status);
        }
        if let Some(limit) = limit {
            params["limit"] = json!(limit);
        }
        self.call_typed("list_customers", params).await
    }

    pub async fn update_customer(&self, customer_id: i64, fields: Value) -> Result<Customer> {
        self.call_typed(
            "update_customer",
            json!({"customer_id": customer_id, "fields": fields}),
        )
        .await
    }

    pub async fn create_ticket(&self, customer_id: i64, issue: &str, priority: Priority) -> Result<Ticket> {
        self.call_typed(
            "create_ticket",
            json!({"customer_id": customer_id, "issue": issue, "priority": priority}),
        )
        .await
    }

    pub async fn get_customer_history(&self, customer_id: i64) -> Result<Vec<Ticket>> {
        self.call_typed("get_customer_history", json!({"customer_id": customer_id}))
            .await
    }

    pub async fn get_customers_with_open_tickets(&self) -> Result<Vec<Customer>> {
        self.call_typed("get_customers_with_open_tickets", json!({})).await
    }

    pub async fn get_premium_customers(&self) -> Result<Vec<Customer>> {
        self.call_typed("get_premium_customers", json!({})).await
    }

    pub async fn search_customers(&self, query: &str, limit: Option<u32>) -> Result<Vec<Customer>> {
        let mut params = json!({"query": query});
        if let Some(limit) = limit {
            params["limit"] = json!(limit);
        }
        self.call_typed("search_customers", params).await
    }

    pub async fn get_open_tickets(&self, limit: Option<u32>) -> Result<Vec<OpenTicket>> {
        let params = match limit {
            Some(limit) => json!({"limit": limit}),
            None => json!({}),
        };
        self.call_typed("get_open_tickets", params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::rpc::RpcError;
    use crate::mcp::ToolRegistry;
    use crate::storage::Store;
    use std::sync::atomic::AtomicU32;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        }
    }

    fn local_client() -> McpClient {
        let store = Store::open_in_memory().unwrap();
        store.seed_sample_data().unwrap();
        McpClient::local(McpServer::new(store, ToolRegistry::catalog(2).unwrap()), fast_policy(2))
    }

    /// Fails the first `failures` exchanges, then answers with `reply`.
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        reply: fn(&RpcRequest) -> RpcResponse,
    }

    #[async_trait]
    impl McpTransport for Flaky {
        async fn exchange(&self, request: RpcRequest) -> std::result::Result<RpcResponse, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(TransportError::Unreachable("test".into()));
            }
            Ok((self.reply)(&request))
        }
    }

    fn flaky(failures: u32, reply: fn(&RpcRequest) -> RpcResponse) -> Arc<Flaky> {
        Arc::new(Flaky {
            calls: AtomicU32::new(0),
            failures,
            reply,
        })
    }

    fn ok_reply(request: &RpcRequest) -> RpcResponse {
        RpcResponse::success(request.id.clone(), json!({"ok": true}))
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(80), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retry_bound_then_unavailable() {
        let transport = flaky(u32::MAX, ok_reply);
        let client = McpClient::new(transport.clone(), fast_policy(3));

        let err = client.call_tool("get_customer", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable { attempts: 4, .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_recovers_within_budget() {
        let transport = flaky(2, ok_reply);
        let client = McpClient::new(transport.clone(), fast_policy(2));

        let result = client.call_tool("get_customer", json!({})).await.unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_application_error_not_retried() {
        let transport = flaky(0, |req| {
            RpcResponse::failure(req.id.clone(), RpcError::new(codes::NOT_FOUND, "missing"))
        });
        let client = McpClient::new(transport.clone(), fast_policy(3));

        let err = client.call_tool("get_customer", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Upstream { code: codes::NOT_FOUND, .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retryable_server_error_exhausts_as_upstream() {
        let transport = flaky(0, |req| {
            RpcResponse::failure(
                req.id.clone(),
                RpcError::new(codes::STORAGE_UNAVAILABLE, "busy"),
            )
        });
        let client = McpClient::new(transport.clone(), fast_policy(1));

        let err = client.call_tool("get_customer", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Upstream { code: codes::STORAGE_UNAVAILABLE, .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mismatched_response_id_rejected() {
        let transport = flaky(0, |_| RpcResponse::success(json!(999_999), json!({})));
        let client = McpClient::new(transport, fast_policy(0));

        let err = client.call_tool("get_customer", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_each_attempt_gets_fresh_id() {
        struct Recorder {
            ids: Mutex<Vec<Value>>,
        }

        #[async_trait]
        impl McpTransport for Recorder {
            async fn exchange(&self, request: RpcRequest) -> std::result::Result<RpcResponse, TransportError> {
                self.ids.lock().unwrap().push(request.id.clone());
                Err(TransportError::Status(503))
            }
        }

        let recorder = Arc::new(Recorder {
            ids: Mutex::new(Vec::new()),
        });
        let client = McpClient::new(recorder.clone(), fast_policy(2));
        let _ = client.call_tool("get_customer", json!({})).await;

        let ids = recorder.ids.lock().unwrap().clone();
        assert_eq!(ids.len(), 3);
        let unique: HashSet<String> = ids.iter().map(|v| v.to_string()).collect();
        assert_eq!(unique.len(), 3);
    }

    #[tokio::test]
    async fn test_typed_calls_against_local_server() {
        let client = local_client();

        let customer = client.get_customer(5).await.unwrap();
        assert_eq!(customer.name, "Test User 5");

        let history = client.get_customer_history(5).await.unwrap();
        assert_eq!(history.len(), 2);

        let ticket = client
            .create_ticket(12345, "Upgrade request", Priority::High)
            .await
            .unwrap();
        assert_eq!(ticket.priority, Priority::High);

        let updated = client
            .update_customer(5, json!({"email": "new@email.com"}))
            .await
            .unwrap();
        assert_eq!(updated.email.as_deref(), Some("new@email.com"));

        let disabled = client
            .list_customers(Some(CustomerStatus::Disabled), None)
            .await
            .unwrap();
        assert_eq!(disabled.len(), 3);

        let err = client.get_customer(31337).await.unwrap_err();
        assert!(matches!(err, Error::Upstream { code: codes::NOT_FOUND, .. }));
    }

    #[tokio::test]
    async fn test_concurrent_ids_are_unique() {
        let client = Arc::new(local_client());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let client = client.clone();
            handles.push(tokio::spawn(async move { client.get_customer(1).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(client.in_flight(), 0);
    }
}

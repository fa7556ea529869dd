//! JSON-RPC 2.0 request and response types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard and application error codes.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    // Application range
    pub const NOT_FOUND: i64 = -32001;
    pub const REFERENTIAL: i64 = -32002;
    pub const VALIDATION: i64 = -32003;
    pub const STORAGE_UNAVAILABLE: i64 = -32010;

    /// Server faults a client may retry.
    pub fn is_retryable(code: i64) -> bool {
        matches!(code, STORAGE_UNAVAILABLE | INTERNAL_ERROR)
    }
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Map a handler failure to the application error range.
    ///
    /// Storage and other internal faults are reported without their detail.
    pub fn from_error(tool: &str, err: &Error) -> Self {
        let (code, message) = match err {
            Error::NotFound(m) => (codes::NOT_FOUND, m.clone()),
            Error::Referential(m) => (codes::REFERENTIAL, m.clone()),
            Error::Validation(m) => (codes::VALIDATION, m.clone()),
            Error::Storage(_) => (codes::STORAGE_UNAVAILABLE, "Storage temporarily unavailable".to_string()),
            _ => (codes::INTERNAL_ERROR, "Internal error".to_string()),
        };
        Self::new(code, message).with_data(serde_json::json!({
            "tool": tool,
            "kind": err.kind(),
        }))
    }
}

impl From<RpcError> for Error {
    fn from(e: RpcError) -> Self {
        Error::Upstream {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The result, or the error object. A response with neither is malformed.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Err(RpcError::new(
                codes::INTERNAL_ERROR,
                "response carried neither result nor error",
            )),
        }
    }
}

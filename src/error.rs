//! Error types for Switchboard.

use serde_json::Value;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed envelope, unknown message type, or unknown sender/recipient.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Registry or entity lookup miss.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Parameter schema or enum violation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Dangling foreign key.
    #[error("Referential error: {0}")]
    Referential(String),

    /// A tool call returned an RPC error object.
    #[error("Upstream error {code}: {message}")]
    Upstream {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Transport failure that survived every retry.
    #[error("Unavailable after {attempts} attempt(s): {message}")]
    Unavailable { attempts: u32, message: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable tag used in error envelopes and failure manifests.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Protocol(_) => "protocol",
            Error::NotFound(_) => "not_found",
            Error::Validation(_) => "validation",
            Error::Referential(_) => "referential",
            Error::Upstream { .. } => "upstream",
            Error::Unavailable { .. } => "unavailable",
            Error::Timeout(_) => "timeout",
            Error::Config(_) => "config",
            Error::Storage(_) => "storage",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }

    /// Structured cause carried in the payload of `error` envelopes.
    pub fn to_cause(&self) -> Value {
        let mut cause = serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        match self {
            Error::Upstream { code, data, .. } => {
                cause["code"] = Value::from(*code);
                if let Some(data) = data {
                    cause["data"] = data.clone();
                }
            }
            Error::Unavailable { attempts, .. } => {
                cause["attempts"] = Value::from(*attempts);
            }
            _ => {}
        }
        cause
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

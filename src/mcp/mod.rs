//! Model Context Protocol tool server and client.
//!
//! The server exposes the customer/ticket store as named, schema-validated
//! tools over JSON-RPC 2.0, served over HTTP or stdio. Agents reach it
//! through [`McpClient`], either in-process or over HTTP.

pub mod client;
pub mod http;
pub mod rpc;
pub mod server;
pub mod stdio;
pub mod tools;

pub use client::{HttpTransport, LocalTransport, McpClient, McpTransport, RetryPolicy, TransportError};
pub use rpc::{codes, RpcError, RpcRequest, RpcResponse};
pub use server::McpServer;
pub use tools::ToolRegistry;

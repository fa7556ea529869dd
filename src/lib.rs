//! Switchboard library root.

pub mod agents;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod error;
pub mod logging;
pub mod mcp;
pub mod protocol;
pub mod storage;
pub mod system;

pub use agents::router::{FinalAnswer, ManifestEntry, ManifestStatus, Router};
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use error::{Error, Result};
pub use mcp::{McpClient, McpServer};
pub use protocol::{AgentRegistry, Envelope, LocalBus, MessageType};
pub use storage::Store;
pub use system::System;

//! Configuration loading for Switchboard.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agents::{customer_data, support, CUSTOMER_DATA, SUPPORT};
use crate::error::{Error, Result};
use crate::mcp::client::RetryPolicy;
use crate::storage::Priority;

/// Get the Switchboard home directory (~/.switchboard).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".switchboard"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.switchboard/settings.json
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;

    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    load_settings_from(&path)
}

/// Load and validate settings from an explicit path.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;

    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    for (intent, steps) in &settings.router.routes {
        if steps.is_empty() {
            return Err(Error::Config(format!(
                "router.routes.{} has an empty pipeline",
                intent
            )));
        }
        for step in steps {
            let known_ops: &[&str] = match step.agent.as_str() {
                CUSTOMER_DATA => customer_data::OPERATIONS,
                SUPPORT => support::OPERATIONS,
                other => {
                    return Err(Error::Config(format!(
                        "router.routes.{} references unknown agent '{}'",
                        intent, other
                    )))
                }
            };
            if let Some(op) = step.operation.as_deref() {
                if !known_ops.contains(&op) {
                    return Err(Error::Config(format!(
                        "router.routes.{}: agent '{}' has no operation '{}'",
                        intent, step.agent, op
                    )));
                }
            }
        }
    }

    if settings.router.sub_request_timeout_ms == 0 || settings.router.conversation_deadline_ms == 0 {
        return Err(Error::Config("router timeouts must be positive".to_string()));
    }
    if settings.retry.initial_backoff_ms > settings.retry.max_backoff_ms {
        return Err(Error::Config(
            "retry.initial_backoff_ms exceeds retry.max_backoff_ms".to_string(),
        ));
    }
    if settings.support.open_ticket_threshold == 0 {
        return Err(Error::Config(
            "support.open_ticket_threshold must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Storage configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StorageConfig {
    pub database_path: Option<PathBuf>,
}

impl StorageConfig {
    /// Configured database path, or ~/.switchboard/customers.db.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("customers.db")),
        }
    }
}

/// MCP server and client configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct McpConfig {
    #[serde(default = "default_mcp_bind")]
    pub bind: String,
    #[serde(default = "default_mcp_port")]
    pub port: u16,
    /// When set, agents reach the tool server over HTTP instead of in-process.
    pub remote_url: Option<String>,
    #[serde(default = "default_premium_min_tickets")]
    pub premium_min_tickets: u32,
}

fn default_mcp_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_mcp_port() -> u16 {
    8080
}

fn default_premium_min_tickets() -> u32 {
    2
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            bind: default_mcp_bind(),
            port: default_mcp_port(),
            remote_url: None,
            premium_min_tickets: default_premium_min_tickets(),
        }
    }
}

/// One hop of an intent's agent pipeline.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RouteStep {
    pub agent: String,
    #[serde(default)]
    pub operation: Option<String>,
}

impl RouteStep {
    pub fn new(agent: &str, operation: Option<&str>) -> Self {
        Self {
            agent: agent.to_string(),
            operation: operation.map(str::to_string),
        }
    }
}

/// Router configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RouterConfig {
    #[serde(default = "default_sub_request_timeout_ms")]
    pub sub_request_timeout_ms: u64,
    #[serde(default = "default_conversation_deadline_ms")]
    pub conversation_deadline_ms: u64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_routes")]
    pub routes: BTreeMap<String, Vec<RouteStep>>,
}

fn default_sub_request_timeout_ms() -> u64 {
    3000
}

fn default_conversation_deadline_ms() -> u64 {
    10_000
}

fn default_retention_secs() -> u64 {
    300
}

/// The shipped intent → pipeline table.
pub fn default_routes() -> BTreeMap<String, Vec<RouteStep>> {
    let single = |op: &str| vec![RouteStep::new(CUSTOMER_DATA, Some(op))];
    let mut routes = BTreeMap::new();
    routes.insert("account_lookup".to_string(), single("get_customer"));
    routes.insert("list_customers".to_string(), single("list_customers"));
    routes.insert("search_customers".to_string(), single("search_customers"));
    routes.insert("update_email".to_string(), single("update_customer"));
    routes.insert("update_phone".to_string(), single("update_customer"));
    routes.insert("update_customer".to_string(), single("update_customer"));
    routes.insert("history_lookup".to_string(), single("get_customer_history"));
    routes.insert(
        "open_ticket_customers".to_string(),
        single("get_customers_with_open_tickets"),
    );
    routes.insert("premium_customers".to_string(), single("get_premium_customers"));
    routes.insert("account_overview".to_string(), single("customer_overview"));
    routes.insert(
        "upgrade_request".to_string(),
        vec![
            RouteStep::new(CUSTOMER_DATA, Some("get_customer")),
            RouteStep::new(SUPPORT, Some("create_ticket")),
        ],
    );
    routes.insert(
        "support_request".to_string(),
        vec![
            RouteStep::new(CUSTOMER_DATA, Some("get_customer")),
            RouteStep::new(SUPPORT, Some("create_ticket")),
        ],
    );
    routes
}

impl RouterConfig {
    pub fn sub_request_timeout(&self) -> Duration {
        Duration::from_millis(self.sub_request_timeout_ms)
    }

    pub fn conversation_deadline(&self) -> Duration {
        Duration::from_millis(self.conversation_deadline_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            sub_request_timeout_ms: default_sub_request_timeout_ms(),
            conversation_deadline_ms: default_conversation_deadline_ms(),
            retention_secs: default_retention_secs(),
            routes: default_routes(),
        }
    }
}

/// Support agent configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SupportConfig {
    /// Phrases that flag a query for escalation (case-insensitive substring match).
    #[serde(default = "default_escalation_indicators")]
    pub escalation_indicators: Vec<String>,
    /// Unresolved tickets at or above this count also escalate.
    #[serde(default = "default_open_ticket_threshold")]
    pub open_ticket_threshold: u32,
    #[serde(default = "default_ticket_priority")]
    pub default_priority: Priority,
}

fn default_escalation_indicators() -> Vec<String> {
    [
        "charged twice",
        "double charged",
        "duplicate charge",
        "refund",
        "urgent",
        "immediately",
        "still not working",
        "keeps failing",
        "third time",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_open_ticket_threshold() -> u32 {
    3
}

fn default_ticket_priority() -> Priority {
    Priority::Medium
}

impl Default for SupportConfig {
    fn default() -> Self {
        Self {
            escalation_indicators: default_escalation_indicators(),
            open_ticket_threshold: default_open_ticket_threshold(),
            default_priority: default_ticket_priority(),
        }
    }
}

/// Switchboard settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub mcp: McpConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub support: SupportConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(validate_settings(&settings).is_ok());
        assert_eq!(settings.router.routes["upgrade_request"].len(), 2);
        assert_eq!(settings.mcp.port, 8080);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"router": {"sub_request_timeout_ms": 250}, "support": {"escalation_indicators": ["chargeback"]}}"#,
        )
        .unwrap();

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings.router.sub_request_timeout_ms, 250);
        assert_eq!(settings.router.conversation_deadline_ms, 10_000);
        assert!(settings.router.routes.contains_key("account_lookup"));
        assert_eq!(settings.support.escalation_indicators, vec!["chargeback".to_string()]);
        assert_eq!(settings.support.default_priority, Priority::Medium);
    }

    #[test]
    fn test_unknown_agent_rejected() {
        let mut settings = Settings::default();
        settings
            .router
            .routes
            .insert("billing".to_string(), vec![RouteStep::new("billing", None)]);
        assert!(matches!(validate_settings(&settings), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let mut settings = Settings::default();
        settings.router.routes.insert(
            "account_lookup".to_string(),
            vec![RouteStep::new(CUSTOMER_DATA, Some("drop_tables"))],
        );
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn test_invalid_priority_fails_to_parse() {
        let parsed: std::result::Result<Settings, _> =
            serde_json::from_str(r#"{"support": {"default_priority": "critical"}}"#);
        assert!(parsed.is_err());
    }
}

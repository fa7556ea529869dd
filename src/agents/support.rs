//! Support agent: ticket handling and escalation.
//!
//! Escalation is a tagged outcome, never an error. A request escalates when
//! its text carries one of the configured indicator phrases or when the
//! customer already holds too many unresolved tickets.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{error_reply, Agent, QueryPayload, SUPPORT};
use crate::config::SupportConfig;
use crate::error::{Error, Result};
use crate::mcp::McpClient;
use crate::protocol::{Envelope, MessageType};
use crate::storage::{Priority, Ticket};

/// Operations this agent understands.
pub const OPERATIONS: &[&str] = &["create_ticket", "get_customer_history"];

const DEFAULT_ISSUE: &str = "Customer support request";

/// Indicator phrases that flag a request for escalation.
#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    indicators: Vec<String>,
}

impl EscalationPolicy {
    pub fn new(indicators: &[String]) -> Self {
        Self {
            indicators: indicators
                .iter()
                .map(|i| i.trim().to_lowercase())
                .filter(|i| !i.is_empty())
                .collect(),
        }
    }

    /// Indicators found in `text`, case-insensitively.
    pub fn matches(&self, text: &str) -> Vec<String> {
        let text = text.to_lowercase();
        self.indicators
            .iter()
            .filter(|i| text.contains(i.as_str()))
            .cloned()
            .collect()
    }
}

pub struct SupportAgent {
    client: Arc<McpClient>,
    policy: EscalationPolicy,
    open_ticket_threshold: usize,
    default_priority: Priority,
}

impl SupportAgent {
    pub fn new(client: Arc<McpClient>, config: &SupportConfig) -> Self {
        Self {
            client,
            policy: EscalationPolicy::new(&config.escalation_indicators),
            open_ticket_threshold: config.open_ticket_threshold as usize,
            default_priority: config.default_priority,
        }
    }

    async fn run(&self, operation: &str, query: &QueryPayload) -> Result<(bool, Value)> {
        if !OPERATIONS.contains(&operation) {
            return Err(Error::Validation(format!(
                "{} has no operation '{}'",
                SUPPORT, operation
            )));
        }
        let customer_id = query.require_customer_id()?;
        let history = self.client.get_customer_history(customer_id).await?;
        let unresolved = history.iter().filter(|t| t.status.is_unresolved()).count();

        let mut reasons = self.policy.matches(&query.text);
        if unresolved >= self.open_ticket_threshold {
            reasons.push(format!("{} unresolved tickets on record", unresolved));
        }
        let escalated = !reasons.is_empty();
        let priority = if escalated {
            Priority::High
        } else {
            self.default_priority
        };

        let mut payload = json!({
            "sub_intent": query.sub_intent,
            "operation": operation,
            "customer_id": customer_id,
            "escalated": escalated,
            "reasons": reasons,
            "priority": priority,
            "open_tickets": unresolved,
        });

        let summary = if operation == "create_ticket" {
            let issue = match query.text.trim() {
                "" => DEFAULT_ISSUE,
                text => text,
            };
            let ticket = self.client.create_ticket(customer_id, issue, priority).await?;
            let summary = describe_ticket(&ticket, escalated);
            payload["ticket"] = serde_json::to_value(ticket)?;
            summary
        } else {
            let summary = format!(
                "Customer {} has {} ticket(s), {} unresolved.",
                customer_id,
                history.len(),
                unresolved
            );
            payload["history"] = serde_json::to_value(&history)?;
            summary
        };
        payload["summary"] = json!(summary);

        if escalated {
            tracing::info!(
                "Escalating request for customer {}: {}",
                customer_id,
                payload["reasons"]
            );
        }
        Ok((escalated, payload))
    }
}

#[async_trait]
impl Agent for SupportAgent {
    fn name(&self) -> &str {
        SUPPORT
    }

    fn capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = OPERATIONS.iter().map(|op| op.to_string()).collect();
        caps.push("escalation".to_string());
        caps
    }

    async fn handle(&self, envelope: &Envelope) -> Envelope {
        tracing::debug!("{} <- {} ({})", SUPPORT, envelope.sender(), envelope.kind());
        if envelope.kind() != MessageType::Query {
            let err = Error::Protocol(format!("{} does not accept {} envelopes", SUPPORT, envelope.kind()));
            return error_reply(envelope, None, &err);
        }
        let query = match QueryPayload::parse(envelope) {
            Ok(q) => q,
            Err(e) => return error_reply(envelope, None, &e),
        };
        let operation = query
            .operation
            .clone()
            .unwrap_or_else(|| "create_ticket".to_string());

        match self.run(&operation, &query).await {
            Ok((true, payload)) => envelope.reply(MessageType::Escalation, payload),
            Ok((false, payload)) => envelope.reply(MessageType::Response, payload),
            Err(e) => {
                tracing::warn!("{} {} failed: {}", SUPPORT, operation, e);
                error_reply(envelope, Some(&operation), &e)
            }
        }
    }
}

fn describe_ticket(ticket: &Ticket, escalated: bool) -> String {
    if escalated {
        format!(
            "Your request has been escalated as ticket #{} with {} priority; a specialist will contact you shortly.",
            ticket.id, ticket.priority
        )
    } else {
        format!(
            "Created ticket #{} ({} priority) for customer {}.",
            ticket.id, ticket.priority, ticket.customer_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{classifier::Entities, ROUTER};
    use crate::mcp::{McpServer, RetryPolicy, ToolRegistry};
    use crate::storage::Store;
    use serde_json::Map;

    fn agent_with(config: &SupportConfig) -> (SupportAgent, Store) {
        let store = Store::open_in_memory().unwrap();
        store.seed_sample_data().unwrap();
        let server = McpServer::new(store.clone(), ToolRegistry::catalog(2).unwrap());
        let client = Arc::new(McpClient::local(server, RetryPolicy::default()));
        (SupportAgent::new(client, config), store)
    }

    fn query(text: &str, customer_id: Option<i64>, operation: Option<&str>) -> Envelope {
        let payload = QueryPayload {
            sub_intent: "s1".into(),
            intent: "support_request".into(),
            operation: operation.map(String::from),
            text: text.into(),
            entities: Entities {
                customer_id,
                ..Default::default()
            },
            context: Map::new(),
        };
        Envelope::new(
            ROUTER,
            SUPPORT,
            MessageType::Query,
            serde_json::to_value(payload).unwrap(),
            None,
        )
    }

    #[test]
    fn test_policy_is_case_insensitive() {
        let policy = EscalationPolicy::new(&["Charged Twice".to_string(), " ".to_string()]);
        assert_eq!(policy.matches("I was CHARGED TWICE!"), vec!["charged twice"]);
        assert!(policy.matches("all good").is_empty());
    }

    #[tokio::test]
    async fn test_indicator_escalates_with_high_priority() {
        let (agent, store) = agent_with(&SupportConfig::default());
        let reply = agent
            .handle(&query("I've been charged twice, please refund immediately!", Some(5), None))
            .await;

        assert_eq!(reply.kind(), MessageType::Escalation);
        assert_eq!(reply.payload()["escalated"], true);
        assert_eq!(reply.payload()["priority"], "high");
        assert_eq!(reply.payload()["ticket"]["priority"], "high");

        let history = store.get_customer_history(5).unwrap();
        assert_eq!(history[0].priority, Priority::High);
    }

    #[tokio::test]
    async fn test_plain_request_uses_default_priority() {
        let (agent, _) = agent_with(&SupportConfig::default());
        let reply = agent
            .handle(&query("Need help upgrading my account", Some(12345), Some("create_ticket")))
            .await;
        assert_eq!(reply.kind(), MessageType::Response);
        assert_eq!(reply.payload()["priority"], "medium");
        assert_eq!(reply.payload()["open_tickets"], 1);
    }

    #[tokio::test]
    async fn test_indicator_set_is_configuration() {
        let config = SupportConfig {
            escalation_indicators: vec!["upgrading".to_string()],
            ..SupportConfig::default()
        };
        let (agent, _) = agent_with(&config);
        let reply = agent
            .handle(&query("Need help upgrading my account", Some(12345), None))
            .await;
        assert_eq!(reply.kind(), MessageType::Escalation);
        assert_eq!(reply.payload()["reasons"][0], "upgrading");
    }

    #[tokio::test]
    async fn test_unresolved_tickets_escalate() {
        let config = SupportConfig {
            open_ticket_threshold: 2,
            ..SupportConfig::default()
        };
        let (agent, _) = agent_with(&config);
        // customer 1 has an open and an in-progress ticket
        let reply = agent
            .handle(&query("Show my tickets", Some(1), Some("get_customer_history")))
            .await;
        assert_eq!(reply.kind(), MessageType::Escalation);
        assert_eq!(reply.payload()["history"].as_array().unwrap().len(), 2);
        assert!(reply.payload().get("ticket").is_none());
    }

    #[tokio::test]
    async fn test_customer_from_context() {
        let (agent, _) = agent_with(&SupportConfig::default());
        let mut envelope_payload = serde_json::to_value(QueryPayload {
            sub_intent: "s1".into(),
            intent: "upgrade_request".into(),
            operation: Some("create_ticket".into()),
            text: "upgrade please".into(),
            ..Default::default()
        })
        .unwrap();
        envelope_payload["context"] = json!({"customer_data": {"result": {"id": 12345}}});
        let request = Envelope::new(ROUTER, SUPPORT, MessageType::Query, envelope_payload, None);

        let reply = agent.handle(&request).await;
        assert_eq!(reply.payload()["ticket"]["customer_id"], 12345);
    }

    #[tokio::test]
    async fn test_unknown_customer_is_error() {
        let (agent, _) = agent_with(&SupportConfig::default());
        let reply = agent.handle(&query("help", Some(424242), None)).await;
        assert_eq!(reply.kind(), MessageType::Error);
        assert_eq!(reply.payload()["operation"], "create_ticket");

        let reply = agent.handle(&query("help", None, None)).await;
        assert_eq!(reply.payload()["cause"]["kind"], "validation");
    }
}

//! Customer Data agent: customer reads and updates over MCP tools.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use super::{error_reply, Agent, QueryPayload, CUSTOMER_DATA};
use crate::error::{Error, Result};
use crate::mcp::McpClient;
use crate::protocol::{Envelope, MessageType};
use crate::storage::{Customer, CustomerStatus, OpenTicket, Ticket};

/// Operations this agent understands.
pub const OPERATIONS: &[&str] = &[
    "get_customer",
    "list_customers",
    "update_customer",
    "get_customer_history",
    "get_customers_with_open_tickets",
    "get_premium_customers",
    "search_customers",
    "get_open_tickets",
    "customer_overview",
];

/// Operation used for a query that names none.
fn default_operation(intent: &str) -> &'static str {
    match intent {
        "list_customers" => "list_customers",
        "search_customers" => "search_customers",
        "update_email" | "update_phone" | "update_customer" => "update_customer",
        "history_lookup" => "get_customer_history",
        "open_ticket_customers" => "get_customers_with_open_tickets",
        "premium_customers" => "get_premium_customers",
        "account_overview" => "customer_overview",
        _ => "get_customer",
    }
}

pub struct CustomerDataAgent {
    client: Arc<McpClient>,
}

impl CustomerDataAgent {
    pub fn new(client: Arc<McpClient>) -> Self {
        Self { client }
    }

    /// Run one operation for a query and return its result.
    async fn run(&self, operation: &str, query: &QueryPayload) -> Result<Value> {
        let result = match operation {
            "get_customer" => {
                let id = query.require_customer_id()?;
                serde_json::to_value(self.client.get_customer(id).await?)?
            }
            "list_customers" => {
                let status = query
                    .entities
                    .status
                    .as_deref()
                    .map(str::parse::<CustomerStatus>)
                    .transpose()?;
                serde_json::to_value(self.client.list_customers(status, None).await?)?
            }
            "update_customer" => {
                let id = query.require_customer_id()?;
                let fields = update_fields(query)?;
                serde_json::to_value(self.client.update_customer(id, fields).await?)?
            }
            "get_customer_history" => {
                let id = query.require_customer_id()?;
                serde_json::to_value(self.client.get_customer_history(id).await?)?
            }
            "get_customers_with_open_tickets" => {
                serde_json::to_value(self.client.get_customers_with_open_tickets().await?)?
            }
            "get_premium_customers" => {
                serde_json::to_value(self.client.get_premium_customers().await?)?
            }
            "search_customers" => {
                let term = query.entities.search_term.as_deref().ok_or_else(|| {
                    Error::Validation("a search term is required".to_string())
                })?;
                serde_json::to_value(self.client.search_customers(term, None).await?)?
            }
            "get_open_tickets" => serde_json::to_value(self.client.get_open_tickets(None).await?)?,
            "customer_overview" => {
                let id = query.require_customer_id()?;
                let customer = self.client.get_customer(id).await?;
                let tickets = self.client.get_customer_history(id).await?;
                json!({"customer": customer, "tickets": tickets})
            }
            other => {
                return Err(Error::Validation(format!(
                    "{} has no operation '{}'",
                    CUSTOMER_DATA, other
                )))
            }
        };
        Ok(result)
    }

    async fn handle_query(&self, envelope: &Envelope) -> Envelope {
        let query = match QueryPayload::parse(envelope) {
            Ok(q) => q,
            Err(e) => return error_reply(envelope, None, &e),
        };
        let operation = query
            .operation
            .clone()
            .unwrap_or_else(|| default_operation(&query.intent).to_string());

        match self.run(&operation, &query).await {
            Ok(result) => {
                let summary = summarize(&operation, &result);
                envelope.reply(
                    MessageType::DataResponse,
                    json!({
                        "sub_intent": query.sub_intent,
                        "operation": operation,
                        "result": result,
                        "summary": summary,
                    }),
                )
            }
            Err(e) => {
                tracing::warn!("{} {} failed: {}", CUSTOMER_DATA, operation, e);
                error_reply(envelope, Some(&operation), &e)
            }
        }
    }

    /// A raw `{tool, arguments}` request passed straight to the tool server.
    async fn handle_data_request(&self, envelope: &Envelope) -> Envelope {
        let payload = envelope.payload();
        let tool = match payload.get("tool").and_then(Value::as_str) {
            Some(tool) if OPERATIONS.contains(&tool) && tool != "customer_overview" => tool,
            Some(tool) => {
                let err = Error::Validation(format!("{} cannot serve tool '{}'", CUSTOMER_DATA, tool));
                return error_reply(envelope, Some(tool), &err);
            }
            None => {
                let err = Error::Validation("data_request needs a 'tool' name".to_string());
                return error_reply(envelope, None, &err);
            }
        };
        let arguments = payload.get("arguments").cloned().unwrap_or_else(|| json!({}));

        match self.client.call_tool(tool, arguments).await {
            Ok(result) => envelope.reply(
                MessageType::DataResponse,
                json!({"tool": tool, "result": result}),
            ),
            Err(e) => error_reply(envelope, Some(tool), &e),
        }
    }
}

#[async_trait]
impl Agent for CustomerDataAgent {
    fn name(&self) -> &str {
        CUSTOMER_DATA
    }

    fn capabilities(&self) -> Vec<String> {
        OPERATIONS.iter().map(|op| op.to_string()).collect()
    }

    async fn handle(&self, envelope: &Envelope) -> Envelope {
        tracing::debug!("{} <- {} ({})", CUSTOMER_DATA, envelope.sender(), envelope.kind());
        match envelope.kind() {
            MessageType::Query => self.handle_query(envelope).await,
            MessageType::DataRequest => self.handle_data_request(envelope).await,
            other => {
                let err = Error::Protocol(format!("{} does not accept {} envelopes", CUSTOMER_DATA, other));
                error_reply(envelope, None, &err)
            }
        }
    }
}

/// Fields to change, narrowed to what the intent asks for.
fn update_fields(query: &QueryPayload) -> Result<Value> {
    let entities = &query.entities;
    let mut fields = Map::new();
    match query.intent.as_str() {
        "update_email" => {
            let email = entities.email.clone().ok_or_else(|| {
                Error::Validation("no new email address was given".to_string())
            })?;
            fields.insert("email".into(), json!(email));
        }
        "update_phone" => {
            let phone = entities.phone.clone().ok_or_else(|| {
                Error::Validation("no new phone number was given".to_string())
            })?;
            fields.insert("phone".into(), json!(phone));
        }
        _ => {
            if let Some(name) = &entities.name {
                fields.insert("name".into(), json!(name));
            }
            if let Some(email) = &entities.email {
                fields.insert("email".into(), json!(email));
            }
            if let Some(phone) = &entities.phone {
                fields.insert("phone".into(), json!(phone));
            }
            if let Some(status) = &entities.status {
                fields.insert("status".into(), json!(status));
            }
        }
    }
    if fields.is_empty() {
        return Err(Error::Validation("nothing to update".to_string()));
    }
    Ok(Value::Object(fields))
}

/// One-line description of a result, used in the synthesized answer.
pub fn summarize(operation: &str, result: &Value) -> String {
    match operation {
        "get_customer" => match serde_json::from_value::<Customer>(result.clone()) {
            Ok(c) => describe_customer(&c),
            Err(_) => "Customer record retrieved.".to_string(),
        },
        "update_customer" => match serde_json::from_value::<Customer>(result.clone()) {
            Ok(c) => format!("Updated customer {}: {}", c.id, describe_contact(&c)),
            Err(_) => "Customer updated.".to_string(),
        },
        "get_customer_history" => {
            let tickets: Vec<Ticket> = serde_json::from_value(result.clone()).unwrap_or_default();
            describe_history(&tickets)
        }
        "get_open_tickets" => {
            let tickets: Vec<OpenTicket> = serde_json::from_value(result.clone()).unwrap_or_default();
            format!("{} open ticket(s).", tickets.len())
        }
        "customer_overview" => {
            let customer = result
                .get("customer")
                .cloned()
                .and_then(|c| serde_json::from_value::<Customer>(c).ok());
            let tickets: Vec<Ticket> = result
                .get("tickets")
                .cloned()
                .and_then(|t| serde_json::from_value(t).ok())
                .unwrap_or_default();
            match customer {
                Some(c) => format!("{} {}", describe_customer(&c), describe_history(&tickets)),
                None => describe_history(&tickets),
            }
        }
        _ => {
            let customers: Vec<Customer> = serde_json::from_value(result.clone()).unwrap_or_default();
            let names: Vec<String> = customers
                .iter()
                .take(5)
                .map(|c| format!("{} (#{})", c.name, c.id))
                .collect();
            match customers.len() {
                0 => "No matching customers.".to_string(),
                n if n > names.len() => format!("{} customers: {}, ...", n, names.join(", ")),
                n => format!("{} customer(s): {}", n, names.join(", ")),
            }
        }
    }
}

fn describe_customer(c: &Customer) -> String {
    format!("Customer {}: {} ({}), {}.", c.id, c.name, c.status, describe_contact(c))
}

fn describe_contact(c: &Customer) -> String {
    format!(
        "email {}, phone {}",
        c.email.as_deref().unwrap_or("none"),
        c.phone.as_deref().unwrap_or("none")
    )
}

fn describe_history(tickets: &[Ticket]) -> String {
    if tickets.is_empty() {
        return "No tickets on record.".to_string();
    }
    let unresolved = tickets.iter().filter(|t| t.status.is_unresolved()).count();
    let latest = &tickets[0];
    format!(
        "{} ticket(s), {} unresolved; latest: \"{}\" ({}, {}).",
        tickets.len(),
        unresolved,
        latest.issue,
        latest.status,
        latest.priority
    )
}

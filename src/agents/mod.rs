//! Agents and their runtime.
//!
//! Each agent owns a mailbox on the bus and answers every inbound envelope
//! with exactly one reply envelope. Agent-local failures become `error`
//! envelopes rather than propagating to the caller.

pub mod classifier;
pub mod customer_data;
pub mod router;
pub mod support;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::{Envelope, LocalBus, MessageType, Transport};

pub use classifier::{Classification, Classifier, Entities, KeywordClassifier};

pub const ROUTER: &str = "router";
pub const CUSTOMER_DATA: &str = "customer_data";
pub const SUPPORT: &str = "support";
/// Registry name under which end-user queries enter the system.
pub const USER: &str = "user";

#[async_trait]
pub trait Agent: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Vec<String>;

    /// Produce the reply to one inbound envelope.
    async fn handle(&self, envelope: &Envelope) -> Envelope;
}

/// Attach an agent to the bus and run its receive loop.
///
/// The agent is registered before this returns. Each envelope is handled
/// on its own task so one slow request never blocks the mailbox.
pub fn spawn_agent(agent: Arc<dyn Agent>, bus: LocalBus) -> JoinHandle<()> {
    let mut rx = bus.attach(agent.name(), agent.capabilities());
    tracing::info!("Agent {} online", agent.name());

    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let agent = agent.clone();
            let bus = bus.clone();
            tokio::spawn(async move {
                let reply = agent.handle(&envelope).await;
                if let Err(e) = bus.send(reply).await {
                    tracing::warn!(
                        "Agent {} could not reply to {}: {}",
                        agent.name(),
                        envelope.id(),
                        e
                    );
                }
            });
        }
        tracing::debug!("Agent {} mailbox closed", agent.name());
    })
}

/// Payload of a `query` envelope sent to a worker agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPayload {
    /// Which sub-intent of the user query this answers
    pub sub_intent: String,
    pub intent: String,
    #[serde(default)]
    pub operation: Option<String>,
    /// Clause text the sub-intent was read from
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub entities: Entities,
    /// Results of earlier pipeline hops, keyed by agent name
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl QueryPayload {
    pub fn parse(envelope: &Envelope) -> Result<Self> {
        serde_json::from_value(envelope.payload().clone())
            .map_err(|e| Error::Validation(format!("malformed query payload: {}", e)))
    }

    /// Customer id from the entities, else from a customer record an earlier hop produced.
    pub fn customer_id(&self) -> Option<i64> {
        self.entities.customer_id.or_else(|| {
            self.context.values().find_map(|hop| {
                hop.get("result")
                    .and_then(|r| r.get("customer").or(Some(r)))
                    .and_then(|c| c.get("id"))
                    .and_then(Value::as_i64)
            })
        })
    }

    pub fn require_customer_id(&self) -> Result<i64> {
        self.customer_id().ok_or_else(|| {
            Error::Validation("a customer id is required for this request".to_string())
        })
    }
}

/// Build the `error` reply for a failed request.
pub fn error_reply(request: &Envelope, operation: Option<&str>, err: &Error) -> Envelope {
    let sub_intent = request.payload().get("sub_intent").cloned().unwrap_or(Value::Null);
    request.reply(
        MessageType::Error,
        json!({
            "sub_intent": sub_intent,
            "operation": operation,
            "cause": err.to_cause(),
        }),
    )
}

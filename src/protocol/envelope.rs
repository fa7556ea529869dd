//! Message envelopes with conversation and causation IDs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::registry::AgentRegistry;
use super::types::MessageType;
use crate::error::{Error, Result};

/// One A2A message. Immutable once constructed; fields are read through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope")]
pub struct Envelope {
    /// Unique message ID (ULID)
    id: String,
    sender: String,
    recipient: String,
    #[serde(rename = "type")]
    kind: MessageType,
    payload: Value,
    /// Groups every envelope caused by one end-user query
    conversation_id: String,
    /// The envelope that triggered this one
    #[serde(skip_serializing_if = "Option::is_none")]
    causation_id: Option<String>,
    /// Emission timestamp (unix ms)
    timestamp: i64,
}

/// Envelope as it appears on the wire, before validation.
#[derive(Debug, Deserialize)]
struct WireEnvelope {
    id: Option<String>,
    sender: String,
    recipient: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    conversation_id: Option<String>,
    causation_id: Option<String>,
    timestamp: Option<i64>,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = Error;

    fn try_from(wire: WireEnvelope) -> Result<Self> {
        let kind: MessageType = wire.kind.parse()?;
        let conversation_id = wire.conversation_id.filter(|c| !c.is_empty());

        if wire.causation_id.is_some() && conversation_id.is_none() {
            return Err(Error::Protocol(
                "causation_id present without conversation_id".to_string(),
            ));
        }
        if wire.sender.is_empty() || wire.recipient.is_empty() {
            return Err(Error::Protocol("sender and recipient are required".to_string()));
        }

        Ok(Self {
            id: wire.id.filter(|i| !i.is_empty()).unwrap_or_else(generate_id),
            sender: wire.sender,
            recipient: wire.recipient,
            kind,
            payload: wire.payload,
            conversation_id: conversation_id.unwrap_or_else(generate_id),
            causation_id: wire.causation_id,
            timestamp: wire.timestamp.unwrap_or_else(current_timestamp),
        })
    }
}

impl Envelope {
    /// Create an envelope, reusing `conversation_id` if given or minting a new one.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        kind: MessageType,
        payload: Value,
        conversation_id: Option<String>,
    ) -> Self {
        Self {
            id: generate_id(),
            sender: sender.into(),
            recipient: recipient.into(),
            kind,
            payload,
            conversation_id: conversation_id.unwrap_or_else(generate_id),
            causation_id: None,
            timestamp: current_timestamp(),
        }
    }

    /// Answer this envelope: swaps the parties and records it as the cause.
    pub fn reply(&self, kind: MessageType, payload: Value) -> Self {
        Self {
            id: generate_id(),
            sender: self.recipient.clone(),
            recipient: self.sender.clone(),
            kind,
            payload,
            conversation_id: self.conversation_id.clone(),
            causation_id: Some(self.id.clone()),
            timestamp: current_timestamp(),
        }
    }

    /// Check the envelope against the registry.
    pub fn validate(&self, registry: &AgentRegistry) -> Result<()> {
        if !registry.contains(&self.sender) {
            return Err(Error::Protocol(format!("unknown sender '{}'", self.sender)));
        }
        if !registry.contains(&self.recipient) {
            return Err(Error::Protocol(format!(
                "unknown recipient '{}'",
                self.recipient
            )));
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Builder for envelopes that continue an existing conversation.
pub struct EnvelopeBuilder {
    sender: String,
    recipient: Option<String>,
    kind: MessageType,
    payload: Value,
    conversation_id: Option<String>,
    causation_id: Option<String>,
}

impl EnvelopeBuilder {
    /// Start building an envelope from an agent.
    pub fn from(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            recipient: None,
            kind: MessageType::Query,
            payload: Value::Null,
            conversation_id: None,
            causation_id: None,
        }
    }

    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn kind(mut self, kind: MessageType) -> Self {
        self.kind = kind;
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn conversation(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    /// Record the triggering envelope; adopts its conversation.
    pub fn caused_by(mut self, cause: &Envelope) -> Self {
        self.causation_id = Some(cause.id.clone());
        self.conversation_id = Some(cause.conversation_id.clone());
        self
    }

    /// Build the envelope.
    pub fn build(self) -> Result<Envelope> {
        let recipient = self
            .recipient
            .ok_or_else(|| Error::Protocol("recipient is required".to_string()))?;

        if self.causation_id.is_some() && self.conversation_id.is_none() {
            return Err(Error::Protocol(
                "causation_id present without conversation_id".to_string(),
            ));
        }

        let mut envelope = Envelope::new(
            self.sender,
            recipient,
            self.kind,
            self.payload,
            self.conversation_id,
        );
        envelope.causation_id = self.causation_id;
        Ok(envelope)
    }
}

fn generate_id() -> String {
    ulid::Ulid::new().to_string()
}

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Unix ms, strictly increasing within the process so emission order is total.
fn current_timestamp() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    let prev = LAST_TIMESTAMP
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    now.max(prev + 1)
}

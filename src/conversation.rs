//! Conversation tracking for the router.
//!
//! Handles:
//! - Collecting the envelopes of one end-user query in emission order
//! - The router's per-query state machine
//! - Retention-bounded eviction of finished conversations

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Awaiting,
    Synthesizing,
    Closed,
    TimedOut,
}

impl ConversationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConversationStatus::Closed | ConversationStatus::TimedOut)
    }
}

/// Router phases for one query. `Idle` is both initial and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterState {
    Idle,
    Classifying,
    Dispatching,
    AwaitingResponses,
    Synthesizing,
}

impl RouterState {
    pub fn can_advance_to(&self, next: RouterState) -> bool {
        use RouterState::*;
        matches!(
            (self, next),
            (Idle, Classifying)
                | (Classifying, Dispatching)
                // nothing routable: answer straight away
                | (Classifying, Synthesizing)
                | (Dispatching, AwaitingResponses)
                | (AwaitingResponses, Synthesizing)
                | (Synthesizing, Idle)
        )
    }
}

/// The envelopes causally tied to one end-user query.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    /// The originating user query
    pub origin_id: String,
    envelopes: Vec<Envelope>,
    status: ConversationStatus,
    phase: RouterState,
    deadline_hit: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    pub fn new(origin: &Envelope) -> Self {
        let now = now_timestamp();
        Self {
            id: origin.conversation_id().to_string(),
            origin_id: origin.id().to_string(),
            envelopes: vec![origin.clone()],
            status: ConversationStatus::Open,
            phase: RouterState::Idle,
            deadline_hit: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> ConversationStatus {
        self.status
    }

    pub fn phase(&self) -> RouterState {
        self.phase
    }

    /// Envelopes ordered by emission time.
    pub fn envelopes(&self) -> &[Envelope] {
        &self.envelopes
    }

    /// Add an envelope in timestamp order. Closed conversations reject late arrivals.
    pub fn record(&mut self, envelope: Envelope) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::Protocol(format!(
                "conversation {} is closed; discarding envelope {}",
                self.id,
                envelope.id()
            )));
        }
        if envelope.conversation_id() != self.id {
            return Err(Error::Protocol(format!(
                "envelope {} belongs to conversation {}, not {}",
                envelope.id(),
                envelope.conversation_id(),
                self.id
            )));
        }
        if self.envelopes.iter().any(|e| e.id() == envelope.id()) {
            return Ok(());
        }

        let at = self
            .envelopes
            .partition_point(|e| e.timestamp() <= envelope.timestamp());
        self.envelopes.insert(at, envelope);
        self.updated_at = now_timestamp();
        Ok(())
    }

    /// Move the router phase forward, keeping the status in step.
    pub fn advance(&mut self, next: RouterState) -> Result<()> {
        if !self.phase.can_advance_to(next) {
            return Err(Error::Protocol(format!(
                "conversation {}: illegal transition {:?} -> {:?}",
                self.id, self.phase, next
            )));
        }
        self.phase = next;
        self.status = match next {
            RouterState::Classifying | RouterState::Dispatching => ConversationStatus::Open,
            RouterState::AwaitingResponses => ConversationStatus::Awaiting,
            RouterState::Synthesizing => ConversationStatus::Synthesizing,
            RouterState::Idle if self.deadline_hit => ConversationStatus::TimedOut,
            RouterState::Idle => ConversationStatus::Closed,
        };
        self.updated_at = now_timestamp();
        tracing::debug!("Conversation {} -> {:?} ({:?})", self.id, next, self.status);
        Ok(())
    }

    /// Record that the conversation deadline fired; it will close as timed out.
    pub fn mark_deadline_hit(&mut self) {
        self.deadline_hit = true;
    }

    /// Every envelope other than the origin names a cause inside this conversation.
    pub fn is_causally_closed(&self) -> bool {
        self.envelopes.iter().all(|e| {
            if e.id() == self.origin_id {
                return true;
            }
            match e.causation_id() {
                Some(cause) => self.envelopes.iter().any(|c| c.id() == cause),
                None => false,
            }
        })
    }
}

/// Conversation arena keyed by conversation id.
pub struct ConversationManager {
    conversations: HashMap<String, Conversation>,
}

impl ConversationManager {
    pub fn new() -> Self {
        Self {
            conversations: HashMap::new(),
        }
    }

    /// Start a conversation from its originating envelope.
    pub fn create(&mut self, origin: &Envelope) -> Result<&mut Conversation> {
        let id = origin.conversation_id().to_string();
        if self.conversations.contains_key(&id) {
            return Err(Error::Protocol(format!("conversation {} already exists", id)));
        }
        Ok(self
            .conversations
            .entry(id)
            .or_insert_with(|| Conversation::new(origin)))
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut Conversation> {
        self.conversations
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("conversation {}", id)))
    }

    /// Record an envelope against its conversation.
    pub fn record(&mut self, envelope: Envelope) -> Result<()> {
        self.get_mut(envelope.conversation_id())?.record(envelope)
    }

    pub fn list_active(&self) -> Vec<&Conversation> {
        self.conversations
            .values()
            .filter(|c| !c.status.is_terminal())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Evict finished conversations idle for longer than `retention`.
    pub fn cleanup(&mut self, retention: Duration) -> usize {
        let now = now_timestamp();
        let max_age_ms = retention.as_millis() as i64;
        let before = self.conversations.len();

        self.conversations
            .retain(|_id, conv| !(conv.status.is_terminal() && (now - conv.updated_at) >= max_age_ms));

        let removed = before - self.conversations.len();
        if removed > 0 {
            tracing::debug!("Evicted {} finished conversations", removed);
        }
        removed
    }
}

impl Default for ConversationManager {
    fn default() -> Self {
        Self::new()
    }
}

fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

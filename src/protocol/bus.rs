//! In-process envelope transport with per-agent mailboxes.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::envelope::Envelope;
use super::registry::AgentRegistry;
use crate::error::{Error, Result};

/// Address scheme served by [`LocalBus`].
pub const LOCAL_SCHEME: &str = "local://";

/// Maximum queued envelopes per mailbox.
const MAILBOX_CAPACITY: usize = 64;

/// Maximum envelopes kept in the audit history.
const MAX_HISTORY: usize = 1000;

/// Anything that can deliver an envelope to its recipient.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<()>;
}

pub fn local_address(name: &str) -> String {
    format!("{}{}", LOCAL_SCHEME, name)
}

/// Bus delivering envelopes to agents attached in this process.
#[derive(Clone)]
pub struct LocalBus {
    registry: AgentRegistry,
    mailboxes: Arc<Mutex<HashMap<String, mpsc::Sender<Envelope>>>>,
    history: Arc<Mutex<VecDeque<Envelope>>>,
}

impl LocalBus {
    pub fn new(registry: AgentRegistry) -> Self {
        Self {
            registry,
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
            history: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Register an agent at `local://<name>` and open its mailbox.
    pub fn attach(&self, name: &str, capabilities: Vec<String>) -> mpsc::Receiver<Envelope> {
        let address = local_address(name);
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        lock(&self.mailboxes).insert(address.clone(), tx);
        self.registry.register(name, &address, capabilities);
        rx
    }

    /// Unregister an agent and close its mailbox.
    pub fn detach(&self, name: &str) {
        if let Some(entry) = self.registry.unregister(name) {
            lock(&self.mailboxes).remove(&entry.address);
        }
    }

    /// Validate and record an envelope that entered from outside the bus.
    pub fn accept(&self, envelope: &Envelope) -> Result<()> {
        envelope.validate(&self.registry)?;
        self.record(envelope);
        Ok(())
    }

    /// Envelopes of one conversation in emission order.
    pub fn history(&self, conversation_id: &str) -> Vec<Envelope> {
        let mut envelopes: Vec<Envelope> = lock(&self.history)
            .iter()
            .filter(|e| e.conversation_id() == conversation_id)
            .cloned()
            .collect();
        envelopes.sort_by_key(|e| e.timestamp());
        envelopes
    }

    fn record(&self, envelope: &Envelope) {
        let mut history = lock(&self.history);
        history.push_back(envelope.clone());
        while history.len() > MAX_HISTORY {
            history.pop_front();
        }
    }
}

#[async_trait]
impl Transport for LocalBus {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        envelope.validate(&self.registry)?;

        let address = self.registry.lookup(envelope.recipient())?;
        if !address.starts_with(LOCAL_SCHEME) {
            return Err(Error::Protocol(format!(
                "address '{}' is not reachable on the local bus",
                address
            )));
        }

        let tx = lock(&self.mailboxes).get(&address).cloned().ok_or_else(|| {
            Error::Unavailable {
                attempts: 1,
                message: format!("no mailbox at {}", address),
            }
        })?;

        tracing::debug!(
            "{} {} -> {} [{}] conv={}",
            envelope.kind(),
            envelope.sender(),
            envelope.recipient(),
            envelope.id(),
            envelope.conversation_id()
        );
        self.record(&envelope);

        tx.send(envelope).await.map_err(|_| Error::Unavailable {
            attempts: 1,
            message: format!("mailbox at {} is closed", address),
        })
    }
}

// Holders never panic mid-update, so a poisoned map is still consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_delivers_to_mailbox() {
        let bus = LocalBus::new(AgentRegistry::new());
        let _router_rx = bus.attach("router", vec![]);
        let mut support_rx = bus.attach("support", vec!["tickets".into()]);

        let envelope = Envelope::new("router", "support", MessageType::Query, json!({"x": 1}), None);
        let id = envelope.id().to_string();
        bus.send(envelope).await.unwrap();

        let received = support_rx.recv().await.unwrap();
        assert_eq!(received.id(), id);
        assert_eq!(bus.registry().lookup("support").unwrap(), "local://support");
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_protocol_error() {
        let bus = LocalBus::new(AgentRegistry::new());
        let _rx = bus.attach("router", vec![]);

        let envelope = Envelope::new("router", "billing", MessageType::Query, json!({}), None);
        assert!(matches!(bus.send(envelope).await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_closed_mailbox_is_unavailable() {
        let bus = LocalBus::new(AgentRegistry::new());
        let _router_rx = bus.attach("router", vec![]);
        drop(bus.attach("support", vec![]));

        let envelope = Envelope::new("router", "support", MessageType::Query, json!({}), None);
        assert!(matches!(bus.send(envelope).await, Err(Error::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_detach_unregisters() {
        let bus = LocalBus::new(AgentRegistry::new());
        let _router_rx = bus.attach("router", vec![]);
        let _support_rx = bus.attach("support", vec![]);
        bus.detach("support");

        assert!(!bus.registry().contains("support"));
        let envelope = Envelope::new("router", "support", MessageType::Query, json!({}), None);
        assert!(bus.send(envelope).await.is_err());
    }

    #[tokio::test]
    async fn test_history_groups_by_conversation() {
        let bus = LocalBus::new(AgentRegistry::new());
        let _router_rx = bus.attach("router", vec![]);
        let _support_rx = bus.attach("support", vec![]);

        let first = Envelope::new("router", "support", MessageType::Query, json!({}), Some("c1".into()));
        let other = Envelope::new("router", "support", MessageType::Query, json!({}), Some("c2".into()));
        let second = first.reply(MessageType::Response, json!({}));
        bus.send(first.clone()).await.unwrap();
        bus.send(other).await.unwrap();
        bus.accept(&second).unwrap();

        let history = bus.history("c1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id(), first.id());
        assert_eq!(history[1].causation_id(), Some(first.id()));
    }
}

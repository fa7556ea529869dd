//! Wiring for a complete in-process agent system.

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::agents::customer_data::CustomerDataAgent;
use crate::agents::router::{FinalAnswer, Router};
use crate::agents::support::SupportAgent;
use crate::agents::{spawn_agent, KeywordClassifier};
use crate::config::Settings;
use crate::error::Result;
use crate::mcp::{HttpTransport, McpClient, McpServer, ToolRegistry};
use crate::protocol::{AgentRegistry, LocalBus};
use crate::storage::Store;

/// Router, worker agents and tool access sharing one bus.
pub struct System {
    store: Store,
    client: Arc<McpClient>,
    router: Router,
    workers: Vec<JoinHandle<()>>,
}

impl System {
    /// Start every agent against `store`.
    ///
    /// Tools are called in-process unless `mcp.remote_url` points at a running server.
    pub fn start(settings: &Settings, store: Store) -> Result<Self> {
        let client = match &settings.mcp.remote_url {
            Some(url) => {
                tracing::info!("Using remote tool server at {}", url);
                let transport = HttpTransport::new(url.clone(), settings.router.sub_request_timeout())?;
                McpClient::new(Arc::new(transport), settings.retry.clone())
            }
            None => {
                let server = McpServer::new(
                    store.clone(),
                    ToolRegistry::catalog(settings.mcp.premium_min_tickets)?,
                );
                McpClient::local(server, settings.retry.clone())
            }
        };
        let client = Arc::new(client);

        let bus = LocalBus::new(AgentRegistry::new());
        let workers = vec![
            spawn_agent(Arc::new(CustomerDataAgent::new(client.clone())), bus.clone()),
            spawn_agent(
                Arc::new(SupportAgent::new(client.clone(), &settings.support)),
                bus.clone(),
            ),
        ];
        let router = Router::start(
            bus,
            Arc::new(KeywordClassifier::new()?),
            settings.router.clone(),
        );

        Ok(Self {
            store,
            client,
            router,
            workers,
        })
    }

    /// A system over a fresh in-memory store holding the sample data.
    pub fn in_memory(settings: &Settings) -> Result<Self> {
        let store = Store::open_in_memory()?;
        store.seed_sample_data()?;
        Self::start(settings, store)
    }

    /// Answer one end-user query.
    pub async fn ask(&self, text: &str, customer_id: Option<i64>) -> Result<FinalAnswer> {
        self.router.route(text, customer_id).await
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn client(&self) -> &McpClient {
        &self.client
    }

    pub fn bus(&self) -> &LocalBus {
        self.router.bus()
    }
}

impl Drop for System {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::router::ManifestStatus;
    use crate::agents::{CUSTOMER_DATA, SUPPORT, USER};
    use crate::conversation::ConversationStatus;
    use crate::protocol::MessageType;
    use std::collections::HashSet;

    fn fast_settings() -> Settings {
        let mut settings = Settings::default();
        settings.router.sub_request_timeout_ms = 300;
        settings.router.conversation_deadline_ms = 2000;
        settings
    }

    #[tokio::test]
    async fn test_simple_query() {
        crate::logging::init_test();
        let system = System::in_memory(&fast_settings()).unwrap();
        let answer = system.ask("Get customer information for ID 5", None).await.unwrap();

        assert!(answer.is_complete());
        assert_eq!(answer.sections.len(), 1);
        let section = &answer.sections[0];
        assert_eq!(section.intent, "account_lookup");
        assert_eq!(section.agent, CUSTOMER_DATA);
        assert_eq!(section.payload["operation"], "get_customer");
        assert_eq!(section.payload["result"]["id"], 5);
        assert_eq!(section.payload["result"]["name"], "Test User 5");
        assert!(answer.text.contains("Test User 5"));
        assert_eq!(answer.status, ConversationStatus::Closed);
    }

    #[tokio::test]
    async fn test_coordinated_query() {
        let system = System::in_memory(&fast_settings()).unwrap();
        let answer = system
            .ask("I'm customer 12345 and need help upgrading my account", None)
            .await
            .unwrap();

        assert!(answer.is_complete(), "manifest: {:?}", answer.manifest);
        let agents: Vec<&str> = answer.sections.iter().map(|s| s.agent.as_str()).collect();
        assert_eq!(agents, vec![CUSTOMER_DATA, SUPPORT]);
        assert_eq!(answer.sections[1].payload["ticket"]["customer_id"], 12345);

        let history = system.store().get_customer_history(12345).unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_multi_intent_query() {
        let system = System::in_memory(&fast_settings()).unwrap();
        let answer = system
            .ask("Update my email to new@email.com and show my ticket history", Some(5))
            .await
            .unwrap();

        assert!(answer.is_complete(), "manifest: {:?}", answer.manifest);
        let tagged: Vec<(&str, &str)> = answer
            .sections
            .iter()
            .map(|s| (s.sub_intent.as_str(), s.intent.as_str()))
            .collect();
        assert_eq!(tagged, vec![("s1", "update_email"), ("s2", "history_lookup")]);
        assert_eq!(
            system.store().get_customer(5).unwrap().email.as_deref(),
            Some("new@email.com")
        );
    }

    #[tokio::test]
    async fn test_silent_support_times_out() {
        let system = System::in_memory(&fast_settings()).unwrap();
        // Swap support for a mailbox nobody reads.
        system.bus().detach(SUPPORT);
        let _silent = system.bus().attach(SUPPORT, Vec::new());

        let answer = system
            .ask("I'm customer 12345 and need help upgrading my account", None)
            .await
            .unwrap();

        assert_eq!(answer.sections.len(), 1);
        assert_eq!(answer.sections[0].agent, CUSTOMER_DATA);
        assert_eq!(answer.sections[0].payload["result"]["id"], 12345);
        assert_eq!(answer.manifest.len(), 1);
        assert_eq!(answer.manifest[0].agent.as_deref(), Some(SUPPORT));
        assert_eq!(answer.manifest[0].status, ManifestStatus::TimedOut);
        assert_eq!(answer.status, ConversationStatus::Closed);
    }

    #[tokio::test]
    async fn test_escalating_query() {
        let system = System::in_memory(&fast_settings()).unwrap();
        let answer = system
            .ask("Customer 5 here: I've been charged twice, please refund immediately!", None)
            .await
            .unwrap();

        assert!(answer.escalated);
        assert!(answer.text.starts_with("[PRIORITY]"));
        let support = answer.sections.iter().find(|s| s.agent == SUPPORT).unwrap();
        assert_eq!(support.kind, MessageType::Escalation);
        assert_eq!(support.payload["ticket"]["priority"], "high");
    }

    #[tokio::test]
    async fn test_conversation_is_causally_grouped() {
        let system = System::in_memory(&fast_settings()).unwrap();
        let (first, second) = tokio::join!(
            system.ask("I'm customer 12345 and need help upgrading my account", None),
            system.ask("Get customer information for ID 5", None),
        );
        let first = first.unwrap();
        let second = second.unwrap();
        assert_ne!(first.conversation_id, second.conversation_id);

        let history = system.bus().history(&first.conversation_id);
        // query, two hops out and back, final answer
        assert_eq!(history.len(), 6);
        assert!(history.windows(2).all(|w| w[0].timestamp() < w[1].timestamp()));

        let ids: HashSet<&str> = history.iter().map(|e| e.id()).collect();
        let origin = &history[0];
        assert_eq!(origin.sender(), USER);
        assert!(origin.causation_id().is_none());
        for envelope in &history[1..] {
            assert!(ids.contains(envelope.causation_id().unwrap()));
        }

        let other = system.bus().history(&second.conversation_id);
        assert_eq!(other.len(), 4);
        assert!(other.iter().all(|e| !ids.contains(e.id())));
    }

    #[tokio::test]
    async fn test_validation_failure_is_reported_not_raised() {
        let system = System::in_memory(&fast_settings()).unwrap();
        let answer = system.ask("Change my phone number please", Some(5)).await.unwrap();
        assert_eq!(answer.manifest.len(), 1);
        assert_eq!(answer.manifest[0].status, ManifestStatus::Failed);
        assert!(answer.text.contains("could not complete your request"));
    }
}

//! Router agent: classify, dispatch, join, synthesize.
//!
//! Each sub-intent of a query runs its routing pipeline as its own task.
//! A hop waits at most the sub-request timeout for its reply; the whole
//! query is bounded by the conversation deadline, after which unfinished
//! pipelines are cancelled and the answer is built from what completed.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use super::classifier::{Classification, Classifier, UNCLASSIFIED};
use super::{QueryPayload, ROUTER, USER};
use crate::config::{RouteStep, RouterConfig};
use crate::conversation::{ConversationManager, ConversationStatus, RouterState};
use crate::error::{Error, Result};
use crate::protocol::bus::local_address;
use crate::protocol::{Envelope, EnvelopeBuilder, LocalBus, MessageType, Transport};

/// Why a sub-intent is in the failure manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    Failed,
    TimedOut,
    Cancelled,
    Unroutable,
    Unclassified,
}

impl ManifestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestStatus::Failed => "failed",
            ManifestStatus::TimedOut => "timed_out",
            ManifestStatus::Cancelled => "cancelled",
            ManifestStatus::Unroutable => "unroutable",
            ManifestStatus::Unclassified => "unclassified",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub sub_intent: String,
    pub intent: String,
    /// Agent whose hop did not complete
    pub agent: Option<String>,
    pub status: ManifestStatus,
    pub reason: String,
}

/// One agent's contribution to the answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub sub_intent: String,
    pub intent: String,
    pub agent: String,
    pub kind: MessageType,
    pub summary: String,
    pub payload: Value,
}

impl Section {
    pub fn is_escalation(&self) -> bool {
        self.kind == MessageType::Escalation
    }
}

/// The synthesized reply to one end-user query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub conversation_id: String,
    pub text: String,
    pub sections: Vec<Section>,
    pub manifest: Vec<ManifestEntry>,
    pub escalated: bool,
    pub status: ConversationStatus,
}

impl FinalAnswer {
    pub fn is_complete(&self) -> bool {
        self.manifest.is_empty()
    }
}

/// A classified sub-intent ready for dispatch.
#[derive(Debug, Clone)]
struct SubIntent {
    index: usize,
    id: String,
    classification: Classification,
    pipeline: Vec<RouteStep>,
}

/// Result of a pipeline that ran to its end.
#[derive(Debug)]
struct Outcome {
    index: usize,
    failure: Option<ManifestEntry>,
}

/// What a pipeline has produced so far. Survives cancellation.
#[derive(Debug, Default)]
struct Progress {
    sections: Vec<Section>,
    /// Agent of the hop in flight
    awaiting: Option<String>,
}

type Pending = Arc<Mutex<HashMap<String, (String, oneshot::Sender<Envelope>)>>>;

/// Shared handles a pipeline task needs.
#[derive(Clone)]
struct Dispatcher {
    bus: LocalBus,
    pending: Pending,
    conversations: Arc<Mutex<ConversationManager>>,
    hop_timeout: Duration,
}

impl Dispatcher {
    fn record(&self, envelope: &Envelope) {
        if let Err(e) = lock(&self.conversations).record(envelope.clone()) {
            tracing::debug!("{}", e);
        }
    }

    /// Send one hop and wait for its reply.
    async fn hop(&self, envelope: Envelope) -> std::result::Result<Envelope, (ManifestStatus, String)> {
        let (tx, rx) = oneshot::channel();
        let request_id = envelope.id().to_string();
        lock(&self.pending).insert(
            request_id.clone(),
            (envelope.conversation_id().to_string(), tx),
        );
        self.record(&envelope);

        if let Err(e) = self.bus.send(envelope).await {
            lock(&self.pending).remove(&request_id);
            return Err((ManifestStatus::Failed, e.to_string()));
        }

        match tokio::time::timeout(self.hop_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err((ManifestStatus::Failed, "reply channel closed".to_string())),
            Err(_) => {
                lock(&self.pending).remove(&request_id);
                let err = Error::Timeout(format!("no reply within {}ms", self.hop_timeout.as_millis()));
                Err((ManifestStatus::TimedOut, err.to_string()))
            }
        }
    }

    async fn run_pipeline(
        self,
        origin: Envelope,
        sub: SubIntent,
        progress: Arc<Mutex<Progress>>,
    ) -> Outcome {
        let intent = sub.classification.intent.clone();
        let mut context = Map::new();
        let mut cause = origin;

        for step in &sub.pipeline {
            let payload = QueryPayload {
                sub_intent: sub.id.clone(),
                intent: intent.clone(),
                operation: step.operation.clone(),
                text: sub.classification.text.clone(),
                entities: sub.classification.entities.clone(),
                context: context.clone(),
            };
            let fail = |status, reason: String| Outcome {
                index: sub.index,
                failure: Some(ManifestEntry {
                    sub_intent: sub.id.clone(),
                    intent: intent.clone(),
                    agent: Some(step.agent.clone()),
                    status,
                    reason,
                }),
            };

            let envelope = match serde_json::to_value(&payload).map_err(Error::from).and_then(|p| {
                EnvelopeBuilder::from(ROUTER)
                    .to(step.agent.clone())
                    .kind(MessageType::Query)
                    .payload(p)
                    .caused_by(&cause)
                    .build()
            }) {
                Ok(envelope) => envelope,
                Err(e) => return fail(ManifestStatus::Failed, e.to_string()),
            };
            tracing::debug!("{} {} -> {} ({:?})", sub.id, intent, step.agent, step.operation);

            lock(&progress).awaiting = Some(step.agent.clone());
            let reply = match self.hop(envelope).await {
                Ok(reply) => reply,
                Err((status, reason)) => {
                    tracing::warn!("{} {} at {}: {}", sub.id, status.as_str(), step.agent, reason);
                    return fail(status, reason);
                }
            };
            self.record(&reply);

            if reply.kind() == MessageType::Error {
                let reason = reply.payload()["cause"]["message"]
                    .as_str()
                    .unwrap_or("agent reported an error")
                    .to_string();
                return fail(ManifestStatus::Failed, reason);
            }

            let summary = reply.payload()["summary"]
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| format!("{} completed {}", step.agent, intent));
            {
                let mut progress = lock(&progress);
                progress.awaiting = None;
                progress.sections.push(Section {
                    sub_intent: sub.id.clone(),
                    intent: intent.clone(),
                    agent: step.agent.clone(),
                    kind: reply.kind(),
                    summary,
                    payload: reply.payload().clone(),
                });
            }
            context.insert(step.agent.clone(), reply.payload().clone());
            cause = reply;
        }

        Outcome {
            index: sub.index,
            failure: None,
        }
    }
}

pub struct Router {
    dispatcher: Dispatcher,
    classifier: Arc<dyn Classifier>,
    config: RouterConfig,
    listener: JoinHandle<()>,
}

impl Router {
    /// Attach the router to the bus and start matching replies to requests.
    pub fn start(bus: LocalBus, classifier: Arc<dyn Classifier>, config: RouterConfig) -> Self {
        let mut rx = bus.attach(ROUTER, vec!["routing".to_string(), "synthesis".to_string()]);
        // Queries enter on behalf of the user; the user has no mailbox.
        bus.registry().register(USER, &local_address(USER), Vec::new());

        let dispatcher = Dispatcher {
            bus,
            pending: Arc::new(Mutex::new(HashMap::new())),
            conversations: Arc::new(Mutex::new(ConversationManager::new())),
            hop_timeout: config.sub_request_timeout(),
        };

        let pending = dispatcher.pending.clone();
        let conversations = dispatcher.conversations.clone();
        let listener = tokio::spawn(async move {
            while let Some(reply) = rx.recv().await {
                let waiter = reply
                    .causation_id()
                    .and_then(|cause| lock(&pending).remove(cause));
                match waiter {
                    Some((_, tx)) => {
                        if tx.send(reply).is_err() {
                            tracing::debug!("Waiter gone; reply dropped");
                        }
                    }
                    None => {
                        let id = reply.id().to_string();
                        match lock(&conversations).record(reply) {
                            Ok(()) => tracing::debug!("Late reply {} ignored", id),
                            Err(e) => tracing::debug!("Discarding late reply: {}", e),
                        }
                    }
                }
            }
        });

        tracing::info!("Router online with {} routes", config.routes.len());
        Self {
            dispatcher,
            classifier,
            config,
            listener,
        }
    }

    pub fn bus(&self) -> &LocalBus {
        &self.dispatcher.bus
    }

    /// Conversations not yet closed.
    pub fn active_conversations(&self) -> usize {
        lock(&self.dispatcher.conversations).list_active().len()
    }

    /// Envelopes the router recorded for a conversation, in timestamp order.
    pub fn transcript(&self, conversation_id: &str) -> Vec<Envelope> {
        lock(&self.dispatcher.conversations)
            .get(conversation_id)
            .map(|c| c.envelopes().to_vec())
            .unwrap_or_default()
    }

    /// Answer one end-user query.
    ///
    /// `customer_id` identifies the caller when the text does not name a customer.
    pub async fn route(&self, text: &str, customer_id: Option<i64>) -> Result<FinalAnswer> {
        lock(&self.dispatcher.conversations).cleanup(self.config.retention());

        let origin = EnvelopeBuilder::from(USER)
            .to(ROUTER)
            .kind(MessageType::Query)
            .payload(json!({"text": text, "customer_id": customer_id}))
            .build()?;
        self.dispatcher.bus.accept(&origin)?;
        let conversation_id = origin.conversation_id().to_string();
        {
            let mut conversations = lock(&self.dispatcher.conversations);
            conversations.create(&origin)?;
            conversations.get_mut(&conversation_id)?.advance(RouterState::Classifying)?;
        }
        tracing::info!("Conversation {} started: {}", conversation_id, text);

        let mut manifest = Vec::new();
        let classifications = match self.classifier.classify(text).await {
            Ok(c) if c.is_empty() => {
                manifest.push(ManifestEntry {
                    sub_intent: "s1".to_string(),
                    intent: UNCLASSIFIED.to_string(),
                    agent: None,
                    status: ManifestStatus::Unclassified,
                    reason: "the query is empty".to_string(),
                });
                c
            }
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Classifier failed: {}", e);
                manifest.push(ManifestEntry {
                    sub_intent: "s1".to_string(),
                    intent: UNCLASSIFIED.to_string(),
                    agent: None,
                    status: ManifestStatus::Unclassified,
                    reason: e.to_string(),
                });
                Vec::new()
            }
        };

        let mut subs = Vec::new();
        for (index, mut classification) in classifications.into_iter().enumerate() {
            let id = format!("s{}", index + 1);
            if classification.entities.customer_id.is_none() {
                classification.entities.customer_id = customer_id;
            }
            if classification.intent == UNCLASSIFIED {
                manifest.push(ManifestEntry {
                    sub_intent: id,
                    intent: classification.intent,
                    agent: None,
                    status: ManifestStatus::Unclassified,
                    reason: format!("could not understand \"{}\"", classification.text),
                });
                continue;
            }
            match self.config.routes.get(&classification.intent) {
                Some(pipeline) if !pipeline.is_empty() => subs.push(SubIntent {
                    index,
                    id,
                    pipeline: pipeline.clone(),
                    classification,
                }),
                _ => manifest.push(ManifestEntry {
                    reason: format!("no route for intent '{}'", classification.intent),
                    sub_intent: id,
                    intent: classification.intent,
                    agent: None,
                    status: ManifestStatus::Unroutable,
                }),
            }
        }

        let progress: Vec<Arc<Mutex<Progress>>> = subs.iter().map(|_| Arc::default()).collect();
        let (outcomes, deadline_hit) = if subs.is_empty() {
            (Vec::new(), false)
        } else {
            self.advance(&conversation_id, RouterState::Dispatching)?;
            let mut set = JoinSet::new();
            for (sub, progress) in subs.iter().zip(&progress) {
                set.spawn(self.dispatcher.clone().run_pipeline(
                    origin.clone(),
                    sub.clone(),
                    progress.clone(),
                ));
            }
            self.advance(&conversation_id, RouterState::AwaitingResponses)?;
            self.join(&mut set).await
        };

        if deadline_hit {
            lock(&self.dispatcher.conversations)
                .get_mut(&conversation_id)?
                .mark_deadline_hit();
            lock(&self.dispatcher.pending).retain(|_, (conv, _)| conv != &conversation_id);
        }
        self.advance(&conversation_id, RouterState::Synthesizing)?;

        // Completed hops count even when their pipeline was cut short.
        let mut failures: HashMap<usize, Option<ManifestEntry>> =
            outcomes.into_iter().map(|o| (o.index, o.failure)).collect();
        let mut sections = Vec::new();
        for (sub, progress) in subs.iter().zip(&progress) {
            let mut progress = lock(progress);
            sections.append(&mut progress.sections);
            match failures.remove(&sub.index) {
                Some(failure) => manifest.extend(failure),
                None => {
                    let (status, reason) = if deadline_hit {
                        (
                            ManifestStatus::Cancelled,
                            format!(
                                "conversation deadline of {}ms reached",
                                self.config.conversation_deadline_ms
                            ),
                        )
                    } else {
                        (ManifestStatus::Failed, "pipeline ended unexpectedly".to_string())
                    };
                    manifest.push(ManifestEntry {
                        sub_intent: sub.id.clone(),
                        intent: sub.classification.intent.clone(),
                        agent: progress.awaiting.take(),
                        status,
                        reason,
                    });
                }
            }
        }
        manifest.sort_by_key(|m| sub_intent_order(&m.sub_intent));

        let text = synthesize(&sections, &manifest);
        let escalated = sections.iter().any(Section::is_escalation);
        let mut answer = FinalAnswer {
            conversation_id: conversation_id.clone(),
            text,
            sections,
            manifest,
            escalated,
            status: ConversationStatus::Synthesizing,
        };

        let kind = if escalated {
            MessageType::Escalation
        } else {
            MessageType::Response
        };
        let final_envelope = origin.reply(kind, serde_json::to_value(&answer)?);
        self.dispatcher.bus.accept(&final_envelope)?;
        self.dispatcher.record(&final_envelope);

        self.advance(&conversation_id, RouterState::Idle)?;
        answer.status = lock(&self.dispatcher.conversations)
            .get(&conversation_id)
            .map(|c| c.status())
            .unwrap_or(ConversationStatus::Closed);

        tracing::info!(
            "Conversation {} {:?}: {} section(s), {} incomplete",
            conversation_id,
            answer.status,
            answer.sections.len(),
            answer.manifest.len()
        );
        Ok(answer)
    }

    /// Collect pipeline outcomes until all finish or the deadline fires.
    async fn join(&self, set: &mut JoinSet<Outcome>) -> (Vec<Outcome>, bool) {
        let mut outcomes = Vec::new();
        let deadline = tokio::time::sleep(self.config.conversation_deadline());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok(outcome)) => outcomes.push(outcome),
                    Some(Err(e)) => tracing::warn!("Pipeline task failed: {}", e),
                    None => return (outcomes, false),
                },
                _ = &mut deadline => {
                    tracing::warn!(
                        "Conversation deadline reached; cancelling {} pipeline(s)",
                        set.len()
                    );
                    set.abort_all();
                    return (outcomes, true);
                }
            }
        }
    }

    fn advance(&self, conversation_id: &str, next: RouterState) -> Result<()> {
        lock(&self.dispatcher.conversations)
            .get_mut(conversation_id)?
            .advance(next)
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.listener.abort();
        self.dispatcher.bus.detach(ROUTER);
    }
}

/// Render the answer text. Escalations lead, then everything else in
/// sub-intent order, then the list of incomplete parts.
pub fn synthesize(sections: &[Section], manifest: &[ManifestEntry]) -> String {
    let mut lines = Vec::new();

    let (escalations, others): (Vec<&Section>, Vec<&Section>) =
        sections.iter().partition(|s| s.is_escalation());
    for section in &escalations {
        lines.push(format!("[PRIORITY] {}", section.summary));
    }
    for section in &others {
        lines.push(section.summary.clone());
    }

    if !manifest.is_empty() {
        if lines.is_empty() {
            lines.push("Sorry, we could not complete your request.".to_string());
        } else {
            lines.push("We could not complete part of your request:".to_string());
        }
        for entry in manifest {
            lines.push(format!(
                "- {} ({}): {}",
                entry.sub_intent,
                entry.intent,
                describe_failure(entry.status)
            ));
        }
    } else if lines.is_empty() {
        lines.push("Sorry, I could not understand your request.".to_string());
    }

    lines.join("\n")
}

fn describe_failure(status: ManifestStatus) -> &'static str {
    match status {
        ManifestStatus::Failed => "could not be completed",
        ManifestStatus::TimedOut => "took too long to answer",
        ManifestStatus::Cancelled => "was cancelled",
        ManifestStatus::Unroutable => "is not something we can handle yet",
        ManifestStatus::Unclassified => "was not understood",
    }
}

fn sub_intent_order(id: &str) -> usize {
    id.trim_start_matches('s').parse().unwrap_or(usize::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

//! Agent assembly: wires C6-C9 onto a concrete [`MessagingFabric`]/
//! [`VerifiableLog`] pair and spawns their loops on one shared
//! [`CancellationToken`].
//!
//! Construct every subsystem first, then spawn its loop, then hand control
//! to the caller's own shutdown wait.

use std::{sync::Arc, time::Duration};

use fabric_collab::{EscalationWebhook, ReasoningBackend, TrackerClient};
use fabric_log::VerifiableLog;
use fabric_p2p::{Delivery, MessageType, MessagingFabric, COORDINATION_TOPIC, META_TOPIC};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    capability::{default_memo_path, CapabilityBroadcaster},
    conversation::MetaDiscussionEngine,
    dependency::DependencyCoordinator,
    error::EngineError,
    sandbox::SandboxRuntime,
    source::ClaimEngine,
    worker::ItemWorkerContext,
};

pub struct AgentSettings {
    pub node_id: String,
    pub capabilities: Vec<String>,
    pub models: Vec<String>,
    pub specialization: String,
    pub poll_interval: Duration,
    pub max_task_count: usize,
    pub escalation_keywords: Vec<String>,
    pub conversation_limit: usize,
}

/// A fully wired agent, ready to have its loops spawned by [`Agent::spawn_all`].
pub struct Agent {
    fabric: Arc<dyn MessagingFabric>,
    capability: Arc<CapabilityBroadcaster>,
    conversation: Arc<MetaDiscussionEngine>,
    claim_engine: Arc<ClaimEngine>,
    dependency: Arc<DependencyCoordinator>,
    max_task_count: usize,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        settings: AgentSettings,
        fabric: Arc<dyn MessagingFabric>,
        log: Arc<VerifiableLog>,
        tracker: Arc<dyn TrackerClient>,
        reasoning: Arc<dyn ReasoningBackend>,
        webhook: Option<EscalationWebhook>,
        sandbox: Arc<dyn SandboxRuntime>,
    ) -> Self {
        let capability = Arc::new(CapabilityBroadcaster::new(
            fabric.clone(),
            reasoning.clone(),
            log.clone(),
            settings.node_id.clone(),
            settings.capabilities.clone(),
            settings.models,
            settings.specialization,
            default_memo_path(&settings.node_id),
        ));

        let conversation = Arc::new(MetaDiscussionEngine::new(
            fabric.clone(),
            reasoning.clone(),
            log.clone(),
            webhook,
            settings.escalation_keywords,
            settings.conversation_limit,
            settings.node_id.clone(),
        ));

        let dependency = Arc::new(DependencyCoordinator::new(fabric.clone(), reasoning));

        let worker_ctx = Arc::new(ItemWorkerContext {
            tracker: tracker.clone(),
            fabric: fabric.clone(),
            log,
            conversation: conversation.clone(),
            dependency: dependency.clone(),
            sandbox,
            node_id: settings.node_id,
        });

        let claim_engine = Arc::new(ClaimEngine::new(
            tracker,
            worker_ctx,
            settings.capabilities,
            settings.max_task_count,
            settings.poll_interval,
        ));

        Self {
            fabric,
            capability,
            conversation,
            claim_engine,
            dependency,
            max_task_count: settings.max_task_count,
        }
    }

    /// Runs the startup capability broadcast, then spawns every long-lived
    /// loop (availability broadcaster, repository sync, polling, dependency
    /// cleanup, inbound dispatch) on `cancel`. Returns their join handles so
    /// the caller can await them during shutdown.
    pub async fn spawn_all(&self, cancel: CancellationToken) -> Result<Vec<JoinHandle<()>>, EngineError> {
        self.capability.check_and_broadcast().await?;
        self.claim_engine.sync_repositories().await?;

        let mut handles = Vec::new();

        let capability = self.capability.clone();
        let active = self.claim_engine.active_task_count();
        let max_task_count = self.max_task_count;
        let cancel_availability = cancel.clone();
        handles.push(tokio::spawn(async move {
            capability.run_availability_loop(active, max_task_count, cancel_availability).await;
        }));

        let claim_engine = self.claim_engine.clone();
        let cancel_sync = cancel.clone();
        handles.push(tokio::spawn(async move {
            claim_engine.run_repository_sync_loop(cancel_sync).await;
        }));

        let claim_engine = self.claim_engine.clone();
        let cancel_poll = cancel.clone();
        handles.push(tokio::spawn(async move {
            claim_engine.run_poll_loop(cancel_poll).await;
        }));

        let dependency_cleanup = self.dependency.clone();
        let cancel_cleanup = cancel.clone();
        handles.push(tokio::spawn(async move {
            dependency_cleanup.run_cleanup_loop(cancel_cleanup).await;
        }));

        // Subscribed synchronously, before the task is spawned, so no
        // delivery published the moment `spawn_all` returns is lost to a
        // subscriber that hasn't registered with the broadcast channel yet.
        let deliveries = self.fabric.deliveries();
        let local_peer_id = self.fabric.local_peer_id();
        let conversation = self.conversation.clone();
        let dependency = self.dependency.clone();
        let claim_engine = self.claim_engine.clone();
        handles.push(tokio::spawn(async move {
            run_dispatch_loop(deliveries, local_peer_id, conversation, dependency, claim_engine, cancel).await;
        }));

        info!("agent subsystems started");
        Ok(handles)
    }
}

/// Drains every [`Delivery`] this node receives and routes it by
/// `message_type` to the handler registered for its topic class (§4.4): one
/// handler per class, regardless of which of the node's joined topics the
/// envelope arrived on. This is the only production path into
/// `MetaDiscussionEngine::handle_incoming`/`DependencyCoordinator::record_message`
/// — everything else in this crate only reaches them through direct calls in
/// tests.
async fn run_dispatch_loop(
    mut deliveries: broadcast::Receiver<Delivery>,
    local_peer_id: String,
    conversation: Arc<MetaDiscussionEngine>,
    dependency: Arc<DependencyCoordinator>,
    claim_engine: Arc<ClaimEngine>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("dispatch loop shutting down");
                return;
            }
            result = deliveries.recv() => result,
        };

        let delivery = match delivery {
            Ok(d) => d,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "dispatch loop lagged, dropped deliveries");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("dispatch loop's delivery channel closed");
                return;
            }
        };

        // Never route a node's own publishes back into its own handlers —
        // every in-process fabric hands every publisher a receiver on the
        // same bus it just sent to.
        if delivery.envelope.from == local_peer_id {
            continue;
        }

        if let Err(e) = route_delivery(&conversation, &dependency, &claim_engine, delivery).await {
            warn!("dispatch handler failed: {e}");
        }
    }
}

fn payload_str<'a>(delivery: &'a Delivery, key: &str) -> &'a str {
    delivery.envelope.data.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

async fn route_delivery(
    conversation: &MetaDiscussionEngine,
    dependency: &DependencyCoordinator,
    claim_engine: &ClaimEngine,
    delivery: Delivery,
) -> Result<(), EngineError> {
    match delivery.envelope.message_type {
        MessageType::MetaDiscussion => {
            let project_id = payload_str(&delivery, "project_id").to_string();
            let item_id = payload_str(&delivery, "item_id").to_string();
            let title = payload_str(&delivery, "title").to_string();
            let text = payload_str(&delivery, "text").to_string();
            let from = delivery.envelope.from.clone();
            if !project_id.is_empty() && !item_id.is_empty() {
                conversation.handle_incoming(&project_id, &item_id, &from, &title, &text).await?;
            }
        }
        MessageType::TaskHelpRequest => {
            let item_id = payload_str(&delivery, "item_id").to_string();
            let reason = payload_str(&delivery, "reason").to_string();
            if !item_id.is_empty() {
                claim_engine.handle_help_request(&delivery.topic, &item_id, &reason).await?;
            }
        }
        MessageType::TaskHelpResponse => {
            let item_id = payload_str(&delivery, "item_id").to_string();
            let from = delivery.envelope.from.clone();
            if !item_id.is_empty() {
                claim_engine.handle_help_response(&item_id, &from).await?;
            }
        }
        MessageType::CoordinationPlan
        | MessageType::CoordinationRequest
        | MessageType::CoordinationResponse
        | MessageType::CoordinationComplete
        | MessageType::EscalationTrigger => {
            let session_id = payload_str(&delivery, "session_id").to_string();
            if session_id.is_empty() {
                return Ok(());
            }
            let text = {
                let text = payload_str(&delivery, "text");
                let text = if text.is_empty() { payload_str(&delivery, "plan") } else { text };
                let text = if text.is_empty() { payload_str(&delivery, "reason") } else { text };
                text.to_string()
            };
            let from = delivery.envelope.from.clone();
            dependency.record_message(&session_id, &from, &text).await?;
        }
        _ => {}
    }
    Ok(())
}

pub const STATIC_TOPICS: [&str; 2] = [COORDINATION_TOPIC, META_TOPIC];

/// Joins both static topics on the given fabric; callers with a real
/// transport call this once before [`Agent::spawn_all`].
pub async fn join_static_topics(fabric: &dyn MessagingFabric) -> Result<(), EngineError> {
    for topic in STATIC_TOPICS {
        fabric.join(topic).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_collab::{MockReasoningBackend, MockTrackerClient};
    use fabric_log::{InsecureTestSigner, InsecureTestVerifier};
    use fabric_p2p::InMemoryFabric;

    #[tokio::test]
    async fn spawn_all_runs_startup_broadcast_and_returns_handles() {
        let fabric = InMemoryFabric::new("node-a");
        join_static_topics(fabric.as_ref()).await.unwrap();
        let log = Arc::new(
            VerifiableLog::open(
                None,
                Arc::new(InsecureTestSigner { peer_id: "node-a".into() }),
                Arc::new(InsecureTestVerifier),
            )
            .await
            .unwrap(),
        );
        let tracker = Arc::new(MockTrackerClient::new(vec![], vec![]));
        let reasoning = Arc::new(MockReasoningBackend::new("plan", vec!["gpt-a".into()]));

        let settings = AgentSettings {
            node_id: "node-a".into(),
            capabilities: vec!["general".into()],
            models: vec![],
            specialization: String::new(),
            poll_interval: Duration::from_millis(10),
            max_task_count: 2,
            escalation_keywords: vec![],
            conversation_limit: 10,
        };

        let agent = Agent::build(
            settings,
            fabric,
            log.clone(),
            tracker,
            reasoning,
            None,
            Arc::new(crate::sandbox::MockSandboxRuntime::always_succeeds()),
        );

        let cancel = CancellationToken::new();
        let handles = agent.spawn_all(cancel.clone()).await.unwrap();
        assert_eq!(handles.len(), 5);
        assert_eq!(log.by_type(fabric_log::EventType::CapabilityBroadcast).len(), 1);

        cancel.cancel();
        for h in handles {
            let _ = tokio::time::timeout(Duration::from_secs(1), h).await;
        }
    }

    /// Exercises the dispatch loop itself: a remote peer publishes a
    /// `MetaDiscussion` envelope over the shared bus, and `Agent` reaches
    /// escalation through `deliveries()` alone, with no direct call into
    /// `MetaDiscussionEngine::handle_incoming`.
    #[tokio::test]
    async fn dispatch_loop_routes_incoming_meta_discussion_to_escalation() {
        let bus = tokio::sync::broadcast::channel(64).0;
        let fabric = InMemoryFabric::new_on_bus("node-a", bus.clone());
        join_static_topics(fabric.as_ref()).await.unwrap();
        let peer = InMemoryFabric::new_on_bus("peer-b", bus);
        peer.join(META_TOPIC).await.unwrap();

        let log = Arc::new(
            VerifiableLog::open(
                None,
                Arc::new(InsecureTestSigner { peer_id: "node-a".into() }),
                Arc::new(InsecureTestVerifier),
            )
            .await
            .unwrap(),
        );
        let tracker = Arc::new(MockTrackerClient::new(vec![], vec![]));
        let reasoning = Arc::new(MockReasoningBackend::new("we need manual intervention here", vec![]));

        let settings = AgentSettings {
            node_id: "node-a".into(),
            capabilities: vec!["general".into()],
            models: vec![],
            specialization: String::new(),
            poll_interval: Duration::from_millis(10),
            max_task_count: 2,
            escalation_keywords: vec![],
            conversation_limit: 10,
        };

        let agent = Agent::build(
            settings,
            fabric,
            log.clone(),
            tracker,
            reasoning,
            None,
            Arc::new(crate::sandbox::MockSandboxRuntime::always_succeeds()),
        );

        let cancel = CancellationToken::new();
        let handles = agent.spawn_all(cancel.clone()).await.unwrap();

        let mut payload = fabric_p2p::EnvelopePayload::new();
        payload.insert("project_id".into(), serde_json::json!("1"));
        payload.insert("item_id".into(), serde_json::json!("42"));
        payload.insert("title".into(), serde_json::json!("fix the thing"));
        payload.insert("text".into(), serde_json::json!("how's it going"));
        peer.publish(META_TOPIC, fabric_p2p::MessageType::MetaDiscussion, payload)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if agent.conversation.is_escalated("1", "42") {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dispatch loop never escalated the conversation");

        assert_eq!(log.by_type(fabric_log::EventType::Escalation).len(), 1);

        cancel.cancel();
        for h in handles {
            let _ = tokio::time::timeout(Duration::from_secs(1), h).await;
        }
    }
}

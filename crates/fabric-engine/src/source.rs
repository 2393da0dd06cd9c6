//! Work Source & Claim Engine (C7): repository sync, polling, capability
//! filtering, and the `max_task_count` concurrency bound.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use fabric_collab::{Repository, TrackerClient, WorkItem};
use fabric_log::EventType;
use fabric_p2p::{EnvelopePayload, MessageType, MessagingFabric};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::EngineError,
    types::WorkerState,
    util::to_payload,
    worker::{run_item_worker, ItemWorkerContext},
};

const REPOSITORY_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// True if `task_type` is covered by the node's advertised capabilities, or
/// the capability set includes the `general`/`task-coordination` wildcard.
pub fn can_handle_task_type(capabilities: &[String], task_type: &str) -> bool {
    capabilities
        .iter()
        .any(|c| c == task_type || c == "general" || c == "task-coordination")
}

pub struct ClaimEngine {
    tracker: Arc<dyn TrackerClient>,
    worker_ctx: Arc<ItemWorkerContext>,
    capabilities: Vec<String>,
    max_task_count: usize,
    poll_interval: Duration,
    active_task_count: Arc<AtomicUsize>,
    repositories: Mutex<HashMap<String, Repository>>,
    in_flight: Mutex<Vec<JoinHandle<WorkerState>>>,
}

impl ClaimEngine {
    pub fn new(
        tracker: Arc<dyn TrackerClient>,
        worker_ctx: Arc<ItemWorkerContext>,
        capabilities: Vec<String>,
        max_task_count: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            tracker,
            worker_ctx,
            capabilities,
            max_task_count,
            poll_interval,
            active_task_count: Arc::new(AtomicUsize::new(0)),
            repositories: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn active_task_count(&self) -> Arc<AtomicUsize> {
        self.active_task_count.clone()
    }

    /// Refreshes the active-repositories map from the tracker (period 5
    /// min): adds repositories not seen before, drops ones no longer
    /// listed.
    pub async fn sync_repositories(&self) -> Result<(), EngineError> {
        let active = self.tracker.list_active_repositories().await?;
        let mut repos = self.repositories.lock().unwrap();
        let seen: std::collections::HashSet<String> = active.iter().map(|r| r.project_id.clone()).collect();
        repos.retain(|id, _| seen.contains(id));
        for repo in active {
            repos.entry(repo.project_id.clone()).or_insert(repo);
        }
        Ok(())
    }

    pub async fn run_repository_sync_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(REPOSITORY_SYNC_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_repositories().await {
                        warn!("repository sync failed: {e}");
                    }
                }
            }
        }
    }

    /// One polling tick (§4.7): for every active repository, list
    /// candidates, filter by capability, sort by priority, claim the top
    /// one, and spawn a worker. Never starts a worker when the node is
    /// already at `max_task_count` (testable property 2).
    pub async fn poll_once(&self) -> Result<(), EngineError> {
        if self.active_task_count.load(Ordering::SeqCst) >= self.max_task_count {
            debug!("at max_task_count, skipping poll tick");
            return Ok(());
        }

        let project_ids: Vec<String> = self.repositories.lock().unwrap().keys().cloned().collect();
        let mut candidates: Vec<WorkItem> = Vec::new();
        for project_id in project_ids {
            let items = self.tracker.list_candidate_items(&project_id).await?;
            candidates.extend(
                items
                    .into_iter()
                    .filter(|i| can_handle_task_type(&self.capabilities, &i.task_type)),
            );
        }
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

        let Some(top) = candidates.into_iter().next() else {
            return Ok(());
        };

        if self
            .active_task_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < self.max_task_count {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_err()
        {
            debug!("lost the race for the last worker slot, skipping this tick");
            return Ok(());
        }

        info!(item_id = %top.item_id, "spawning worker for claimed candidate");
        let ctx = self.worker_ctx.clone();
        let active = self.active_task_count.clone();
        let handle = tokio::spawn(run_item_worker(ctx, top, active));
        self.in_flight.lock().unwrap().push(handle);
        self.reap_finished();
        Ok(())
    }

    fn reap_finished(&self) {
        self.in_flight.lock().unwrap().retain(|h| !h.is_finished());
    }

    /// Receiving side of §4.8's "Help request / help response" exchange: a
    /// peer sees a `task_help_request` on an item topic and evaluates its
    /// own capability/load before volunteering. Declining is silent — no
    /// stub reply is sent, since "unwilling" isn't itself a protocol event.
    pub async fn handle_help_request(&self, topic: &str, item_id: &str, reason: &str) -> Result<(), EngineError> {
        if self.active_task_count.load(Ordering::SeqCst) >= self.max_task_count {
            debug!(item_id, "at max_task_count, declining help request");
            return Ok(());
        }

        self.worker_ctx
            .log
            .append(
                EventType::TaskHelpOffered,
                to_payload(&json!({
                    "item_id": item_id,
                    "reason": reason,
                })),
            )
            .await?;

        let mut payload = EnvelopePayload::new();
        payload.insert("item_id".into(), json!(item_id));
        payload.insert("can_help".into(), json!(true));
        payload.insert("capabilities".into(), json!(self.capabilities));
        self.worker_ctx
            .fabric
            .publish(topic, MessageType::TaskHelpResponse, payload)
            .await?;
        info!(item_id, "offered help on stuck item");
        Ok(())
    }

    /// A helper volunteered; per §4.8 the requester only logs the offer, no
    /// forced delegation is implied.
    pub async fn handle_help_response(&self, item_id: &str, helper_node_id: &str) -> Result<(), EngineError> {
        self.worker_ctx
            .log
            .append(
                EventType::TaskHelpReceived,
                to_payload(&json!({
                    "item_id": item_id,
                    "helper": helper_node_id,
                })),
            )
            .await?;
        Ok(())
    }

    /// Runs the poll loop on `poll_interval` until cancelled.
    pub async fn run_poll_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("poll loop shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!("poll tick failed: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conversation::MetaDiscussionEngine, dependency::DependencyCoordinator, sandbox::MockSandboxRuntime,
    };
    use fabric_collab::{MockReasoningBackend, MockTrackerClient, WorkItemState};
    use fabric_log::{InsecureTestSigner, InsecureTestVerifier, VerifiableLog};
    use fabric_p2p::{InMemoryFabric, COORDINATION_TOPIC, META_TOPIC};

    fn item(id: &str, project: &str, task_type: &str, priority: i64) -> WorkItem {
        WorkItem {
            item_id: id.into(),
            project_id: project.into(),
            title: "t".into(),
            body: "b".into(),
            state: WorkItemState::Open,
            labels: vec![],
            assignee: None,
            task_type: task_type.into(),
            priority,
            requirements: vec![],
            deliverables: vec![],
            context: Default::default(),
        }
    }

    async fn engine(max_task_count: usize, items: Vec<WorkItem>) -> (ClaimEngine, Arc<MockTrackerClient>) {
        let tracker = Arc::new(MockTrackerClient::new(
            vec![Repository { project_id: "1".into(), name: "repo".into() }],
            items,
        ));
        let fabric = InMemoryFabric::new("node-a");
        fabric.join(COORDINATION_TOPIC).await.unwrap();
        fabric.join(META_TOPIC).await.unwrap();
        let log = Arc::new(
            VerifiableLog::open(
                None,
                Arc::new(InsecureTestSigner { peer_id: "node-a".into() }),
                Arc::new(InsecureTestVerifier),
            )
            .await
            .unwrap(),
        );
        let reasoning = Arc::new(MockReasoningBackend::new("plan", vec![]));
        let conversation = Arc::new(MetaDiscussionEngine::new(
            fabric.clone(),
            reasoning.clone(),
            log.clone(),
            None,
            vec![],
            10,
            "node-a".into(),
        ));
        let dependency = Arc::new(DependencyCoordinator::new(fabric.clone(), reasoning));
        let worker_ctx = Arc::new(ItemWorkerContext {
            tracker: tracker.clone(),
            fabric,
            log,
            conversation,
            dependency,
            sandbox: Arc::new(MockSandboxRuntime::always_succeeds()),
            node_id: "node-a".into(),
        });
        let engine = ClaimEngine::new(
            tracker.clone(),
            worker_ctx,
            vec!["general".into()],
            max_task_count,
            Duration::from_millis(10),
        );
        engine.sync_repositories().await.unwrap();
        (engine, tracker)
    }

    #[test]
    fn capability_wildcard_accepts_any_task_type() {
        assert!(can_handle_task_type(&["general".into()], "feature"));
        assert!(can_handle_task_type(&["task-coordination".into()], "bugfix"));
        assert!(!can_handle_task_type(&["feature".into()], "bugfix"));
    }

    #[tokio::test]
    async fn poll_once_claims_the_highest_priority_candidate() {
        let (engine, tracker) = engine(1, vec![item("low", "1", "feature", 1), item("high", "1", "feature", 9)]).await;
        engine.poll_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let claims = tracker.claims();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].1, "high");
    }

    #[tokio::test]
    async fn never_exceeds_max_task_count() {
        let (engine, _tracker) = engine(1, vec![item("a", "1", "feature", 1), item("b", "1", "feature", 1)]).await;
        engine.poll_once().await.unwrap();
        assert_eq!(engine.active_task_count.load(Ordering::SeqCst), 1);
        // A second tick before the first worker finishes must not start another.
        engine.poll_once().await.unwrap();
        assert!(engine.active_task_count.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn handle_help_request_offers_when_under_capacity() {
        let (engine, _tracker) = engine(2, vec![]).await;
        let topic = fabric_p2p::item_topic("99");
        engine.worker_ctx.fabric.join(&topic).await.unwrap();
        let mut deliveries = engine.worker_ctx.fabric.deliveries();

        engine.handle_help_request(&topic, "99", "sandbox unavailable").await.unwrap();

        assert_eq!(engine.worker_ctx.log.by_type(fabric_log::EventType::TaskHelpOffered).len(), 1);
        let delivery = deliveries.try_recv().unwrap();
        assert_eq!(delivery.envelope.message_type, MessageType::TaskHelpResponse);
        assert_eq!(delivery.envelope.data.get("can_help").and_then(|v| v.as_bool()), Some(true));
    }

    #[tokio::test]
    async fn handle_help_request_declines_silently_at_capacity() {
        let (engine, _tracker) = engine(1, vec![]).await;
        engine.active_task_count.store(1, Ordering::SeqCst);
        let topic = fabric_p2p::item_topic("99");
        engine.worker_ctx.fabric.join(&topic).await.unwrap();

        engine.handle_help_request(&topic, "99", "sandbox unavailable").await.unwrap();

        assert_eq!(engine.worker_ctx.log.by_type(fabric_log::EventType::TaskHelpOffered).len(), 0);
    }

    #[tokio::test]
    async fn handle_help_response_logs_the_offer_without_forcing_delegation() {
        let (engine, _tracker) = engine(1, vec![]).await;
        engine.handle_help_response("99", "node-b").await.unwrap();
        assert_eq!(engine.worker_ctx.log.by_type(fabric_log::EventType::TaskHelpReceived).len(), 1);
    }
}

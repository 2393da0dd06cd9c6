//! Capability & Availability Broadcaster (C6).
//!
//! Two independent schedules: a 30 s availability cadence, and a
//! change-triggered capability broadcast memoised to a per-node file under
//! the user config directory.

use std::{
    path::PathBuf,
    sync::{atomic::AtomicUsize, atomic::Ordering, Arc},
    time::Duration,
};

use fabric_collab::ReasoningBackend;
use fabric_log::{EventType, VerifiableLog};
use fabric_p2p::{MessageType, MessagingFabric, COORDINATION_TOPIC};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::EngineError,
    types::{AvailabilityRecord, CapabilityChangeReason, CapabilityRecord},
    util::to_payload,
};

const AVAILABILITY_INTERVAL: Duration = Duration::from_secs(30);

pub fn default_memo_path(node_id: &str) -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(std::env::temp_dir);
    base.join("fabric").join(format!("capability-{node_id}.json"))
}

pub struct CapabilityBroadcaster {
    fabric: Arc<dyn MessagingFabric>,
    reasoning: Arc<dyn ReasoningBackend>,
    log: Arc<VerifiableLog>,
    node_id: String,
    configured_capabilities: Vec<String>,
    configured_models: Vec<String>,
    specialization: String,
    memo_path: PathBuf,
}

impl CapabilityBroadcaster {
    pub fn new(
        fabric: Arc<dyn MessagingFabric>,
        reasoning: Arc<dyn ReasoningBackend>,
        log: Arc<VerifiableLog>,
        node_id: String,
        configured_capabilities: Vec<String>,
        configured_models: Vec<String>,
        specialization: String,
        memo_path: PathBuf,
    ) -> Self {
        Self {
            fabric,
            reasoning,
            log,
            node_id,
            configured_capabilities,
            configured_models,
            specialization,
            memo_path,
        }
    }

    fn load_memo(&self) -> Option<CapabilityRecord> {
        let text = std::fs::read_to_string(&self.memo_path).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn persist_memo(&self, record: &CapabilityRecord) {
        if let Some(parent) = self.memo_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("failed to create capability memo directory: {e}");
                return;
            }
        }
        match serde_json::to_string_pretty(record) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.memo_path, text) {
                    warn!("failed to persist capability memo: {e}");
                }
            }
            Err(e) => warn!("failed to serialize capability memo: {e}"),
        }
    }

    /// Queries the reasoning backend for available models, intersects with
    /// the configured model list (falling back to "whatever's available"
    /// when none are configured), and broadcasts only if the result differs
    /// from the last memoised snapshot. Returns the change reason when a
    /// broadcast occurred.
    pub async fn check_and_broadcast(&self) -> Result<Option<CapabilityChangeReason>, EngineError> {
        let available = self.reasoning.list_models().await.unwrap_or_default();
        let model_tags = if self.configured_models.is_empty() {
            available
        } else {
            self.configured_models
                .iter()
                .filter(|m| available.contains(m))
                .cloned()
                .collect()
        };

        let previous = self.load_memo();
        let version = previous.as_ref().map(|p| p.version + 1).unwrap_or(1);
        let record = CapabilityRecord {
            node_id: self.node_id.clone(),
            capability_tags: self.configured_capabilities.clone(),
            model_tags,
            specialization_tag: self.specialization.clone(),
            version,
        };

        let reason = match &previous {
            None => Some(CapabilityChangeReason::Startup),
            Some(prev) => record.diff_reason(prev),
        };

        let Some(reason) = reason else {
            debug!(node_id = %self.node_id, "capability unchanged since last broadcast");
            return Ok(None);
        };

        let mut payload = to_payload(&record);
        payload.insert("reason".into(), serde_json::to_value(reason).unwrap());
        self.fabric
            .publish(COORDINATION_TOPIC, MessageType::CapabilityBroadcast, payload.clone())
            .await?;
        self.log.append(EventType::CapabilityBroadcast, payload).await?;
        self.persist_memo(&record);
        info!(node_id = %self.node_id, ?reason, "broadcast capability record");
        Ok(Some(reason))
    }

    /// Publishes an Availability Record every 30 s until cancelled.
    /// `active_task_count` is read, never mutated, from here.
    pub async fn run_availability_loop(
        &self,
        active_task_count: Arc<AtomicUsize>,
        max_task_count: usize,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(AVAILABILITY_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("availability broadcaster shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let record = AvailabilityRecord::new(
                        self.node_id.clone(),
                        active_task_count.load(Ordering::SeqCst),
                        max_task_count,
                    );
                    let payload = to_payload(&record);
                    if let Err(e) = self
                        .fabric
                        .publish(COORDINATION_TOPIC, MessageType::AvailabilityBroadcast, payload)
                        .await
                    {
                        warn!("failed to publish availability record: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_collab::MockReasoningBackend;
    use fabric_log::{InsecureTestSigner, InsecureTestVerifier};
    use fabric_p2p::InMemoryFabric;

    async fn log() -> Arc<VerifiableLog> {
        Arc::new(
            VerifiableLog::open(
                None,
                Arc::new(InsecureTestSigner {
                    peer_id: "node-a".into(),
                }),
                Arc::new(InsecureTestVerifier),
            )
            .await
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn startup_then_unchanged_config_broadcasts_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let memo_path = dir.path().join("capability.json");
        let fabric = InMemoryFabric::new("node-a");
        fabric.join(COORDINATION_TOPIC).await.unwrap();
        let reasoning = Arc::new(MockReasoningBackend::new("", vec!["gpt-a".into()]));

        let broadcaster = CapabilityBroadcaster::new(
            fabric,
            reasoning,
            log().await,
            "node-a".into(),
            vec!["general".into()],
            vec!["gpt-a".into()],
            "".into(),
            memo_path,
        );

        let first = broadcaster.check_and_broadcast().await.unwrap();
        assert_eq!(first, Some(CapabilityChangeReason::Startup));

        let second = broadcaster.check_and_broadcast().await.unwrap();
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn model_change_between_startups_broadcasts_once_more() {
        let dir = tempfile::tempdir().unwrap();
        let memo_path = dir.path().join("capability.json");
        let fabric = InMemoryFabric::new("node-a");
        fabric.join(COORDINATION_TOPIC).await.unwrap();

        let first_run = CapabilityBroadcaster::new(
            fabric.clone(),
            Arc::new(MockReasoningBackend::new("", vec!["gpt-a".into()])),
            log().await,
            "node-a".into(),
            vec!["general".into()],
            vec!["gpt-a".into()],
            "".into(),
            memo_path.clone(),
        );
        assert_eq!(
            first_run.check_and_broadcast().await.unwrap(),
            Some(CapabilityChangeReason::Startup)
        );

        let second_run = CapabilityBroadcaster::new(
            fabric,
            Arc::new(MockReasoningBackend::new("", vec!["gpt-b".into()])),
            log().await,
            "node-a".into(),
            vec!["general".into()],
            vec!["gpt-b".into()],
            "".into(),
            memo_path,
        );
        assert_eq!(
            second_run.check_and_broadcast().await.unwrap(),
            Some(CapabilityChangeReason::ModelChange)
        );
    }
}

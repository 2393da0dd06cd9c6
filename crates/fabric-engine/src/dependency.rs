//! Dependency Detector & Coordinator (C9): cross-item pattern matching that
//! opens multi-party Coordination Sessions, plus their progress/timeout
//! rules.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use chrono::Utc;
use fabric_collab::ReasoningBackend;
use fabric_p2p::{MessageType, MessagingFabric, META_TOPIC};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::EngineError,
    types::{CoordinationSession, SessionStatus, SessionType, TaskDependency},
    util::to_payload,
};

const ESCALATION_THRESHOLD: usize = 10;
const MAX_SESSION_DURATION: Duration = Duration::from_secs(30 * 60);
const STALE_SESSION_AGE: Duration = Duration::from_secs(2 * 60 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);
const CONSENSUS_PHRASES: &[&str] = &["agree", "sounds good", "approved", "looks good"];

#[derive(Debug, Clone)]
struct KnownItem {
    item_id: String,
    repository: String,
    title: String,
    body: String,
    claimant_node_id: String,
}

type Rule = (&'static str, fn(&str, &str) -> bool);

const RULES: &[Rule] = &[
    ("API_Contract", |a, b| {
        (a.contains("api") && b.contains("implement")) || (b.contains("api") && a.contains("implement"))
    }),
    ("Database_Schema", |a, b| {
        let hit = |t: &str| ["database", "schema", "migration", "table"].iter().any(|k| t.contains(k));
        hit(a) && hit(b)
    }),
    ("Configuration_Dependency", |a, b| {
        let hit = |t: &str| t.contains("config") || t.contains("environment");
        hit(a) && hit(b)
    }),
    ("Security_Compliance", |a, b| {
        let hit = |t: &str| ["security", "auth", "permission", "token"].iter().any(|k| t.contains(k));
        hit(a) && hit(b)
    }),
];

pub struct DependencyCoordinator {
    fabric: std::sync::Arc<dyn MessagingFabric>,
    reasoning: std::sync::Arc<dyn ReasoningBackend>,
    known_items: Mutex<Vec<KnownItem>>,
    sessions: Mutex<HashMap<String, CoordinationSession>>,
}

impl DependencyCoordinator {
    pub fn new(
        fabric: std::sync::Arc<dyn MessagingFabric>,
        reasoning: std::sync::Arc<dyn ReasoningBackend>,
    ) -> Self {
        Self {
            fabric,
            reasoning,
            known_items: Mutex::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a newly claimed item and checks it for dependencies
    /// against every other known item from a different repository.
    pub async fn register_claimed_item(
        &self,
        item_id: &str,
        repository: &str,
        title: &str,
        body: &str,
        claimant_node_id: &str,
    ) -> Result<Vec<TaskDependency>, EngineError> {
        let candidate = KnownItem {
            item_id: item_id.to_string(),
            repository: repository.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            claimant_node_id: claimant_node_id.to_string(),
        };

        let others: Vec<KnownItem> = {
            let known = self.known_items.lock().unwrap();
            known
                .iter()
                .filter(|k| k.repository != candidate.repository)
                .cloned()
                .collect()
        };

        let mut detected = Vec::new();
        for other in &others {
            let text_a = format!("{} {}", candidate.title, candidate.body).to_lowercase();
            let text_b = format!("{} {}", other.title, other.body).to_lowercase();
            for (rule_name, predicate) in RULES {
                if predicate(&text_a, &text_b) {
                    let dependency = TaskDependency {
                        item_a: candidate.item_id.clone(),
                        item_b: other.item_id.clone(),
                        relationship: rule_name.to_string(),
                        reason: format!("rule {rule_name} matched on item text"),
                        confidence: 0.8,
                        detected_at: Utc::now(),
                    };
                    self.open_dependency_session(&dependency, &candidate, other).await?;
                    detected.push(dependency);
                }
            }
        }

        self.known_items.lock().unwrap().push(candidate);
        Ok(detected)
    }

    async fn open_dependency_session(
        &self,
        dependency: &TaskDependency,
        a: &KnownItem,
        b: &KnownItem,
    ) -> Result<(), EngineError> {
        self.fabric
            .publish(
                META_TOPIC,
                MessageType::DependencyAlert,
                to_payload(&json!({
                    "item_a": dependency.item_a,
                    "item_b": dependency.item_b,
                    "relationship": dependency.relationship,
                    "reason": dependency.reason,
                    "confidence": dependency.confidence,
                })),
            )
            .await?;

        let session = CoordinationSession::new(
            SessionType::Dependency,
            vec![a.item_id.clone(), b.item_id.clone()],
            vec![a.claimant_node_id.clone(), b.claimant_node_id.clone()],
        );
        let session_id = session.session_id.clone();
        self.sessions.lock().unwrap().insert(session_id.clone(), session);

        let plan_prompt = format!(
            "Propose a coordination plan for dependent items '{}' ({}) and '{}' ({}), relationship {}",
            a.title, a.item_id, b.title, b.item_id, dependency.relationship
        );
        let plan = self
            .reasoning
            .generate(&plan_prompt, None)
            .await
            .unwrap_or_else(|_| "coordinate directly between claimants".to_string());

        self.fabric
            .publish(
                META_TOPIC,
                MessageType::CoordinationPlan,
                to_payload(&json!({
                    "session_id": session_id,
                    "plan": plan,
                })),
            )
            .await?;
        info!(session_id, relationship = %dependency.relationship, "opened dependency coordination session");
        Ok(())
    }

    /// Applies §4.9's progress-evaluation rules to an incoming coordination
    /// message. Returns the new status if the session transitioned.
    pub async fn record_message(
        &self,
        session_id: &str,
        author_peer_id: &str,
        text: &str,
    ) -> Result<Option<SessionStatus>, EngineError> {
        let outcome = {
            let mut sessions = self.sessions.lock().unwrap();
            let Some(session) = sessions.get_mut(session_id) else {
                return Ok(None);
            };
            if session.is_terminal() {
                return Ok(None);
            }
            session.messages.push(crate::types::Utterance {
                author_peer_id: author_peer_id.to_string(),
                text: text.to_string(),
                timestamp: Utc::now(),
            });
            session.last_activity = Utc::now();
            evaluate_progress(session)
        };

        if let Some((status, reason)) = outcome {
            let message_type = if status == SessionStatus::Resolved {
                MessageType::CoordinationComplete
            } else {
                MessageType::EscalationTrigger
            };
            self.fabric
                .publish(
                    META_TOPIC,
                    message_type,
                    to_payload(&json!({"session_id": session_id, "status": status, "reason": reason})),
                )
                .await?;
            return Ok(Some(status));
        }
        Ok(None)
    }

    pub fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        self.sessions.lock().unwrap().get(session_id).map(|s| s.status)
    }

    /// Drops sessions whose `last_activity` is older than 2h, or that are
    /// already terminal, every 10 minutes until cancelled.
    pub async fn run_cleanup_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("dependency coordinator cleanup loop shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.cleanup_once();
                }
            }
        }
    }

    fn cleanup_once(&self) {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|_, session| {
            let stale = now
                .signed_duration_since(session.last_activity)
                .to_std()
                .map(|d| d > STALE_SESSION_AGE)
                .unwrap_or(false);
            !(stale || session.is_terminal())
        });
        let dropped = before - sessions.len();
        if dropped > 0 {
            debug!(dropped, "swept stale/terminal coordination sessions");
        }
    }
}

fn evaluate_progress(session: &mut CoordinationSession) -> Option<(SessionStatus, String)> {
    if session.messages.len() >= ESCALATION_THRESHOLD {
        session.status = SessionStatus::Escalated;
        let reason = "Message limit exceeded".to_string();
        session.escalation_reason = Some(reason.clone());
        return Some((SessionStatus::Escalated, reason));
    }

    let age = Utc::now().signed_duration_since(session.created_at).to_std().unwrap_or_default();
    if age > MAX_SESSION_DURATION {
        session.status = SessionStatus::TimedOut;
        let reason = "Duration exceeded".to_string();
        session.escalation_reason = Some(reason.clone());
        return Some((SessionStatus::TimedOut, reason));
    }

    let tail: Vec<&crate::types::Utterance> = session.messages.iter().rev().take(3).collect();
    let agreeing = tail
        .iter()
        .filter(|u| {
            let folded = u.text.to_lowercase();
            CONSENSUS_PHRASES.iter().any(|p| folded.contains(p))
        })
        .count();
    let needed = session.participants.len().saturating_sub(1).max(1);
    if agreeing >= needed {
        session.status = SessionStatus::Resolved;
        let reason = "Consensus reached".to_string();
        session.resolution = Some(reason.clone());
        return Some((SessionStatus::Resolved, reason));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_collab::MockReasoningBackend;
    use fabric_p2p::InMemoryFabric;
    use std::sync::Arc;

    fn coordinator(response: &str) -> DependencyCoordinator {
        let fabric = InMemoryFabric::new("node-a");
        DependencyCoordinator::new(fabric, Arc::new(MockReasoningBackend::new(response, vec![])))
    }

    #[tokio::test]
    async fn cross_repo_api_contract_dependency_is_detected() {
        let c = coordinator("coordinate via shared contract doc");
        let fabric = c.fabric.clone();
        fabric.join(META_TOPIC).await.unwrap();

        c.register_claimed_item("1", "repo-a", "Define user API", "spec the endpoints", "node-a")
            .await
            .unwrap();
        let detected = c
            .register_claimed_item("2", "repo-b", "Implement user service", "consume the API", "node-b")
            .await
            .unwrap();

        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].relationship, "API_Contract");
        assert_eq!(c.sessions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn three_agreeing_messages_resolve_session_by_consensus() {
        let c = coordinator("plan");
        let session = CoordinationSession::new(
            SessionType::Dependency,
            vec!["1".into(), "2".into()],
            vec!["node-a".into(), "node-b".into(), "node-c".into()],
        );
        let id = session.session_id.clone();
        c.sessions.lock().unwrap().insert(id.clone(), session);

        c.record_message(&id, "node-a", "I agree with this plan").await.unwrap();
        c.record_message(&id, "node-b", "sounds good to me").await.unwrap();
        let status = c.record_message(&id, "node-c", "approved, let's go").await.unwrap();

        assert_eq!(status, Some(SessionStatus::Resolved));
        assert_eq!(c.session_status(&id), Some(SessionStatus::Resolved));
    }

    #[tokio::test]
    async fn tenth_message_escalates_on_message_limit() {
        let c = coordinator("plan");
        let session = CoordinationSession::new(
            SessionType::Dependency,
            vec!["1".into()],
            vec!["node-a".into(), "node-b".into()],
        );
        let id = session.session_id.clone();
        c.sessions.lock().unwrap().insert(id.clone(), session);

        for i in 0..9 {
            let status = c.record_message(&id, "node-a", &format!("update {i}")).await.unwrap();
            assert_eq!(status, None);
        }
        let status = c.record_message(&id, "node-a", "update 9").await.unwrap();
        assert_eq!(status, Some(SessionStatus::Escalated));
    }
}

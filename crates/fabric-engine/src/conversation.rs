//! Meta-Discussion Engine (C8): per-item plan propose/review cycle, bounded
//! history, and the escalation predicate.

use std::{collections::HashMap, sync::Mutex};

use fabric_collab::{EscalationPayload, EscalationWebhook, ReasoningBackend};
use fabric_log::{EventType, VerifiableLog};
use fabric_p2p::{item_topic, MessageType, MessagingFabric, META_TOPIC};
use serde_json::json;
use tracing::{debug, info};

use crate::{
    error::EngineError,
    types::{Conversation, Utterance},
    util::to_payload,
};

const DEFAULT_ESCALATION_KEYWORDS: &[&str] = &[
    "stuck",
    "help",
    "human",
    "escalate",
    "clarification needed",
    "manual intervention",
];

pub struct MetaDiscussionEngine {
    fabric: std::sync::Arc<dyn MessagingFabric>,
    reasoning: std::sync::Arc<dyn ReasoningBackend>,
    log: std::sync::Arc<VerifiableLog>,
    webhook: Option<EscalationWebhook>,
    escalation_keywords: Vec<String>,
    conversation_limit: usize,
    node_id: String,
    conversations: Mutex<HashMap<(String, String), Conversation>>,
}

impl MetaDiscussionEngine {
    pub fn new(
        fabric: std::sync::Arc<dyn MessagingFabric>,
        reasoning: std::sync::Arc<dyn ReasoningBackend>,
        log: std::sync::Arc<VerifiableLog>,
        webhook: Option<EscalationWebhook>,
        escalation_keywords: Vec<String>,
        conversation_limit: usize,
        node_id: String,
    ) -> Self {
        let escalation_keywords = if escalation_keywords.is_empty() {
            DEFAULT_ESCALATION_KEYWORDS.iter().map(|s| s.to_string()).collect()
        } else {
            escalation_keywords
        };
        Self {
            fabric,
            reasoning,
            log,
            webhook,
            escalation_keywords,
            conversation_limit,
            node_id,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// `incoming_count` counts only messages from other peers; self-authored
    /// responses don't count toward the cap, so the Nth incoming message is
    /// exactly the one that can trigger escalation.
    fn escalation_predicate(&self, response_text: &str, incoming_count: usize) -> bool {
        if incoming_count >= self.conversation_limit {
            return true;
        }
        let folded = response_text.to_lowercase();
        self.escalation_keywords
            .iter()
            .any(|kw| folded.contains(&kw.to_lowercase()))
    }

    /// Opens a new Conversation on `claimed -> planning`: requests a plan
    /// from the reasoning backend, records it as the first utterance, and
    /// publishes it to the dynamic item topic plus the static meta topic.
    pub async fn propose_plan(
        &self,
        project_id: &str,
        item_id: &str,
        title: &str,
        prompt: &str,
    ) -> Result<String, EngineError> {
        let plan = self
            .reasoning
            .generate(prompt, None)
            .await
            .unwrap_or_else(|_| "unable to generate a plan".to_string());

        {
            let mut conversations = self.conversations.lock().unwrap();
            let convo = conversations
                .entry((project_id.to_string(), item_id.to_string()))
                .or_default();
            if convo.title.is_empty() {
                convo.title = title.to_string();
            }
            convo.push(self.node_id.clone(), plan.clone());
        }

        let topic = item_topic(item_id);
        self.fabric.join(&topic).await?;
        let payload = meta_payload(project_id, item_id, &self.node_id, title, &plan);
        self.fabric
            .publish(&topic, MessageType::MetaDiscussion, payload.clone())
            .await?;
        self.fabric
            .publish(META_TOPIC, MessageType::MetaDiscussion, payload)
            .await?;
        self.log
            .append(EventType::PlanProposed, to_payload(&json!({
                "project_id": project_id,
                "item_id": item_id,
                "plan": plan,
            })))
            .await?;
        Ok(plan)
    }

    /// Handles one incoming meta-discussion message addressed to an open
    /// Conversation. Escalated conversations are frozen: the message is
    /// dropped without generating or publishing a response (testable
    /// property 4: escalation monotonicity).
    pub async fn handle_incoming(
        &self,
        project_id: &str,
        item_id: &str,
        author_peer_id: &str,
        title: &str,
        text: &str,
    ) -> Result<(), EngineError> {
        let key = (project_id.to_string(), item_id.to_string());
        let incoming_count = {
            let mut conversations = self.conversations.lock().unwrap();
            let convo = conversations.entry(key.clone()).or_default();
            if convo.escalated {
                debug!(project_id, item_id, "dropping message on escalated conversation");
                return Ok(());
            }
            if convo.title.is_empty() && !title.is_empty() {
                convo.title = title.to_string();
            }
            convo.push(author_peer_id, text);
            convo
                .history
                .iter()
                .filter(|u| u.author_peer_id != self.node_id)
                .count()
        };

        let (prompt, convo_title) = {
            let conversations = self.conversations.lock().unwrap();
            let convo = &conversations[&key];
            (render_history(convo), convo.title.clone())
        };
        let response = self
            .reasoning
            .generate(&prompt, None)
            .await
            .unwrap_or_else(|_| "help".to_string());

        if self.escalation_predicate(&response, incoming_count) {
            self.escalate(project_id, item_id, &key, &response).await?;
            return Ok(());
        }

        {
            let mut conversations = self.conversations.lock().unwrap();
            conversations
                .get_mut(&key)
                .unwrap()
                .push(self.node_id.clone(), response.clone());
        }
        let topic = item_topic(item_id);
        self.fabric.join(&topic).await?;
        let payload = meta_payload(project_id, item_id, &self.node_id, &convo_title, &response);
        self.fabric.publish(&topic, MessageType::MetaDiscussion, payload).await?;
        Ok(())
    }

    async fn escalate(
        &self,
        project_id: &str,
        item_id: &str,
        key: &(String, String),
        trigger_text: &str,
    ) -> Result<(), EngineError> {
        let (history, title) = {
            let mut conversations = self.conversations.lock().unwrap();
            let convo = conversations.get_mut(key).unwrap();
            convo.escalated = true;
            (
                convo.history.iter().map(|u| u.text.clone()).collect::<Vec<_>>(),
                convo.title.clone(),
            )
        };
        let title = if title.is_empty() { item_id.to_string() } else { title };

        info!(project_id, item_id, "escalating conversation");
        self.log
            .append(
                EventType::Escalation,
                to_payload(&json!({
                    "project_id": project_id,
                    "item_id": item_id,
                    "reason": trigger_text,
                })),
            )
            .await?;

        let mut notice = meta_payload(project_id, item_id, &self.node_id, &title, trigger_text);
        notice.insert("escalated".into(), json!(true));
        self.fabric
            .publish(META_TOPIC, MessageType::EscalationTrigger, notice)
            .await?;

        if let Some(webhook) = &self.webhook {
            webhook
                .fire(EscalationPayload {
                    item_id: item_id.to_string(),
                    title,
                    reason: trigger_text.to_string(),
                    history,
                    escalating_node: self.node_id.clone(),
                })
                .await;
        }
        Ok(())
    }

    pub fn is_escalated(&self, project_id: &str, item_id: &str) -> bool {
        self.conversations
            .lock()
            .unwrap()
            .get(&(project_id.to_string(), item_id.to_string()))
            .map(|c| c.escalated)
            .unwrap_or(false)
    }

    pub fn history_len(&self, project_id: &str, item_id: &str) -> usize {
        self.conversations
            .lock()
            .unwrap()
            .get(&(project_id.to_string(), item_id.to_string()))
            .map(|c| c.history.len())
            .unwrap_or(0)
    }
}

fn meta_payload(
    project_id: &str,
    item_id: &str,
    author: &str,
    title: &str,
    text: &str,
) -> fabric_p2p::EnvelopePayload {
    to_payload(&json!({
        "project_id": project_id,
        "item_id": item_id,
        "author": author,
        "title": title,
        "text": text,
    }))
}

fn render_history(convo: &Conversation) -> String {
    convo
        .history
        .iter()
        .map(|u: &Utterance| format!("{}: {}", u.author_peer_id, u.text))
        .collect::<Vec<_>>()
        .join("\n")
}

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reason a [`CapabilityRecord`] was (re-)broadcast (§4.6 / §3's Capability
/// Record lifecycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityChangeReason {
    Startup,
    ModelChange,
    CapabilityChange,
    SpecializationChange,
    UnknownChange,
}

/// A per-node snapshot of static capability: what kinds of work it can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub node_id: String,
    pub capability_tags: Vec<String>,
    pub model_tags: Vec<String>,
    pub specialization_tag: String,
    pub version: u64,
}

impl CapabilityRecord {
    /// Compares two snapshots and names which axis differs, preferring the
    /// first that changed when several do (models, then capabilities, then
    /// specialization).
    pub fn diff_reason(&self, previous: &CapabilityRecord) -> Option<CapabilityChangeReason> {
        if self.model_tags != previous.model_tags {
            Some(CapabilityChangeReason::ModelChange)
        } else if self.capability_tags != previous.capability_tags {
            Some(CapabilityChangeReason::CapabilityChange)
        } else if self.specialization_tag != previous.specialization_tag {
            Some(CapabilityChangeReason::SpecializationChange)
        } else if self != previous {
            Some(CapabilityChangeReason::UnknownChange)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityStatus {
    Ready,
    Working,
    Busy,
}

/// Ephemeral per-node load snapshot, re-broadcast on a fixed cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityRecord {
    pub node_id: String,
    pub status: AvailabilityStatus,
    pub current_task_count: usize,
    pub max_task_count: usize,
    pub available_for_work: bool,
    pub last_activity_timestamp: DateTime<Utc>,
}

impl AvailabilityRecord {
    pub fn new(node_id: String, current_task_count: usize, max_task_count: usize) -> Self {
        let status = if current_task_count == 0 {
            AvailabilityStatus::Ready
        } else if current_task_count < max_task_count {
            AvailabilityStatus::Working
        } else {
            AvailabilityStatus::Busy
        };
        Self {
            node_id,
            status,
            current_task_count,
            max_task_count,
            available_for_work: current_task_count < max_task_count,
            last_activity_timestamp: Utc::now(),
        }
    }
}

/// One turn of a per-item discussion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub author_peer_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-item dialogue, keyed by `(project_id, item_id)` by the owning map.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    pub title: String,
    pub history: Vec<Utterance>,
    pub last_updated: Option<DateTime<Utc>>,
    pub escalated: bool,
    pub participants: Vec<String>,
}

impl Conversation {
    pub fn push(&mut self, author_peer_id: impl Into<String>, text: impl Into<String>) {
        let author = author_peer_id.into();
        if !self.participants.contains(&author) {
            self.participants.push(author.clone());
        }
        self.history.push(Utterance {
            author_peer_id: author,
            text: text.into(),
            timestamp: Utc::now(),
        });
        self.last_updated = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Dependency,
    Conflict,
    Planning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Resolved,
    Escalated,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct SessionParticipant {
    pub last_seen: DateTime<Utc>,
    pub active: bool,
}

/// A multi-item coordination context opened by C9 when a dependency (or
/// other multi-party situation) is detected.
#[derive(Debug, Clone)]
pub struct CoordinationSession {
    pub session_id: String,
    pub session_type: SessionType,
    pub involved_items: Vec<String>,
    pub participants: HashMap<String, SessionParticipant>,
    pub messages: Vec<Utterance>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub resolution: Option<String>,
    pub escalation_reason: Option<String>,
}

impl CoordinationSession {
    pub fn new(session_type: SessionType, involved_items: Vec<String>, participants: Vec<String>) -> Self {
        let now = Utc::now();
        let participants = participants
            .into_iter()
            .map(|p| {
                (
                    p,
                    SessionParticipant {
                        last_seen: now,
                        active: true,
                    },
                )
            })
            .collect();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            session_type,
            involved_items,
            participants,
            messages: Vec::new(),
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
            resolution: None,
            escalation_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, SessionStatus::Active)
    }
}

/// A detected cross-item relationship (§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDependency {
    pub item_a: String,
    pub item_b: String,
    pub relationship: String,
    pub reason: String,
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
}

/// Per-item worker lifecycle (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Discovered,
    ClaimAttempt,
    Claimed,
    Planning,
    Executing,
    Completing,
    HelpRequested,
    Escalated,
    PrCreated,
    Abandoned,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::PrCreated | WorkerState::Abandoned)
    }
}

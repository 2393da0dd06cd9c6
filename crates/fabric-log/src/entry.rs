//! The hash-chained event record and the event-type enumeration it carries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// All event types a node may append to its log (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskAnnounced,
    TaskClaimed,
    TaskProgress,
    TaskHelpRequested,
    TaskHelpOffered,
    TaskHelpReceived,
    TaskCompleted,
    TaskFailed,
    PlanProposed,
    ObjectionRaised,
    Collaboration,
    ConsensusReached,
    Escalation,
    PeerJoined,
    PeerLeft,
    CapabilityBroadcast,
    NetworkEvent,
}

impl EventType {
    fn as_wire_str(&self) -> &'static str {
        match self {
            EventType::TaskAnnounced => "task_announced",
            EventType::TaskClaimed => "task_claimed",
            EventType::TaskProgress => "task_progress",
            EventType::TaskHelpRequested => "task_help_requested",
            EventType::TaskHelpOffered => "task_help_offered",
            EventType::TaskHelpReceived => "task_help_received",
            EventType::TaskCompleted => "task_completed",
            EventType::TaskFailed => "task_failed",
            EventType::PlanProposed => "plan_proposed",
            EventType::ObjectionRaised => "objection_raised",
            EventType::Collaboration => "collaboration",
            EventType::ConsensusReached => "consensus_reached",
            EventType::Escalation => "escalation",
            EventType::PeerJoined => "peer_joined",
            EventType::PeerLeft => "peer_left",
            EventType::CapabilityBroadcast => "capability_broadcast",
            EventType::NetworkEvent => "network_event",
        }
    }
}

/// Opaque key-value payload. A `BTreeMap` keeps key order deterministic so
/// that hashing the payload is reproducible regardless of insertion order.
pub type Payload = BTreeMap<String, serde_json::Value>;

/// A single entry in the hash chain.
///
/// `entry_hash` covers every field except itself and `signature`; see
/// [`LogEntry::compute_hash`]. `prev_hash` is the previous entry's
/// `entry_hash`, or the empty string for index 0.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub author_peer_id: String,
    pub event_type: EventType,
    pub payload: Payload,
    pub prev_hash: String,
    pub entry_hash: String,
    /// Hex-encoded signature over `{author_peer_id}|{entry_hash}|{index}`.
    pub signature: String,
}

impl LogEntry {
    /// Deterministic serialization of every hash-bearing field, excluding
    /// `entry_hash` and `signature` themselves.
    fn canonical_bytes(
        index: u64,
        timestamp: &DateTime<Utc>,
        author_peer_id: &str,
        event_type: EventType,
        payload: &Payload,
        prev_hash: &str,
    ) -> Vec<u8> {
        // `BTreeMap`'s `Serialize` impl emits keys in sorted order, so
        // `serde_json::to_string` here is already canonical.
        let payload_json = serde_json::to_string(payload).unwrap_or_default();
        format!(
            "{index}|{}|{author_peer_id}|{}|{payload_json}|{prev_hash}",
            timestamp.to_rfc3339(),
            event_type.as_wire_str(),
        )
        .into_bytes()
    }

    pub fn compute_hash(
        index: u64,
        timestamp: &DateTime<Utc>,
        author_peer_id: &str,
        event_type: EventType,
        payload: &Payload,
        prev_hash: &str,
    ) -> String {
        let bytes =
            Self::canonical_bytes(index, timestamp, author_peer_id, event_type, payload, prev_hash);
        hex::encode(Sha256::digest(&bytes))
    }

    /// Recompute this entry's hash from its own fields and compare against
    /// the stored `entry_hash`.
    pub fn hash_matches(&self) -> bool {
        let expected = Self::compute_hash(
            self.index,
            &self.timestamp,
            &self.author_peer_id,
            self.event_type,
            &self.payload,
            &self.prev_hash,
        );
        expected == self.entry_hash
    }

    /// Bytes a signer signs over and a verifier checks: `author‖entry_hash‖index`.
    pub fn signing_bytes(&self) -> Vec<u8> {
        format!("{}|{}|{}", self.author_peer_id, self.entry_hash, self.index).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_key_order_does_not_change_hash() {
        let ts = Utc::now();
        let mut a = Payload::new();
        a.insert("b".into(), serde_json::json!(2));
        a.insert("a".into(), serde_json::json!(1));

        let mut b = Payload::new();
        b.insert("a".into(), serde_json::json!(1));
        b.insert("b".into(), serde_json::json!(2));

        let h1 = LogEntry::compute_hash(0, &ts, "peer1", EventType::TaskClaimed, &a, "");
        let h2 = LogEntry::compute_hash(0, &ts, "peer1", EventType::TaskClaimed, &b, "");
        assert_eq!(h1, h2);
    }

    #[test]
    fn different_payload_changes_hash() {
        let ts = Utc::now();
        let mut a = Payload::new();
        a.insert("x".into(), serde_json::json!(1));
        let mut b = Payload::new();
        b.insert("x".into(), serde_json::json!(2));

        let h1 = LogEntry::compute_hash(0, &ts, "peer1", EventType::TaskClaimed, &a, "");
        let h2 = LogEntry::compute_hash(0, &ts, "peer1", EventType::TaskClaimed, &b, "");
        assert_ne!(h1, h2);
    }
}

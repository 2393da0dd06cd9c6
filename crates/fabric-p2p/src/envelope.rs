//! The message envelope carried over every pub/sub topic (§4.4, §6).
//!
//! Authenticity is enforced by gossipsub itself: the swarm is configured
//! with `MessageAuthenticity::Signed` and `ValidationMode::Strict`
//! ([`crate::behaviour::build_gossipsub`]), so an envelope with a missing or
//! invalid sender signature never reaches [`crate::fabric::MessagingFabric`]
//! handlers at all — it is dropped at the protocol layer before decoding
//! ([`crate::behaviour::FabricBehaviour::new`]).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All message types exchanged over the coordination and meta-discussion
/// topics (§6). One enum covers both topic families; a handler inspects
/// `message_type` (or the topic it arrived on) to decide how to interpret
/// `payload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Coordination topic
    TaskAnnouncement,
    TaskClaim,
    TaskProgress,
    TaskComplete,
    CapabilityBroadcast,
    AvailabilityBroadcast,
    // Meta topic (static + dynamic per-item)
    MetaDiscussion,
    TaskHelpRequest,
    TaskHelpResponse,
    CoordinationRequest,
    CoordinationPlan,
    CoordinationResponse,
    CoordinationComplete,
    DependencyAlert,
    EscalationTrigger,
}

pub type EnvelopePayload = BTreeMap<String, serde_json::Value>;

/// `{type, from, timestamp, data, hop_count?}` per §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub from: String,
    pub timestamp: DateTime<Utc>,
    pub data: EnvelopePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop_count: Option<u32>,
}

impl Envelope {
    pub fn new(message_type: MessageType, from: impl Into<String>, data: EnvelopePayload) -> Self {
        Self {
            message_type,
            from: from.into(),
            timestamp: Utc::now(),
            data,
            hop_count: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, crate::error::P2pError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| crate::error::P2pError::Codec(e.to_string()))?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, crate::error::P2pError> {
        ciborium::from_reader(bytes).map_err(|e| crate::error::P2pError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_cbor() {
        let mut data = EnvelopePayload::new();
        data.insert("item_id".into(), serde_json::json!("ITEM-1"));
        let env = Envelope::new(MessageType::TaskClaim, "peer-a", data);
        let bytes = env.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.from, "peer-a");
        assert_eq!(decoded.message_type, MessageType::TaskClaim);
    }
}

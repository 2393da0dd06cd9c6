//! Messaging Fabric (C4): signed pub/sub over C2, with two static topics and
//! dynamically (un)subscribable per-item topics.
//!
//! [`MessagingFabric`] is the seam between C6/C7/C8/C9 and the transport,
//! keeping [`crate::discovery`]-style concerns behind a trait so engine
//! logic can be tested against [`InMemoryFabric`] without a real libp2p
//! swarm.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::envelope::{Envelope, EnvelopePayload, MessageType};
use crate::error::P2pError;

pub const COORDINATION_TOPIC: &str = "coordination";
pub const META_TOPIC: &str = "meta_discussion";

pub fn item_topic(item_id: &str) -> String {
    format!("meta/item/{item_id}")
}

/// A delivered envelope, tagged with the topic it arrived on so a shared
/// handler can still tell `meta/item/A` apart from `meta/item/B`
/// (testable property 6: topic isolation).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub envelope: Envelope,
}

#[async_trait]
pub trait MessagingFabric: Send + Sync {
    fn local_peer_id(&self) -> String;

    async fn join(&self, topic: &str) -> Result<(), P2pError>;
    async fn leave(&self, topic: &str) -> Result<(), P2pError>;

    /// Publish `payload` under `message_type` to `topic`. The envelope is
    /// stamped with this node's peer id and signed by the transport layer
    /// before leaving the process.
    async fn publish(
        &self,
        topic: &str,
        message_type: MessageType,
        payload: EnvelopePayload,
    ) -> Result<(), P2pError>;

    /// Subscribe to every envelope this node has joined the topic of.
    /// Callers filter by `Delivery::topic` to implement "one handler per
    /// topic class" (§4.4) — the meta-discussion handler, for instance,
    /// filters for `META_TOPIC` plus any `meta/item/*` topic it has joined.
    fn deliveries(&self) -> broadcast::Receiver<Delivery>;
}

/// In-process fabric with no networking: every joined peer within the same
/// process receives every publish to a topic it has joined. Used by
/// `fabric-engine`'s unit and scenario tests so C6-C9 logic can be exercised
/// without a real swarm.
pub struct InMemoryFabric {
    peer_id: String,
    tx: broadcast::Sender<Delivery>,
    joined: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl InMemoryFabric {
    pub fn new(peer_id: impl Into<String>) -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            peer_id: peer_id.into(),
            tx,
            joined: std::sync::Mutex::new(std::collections::HashSet::new()),
        })
    }

    /// Share the same bus across multiple `InMemoryFabric` peers so they can
    /// "publish" to one another within a test process.
    pub fn new_on_bus(peer_id: impl Into<String>, tx: broadcast::Sender<Delivery>) -> Arc<Self> {
        Arc::new(Self {
            peer_id: peer_id.into(),
            tx,
            joined: std::sync::Mutex::new(std::collections::HashSet::new()),
        })
    }

    pub fn bus(&self) -> broadcast::Sender<Delivery> {
        self.tx.clone()
    }
}

#[async_trait]
impl MessagingFabric for InMemoryFabric {
    fn local_peer_id(&self) -> String {
        self.peer_id.clone()
    }

    async fn join(&self, topic: &str) -> Result<(), P2pError> {
        self.joined.lock().unwrap().insert(topic.to_string());
        Ok(())
    }

    async fn leave(&self, topic: &str) -> Result<(), P2pError> {
        self.joined.lock().unwrap().remove(topic);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        message_type: MessageType,
        payload: EnvelopePayload,
    ) -> Result<(), P2pError> {
        if !self.joined.lock().unwrap().contains(topic) {
            return Err(P2pError::PublishRejected(format!(
                "not joined to topic {topic}"
            )));
        }
        let envelope = Envelope::new(message_type, self.peer_id.clone(), payload);
        let _ = self.tx.send(Delivery {
            topic: topic.to_string(),
            envelope,
        });
        Ok(())
    }

    fn deliveries(&self) -> broadcast::Receiver<Delivery> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn topic_isolation_between_dynamic_item_topics() {
        let bus = broadcast::channel(16).0;
        let a = InMemoryFabric::new_on_bus("peer-a", bus.clone());
        let b = InMemoryFabric::new_on_bus("peer-b", bus);

        a.join(&item_topic("X")).await.unwrap();
        b.join(&item_topic("Y")).await.unwrap();

        let mut rx_b = b.deliveries();
        a.publish(&item_topic("X"), MessageType::TaskHelpRequest, EnvelopePayload::new())
            .await
            .unwrap();

        // b never joined meta/item/X, so even though the bus is shared it
        // should not treat this delivery as belonging to its own topic.
        let delivery = rx_b.try_recv().unwrap();
        assert_eq!(delivery.topic, item_topic("X"));
        assert_ne!(delivery.topic, item_topic("Y"));
    }

    #[tokio::test]
    async fn publish_without_join_is_rejected() {
        let fabric = InMemoryFabric::new("peer-a");
        let result = fabric
            .publish(COORDINATION_TOPIC, MessageType::TaskAnnouncement, EnvelopePayload::new())
            .await;
        assert!(result.is_err());
    }
}

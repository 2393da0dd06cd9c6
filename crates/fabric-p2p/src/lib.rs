//! Peer transport (C2), local discovery (C3), and signed pub/sub messaging
//! (C4) over libp2p, layered on top of [`fabric_log`]'s append-only log for
//! replication (C1).

pub mod behaviour;
pub mod codec;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod fabric;
pub mod identity;
pub mod log_layer;
pub mod node;
pub mod transport;

pub use discovery::{DiscoveryConfig, PeerInfo};
pub use envelope::{Envelope, EnvelopePayload, MessageType};
pub use error::P2pError;
pub use fabric::{item_topic, Delivery, MessagingFabric, COORDINATION_TOPIC, META_TOPIC};
pub use identity::{KeypairSigner, PeerRegistryVerifier};
pub use log_layer::{build_log_channel, CapturedLog, LogCaptureLayer};
pub use node::{P2pConfig, P2pHandle, P2pNode, Peer, ValidationStats, ValidationStatsSnapshot};

#[cfg(any(test, feature = "test-util"))]
pub use fabric::InMemoryFabric;

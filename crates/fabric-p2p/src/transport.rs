//! Transport construction and keypair management (component C2).
//!
//! Identity is self-certifying: `peer_id` is derived from the keypair's
//! public key, and every session is Noise-authenticated and Yamux-multiplexed
//! by construction — there is no unauthenticated or unencrypted transport.

use std::{fs, path::Path, time::Duration};

use libp2p::{
    core::{muxing::StreamMuxerBox, upgrade},
    identity, noise,
    swarm::Config as SwarmConfig,
    tcp, yamux, PeerId, Transport,
};

use crate::error::P2pError;

/// Build a TCP transport with Noise encryption and Yamux multiplexing.
pub fn build_transport(
    key: &identity::Keypair,
) -> Result<libp2p::core::transport::Boxed<(PeerId, StreamMuxerBox)>, P2pError> {
    let noise_config = noise::Config::new(key).map_err(|e| P2pError::Transport(e.to_string()))?;

    let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
        .upgrade(upgrade::Version::V1)
        .authenticate(noise_config)
        .multiplex(yamux::Config::default())
        .map(|(p, m), _| (p, StreamMuxerBox::new(m)))
        .boxed();
    Ok(transport)
}

/// Idle connections are kept open for 60 s: long enough for the 30 s
/// connection-status heartbeat (§4.2) to observe a peer twice before it is
/// dropped for inactivity.
pub fn default_swarm_config() -> SwarmConfig {
    SwarmConfig::with_tokio_executor().with_idle_connection_timeout(Duration::from_secs(60))
}

/// Load a persisted `identity::Keypair` from `path`, or generate a new one
/// and write it to `path` in protobuf encoding.
pub fn load_or_create_keypair(path: &Path) -> Result<identity::Keypair, P2pError> {
    if path.exists() {
        let raw = fs::read(path).map_err(|e| P2pError::Keypair(e.to_string()))?;
        return identity::Keypair::from_protobuf_encoding(&raw).map_err(|e| {
            P2pError::Keypair(format!(
                "keypair file '{}' could not be decoded as protobuf: {e}",
                path.display()
            ))
        });
    }

    let key = identity::Keypair::generate_ed25519();
    let raw = key
        .to_protobuf_encoding()
        .map_err(|e| P2pError::Keypair(e.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| P2pError::Keypair(e.to_string()))?;
    }
    fs::write(path, &raw).map_err(|e| P2pError::Keypair(e.to_string()))?;
    tracing::info!("Generated new keypair at {}", path.display());
    Ok(key)
}

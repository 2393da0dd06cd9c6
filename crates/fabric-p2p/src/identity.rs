//! Bridges a node's libp2p keypair into [`fabric_log`]'s signing seam, so the
//! verifiable log can be signed/verified without depending on libp2p itself.

use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;
use std::collections::HashMap;
use std::sync::RwLock;

use fabric_log::{Signer, Verifier};

pub struct KeypairSigner {
    keypair: Keypair,
    peer_id: String,
}

impl KeypairSigner {
    pub fn new(keypair: Keypair) -> Self {
        let peer_id = PeerId::from(keypair.public()).to_string();
        Self { keypair, peer_id }
    }
}

impl Signer for KeypairSigner {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        // Ed25519 signing over arbitrary bytes never fails for a valid keypair.
        self.keypair.sign(message).unwrap_or_default()
    }
}

/// Resolves a peer id to the public key learned from its `identify` exchange,
/// then verifies the signature against it. Peers this node has never
/// connected to fail verification, since there is no key on file for them.
#[derive(Default)]
pub struct PeerRegistryVerifier {
    known: RwLock<HashMap<String, PublicKey>>,
}

impl PeerRegistryVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, peer_id: PeerId, public_key: PublicKey) {
        self.known
            .write()
            .unwrap()
            .insert(peer_id.to_string(), public_key);
    }
}

impl Verifier for PeerRegistryVerifier {
    fn verify(&self, peer_id: &str, message: &[u8], signature: &[u8]) -> bool {
        let known = self.known.read().unwrap();
        match known.get(peer_id) {
            Some(key) => key.verify(message, signature),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signer_round_trips_with_registry_verifier() {
        let keypair = Keypair::generate_ed25519();
        let public = keypair.public();
        let peer_id = PeerId::from(public.clone());

        let signer = KeypairSigner::new(keypair);
        let verifier = PeerRegistryVerifier::new();
        verifier.remember(peer_id, public);

        let message = b"hello fabric";
        let sig = signer.sign(message);
        assert!(verifier.verify(&peer_id.to_string(), message, &sig));
        assert!(!verifier.verify(&peer_id.to_string(), b"tampered", &sig));
    }
}

//! Signing seam.
//!
//! `fabric-log` has no network or cryptographic-identity dependency of its
//! own (it is a leaf in the dependency order, spec §2). The node's transport
//! identity lives in `fabric-p2p`; callers hand this crate a small `Signer`
//! implementation that wraps that identity instead of this crate reaching
//! for libp2p directly.

/// Produces signatures over arbitrary byte strings using the node's identity
/// keypair. Implemented by the binary crate on top of `fabric-p2p`'s keypair.
pub trait Signer: Send + Sync {
    fn peer_id(&self) -> &str;
    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

/// Verifies a signature produced by some peer's `Signer`. Implementations
/// resolve `peer_id` to a public key (e.g. by decoding a libp2p `PeerId`,
/// which is self-certifying) and check the signature against it.
pub trait Verifier: Send + Sync {
    fn verify(&self, peer_id: &str, message: &[u8], signature: &[u8]) -> bool;
}

/// A `Signer`/`Verifier` pair for tests: "signs" by hex-encoding the peer id
/// and message together, "verifies" by recomputing the same string. Never
/// use outside tests — it provides no cryptographic guarantee.
#[cfg(any(test, feature = "test-util"))]
pub struct InsecureTestSigner {
    pub peer_id: String,
}

#[cfg(any(test, feature = "test-util"))]
impl Signer for InsecureTestSigner {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        let mut out = self.peer_id.clone().into_bytes();
        out.push(0);
        out.extend_from_slice(message);
        out
    }
}

#[cfg(any(test, feature = "test-util"))]
pub struct InsecureTestVerifier;

#[cfg(any(test, feature = "test-util"))]
impl Verifier for InsecureTestVerifier {
    fn verify(&self, peer_id: &str, message: &[u8], signature: &[u8]) -> bool {
        let mut expected = peer_id.to_string().into_bytes();
        expected.push(0);
        expected.extend_from_slice(message);
        expected == signature
    }
}

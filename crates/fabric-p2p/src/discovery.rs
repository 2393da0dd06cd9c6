//! Local discovery (C3): a bounded, drop-oldest buffer of peer advertisements
//! between the mdns behaviour (which surfaces peers as fast as they appear)
//! and the event loop's connect worker (which dials them one at a time).
//!
//! A plain `tokio::sync::mpsc` channel cannot implement "drop oldest on
//! overflow" — a full mpsc channel blocks or rejects the newest item, not
//! the stalest one — so this is a small ring buffer guarded by a mutex
//! instead.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub address: Multiaddr,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// mdns service tag advertised on the local broadcast domain.
    pub service_tag: String,
    /// Depth of the pending-peer buffer before the oldest entry is dropped.
    pub channel_depth: usize,
    /// How long to wait for a dial to complete before giving up on it.
    pub connect_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_tag: "fabric".to_string(),
            channel_depth: 256,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Bounded buffer of discovered peers awaiting a connection attempt.
pub struct DiscoveryBuffer {
    depth: usize,
    queue: Mutex<VecDeque<PeerInfo>>,
    notify: Notify,
    dropped: std::sync::atomic::AtomicU64,
}

impl DiscoveryBuffer {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            queue: Mutex::new(VecDeque::with_capacity(depth)),
            notify: Notify::new(),
            dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Push a newly discovered peer. When the buffer is already at capacity,
    /// the oldest unconsumed entry is dropped to make room (§4.3's
    /// backpressure policy).
    pub fn push(&self, info: PeerInfo) {
        let mut q = self.queue.lock().unwrap();
        if q.len() >= self.depth {
            q.pop_front();
            self.dropped
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        q.push_back(info);
        drop(q);
        self.notify.notify_one();
    }

    /// Non-blocking pop used by the event loop's periodic drain tick.
    pub fn try_pop(&self) -> Option<PeerInfo> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    fn sample_peer() -> PeerInfo {
        PeerInfo {
            peer_id: PeerId::from(Keypair::generate_ed25519().public()),
            address: "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
        }
    }

    #[test]
    fn drops_oldest_when_full() {
        let buf = DiscoveryBuffer::new(2);
        let a = sample_peer();
        let b = sample_peer();
        let c = sample_peer();
        buf.push(a.clone());
        buf.push(b.clone());
        buf.push(c.clone());

        assert_eq!(buf.dropped_count(), 1);
        let first = buf.try_pop().unwrap();
        assert_eq!(first.peer_id, b.peer_id);
        let second = buf.try_pop().unwrap();
        assert_eq!(second.peer_id, c.peer_id);
        assert!(buf.try_pop().is_none());
    }
}

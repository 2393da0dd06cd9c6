//! Peer Transport (C2) + Local Discovery (C3) + Messaging Fabric (C4) wired
//! into one running swarm.
//!
//! Obtain a [`P2pHandle`] (itself a [`crate::fabric::MessagingFabric`])
//! before calling [`P2pNode::run`], which drives the event loop until a
//! shutdown command or the cancellation token fires.

use std::{
    collections::{HashMap, HashSet},
    num::NonZeroU32,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use fabric_log::{RangeRequest, VerifiableLog};
use futures::StreamExt;
use governor::{Quota, RateLimiter};
use libp2p::{
    gossipsub, identify, identity, mdns, request_response,
    swarm::{Swarm, SwarmEvent},
    Multiaddr, PeerId,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::behaviour::{FabricBehaviour, FabricBehaviourEvent};
use crate::discovery::{DiscoveryBuffer, DiscoveryConfig, PeerInfo};
use crate::envelope::{Envelope, EnvelopePayload, MessageType};
use crate::error::P2pError;
use crate::fabric::{Delivery, MessagingFabric};
use crate::identity::PeerRegistryVerifier;
use crate::transport::{build_transport, default_swarm_config};

type NodeSwarm = Swarm<FabricBehaviour>;

/// How often the connection-status heartbeat and replication sync ticks run.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Depth of the bounded raw-message queue between the swarm event loop and
/// the validation worker (§4.4's validation budget).
const VALIDATION_QUEUE_DEPTH: usize = 256;

/// Maximum envelopes forwarded to handlers per second; excess is dropped,
/// not queued (§4.4).
const VALIDATION_THROTTLE_PER_SEC: u32 = 1024;

type RawGossipLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Counters for every way an inbound gossip message gets dropped instead of
/// reaching a [`Delivery`] subscriber (§4.4's validation budget). Cheap
/// atomics, not a histogram — operators poll [`P2pHandle::validation_stats`]
/// for a point-in-time snapshot.
#[derive(Debug, Default)]
pub struct ValidationStats {
    queue_full: AtomicU64,
    rate_limited: AtomicU64,
    decode_failed: AtomicU64,
    own_message: AtomicU64,
}

/// Point-in-time snapshot of [`ValidationStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationStatsSnapshot {
    pub queue_full: u64,
    pub rate_limited: u64,
    pub decode_failed: u64,
    pub own_message: u64,
}

impl ValidationStats {
    fn snapshot(&self) -> ValidationStatsSnapshot {
        ValidationStatsSnapshot {
            queue_full: self.queue_full.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            decode_failed: self.decode_failed.load(Ordering::Relaxed),
            own_message: self.own_message.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a known peer (§3's Peer entity).
#[derive(Debug, Clone)]
pub struct Peer {
    pub peer_id: PeerId,
    pub addresses: Vec<Multiaddr>,
    pub connected: bool,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

pub struct P2pConfig {
    pub listen_addr: Multiaddr,
    pub discovery: DiscoveryConfig,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addr: "/ip4/0.0.0.0/tcp/0".parse().unwrap(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

#[derive(Debug)]
enum NodeCommand {
    Join(String),
    Leave(String),
    Publish {
        topic: String,
        message_type: MessageType,
        payload: EnvelopePayload,
    },
    Connect {
        peer_id: PeerId,
        address: Multiaddr,
        reply: oneshot::Sender<Result<(), P2pError>>,
    },
    RequestRange {
        peer: PeerId,
        req: RangeRequest,
        reply: oneshot::Sender<Result<fabric_log::RangeResponse, P2pError>>,
    },
}

/// Cheap-to-clone handle to the running node; implements
/// [`MessagingFabric`] so C6-C9 can depend on the trait rather than this
/// concrete type.
#[derive(Clone)]
pub struct P2pHandle {
    local_peer_id: PeerId,
    cmd_tx: mpsc::Sender<NodeCommand>,
    delivery_tx: broadcast::Sender<Delivery>,
    peers: Arc<Mutex<HashMap<PeerId, Peer>>>,
    stats: Arc<ValidationStats>,
}

impl P2pHandle {
    pub fn id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn validation_stats(&self) -> ValidationStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn addresses(&self) -> Vec<Multiaddr> {
        self.peers
            .lock()
            .unwrap()
            .values()
            .flat_map(|p| p.addresses.clone())
            .collect()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.lock().unwrap().keys().copied().collect()
    }

    pub fn connected_peers(&self) -> usize {
        self.peers.lock().unwrap().values().filter(|p| p.connected).count()
    }

    pub async fn connect(&self, peer_id: PeerId, address: Multiaddr) -> Result<(), P2pError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(NodeCommand::Connect {
                peer_id,
                address,
                reply,
            })
            .await
            .map_err(|_| P2pError::Shutdown)?;
        rx.await.map_err(|_| P2pError::Shutdown)?
    }

    pub async fn request_range(
        &self,
        peer: PeerId,
        req: RangeRequest,
    ) -> Result<fabric_log::RangeResponse, P2pError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(NodeCommand::RequestRange { peer, req, reply })
            .await
            .map_err(|_| P2pError::Shutdown)?;
        rx.await.map_err(|_| P2pError::Shutdown)?
    }
}

#[async_trait]
impl MessagingFabric for P2pHandle {
    fn local_peer_id(&self) -> String {
        self.local_peer_id.to_string()
    }

    async fn join(&self, topic: &str) -> Result<(), P2pError> {
        self.cmd_tx
            .send(NodeCommand::Join(topic.to_string()))
            .await
            .map_err(|_| P2pError::Shutdown)
    }

    async fn leave(&self, topic: &str) -> Result<(), P2pError> {
        self.cmd_tx
            .send(NodeCommand::Leave(topic.to_string()))
            .await
            .map_err(|_| P2pError::Shutdown)
    }

    async fn publish(
        &self,
        topic: &str,
        message_type: MessageType,
        payload: EnvelopePayload,
    ) -> Result<(), P2pError> {
        self.cmd_tx
            .send(NodeCommand::Publish {
                topic: topic.to_string(),
                message_type,
                payload,
            })
            .await
            .map_err(|_| P2pError::Shutdown)
    }

    fn deliveries(&self) -> broadcast::Receiver<Delivery> {
        self.delivery_tx.subscribe()
    }
}

pub struct P2pNode {
    config: P2pConfig,
    keypair: identity::Keypair,
    local_peer_id: PeerId,
    log: Arc<VerifiableLog>,
    verifier: Arc<PeerRegistryVerifier>,
    cmd_tx: mpsc::Sender<NodeCommand>,
    cmd_rx: mpsc::Receiver<NodeCommand>,
    delivery_tx: broadcast::Sender<Delivery>,
    peers: Arc<Mutex<HashMap<PeerId, Peer>>>,
    stats: Arc<ValidationStats>,
}

impl P2pNode {
    /// `keypair` is the node's identity; load it with
    /// [`crate::transport::load_or_create_keypair`] (or generate one) before
    /// constructing both this node and the `KeypairSigner`/`PeerRegistryVerifier`
    /// pair passed to `VerifiableLog::open`, so the log and the transport
    /// agree on the same peer id.
    pub fn new(
        config: P2pConfig,
        keypair: identity::Keypair,
        verifier: Arc<PeerRegistryVerifier>,
        log: Arc<VerifiableLog>,
    ) -> Self {
        let local_peer_id = PeerId::from(keypair.public());
        let (cmd_tx, cmd_rx) = mpsc::channel(128);
        let (delivery_tx, _) = broadcast::channel(1024);
        Self {
            config,
            keypair,
            local_peer_id,
            log,
            verifier,
            cmd_tx,
            cmd_rx,
            delivery_tx,
            peers: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(ValidationStats::default()),
        }
    }

    pub fn handle(&self) -> P2pHandle {
        P2pHandle {
            local_peer_id: self.local_peer_id,
            cmd_tx: self.cmd_tx.clone(),
            delivery_tx: self.delivery_tx.clone(),
            peers: Arc::clone(&self.peers),
            stats: Arc::clone(&self.stats),
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), P2pError> {
        tracing::info!("P2pNode starting peer_id={}", self.local_peer_id);

        let transport = build_transport(&self.keypair)?;
        let behaviour = FabricBehaviour::new(&self.keypair, &self.config.discovery.service_tag)?;
        let mut swarm = Swarm::new(
            transport,
            behaviour,
            self.local_peer_id,
            default_swarm_config(),
        );
        swarm
            .listen_on(self.config.listen_addr.clone())
            .map_err(|e| P2pError::Transport(e.to_string()))?;

        let joined_topics = Arc::new(Mutex::new(HashSet::new()));
        let (raw_tx, raw_rx) = mpsc::channel(VALIDATION_QUEUE_DEPTH);
        let limiter: Arc<RawGossipLimiter> = Arc::new(RateLimiter::direct(Quota::per_second(
            NonZeroU32::new(VALIDATION_THROTTLE_PER_SEC).unwrap(),
        )));
        tokio::spawn(run_validation_worker(
            raw_rx,
            self.delivery_tx.clone(),
            Arc::clone(&joined_topics),
            limiter,
            self.local_peer_id.to_string(),
            Arc::clone(&self.stats),
        ));

        let state = NodeState {
            local_peer_id: self.local_peer_id,
            log: self.log,
            verifier: self.verifier,
            peers: self.peers,
            delivery_tx: self.delivery_tx,
            joined_topics,
            raw_tx,
            discovery: Arc::new(DiscoveryBuffer::new(self.config.discovery.channel_depth)),
            connect_timeout: self.config.discovery.connect_timeout,
            pending_connects: HashMap::new(),
            pending_ranges: HashMap::new(),
            replica_progress: HashMap::new(),
            stats: self.stats,
        };

        state.event_loop(swarm, self.cmd_rx, cancel).await
    }
}

/// Drains raw gossipsub messages, applying the validation throttle before
/// decoding and forwarding to subscribers. A message that arrives while the
/// queue is full, or after the throttle's budget is exhausted, is dropped —
/// never queued (§4.4).
async fn run_validation_worker(
    mut raw_rx: mpsc::Receiver<gossipsub::Message>,
    delivery_tx: broadcast::Sender<Delivery>,
    joined_topics: Arc<Mutex<HashSet<String>>>,
    limiter: Arc<RawGossipLimiter>,
    local_peer_id: String,
    stats: Arc<ValidationStats>,
) {
    while let Some(message) = raw_rx.recv().await {
        if limiter.check().is_err() {
            stats.rate_limited.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        let topic = message.topic.to_string();
        if !joined_topics.lock().unwrap().contains(&topic) {
            continue;
        }
        let envelope = match Envelope::decode(&message.data) {
            Ok(e) => e,
            Err(e) => {
                stats.decode_failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("dropping envelope on {topic}: {e}");
                continue;
            }
        };
        if envelope.from == local_peer_id {
            // Own messages are filtered on receipt (§4.4).
            stats.own_message.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        let _ = delivery_tx.send(Delivery { topic, envelope });
    }
}

struct NodeState {
    local_peer_id: PeerId,
    log: Arc<VerifiableLog>,
    verifier: Arc<PeerRegistryVerifier>,
    peers: Arc<Mutex<HashMap<PeerId, Peer>>>,
    delivery_tx: broadcast::Sender<Delivery>,
    joined_topics: Arc<Mutex<HashSet<String>>>,
    raw_tx: mpsc::Sender<gossipsub::Message>,
    discovery: Arc<DiscoveryBuffer>,
    connect_timeout: Duration,
    /// Peers we are actively dialing, with the deadline instant past which
    /// we give up and allow a future rediscovery to retry.
    pending_connects: HashMap<PeerId, tokio::time::Instant>,
    pending_ranges: HashMap<
        request_response::OutboundRequestId,
        oneshot::Sender<Result<fabric_log::RangeResponse, P2pError>>,
    >,
    /// Highest index this node knows each replicator has already applied,
    /// so periodic sync only requests the delta.
    replica_progress: HashMap<PeerId, u64>,
    stats: Arc<ValidationStats>,
}

impl NodeState {
    async fn event_loop(
        mut self,
        mut swarm: NodeSwarm,
        mut cmd_rx: mpsc::Receiver<NodeCommand>,
        cancel: CancellationToken,
    ) -> Result<(), P2pError> {
        let mut status_tick = interval(STATUS_INTERVAL);
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut discovery_tick = interval(Duration::from_millis(250));
        discovery_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    self.on_swarm_event(&mut swarm, event);
                }
                _ = status_tick.tick() => {
                    self.on_status_tick(&mut swarm).await;
                }
                _ = discovery_tick.tick() => {
                    self.on_discovery_tick(&mut swarm);
                }
                Some(cmd) = cmd_rx.recv() => {
                    self.on_command(&mut swarm, cmd);
                }
                _ = cancel.cancelled() => break,
            }
        }

        tracing::info!("P2pNode shutting down");
        Ok(())
    }

    fn on_swarm_event(&mut self, swarm: &mut NodeSwarm, event: SwarmEvent<FabricBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("Listening on {address}");
                if let Some(me) = self.peers.lock().unwrap().get_mut(&self.local_peer_id) {
                    me.addresses.push(address);
                }
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                self.pending_connects.remove(&peer_id);
                let mut peers = self.peers.lock().unwrap();
                let entry = peers.entry(peer_id).or_insert_with(|| Peer {
                    peer_id,
                    addresses: Vec::new(),
                    connected: false,
                    last_seen: chrono::Utc::now(),
                });
                entry.connected = true;
                entry.last_seen = chrono::Utc::now();
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    if let Some(p) = self.peers.lock().unwrap().get_mut(&peer_id) {
                        p.connected = false;
                    }
                }
            }
            SwarmEvent::Behaviour(FabricBehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
                for (peer_id, address) in list {
                    self.discovery.push(PeerInfo { peer_id, address });
                }
            }
            SwarmEvent::Behaviour(FabricBehaviourEvent::Mdns(mdns::Event::Expired(list))) => {
                for (peer_id, _) in list {
                    tracing::debug!("mdns entry expired for {peer_id}");
                }
            }
            SwarmEvent::Behaviour(FabricBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                self.verifier.remember(peer_id, info.public_key.clone());
                let mut peers = self.peers.lock().unwrap();
                if let Some(p) = peers.get_mut(&peer_id) {
                    p.addresses = info.listen_addrs.clone();
                }
                for addr in info.listen_addrs {
                    swarm.add_peer_address(peer_id, addr);
                }
            }
            SwarmEvent::Behaviour(FabricBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                message,
                ..
            })) => {
                self.on_gossip_message(message);
            }
            SwarmEvent::Behaviour(FabricBehaviourEvent::Replication(
                request_response::Event::Message { peer, message, .. },
            )) => {
                self.on_replication_message(swarm, peer, message);
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                tracing::debug!("Connection error to {peer_id:?}: {error}");
                if let Some(pid) = peer_id {
                    self.pending_connects.remove(&pid);
                }
            }
            _ => {}
        }
    }

    fn on_gossip_message(&mut self, message: gossipsub::Message) {
        // Hand off to the validation worker's bounded queue; a full queue
        // means we're over budget, so the message is dropped here rather
        // than queued (§4.4).
        if self.raw_tx.try_send(message).is_err() {
            self.stats.queue_full.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_replication_message(
        &mut self,
        swarm: &mut NodeSwarm,
        peer: PeerId,
        message: request_response::Message<RangeRequest, fabric_log::RangeResponse>,
    ) {
        match message {
            request_response::Message::Request {
                request, channel, ..
            } => {
                let response = self.log.serve_range(&request);
                let _ = swarm
                    .behaviour_mut()
                    .replication
                    .send_response(channel, response);
            }
            request_response::Message::Response {
                request_id,
                response,
                ..
            } => {
                if let Some(reply) = self.pending_ranges.remove(&request_id) {
                    let _ = reply.send(Ok(response));
                } else {
                    // Unsolicited response path: periodic replicator sync.
                    let log = Arc::clone(&self.log);
                    let entries = response.entries.clone();
                    tokio::spawn(async move {
                        if let Err(e) = log.apply_remote_range(entries).await {
                            tracing::warn!("replication sync from {peer}: {e}");
                        }
                    });
                }
            }
        }
    }

    async fn on_status_tick(&mut self, swarm: &mut NodeSwarm) {
        let connected: Vec<String> = swarm
            .connected_peers()
            .map(|p| p.to_string().chars().take(12).collect())
            .collect();
        tracing::info!(
            "connection status: {} peer(s) connected {:?}",
            connected.len(),
            connected
        );

        let replicators: Vec<PeerId> = {
            // fabric-log stores replicator peer ids as strings; parse back.
            self.log
                .replicators()
                .into_iter()
                .filter_map(|s| s.parse().ok())
                .collect()
        };
        let local_len = self.log.length();
        for peer in replicators {
            if !swarm.is_connected(&peer) {
                continue;
            }
            let from = *self.replica_progress.get(&peer).unwrap_or(&0);
            if from >= local_len {
                continue;
            }
            swarm.behaviour_mut().replication.send_request(
                &peer,
                RangeRequest {
                    from_index: from,
                    to_index: local_len,
                },
            );
            self.replica_progress.insert(peer, local_len);
        }
    }

    fn on_discovery_tick(&mut self, swarm: &mut NodeSwarm) {
        // Expire stale dial attempts so a future rediscovery can retry.
        let now = tokio::time::Instant::now();
        self.pending_connects.retain(|_, deadline| *deadline > now);

        if let Some(info) = self.discovery.try_pop() {
            if info.peer_id == self.local_peer_id {
                return;
            }
            if swarm.is_connected(&info.peer_id) || self.pending_connects.contains_key(&info.peer_id)
            {
                return;
            }
            tracing::debug!("dialing discovered peer {}", info.peer_id);
            if swarm.dial(info.address).is_ok() {
                self.pending_connects
                    .insert(info.peer_id, now + self.connect_timeout);
            }
        }
    }

    fn on_command(&mut self, swarm: &mut NodeSwarm, cmd: NodeCommand) {
        match cmd {
            NodeCommand::Join(topic) => {
                let ident = gossipsub::IdentTopic::new(topic.clone());
                if let Err(e) = swarm.behaviour_mut().gossipsub.subscribe(&ident) {
                    tracing::warn!("join {topic} failed: {e}");
                } else {
                    self.joined_topics.lock().unwrap().insert(topic);
                }
            }
            NodeCommand::Leave(topic) => {
                let ident = gossipsub::IdentTopic::new(topic.clone());
                let _ = swarm.behaviour_mut().gossipsub.unsubscribe(&ident);
                self.joined_topics.lock().unwrap().remove(&topic);
            }
            NodeCommand::Publish {
                topic,
                message_type,
                payload,
            } => {
                let envelope = Envelope::new(message_type, self.local_peer_id.to_string(), payload);
                let Ok(bytes) = envelope.encode() else {
                    tracing::warn!("failed to encode envelope for {topic}");
                    return;
                };
                let ident = gossipsub::IdentTopic::new(topic.clone());
                if let Err(e) = swarm.behaviour_mut().gossipsub.publish(ident, bytes) {
                    tracing::debug!("publish to {topic} failed: {e}");
                }
            }
            NodeCommand::Connect {
                peer_id,
                address,
                reply,
            } => {
                let result = swarm
                    .dial(address)
                    .map_err(|e| P2pError::Dial(e.to_string()));
                if result.is_ok() {
                    self.pending_connects
                        .insert(peer_id, tokio::time::Instant::now() + self.connect_timeout);
                }
                let _ = reply.send(result);
            }
            NodeCommand::RequestRange { peer, req, reply } => {
                let request_id = swarm.behaviour_mut().replication.send_request(&peer, req);
                self.pending_ranges.insert(request_id, reply);
            }
        }
    }
}

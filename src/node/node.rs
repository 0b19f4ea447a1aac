//! Truman mesh node implementation.

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::crypto::{IdentityError, NodeIdentity};
use crate::network::admission::AdmissionController;
use crate::network::discovery::{Discovery, DiscoveryEvent};
use crate::network::events::{Event, EventBus};
use crate::network::gossip::{GossipProtocol, GossipStats, Outbound, Received};
use crate::network::message::{
    GossipBody, GossipMessage, Handshake, MessageType, NetworkMessage, PeerAddress, PeersMessage,
    PromotionNotice, PROTOCOL_VERSION,
};
use crate::network::peer::{Admit, PeerManager, Promotion};
use crate::network::prober::{LatencyProber, PING_FAILED};
use crate::network::transport::{Transport, TransportError};
use crate::types::{PeerId, Tag, TrustTier};

use super::config::{ConfigError, NodeConfig};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to build runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("node is not initialized")]
    NotInitialized,

    #[error("node was already started")]
    AlreadyStarted,

    #[error("transport inbound channel already taken")]
    ReceiverTaken,
}

/// Node lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Built, transport not started
    Created,

    /// Listening and handling traffic
    Running,

    /// Cleaned up, cannot restart
    Stopped,
}

/// Statistics about node operation.
#[derive(Clone, Debug, Default)]
pub struct NodeStats {
    pub known_peers: usize,
    pub connected_peers: usize,
    pub seen_messages: usize,
    pub pending_broadcasts: usize,
    pub buffered_events: usize,
    pub dropped_events: u64,
    pub gossip: GossipStats,
}

/// A mesh node: identity, membership, dissemination and event delivery
/// wired to one transport.
pub struct NetworkNode {
    /// Configuration
    config: NodeConfig,

    /// Key material and peer id
    identity: NodeIdentity,

    /// Whitelist
    admission: AdmissionController,

    /// Peer manager and trust ledger
    peers: Arc<PeerManager>,

    /// Gossip protocol
    gossip: GossipProtocol,

    /// Latency probes
    prober: LatencyProber,

    /// Events awaiting collection
    events: EventBus,

    /// Network transport
    transport: Arc<dyn Transport>,

    /// Local network discovery, if any
    discovery: Option<Arc<dyn Discovery>>,

    /// Address announced in handshakes
    listen_addr: RwLock<String>,

    /// Current state
    state: RwLock<NodeState>,

    /// Checked before every outbound send and loop iteration
    cancelled: Arc<AtomicBool>,

    /// Shutdown signal
    shutdown_tx: watch::Sender<bool>,

    loop_started: AtomicBool,

    /// Background tasks
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkNode {
    /// Create a new node. Nothing runs until [`NetworkNode::start`].
    pub fn new<I, S>(
        config: NodeConfig,
        identity: NodeIdentity,
        whitelist: I,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::build(config, identity, whitelist, transport, None)
    }

    /// Create a node that also finds peers through `discovery`.
    pub fn with_discovery<I, S>(
        config: NodeConfig,
        identity: NodeIdentity,
        whitelist: I,
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn Discovery>,
    ) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::build(config, identity, whitelist, transport, Some(discovery))
    }

    fn build<I, S>(
        config: NodeConfig,
        identity: NodeIdentity,
        whitelist: I,
        transport: Arc<dyn Transport>,
        discovery: Option<Arc<dyn Discovery>>,
    ) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let local_id = identity.peer_id();

        let peers = Arc::new(PeerManager::new(
            local_id,
            config.network.max_peers,
            config.membership.clone(),
        ));
        peers.seed_wolves(config.trust.wolf_ids());
        if config.identity.tier.is_wolf() {
            peers.seed_wolves([local_id]);
        }

        let gossip = GossipProtocol::new(local_id, Arc::clone(&peers), config.gossip.clone());
        let prober = LatencyProber::new(
            local_id,
            Arc::clone(&peers),
            Arc::clone(&transport),
            config.probe.clone(),
        );
        let events = EventBus::new(config.events.capacity);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            admission: AdmissionController::with_whitelist(whitelist),
            listen_addr: RwLock::new(transport.local_addr()),
            config,
            identity,
            peers,
            gossip,
            prober,
            events,
            transport,
            discovery,
            state: RwLock::new(NodeState::Created),
            cancelled: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            loop_started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Get our peer ID.
    pub fn local_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Our peer ID as 64 hex characters.
    pub fn local_peer_id(&self) -> String {
        self.local_id().to_string()
    }

    pub fn local_tier(&self) -> TrustTier {
        self.peers.local_tier()
    }

    pub fn listen_addr(&self) -> String {
        self.listen_addr.read().clone()
    }

    /// Get current node state.
    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == NodeState::Running
    }

    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Get node statistics.
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            known_peers: self.peers.peer_count(),
            connected_peers: self.peers.connected_count(),
            seen_messages: self.gossip.seen_count(),
            pending_broadcasts: self.gossip.pending_count(),
            buffered_events: self.events.len(),
            dropped_events: self.events.dropped(),
            gossip: self.gossip.stats(),
        }
    }

    /// Start the transport, the inbound handler, and dial bootstrap peers.
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        if self.state() != NodeState::Created {
            return Err(NodeError::AlreadyStarted);
        }

        let addr = self.transport.start().await?;
        let Some(receiver) = self.transport.take_receiver() else {
            self.transport.shutdown().await;
            return Err(NodeError::ReceiverTaken);
        };
        *self.listen_addr.write() = addr.clone();

        info!(
            "Truman node {} ({}) listening on {}",
            self.local_id().short(),
            self.local_tier(),
            addr
        );

        let handler = tokio::spawn(Self::handle_messages(
            Arc::downgrade(self),
            receiver,
            self.shutdown_tx.subscribe(),
        ));
        self.tasks.lock().push(handler);

        *self.state.write() = NodeState::Running;

        self.start_discovery(&addr);
        self.dial_bootstrap_peers();
        Ok(())
    }

    /// Announce ourselves on the local network and dial what turns up.
    ///
    /// Discovery is best-effort: without it the node still peers through
    /// bootstrap addresses and peer exchange.
    fn start_discovery(self: &Arc<Self>, addr: &str) {
        let Some(discovery) = &self.discovery else {
            return;
        };

        match discovery.start(self.local_id(), addr) {
            Ok(found) => {
                let task = tokio::spawn(Self::handle_discovery(
                    Arc::downgrade(self),
                    found,
                    self.shutdown_tx.subscribe(),
                ));
                self.tasks.lock().push(task);
                info!("Local network discovery started");
            }
            Err(e) => warn!("Local network discovery unavailable: {}", e),
        }
    }

    /// Start the periodic gossip loop. Calling it again does nothing.
    pub fn start_gossip_loop(self: &Arc<Self>) {
        if !self.is_running() || self.loop_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = self.gossip.config().tick_interval();

        let gossip_loop = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {}
                }
                let Some(node) = weak.upgrade() else { break };
                if node.cancelled.load(Ordering::SeqCst) {
                    break;
                }
                node.tick();
            }
            debug!("Gossip loop stopped");
        });
        self.tasks.lock().push(gossip_loop);
        info!("Gossip loop started, every {:?}", period);
    }

    /// One round of the gossip loop.
    fn tick(&self) {
        let report = self.peers.sweep();
        for id in &report.stale {
            debug!("Peer {} went stale", id.short());
        }
        for id in &report.abandoned {
            debug!("Handshake with {} timed out", id.short());
        }
        for record in report.evicted {
            info!("Evicted silent peer {}", record.id.short());
            self.transport.disconnect(&record.addr);
            self.events.push(Event::disconnection(record.id));
        }

        self.gossip.cleanup();

        // Peer exchange doubles as keepalive for idle peers.
        let mut targets = self.gossip.select_fanout(&[]);
        let idle_after = self.peers.config().stale_after() / 2;
        for record in self.peers.idle_peers(idle_after) {
            if !targets.contains(&record.id) {
                targets.push(record.id);
            }
        }
        let exchange: Outbound = targets
            .into_iter()
            .map(|id| (id, NetworkMessage::new(self.local_id(), MessageType::GetPeers)))
            .collect();
        self.dispatch(exchange);

        self.dispatch(self.gossip.retransmit());
        self.dial_bootstrap_peers();
    }

    /// Send a Hello to bootstrap addresses we are not connected to.
    fn dial_bootstrap_peers(&self) {
        if self.config.network.bootstrap_peers.is_empty() {
            return;
        }

        let own = self.listen_addr();
        let known: HashSet<String> = self
            .peers
            .connected_peers()
            .into_iter()
            .map(|p| p.addr)
            .collect();

        let mut hello: Option<Handshake> = None;
        for addr in &self.config.network.bootstrap_peers {
            if *addr == own || known.contains(addr) {
                continue;
            }
            debug!("Dialing bootstrap peer {}", addr);
            let hello = hello.get_or_insert_with(|| self.handshake()).clone();
            self.send_all(addr.clone(), vec![MessageType::Hello(hello)]);
        }
    }

    // === Host operations ===

    /// Originate a tagged text broadcast.
    pub fn broadcast_message(&self, payload: &str, tag: Tag) -> bool {
        if !self.is_running() {
            return false;
        }

        let (message, outbound) = self.gossip.originate(GossipBody::Text {
            payload: payload.to_string(),
            tag,
        });
        self.events.push(Event::message(self.local_id(), payload, tag));
        debug!(
            "Broadcasting {} message {} to {} peers",
            tag,
            hex::encode(&message.id[..4]),
            outbound.len()
        );
        self.dispatch(outbound);
        true
    }

    /// Promote `target` to Wolf. Only a Wolf may promote.
    pub fn new_wolf(&self, target: &PeerId) -> bool {
        if !self.is_running() {
            return false;
        }
        if !self.peers.local_tier().is_wolf() {
            warn!("Refusing to promote {}: local node is not a wolf", target.short());
            return false;
        }

        match self.peers.promote_known(target) {
            Promotion::UnknownPeer => {
                debug!("Cannot promote unknown peer {}", target.short());
                false
            }
            Promotion::AlreadyWolf => true,
            Promotion::Promoted => {
                info!("Promoted {} to wolf", target.short());
                self.admission.allow(target);
                self.events.push(Event::trust_change(*target));

                let notice = PromotionNotice::sign(&self.identity, *target);
                let (_, outbound) = self.gossip.originate(GossipBody::Promotion(notice));
                self.dispatch(outbound);
                true
            }
        }
    }

    /// Ping a peer. Milliseconds on success, -1 otherwise.
    pub async fn ping(&self, peer: &PeerId) -> i64 {
        if !self.is_running() {
            return PING_FAILED;
        }
        self.prober.ping(peer).await
    }

    /// Ping every connected peer concurrently.
    pub async fn ping_all(&self) -> Vec<(PeerId, i64)> {
        if !self.is_running() {
            return Vec::new();
        }
        self.prober.ping_all().await
    }

    /// Connected peer ids, sorted.
    pub fn get_peers(&self) -> Vec<String> {
        self.peers
            .connected_ids()
            .into_iter()
            .map(|id| id.to_string())
            .collect()
    }

    /// Drain buffered events as JSON, oldest first.
    pub fn collect_events(&self) -> Vec<String> {
        self.events.drain_json()
    }

    /// Drain buffered events.
    pub fn drain_events(&self) -> Vec<Event> {
        self.events.drain()
    }

    /// Say goodbye, stop every task and drop all network state.
    pub async fn cleanup(&self) {
        let was_running = {
            let mut state = self.state.write();
            if *state == NodeState::Stopped {
                return;
            }
            let was_running = *state == NodeState::Running;
            *state = NodeState::Stopped;
            was_running
        };

        if was_running {
            let goodbye = NetworkMessage::new(self.local_id(), MessageType::Goodbye);
            let addrs: Vec<String> = self
                .peers
                .connected_peers()
                .into_iter()
                .map(|p| p.addr)
                .collect();
            let sends = addrs
                .iter()
                .map(|addr| self.transport.send(addr, goodbye.clone()));
            let _ = tokio::time::timeout(
                self.config.probe.timeout(),
                futures::future::join_all(sends),
            )
            .await;
        }

        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        if let Some(discovery) = &self.discovery {
            discovery.shutdown();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.prober.cancel_all();
        self.transport.shutdown().await;

        self.gossip.clear();
        self.events.clear();
        self.peers.clear();

        info!("Truman node {} stopped", self.local_id().short());
    }

    // === Inbound traffic ===

    async fn handle_messages(
        weak: Weak<Self>,
        mut receiver: mpsc::Receiver<NetworkMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let message = tokio::select! {
                _ = shutdown.changed() => break,
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let Some(node) = weak.upgrade() else { break };
            if node.cancelled.load(Ordering::SeqCst) {
                break;
            }
            node.handle_message(message);
        }
        debug!("Inbound handler stopped");
    }

    async fn handle_discovery(
        weak: Weak<Self>,
        mut found: mpsc::Receiver<DiscoveryEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = found.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(node) = weak.upgrade() else { break };
            if node.cancelled.load(Ordering::SeqCst) {
                break;
            }
            node.on_discovery(event);
        }
        debug!("Discovery handler stopped");
    }

    fn on_discovery(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Discovered { peer, addr } => {
                let mut hello = None;
                self.dial_candidate(peer, addr, &mut hello);
            }
            DiscoveryEvent::Expired { peer } => {
                let was_member = self.peers.is_member(&peer);
                if let Some(record) = self.peers.remove(&peer) {
                    self.transport.disconnect(&record.addr);
                    if was_member {
                        info!("Peer {} left the local network", peer.short());
                        self.events.push(Event::disconnection(peer));
                    }
                }
            }
        }
    }

    fn handle_message(&self, message: NetworkMessage) {
        let kind = message.kind();
        let sender = message.sender;

        if message.version != PROTOCOL_VERSION {
            debug!("Dropping {} with protocol version {}", kind, message.version);
            return;
        }
        if sender == self.local_id() {
            return;
        }

        match message.payload {
            MessageType::Hello(handshake) => self.on_handshake(sender, handshake, true),
            MessageType::HelloAck(handshake) => self.on_handshake(sender, handshake, false),
            payload => {
                if !self.peers.is_member(&sender) {
                    debug!("Dropping {} from non-member {}", kind, sender.short());
                    return;
                }
                self.peers.touch(&sender);

                match payload {
                    MessageType::Goodbye => self.on_goodbye(sender),
                    MessageType::GetPeers => self.on_get_peers(sender),
                    MessageType::Peers(list) => self.on_peers(list),
                    MessageType::Gossip(gossip) => self.on_gossip(sender, gossip),
                    MessageType::Ping(nonce) => self.reply(&sender, MessageType::Pong(nonce)),
                    MessageType::Pong(nonce) => {
                        if !self.prober.handle_pong(&sender, nonce) {
                            debug!("Stray pong from {}", sender.short());
                        }
                    }
                    MessageType::Hello(_) | MessageType::HelloAck(_) => {}
                }
            }
        }
    }

    fn on_handshake(&self, sender: PeerId, handshake: Handshake, is_hello: bool) {
        let id = match handshake.verify() {
            Ok(id) => id,
            Err(e) => {
                warn!("Rejecting handshake from {}: {}", sender.short(), e);
                return;
            }
        };
        if id != sender {
            warn!("Handshake key does not match sender {}", sender.short());
            return;
        }
        if !self.admission.is_admitted(&id) {
            debug!("Peer {} is not whitelisted", id.short());
            return;
        }

        let admit = self.peers.mark_connected(id, &handshake.listen_addr);
        if admit == Admit::Full {
            debug!("Peer table full, refusing {}", id.short());
            return;
        }

        let mut replies = Vec::new();
        if is_hello {
            replies.push(MessageType::HelloAck(self.handshake()));
        }
        if admit == Admit::New {
            info!("Connected to peer {} at {}", id.short(), handshake.listen_addr);
            self.events.push(Event::connection(id));
            replies.push(MessageType::GetPeers);
        }
        self.send_all(handshake.listen_addr, replies);
    }

    fn on_goodbye(&self, sender: PeerId) {
        if let Some(record) = self.peers.remove(&sender) {
            info!("Peer {} left", sender.short());
            self.transport.disconnect(&record.addr);
            self.events.push(Event::disconnection(sender));
        }
    }

    fn on_get_peers(&self, sender: PeerId) {
        let peers = self
            .peers
            .connected_peers()
            .into_iter()
            .filter(|p| p.id != sender)
            .map(|p| PeerAddress {
                id: p.id,
                addr: p.addr,
            })
            .collect();
        self.reply(&sender, MessageType::Peers(PeersMessage { peers }));
    }

    fn on_peers(&self, list: PeersMessage) {
        let mut hello: Option<Handshake> = None;
        for peer in list.peers {
            self.dial_candidate(peer.id, peer.addr, &mut hello);
        }
    }

    /// Start a handshake with a newly learned peer, if admission allows.
    fn dial_candidate(&self, id: PeerId, addr: String, hello: &mut Option<Handshake>) {
        if id == self.local_id() || self.peers.contains(&id) {
            return;
        }
        if !self.admission.is_admitted(&id) {
            debug!("Not dialing {}: not whitelisted", id.short());
            return;
        }
        if self.peers.discover(id, &addr) {
            debug!("Discovered peer {} at {}", id.short(), addr);
            let hello = hello.get_or_insert_with(|| self.handshake()).clone();
            self.send_all(addr, vec![MessageType::Hello(hello)]);
        }
    }

    fn on_gossip(&self, sender: PeerId, message: GossipMessage) {
        let message = match self.gossip.receive(message) {
            Received::Duplicate => return,
            Received::Fresh(message) => message,
        };

        match &message.body {
            GossipBody::Text { payload, tag } => {
                debug!(
                    "Delivering {} message from {} ({} hops left)",
                    tag,
                    message.origin.short(),
                    message.ttl
                );
                self.events
                    .push(Event::message(message.origin, payload.clone(), *tag));
            }
            GossipBody::Promotion(notice) => {
                if !self.apply_notice(&message.origin, notice) {
                    return;
                }
            }
        }

        let outbound = self.gossip.relay(&sender, &message);
        self.dispatch(outbound);
    }

    /// Apply a remote promotion if a known wolf signed it.
    ///
    /// Returns false for notices that must not be relayed.
    fn apply_notice(&self, origin: &PeerId, notice: &PromotionNotice) -> bool {
        let promoter = match notice.verify() {
            Ok(promoter) => promoter,
            Err(e) => {
                warn!("Dropping promotion from {}: {}", origin.short(), e);
                return false;
            }
        };
        if promoter != *origin {
            warn!("Promotion signer does not match origin {}", origin.short());
            return false;
        }
        if !self.peers.tier_of(&promoter).is_wolf() {
            warn!("Dropping promotion by non-wolf {}", promoter.short());
            return false;
        }

        if self.peers.apply_promotion(&notice.target) {
            info!(
                "{} promoted {} to wolf",
                promoter.short(),
                notice.target.short()
            );
            self.admission.allow(&notice.target);
            self.events.push(Event::trust_change(notice.target));
        }
        true
    }

    // === Outbound traffic ===

    fn handshake(&self) -> Handshake {
        Handshake::sign(&self.identity, &self.listen_addr.read())
    }

    fn reply(&self, peer: &PeerId, payload: MessageType) {
        if let Some(addr) = self.peers.addr_of(peer) {
            self.send_all(addr, vec![payload]);
        }
    }

    fn send_all(&self, addr: String, payloads: Vec<MessageType>) {
        let local_id = self.local_id();
        let messages = payloads
            .into_iter()
            .map(|payload| NetworkMessage::new(local_id, payload))
            .collect();
        self.spawn_send(addr, messages);
    }

    fn dispatch(&self, outbound: Outbound) {
        for (peer, message) in outbound {
            match self.peers.addr_of(&peer) {
                Some(addr) => self.spawn_send(addr, vec![message]),
                None => debug!("No address for {}", peer.short()),
            }
        }
    }

    /// Send messages to one address, in order, on a separate task.
    fn spawn_send(&self, addr: String, messages: Vec<NetworkMessage>) {
        if messages.is_empty() || self.cancelled.load(Ordering::SeqCst) {
            return;
        }

        let transport = Arc::clone(&self.transport);
        let cancelled = Arc::clone(&self.cancelled);
        tokio::spawn(async move {
            for message in messages {
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                let kind = message.kind();
                if let Err(e) = transport.send(&addr, message).await {
                    debug!("Sending {} to {} failed: {}", kind, addr, e);
                    break;
                }
            }
        });
    }
}

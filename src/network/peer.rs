//! Peer membership and trust tracking.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use crate::types::{PeerId, TrustTier};

/// Connection state of a peer.
///
/// `Unknown -> Connecting -> Connected -> Stale -> Evicted`, with
/// `Stale -> Connected` on fresh contact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Never heard of
    Unknown,
    /// Discovered, handshake in progress
    Connecting,
    /// Handshake completed, recently in contact
    Connected,
    /// No contact for one timeout window
    Stale,
    /// No contact for a second window, removed
    Evicted,
}

/// Membership timeouts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Silence before a connected peer turns stale
    pub stale_after_ms: u64,

    /// Further silence before a stale peer is evicted
    pub evict_after_ms: u64,

    /// How long a discovered peer may take to complete the handshake
    pub connect_timeout_ms: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 30_000,
            evict_after_ms: 60_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl MembershipConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn evict_after(&self) -> Duration {
        Duration::from_millis(self.evict_after_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Information about a peer.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    /// Unique peer ID
    pub id: PeerId,

    /// Transport address the peer listens on
    pub addr: String,

    /// Trust tier
    pub tier: TrustTier,

    /// Connection state
    pub state: ConnectionState,

    /// Last contact
    pub last_seen: Instant,

    /// When the current state was entered
    pub since: Instant,

    /// Last measured round-trip time
    pub rtt: Option<Duration>,

    /// Number of messages received
    pub messages_received: u64,
}

impl PeerRecord {
    fn new(id: PeerId, addr: String, tier: TrustTier, state: ConnectionState, now: Instant) -> Self {
        Self {
            id,
            addr,
            tier,
            state,
            last_seen: now,
            since: now,
            rtt: None,
            messages_received: 0,
        }
    }

    fn enter(&mut self, state: ConnectionState, now: Instant) {
        if self.state != state {
            self.state = state;
            self.since = now;
        }
    }

    /// Whether the peer can currently receive traffic.
    pub fn is_reachable(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Stale
        )
    }
}

/// Result of registering a completed handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admit {
    /// Peer became connected for the first time
    New,
    /// Peer was already connected (or stale and is now refreshed)
    Existing,
    /// Table is full
    Full,
}

/// Result of a local promotion request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Promotion {
    /// Tier changed from Sheep to Wolf
    Promoted,
    /// Target was already Wolf
    AlreadyWolf,
    /// Target is not a known peer
    UnknownPeer,
}

/// Peers that changed state during a sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Connected peers that went stale
    pub stale: Vec<PeerId>,

    /// Stale peers removed from the table
    pub evicted: Vec<PeerRecord>,

    /// Discovered peers whose handshake never completed
    pub abandoned: Vec<PeerId>,
}

/// Manages known peers, their connection state and trust tier.
pub struct PeerManager {
    /// Known peers by ID, ordered for stable listings
    peers: RwLock<BTreeMap<PeerId, PeerRecord>>,

    /// Peers known to be Wolf, including ones not in the table
    wolves: RwLock<HashSet<PeerId>>,

    /// Maximum number of peers
    max_peers: usize,

    /// Timeouts
    config: MembershipConfig,

    /// Our own peer ID
    local_id: PeerId,
}

impl PeerManager {
    /// Create a new peer manager.
    pub fn new(local_id: PeerId, max_peers: usize, config: MembershipConfig) -> Self {
        Self {
            peers: RwLock::new(BTreeMap::new()),
            wolves: RwLock::new(HashSet::new()),
            max_peers,
            config,
            local_id,
        }
    }

    /// Get our local peer ID.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    // === Trust ledger ===

    /// Record peers known to be Wolf from the start.
    pub fn seed_wolves<I: IntoIterator<Item = PeerId>>(&self, ids: I) {
        let mut wolves = self.wolves.write();
        wolves.extend(ids);
        let mut peers = self.peers.write();
        for (id, record) in peers.iter_mut() {
            if wolves.contains(id) {
                record.tier = TrustTier::Wolf;
            }
        }
    }

    /// Tier of any peer, known to the table or not.
    pub fn tier_of(&self, id: &PeerId) -> TrustTier {
        ledger_tier(&self.wolves.read(), id)
    }

    /// Our own tier.
    pub fn local_tier(&self) -> TrustTier {
        self.tier_of(&self.local_id)
    }

    /// Promote a peer that we know about (or ourselves).
    pub fn promote_known(&self, id: &PeerId) -> Promotion {
        if *id != self.local_id && !self.peers.read().contains_key(id) {
            return Promotion::UnknownPeer;
        }
        if self.apply_promotion(id) {
            Promotion::Promoted
        } else {
            Promotion::AlreadyWolf
        }
    }

    /// Mark a peer as Wolf whether or not it is in the table.
    ///
    /// Returns whether the tier changed.
    pub fn apply_promotion(&self, id: &PeerId) -> bool {
        let changed = self.wolves.write().insert(*id);
        if let Some(record) = self.peers.write().get_mut(id) {
            record.tier = TrustTier::Wolf;
        }
        changed
    }

    // === Membership transitions ===

    /// Register a newly discovered candidate (`Unknown -> Connecting`).
    ///
    /// Returns true if the caller should start a handshake.
    pub fn discover(&self, id: PeerId, addr: &str) -> bool {
        if id == self.local_id {
            return false; // Don't add ourselves
        }

        // Ledger before table, as in `seed_wolves`, so a concurrent
        // promotion either lands first or finds the new record.
        let wolves = self.wolves.read();
        let mut peers = self.peers.write();
        if peers.contains_key(&id) || peers.len() >= self.max_peers {
            return false;
        }
        let tier = ledger_tier(&wolves, &id);

        peers.insert(
            id,
            PeerRecord::new(id, addr.to_string(), tier, ConnectionState::Connecting, Instant::now()),
        );
        true
    }

    /// Register a completed handshake (`Connecting -> Connected`).
    pub fn mark_connected(&self, id: PeerId, addr: &str) -> Admit {
        if id == self.local_id {
            return Admit::Full;
        }

        let now = Instant::now();
        let wolves = self.wolves.read();
        let mut peers = self.peers.write();
        let tier = ledger_tier(&wolves, &id);

        if let Some(record) = peers.get_mut(&id) {
            let was_connecting = record.state == ConnectionState::Connecting;
            record.addr = addr.to_string();
            record.last_seen = now;
            record.enter(ConnectionState::Connected, now);
            return if was_connecting { Admit::New } else { Admit::Existing };
        }

        if peers.len() >= self.max_peers {
            return Admit::Full;
        }

        peers.insert(
            id,
            PeerRecord::new(id, addr.to_string(), tier, ConnectionState::Connected, now),
        );
        Admit::New
    }

    /// Record fresh contact from a peer (`Stale -> Connected`).
    ///
    /// Returns false if the peer has no usable record.
    pub fn touch(&self, id: &PeerId) -> bool {
        let now = Instant::now();
        match self.peers.write().get_mut(id) {
            Some(record) if record.is_reachable() => {
                record.last_seen = now;
                record.messages_received += 1;
                record.enter(ConnectionState::Connected, now);
                true
            }
            _ => false,
        }
    }

    /// Store a fresh round-trip measurement.
    pub fn update_rtt(&self, id: &PeerId, rtt: Duration) {
        let now = Instant::now();
        if let Some(record) = self.peers.write().get_mut(id) {
            if record.is_reachable() {
                record.rtt = Some(rtt);
                record.last_seen = now;
                record.enter(ConnectionState::Connected, now);
            }
        }
    }

    /// Remove a peer immediately.
    pub fn remove(&self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.write().remove(id).map(|mut record| {
            record.enter(ConnectionState::Evicted, Instant::now());
            record
        })
    }

    /// Apply timeouts as of now.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// Apply timeouts as of `now`.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let stale_after = self.config.stale_after();
        let evict_after = self.config.evict_after();
        let connect_timeout = self.config.connect_timeout();

        let mut report = SweepReport::default();
        let mut peers = self.peers.write();

        for record in peers.values_mut() {
            let silent = now.saturating_duration_since(record.last_seen);
            match record.state {
                ConnectionState::Connected if silent > stale_after => {
                    record.enter(ConnectionState::Stale, now);
                    report.stale.push(record.id);
                }
                ConnectionState::Stale
                    if now.saturating_duration_since(record.since) > evict_after =>
                {
                    record.enter(ConnectionState::Evicted, now);
                }
                ConnectionState::Connecting
                    if now.saturating_duration_since(record.since) > connect_timeout =>
                {
                    record.enter(ConnectionState::Unknown, now);
                    report.abandoned.push(record.id);
                }
                _ => {}
            }
        }

        let removed: Vec<PeerId> = peers
            .values()
            .filter(|p| matches!(p.state, ConnectionState::Evicted | ConnectionState::Unknown))
            .map(|p| p.id)
            .collect();
        for id in removed {
            if let Some(record) = peers.remove(&id) {
                if record.state == ConnectionState::Evicted {
                    report.evicted.push(record);
                }
            }
        }

        report
    }

    // === Queries ===

    /// Get peer info.
    pub fn get_peer(&self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.read().get(id).cloned()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    /// Whether a peer may send us traffic: it has completed a handshake.
    pub fn is_member(&self, id: &PeerId) -> bool {
        self.peers
            .read()
            .get(id)
            .map(|p| p.is_reachable())
            .unwrap_or(false)
    }

    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.state_of(id) == ConnectionState::Connected
    }

    pub fn state_of(&self, id: &PeerId) -> ConnectionState {
        self.peers
            .read()
            .get(id)
            .map(|p| p.state)
            .unwrap_or(ConnectionState::Unknown)
    }

    /// Address of a peer we can reach.
    pub fn addr_of(&self, id: &PeerId) -> Option<String> {
        self.peers
            .read()
            .get(id)
            .filter(|p| p.state != ConnectionState::Evicted)
            .map(|p| p.addr.clone())
    }

    /// Get all connected peers, ordered by id.
    pub fn connected_peers(&self) -> Vec<PeerRecord> {
        self.peers
            .read()
            .values()
            .filter(|p| p.state == ConnectionState::Connected)
            .cloned()
            .collect()
    }

    /// IDs of connected peers, ordered.
    pub fn connected_ids(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .values()
            .filter(|p| p.state == ConnectionState::Connected)
            .map(|p| p.id)
            .collect()
    }

    /// Reachable peers silent for longer than `idle`, for keepalive traffic.
    pub fn idle_peers(&self, idle: Duration) -> Vec<PeerRecord> {
        let now = Instant::now();
        self.peers
            .read()
            .values()
            .filter(|p| p.is_reachable() && now.saturating_duration_since(p.last_seen) > idle)
            .cloned()
            .collect()
    }

    /// Get number of peers.
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Get number of connected peers.
    pub fn connected_count(&self) -> usize {
        self.peers
            .read()
            .values()
            .filter(|p| p.state == ConnectionState::Connected)
            .count()
    }

    /// Forget all peers. The trust ledger is kept.
    pub fn clear(&self) -> Vec<PeerRecord> {
        std::mem::take(&mut *self.peers.write())
            .into_values()
            .collect()
    }
}

fn ledger_tier(wolves: &HashSet<PeerId>, id: &PeerId) -> TrustTier {
    if wolves.contains(id) {
        TrustTier::Wolf
    } else {
        TrustTier::Sheep
    }
}

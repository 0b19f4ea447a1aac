//! Gossip protocol for epidemic broadcast.

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::message::{GossipBody, GossipMessage, MessageType, NetworkMessage};
use super::peer::PeerManager;
use crate::types::{MessageId, PeerId};

/// Configuration for gossip protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Number of peers to forward to
    pub fanout: usize,

    /// Hop budget of new broadcasts
    pub max_hops: u8,

    /// Period of the gossip loop
    pub tick_interval_ms: u64,

    /// How long to remember seen message IDs
    pub seen_ttl_secs: u64,

    /// Extra rounds a locally originated broadcast is re-sent for
    pub retransmit_rounds: u32,

    /// Fixed seed for fanout selection, random when unset
    pub rng_seed: Option<u64>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: 4,
            max_hops: 6,
            tick_interval_ms: 1000,
            seen_ttl_secs: 300,
            retransmit_rounds: 2,
            rng_seed: None,
        }
    }
}

impl GossipConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn seen_ttl(&self) -> Duration {
        Duration::from_secs(self.seen_ttl_secs)
    }
}

/// Outcome of receiving a gossip record.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    /// Already processed, dropped
    Duplicate,
    /// First sighting, to be delivered and relayed
    Fresh(GossipMessage),
}

/// Counters for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GossipStats {
    pub originated: u64,
    pub delivered: u64,
    pub duplicates: u64,
    pub relayed: u64,
}

/// Locally originated broadcast still being re-sent.
struct PendingBroadcast {
    message: GossipMessage,
    rounds_left: u32,
}

/// Outbound messages produced by the protocol: destination and envelope.
pub type Outbound = Vec<(PeerId, NetworkMessage)>;

/// Gossip protocol handler.
pub struct GossipProtocol {
    /// Configuration
    config: GossipConfig,

    /// Peer manager
    peers: Arc<PeerManager>,

    /// Our peer ID
    local_id: PeerId,

    /// Seen message IDs (for deduplication)
    seen_messages: RwLock<HashMap<MessageId, Instant>>,

    /// Our own broadcasts awaiting retransmission
    pending: Mutex<HashMap<MessageId, PendingBroadcast>>,

    /// Randomness for fanout selection
    rng: Mutex<Box<dyn RngCore + Send>>,

    originated: AtomicU64,
    delivered: AtomicU64,
    duplicates: AtomicU64,
    relayed: AtomicU64,
}

impl GossipProtocol {
    /// Create a new gossip protocol handler.
    pub fn new(local_id: PeerId, peers: Arc<PeerManager>, config: GossipConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_entropy(),
        };
        Self::with_rng(local_id, peers, config, Box::new(rng))
    }

    /// Create a handler with an explicit randomness source.
    pub fn with_rng(
        local_id: PeerId,
        peers: Arc<PeerManager>,
        config: GossipConfig,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        Self {
            config,
            peers,
            local_id,
            seen_messages: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
            originated: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            relayed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    /// Check if we've seen this message before.
    pub fn is_seen(&self, message_id: &MessageId) -> bool {
        self.seen_messages.read().contains_key(message_id)
    }

    /// Mark a message as seen. Returns false if it already was.
    pub fn mark_seen(&self, message_id: MessageId) -> bool {
        let mut seen = self.seen_messages.write();
        if seen.contains_key(&message_id) {
            return false;
        }
        seen.insert(message_id, Instant::now());
        true
    }

    /// Start a new broadcast from this node.
    ///
    /// Returns the record (for local delivery) and the first-hop sends.
    pub fn originate(&self, body: GossipBody) -> (GossipMessage, Outbound) {
        let message = GossipMessage::new(self.local_id, self.config.max_hops, body);
        self.mark_seen(message.id);
        self.originated.fetch_add(1, Ordering::Relaxed);

        if self.config.retransmit_rounds > 0 {
            self.pending.lock().insert(
                message.id,
                PendingBroadcast {
                    message: message.clone(),
                    rounds_left: self.config.retransmit_rounds,
                },
            );
        }

        let targets = self.select_fanout(&[]);
        let outbound = self.envelopes(&message, targets);
        (message, outbound)
    }

    /// Handle a gossip record relayed to us.
    pub fn receive(&self, message: GossipMessage) -> Received {
        if !self.mark_seen(message.id) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return Received::Duplicate;
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Received::Fresh(message)
    }

    /// Next-hop sends for a record we received from `sender`.
    ///
    /// Empty when the decremented hop budget is exhausted.
    pub fn relay(&self, sender: &PeerId, message: &GossipMessage) -> Outbound {
        let Some(next) = message.relayed() else {
            debug!("Gossip {} reached its hop limit", hex::encode(&message.id[..4]));
            return Vec::new();
        };

        let targets = self.select_fanout(&[*sender, message.origin]);
        self.relayed.fetch_add(targets.len() as u64, Ordering::Relaxed);
        self.envelopes(&next, targets)
    }

    /// Re-send pending local broadcasts to a fresh fanout subset.
    pub fn retransmit(&self) -> Outbound {
        let due: Vec<GossipMessage> = {
            let mut pending = self.pending.lock();
            let due = pending
                .values_mut()
                .map(|p| {
                    p.rounds_left -= 1;
                    p.message.clone()
                })
                .collect();
            pending.retain(|_, p| p.rounds_left > 0);
            due
        };

        due.into_iter()
            .flat_map(|message| {
                let targets = self.select_fanout(&[]);
                self.envelopes(&message, targets)
            })
            .collect()
    }

    /// Pick up to `fanout` connected peers at random, skipping `exclude`.
    pub fn select_fanout(&self, exclude: &[PeerId]) -> Vec<PeerId> {
        let mut candidates: Vec<PeerId> = self
            .peers
            .connected_ids()
            .into_iter()
            .filter(|id| *id != self.local_id && !exclude.contains(id))
            .collect();

        let amount = self.config.fanout.min(candidates.len());
        let mut rng = self.rng.lock();
        let (chosen, _) = candidates.partial_shuffle(&mut *rng, amount);
        chosen.to_vec()
    }

    fn envelopes(&self, message: &GossipMessage, targets: Vec<PeerId>) -> Outbound {
        targets
            .into_iter()
            .map(|peer| {
                let envelope =
                    NetworkMessage::new(self.local_id, MessageType::Gossip(message.clone()));
                (peer, envelope)
            })
            .collect()
    }

    /// Number of broadcasts still scheduled for retransmission.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn seen_count(&self) -> usize {
        self.seen_messages.read().len()
    }

    pub fn stats(&self) -> GossipStats {
        GossipStats {
            originated: self.originated.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
        }
    }

    /// Clean up stale data.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }

    /// Forget seen IDs older than the retention window as of `now`.
    pub fn cleanup_at(&self, now: Instant) {
        let ttl = self.config.seen_ttl();
        self.seen_messages
            .write()
            .retain(|_, time| now.saturating_duration_since(*time) < ttl);
    }

    /// Drop all state.
    pub fn clear(&self) {
        self.seen_messages.write().clear();
        self.pending.lock().clear();
    }
}

//! Network message types.

use serde::{Deserialize, Serialize};

use crate::crypto::bls::{self, BlsError};
use crate::crypto::NodeIdentity;
use crate::types::{random_message_id, unix_millis, MessageId, PeerId, Tag};

/// Wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Network message types.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MessageType {
    // === Handshake ===
    /// Initial hello message
    Hello(Handshake),
    /// Response to an accepted hello
    HelloAck(Handshake),
    /// Peer is leaving
    Goodbye,

    // === Peer Discovery ===
    /// Request peer list
    GetPeers,
    /// Response with known peers
    Peers(PeersMessage),

    // === Dissemination ===
    /// Epidemic broadcast record
    Gossip(GossipMessage),

    // === Utility ===
    /// Latency probe
    Ping(u64),
    /// Probe response
    Pong(u64),
}

/// Complete network message with header.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkMessage {
    /// Protocol version
    pub version: u8,

    /// Sender peer ID
    pub sender: PeerId,

    /// Message payload
    pub payload: MessageType,
}

impl NetworkMessage {
    /// Create a new message.
    pub fn new(sender: PeerId, payload: MessageType) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sender,
            payload,
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }

    /// Short name of the payload, for logs.
    pub fn kind(&self) -> &'static str {
        match self.payload {
            MessageType::Hello(_) => "hello",
            MessageType::HelloAck(_) => "hello-ack",
            MessageType::Goodbye => "goodbye",
            MessageType::GetPeers => "get-peers",
            MessageType::Peers(_) => "peers",
            MessageType::Gossip(_) => "gossip",
            MessageType::Ping(_) => "ping",
            MessageType::Pong(_) => "pong",
        }
    }
}

// === Handshake ===

/// Signed proof that the sender owns the key its peer id is derived from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Handshake {
    /// Compressed BLS public key
    pub public_key: Vec<u8>,

    /// Address the sender listens on
    pub listen_addr: String,

    /// Unix milliseconds at signing time
    pub timestamp: u64,

    /// Signature over `listen_addr || timestamp`
    pub signature: Vec<u8>,
}

impl Handshake {
    /// Sign a handshake for our listen address.
    pub fn sign(identity: &NodeIdentity, listen_addr: &str) -> Self {
        let timestamp = unix_millis();
        let signature = identity.sign(&Self::signing_bytes(listen_addr, timestamp));
        Self {
            public_key: identity.public_key_bytes(),
            listen_addr: listen_addr.to_string(),
            timestamp,
            signature: signature.to_bytes().to_vec(),
        }
    }

    /// Verify the signature and return the peer id it proves.
    pub fn verify(&self) -> Result<PeerId, BlsError> {
        bls::verify_raw(
            &self.public_key,
            &self.signature,
            &Self::signing_bytes(&self.listen_addr, self.timestamp),
        )?;
        Ok(PeerId::from_public_key(&self.public_key))
    }

    fn signing_bytes(listen_addr: &str, timestamp: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(listen_addr.len() + 8);
        bytes.extend_from_slice(listen_addr.as_bytes());
        bytes.extend_from_slice(&timestamp.to_be_bytes());
        bytes
    }
}

// === Peer Discovery ===

/// List of known peers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PeersMessage {
    /// Known peer addresses
    pub peers: Vec<PeerAddress>,
}

/// Peer address info.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Peer ID
    pub id: PeerId,

    /// Transport address
    pub addr: String,
}

// === Dissemination ===

/// A broadcast travelling through the mesh.
///
/// Immutable once created: each hop relays a copy with one less `ttl`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    /// Globally unique ID, the deduplication key
    pub id: MessageId,

    /// Peer that created the broadcast
    pub origin: PeerId,

    /// Remaining hop budget
    pub ttl: u8,

    /// Content
    pub body: GossipBody,
}

/// Content of a broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipBody {
    /// Tagged text for the application
    Text { payload: String, tag: Tag },
    /// Trust promotion issued by a wolf
    Promotion(PromotionNotice),
}

impl GossipMessage {
    /// Create a broadcast with a fresh ID.
    pub fn new(origin: PeerId, ttl: u8, body: GossipBody) -> Self {
        Self {
            id: random_message_id(),
            origin,
            ttl,
            body,
        }
    }

    /// The record the next hop receives, if any hop budget remains.
    pub fn relayed(&self) -> Option<Self> {
        let ttl = self.ttl.saturating_sub(1);
        if ttl == 0 {
            return None;
        }
        Some(Self {
            ttl,
            ..self.clone()
        })
    }
}

/// Wolf-signed statement that `target` is now a wolf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionNotice {
    /// Compressed public key of the promoting wolf
    pub promoter_key: Vec<u8>,

    /// Promoted peer
    pub target: PeerId,

    /// Unix milliseconds at signing time
    pub issued_at: u64,

    /// Signature over `target || issued_at`
    pub signature: Vec<u8>,
}

impl PromotionNotice {
    pub fn sign(identity: &NodeIdentity, target: PeerId) -> Self {
        let issued_at = unix_millis();
        let signature = identity.sign(&Self::signing_bytes(&target, issued_at));
        Self {
            promoter_key: identity.public_key_bytes(),
            target,
            issued_at,
            signature: signature.to_bytes().to_vec(),
        }
    }

    /// Verify the signature and return the promoter's peer id.
    pub fn verify(&self) -> Result<PeerId, BlsError> {
        bls::verify_raw(
            &self.promoter_key,
            &self.signature,
            &Self::signing_bytes(&self.target, self.issued_at),
        )?;
        Ok(PeerId::from_public_key(&self.promoter_key))
    }

    fn signing_bytes(target: &PeerId, issued_at: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(40);
        bytes.extend_from_slice(target.as_bytes());
        bytes.extend_from_slice(&issued_at.to_be_bytes());
        bytes
    }
}

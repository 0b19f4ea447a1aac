//! Truman Core Library
//!
//! Peer-to-peer emergency messaging without a central server:
//! - Signed peer identities and optional whitelist admission
//! - Gossip-based dissemination of tagged messages
//! - Membership tracking and latency probing
//! - Sheep/wolf trust tiers with one-way promotion

pub mod types;
pub mod crypto;
pub mod network;
pub mod node;

// Re-export core types for convenience
pub use types::{PeerId, Tag, TrustTier};
pub use crypto::NodeIdentity;
pub use network::{Event, EventKind, GossipProtocol, MemoryNetwork, PeerManager, TcpTransport, Transport};
pub use node::{Backend, NetworkNode, NodeConfig};

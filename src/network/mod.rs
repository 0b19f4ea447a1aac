//! P2P networking layer for the Truman mesh.
//!
//! Implements peer-to-peer communication for:
//! - Admission and membership tracking
//! - Peer discovery on the local network
//! - Epidemic broadcast of tagged messages
//! - Latency probing
//! - Event delivery to the host application

pub mod admission;
pub mod discovery;
pub mod events;
pub mod gossip;
pub mod memory;
pub mod message;
pub mod peer;
pub mod prober;
pub mod transport;

pub use admission::AdmissionController;
pub use discovery::{
    Discovery, DiscoveryConfig, DiscoveryEvent, MdnsDiscovery, MemoryDiscovery, MemorySegment,
};
pub use events::{Event, EventBus, EventKind};
pub use gossip::{GossipConfig, GossipProtocol};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use message::{MessageType, NetworkMessage};
pub use peer::{ConnectionState, MembershipConfig, PeerManager, PeerRecord};
pub use prober::{LatencyProber, ProbeConfig, PING_FAILED};
pub use transport::{TcpTransport, Transport, TransportConfig, TransportError};

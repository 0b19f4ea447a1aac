//! Synchronous host-facing contract.
//!
//! [`Backend`] owns its own tokio runtime and at most one [`NetworkNode`].
//! Every operation reports failure as `false`, `-1` or an empty value and
//! logs the cause; none of them panics or blocks past its own timeout.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{error, info, warn};

use crate::crypto::NodeIdentity;
use crate::network::discovery::{Discovery, MdnsDiscovery};
use crate::network::prober::PING_FAILED;
use crate::network::transport::{TcpTransport, Transport};
use crate::types::{PeerId, Tag};

use super::config::NodeConfig;
use super::node::{NetworkNode, NodeError};
use super::strings::{decode_list, empty_list, encode_list};

pub struct Backend {
    config: NodeConfig,
    runtime: Runtime,
    /// Transport used instead of TCP
    transport: Option<Arc<dyn Transport>>,
    discovery: Option<Arc<dyn Discovery>>,
    node: RwLock<Option<Arc<NetworkNode>>>,
}

impl Backend {
    /// Backend that will listen on TCP per `config.network`, and find
    /// nearby peers over mDNS unless `config.discovery.mdns` is off.
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let discovery: Option<Arc<dyn Discovery>> = if config.discovery.mdns {
            Some(Arc::new(MdnsDiscovery::new(&config.discovery)))
        } else {
            None
        };
        Self::build(config, None, discovery)
    }

    /// Backend over a caller-provided transport, without discovery.
    pub fn with_transport(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, NodeError> {
        Self::build(config, Some(transport), None)
    }

    /// Replace the discovery source. Takes effect at [`Backend::init`].
    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    fn build(
        config: NodeConfig,
        transport: Option<Arc<dyn Transport>>,
        discovery: Option<Arc<dyn Discovery>>,
    ) -> Result<Self, NodeError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("truman-net")
            .build()
            .map_err(NodeError::Runtime)?;

        Ok(Self {
            config,
            runtime,
            transport,
            discovery,
            node: RwLock::new(None),
        })
    }

    /// The running node, if initialized.
    pub fn node(&self) -> Option<Arc<NetworkNode>> {
        self.node.read().clone()
    }

    fn require_node(&self) -> Result<Arc<NetworkNode>, NodeError> {
        self.node().ok_or(NodeError::NotInitialized)
    }

    /// Create the identity, install the whitelist and start the node.
    ///
    /// Succeeds once; later calls return false and change nothing.
    pub fn init(&self, whitelist: Vec<String>) -> bool {
        let mut slot = self.node.write();
        if slot.is_some() {
            warn!("init called twice");
            return false;
        }

        match self.start_node(whitelist) {
            Ok(node) => {
                info!("Initialized as {}", node.local_peer_id());
                *slot = Some(node);
                true
            }
            Err(e) => {
                error!("init failed: {}", e);
                false
            }
        }
    }

    fn start_node(&self, whitelist: Vec<String>) -> Result<Arc<NetworkNode>, NodeError> {
        let identity = match &self.config.identity.key_path {
            Some(path) => NodeIdentity::load_or_generate(path)?,
            None => NodeIdentity::generate()?,
        };

        let transport: Arc<dyn Transport> = match &self.transport {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(TcpTransport::new(self.config.network.transport_config())),
        };

        let config = self.config.clone();
        let node = match &self.discovery {
            Some(discovery) => NetworkNode::with_discovery(
                config,
                identity,
                whitelist,
                transport,
                Arc::clone(discovery),
            ),
            None => NetworkNode::new(config, identity, whitelist, transport),
        };
        self.runtime.block_on(node.start())?;
        Ok(node)
    }

    /// [`Backend::init`] with the whitelist as a length-prefixed frame.
    pub fn init_encoded(&self, whitelist: &[u8]) -> bool {
        match decode_list(whitelist) {
            Ok(whitelist) => self.init(whitelist),
            Err(e) => {
                error!("init: malformed whitelist frame: {}", e);
                false
            }
        }
    }

    pub fn start_gossip_loop(&self) {
        match self.require_node() {
            Ok(node) => {
                let _guard = self.runtime.enter();
                node.start_gossip_loop();
            }
            Err(e) => warn!("start_gossip_loop: {}", e),
        }
    }

    /// Drain buffered events as JSON strings.
    pub fn collect_events(&self) -> Vec<String> {
        self.node()
            .map(|node| node.collect_events())
            .unwrap_or_default()
    }

    pub fn collect_events_encoded(&self) -> Vec<u8> {
        encode_or_empty(&self.collect_events())
    }

    /// Round-trip time to a peer in milliseconds, or -1.
    pub fn ping(&self, peer_id: &str) -> i64 {
        let Ok(node) = self.require_node() else {
            return PING_FAILED;
        };
        let Ok(peer) = peer_id.parse::<PeerId>() else {
            warn!("ping: malformed peer id {:?}", peer_id);
            return PING_FAILED;
        };
        self.runtime.block_on(node.ping(&peer))
    }

    /// Connected peer ids.
    pub fn get_peers(&self) -> Vec<String> {
        self.node().map(|node| node.get_peers()).unwrap_or_default()
    }

    pub fn get_peers_encoded(&self) -> Vec<u8> {
        encode_or_empty(&self.get_peers())
    }

    /// Broadcast a message with tag `general`, `important` or `emergency`.
    pub fn broadcast_message(&self, payload: &str, tag: &str) -> bool {
        let Ok(node) = self.require_node() else {
            return false;
        };
        let tag: Tag = match tag.parse() {
            Ok(tag) => tag,
            Err(e) => {
                warn!("broadcast_message: {}", e);
                return false;
            }
        };
        let _guard = self.runtime.enter();
        node.broadcast_message(payload, tag)
    }

    /// Promote a peer to Wolf. The local node must be a Wolf.
    pub fn new_wolf(&self, peer_id: &str) -> bool {
        let Ok(node) = self.require_node() else {
            return false;
        };
        let Ok(peer) = peer_id.parse::<PeerId>() else {
            warn!("new_wolf: malformed peer id {:?}", peer_id);
            return false;
        };
        let _guard = self.runtime.enter();
        node.new_wolf(&peer)
    }

    /// Local peer id, empty before init.
    pub fn get_local_peer_id(&self) -> String {
        self.node()
            .map(|node| node.local_peer_id())
            .unwrap_or_default()
    }

    /// Stop the node and drop its state. Safe to call repeatedly.
    pub fn cleanup(&self) {
        if let Some(node) = self.node() {
            self.runtime.block_on(node.cleanup());
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn encode_or_empty(items: &[String]) -> Vec<u8> {
    encode_list(items).unwrap_or_else(|e| {
        error!("Cannot encode string list: {}", e);
        empty_list()
    })
}

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use truman_core::crypto::NodeIdentity;
use truman_core::network::{Discovery, Event, EventKind, MemoryNetwork, MemoryTransport};
use truman_core::node::{NetworkNode, NodeConfig};
use truman_core::types::PeerId;

pub struct TestNode {
    pub node: Arc<NetworkNode>,
    pub transport: Arc<MemoryTransport>,
    pub addr: String,
    /// Events drained so far
    pub seen: parking_lot::Mutex<Vec<Event>>,
}

impl TestNode {
    pub async fn start(
        net: &Arc<MemoryNetwork>,
        addr: &str,
        config: NodeConfig,
        whitelist: Vec<String>,
    ) -> Self {
        Self::start_with(net, NodeIdentity::generate().unwrap(), addr, config, whitelist).await
    }

    pub async fn start_with(
        net: &Arc<MemoryNetwork>,
        identity: NodeIdentity,
        addr: &str,
        config: NodeConfig,
        whitelist: Vec<String>,
    ) -> Self {
        Self::launch(net, identity, addr, config, whitelist, None).await
    }

    /// Start a node that also finds peers through `discovery`.
    pub async fn start_discovering(
        net: &Arc<MemoryNetwork>,
        identity: NodeIdentity,
        addr: &str,
        config: NodeConfig,
        whitelist: Vec<String>,
        discovery: Arc<dyn Discovery>,
    ) -> Self {
        Self::launch(net, identity, addr, config, whitelist, Some(discovery)).await
    }

    async fn launch(
        net: &Arc<MemoryNetwork>,
        identity: NodeIdentity,
        addr: &str,
        config: NodeConfig,
        whitelist: Vec<String>,
        discovery: Option<Arc<dyn Discovery>>,
    ) -> Self {
        let transport = Arc::new(net.endpoint(addr));
        let node = match discovery {
            Some(discovery) => NetworkNode::with_discovery(
                config,
                identity,
                whitelist,
                transport.clone(),
                discovery,
            ),
            None => NetworkNode::new(config, identity, whitelist, transport.clone()),
        };
        node.start().await.unwrap();

        Self {
            node,
            transport,
            addr: addr.to_string(),
            seen: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> PeerId {
        self.node.local_id()
    }

    pub fn is_connected_to(&self, other: &TestNode) -> bool {
        self.node.get_peers().contains(&other.id().to_string())
    }

    /// Drain new events into `seen` and return everything drained so far.
    pub fn events(&self) -> Vec<Event> {
        let mut seen = self.seen.lock();
        seen.extend(self.node.drain_events());
        seen.clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }

    pub fn count_for(&self, kind: EventKind, peer: &PeerId) -> usize {
        self.events()
            .iter()
            .filter(|e| e.kind == kind && e.peer == *peer)
            .count()
    }

    pub async fn stop(&self) {
        self.node.cleanup().await;
    }
}

/// Config with a fast gossip loop for tests.
pub fn fast_config(bootstrap: &[&str]) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.gossip.tick_interval_ms = 20;
    config.gossip.rng_seed = Some(7);
    config.probe.timeout_ms = 1000;
    config.network.bootstrap_peers = bootstrap.iter().map(|s| s.to_string()).collect();
    config
}

/// Poll `check` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

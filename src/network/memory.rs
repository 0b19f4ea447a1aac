//! In-process transport for simulations and tests.
//!
//! Endpoints share a [`MemoryNetwork`] that routes envelopes by address. Links
//! can be given a one-way latency, endpoints can be cut off, and every frame
//! can be delivered twice to exercise deduplication.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

use super::message::NetworkMessage;
use super::transport::{Transport, TransportError};

const ENDPOINT_QUEUE: usize = 10_000;

/// Shared routing fabric for [`MemoryTransport`] endpoints.
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: RwLock<HashMap<String, mpsc::Sender<NetworkMessage>>>,
    /// One-way delay per unordered address pair
    latency: RwLock<HashMap<(String, String), Duration>>,
    default_latency: RwLock<Duration>,
    unreachable: RwLock<HashSet<String>>,
    duplicate: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an endpoint listening on `addr`.
    pub fn endpoint(self: &Arc<Self>, addr: &str) -> MemoryTransport {
        let (tx, rx) = mpsc::channel(ENDPOINT_QUEUE);
        self.endpoints.write().insert(addr.to_string(), tx);
        MemoryTransport {
            network: Arc::clone(self),
            addr: addr.to_string(),
            incoming_rx: Mutex::new(Some(rx)),
            links: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Set the one-way delay between two endpoints, in both directions.
    pub fn set_latency(&self, a: &str, b: &str, delay: Duration) {
        self.latency.write().insert(link(a, b), delay);
    }

    /// Delay for links without an explicit latency.
    pub fn set_default_latency(&self, delay: Duration) {
        *self.default_latency.write() = delay;
    }

    /// Cut an endpoint off. Traffic to and from it is silently lost.
    pub fn set_reachable(&self, addr: &str, reachable: bool) {
        let mut unreachable = self.unreachable.write();
        if reachable {
            unreachable.remove(addr);
        } else {
            unreachable.insert(addr.to_string());
        }
    }

    /// Deliver every frame twice.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.duplicate.store(enabled, Ordering::Relaxed);
    }

    /// Frames handed to a live endpoint.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Frames lost to unreachable endpoints.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn latency_between(&self, a: &str, b: &str) -> Duration {
        self.latency
            .read()
            .get(&link(a, b))
            .copied()
            .unwrap_or(*self.default_latency.read())
    }

    async fn route(&self, from: &str, to: &str, message: NetworkMessage) -> Result<(), TransportError> {
        let target = self
            .endpoints
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(to.to_string()))?;

        {
            let unreachable = self.unreachable.read();
            if unreachable.contains(from) || unreachable.contains(to) {
                trace!("Dropping {} from {} to {}", message.kind(), from, to);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        let copies = if self.duplicate.load(Ordering::Relaxed) { 2 } else { 1 };
        let delay = self.latency_between(from, to);
        self.delivered.fetch_add(copies, Ordering::Relaxed);

        for _ in 0..copies {
            let message = message.clone();
            if delay.is_zero() {
                target
                    .send(message)
                    .await
                    .map_err(|_| TransportError::Unreachable(to.to_string()))?;
            } else {
                let target = target.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = target.send(message).await;
                });
            }
        }
        Ok(())
    }

    fn unregister(&self, addr: &str) {
        self.endpoints.write().remove(addr);
    }
}

fn link(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// One endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    addr: String,
    incoming_rx: Mutex<Option<mpsc::Receiver<NetworkMessage>>>,
    /// Addresses sent to since their last disconnect, standing in for sockets
    links: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Number of simulated outbound connections.
    pub fn connection_count(&self) -> usize {
        self.links.lock().len()
    }

    pub fn is_linked(&self, addr: &str) -> bool {
        self.links.lock().contains(addr)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self) -> Result<String, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(self.addr.clone())
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    async fn send(&self, addr: &str, message: NetworkMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.network.route(&self.addr, addr, message).await?;
        self.links.lock().insert(addr.to_string());
        Ok(())
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<NetworkMessage>> {
        self.incoming_rx.lock().take()
    }

    fn disconnect(&self, addr: &str) -> bool {
        self.links.lock().remove(addr)
    }

    async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.links.lock().clear();
            self.network.unregister(&self.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::MessageType;
    use crate::types::PeerId;

    fn ping(nonce: u64) -> NetworkMessage {
        NetworkMessage::new(PeerId::default(), MessageType::Ping(nonce))
    }

    #[tokio::test]
    async fn test_direct_delivery() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let b = net.endpoint("b");
        let mut inbound = b.take_receiver().unwrap();

        a.send("b", ping(1)).await.unwrap();

        let msg = inbound.recv().await.unwrap();
        assert!(matches!(msg.payload, MessageType::Ping(1)));
        assert_eq!(net.delivered(), 1);
    }

    #[tokio::test]
    async fn test_unknown_address() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");

        assert!(matches!(
            a.send("nowhere", ping(1)).await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_latency() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let b = net.endpoint("b");
        net.set_latency("b", "a", Duration::from_millis(100));
        let mut inbound = b.take_receiver().unwrap();

        let started = tokio::time::Instant::now();
        a.send("b", ping(1)).await.unwrap();
        inbound.recv().await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_unreachable_is_silent() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let b = net.endpoint("b");
        net.set_reachable("b", false);
        let mut inbound = b.take_receiver().unwrap();

        a.send("b", ping(1)).await.unwrap();
        assert!(inbound.try_recv().is_err());
        assert_eq!(net.dropped(), 1);

        net.set_reachable("b", true);
        a.send("b", ping(2)).await.unwrap();
        assert!(inbound.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_delivery() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let b = net.endpoint("b");
        net.set_duplicate_delivery(true);
        let mut inbound = b.take_receiver().unwrap();

        a.send("b", ping(5)).await.unwrap();

        assert!(inbound.recv().await.is_some());
        assert!(inbound.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_links_track_sends() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let _b = net.endpoint("b");

        assert!(!a.disconnect("b"));
        a.send("b", ping(1)).await.unwrap();
        assert!(a.is_linked("b"));
        assert_eq!(a.connection_count(), 1);

        assert!(a.disconnect("b"));
        assert_eq!(a.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_unregisters() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let b = net.endpoint("b");
        b.shutdown().await;

        assert!(a.send("b", ping(1)).await.is_err());
        assert!(matches!(b.send("a", ping(1)).await, Err(TransportError::Closed)));
    }
}

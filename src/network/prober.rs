//! On-demand round-trip measurement.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::debug;

use super::message::{MessageType, NetworkMessage};
use super::peer::PeerManager;
use super::transport::Transport;
use crate::types::PeerId;

/// Sentinel returned by a failed probe.
pub const PING_FAILED: i64 = -1;

/// Probe configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// How long to wait for a pong
    pub timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self { timeout_ms: 2000 }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Probe in flight.
struct PendingProbe {
    peer: PeerId,
    done: oneshot::Sender<()>,
}

/// Measures latency to connected peers.
///
/// Each probe owns its own slot in the pending map, so any number of pings
/// can run at once. The only shared record they touch is the peer's `rtt`.
pub struct LatencyProber {
    config: ProbeConfig,
    local_id: PeerId,
    peers: Arc<PeerManager>,
    transport: Arc<dyn Transport>,
    pending: DashMap<u64, PendingProbe>,
    next_nonce: AtomicU64,
    /// Wakes probes stuck anywhere in the exchange
    cancel: Notify,
    closed: AtomicBool,
}

impl LatencyProber {
    pub fn new(
        local_id: PeerId,
        peers: Arc<PeerManager>,
        transport: Arc<dyn Transport>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            config,
            local_id,
            peers,
            transport,
            pending: DashMap::new(),
            next_nonce: AtomicU64::new(rand::random()),
            cancel: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Ping a peer. Milliseconds on success, [`PING_FAILED`] otherwise.
    pub async fn ping(&self, peer: &PeerId) -> i64 {
        match self.probe(peer).await {
            Some(rtt) => rtt.as_millis() as i64,
            None => PING_FAILED,
        }
    }

    /// Ping every connected peer concurrently.
    pub async fn ping_all(&self) -> Vec<(PeerId, i64)> {
        let targets = self.peers.connected_ids();
        let probes = targets.iter().map(|peer| self.ping(peer));
        let results = futures::future::join_all(probes).await;
        targets.into_iter().zip(results).collect()
    }

    async fn probe(&self, peer: &PeerId) -> Option<Duration> {
        if !self.peers.is_connected(peer) {
            return None;
        }
        let addr = self.peers.addr_of(peer)?;

        let cancelled = self.cancel.notified();
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(nonce, PendingProbe { peer: *peer, done: tx });

        let started = Instant::now();
        let exchange = async {
            let ping = NetworkMessage::new(self.local_id, MessageType::Ping(nonce));
            if let Err(e) = self.transport.send(&addr, ping).await {
                debug!("Ping to {} failed to send: {}", peer.short(), e);
                return false;
            }
            rx.await.is_ok()
        };

        // One deadline covers connecting, queueing and the reply.
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(self.config.timeout(), exchange) => outcome,
            _ = cancelled => Ok(false),
        };
        self.pending.remove(&nonce);

        match outcome {
            Ok(true) => {
                let rtt = started.elapsed();
                self.peers.update_rtt(peer, rtt);
                Some(rtt)
            }
            Ok(false) => None,
            Err(_) => {
                debug!("Ping to {} timed out", peer.short());
                None
            }
        }
    }

    /// Complete the probe matching a pong. Returns false for stray pongs.
    pub fn handle_pong(&self, from: &PeerId, nonce: u64) -> bool {
        let Some((_, probe)) = self.pending.remove_if(&nonce, |_, p| p.peer == *from) else {
            return false;
        };
        probe.done.send(()).is_ok()
    }

    /// Number of probes in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Abort every probe in flight and refuse new ones. They report failure.
    pub fn cancel_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.clear();
        self.cancel.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryNetwork;
    use crate::network::peer::MembershipConfig;
    use crate::network::transport::TransportError;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// Accepts sends that never complete, like a full outbound queue.
    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn start(&self) -> Result<String, TransportError> {
            Ok("stalled".to_string())
        }

        fn local_addr(&self) -> String {
            "stalled".to_string()
        }

        async fn send(&self, _addr: &str, _message: NetworkMessage) -> Result<(), TransportError> {
            std::future::pending().await
        }

        fn take_receiver(&self) -> Option<mpsc::Receiver<NetworkMessage>> {
            None
        }

        fn disconnect(&self, _addr: &str) -> bool {
            false
        }

        async fn shutdown(&self) {}
    }

    fn stalled_prober(timeout_ms: u64) -> (Arc<PeerManager>, Arc<LatencyProber>) {
        let peers = Arc::new(PeerManager::new(
            make_peer_id(0),
            100,
            MembershipConfig::default(),
        ));
        peers.mark_connected(make_peer_id(1), "mem://remote");
        let prober = Arc::new(LatencyProber::new(
            make_peer_id(0),
            Arc::clone(&peers),
            Arc::new(StalledTransport),
            ProbeConfig { timeout_ms },
        ));
        (peers, prober)
    }

    fn make_peer_id(id: u8) -> PeerId {
        let mut arr = [0u8; 32];
        arr[0] = id;
        PeerId(arr)
    }

    fn prober(timeout_ms: u64) -> (Arc<MemoryNetwork>, Arc<PeerManager>, LatencyProber) {
        let net = MemoryNetwork::new();
        let transport = net.endpoint("mem://local");
        let peers = Arc::new(PeerManager::new(
            make_peer_id(0),
            100,
            MembershipConfig::default(),
        ));
        let prober = LatencyProber::new(
            make_peer_id(0),
            Arc::clone(&peers),
            Arc::new(transport),
            ProbeConfig { timeout_ms },
        );
        (net, peers, prober)
    }

    #[tokio::test]
    async fn test_unknown_peer_fails_fast() {
        let (_net, _peers, prober) = prober(5_000);
        let started = Instant::now();

        assert_eq!(prober.ping(&make_peer_id(1)).await, PING_FAILED);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (net, peers, prober) = prober(500);
        let _remote = net.endpoint("mem://remote");
        peers.mark_connected(make_peer_id(1), "mem://remote");

        let started = Instant::now();
        assert_eq!(prober.ping(&make_peer_id(1)).await, PING_FAILED);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(prober.in_flight(), 0);
    }

    #[test]
    fn test_stray_pong_is_ignored() {
        let (_net, _peers, prober) = prober(500);
        assert!(!prober.handle_pong(&make_peer_id(1), 42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_send_is_bounded_by_timeout() {
        let (_peers, prober) = stalled_prober(500);

        let started = Instant::now();
        let rtt = tokio::time::timeout(Duration::from_secs(60), prober.ping(&make_peer_id(1)))
            .await
            .expect("ping outlived its own timeout");

        assert_eq!(rtt, PING_FAILED);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(prober.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_stalled_ping() {
        let (_peers, prober) = stalled_prober(5_000);

        let started = Instant::now();
        let ping = tokio::spawn({
            let prober = Arc::clone(&prober);
            async move { prober.ping(&make_peer_id(1)).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(prober.in_flight(), 1);

        prober.cancel_all();
        assert_eq!(ping.await.unwrap(), PING_FAILED);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(prober.in_flight(), 0);

        // Closed for good
        assert_eq!(prober.ping(&make_peer_id(1)).await, PING_FAILED);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}

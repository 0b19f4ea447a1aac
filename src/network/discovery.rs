//! Zero-configuration peer discovery on the local network.
//!
//! A [`Discovery`] source announces the local node and reports peers that
//! appear ([`DiscoveryEvent::Discovered`]) or go away
//! ([`DiscoveryEvent::Expired`]). [`MdnsDiscovery`] does this over mDNS;
//! [`MemorySegment`] simulates a shared LAN for tests.

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::types::PeerId;

/// TXT property carrying the full peer id.
const PROP_PEER_ID: &str = "peer_id";

/// Capacity of the discovery event queue.
const DISCOVERY_QUEUE: usize = 256;

/// How often the mDNS browser checks for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mDNS: {0}")]
    Mdns(#[from] mdns_sd::Error),

    #[error("cannot announce {0:?}: not a socket address")]
    NoPort(String),

    #[error("failed to spawn browser: {0}")]
    Io(#[from] io::Error),

    #[error("discovery already started")]
    AlreadyStarted,
}

/// Something seen on the local network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A peer announced itself at `addr`
    Discovered { peer: PeerId, addr: String },
    /// A peer's announcement went away
    Expired { peer: PeerId },
}

/// A source of nearby peers.
pub trait Discovery: Send + Sync {
    /// Announce `local` at `listen_addr` and start reporting peers.
    fn start(
        &self,
        local: PeerId,
        listen_addr: &str,
    ) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError>;

    /// Withdraw the announcement and stop reporting.
    fn shutdown(&self);
}

/// Discovery configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Announce and browse over mDNS
    pub mdns: bool,

    /// mDNS service type
    pub service_type: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mdns: true,
            service_type: "_truman._tcp.local.".to_string(),
        }
    }
}

/// mDNS announcer and browser.
pub struct MdnsDiscovery {
    service_type: String,
    daemon: Mutex<Option<ServiceDaemon>>,
    /// Full service name we registered
    registered: Mutex<Option<String>>,
    closed: Arc<AtomicBool>,
}

impl MdnsDiscovery {
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            service_type: config.service_type.clone(),
            daemon: Mutex::new(None),
            registered: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register our service. Returns its full name.
    fn announce(
        &self,
        daemon: &ServiceDaemon,
        local: &PeerId,
        port: u16,
    ) -> Result<String, DiscoveryError> {
        let instance = format!("truman-{}", local.short());
        let host = format!("{}.local.", instance);
        let properties = [(PROP_PEER_ID.to_string(), local.to_string())];
        let service = ServiceInfo::new(
            &self.service_type,
            &instance,
            &host,
            "",
            port,
            &properties[..],
        )?
        .enable_addr_auto();
        let fullname = service.get_fullname().to_string();

        daemon.register(service)?;
        Ok(fullname)
    }

    /// Translate one browse result. Removals of names we never resolved
    /// are ignored.
    fn translate(
        event: ServiceEvent,
        local: &PeerId,
        names: &mut HashMap<String, PeerId>,
    ) -> Option<DiscoveryEvent> {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let peer = info
                    .get_properties()
                    .get(PROP_PEER_ID)
                    .and_then(|p| p.val_str().parse::<PeerId>().ok())?;
                if peer == *local {
                    return None;
                }

                let mut ips: Vec<IpAddr> = info
                    .get_addresses()
                    .iter()
                    .map(|ip| IpAddr::from(*ip))
                    .collect();
                ips.sort_by_key(|ip| !ip.is_ipv4());
                let ip = ips.first()?;

                let addr = SocketAddr::new(*ip, info.get_port()).to_string();
                debug!("mDNS: resolved {} at {}", peer.short(), addr);
                names.insert(info.get_fullname().to_string(), peer);
                Some(DiscoveryEvent::Discovered { peer, addr })
            }
            ServiceEvent::ServiceRemoved(_, fullname) => names
                .remove(&fullname)
                .map(|peer| DiscoveryEvent::Expired { peer }),
            _ => None,
        }
    }
}

impl Discovery for MdnsDiscovery {
    fn start(
        &self,
        local: PeerId,
        listen_addr: &str,
    ) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
        let port = listen_addr
            .parse::<SocketAddr>()
            .map_err(|_| DiscoveryError::NoPort(listen_addr.to_string()))?
            .port();

        let mut slot = self.daemon.lock();
        if slot.is_some() {
            return Err(DiscoveryError::AlreadyStarted);
        }

        let daemon = ServiceDaemon::new()?;
        let announced = self.announce(&daemon, &local, port).and_then(|fullname| {
            let browser = daemon.browse(&self.service_type)?;
            Ok((fullname, browser))
        });
        let (fullname, browser) = match announced {
            Ok(announced) => announced,
            Err(e) => {
                let _ = daemon.shutdown();
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(DISCOVERY_QUEUE);
        let closed = Arc::clone(&self.closed);
        std::thread::Builder::new()
            .name("truman-mdns".to_string())
            .spawn(move || {
                let mut names = HashMap::new();
                while !closed.load(Ordering::SeqCst) {
                    let event = match browser.recv_timeout(POLL_INTERVAL) {
                        Ok(event) => event,
                        Err(_) if browser.is_disconnected() => break,
                        Err(_) => continue,
                    };
                    let Some(found) = Self::translate(event, &local, &mut names) else {
                        continue;
                    };
                    if tx.blocking_send(found).is_err() {
                        break;
                    }
                }
                debug!("mDNS browser stopped");
            })?;

        info!("mDNS: announcing {} on port {}", local.short(), port);
        *self.registered.lock() = Some(fullname);
        *slot = Some(daemon);
        Ok(rx)
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let Some(daemon) = self.daemon.lock().take() else {
            return;
        };
        if let Some(fullname) = self.registered.lock().take() {
            if let Err(e) = daemon.unregister(&fullname) {
                warn!("mDNS: failed to unregister: {}", e);
            }
        }
        if let Err(e) = daemon.shutdown() {
            warn!("mDNS: failed to stop daemon: {}", e);
        }
    }
}

/// Simulated LAN segment: every member discovers every other member.
#[derive(Default)]
pub struct MemorySegment {
    members: Mutex<HashMap<PeerId, Member>>,
}

struct Member {
    addr: String,
    events: mpsc::Sender<DiscoveryEvent>,
}

impl MemorySegment {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A discovery source attached to this segment.
    pub fn discovery(self: &Arc<Self>) -> MemoryDiscovery {
        MemoryDiscovery {
            segment: Arc::clone(self),
            joined: Mutex::new(None),
        }
    }

    /// Number of announced members.
    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn join(&self, peer: PeerId, addr: &str) -> mpsc::Receiver<DiscoveryEvent> {
        let (tx, rx) = mpsc::channel(DISCOVERY_QUEUE);
        let mut members = self.members.lock();

        for (id, member) in members.iter() {
            let _ = member.events.try_send(DiscoveryEvent::Discovered {
                peer,
                addr: addr.to_string(),
            });
            let _ = tx.try_send(DiscoveryEvent::Discovered {
                peer: *id,
                addr: member.addr.clone(),
            });
        }
        members.insert(
            peer,
            Member {
                addr: addr.to_string(),
                events: tx,
            },
        );
        rx
    }

    fn leave(&self, peer: &PeerId) {
        let mut members = self.members.lock();
        if members.remove(peer).is_none() {
            return;
        }
        for member in members.values() {
            let _ = member
                .events
                .try_send(DiscoveryEvent::Expired { peer: *peer });
        }
    }
}

/// One node's view of a [`MemorySegment`].
pub struct MemoryDiscovery {
    segment: Arc<MemorySegment>,
    joined: Mutex<Option<PeerId>>,
}

impl Discovery for MemoryDiscovery {
    fn start(
        &self,
        local: PeerId,
        listen_addr: &str,
    ) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
        let mut joined = self.joined.lock();
        if joined.is_some() {
            return Err(DiscoveryError::AlreadyStarted);
        }
        *joined = Some(local);
        Ok(self.segment.join(local, listen_addr))
    }

    fn shutdown(&self) {
        if let Some(peer) = self.joined.lock().take() {
            self.segment.leave(&peer);
        }
    }
}

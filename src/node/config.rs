//! Node configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{warn, Level};

use crate::network::discovery::DiscoveryConfig;
use crate::network::gossip::GossipConfig;
use crate::network::peer::MembershipConfig;
use crate::network::prober::ProbeConfig;
use crate::network::transport::TransportConfig;
use crate::types::{PeerId, TrustTier};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Full node configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Key material and starting tier
    pub identity: IdentityConfig,

    /// Network configuration
    pub network: NetworkConfig,

    /// Local network discovery
    pub discovery: DiscoveryConfig,

    /// Dissemination
    pub gossip: GossipConfig,

    /// Membership timeouts
    pub membership: MembershipConfig,

    /// Latency probing
    pub probe: ProbeConfig,

    /// Event buffering
    pub events: EventsConfig,

    /// Trust anchors
    pub trust: TrustConfig,

    /// Log output
    pub logging: LoggingConfig,
}

/// Identity configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Hex secret key file, created when missing. A fresh key per run when unset.
    pub key_path: Option<PathBuf>,

    /// Tier the local node starts with
    pub tier: TrustTier,
}

/// Network configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on
    pub listen_addr: SocketAddr,

    /// Address announced to peers, defaults to the bound address
    pub advertise_addr: Option<String>,

    /// Bootstrap peer addresses
    pub bootstrap_peers: Vec<String>,

    /// Maximum known peers
    pub max_peers: usize,

    /// Maximum frame size (bytes)
    pub max_message_size: usize,

    /// Outbound connect timeout
    pub connect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 4001)),
            advertise_addr: None,
            bootstrap_peers: vec![],
            max_peers: 50,
            max_message_size: 1024 * 1024,
            connect_timeout_ms: 5000,
        }
    }
}

impl NetworkConfig {
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.clone(),
            max_message_size: self.max_message_size,
            connect_timeout_ms: self.connect_timeout_ms,
        }
    }
}

/// Event bus configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Buffered events before the oldest is dropped
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Trust anchors.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Peer ids known to be Wolf from the start
    pub wolves: Vec<String>,
}

impl TrustConfig {
    /// Parsed wolf ids. Malformed entries are skipped.
    pub fn wolf_ids(&self) -> Vec<PeerId> {
        self.wolves
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!("Ignoring trust anchor {:?}: {}", s, e);
                    None
                }
            })
            .collect()
    }
}

/// Log output configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Max level: trace, debug, info, warn or error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn max_level(&self) -> Level {
        self.level.trim().parse().unwrap_or(Level::INFO)
    }
}

impl NodeConfig {
    /// Load configuration from file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(serde_json::from_str(&content)?)
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;

        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

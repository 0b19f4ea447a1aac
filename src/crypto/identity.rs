//! Local node identity.
//!
//! Owns the node's key pair and the peer id derived from it. The secret key
//! may be persisted as a hex file so the id survives restarts.

use std::path::Path;

use tracing::{info, warn};

use super::bls::{BlsError, PublicKey, SecretKey, Signature};
use crate::types::PeerId;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("key material: {0}")]
    Key(#[from] BlsError),

    #[error("key file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("key file {0} does not contain hex")]
    Encoding(String),
}

/// Key material and derived id of the local node.
pub struct NodeIdentity {
    secret_key: SecretKey,
    public_key: PublicKey,
    peer_id: PeerId,
}

impl NodeIdentity {
    /// Generate a fresh identity.
    pub fn generate() -> Result<Self, IdentityError> {
        Ok(Self::from_secret_key(SecretKey::generate()?))
    }

    /// Build an identity from an existing secret key.
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = secret_key.public_key();
        let peer_id = PeerId::from_public_key(&public_key.to_bytes());
        Self {
            secret_key,
            public_key,
            peer_id,
        }
    }

    /// Load the key stored at `path`, or generate one and store it there.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        let io_err = |source| IdentityError::Io {
            path: path.display().to_string(),
            source,
        };

        if path.exists() {
            let key_hex = std::fs::read_to_string(path).map_err(io_err)?;
            let key_bytes = hex::decode(key_hex.trim())
                .map_err(|_| IdentityError::Encoding(path.display().to_string()))?;
            let identity = Self::from_secret_key(SecretKey::from_bytes(&key_bytes)?);
            info!("Loaded node key {} from {}", identity.peer_id.short(), path.display());
            return Ok(identity);
        }

        let identity = Self::generate()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        std::fs::write(path, hex::encode(identity.secret_key.to_bytes())).map_err(io_err)?;
        warn!(
            "Generated new node key {} and saved it to {}",
            identity.peer_id.short(),
            path.display()
        );
        Ok(identity)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Compressed public key bytes, as carried on the wire.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.to_bytes().to_vec()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.secret_key.sign(message)
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

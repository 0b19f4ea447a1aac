//! Core type definitions for the Truman mesh.
//!
//! Identity, trust and tagging types shared by every layer, with their
//! textual forms documented since they cross the host boundary as strings.

use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Unique peer identifier.
/// Computed as: sha256(compressed BLS public key)
/// Textual form: 64 lowercase hex characters.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Default, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Derive the peer id owned by a public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(sha256(public_key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First four bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}...)", self.short())
    }
}

impl FromStr for PeerId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|_| ParseError::PeerId(s.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ParseError::PeerId(s.to_string()))?;
        Ok(Self(bytes))
    }
}

/// Gossip message identifier, random 128 bits.
pub type MessageId = [u8; 16];

/// Generate a fresh random message id.
pub fn random_message_id() -> MessageId {
    use rand::RngCore;
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

// ============================================================================
// TRUST AND TAGGING
// ============================================================================

/// Trust tier of a peer. Transitions are Sheep -> Wolf only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    /// Standard peer, no promotion authority
    #[default]
    Sheep,
    /// Administrative peer, may promote others
    Wolf,
}

impl TrustTier {
    pub fn is_wolf(&self) -> bool {
        matches!(self, TrustTier::Wolf)
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustTier::Sheep => f.write_str("sheep"),
            TrustTier::Wolf => f.write_str("wolf"),
        }
    }
}

/// Message priority hint. Opaque to dissemination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    General,
    Important,
    Emergency,
}

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::General => "general",
            Tag::Important => "important",
            Tag::Emergency => "emergency",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tag {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "general" => Ok(Tag::General),
            "important" => Ok(Tag::Important),
            "emergency" => Ok(Tag::Emergency),
            _ => Err(ParseError::Tag(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid peer id: {0:?}")]
    PeerId(String),

    #[error("unknown message tag: {0:?}")]
    Tag(String),
}

// ============================================================================
// HELPERS
// ============================================================================

/// Compute SHA-256 hash.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Milliseconds since the unix epoch.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

//! Admission control by optional whitelist.

use parking_lot::RwLock;
use std::collections::HashSet;

use crate::types::PeerId;

/// Decides whether a remote peer may join.
///
/// An empty whitelist means open admission. Checks take the read lock, the
/// rare admin updates take the write lock, so every check sees one
/// consistent snapshot of the set.
#[derive(Debug, Default)]
pub struct AdmissionController {
    allowed: RwLock<HashSet<String>>,
}

impl AdmissionController {
    /// Create a controller with open admission.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a controller from whitelist entries.
    pub fn with_whitelist<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let controller = Self::new();
        controller.replace(entries);
        controller
    }

    /// Replace the whole whitelist.
    ///
    /// Every entry closes admission, blank ones included. Entries that are
    /// not peer ids simply match nobody.
    pub fn replace<I, S>(&self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries: HashSet<String> = entries
            .into_iter()
            .map(|e| normalize(e.as_ref()))
            .collect();
        *self.allowed.write() = entries;
    }

    /// Add a single peer to a closed whitelist. Open admission stays open.
    ///
    /// Returns whether the peer was newly added.
    pub fn allow(&self, peer: &PeerId) -> bool {
        let mut allowed = self.allowed.write();
        if allowed.is_empty() {
            return false;
        }
        allowed.insert(peer.to_string())
    }

    /// Whether `peer` may join.
    pub fn is_admitted(&self, peer: &PeerId) -> bool {
        let allowed = self.allowed.read();
        allowed.is_empty() || allowed.contains(&peer.to_string())
    }

    /// Whether admission is open to everyone.
    pub fn is_open(&self) -> bool {
        self.allowed.read().is_empty()
    }

    /// Number of whitelist entries.
    pub fn len(&self) -> usize {
        self.allowed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize(entry: &str) -> String {
    entry.trim().to_ascii_lowercase()
}

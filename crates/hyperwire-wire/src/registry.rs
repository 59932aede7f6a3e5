//! Peer directory: where known nodes listen and whether we are connected.
//!
//! The [`PeerDirectory`] is shared by the TCP transport's dialer, acceptor
//! and read loops. Peers from configuration carry a dialable address; peers
//! that only ever connected to us do not, and are reachable only while their
//! connection is up.

use chrono::{DateTime, Utc};
use hyperwire_types::config::PeerConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// A handshake completed and the connection is up.
    Connected,
    /// No live connection.
    Disconnected,
}

/// An entry representing a single known peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// The peer's node name.
    pub node: String,
    /// Listen address to dial, if known.
    pub address: Option<SocketAddr>,
    pub state: PeerState,
    /// When the current connection was established.
    pub connected_at: Option<DateTime<Utc>>,
    /// When the last frame from this peer arrived.
    pub last_seen: Option<DateTime<Utc>>,
}

impl PeerEntry {
    fn new(node: &str, address: Option<SocketAddr>) -> Self {
        Self {
            node: node.to_string(),
            address,
            state: PeerState::Disconnected,
            connected_at: None,
            last_seen: None,
        }
    }
}

/// Thread-safe directory of all known peers.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    peers: Arc<RwLock<HashMap<String, PeerEntry>>>,
}

impl PeerDirectory {
    /// Create a new empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory seeded with statically configured peers.
    pub fn from_config(peers: &[PeerConfig]) -> Self {
        let directory = Self::new();
        for peer in peers {
            directory.add_peer(&peer.node, peer.addr);
        }
        directory
    }

    /// Register or update the dialable address of a peer.
    pub fn add_peer(&self, node: &str, address: SocketAddr) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers
            .entry(node.to_string())
            .and_modify(|e| e.address = Some(address))
            .or_insert_with(|| PeerEntry::new(node, Some(address)));
    }

    /// Remove a peer entirely.
    pub fn remove_peer(&self, node: &str) -> Option<PeerEntry> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(node)
    }

    /// Mark a peer as connected, creating an address-less entry for peers
    /// that were not known before.
    pub fn mark_connected(&self, node: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let entry = peers
            .entry(node.to_string())
            .or_insert_with(|| PeerEntry::new(node, None));
        let now = Utc::now();
        entry.state = PeerState::Connected;
        entry.connected_at = Some(now);
        entry.last_seen = Some(now);
    }

    /// Mark a peer as disconnected (but keep its entry for a later dial).
    pub fn mark_disconnected(&self, node: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(node) {
            entry.state = PeerState::Disconnected;
            entry.connected_at = None;
        }
    }

    /// Record that a frame arrived from `node`.
    pub fn touch(&self, node: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(node) {
            entry.last_seen = Some(Utc::now());
        }
    }

    /// Get a snapshot of a specific peer.
    pub fn get_peer(&self, node: &str) -> Option<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(node).cloned()
    }

    /// Dialable address of a peer.
    pub fn address_of(&self, node: &str) -> Option<SocketAddr> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(node).and_then(|p| p.address)
    }

    /// Get all connected peers.
    pub fn connected_peers(&self) -> Vec<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .cloned()
            .collect()
    }

    /// Get all peers (connected + disconnected).
    pub fn all_peers(&self) -> Vec<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }

    /// Number of connected peers.
    pub fn connected_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .count()
    }

    /// Total number of peers (including disconnected).
    pub fn total_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }
}

//! Peer table for tracking mesh members and their liveness counters.
//!
//! `PeerTable` is the only mutable state shared between the discovery,
//! probe and reliable-send tasks. Every mutation is safe to interleave:
//! inserting a known address and removing an unknown one are both no-ops,
//! and iteration always works on a snapshot.

use crate::address::LinkAddress;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use web_time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A known member of the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    /// Link-layer address (unique key)
    pub address: LinkAddress,
    /// Consecutive send failures since the last success
    pub failure_count: u32,
    /// When this peer was added (ms since epoch)
    pub first_seen: u64,
    /// Last successful inbound or outbound exchange (ms since epoch)
    pub last_seen: u64,
}

impl Peer {
    fn new(address: LinkAddress, timestamp: u64) -> Self {
        Self {
            address,
            failure_count: 0,
            first_seen: timestamp,
            last_seen: timestamp,
        }
    }
}

/// Table of known peers, keyed by link address.
///
/// Thread-safe for use from several Tokio tasks. Wrap in `Arc` for shared
/// ownership. The lock is never held across an `.await`.
#[derive(Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<LinkAddress, Peer>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer with a zero failure count.
    ///
    /// Returns `false` (and leaves the entry untouched) if the address is
    /// already present.
    pub fn insert(&self, address: LinkAddress) -> bool {
        self.insert_at(address, now_ms())
    }

    /// Same as [`insert`](Self::insert) with an explicit timestamp.
    pub fn insert_at(&self, address: LinkAddress, timestamp: u64) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if peers.contains_key(&address) {
            return false;
        }
        peers.insert(address, Peer::new(address, timestamp));
        true
    }

    /// Specific peer info.
    pub fn lookup(&self, address: &LinkAddress) -> Option<Peer> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()
    }

    pub fn contains(&self, address: &LinkAddress) -> bool {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(address)
    }

    /// Remove a peer. Removing an unknown address is a no-op.
    pub fn remove(&self, address: &LinkAddress) -> Option<Peer> {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address)
    }

    /// Remove every peer, returning what was removed.
    pub fn clear(&self) -> Vec<Peer> {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, peer)| peer)
            .collect()
    }

    /// Point-in-time copy of all peers, ordered by address.
    ///
    /// Later mutations of the table do not affect the returned list.
    pub fn all(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        peers.sort_by_key(|p| p.address);
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Update last_seen. Unknown addresses are ignored.
    pub fn touch(&self, address: &LinkAddress) {
        self.touch_at(address, now_ms());
    }

    pub fn touch_at(&self, address: &LinkAddress, timestamp: u64) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(peer) = peers.get_mut(address) {
            peer.last_seen = timestamp;
        }
    }

    /// Record a delivered send: reset the failure count and refresh last_seen.
    ///
    /// Returns `false` if the peer is not in the table.
    pub fn record_success(&self, address: &LinkAddress) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.get_mut(address) {
            Some(peer) => {
                peer.failure_count = 0;
                peer.last_seen = now_ms();
                true
            }
            None => false,
        }
    }

    /// Record a failed send, returning the new consecutive failure count.
    ///
    /// Returns `None` if the peer is not in the table.
    pub fn record_failure(&self, address: &LinkAddress) -> Option<u32> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let peer = peers.get_mut(address)?;
        peer.failure_count = peer.failure_count.saturating_add(1);
        Some(peer.failure_count)
    }
}

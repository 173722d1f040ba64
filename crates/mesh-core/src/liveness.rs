//! Periodic heartbeat to every known peer.
//!
//! Eviction happens inside the reliable sender; this task only drives it.

use crate::address::LinkAddress;
use crate::config::MeshConfig;
use crate::peers::PeerTable;
use crate::reliable::{ReliableSender, SendOutcome};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of one probe cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub delivered: Vec<LinkAddress>,
    pub evicted: Vec<LinkAddress>,
    /// Peers that left the table before their turn came
    pub skipped: Vec<LinkAddress>,
}

impl ProbeReport {
    pub fn probed(&self) -> usize {
        self.delivered.len() + self.evicted.len() + self.skipped.len()
    }
}

/// Heartbeats every known peer once per probe interval.
pub struct LivenessProbe {
    sender: ReliableSender,
    peers: Arc<PeerTable>,
    interval: Duration,
    payload: Vec<u8>,
}

impl LivenessProbe {
    pub fn new(sender: ReliableSender, peers: Arc<PeerTable>, config: &MeshConfig) -> Self {
        Self {
            sender,
            peers,
            interval: config.probe_interval,
            payload: config.heartbeat_payload.clone(),
        }
    }

    /// Heartbeat each peer in a snapshot of the table, one at a time.
    pub async fn probe_once(&self) -> ProbeReport {
        let mut report = ProbeReport::default();

        for peer in self.peers.all() {
            match self.sender.send_reliable(&self.payload, peer.address).await {
                SendOutcome::Delivered => report.delivered.push(peer.address),
                SendOutcome::Evicted => report.evicted.push(peer.address),
                SendOutcome::UnknownPeer => report.skipped.push(peer.address),
            }
        }

        if !report.evicted.is_empty() {
            info!(
                "Probe cycle evicted {} peer(s), {} remain",
                report.evicted.len(),
                self.peers.len()
            );
        }
        report
    }

    /// Probe forever, sleeping one interval after each cycle.
    pub async fn run(self) {
        loop {
            let report = self.probe_once().await;
            debug!(
                "Probe cycle: {} delivered, {} evicted, {} skipped",
                report.delivered.len(),
                report.evicted.len(),
                report.skipped.len()
            );
            tokio::time::sleep(self.interval).await;
        }
    }
}

//! Discovery beacon.
//!
//! A node that has not joined a mesh broadcasts the discovery payload once
//! per beacon interval. The first peer registration flips `joined`, which
//! wakes the announcer mid-sleep and ends it for good.

use crate::address::BROADCAST;
use crate::config::MeshConfig;
use crate::membership::MeshState;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Broadcasts the discovery payload until the node joins a mesh.
pub struct BeaconAnnouncer {
    transport: Arc<dyn Transport>,
    state: MeshState,
    interval: Duration,
    payload: Vec<u8>,
}

impl BeaconAnnouncer {
    pub fn new(transport: Arc<dyn Transport>, state: MeshState, config: &MeshConfig) -> Self {
        Self {
            transport,
            state,
            interval: config.beacon_interval,
            payload: config.discovery_payload.clone(),
        }
    }

    /// Announce until the node joins a mesh.
    ///
    /// Returns the number of beacons broadcast. A failed broadcast counts as
    /// a beacon and does not stop the loop.
    pub async fn run(self) -> u64 {
        let mut sent = 0u64;

        while !self.state.is_joined() {
            if !self.transport.send(BROADCAST, &self.payload).await {
                warn!("Discovery broadcast failed");
            }
            sent += 1;
            debug!("Sent discovery beacon #{}", sent);

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.state.joined() => {}
            }
        }

        info!("Joined mesh, beacon stopped after {} announcements", sent);
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::LinkAddress;
    use crate::protocol::DISCOVERY_PAYLOAD;
    use crate::sim::{SimMedium, SimRadio, SimRadioConfig};

    fn addr(last: u8) -> LinkAddress {
        LinkAddress::new([0x02, 0, 0, 0, 0, last])
    }

    async fn active_radio(medium: &SimMedium) -> Arc<SimRadio> {
        let radio = Arc::new(medium.join(addr(1), SimRadioConfig::default()));
        radio.set_active(true).await.unwrap();
        radio.register_link(BROADCAST).await.unwrap();
        radio
    }

    #[tokio::test(start_paused = true)]
    async fn test_beacons_once_per_interval_until_joined() {
        let medium = SimMedium::new();
        let radio = active_radio(&medium).await;
        let state = MeshState::new();

        let beacon = BeaconAnnouncer::new(radio.clone(), state.clone(), &MeshConfig::default());
        let task = tokio::spawn(beacon.run());

        // t = 0, 1, 2, 3
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(radio.sends_to(&BROADCAST), 4);

        state.join();
        assert_eq!(task.await.unwrap(), 4);

        // Nothing more once joined
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(radio.sends_to(&BROADCAST), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcasts_discovery_payload() {
        let medium = SimMedium::new();
        let radio = active_radio(&medium).await;
        let state = MeshState::new();

        let task = tokio::spawn(
            BeaconAnnouncer::new(radio.clone(), state.clone(), &MeshConfig::default()).run(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        state.join();
        task.await.unwrap();

        let sent = radio.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, BROADCAST);
        assert_eq!(sent[0].1, DISCOVERY_PAYLOAD);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_joined_sends_nothing() {
        let medium = SimMedium::new();
        let radio = active_radio(&medium).await;
        let state = MeshState::new();
        state.join();

        let sent = BeaconAnnouncer::new(radio.clone(), state, &MeshConfig::default())
            .run()
            .await;

        assert_eq!(sent, 0);
        assert!(radio.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_broadcast_keeps_announcing() {
        let medium = SimMedium::new();
        // Never activated: every send fails
        let radio = Arc::new(medium.join(addr(1), SimRadioConfig::default()));
        let state = MeshState::new();

        let task = tokio::spawn(
            BeaconAnnouncer::new(radio.clone(), state.clone(), &MeshConfig::default()).run(),
        );
        tokio::time::sleep(Duration::from_millis(2500)).await;
        state.join();

        assert_eq!(task.await.unwrap(), 3);
        assert!(radio.sent().iter().all(|(_, _, accepted)| !accepted));
    }
}

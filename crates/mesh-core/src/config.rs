//! Timing and payload configuration for the mesh tasks.

use crate::protocol::{DISCOVERY_PAYLOAD, HEARTBEAT_PAYLOAD};
use std::time::Duration;

/// Configuration shared by the beacon, probe and reliable-send tasks.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Delay between discovery broadcasts while not joined (default: 1s)
    pub beacon_interval: Duration,
    /// Delay between liveness cycles (default: 5s)
    pub probe_interval: Duration,
    /// Delay between attempts of a reliable send (default: 1s)
    pub retry_backoff: Duration,
    /// Consecutive send failures that evict a peer (default: 5)
    pub eviction_threshold: u32,
    /// Payload broadcast by the beacon
    pub discovery_payload: Vec<u8>,
    /// Payload unicast by the liveness probe
    pub heartbeat_payload: Vec<u8>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            beacon_interval: Duration::from_secs(1),
            probe_interval: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(1),
            eviction_threshold: 5,
            discovery_payload: DISCOVERY_PAYLOAD.to_vec(),
            heartbeat_payload: HEARTBEAT_PAYLOAD.to_vec(),
        }
    }
}

impl MeshConfig {
    /// Scale every interval by the same time unit, keeping the 1:5:1 ratios.
    ///
    /// Useful for simulations and tests that want the protocol to run faster
    /// than wall-clock seconds.
    pub fn with_time_unit(unit: Duration) -> Self {
        Self {
            beacon_interval: unit,
            probe_interval: unit * 5,
            retry_backoff: unit,
            ..Self::default()
        }
    }

    /// Worst-case time a single reliable send can take before it evicts.
    pub fn max_send_duration(&self) -> Duration {
        self.retry_backoff * self.eviction_threshold.saturating_sub(1)
    }
}

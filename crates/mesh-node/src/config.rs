//! Node configuration file (JSON).
//!
//! Every field is optional; a missing file section or key falls back to the
//! protocol defaults.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use mesh_core::MeshConfig;
use mesh_core::protocol::{DISCOVERY_PAYLOAD, HEARTBEAT_PAYLOAD, MAX_PAYLOAD_LEN};
use mesh_core::sim::DEFAULT_MAX_LINKS;
use serde::{Deserialize, Serialize};

/// Default UDP port for mesh traffic.
pub const DEFAULT_PORT: u16 = 4210;

/// Main configuration for a mesh node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Protocol timings and payloads
    #[serde(default)]
    pub mesh: TimingConfig,

    /// UDP radio settings
    #[serde(default)]
    pub radio: RadioConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Delay between discovery beacons in ms (default: 1000)
    #[serde(default = "default_beacon_interval")]
    pub beacon_interval_ms: u64,

    /// Delay between heartbeat cycles in ms (default: 5000)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Delay between send retries in ms (default: 1000)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Consecutive failed sends before a peer is dropped (default: 5)
    #[serde(default = "default_eviction_threshold")]
    pub eviction_threshold: u32,

    #[serde(default = "default_discovery_payload")]
    pub discovery_payload: String,

    #[serde(default = "default_heartbeat_payload")]
    pub heartbeat_payload: String,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            beacon_interval_ms: default_beacon_interval(),
            probe_interval_ms: default_probe_interval(),
            retry_backoff_ms: default_retry_backoff(),
            eviction_threshold: default_eviction_threshold(),
            discovery_payload: default_discovery_payload(),
            heartbeat_payload: default_heartbeat_payload(),
        }
    }
}

fn default_beacon_interval() -> u64 {
    1000
}

fn default_probe_interval() -> u64 {
    5000
}

fn default_retry_backoff() -> u64 {
    1000
}

fn default_eviction_threshold() -> u32 {
    5
}

fn default_discovery_payload() -> String {
    String::from_utf8_lossy(DISCOVERY_PAYLOAD).into_owned()
}

fn default_heartbeat_payload() -> String {
    String::from_utf8_lossy(HEARTBEAT_PAYLOAD).into_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Local socket address (default: 0.0.0.0:4210)
    #[serde(default = "default_bind")]
    pub bind: SocketAddrV4,

    /// Where broadcast frames are sent (default: 255.255.255.255:4210)
    #[serde(default = "default_broadcast_targets")]
    pub broadcast_targets: Vec<SocketAddrV4>,

    /// Link table capacity, broadcast included (default: 20)
    #[serde(default = "default_max_links")]
    pub max_links: usize,

    /// How long a unicast send waits for the peer's acknowledgement in ms
    /// (default: 250)
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            broadcast_targets: default_broadcast_targets(),
            max_links: default_max_links(),
            ack_timeout_ms: default_ack_timeout(),
        }
    }
}

impl RadioConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

fn default_bind() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)
}

fn default_broadcast_targets() -> Vec<SocketAddrV4> {
    vec![SocketAddrV4::new(Ipv4Addr::BROADCAST, DEFAULT_PORT)]
}

fn default_max_links() -> usize {
    DEFAULT_MAX_LINKS
}

fn default_ack_timeout() -> u64 {
    250
}

impl NodeConfig {
    /// Load configuration from a JSON file. The file must exist.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: NodeConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.validate()?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load from `path` if given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Reject settings the protocol cannot work with.
    pub fn validate(&self) -> Result<()> {
        let mesh = &self.mesh;
        ensure!(mesh.beacon_interval_ms > 0, "beacon_interval_ms must be positive");
        ensure!(mesh.probe_interval_ms > 0, "probe_interval_ms must be positive");
        ensure!(mesh.eviction_threshold > 0, "eviction_threshold must be positive");
        ensure!(
            !mesh.discovery_payload.is_empty() && !mesh.heartbeat_payload.is_empty(),
            "discovery and heartbeat payloads must not be empty"
        );
        ensure!(
            mesh.discovery_payload != mesh.heartbeat_payload,
            "discovery and heartbeat payloads must differ"
        );
        ensure!(
            mesh.discovery_payload.len() <= MAX_PAYLOAD_LEN
                && mesh.heartbeat_payload.len() <= MAX_PAYLOAD_LEN,
            "payloads are limited to {} bytes",
            MAX_PAYLOAD_LEN
        );
        ensure!(
            self.radio.max_links > 0,
            "max_links must leave room for the broadcast link"
        );
        Ok(())
    }

    pub fn mesh_config(&self) -> MeshConfig {
        let mesh = &self.mesh;
        MeshConfig {
            beacon_interval: Duration::from_millis(mesh.beacon_interval_ms),
            probe_interval: Duration::from_millis(mesh.probe_interval_ms),
            retry_backoff: Duration::from_millis(mesh.retry_backoff_ms),
            eviction_threshold: mesh.eviction_threshold,
            discovery_payload: mesh.discovery_payload.as_bytes().to_vec(),
            heartbeat_payload: mesh.heartbeat_payload.as_bytes().to_vec(),
        }
    }
}

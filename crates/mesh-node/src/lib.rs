//! mesh-node library: exposes the node components for testing.
//!
//! This is a thin library layer over the binary, allowing integration
//! tests to run real nodes over UDP.

pub mod config;
pub mod udp;

pub use config::{NodeConfig, RadioConfig, TimingConfig};
pub use udp::UdpRadio;

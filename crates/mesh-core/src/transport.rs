//! Transport trait: the boundary to the radio link layer.
//!
//! Implementations:
//! - `sim::SimRadio`: in-memory radio medium (tests, simulations)
//! - `mesh_node::udp::UdpRadio`: UDP datagrams on a LAN

use crate::address::LinkAddress;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Activation failed: {0}")]
    ActivationFailed(String),

    #[error("Link table full ({capacity} links)")]
    LinkTableFull { capacity: usize },

    #[error("Link registration refused for {0}")]
    RegistrationRefused(LinkAddress),

    #[error("Unknown peer: {0}")]
    UnknownPeer(LinkAddress),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// One inbound radio frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Link address of the sending node
    pub from: LinkAddress,
    /// Raw payload bytes
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(from: LinkAddress, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            from,
            payload: payload.into(),
        }
    }
}

/// Send/receive/peer-registration primitives of a broadcast-capable radio.
///
/// A unicast `send` only succeeds for addresses previously admitted with
/// `register_link`, mirroring the fixed peer list of radio drivers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Our own link address
    fn local_address(&self) -> LinkAddress;

    /// Power the radio interface up or down
    async fn set_active(&self, active: bool) -> Result<()>;

    /// Admit a peer to the link-layer peer list.
    ///
    /// Registering an already-registered address succeeds without change.
    async fn register_link(&self, address: LinkAddress) -> Result<()>;

    /// Remove a peer from the link-layer peer list.
    ///
    /// Fails with `UnknownPeer` if the address is not registered.
    async fn unregister_link(&self, address: LinkAddress) -> Result<()>;

    /// Check whether the address is in the link-layer peer list
    fn is_registered(&self, address: &LinkAddress) -> bool;

    /// Best-effort send of one frame.
    ///
    /// Returns `true` if the link layer accepted/delivered the frame.
    async fn send(&self, address: LinkAddress, payload: &[u8]) -> bool;

    /// Wait for the next inbound frame. `Err(Closed)` ends the stream.
    async fn receive(&self) -> Result<Frame>;
}

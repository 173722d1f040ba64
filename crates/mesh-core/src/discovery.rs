//! Inbound frame handling and peer admission.
//!
//! Any frame from an address the link layer does not know yet admits that
//! address as a peer: register the link, insert into the peer table, mark
//! the node as joined. Frames from known addresses only refresh liveness.

use crate::address::LinkAddress;
use crate::config::MeshConfig;
use crate::events::{EventBus, MeshEvent};
use crate::membership::MeshState;
use crate::peers::PeerTable;
use crate::protocol::{self, FrameKind};
use crate::transport::{Frame, Result, Transport, TransportError};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// What the receiver did with one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Source was the broadcast address or this node
    Ignored,
    /// Source was already link-registered
    Known,
    /// Source was registered as a new peer
    Admitted,
    /// The link layer refused the source; the frame was dropped
    Refused,
}

/// Receives frames, admits unknown senders and forwards application data.
pub struct DiscoveryReceiver {
    transport: Arc<dyn Transport>,
    peers: Arc<PeerTable>,
    state: MeshState,
    events: Arc<EventBus>,
    local: LinkAddress,
    discovery_payload: Vec<u8>,
    heartbeat_payload: Vec<u8>,
    inbound: mpsc::UnboundedSender<Frame>,
}

impl DiscoveryReceiver {
    pub fn new(
        transport: Arc<dyn Transport>,
        peers: Arc<PeerTable>,
        state: MeshState,
        events: Arc<EventBus>,
        config: &MeshConfig,
        inbound: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        let local = transport.local_address();
        Self {
            transport,
            peers,
            state,
            events,
            local,
            discovery_payload: config.discovery_payload.clone(),
            heartbeat_payload: config.heartbeat_payload.clone(),
            inbound,
        }
    }

    /// Receive frames until the transport closes or `shutdown` turns true.
    ///
    /// A closed transport and a shutdown request both end the loop with
    /// `Ok(())`. Any other receive error is returned.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            let frame = tokio::select! {
                _ = stop_requested(&mut shutdown) => {
                    debug!("Discovery receiver shutting down");
                    return Ok(());
                }
                received = self.transport.receive() => received,
            };

            match frame {
                Ok(frame) => {
                    self.handle_frame(frame).await;
                }
                Err(TransportError::Closed) => {
                    info!("Transport closed, discovery receiver exiting");
                    return Ok(());
                }
                Err(e) => {
                    warn!("Receive failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Process one inbound frame.
    pub async fn handle_frame(&self, frame: Frame) -> Admission {
        let from = frame.from;
        if from.is_broadcast() || from == self.local {
            trace!("Dropping frame with source {}", from);
            return Admission::Ignored;
        }

        let kind = protocol::classify(
            &frame.payload,
            &self.discovery_payload,
            &self.heartbeat_payload,
        );
        debug!(
            "Received {:?} from {}: {}",
            kind,
            from,
            protocol::preview(&frame.payload)
        );

        let admission = if self.transport.is_registered(&from) {
            self.peers.touch(&from);
            Admission::Known
        } else {
            match self.transport.register_link(from).await {
                Ok(()) => self.admit(from),
                Err(e) => {
                    warn!("Failed to register peer {}: {}", from, e);
                    self.events.emit(MeshEvent::LinkRegistrationFailed {
                        address: from,
                        reason: e.to_string(),
                    });
                    return Admission::Refused;
                }
            }
        };

        if kind == FrameKind::Data && self.inbound.send(frame).is_err() {
            trace!("No application receiver for data from {}", from);
        }

        admission
    }

    fn admit(&self, address: LinkAddress) -> Admission {
        let admission = if self.peers.insert(address) {
            info!("Added peer {}", address);
            self.events.emit(MeshEvent::PeerDiscovered { address });
            Admission::Admitted
        } else {
            // Table entry outlived its link; keep it
            self.peers.touch(&address);
            Admission::Known
        };
        if self.state.join() {
            info!("Joined mesh via {}", address);
            self.events.emit(MeshEvent::Joined { via: address });
        }
        admission
    }
}

async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

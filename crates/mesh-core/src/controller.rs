//! Mesh lifecycle: wires the beacon, discovery, probe and reliable-send
//! tasks to one peer table and one transport.

use crate::address::{BROADCAST, LinkAddress};
use crate::beacon::BeaconAnnouncer;
use crate::config::MeshConfig;
use crate::discovery::DiscoveryReceiver;
use crate::events::EventBus;
use crate::liveness::LivenessProbe;
use crate::membership::MeshState;
use crate::peers::{Peer, PeerTable};
use crate::reliable::{ReliableSender, SendOutcome};
use crate::transport::{Frame, Transport, TransportError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Failed to activate transport: {0}")]
    Activation(TransportError),

    #[error("Failed to register broadcast link: {0}")]
    BroadcastRegistration(TransportError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// One mesh node.
///
/// Construct with its transport, then drive with `start()`. Data frames
/// from peers arrive on the receiver returned by `new()`.
pub struct MeshController {
    transport: Arc<dyn Transport>,
    config: MeshConfig,
    peers: Arc<PeerTable>,
    state: MeshState,
    events: Arc<EventBus>,
    sender: ReliableSender,
    inbound: mpsc::UnboundedSender<Frame>,
    shutdown: watch::Sender<bool>,
}

impl MeshController {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: MeshConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let peers = Arc::new(PeerTable::new());
        let events = Arc::new(EventBus::new());
        let sender = ReliableSender::new(transport.clone(), peers.clone(), events.clone(), &config);
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let controller = Self {
            transport,
            config,
            peers,
            state: MeshState::new(),
            events,
            sender,
            inbound,
            shutdown,
        };
        (controller, inbound_rx)
    }

    /// Run the node until `stop()` is called or the transport closes.
    ///
    /// Activates the transport and registers the broadcast link first;
    /// failure of either is returned immediately. Background tasks are
    /// aborted and the transport deactivated before returning.
    pub async fn start(&self) -> Result<(), MeshError> {
        let local = self.transport.local_address();

        self.transport
            .set_active(true)
            .await
            .map_err(MeshError::Activation)?;

        if let Err(e) = self.transport.register_link(BROADCAST).await {
            self.deactivate().await;
            return Err(MeshError::BroadcastRegistration(e));
        }

        info!("Mesh node {} started", local);

        let beacon = tokio::spawn(
            BeaconAnnouncer::new(self.transport.clone(), self.state.clone(), &self.config).run(),
        );
        let probe = tokio::spawn(
            LivenessProbe::new(self.sender.clone(), self.peers.clone(), &self.config).run(),
        );

        let receiver = DiscoveryReceiver::new(
            self.transport.clone(),
            self.peers.clone(),
            self.state.clone(),
            self.events.clone(),
            &self.config,
            self.inbound.clone(),
        );
        let result = receiver.run(self.shutdown.subscribe()).await;

        beacon.abort();
        probe.abort();
        self.deactivate().await;
        info!("Mesh node {} stopped", local);

        result.map_err(MeshError::from)
    }

    /// Ask a running `start()` to return. A stopped controller stays stopped.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    async fn deactivate(&self) {
        if let Err(e) = self.transport.set_active(false).await {
            warn!("Failed to deactivate transport: {}", e);
        }
    }

    /// Forget every peer and drop their links. Returns the removed peers.
    ///
    /// The joined flag is unaffected.
    pub async fn remove_all_peers(&self) -> Vec<Peer> {
        let removed = self.peers.clear();
        for peer in &removed {
            match self.transport.unregister_link(peer.address).await {
                Ok(()) | Err(TransportError::UnknownPeer(_)) => {}
                Err(e) => warn!("Failed to unregister link for {}: {}", peer.address, e),
            }
        }
        debug!("Removed {} peer(s)", removed.len());
        removed
    }

    /// Broadcast an application payload (one attempt, no retry).
    pub async fn broadcast(&self, payload: &[u8]) -> bool {
        self.transport.send(BROADCAST, payload).await
    }

    /// Send an application payload to one peer with retry and eviction.
    pub async fn send_reliable(&self, payload: &[u8], address: LinkAddress) -> SendOutcome {
        self.sender.send_reliable(payload, address).await
    }

    pub fn local_address(&self) -> LinkAddress {
        self.transport.local_address()
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    pub fn state(&self) -> &MeshState {
        &self.state
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }
}

//! Retrying unicast send with failure-counted eviction.
//!
//! A single failed send says little on a lossy radio, so a peer is only
//! evicted after `eviction_threshold` consecutive failures. Attempts are
//! spaced by a fixed (linear) backoff.

use crate::address::LinkAddress;
use crate::config::MeshConfig;
use crate::events::{EventBus, MeshEvent};
use crate::peers::PeerTable;
use crate::transport::{Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of a reliable send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The transport accepted the frame; the peer's failure count is 0.
    Delivered,
    /// The threshold was reached; the peer has been removed.
    Evicted,
    /// The address is not (or no longer) in the peer table.
    UnknownPeer,
}

/// Sends payloads to individual peers, applying the retry-and-evict policy.
#[derive(Clone)]
pub struct ReliableSender {
    transport: Arc<dyn Transport>,
    peers: Arc<PeerTable>,
    events: Arc<EventBus>,
    backoff: Duration,
    threshold: u32,
}

impl ReliableSender {
    pub fn new(
        transport: Arc<dyn Transport>,
        peers: Arc<PeerTable>,
        events: Arc<EventBus>,
        config: &MeshConfig,
    ) -> Self {
        Self {
            transport,
            peers,
            events,
            backoff: config.retry_backoff,
            threshold: config.eviction_threshold.max(1),
        }
    }

    /// Send `payload` to `address`, retrying until delivered or evicted.
    ///
    /// Makes at most `eviction_threshold` attempts.
    pub async fn send_reliable(&self, payload: &[u8], address: LinkAddress) -> SendOutcome {
        if !self.peers.contains(&address) {
            debug!("Not sending to {}: not a known peer", address);
            return SendOutcome::UnknownPeer;
        }

        loop {
            if self.transport.send(address, payload).await {
                self.peers.record_success(&address);
                return SendOutcome::Delivered;
            }

            let Some(failures) = self.peers.record_failure(&address) else {
                // Removed by another task while we were sending
                debug!("Peer {} left the table during send, giving up", address);
                return SendOutcome::UnknownPeer;
            };

            warn!(
                "Failed to send message to {} {} time(s)",
                address, failures
            );
            self.events.emit(MeshEvent::SendFailed {
                address,
                failure_count: failures,
            });

            if failures >= self.threshold {
                self.evict(address, failures).await;
                return SendOutcome::Evicted;
            }

            tokio::time::sleep(self.backoff).await;
        }
    }

    async fn evict(&self, address: LinkAddress, failures: u32) {
        info!("Removing peer {} after {} failed sends", address, failures);

        // Entry before link: a frame arriving mid-unregister must re-admit
        self.peers.remove(&address);

        match self.transport.unregister_link(address).await {
            Ok(()) => {}
            Err(TransportError::UnknownPeer(_)) => {
                debug!("Link for {} was already unregistered", address);
            }
            Err(e) => {
                warn!("Failed to unregister link for {}: {}", address, e);
            }
        }

        self.events.emit(MeshEvent::PeerEvicted { address, failures });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::BROADCAST;
    use crate::discovery::{Admission, DiscoveryReceiver};
    use crate::membership::MeshState;
    use crate::protocol::DISCOVERY_PAYLOAD;
    use crate::sim::{SimMedium, SimRadio, SimRadioConfig};
    use crate::transport::Frame;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn addr(last: u8) -> LinkAddress {
        LinkAddress::new([0x02, 0, 0, 0, 0, last])
    }

    struct Fixture {
        medium: SimMedium,
        radio: Arc<SimRadio>,
        peers: Arc<PeerTable>,
        events: Arc<EventBus>,
        sender: ReliableSender,
        _peer_radio: SimRadio,
    }

    /// Node 1 with node 2 registered as a peer.
    async fn fixture() -> Fixture {
        let medium = SimMedium::new();
        let radio = Arc::new(medium.join(addr(1), SimRadioConfig::default()));
        let peer_radio = medium.join(addr(2), SimRadioConfig::default());
        radio.set_active(true).await.unwrap();
        peer_radio.set_active(true).await.unwrap();
        radio.register_link(BROADCAST).await.unwrap();
        radio.register_link(addr(2)).await.unwrap();

        let peers = Arc::new(PeerTable::new());
        peers.insert(addr(2));
        let events = Arc::new(EventBus::new());
        let sender = ReliableSender::new(
            radio.clone(),
            peers.clone(),
            events.clone(),
            &MeshConfig::default(),
        );

        Fixture {
            medium,
            radio,
            peers,
            events,
            sender,
            _peer_radio: peer_radio,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_on_first_attempt() {
        let f = fixture().await;

        let outcome = f.sender.send_reliable(b"Hi", addr(2)).await;

        assert_eq!(outcome, SendOutcome::Delivered);
        assert_eq!(f.radio.sends_to(&addr(2)), 1);
        assert_eq!(f.peers.lookup(&addr(2)).unwrap().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_failures_evict() {
        let f = fixture().await;
        f.medium.power_off(addr(2));

        let evicted = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let evicted = evicted.clone();
            f.events.subscribe(move |event| {
                if let MeshEvent::PeerEvicted { address, failures } = event {
                    evicted.lock().unwrap().push((address, failures));
                }
            })
        };

        let start = Instant::now();
        let outcome = f.sender.send_reliable(b"Hi", addr(2)).await;

        assert_eq!(outcome, SendOutcome::Evicted);
        // Exactly five attempts, no further sends
        assert_eq!(f.radio.sends_to(&addr(2)), 5);
        assert!(f.peers.lookup(&addr(2)).is_none());
        assert!(!f.radio.is_registered(&addr(2)));
        // Four 1s backoffs between five attempts
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(5));
        assert_eq!(*evicted.lock().unwrap(), vec![(addr(2), 5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_failures_resets_count() {
        let f = fixture().await;
        f.medium.fail_next_sends(addr(1), addr(2), 2);

        let outcome = f.sender.send_reliable(b"Hi", addr(2)).await;

        assert_eq!(outcome, SendOutcome::Delivered);
        assert_eq!(f.radio.sends_to(&addr(2)), 3);
        // Ends at 0, not 2
        assert_eq!(f.peers.lookup(&addr(2)).unwrap().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_four_failures_do_not_evict() {
        let f = fixture().await;
        f.medium.fail_next_sends(addr(1), addr(2), 4);

        let outcome = f.sender.send_reliable(b"Hi", addr(2)).await;

        assert_eq!(outcome, SendOutcome::Delivered);
        assert_eq!(f.radio.sends_to(&addr(2)), 5);
        assert!(f.peers.contains(&addr(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_prior_count() {
        let f = fixture().await;
        f.peers.record_failure(&addr(2));
        f.peers.record_failure(&addr(2));
        f.peers.record_failure(&addr(2));

        let outcome = f.sender.send_reliable(b"Hi", addr(2)).await;

        assert_eq!(outcome, SendOutcome::Delivered);
        assert_eq!(f.peers.lookup(&addr(2)).unwrap().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_peer_is_not_sent_to() {
        let f = fixture().await;

        let outcome = f.sender.send_reliable(b"Hi", addr(9)).await;

        assert_eq!(outcome, SendOutcome::UnknownPeer);
        assert_eq!(f.radio.sends_to(&addr(9)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_removed_mid_retry() {
        let f = fixture().await;
        f.medium.power_off(addr(2));

        let sender = f.sender.clone();
        let task = tokio::spawn(async move { sender.send_reliable(b"Hi", addr(2)).await });

        // Let two attempts happen, then remove the peer from under the sender
        tokio::time::sleep(Duration::from_millis(1500)).await;
        f.peers.remove(&addr(2));

        assert_eq!(task.await.unwrap(), SendOutcome::UnknownPeer);
        assert_eq!(f.radio.sends_to(&addr(2)), 3);
    }

    /// Radio whose `unregister_link` suspends after taking effect.
    struct SlowUnregister {
        inner: Arc<SimRadio>,
        delay: Duration,
    }

    #[async_trait]
    impl Transport for SlowUnregister {
        fn local_address(&self) -> LinkAddress {
            self.inner.local_address()
        }

        async fn set_active(&self, active: bool) -> crate::transport::Result<()> {
            self.inner.set_active(active).await
        }

        async fn register_link(&self, address: LinkAddress) -> crate::transport::Result<()> {
            self.inner.register_link(address).await
        }

        async fn unregister_link(&self, address: LinkAddress) -> crate::transport::Result<()> {
            let result = self.inner.unregister_link(address).await;
            tokio::time::sleep(self.delay).await;
            result
        }

        fn is_registered(&self, address: &LinkAddress) -> bool {
            self.inner.is_registered(address)
        }

        async fn send(&self, address: LinkAddress, payload: &[u8]) -> bool {
            self.inner.send(address, payload).await
        }

        async fn receive(&self) -> crate::transport::Result<Frame> {
            self.inner.receive().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_during_eviction_readmits_peer() {
        let f = fixture().await;
        f.medium.power_off(addr(2));

        let transport: Arc<dyn Transport> = Arc::new(SlowUnregister {
            inner: f.radio.clone(),
            delay: Duration::from_millis(10),
        });
        let sender = ReliableSender::new(
            transport.clone(),
            f.peers.clone(),
            f.events.clone(),
            &MeshConfig::default(),
        );
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let receiver = DiscoveryReceiver::new(
            transport,
            f.peers.clone(),
            MeshState::new(),
            f.events.clone(),
            &MeshConfig::default(),
            inbound_tx,
        );

        let task = tokio::spawn(async move { sender.send_reliable(b"Hi", addr(2)).await });

        // Fifth attempt fails at 4s; land inside the suspended unregister
        tokio::time::sleep(Duration::from_millis(4005)).await;
        let admission = receiver
            .handle_frame(Frame::new(addr(2), DISCOVERY_PAYLOAD))
            .await;

        assert_eq!(task.await.unwrap(), SendOutcome::Evicted);
        assert_eq!(admission, Admission::Admitted);
        // Link and table entry agree
        assert!(f.radio.is_registered(&addr(2)));
        assert!(f.peers.contains(&addr(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_tolerates_missing_link() {
        let f = fixture().await;
        f.medium.power_off(addr(2));
        // Link vanished underneath us; eviction must still remove the peer
        f.radio.unregister_link(addr(2)).await.unwrap();

        let outcome = f.sender.send_reliable(b"Hi", addr(2)).await;

        assert_eq!(outcome, SendOutcome::Evicted);
        assert!(f.peers.is_empty());
    }
}

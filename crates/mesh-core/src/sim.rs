//! In-memory radio medium.
//!
//! A shared `SimMedium` routes frames between `SimRadio` instances the way
//! a broadcast radio would: broadcasts reach every active, powered node in
//! range, unicasts succeed only when the destination is active, powered, in
//! range, and admitted to the sender's link table.
//!
//! Fault injection (power, partitions, scripted failures, random loss) is
//! exposed for tests and `mesh-node simulate`.

use crate::address::LinkAddress;
use crate::protocol::MAX_PAYLOAD_LEN;
use crate::transport::{Frame, Result, Transport, TransportError};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Default link table capacity (ESP-NOW allows 20 peers).
pub const DEFAULT_MAX_LINKS: usize = 20;

/// Per-radio settings.
#[derive(Debug, Clone)]
pub struct SimRadioConfig {
    /// Maximum number of registered links (broadcast included)
    pub max_links: usize,
    /// Probability that a unicast frame is lost (0.0 - 1.0)
    pub loss: f64,
}

impl Default for SimRadioConfig {
    fn default() -> Self {
        Self {
            max_links: DEFAULT_MAX_LINKS,
            loss: 0.0,
        }
    }
}

#[derive(Default)]
struct MediumInner {
    inboxes: HashMap<LinkAddress, mpsc::UnboundedSender<Frame>>,
    powered_off: HashSet<LinkAddress>,
    /// Radios whose `set_active(true)` took effect
    active: HashSet<LinkAddress>,
    /// Unordered pairs that cannot hear each other
    partitions: HashSet<(LinkAddress, LinkAddress)>,
    /// Remaining forced failures per (sender, destination)
    forced_failures: HashMap<(LinkAddress, LinkAddress), u32>,
    failing_activation: HashSet<LinkAddress>,
}

impl MediumInner {
    fn pair(a: LinkAddress, b: LinkAddress) -> (LinkAddress, LinkAddress) {
        if a <= b { (a, b) } else { (b, a) }
    }

    fn can_hear(&self, from: LinkAddress, to: LinkAddress) -> bool {
        self.active.contains(&to)
            && !self.powered_off.contains(&to)
            && !self.powered_off.contains(&from)
            && !self.partitions.contains(&Self::pair(from, to))
    }
}

/// Shared radio medium connecting `SimRadio` instances.
#[derive(Clone, Default)]
pub struct SimMedium {
    inner: Arc<Mutex<MediumInner>>,
}

impl SimMedium {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MediumInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a new radio with the given address to the medium.
    pub fn join(&self, address: LinkAddress, config: SimRadioConfig) -> SimRadio {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().inboxes.insert(address, tx);
        SimRadio {
            address,
            config,
            medium: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
            links: Mutex::new(HashSet::new()),
            active: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Detach a radio. Its `receive()` returns `Closed` once drained.
    pub fn leave(&self, address: &LinkAddress) {
        let mut inner = self.lock();
        inner.inboxes.remove(address);
        inner.active.remove(address);
    }

    /// Power a node off: it neither hears nor is heard.
    pub fn power_off(&self, address: LinkAddress) {
        self.lock().powered_off.insert(address);
    }

    pub fn power_on(&self, address: LinkAddress) {
        self.lock().powered_off.remove(&address);
    }

    /// Put two nodes out of range of each other.
    pub fn partition(&self, a: LinkAddress, b: LinkAddress) {
        self.lock().partitions.insert(MediumInner::pair(a, b));
    }

    pub fn heal(&self, a: LinkAddress, b: LinkAddress) {
        self.lock().partitions.remove(&MediumInner::pair(a, b));
    }

    /// Make the next `n` unicast sends from `from` to `to` fail.
    pub fn fail_next_sends(&self, from: LinkAddress, to: LinkAddress, n: u32) {
        self.lock().forced_failures.insert((from, to), n);
    }

    /// Make `set_active(true)` fail for this node.
    pub fn fail_activation(&self, address: LinkAddress) {
        self.lock().failing_activation.insert(address);
    }

    /// Inject a frame into a node's inbox as if `from` had transmitted it.
    pub fn inject(&self, to: LinkAddress, frame: Frame) -> bool {
        match self.lock().inboxes.get(&to) {
            Some(inbox) => inbox.send(frame).is_ok(),
            None => false,
        }
    }
}

/// A simulated radio attached to a `SimMedium`.
pub struct SimRadio {
    address: LinkAddress,
    config: SimRadioConfig,
    medium: SimMedium,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    links: Mutex<HashSet<LinkAddress>>,
    active: AtomicBool,
    /// Every send attempt: (destination, payload, accepted)
    sent: Mutex<Vec<(LinkAddress, Vec<u8>, bool)>>,
}

impl SimRadio {
    pub fn medium(&self) -> &SimMedium {
        &self.medium
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// All send attempts so far, in order.
    pub fn sent(&self) -> Vec<(LinkAddress, Vec<u8>, bool)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of send attempts to `to`.
    pub fn sends_to(&self, to: &LinkAddress) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(dest, _, _)| dest == to)
            .count()
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn deliver(&self, to: LinkAddress, payload: &[u8]) -> bool {
        let mut medium = self.medium.lock();

        if to.is_broadcast() {
            if medium.powered_off.contains(&self.address) {
                return false;
            }
            let receivers: Vec<LinkAddress> = medium
                .inboxes
                .keys()
                .copied()
                .filter(|a| *a != self.address && medium.can_hear(self.address, *a))
                .collect();
            for receiver in receivers {
                if let Some(inbox) = medium.inboxes.get(&receiver) {
                    let _ = inbox.send(Frame::new(self.address, payload));
                }
            }
            // Broadcast frames are never acknowledged, so the radio reports success.
            return true;
        }

        if let Some(remaining) = medium.forced_failures.get_mut(&(self.address, to)) {
            if *remaining > 0 {
                *remaining -= 1;
                return false;
            }
        }

        if !medium.can_hear(self.address, to) {
            return false;
        }

        if self.config.loss > 0.0 && rand::rng().random_bool(self.config.loss.min(1.0)) {
            trace!("Simulated loss {} -> {}", self.address, to);
            return false;
        }

        match medium.inboxes.get(&to) {
            Some(inbox) => inbox.send(Frame::new(self.address, payload)).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Transport for SimRadio {
    fn local_address(&self) -> LinkAddress {
        self.address
    }

    async fn set_active(&self, active: bool) -> Result<()> {
        if active && self.medium.lock().failing_activation.contains(&self.address) {
            return Err(TransportError::ActivationFailed(format!(
                "radio {} did not come up",
                self.address
            )));
        }
        {
            let mut medium = self.medium.lock();
            if active {
                medium.active.insert(self.address);
            } else {
                medium.active.remove(&self.address);
            }
        }
        self.active.store(active, Ordering::SeqCst);
        debug!("Radio {} active={}", self.address, active);
        Ok(())
    }

    async fn register_link(&self, address: LinkAddress) -> Result<()> {
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        if links.contains(&address) {
            return Ok(());
        }
        if links.len() >= self.config.max_links {
            return Err(TransportError::LinkTableFull {
                capacity: self.config.max_links,
            });
        }
        links.insert(address);
        Ok(())
    }

    async fn unregister_link(&self, address: LinkAddress) -> Result<()> {
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        if links.remove(&address) {
            Ok(())
        } else {
            Err(TransportError::UnknownPeer(address))
        }
    }

    fn is_registered(&self, address: &LinkAddress) -> bool {
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(address)
    }

    async fn send(&self, address: LinkAddress, payload: &[u8]) -> bool {
        let accepted = self.is_active()
            && payload.len() <= MAX_PAYLOAD_LEN
            && self.is_registered(&address)
            && self.deliver(address, payload);

        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((address, payload.to_vec(), accepted));
        accepted
    }

    async fn receive(&self) -> Result<Frame> {
        let mut inbox = self.inbox.lock().await;
        inbox.recv().await.ok_or(TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::BROADCAST;

    fn addr(last: u8) -> LinkAddress {
        LinkAddress::new([0x02, 0, 0, 0, 0, last])
    }

    async fn radio(medium: &SimMedium, last: u8) -> SimRadio {
        let radio = medium.join(addr(last), SimRadioConfig::default());
        radio.set_active(true).await.unwrap();
        radio.register_link(BROADCAST).await.unwrap();
        radio
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_else() {
        let medium = SimMedium::new();
        let a = radio(&medium, 1).await;
        let b = radio(&medium, 2).await;
        let c = radio(&medium, 3).await;

        assert!(a.send(BROADCAST, b"--hello--").await);

        assert_eq!(b.receive().await.unwrap(), Frame::new(addr(1), b"--hello--".to_vec()));
        assert_eq!(c.receive().await.unwrap(), Frame::new(addr(1), b"--hello--".to_vec()));
    }

    #[tokio::test]
    async fn test_unicast_requires_registration() {
        let medium = SimMedium::new();
        let a = radio(&medium, 1).await;
        let b = radio(&medium, 2).await;

        assert!(!a.send(addr(2), b"Hi").await);

        a.register_link(addr(2)).await.unwrap();
        assert!(a.send(addr(2), b"Hi").await);
        assert_eq!(b.receive().await.unwrap().payload, b"Hi");
    }

    #[tokio::test]
    async fn test_inactive_radio_cannot_send() {
        let medium = SimMedium::new();
        let a = medium.join(addr(1), SimRadioConfig::default());
        a.register_link(BROADCAST).await.unwrap();

        assert!(!a.send(BROADCAST, b"x").await);
    }

    #[tokio::test]
    async fn test_powered_off_peer_fails_unicast() {
        let medium = SimMedium::new();
        let a = radio(&medium, 1).await;
        let _b = radio(&medium, 2).await;
        a.register_link(addr(2)).await.unwrap();

        medium.power_off(addr(2));
        assert!(!a.send(addr(2), b"Hi").await);

        medium.power_on(addr(2));
        assert!(a.send(addr(2), b"Hi").await);
    }

    #[tokio::test]
    async fn test_inactive_peer_fails_unicast() {
        let medium = SimMedium::new();
        let a = radio(&medium, 1).await;
        let b = radio(&medium, 2).await;
        a.register_link(addr(2)).await.unwrap();

        b.set_active(false).await.unwrap();
        assert!(!a.send(addr(2), b"Hi").await);

        b.set_active(true).await.unwrap();
        assert!(a.send(addr(2), b"Hi").await);
        assert_eq!(b.receive().await.unwrap().payload, b"Hi");
    }

    #[tokio::test]
    async fn test_broadcast_skips_inactive_radios() {
        let medium = SimMedium::new();
        let a = radio(&medium, 1).await;
        let b = radio(&medium, 2).await;
        let c = radio(&medium, 3).await;
        b.set_active(false).await.unwrap();

        assert!(a.send(BROADCAST, b"--hello--").await);

        assert_eq!(c.receive().await.unwrap().from, addr(1));
        assert!(b.inbox.lock().await.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_partition_blocks_both_directions() {
        let medium = SimMedium::new();
        let a = radio(&medium, 1).await;
        let b = radio(&medium, 2).await;
        a.register_link(addr(2)).await.unwrap();
        b.register_link(addr(1)).await.unwrap();

        medium.partition(addr(2), addr(1));
        assert!(!a.send(addr(2), b"Hi").await);
        assert!(!b.send(addr(1), b"Hi").await);

        medium.heal(addr(1), addr(2));
        assert!(a.send(addr(2), b"Hi").await);
    }

    #[tokio::test]
    async fn test_forced_failures_then_success() {
        let medium = SimMedium::new();
        let a = radio(&medium, 1).await;
        let _b = radio(&medium, 2).await;
        a.register_link(addr(2)).await.unwrap();

        medium.fail_next_sends(addr(1), addr(2), 2);
        assert!(!a.send(addr(2), b"Hi").await);
        assert!(!a.send(addr(2), b"Hi").await);
        assert!(a.send(addr(2), b"Hi").await);
        assert_eq!(a.sends_to(&addr(2)), 3);
    }

    #[tokio::test]
    async fn test_link_table_capacity() {
        let medium = SimMedium::new();
        let a = medium.join(
            addr(1),
            SimRadioConfig {
                max_links: 2,
                ..Default::default()
            },
        );

        a.register_link(BROADCAST).await.unwrap();
        a.register_link(addr(2)).await.unwrap();
        // Re-registering is not a new link
        a.register_link(addr(2)).await.unwrap();

        let err = a.register_link(addr(3)).await.unwrap_err();
        assert!(matches!(err, TransportError::LinkTableFull { capacity: 2 }));
        assert_eq!(a.link_count(), 2);
    }

    #[tokio::test]
    async fn test_unregister_unknown_link() {
        let medium = SimMedium::new();
        let a = medium.join(addr(1), SimRadioConfig::default());

        let err = a.unregister_link(addr(2)).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer(a) if a == addr(2)));
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let medium = SimMedium::new();
        let a = radio(&medium, 1).await;
        assert!(!a.send(BROADCAST, &[0u8; MAX_PAYLOAD_LEN + 1]).await);
    }

    #[tokio::test]
    async fn test_activation_failure() {
        let medium = SimMedium::new();
        let a = medium.join(addr(1), SimRadioConfig::default());
        medium.fail_activation(addr(1));

        assert!(matches!(
            a.set_active(true).await,
            Err(TransportError::ActivationFailed(_))
        ));
        assert!(!a.is_active());
    }

    #[tokio::test]
    async fn test_leave_closes_receive() {
        let medium = SimMedium::new();
        let a = medium.join(addr(1), SimRadioConfig::default());
        medium.leave(&addr(1));

        assert!(matches!(a.receive().await, Err(TransportError::Closed)));
    }
}

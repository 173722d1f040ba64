//! UDP datagrams standing in for radio frames.
//!
//! A node's link address is its IPv4 address followed by its port, both in
//! network byte order. Broadcasts fan out to the configured targets (a
//! subnet broadcast address by default, or a list of unicast addresses).
//!
//! Radio links acknowledge unicast frames in the MAC layer; UDP does not,
//! so every unicast datagram carries a sequence number and the receiver
//! answers with an ack. Acks are read by `receive()`, which the mesh runs
//! continuously. A send that sees no ack within the timeout has failed.
//!
//! Datagram layout: `[kind: u8][seq: u32 BE][payload]`.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mesh_core::protocol::MAX_PAYLOAD_LEN;
use mesh_core::transport::Result;
use mesh_core::{Frame, LinkAddress, Transport, TransportError};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

use crate::config::RadioConfig;

const KIND_BROADCAST: u8 = 0;
const KIND_UNICAST: u8 = 1;
const KIND_ACK: u8 = 2;

const HEADER_LEN: usize = 5;
const MAX_DATAGRAM_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN;

/// Link address of a UDP endpoint.
pub fn link_address_of(addr: SocketAddrV4) -> LinkAddress {
    let ip = addr.ip().octets();
    let port = addr.port().to_be_bytes();
    LinkAddress::new([ip[0], ip[1], ip[2], ip[3], port[0], port[1]])
}

/// UDP endpoint for a link address.
pub fn socket_addr_of(address: LinkAddress) -> SocketAddrV4 {
    let b = address.as_bytes();
    SocketAddrV4::new(
        Ipv4Addr::new(b[0], b[1], b[2], b[3]),
        u16::from_be_bytes([b[4], b[5]]),
    )
}

fn encode(kind: u8, seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(kind);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn decode(buf: &[u8]) -> Option<(u8, u32, &[u8])> {
    if buf.len() < HEADER_LEN || buf.len() > MAX_DATAGRAM_LEN {
        return None;
    }
    let seq = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    Some((buf[0], seq, &buf[HEADER_LEN..]))
}

/// Transport over a single UDP socket.
pub struct UdpRadio {
    socket: UdpSocket,
    local: LinkAddress,
    broadcast_targets: Mutex<Vec<SocketAddrV4>>,
    max_links: usize,
    ack_timeout: Duration,
    links: Mutex<HashSet<LinkAddress>>,
    active: AtomicBool,
    next_seq: AtomicU32,
    /// Unicast sends waiting for an ack, by sequence number
    pending: Mutex<HashMap<u32, (LinkAddress, oneshot::Sender<()>)>>,
}

impl UdpRadio {
    /// Bind the socket. The radio stays inactive until `set_active(true)`.
    pub async fn bind(config: &RadioConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(config.bind).await?;
        let SocketAddr::V4(mut local) = socket.local_addr()? else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "UDP radio requires an IPv4 address",
            ));
        };

        // Peers see our interface address, not the wildcard we bound to.
        if local.ip().is_unspecified() {
            if let Some(target) = config.broadcast_targets.first() {
                if let Some(ip) = outbound_ip(*target).await {
                    local.set_ip(ip);
                }
            }
        }

        let local = link_address_of(local);
        info!("UDP radio bound, link address {}", local);

        Ok(Self {
            socket,
            local,
            broadcast_targets: Mutex::new(config.broadcast_targets.clone()),
            max_links: config.max_links,
            ack_timeout: config.ack_timeout(),
            links: Mutex::new(HashSet::new()),
            active: AtomicBool::new(false),
            next_seq: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Add a destination for broadcast frames.
    pub fn add_broadcast_target(&self, target: SocketAddrV4) {
        let mut targets = self
            .broadcast_targets
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !targets.contains(&target) {
            targets.push(target);
        }
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        socket_addr_of(self.local)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn send_broadcast(&self, payload: &[u8]) -> bool {
        let targets = self
            .broadcast_targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let datagram = encode(KIND_BROADCAST, 0, payload);

        let mut any = false;
        for target in targets {
            match self.socket.send_to(&datagram, target).await {
                Ok(_) => any = true,
                Err(e) => debug!("Broadcast to {} failed: {}", target, e),
            }
        }
        any
    }

    async fn send_unicast(&self, address: LinkAddress, payload: &[u8]) -> bool {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(seq, (address, tx));

        let datagram = encode(KIND_UNICAST, seq, payload);
        let acked = match self.socket.send_to(&datagram, socket_addr_of(address)).await {
            Ok(_) => matches!(tokio::time::timeout(self.ack_timeout, rx).await, Ok(Ok(()))),
            Err(e) => {
                debug!("Send to {} failed: {}", address, e);
                false
            }
        };

        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&seq);
        acked
    }

    fn resolve_ack(&self, from: LinkAddress, seq: u32) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.get(&seq) {
            Some((expected, _)) if *expected == from => {
                if let Some((_, tx)) = pending.remove(&seq) {
                    let _ = tx.send(());
                }
            }
            _ => trace!("Stray ack {} from {}", seq, from),
        }
    }
}

/// Interface address the OS would use to reach `target`.
async fn outbound_ip(target: SocketAddrV4) -> Option<Ipv4Addr> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    probe.set_broadcast(true).ok()?;
    probe.connect(target).await.ok()?;
    match probe.local_addr().ok()? {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Some(*addr.ip()),
        _ => None,
    }
}

#[async_trait]
impl Transport for UdpRadio {
    fn local_address(&self) -> LinkAddress {
        self.local
    }

    async fn set_active(&self, active: bool) -> Result<()> {
        if active {
            self.socket
                .set_broadcast(true)
                .map_err(|e| TransportError::ActivationFailed(e.to_string()))?;
        }
        self.active.store(active, Ordering::SeqCst);
        debug!("UDP radio {} active={}", self.local, active);
        Ok(())
    }

    async fn register_link(&self, address: LinkAddress) -> Result<()> {
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        if links.contains(&address) {
            return Ok(());
        }
        if links.len() >= self.max_links {
            return Err(TransportError::LinkTableFull {
                capacity: self.max_links,
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
        if !self.is_active() || payload.len() > MAX_PAYLOAD_LEN || !self.is_registered(&address) {
            return false;
        }

        if address.is_broadcast() {
            self.send_broadcast(payload).await
        } else {
            self.send_unicast(address, payload).await
        }
    }

    async fn receive(&self) -> Result<Frame> {
        // One spare byte so an oversized datagram is seen as such, not truncated
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN + 1];

        loop {
            let (len, source) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                // ICMP errors from earlier sends surface here on some platforms
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    trace!("Ignoring socket error: {}", e);
                    continue;
                }
                Err(e) => return Err(TransportError::ReceiveFailed(e.to_string())),
            };

            let SocketAddr::V4(source) = source else {
                continue;
            };
            let from = link_address_of(source);
            if from == self.local || !self.is_active() {
                continue;
            }

            let Some((kind, seq, payload)) = decode(&buf[..len]) else {
                trace!("Dropping malformed datagram ({} bytes) from {}", len, from);
                continue;
            };

            match kind {
                KIND_ACK => self.resolve_ack(from, seq),
                KIND_UNICAST => {
                    if let Err(e) = self.socket.send_to(&encode(KIND_ACK, seq, &[]), source).await {
                        debug!("Failed to ack {} from {}: {}", seq, from, e);
                    }
                    return Ok(Frame::new(from, payload));
                }
                KIND_BROADCAST => return Ok(Frame::new(from, payload)),
                other => trace!("Unknown datagram kind {} from {}", other, from),
            }
        }
    }
}

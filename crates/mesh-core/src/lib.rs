//! mesh-core: self-organizing peer discovery and link liveness for nodes on
//! a broadcast-capable radio.
//!
//! This crate provides:
//! - `PeerTable` with failure-counted eviction
//! - the beacon, discovery, liveness and reliable-send tasks
//! - `MeshController` to run them against one `Transport`
//! - `sim`, an in-memory radio medium for tests and simulations

pub mod address;
pub mod beacon;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod events;
pub mod liveness;
pub mod membership;
pub mod peers;
pub mod protocol;
pub mod reliable;
pub mod sim;
pub mod transport;

pub use address::{AddressError, BROADCAST, LinkAddress};
pub use beacon::BeaconAnnouncer;
pub use config::MeshConfig;
pub use controller::{MeshController, MeshError};
pub use discovery::{Admission, DiscoveryReceiver};
pub use events::{EventBus, MeshEvent, Subscription};
pub use liveness::{LivenessProbe, ProbeReport};
pub use membership::MeshState;
pub use peers::{Peer, PeerTable};
pub use reliable::{ReliableSender, SendOutcome};
pub use transport::{Frame, Transport, TransportError};

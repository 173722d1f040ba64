//! Event infrastructure for mesh monitoring.
//!
//! Provides `MeshEvent` for membership changes and link failures, and
//! `EventBus` for subscriptions. Subscribers are plain callbacks; the
//! returned `Subscription` unsubscribes when dropped.

use crate::address::LinkAddress;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the mesh tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MeshEvent {
    /// This node joined a mesh (emitted once per run).
    Joined {
        /// Peer whose registration caused the join.
        via: LinkAddress,
    },
    /// A previously unknown node was registered as a peer.
    PeerDiscovered { address: LinkAddress },
    /// A unicast send to a peer failed.
    #[serde(rename_all = "camelCase")]
    SendFailed {
        address: LinkAddress,
        /// Consecutive failures including this one.
        failure_count: u32,
    },
    /// A peer reached the eviction threshold and was removed.
    PeerEvicted {
        address: LinkAddress,
        failures: u32,
    },
    /// The link layer refused to admit a new peer.
    LinkRegistrationFailed { address: LinkAddress, reason: String },
}

impl MeshEvent {
    /// Serialize to JSON (for line-oriented event logs).
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events; drop it to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(MeshEvent) + Send + Sync>;

/// Event bus for publishing mesh events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(MeshEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: MeshEvent) {
        // Clone the list so callbacks may subscribe without deadlocking.
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

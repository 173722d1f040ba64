//! Mesh membership state.
//!
//! `joined` starts false and flips to true exactly once, on the first
//! successful peer registration. It never reverts, even when every peer is
//! evicted later.

use std::sync::Arc;
use tokio::sync::watch;

/// Shared, monotonic "joined a mesh" flag.
///
/// Cheap to clone; all clones observe the same flag.
#[derive(Clone, Debug)]
pub struct MeshState {
    joined: Arc<watch::Sender<bool>>,
}

impl Default for MeshState {
    fn default() -> Self {
        let (joined, _) = watch::channel(false);
        Self {
            joined: Arc::new(joined),
        }
    }
}

impl MeshState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_joined(&self) -> bool {
        *self.joined.borrow()
    }

    /// Mark the node as joined.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn join(&self) -> bool {
        self.joined.send_if_modified(|joined| {
            if *joined {
                false
            } else {
                *joined = true;
                true
            }
        })
    }

    /// Wait until the node has joined. Returns immediately if it already has.
    pub async fn joined(&self) {
        let mut rx = self.joined.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|joined| *joined).await;
    }
}

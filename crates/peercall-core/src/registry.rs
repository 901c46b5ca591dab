//! Peer registry: the local peer's set of remote peers.
//!
//! Membership and per-peer status share one mutex. It is entered briefly for
//! each add, remove, snapshot or status change, never across a handshake, so
//! peers can be added or removed while a negotiation is in flight.

use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CallError;
use crate::remote::{PeerId, PeerStatus, RemotePeer};

#[derive(Debug)]
struct Entry {
    peer: RemotePeer,
    /// Fired when the peer is evicted so in-flight handshakes stop waiting.
    removed: CancellationToken,
}

/// A registered peer as seen by one negotiation attempt.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub(crate) peer: RemotePeer,
    pub(crate) removed: CancellationToken,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a peer. Fails if a live peer with the same resolved address
    /// is already present; membership is left unchanged in that case.
    pub fn add(&self, mut peer: RemotePeer) -> Result<PeerId, CallError> {
        let mut entries = self.lock();
        if entries.iter().any(|e| e.peer.addr() == peer.addr()) {
            return Err(CallError::DuplicatePeer(peer.addr()));
        }

        peer.reset();
        let id = peer.id();
        debug!("registered remote {}", peer);
        entries.push(Entry {
            peer,
            removed: CancellationToken::new(),
        });
        Ok(id)
    }

    /// Evict a peer, marking it `Removed`. Returns the final view of the peer,
    /// or `None` if it was not registered.
    pub fn remove(&self, id: PeerId) -> Option<RemotePeer> {
        let mut entries = self.lock();
        let index = entries.iter().position(|e| e.peer.id() == id)?;
        let Entry { mut peer, removed } = entries.remove(index);
        peer.mark_removed();
        removed.cancel();
        debug!("removed remote {}", peer);
        Some(peer)
    }

    /// Evict every peer, in registration order.
    pub(crate) fn drain(&self) -> Vec<RemotePeer> {
        let mut entries = self.lock();
        entries
            .drain(..)
            .map(|Entry { mut peer, removed }| {
                peer.mark_removed();
                removed.cancel();
                peer
            })
            .collect()
    }

    /// Current membership in registration order.
    pub fn snapshot(&self) -> Vec<RemotePeer> {
        self.lock().iter().map(|e| e.peer.clone()).collect()
    }

    pub(crate) fn targets(&self) -> Vec<Target> {
        self.lock()
            .iter()
            .map(|e| Target {
                peer: e.peer.clone(),
                removed: e.removed.clone(),
            })
            .collect()
    }

    pub fn get(&self, id: PeerId) -> Option<RemotePeer> {
        self.lock()
            .iter()
            .find(|e| e.peer.id() == id)
            .map(|e| e.peer.clone())
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<RemotePeer> {
        self.lock()
            .iter()
            .find(|e| e.peer.addr() == addr)
            .map(|e| e.peer.clone())
    }

    /// Status of a peer; evicted or unknown peers report `Removed`.
    pub fn status(&self, id: PeerId) -> PeerStatus {
        self.get(id)
            .map(|peer| peer.status())
            .unwrap_or(PeerStatus::Removed)
    }

    /// Apply a status transition under the registry lock. Returns false when
    /// the peer is no longer registered or refused the transition.
    pub(crate) fn update<F>(&self, id: PeerId, f: F) -> bool
    where
        F: FnOnce(&mut RemotePeer) -> bool,
    {
        let mut entries = self.lock();
        match entries.iter_mut().find(|e| e.peer.id() == id) {
            Some(entry) => f(&mut entry.peer),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

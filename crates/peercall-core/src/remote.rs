//! Remote peer handles.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::parse_peer_spec;
use crate::error::{CallError, NegotiationError};

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    fn next() -> Self {
        Self(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Negotiation status of one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Registered, no handshake in flight
    Pending,
    /// Handshake in flight
    Negotiating,
    /// Remote accepted the call
    Connected,
    /// Handshake failed; see [`RemotePeer::last_error`]
    Failed,
    /// Evicted from the registry
    Removed,
}

/// One other party in the call.
///
/// Status changes are only applied through the registry, which serializes
/// them; values handed out by the registry are snapshots.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    id: PeerId,
    spec: String,
    addr: SocketAddr,
    status: PeerStatus,
    last_error: Option<NegotiationError>,
}

impl RemotePeer {
    /// Create a peer from a `host[:port]` specifier.
    pub fn new(spec: &str) -> Result<Self, CallError> {
        let addr = parse_peer_spec(spec)?;
        Ok(Self::with_spec(spec.trim().to_string(), addr))
    }

    /// Create a peer for an already resolved address.
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self::with_spec(addr.to_string(), addr)
    }

    fn with_spec(spec: String, addr: SocketAddr) -> Self {
        Self {
            id: PeerId::next(),
            spec,
            addr,
            status: PeerStatus::Pending,
            last_error: None,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The specifier this peer was created from.
    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    /// Present only while the status is [`PeerStatus::Failed`].
    pub fn last_error(&self) -> Option<&NegotiationError> {
        self.last_error.as_ref()
    }

    pub(crate) fn mark_pending(&mut self) -> bool {
        self.set(PeerStatus::Pending, None)
    }

    pub(crate) fn mark_negotiating(&mut self) -> bool {
        self.set(PeerStatus::Negotiating, None)
    }

    pub(crate) fn mark_connected(&mut self) -> bool {
        self.set(PeerStatus::Connected, None)
    }

    pub(crate) fn mark_failed(&mut self, error: NegotiationError) -> bool {
        self.set(PeerStatus::Failed, Some(error))
    }

    /// Back to a fresh `Pending` peer, whatever the previous status.
    pub(crate) fn reset(&mut self) {
        self.status = PeerStatus::Pending;
        self.last_error = None;
    }

    pub(crate) fn mark_removed(&mut self) {
        self.status = PeerStatus::Removed;
        self.last_error = None;
    }

    /// Returns false, leaving the peer untouched, once it has been removed.
    fn set(&mut self, status: PeerStatus, error: Option<NegotiationError>) -> bool {
        if self.status == PeerStatus::Removed {
            return false;
        }
        self.status = status;
        self.last_error = error;
        true
    }
}

impl fmt::Display for RemotePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.addr, self.id)
    }
}

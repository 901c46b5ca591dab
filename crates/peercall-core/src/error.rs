//! Error types for call setup.

use std::net::SocketAddr;

use crate::session::PipelineError;
use crate::state::LocalState;

/// The single verdict of a failed negotiation attempt.
///
/// Per-peer failures are folded into one of these by the coordinator; when
/// several peers fail concurrently the first one observed is reported.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("handshake with {0} timed out")]
    HandshakeTimeout(SocketAddr),
    #[error("{peer} rejected the call: {reason}")]
    HandshakeRejected { peer: SocketAddr, reason: String },
    #[error("transport error with {peer}: {message}")]
    Transport { peer: SocketAddr, message: String },
    #[error("{0} was removed during negotiation")]
    PeerRemoved(SocketAddr),
    #[error("negotiation cancelled")]
    Cancelled,
    #[error("handshake task failed: {0}")]
    TaskFailed(String),
}

impl NegotiationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The remote peer this failure is attributed to, if any.
    pub fn peer(&self) -> Option<SocketAddr> {
        match self {
            Self::HandshakeTimeout(peer) | Self::PeerRemoved(peer) => Some(*peer),
            Self::HandshakeRejected { peer, .. } | Self::Transport { peer, .. } => Some(*peer),
            Self::Cancelled | Self::TaskFailed(_) => None,
        }
    }
}

/// Errors reported synchronously by call-setup operations.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("invalid peer address '{spec}': {reason}")]
    Address { spec: String, reason: String },
    #[error("peer {0} is already registered")]
    DuplicatePeer(SocketAddr),
    #[error("cannot {op} in state {state:?}")]
    InvalidState { op: &'static str, state: LocalState },
    #[error("session pipeline failed: {0}")]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

impl CallError {
    pub fn address(spec: &str, reason: impl std::fmt::Display) -> Self {
        Self::Address {
            spec: spec.to_string(),
            reason: reason.to_string(),
        }
    }
}

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::address::DEFAULT_COMM_PORT;

/// Default per-peer handshake deadline.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Immutable settings consumed once when the local peer is created.
#[derive(Debug, Clone)]
pub struct LocalPeerConfig {
    /// Address the negotiation listener is bound to.
    pub listen_addr: SocketAddr,
    /// Selected capture source. Only stored; owned by device enumeration.
    pub device: Option<String>,
    /// Deadline applied to each remote's handshake.
    pub handshake_timeout: Duration,
    /// Go straight to `Started` when a negotiation succeeds.
    pub auto_start: bool,
}

impl LocalPeerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            device: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            auto_start: false,
        }
    }
}

impl Default for LocalPeerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_COMM_PORT)))
    }
}

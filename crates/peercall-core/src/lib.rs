//! Call setup core for peercall.
//!
//! This crate provides:
//! - Remote peer handles and peer specifier parsing
//! - The peer registry owned by the local peer
//! - Concurrent negotiation across every registered remote, with
//!   cancellation and per-peer timeouts
//! - The local call state flags and the session lifecycle they gate
//! - A TCP handshake transport and the responder for inbound calls

#![forbid(unsafe_code)]

pub mod address;
pub mod config;
pub mod error;
pub mod local;
pub mod negotiate;
pub mod registry;
pub mod remote;
pub mod responder;
pub mod session;
pub mod state;
pub mod transport;

pub use address::{parse_peer_spec, DEFAULT_COMM_PORT};
pub use config::LocalPeerConfig;
pub use error::{CallError, NegotiationError};
pub use local::{InboundTicket, LocalPeer};
pub use negotiate::NegotiationHandle;
pub use registry::PeerRegistry;
pub use remote::{PeerId, PeerStatus, RemotePeer};
pub use responder::serve_inbound;
pub use session::{PipelineError, SessionContext, SessionPipeline};
pub use state::LocalState;
pub use transport::{CallOffer, HandshakeReply, HandshakeTransport, TcpTransport, TransportError};

//! Handshake transport: one offer out, one verdict back, per remote peer.

use std::net::SocketAddr;

use async_trait::async_trait;
use peercall_common::{HandshakeMessage, MAX_HANDSHAKE_LINE, PROTOCOL_VERSION};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

use crate::remote::RemotePeer;

/// Call parameters sent to every remote of one negotiation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOffer {
    pub call_id: Uuid,
    pub listen_addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    Accepted,
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] peercall_common::Error),
    #[error("connection closed before a reply")]
    Closed,
    #[error("unexpected reply: {0}")]
    Unexpected(String),
}

/// Capability to run the handshake with one remote peer.
///
/// The caller bounds each call with its own deadline, so implementations
/// need not time out by themselves.
#[async_trait]
pub trait HandshakeTransport: Send + Sync {
    async fn send_handshake(
        &self,
        remote: &RemotePeer,
        offer: &CallOffer,
    ) -> Result<HandshakeReply, TransportError>;
}

/// Handshake over a fresh TCP connection using JSON lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HandshakeTransport for TcpTransport {
    async fn send_handshake(
        &self,
        remote: &RemotePeer,
        offer: &CallOffer,
    ) -> Result<HandshakeReply, TransportError> {
        let stream = TcpStream::connect(remote.addr()).await?;
        stream.set_nodelay(true)?;
        let (read, mut write) = stream.into_split();

        let hello = HandshakeMessage::CALL_OFFER {
            version: PROTOCOL_VERSION,
            call_id: offer.call_id,
            listen_port: offer.listen_addr.port(),
        };
        write.write_all(hello.encode_line()?.as_bytes()).await?;
        debug!("sent CALL_OFFER {} to {}", offer.call_id, remote.addr());

        let mut lines = BufReader::new(read.take(MAX_HANDSHAKE_LINE as u64)).lines();
        let line = lines.next_line().await?.ok_or(TransportError::Closed)?;

        let reply = HandshakeMessage::decode_line(&line)?;
        if reply.call_id() != offer.call_id {
            return Err(TransportError::Unexpected(format!(
                "reply for call {}",
                reply.call_id()
            )));
        }
        match reply {
            HandshakeMessage::CALL_ACCEPT { .. } => Ok(HandshakeReply::Accepted),
            HandshakeMessage::CALL_REJECT { reason, .. } => Ok(HandshakeReply::Rejected(reason)),
            other => Err(TransportError::Unexpected(format!("{other:?}"))),
        }
    }
}

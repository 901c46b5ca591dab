//! Inbound side of the handshake: answers `CALL_OFFER`s from initiators.

use std::net::SocketAddr;
use std::sync::Arc;

use peercall_common::{HandshakeMessage, MAX_HANDSHAKE_LINE, PROTOCOL_VERSION};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{debug, info, warn};

use crate::error::NegotiationError;
use crate::local::LocalPeer;
use crate::transport::TransportError;

/// Accept negotiation connections until the listener fails.
///
/// Each connection carries one offer. A passive, negotiating local peer
/// accepts the first offer it sees; everything else is rejected with a
/// reason.
pub async fn serve_inbound(listener: TcpListener, local: Arc<LocalPeer>) -> std::io::Result<()> {
    info!("listening for calls on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        let local = Arc::clone(&local);
        tokio::spawn(async move {
            if let Err(e) = answer(stream, peer, &local).await {
                debug!("inbound handshake from {} failed: {}", peer, e);
            }
        });
    }
}

async fn answer(
    stream: TcpStream,
    peer: SocketAddr,
    local: &Arc<LocalPeer>,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read.take(MAX_HANDSHAKE_LINE as u64)).lines();

    let line = time::timeout(local.config().handshake_timeout, lines.next_line())
        .await
        .map_err(|_| peercall_common::Error::timeout(format!("no offer from {peer}")))??
        .ok_or(TransportError::Closed)?;

    let (call_id, listen_port) = match HandshakeMessage::decode_line(&line)? {
        HandshakeMessage::CALL_OFFER {
            version,
            call_id,
            listen_port,
        } => {
            if version != PROTOCOL_VERSION {
                let reject = HandshakeMessage::CALL_REJECT {
                    call_id,
                    reason: format!("unsupported protocol version {version}"),
                };
                write.write_all(reject.encode_line()?.as_bytes()).await?;
                return Ok(());
            }
            (call_id, listen_port)
        }
        other => return Err(TransportError::Unexpected(format!("{other:?}"))),
    };

    let initiator = SocketAddr::new(peer.ip(), listen_port);
    let ticket = match local.admit_inbound(initiator) {
        Ok(ticket) => ticket,
        Err(e) => {
            info!("rejecting call {} from {}: {}", call_id, initiator, e);
            let reject = HandshakeMessage::CALL_REJECT {
                call_id,
                reason: e.to_string(),
            };
            write.write_all(reject.encode_line()?.as_bytes()).await?;
            return Ok(());
        }
    };

    let accept = HandshakeMessage::CALL_ACCEPT { call_id };
    let sent = match accept.encode_line() {
        Ok(line) => write.write_all(line.as_bytes()).await.map_err(TransportError::from),
        Err(e) => Err(e.into()),
    };
    match sent {
        Ok(()) => {
            info!("accepted call {} from {}", call_id, initiator);
            ticket.complete(Ok(()));
            Ok(())
        }
        Err(e) => {
            warn!("failed to accept call {} from {}: {}", call_id, initiator, e);
            ticket.complete(Err(NegotiationError::Transport {
                peer: initiator,
                message: e.to_string(),
            }));
            Err(e)
        }
    }
}

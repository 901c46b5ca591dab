//! End-to-end call setup over loopback TCP.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use uuid::Uuid;

use peercall_common::{HandshakeMessage, PROTOCOL_VERSION};
use peercall_core::{
    serve_inbound, LocalPeer, LocalPeerConfig, LocalState, NegotiationError, PeerStatus,
    PipelineError, RemotePeer, SessionContext, SessionPipeline, TcpTransport,
};

#[derive(Default)]
struct CountingPipeline {
    starts: AtomicUsize,
}

impl SessionPipeline for CountingPipeline {
    fn start_session(&self, _ctx: &SessionContext) -> Result<(), PipelineError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_session(&self, _ctx: &SessionContext) -> Result<(), PipelineError> {
        Ok(())
    }
}

async fn spawn_peer(pipeline: Arc<CountingPipeline>) -> Arc<LocalPeer> {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = LocalPeerConfig::new(listener.local_addr().unwrap());
    config.handshake_timeout = Duration::from_millis(500);
    config.auto_start = true;

    let local = Arc::new(LocalPeer::new(config, Arc::new(TcpTransport::new()), pipeline));
    tokio::spawn(serve_inbound(listener, local.clone()));
    local
}

#[tokio::test]
async fn test_call_between_two_peers() {
    let callee_pipeline = Arc::new(CountingPipeline::default());
    let callee = spawn_peer(callee_pipeline.clone()).await;
    let callee_waiting = callee.negotiate().unwrap();

    let caller_pipeline = Arc::new(CountingPipeline::default());
    let caller = spawn_peer(caller_pipeline.clone()).await;
    let spec = callee.listen_addr().to_string();
    caller.add_remote(RemotePeer::new(&spec).unwrap()).unwrap();

    let caller_verdict = timeout(Duration::from_secs(5), caller.negotiate().unwrap().wait())
        .await
        .unwrap();
    let callee_verdict = timeout(Duration::from_secs(5), callee_waiting.wait())
        .await
        .unwrap();
    assert_eq!(caller_verdict, Ok(()));
    assert_eq!(callee_verdict, Ok(()));

    assert_eq!(caller.state(), LocalState::STARTED | LocalState::IS_NEGOTIATOR);
    assert_eq!(callee.state(), LocalState::STARTED);
    assert_eq!(caller_pipeline.starts.load(Ordering::SeqCst), 1);
    assert_eq!(callee_pipeline.starts.load(Ordering::SeqCst), 1);

    let callee_remotes = callee.remotes();
    assert_eq!(callee_remotes.len(), 1);
    assert_eq!(callee_remotes[0].addr(), caller.listen_addr());
    assert_eq!(callee_remotes[0].status(), PeerStatus::Connected);

    caller.stop().await;
    callee.stop().await;
    assert!(caller.is_terminal());
    assert!(callee.is_terminal());
}

#[tokio::test]
async fn test_idle_callee_rejects() {
    let callee = spawn_peer(Arc::default()).await;
    let caller = spawn_peer(Arc::default()).await;
    let spec = callee.listen_addr().to_string();
    caller.add_remote(RemotePeer::new(&spec).unwrap()).unwrap();

    let err = caller.negotiate().unwrap().wait().await.unwrap_err();
    assert!(
        matches!(err, NegotiationError::HandshakeRejected { peer, .. } if peer == callee.listen_addr())
    );
    assert_eq!(caller.state(), LocalState::FAILED | LocalState::IS_NEGOTIATOR);
    assert_eq!(callee.state(), LocalState::STOPPED);
}

#[tokio::test]
async fn test_silent_listener_times_out() {
    // Accepts the connection, reads the offer, never answers.
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = silent.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        let offer = lines.next_line().await.unwrap().unwrap();
        assert!(matches!(
            HandshakeMessage::decode_line(&offer).unwrap(),
            HandshakeMessage::CALL_OFFER { .. }
        ));
        std::future::pending::<()>().await;
    });

    let caller = spawn_peer(Arc::default()).await;
    caller
        .add_remote(RemotePeer::new(&silent_addr.to_string()).unwrap())
        .unwrap();

    let err = caller.negotiate().unwrap().wait().await.unwrap_err();
    assert_eq!(err, NegotiationError::HandshakeTimeout(silent_addr));
    assert!(caller.is_terminal());
}

#[tokio::test]
async fn test_unreachable_peer_is_transport_error() {
    // Bind then drop to get a port nobody listens on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let caller = spawn_peer(Arc::default()).await;
    caller
        .add_remote(RemotePeer::new(&addr.to_string()).unwrap())
        .unwrap();

    let err = caller.negotiate().unwrap().wait().await.unwrap_err();
    assert!(matches!(err, NegotiationError::Transport { peer, .. } if peer == addr));
}

/// Send one raw offer and return the callee's answer.
async fn offer_from_raw_client(to: SocketAddr, version: u16, call_id: Uuid) -> HandshakeMessage {
    let stream = TcpStream::connect(to).await.unwrap();
    let (read, mut write) = stream.into_split();
    let offer = HandshakeMessage::CALL_OFFER {
        version,
        call_id,
        listen_port: 6000,
    };
    write
        .write_all(offer.encode_line().unwrap().as_bytes())
        .await
        .unwrap();

    let mut lines = BufReader::new(read).lines();
    let reply = timeout(Duration::from_secs(5), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    HandshakeMessage::decode_line(&reply).unwrap()
}

#[tokio::test]
async fn test_unknown_protocol_version_is_rejected() {
    let callee = spawn_peer(Arc::default()).await;
    let waiting = callee.negotiate().unwrap();

    let call_id = Uuid::new_v4();
    let reply = offer_from_raw_client(callee.listen_addr(), PROTOCOL_VERSION + 1, call_id).await;
    match reply {
        HandshakeMessage::CALL_REJECT { call_id: id, reason } => {
            assert_eq!(id, call_id);
            assert!(reason.contains("version"), "{reason}");
        }
        other => panic!("expected CALL_REJECT, got {other:?}"),
    }

    // The offer never reached the negotiation.
    assert_eq!(callee.state(), LocalState::NEGOTIATING);
    assert!(callee.remotes().is_empty());
    callee.stop().await;
    assert_eq!(waiting.wait().await, Err(NegotiationError::Cancelled));
}

#[tokio::test]
async fn test_second_offer_rejected_while_call_admitted() {
    let callee = spawn_peer(Arc::default()).await;
    let waiting = callee.negotiate().unwrap();

    let first: SocketAddr = "127.0.0.1:6001".parse().unwrap();
    let ticket = callee.admit_inbound(first).unwrap();

    let call_id = Uuid::new_v4();
    let reply = offer_from_raw_client(callee.listen_addr(), PROTOCOL_VERSION, call_id).await;
    assert!(
        matches!(reply, HandshakeMessage::CALL_REJECT { call_id: id, .. } if id == call_id),
        "{reply:?}"
    );

    ticket.complete(Ok(()));
    assert_eq!(waiting.wait().await, Ok(()));
    let remotes = callee.remotes();
    assert_eq!(remotes.len(), 1);
    assert_eq!(remotes[0].addr(), first);
    callee.stop().await;
}

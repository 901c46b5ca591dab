//! Negotiation coordinator.
//!
//! One attempt fans a handshake out to every registered remote, joins the
//! per-peer results and settles on a single verdict. The first failure
//! observed wins; the handshakes still in flight are then abandoned and
//! drained before the verdict is published.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::NegotiationError;
use crate::local::LocalPeer;
use crate::registry::Target;
use crate::remote::RemotePeer;
use crate::transport::{CallOffer, HandshakeReply};

pub(crate) type Verdict = Result<(), NegotiationError>;

/// Completion of one negotiation attempt. Resolves exactly once.
#[derive(Debug)]
pub struct NegotiationHandle {
    id: Uuid,
    done: oneshot::Receiver<Verdict>,
}

impl NegotiationHandle {
    pub(crate) fn new(id: Uuid, done: oneshot::Receiver<Verdict>) -> Self {
        Self { id, done }
    }

    /// Attempt id, also used as the call id on the wire.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn wait(self) -> Result<(), NegotiationError> {
        self.done.await.unwrap_or_else(|_| {
            Err(NegotiationError::TaskFailed(
                "negotiation task ended without a verdict".to_string(),
            ))
        })
    }
}

/// Everything the coordinator task needs for one attempt.
pub(crate) struct Attempt {
    pub(crate) id: Uuid,
    pub(crate) targets: Vec<Target>,
    pub(crate) cancel: CancellationToken,
    pub(crate) finished: CancellationToken,
    /// Set for a passive attempt: resolved by the inbound responder.
    pub(crate) inbound: Option<oneshot::Receiver<Verdict>>,
}

#[derive(Debug, Default)]
struct Tally {
    pending: usize,
    succeeded: usize,
    failed: usize,
    abandoned: usize,
}

#[derive(Debug)]
enum TargetOutcome {
    Connected,
    Failed(NegotiationError),
    Abandoned,
}

pub(crate) async fn drive(local: Arc<LocalPeer>, attempt: Attempt, done: oneshot::Sender<Verdict>) {
    let Attempt {
        id,
        targets,
        cancel,
        finished,
        inbound,
    } = attempt;

    let verdict = match inbound {
        Some(inbound) => await_inbound(inbound, &cancel).await,
        None => fan_out(&local, id, targets, &cancel).await,
    };
    let verdict = local.finish_attempt(id, &cancel, verdict);

    match &verdict {
        Ok(()) => info!("negotiation {} succeeded", id),
        Err(NegotiationError::Cancelled) => info!("negotiation {} cancelled", id),
        Err(e) => warn!("negotiation {} failed: {}", id, e),
    }

    finished.cancel();
    let _ = done.send(verdict);
}

async fn await_inbound(inbound: oneshot::Receiver<Verdict>, cancel: &CancellationToken) -> Verdict {
    debug!("waiting for an inbound call");
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(NegotiationError::Cancelled),
        verdict = inbound => verdict.unwrap_or(Err(NegotiationError::Cancelled)),
    }
}

async fn fan_out(
    local: &Arc<LocalPeer>,
    call_id: Uuid,
    targets: Vec<Target>,
    cancel: &CancellationToken,
) -> Verdict {
    let offer = CallOffer {
        call_id,
        listen_addr: local.listen_addr(),
    };
    let abandon = cancel.child_token();

    let mut tasks = JoinSet::new();
    for target in targets {
        tasks.spawn(handshake_target(
            Arc::clone(local),
            target,
            offer,
            abandon.clone(),
        ));
    }

    let mut tally = Tally {
        pending: tasks.len(),
        ..Default::default()
    };
    info!(%call_id, peers = tally.pending, "dialling remotes");

    let mut first_failure = None;
    while let Some(joined) = tasks.join_next().await {
        tally.pending -= 1;
        let outcome = joined.unwrap_or_else(|e| {
            TargetOutcome::Failed(NegotiationError::TaskFailed(e.to_string()))
        });
        match outcome {
            TargetOutcome::Connected => tally.succeeded += 1,
            TargetOutcome::Abandoned => tally.abandoned += 1,
            TargetOutcome::Failed(err) => {
                tally.failed += 1;
                if first_failure.is_none() {
                    debug!("{}; abandoning {} pending handshake(s)", err, tally.pending);
                    abandon.cancel();
                    first_failure = Some(err);
                }
            }
        }
    }

    debug!(
        %call_id,
        succeeded = tally.succeeded,
        failed = tally.failed,
        abandoned = tally.abandoned,
        "handshakes drained"
    );

    match first_failure {
        Some(err) => Err(err),
        None if cancel.is_cancelled() => Err(NegotiationError::Cancelled),
        None => Ok(()),
    }
}

async fn handshake_target(
    local: Arc<LocalPeer>,
    target: Target,
    offer: CallOffer,
    abandon: CancellationToken,
) -> TargetOutcome {
    let Target { peer, removed } = target;
    let (id, addr) = (peer.id(), peer.addr());
    let registry = local.registry();

    if !registry.update(id, RemotePeer::mark_negotiating) {
        return TargetOutcome::Failed(NegotiationError::PeerRemoved(addr));
    }

    let deadline = local.config().handshake_timeout;
    let outcome = tokio::select! {
        biased;
        _ = abandon.cancelled() => TargetOutcome::Abandoned,
        _ = removed.cancelled() => TargetOutcome::Failed(NegotiationError::PeerRemoved(addr)),
        reply = time::timeout(deadline, local.transport().send_handshake(&peer, &offer)) => {
            classify(addr, reply)
        }
    };
    debug!("handshake with {}: {:?}", addr, outcome);

    let recorded = match &outcome {
        TargetOutcome::Connected => registry.update(id, RemotePeer::mark_connected),
        TargetOutcome::Failed(err) => registry.update(id, |p| p.mark_failed(err.clone())),
        TargetOutcome::Abandoned => {
            registry.update(id, RemotePeer::mark_pending);
            true
        }
    };
    if !recorded {
        return TargetOutcome::Failed(NegotiationError::PeerRemoved(addr));
    }
    outcome
}

fn classify(
    addr: SocketAddr,
    reply: Result<Result<HandshakeReply, crate::transport::TransportError>, time::error::Elapsed>,
) -> TargetOutcome {
    match reply {
        Err(_) => TargetOutcome::Failed(NegotiationError::HandshakeTimeout(addr)),
        Ok(Ok(HandshakeReply::Accepted)) => TargetOutcome::Connected,
        Ok(Ok(HandshakeReply::Rejected(reason))) => {
            TargetOutcome::Failed(NegotiationError::HandshakeRejected { peer: addr, reason })
        }
        Ok(Err(e)) => TargetOutcome::Failed(NegotiationError::Transport {
            peer: addr,
            message: e.to_string(),
        }),
    }
}

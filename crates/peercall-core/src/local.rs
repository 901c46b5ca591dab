//! The local peer: call state owner for this process.
//!
//! The local peer owns the registry of remote peers, the call state flags and
//! the single in-flight negotiation attempt. Flag changes follow these rules:
//!
//! - `negotiate` clears `STOPPED`, `FAILED` and `IS_NEGOTIATOR`, then sets
//!   `NEGOTIATING` (plus `IS_NEGOTIATOR` when there are remotes to dial).
//! - The attempt's completion clears `NEGOTIATING` and sets `STOPPED` on
//!   success or cancellation, `FAILED` on failure. With `auto_start`, success
//!   goes straight to `STARTED`.
//! - `start` needs `STOPPED` without `FAILED`; `stop` is always allowed.
//!
//! Lock order is attempt slot, then session lifecycle. Every change to
//! `STARTED` happens under the lifecycle lock together with the matching
//! pipeline call.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::LocalPeerConfig;
use crate::error::{CallError, NegotiationError};
use crate::negotiate::{self, Attempt, NegotiationHandle, Verdict};
use crate::registry::PeerRegistry;
use crate::remote::{PeerId, RemotePeer};
use crate::session::{PipelineError, SessionContext, SessionController, SessionPipeline};
use crate::state::{LocalState, StateCell};
use crate::transport::HandshakeTransport;

/// Bookkeeping for the attempt currently in flight.
struct ActiveAttempt {
    id: Uuid,
    cancel: CancellationToken,
    finished: CancellationToken,
    /// Present while a passive attempt has not admitted an inbound call yet.
    inbound: Option<oneshot::Sender<Verdict>>,
}

pub struct LocalPeer {
    config: LocalPeerConfig,
    state: StateCell,
    registry: PeerRegistry,
    transport: Arc<dyn HandshakeTransport>,
    session: SessionController,
    attempt: Mutex<Option<ActiveAttempt>>,
    lifecycle: Mutex<()>,
    last_error: Mutex<Option<String>>,
}

impl LocalPeer {
    pub fn new(
        config: LocalPeerConfig,
        transport: Arc<dyn HandshakeTransport>,
        pipeline: Arc<dyn SessionPipeline>,
    ) -> Self {
        Self {
            config,
            state: StateCell::new(LocalState::STOPPED),
            registry: PeerRegistry::new(),
            transport,
            session: SessionController::new(pipeline),
            attempt: Mutex::new(None),
            lifecycle: Mutex::new(()),
            last_error: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &LocalPeerConfig {
        &self.config
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.config.listen_addr
    }

    pub fn device(&self) -> Option<&str> {
        self.config.device.as_deref()
    }

    pub fn state(&self) -> LocalState {
        self.state.load()
    }

    /// Whether the process may exit: `STOPPED`, or an initiator that failed.
    /// Never blocks and has no side effects.
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// The error behind the most recent `FAILED`, if any.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    pub(crate) fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub(crate) fn transport(&self) -> &dyn HandshakeTransport {
        self.transport.as_ref()
    }

    pub fn add_remote(&self, remote: RemotePeer) -> Result<PeerId, CallError> {
        self.registry.add(remote)
    }

    /// Remove a remote (e.g. on hangup). Removing the last remote of a
    /// started call ends the session.
    pub fn remove_remote(&self, id: PeerId) -> Option<RemotePeer> {
        let peer = self.registry.remove(id)?;
        let _session = lock(&self.lifecycle);
        if self.registry.is_empty() && self.state().contains(LocalState::STARTED) {
            info!("last remote {} left; ending session", peer.addr());
            if let Err(e) = self.end_session("end session") {
                debug!("session teardown skipped: {}", e);
            }
        }
        Some(peer)
    }

    pub fn remotes(&self) -> Vec<RemotePeer> {
        self.registry.snapshot()
    }

    pub fn remote(&self, id: PeerId) -> Option<RemotePeer> {
        self.registry.get(id)
    }

    /// Start a negotiation attempt with every registered remote, or wait for
    /// an inbound call when there are none.
    ///
    /// With `auto_start`, a successful attempt launches the session before
    /// the verdict is delivered. If the pipeline refuses to start, the
    /// verdict stays `Ok` and the failure shows up as `FAILED` in
    /// [`LocalPeer::state`] and in [`LocalPeer::last_error`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn negotiate(self: &Arc<Self>) -> Result<NegotiationHandle, CallError> {
        let mut slot = lock(&self.attempt);
        let targets = self.registry.targets();
        let initiator = !targets.is_empty();

        self.state.transition("negotiate", |s| {
            if s.intersects(LocalState::NEGOTIATING | LocalState::STARTED) {
                return None;
            }
            let mut next = (s
                - (LocalState::STOPPED | LocalState::FAILED | LocalState::IS_NEGOTIATOR))
                | LocalState::NEGOTIATING;
            next.set(LocalState::IS_NEGOTIATOR, initiator);
            Some(next)
        })?;
        *lock(&self.last_error) = None;

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let (inbound_tx, inbound_rx) = if initiator {
            (None, None)
        } else {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        };
        *slot = Some(ActiveAttempt {
            id,
            cancel: cancel.clone(),
            finished: finished.clone(),
            inbound: inbound_tx,
        });
        drop(slot);

        if initiator {
            info!("negotiation {}: dialling {} remote(s)", id, targets.len());
        } else {
            info!("negotiation {}: no remotes, listening for an inbound call", id);
        }

        let (done_tx, done_rx) = oneshot::channel();
        let attempt = Attempt {
            id,
            targets,
            cancel,
            finished,
            inbound: inbound_rx,
        };
        tokio::spawn(negotiate::drive(Arc::clone(self), attempt, done_tx));

        Ok(NegotiationHandle::new(id, done_rx))
    }

    /// Like [`LocalPeer::negotiate`], invoking `on_done` exactly once with the
    /// verdict.
    pub fn negotiate_async<F>(self: &Arc<Self>, on_done: F) -> Result<Uuid, CallError>
    where
        F: FnOnce(Result<(), NegotiationError>) + Send + 'static,
    {
        let handle = self.negotiate()?;
        let id = handle.id();
        tokio::spawn(async move { on_done(handle.wait().await) });
        Ok(id)
    }

    /// Cancel the attempt in flight. Its verdict will be `Cancelled`, whatever
    /// the remotes answered. Returns false if nothing was in flight.
    pub fn negotiate_stop(&self) -> bool {
        match lock(&self.attempt).as_ref() {
            Some(attempt) => {
                debug!("cancelling negotiation {}", attempt.id);
                attempt.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Publish the outcome of an attempt onto the state flags.
    pub(crate) fn finish_attempt(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
        verdict: Verdict,
    ) -> Verdict {
        let mut slot = lock(&self.attempt);
        let _session = lock(&self.lifecycle);
        let verdict = if cancel.is_cancelled() {
            Err(NegotiationError::Cancelled)
        } else {
            verdict
        };

        let result = match &verdict {
            Ok(()) if self.config.auto_start => self
                .state
                .transition("start", |s| {
                    Some((s - LocalState::NEGOTIATING) | LocalState::STARTED)
                })
                .map(|_| true),
            Ok(()) | Err(NegotiationError::Cancelled) => self
                .state
                .transition("finish negotiation", |s| {
                    Some((s - LocalState::NEGOTIATING) | LocalState::STOPPED)
                })
                .map(|_| false),
            Err(e) => {
                *lock(&self.last_error) = Some(e.to_string());
                self.state
                    .transition("fail negotiation", |s| {
                        Some((s - LocalState::NEGOTIATING) | LocalState::FAILED)
                    })
                    .map(|_| false)
            }
        };

        match result {
            Ok(true) => {
                if let Err(e) = self.launch_session() {
                    warn!("negotiation {} succeeded but the session did not start: {}", id, e);
                }
            }
            Ok(false) => {}
            Err(e) => error!("negotiation {} left inconsistent state: {}", id, e),
        }

        if slot.as_ref().is_some_and(|a| a.id == id) {
            *slot = None;
        }
        verdict
    }

    /// Admit an inbound call into the passive attempt in flight.
    ///
    /// Only a passive, negotiating peer that has not admitted a call yet
    /// accepts; the caller replies to the initiator and then completes the
    /// returned ticket.
    pub fn admit_inbound(self: &Arc<Self>, from: SocketAddr) -> Result<InboundTicket, CallError> {
        let mut slot = lock(&self.attempt);
        let busy = || CallError::InvalidState {
            op: "accept an inbound call",
            state: self.state(),
        };
        let attempt = slot.as_mut().ok_or_else(busy)?;
        let tx = attempt.inbound.take().ok_or_else(busy)?;
        debug!("negotiation {}: admitted inbound call from {}", attempt.id, from);

        Ok(InboundTicket {
            local: Arc::clone(self),
            attempt_id: attempt.id,
            from,
            tx: Some(tx),
        })
    }

    fn complete_inbound(
        &self,
        attempt_id: Uuid,
        from: SocketAddr,
        tx: oneshot::Sender<Verdict>,
        verdict: Verdict,
    ) {
        let slot = lock(&self.attempt);
        let live = slot
            .as_ref()
            .is_some_and(|a| a.id == attempt_id && !a.cancel.is_cancelled());
        if !live {
            debug!("inbound call from {} finished after its negotiation ended", from);
            return;
        }
        if verdict.is_ok() {
            self.register_inbound(from);
        }
        let _ = tx.send(verdict);
    }

    fn register_inbound(&self, from: SocketAddr) {
        let id = match self.registry.find_by_addr(from) {
            Some(existing) => existing.id(),
            None => match self.registry.add(RemotePeer::from_addr(from)) {
                Ok(id) => id,
                Err(e) => {
                    warn!("could not register inbound peer {}: {}", from, e);
                    return;
                }
            },
        };
        self.registry.update(id, RemotePeer::mark_connected);
    }

    /// `STOPPED -> STARTED`. Refused while negotiating or after a failure.
    pub fn start(&self) -> Result<(), CallError> {
        let _session = lock(&self.lifecycle);
        let (prev, _) = self.state.transition("start", |s| {
            if s.contains(LocalState::STARTED) {
                Some(s)
            } else if s.contains(LocalState::STOPPED) && !s.contains(LocalState::FAILED) {
                Some((s - LocalState::STOPPED) | LocalState::STARTED)
            } else {
                None
            }
        })?;
        if prev.contains(LocalState::STARTED) {
            return Ok(());
        }
        self.launch_session()
    }

    /// Caller holds the lifecycle lock and has just set `STARTED`.
    fn launch_session(&self) -> Result<(), CallError> {
        let ctx = self.session_context();
        self.session.launch(&ctx).map_err(|e| {
            self.fail_session(&e);
            CallError::Pipeline(e)
        })
    }

    /// Report a pipeline failure that happened while the call was running.
    /// The session is torn down and the peer ends `STOPPED | FAILED`.
    pub fn report_session_failure(&self, err: PipelineError) {
        warn!("session pipeline failed: {}", err);
        let _session = lock(&self.lifecycle);
        if self.state().contains(LocalState::STARTED) {
            self.registry.drain();
        }
        self.fail_session(&err);
    }

    fn fail_session(&self, err: &PipelineError) {
        *lock(&self.last_error) = Some(err.to_string());
        let failed = self.state.transition("fail session", |s| {
            if s.contains(LocalState::NEGOTIATING) {
                return None;
            }
            Some((s - LocalState::STARTED) | LocalState::STOPPED | LocalState::FAILED)
        });
        if let Err(e) = failed {
            debug!("pipeline failure not applied: {}", e);
        }
    }

    /// Stop the call from any state. Cancels a negotiation in flight and
    /// waits for it to settle, stops the pipeline, hangs up every remote and
    /// leaves `STOPPED` set. Idempotent.
    pub async fn stop(&self) {
        loop {
            let finished = lock(&self.attempt).as_ref().map(|attempt| {
                attempt.cancel.cancel();
                attempt.finished.clone()
            });
            if let Some(finished) = finished {
                finished.cancelled().await;
            }
            // A new attempt may have started while we waited; go around again.
            if self.shutdown_session("stop").is_ok() {
                return;
            }
        }
    }

    /// Entry point for the process-exit path; same as [`LocalPeer::stop`].
    pub async fn force_stop(&self) {
        self.stop().await
    }

    fn shutdown_session(&self, op: &'static str) -> Result<(), CallError> {
        let _session = lock(&self.lifecycle);
        self.end_session(op)
    }

    /// Caller holds the lifecycle lock.
    fn end_session(&self, op: &'static str) -> Result<(), CallError> {
        let ctx = self.session_context();
        let (prev, _) = self.state.transition(op, |s| {
            if s.contains(LocalState::NEGOTIATING) {
                return None;
            }
            Some((s - LocalState::STARTED) | LocalState::STOPPED)
        })?;

        if prev.contains(LocalState::STARTED) {
            if let Err(e) = self.session.teardown(&ctx) {
                *lock(&self.last_error) = Some(e.to_string());
                let _ = self.state.transition(op, |s| Some(s | LocalState::FAILED));
            }
        }

        let hung_up = self.registry.drain();
        if !hung_up.is_empty() {
            info!("hung up {} remote(s)", hung_up.len());
        }
        Ok(())
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            listen_addr: self.config.listen_addr,
            device: self.config.device.clone(),
            remotes: self.registry.snapshot(),
        }
    }
}

impl Drop for LocalPeer {
    fn drop(&mut self) {
        if let Some(attempt) = lock(&self.attempt).take() {
            attempt.cancel.cancel();
        }
        let left = self.registry.drain();
        if !left.is_empty() {
            debug!("dropped local peer with {} remote(s) still registered", left.len());
        }
    }
}

/// An inbound call admitted into a passive negotiation.
///
/// Dropping the ticket without completing it fails the attempt.
pub struct InboundTicket {
    local: Arc<LocalPeer>,
    attempt_id: Uuid,
    from: SocketAddr,
    tx: Option<oneshot::Sender<Verdict>>,
}

impl InboundTicket {
    /// Address of the initiator (its IP and advertised listen port).
    pub fn from(&self) -> SocketAddr {
        self.from
    }

    /// Conclude the inbound handshake. On success the initiator is
    /// registered as a connected remote.
    pub fn complete(mut self, verdict: Result<(), NegotiationError>) {
        if let Some(tx) = self.tx.take() {
            self.local
                .complete_inbound(self.attempt_id, self.from, tx, verdict);
        }
    }
}

impl Drop for InboundTicket {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let verdict = Err(NegotiationError::Transport {
                peer: self.from,
                message: "inbound handshake abandoned".to_string(),
            });
            self.local
                .complete_inbound(self.attempt_id, self.from, tx, verdict);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

//! peercall: dial a set of peers (or wait to be called), negotiate the call
//! with all of them, then run the session until it ends.

#![forbid(unsafe_code)]

mod config;
mod pipeline;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use peercall_core::{serve_inbound, LocalPeer, NegotiationHandle, RemotePeer, TcpTransport};
use tokio::net::TcpListener;
use tokio::time;
use tracing::{debug, error, info, warn};

use config::Args;
use pipeline::LoggingPipeline;

/// How often the exit watcher checks for a terminal call state.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    peercall_common::init_tracing_with_default(&args.log_level);

    let config = args.local_config()?;
    let listener = TcpListener::bind(config.listen_addr).await?;
    let local = Arc::new(LocalPeer::new(
        config,
        Arc::new(TcpTransport::new()),
        Arc::new(LoggingPipeline),
    ));
    if let Some(device) = local.device() {
        info!("capture device: {}", device);
    }
    let responder = tokio::spawn(serve_inbound(listener, local.clone()));

    let passive = if args.peers.is_empty() {
        info!("No remotes specified; listening for incoming calls");
        let first = local.negotiate()?;
        Some(tokio::spawn(answer_calls(local.clone(), first)))
    } else {
        info!("Dialling remotes...");
        dial_remotes(&local, &args.peers)?;
        info!("Waiting for remotes to reply...");
        None
    };

    wait_for_exit(&local, args.exit_after(), tokio::signal::ctrl_c()).await;

    if let Some(task) = passive {
        task.abort();
    }
    responder.abort();
    if let Some(err) = local.last_error() {
        debug!("last error: {}", err);
    }
    info!("exiting in state {:?}", local.state());
    Ok(())
}

fn dial_remotes(local: &Arc<LocalPeer>, specs: &[String]) -> Result<()> {
    for spec in specs {
        match RemotePeer::new(spec).and_then(|remote| local.add_remote(remote)) {
            Ok(id) => debug!("Created and added remote peer {} ({})", spec, id),
            Err(e) => warn!("skipping peer '{}': {}", spec, e),
        }
    }
    if local.remotes().is_empty() {
        bail!("none of the given peers could be added");
    }

    local.negotiate_async(|verdict| match verdict {
        Ok(()) => info!("All remotes have replied."),
        Err(e) => match e.peer() {
            Some(peer) => error!(%peer, "negotiation failed: {}", e),
            None => error!("negotiation failed: {}", e),
        },
    })?;
    Ok(())
}

/// Keep a passive peer answering until a call is set up or cancelled. A
/// failed inbound call leaves the peer listening for the next one.
async fn answer_calls(local: Arc<LocalPeer>, first: NegotiationHandle) {
    let mut waiting = first;
    loop {
        match waiting.wait().await {
            Ok(()) => {
                info!("Inbound call set up");
                return;
            }
            Err(e) if e.is_cancelled() => return,
            Err(e) => warn!("inbound call failed: {}", e),
        }
        waiting = match local.negotiate() {
            Ok(handle) => handle,
            Err(e) => {
                debug!("not listening again: {}", e);
                return;
            }
        };
    }
}

/// Return once the call reaches a terminal state. `interrupt` (Ctrl-C) and
/// the optional exit timer force a stop first.
async fn wait_for_exit<F>(local: &LocalPeer, exit_after: Option<Duration>, interrupt: F)
where
    F: Future,
{
    let exit_timer = time::sleep(exit_after.unwrap_or_default());
    tokio::pin!(exit_timer);
    let mut timer_armed = exit_after.is_some();

    tokio::pin!(interrupt);
    let mut interrupted = false;

    let mut poll = time::interval(EXIT_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = &mut interrupt, if !interrupted => {
                interrupted = true;
                info!("interrupted; stopping");
                local.force_stop().await;
            }
            _ = &mut exit_timer, if timer_armed => {
                timer_armed = false;
                info!("exit timer elapsed; stopping");
                local.force_stop().await;
            }
            _ = poll.tick() => {}
        }
        if local.is_terminal() {
            return;
        }
    }
}

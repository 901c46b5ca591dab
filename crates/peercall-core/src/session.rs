//! Session lifecycle: starts and stops the media pipeline around a call.
//!
//! The pipeline itself (capture, encode, transport) lives outside this crate
//! and is reached through [`SessionPipeline`].

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::remote::RemotePeer;

/// Error reported by the pipeline collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PipelineError(pub String);

impl PipelineError {
    pub fn new(msg: impl std::fmt::Display) -> Self {
        Self(msg.to_string())
    }
}

/// What the pipeline needs to know about the call it is asked to run.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub listen_addr: SocketAddr,
    pub device: Option<String>,
    pub remotes: Vec<RemotePeer>,
}

/// The audio/video pipeline collaborator.
///
/// Both calls are made while call state is being updated; implementations
/// must return promptly and must not call back into the local peer.
pub trait SessionPipeline: Send + Sync {
    fn start_session(&self, ctx: &SessionContext) -> Result<(), PipelineError>;
    fn stop_session(&self, ctx: &SessionContext) -> Result<(), PipelineError>;
}

pub(crate) struct SessionController {
    pipeline: Arc<dyn SessionPipeline>,
}

impl SessionController {
    pub(crate) fn new(pipeline: Arc<dyn SessionPipeline>) -> Self {
        Self { pipeline }
    }

    pub(crate) fn launch(&self, ctx: &SessionContext) -> Result<(), PipelineError> {
        info!(
            "starting session on {} with {} remote(s)",
            ctx.listen_addr,
            ctx.remotes.len()
        );
        self.pipeline.start_session(ctx).inspect_err(|e| {
            warn!("session pipeline failed to start: {}", e);
        })
    }

    pub(crate) fn teardown(&self, ctx: &SessionContext) -> Result<(), PipelineError> {
        info!("stopping session on {}", ctx.listen_addr);
        self.pipeline.stop_session(ctx).inspect_err(|e| {
            warn!("session pipeline failed to stop cleanly: {}", e);
        })
    }
}

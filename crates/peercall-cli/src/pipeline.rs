//! Stand-in media pipeline: the call is negotiated for real, the session
//! itself is only logged.

use peercall_core::{PipelineError, SessionContext, SessionPipeline};
use tracing::info;

pub struct LoggingPipeline;

impl SessionPipeline for LoggingPipeline {
    fn start_session(&self, ctx: &SessionContext) -> Result<(), PipelineError> {
        let remotes: Vec<String> = ctx.remotes.iter().map(|r| r.addr().to_string()).collect();
        info!(
            "session started: device={} remotes=[{}]",
            ctx.device.as_deref().unwrap_or("default"),
            remotes.join(", ")
        );
        Ok(())
    }

    fn stop_session(&self, ctx: &SessionContext) -> Result<(), PipelineError> {
        info!("session stopped ({} remote(s))", ctx.remotes.len());
        Ok(())
    }
}

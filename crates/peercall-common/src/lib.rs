//! Shared utilities for peercall: logging, error types, handshake messages.
//!
//! This crate provides common infrastructure used by the call-setup core and
//! the command-line program.

#![forbid(unsafe_code)]

pub mod error;
pub mod protocol;

pub use error::{Error, Result};
pub use protocol::*;

/// Initialize tracing.
///
/// `RUST_LOG` wins when set; otherwise `default_level` is used as the filter.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

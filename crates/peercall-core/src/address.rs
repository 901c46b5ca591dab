//! Peer specifier parsing: `host` or `host:port`.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::error::CallError;

/// Well-known negotiation port, used when a specifier omits the port.
pub const DEFAULT_COMM_PORT: u16 = 5000;

/// Resolve a `host[:port]` specifier to a socket address.
///
/// IPv6 literals must be bracketed when a port is given (`[::1]:5000`).
/// Hostnames are resolved through the system resolver and the first result
/// wins.
pub fn parse_peer_spec(spec: &str) -> Result<SocketAddr, CallError> {
    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return Err(CallError::address(spec, "empty specifier"));
    }

    if let Ok(addr) = trimmed.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    if let Ok(ip) = unbracketed.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_COMM_PORT));
    }

    let (host, port) = match trimmed.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| CallError::address(spec, format!("invalid port '{port}'")))?;
            (host, port)
        }
        None => (trimmed, DEFAULT_COMM_PORT),
    };
    if host.is_empty() || host.contains(':') {
        return Err(CallError::address(spec, "malformed host"));
    }

    (host, port)
        .to_socket_addrs()
        .map_err(|e| CallError::address(spec, e))?
        .next()
        .ok_or_else(|| CallError::address(spec, "host did not resolve"))
}

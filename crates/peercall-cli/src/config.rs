//! Command-line options and the local peer configuration built from them.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use peercall_common::{Error, Result};
use peercall_core::{LocalPeerConfig, DEFAULT_COMM_PORT};

#[derive(Parser, Debug)]
#[command(name = "peercall")]
#[command(about = "Peer-to-peer low-latency call setup")]
pub struct Args {
    /// Exit cleanly after N seconds (default: never exit)
    #[arg(long, value_name = "SECONDS")]
    pub exit_after: Option<u64>,

    /// Network interface to listen on (default: any)
    #[arg(short, long, value_name = "NAME")]
    pub interface: Option<String>,

    /// TCP port to listen on for incoming calls
    #[arg(short, long, default_value_t = DEFAULT_COMM_PORT)]
    pub port: u16,

    /// Peer with an optional port to call. Repeat to call several peers.
    #[arg(short = 'c', long = "peer", value_name = "PEER:PORT")]
    pub peers: Vec<String>,

    /// Capture device to use (e.g. /dev/video0)
    #[arg(short, long, value_name = "PATH")]
    pub device: Option<String>,

    /// Seconds each peer has to answer the handshake
    #[arg(long, env = "PEERCALL_HANDSHAKE_TIMEOUT", default_value_t = 5)]
    pub handshake_timeout: u64,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn exit_after(&self) -> Option<Duration> {
        self.exit_after
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn local_config(&self) -> Result<LocalPeerConfig> {
        if self.handshake_timeout == 0 {
            return Err(Error::config("handshake timeout must be at least one second"));
        }

        let ip = match &self.interface {
            Some(name) => interface_addr(name)?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let mut config = LocalPeerConfig::new(SocketAddr::new(ip, self.port));
        config.device = self.device.clone();
        config.handshake_timeout = Duration::from_secs(self.handshake_timeout);
        config.auto_start = true;
        Ok(config)
    }
}

/// Address of the named interface, preferring IPv4.
fn interface_addr(name: &str) -> Result<IpAddr> {
    let interfaces = local_ip_address::list_afinet_netifas()
        .map_err(|e| Error::config(format!("listing network interfaces: {e}")))?;
    pick_interface_addr(name, &interfaces)
        .ok_or_else(|| Error::config(format!("no address found for interface '{name}'")))
}

fn pick_interface_addr(name: &str, interfaces: &[(String, IpAddr)]) -> Option<IpAddr> {
    let mut candidates = interfaces
        .iter()
        .filter(|(iface, _)| iface == name)
        .map(|(_, ip)| *ip);
    let first = candidates.next()?;
    if first.is_ipv4() {
        return Some(first);
    }
    Some(candidates.find(IpAddr::is_ipv4).unwrap_or(first))
}

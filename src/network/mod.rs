//! Network module - Handles the station side of vehicle links
//!
//! Provides:
//! - Framed connections and station-side sessions
//! - The rendezvous dispatcher that hands each vehicle its own port
//! - The peer side of the rendezvous handshake
//! - The station side of pairing

mod connection;
mod dispatcher;
mod pairing;
mod ports;
mod rendezvous;
mod session;

pub use connection::*;
pub use dispatcher::*;
pub use pairing::*;
pub use rendezvous::*;
pub use session::*;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::protocol::{Dialect, DEFAULT_RENDEZVOUS_PORT};

/// Configuration of an operational session
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Wire dialect, both ends must agree
    pub dialect: Dialect,
    /// Refill attempts before a command fails with no response
    pub response_attempts: u32,
    /// How long one refill attempt waits for data
    pub attempt_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::Sequential,
            response_attempts: 10,
            attempt_timeout: Duration::from_millis(200),
        }
    }
}

/// Configuration of the rendezvous dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Address to bind the rendezvous and dedicated ports on
    pub bind_address: IpAddr,
    /// Well-known rendezvous port
    pub rendezvous_port: u16,
    /// First dedicated port to try
    pub dedicated_port_base: u16,
    /// Number of ports tried from the base
    pub dedicated_port_count: u16,
    /// How long a redirected vehicle has to reach its dedicated port
    pub handoff_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            rendezvous_port: DEFAULT_RENDEZVOUS_PORT,
            dedicated_port_base: DEFAULT_RENDEZVOUS_PORT + 1,
            dedicated_port_count: 256,
            handoff_timeout: Duration::from_millis(1000),
        }
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    };
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

//! Dedicated port allocation
//!
//! Port selection and bind happen under one lock so concurrent handoffs are
//! never offered the same port.

use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

/// Hands out dedicated listening ports
#[derive(Debug)]
pub struct PortAllocator {
    bind_address: IpAddr,
    base: u16,
    count: u16,
    leased: Mutex<BTreeSet<u16>>,
}

/// A bound dedicated port; the port is released when the lease is dropped
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    listener: Option<std::net::TcpListener>,
    allocator: Arc<PortAllocator>,
}

impl PortAllocator {
    pub fn new(bind_address: IpAddr, base: u16, count: u16) -> Arc<Self> {
        Arc::new(Self {
            bind_address,
            base,
            count,
            leased: Mutex::new(BTreeSet::new()),
        })
    }

    /// Bind the first free port in the range starting at the base
    ///
    /// Ports already leased or already bound by someone else are skipped.
    /// Binding blocks, so async callers go through the blocking pool.
    pub fn allocate(self: &Arc<Self>) -> io::Result<PortLease> {
        let mut leased = self
            .leased
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "port allocator poisoned"))?;

        let first = self.base.max(1);
        let last = first.saturating_add(self.count.max(1) - 1);
        for port in first..=last {
            if leased.contains(&port) {
                continue;
            }
            match std::net::TcpListener::bind(SocketAddr::new(self.bind_address, port)) {
                Ok(listener) => {
                    listener.set_nonblocking(true)?;
                    leased.insert(port);
                    tracing::debug!("Leased dedicated port {}", port);
                    return Ok(PortLease {
                        port,
                        listener: Some(listener),
                        allocator: self.clone(),
                    });
                }
                Err(e) => {
                    tracing::debug!("Port {} unavailable: {}", port, e);
                }
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("No free dedicated port in {}..={}", first, last),
        ))
    }

    /// Ports currently leased
    pub fn leased(&self) -> Vec<u16> {
        self.leased
            .lock()
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn release(&self, port: u16) {
        if let Ok(mut leased) = self.leased.lock() {
            leased.remove(&port);
            tracing::debug!("Released dedicated port {}", port);
        }
    }
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Take the bound listener for accepting the handoff
    ///
    /// The port stays leased until the lease itself is dropped.
    pub fn take_listener(&mut self) -> io::Result<TcpListener> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "listener already taken"))?;
        TcpListener::from_std(listener)
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        // Close the socket before the port can be offered again
        self.listener.take();
        self.allocator.release(self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    fn allocator() -> Arc<PortAllocator> {
        // Bind an ephemeral port to find a likely-free range
        let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = free.local_addr().unwrap().port();
        drop(free);
        PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST), base, 64)
    }

    #[tokio::test]
    async fn test_concurrent_leases_are_distinct() {
        let ports = allocator();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let ports = ports.clone();
            tasks.push(tokio::task::spawn_blocking(move || ports.allocate().unwrap()));
        }

        let mut leases = Vec::new();
        for task in tasks {
            leases.push(task.await.unwrap());
        }
        let distinct: HashSet<u16> = leases.iter().map(PortLease::port).collect();
        assert_eq!(distinct.len(), leases.len());
        assert_eq!(ports.leased().len(), leases.len());
    }

    #[tokio::test]
    async fn test_released_port_is_reused() {
        let ports = allocator();
        let first = ports.allocate().unwrap();
        let port = first.port();
        drop(first);
        assert!(ports.leased().is_empty());

        let second = ports.allocate().unwrap();
        assert_eq!(second.port(), port);
    }

    #[test]
    fn test_skips_ports_bound_elsewhere() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let ports = PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, 64);

        let lease = ports.allocate().unwrap();
        assert_ne!(lease.port(), port);
        assert!(lease.port() > port);
    }

    #[test]
    fn test_search_stops_at_range_end() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let ports = PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, 1);

        let err = ports.allocate().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
        assert!(ports.leased().is_empty());
    }
}

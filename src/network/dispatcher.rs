//! Rendezvous dispatcher
//!
//! Vehicles first connect to one well-known port. Each is handed a dedicated
//! port and the connection made there becomes its session. Every handoff runs
//! on its own task so a slow vehicle never blocks the accept loop.

use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use uuid::Uuid;

use super::connection::Connection;
use super::ports::{PortAllocator, PortLease};
use super::session::SessionHandle;
use super::{DispatcherConfig, SessionConfig};
use crate::protocol::handshake::RENDEZVOUS_MARKER;

/// Dispatcher errors
#[derive(Error, Debug)]
pub enum DispatcherError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dispatcher already running")]
    AlreadyRunning,

    #[error("Dispatcher not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Peer did not echo the liveness marker")]
    BadMarker,

    #[error("Vehicle never connected to dedicated port {0}")]
    HandoffTimeout(u16),
}

pub type DispatcherResult<T> = Result<T, DispatcherError>;

/// Roster identifier of a connected vehicle
pub type VehicleId = Uuid;

/// Roster updates for the presentation layer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RosterEvent {
    /// Rendezvous port is listening
    Started { bind_addr: SocketAddr },
    /// A vehicle completed its handoff and has a session
    VehicleConnected {
        id: VehicleId,
        addr: SocketAddr,
        port: u16,
    },
    /// A vehicle's session ended
    VehicleDisconnected { id: VehicleId, reason: String },
    /// A redirected vehicle never arrived on its dedicated port
    HandoffTimedOut { port: u16 },
    /// Dispatcher stopped
    Stopped,
    /// Error occurred
    Error { message: String },
}

/// A vehicle on the roster
#[derive(Debug, Clone)]
pub struct VehicleInfo {
    pub id: VehicleId,
    /// Address the session connection came from
    pub addr: SocketAddr,
    /// Dedicated port the session runs on
    pub port: u16,
    /// Handle for issuing commands
    pub handle: SessionHandle,
}

type Roster = Arc<RwLock<HashMap<VehicleId, VehicleInfo>>>;

/// Rendezvous dispatcher
///
/// Only one may run per station process since it owns the rendezvous port.
pub struct Dispatcher {
    config: DispatcherConfig,
    session_config: SessionConfig,
    roster: Roster,
    ports: Arc<PortAllocator>,
    event_tx: mpsc::Sender<RosterEvent>,
    event_rx: Option<mpsc::Receiver<RosterEvent>>,
    closing: Option<watch::Sender<bool>>,
    running: Arc<RwLock<bool>>,
    local_addr: Option<SocketAddr>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, session_config: SessionConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let ports = PortAllocator::new(
            config.bind_address,
            config.dedicated_port_base,
            config.dedicated_port_count,
        );

        Self {
            config,
            session_config,
            roster: Arc::new(RwLock::new(HashMap::new())),
            ports,
            event_tx,
            event_rx: Some(event_rx),
            closing: None,
            running: Arc::new(RwLock::new(false)),
            local_addr: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<RosterEvent>> {
        self.event_rx.take()
    }

    /// Address the rendezvous port is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Start accepting vehicles
    pub async fn start(&mut self) -> DispatcherResult<()> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(DispatcherError::AlreadyRunning);
            }
        }

        let bind_addr = SocketAddr::new(self.config.bind_address, self.config.rendezvous_port);
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            DispatcherError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        tracing::info!("Rendezvous listening on {}", local_addr);

        let (closing_tx, closing_rx) = watch::channel(false);
        self.closing = Some(closing_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let _ = self
            .event_tx
            .send(RosterEvent::Started {
                bind_addr: local_addr,
            })
            .await;

        let ctx = HandoffContext {
            config: self.config.clone(),
            session_config: self.session_config,
            roster: self.roster.clone(),
            ports: self.ports.clone(),
            event_tx: self.event_tx.clone(),
            closing: closing_rx,
        };
        let running = self.running.clone();
        let mut closing = ctx.closing.clone();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("Rendezvous from {}", addr);
                                let ctx = ctx.clone();
                                tokio::spawn(async move {
                                    match ctx.handle_rendezvous(stream, addr).await {
                                        Ok(()) => {}
                                        Err(e @ DispatcherError::Io(_)) => {
                                            tracing::warn!("Rendezvous with {} failed: {}", addr, e);
                                            let _ = ctx.event_tx.send(RosterEvent::Error {
                                                message: format!("{}: {}", addr, e),
                                            }).await;
                                        }
                                        Err(e) => {
                                            tracing::warn!("Rendezvous with {} failed: {}", addr, e);
                                        }
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = stopped(&mut closing) => {
                        tracing::info!("Dispatcher shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;

            let _ = ctx.event_tx.send(RosterEvent::Stopped).await;
        });

        Ok(())
    }

    /// Stop accepting vehicles and end every session
    pub async fn stop(&mut self) -> DispatcherResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(DispatcherError::NotRunning);
            }
        }

        // Handoffs still waiting on a dedicated port see this too
        if let Some(closing) = self.closing.take() {
            closing.send_replace(true);
        }

        let roster = self.roster.read().await;
        for vehicle in roster.values() {
            vehicle.handle.shutdown();
        }

        Ok(())
    }

    /// Vehicles currently on the roster, ordered by dedicated port
    pub async fn vehicles(&self) -> Vec<VehicleInfo> {
        let roster = self.roster.read().await;
        let mut vehicles: Vec<VehicleInfo> = roster.values().cloned().collect();
        vehicles.sort_by_key(|v| v.port);
        vehicles
    }

    /// Look up one vehicle
    pub async fn vehicle(&self, id: &VehicleId) -> Option<VehicleInfo> {
        let roster = self.roster.read().await;
        roster.get(id).cloned()
    }

    /// Dedicated ports currently leased
    pub fn leased_ports(&self) -> Vec<u16> {
        self.ports.leased()
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// State shared by every handoff task
#[derive(Clone)]
struct HandoffContext {
    config: DispatcherConfig,
    session_config: SessionConfig,
    roster: Roster,
    ports: Arc<PortAllocator>,
    event_tx: mpsc::Sender<RosterEvent>,
    closing: watch::Receiver<bool>,
}

/// Resolves once the dispatcher has been stopped
async fn stopped(closing: &mut watch::Receiver<bool>) {
    if closing.wait_for(|closed| *closed).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl HandoffContext {
    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Redirect one rendezvous connection and run the resulting session
    async fn handle_rendezvous(&self, stream: TcpStream, addr: SocketAddr) -> DispatcherResult<()> {
        let mut lease = tokio::time::timeout(self.config.handoff_timeout, self.redirect(stream))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "liveness handshake timed out")
            })??;
        let port = lease.port();
        let listener = lease.take_listener()?;
        tracing::info!("Directed vehicle {} to port {}", addr, port);

        let mut closing = self.closing.clone();
        let accepted = tokio::select! {
            accepted = tokio::time::timeout(self.config.handoff_timeout, listener.accept()) => accepted,
            _ = stopped(&mut closing) => {
                tracing::info!("Dispatcher stopped before vehicle {} reached port {}", addr, port);
                return Ok(());
            }
        };
        drop(listener);

        let (stream, peer) = match accepted {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                let _ = self.event_tx.send(RosterEvent::HandoffTimedOut { port }).await;
                return Err(DispatcherError::HandoffTimeout(port));
            }
        };
        stream.set_nodelay(true)?;

        self.run_session(stream, peer, lease).await;
        Ok(())
    }

    /// Liveness exchange, port lease, and redirect
    async fn redirect(&self, mut stream: TcpStream) -> DispatcherResult<PortLease> {
        stream.write_all(&RENDEZVOUS_MARKER).await?;

        let mut echo = [0u8; 2];
        stream.read_exact(&mut echo).await?;
        if echo != RENDEZVOUS_MARKER {
            return Err(DispatcherError::BadMarker);
        }

        let ports = self.ports.clone();
        let lease = tokio::task::spawn_blocking(move || ports.allocate())
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))??;
        stream.write_all(&lease.port().to_be_bytes()).await?;
        stream.shutdown().await?;
        Ok(lease)
    }

    /// Keep the vehicle on the roster for the lifetime of its session
    async fn run_session(&self, stream: TcpStream, peer: SocketAddr, lease: PortLease) {
        if self.is_closing() {
            tracing::info!("Dispatcher stopped, dropping vehicle {}", peer);
            return;
        }

        let id = Uuid::new_v4();
        let port = lease.port();
        let conn = Connection::tcp(stream, self.session_config.dialect);
        let (handle, mut task) = SessionHandle::spawn(conn, self.session_config);

        {
            let mut roster = self.roster.write().await;
            roster.insert(
                id,
                VehicleInfo {
                    id,
                    addr: peer,
                    port,
                    handle: handle.clone(),
                },
            );
        }

        let _ = self
            .event_tx
            .send(RosterEvent::VehicleConnected {
                id,
                addr: peer,
                port,
            })
            .await;

        // stop() may have walked the roster before this entry was added
        let mut closing = self.closing.clone();
        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = stopped(&mut closing) => {
                handle.shutdown();
                task.await
            }
        };
        let reason = joined.unwrap_or_else(|e| format!("Session task failed: {}", e));

        {
            let mut roster = self.roster.write().await;
            roster.remove(&id);
        }
        drop(lease);

        let _ = self
            .event_tx
            .send(RosterEvent::VehicleDisconnected { id, reason })
            .await;
    }
}

//! Vehicle side of pairing
//!
//! A vehicle that has no station yet hosts a temporary network, waits for a
//! controller that knows its secret, takes the station's credentials, then
//! joins the station network and asks the dispatcher for a session.

use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::actuators::{NetworkClient, NetworkError, NetworkHost};
use crate::network::{request_session, resolve_host, RendezvousError};
use crate::protocol::handshake::{
    decode_text, FieldError, StationCredentials, AUTH_ACCEPTED, CREDENTIALS_ACK, PAIRING_MARKER,
    REJECTION_MARKER, SECRET_LEN,
};
use crate::protocol::DEFAULT_DISCOVERY_PORT;

#[derive(Error, Debug)]
pub enum PairingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Controller sent the wrong secret")]
    AuthenticationFailed,

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Field error: {0}")]
    Field(#[from] FieldError),

    #[error("Could not join the station network after {attempts} attempts")]
    JoinFailed { attempts: u32 },

    #[error("Rendezvous error: {0}")]
    Rendezvous(#[from] RendezvousError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

pub type PairingResult<T> = Result<T, PairingError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    Idle,
    Hosting,
    Authenticating,
    CredentialExchange,
    Joining,
    RendezvousHandshake,
    Operational,
    Failed,
}

/// Pairing timing and addressing
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// Address the discovery listener binds on
    pub bind_address: IpAddr,
    pub discovery_port: u16,
    /// Join and rendezvous attempts before giving up on a station
    pub join_attempts: u32,
    pub join_retry: Duration,
    /// Pause before hosting again after a failed pairing
    pub retry_delay: Duration,
    /// Bound on each controller exchange and each rendezvous attempt
    pub handshake_timeout: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            join_attempts: 5,
            join_retry: Duration::from_secs(2),
            retry_delay: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Credentials received from a controller
#[derive(Debug, Clone)]
pub struct PairingOffer {
    pub controller: SocketAddr,
    pub credentials: StationCredentials,
}

/// Pairing state machine
pub struct Pairing {
    network_name: String,
    secret: String,
    config: PairingConfig,
    host: Box<dyn NetworkHost>,
    client: Box<dyn NetworkClient>,
    hosting: bool,
    station: Option<SocketAddr>,
    state_tx: watch::Sender<PairingState>,
}

impl Pairing {
    pub fn new(
        network_name: impl Into<String>,
        secret: impl Into<String>,
        config: PairingConfig,
        host: Box<dyn NetworkHost>,
        client: Box<dyn NetworkClient>,
    ) -> Self {
        let (state_tx, _) = watch::channel(PairingState::Idle);
        Self {
            network_name: network_name.into(),
            secret: secret.into(),
            config,
            host,
            client,
            hosting: false,
            station: None,
            state_tx,
        }
    }

    pub fn state(&self) -> PairingState {
        *self.state_tx.borrow()
    }

    /// Rendezvous address of the station reached by the last pairing
    pub fn station(&self) -> Option<SocketAddr> {
        self.station
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<PairingState> {
        self.state_tx.subscribe()
    }

    fn transition(&self, state: PairingState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!("Pairing: {:?} -> {:?}", previous, state);
        }
    }

    /// Start the temporary network and open the discovery port
    pub async fn host(&mut self) -> PairingResult<TcpListener> {
        let (name, address) = self.host.start(&self.network_name).await?;
        self.hosting = true;

        let listener =
            TcpListener::bind(SocketAddr::new(self.config.bind_address, self.config.discovery_port))
                .await?;
        tracing::info!(
            "Hosting \"{}\", vehicle at {}, awaiting a controller on port {}",
            name,
            address,
            listener.local_addr()?.port()
        );
        self.transition(PairingState::Hosting);
        Ok(listener)
    }

    /// Wait for a controller that knows the secret and take its credentials
    ///
    /// Controllers that fail authentication are turned away and the listener
    /// keeps serving. Failures after authentication are returned.
    pub async fn await_controller(&mut self, listener: &TcpListener) -> PairingResult<PairingOffer> {
        loop {
            let (mut stream, controller) = listener.accept().await?;
            tracing::info!("Controller connected from {}", controller);
            self.transition(PairingState::Authenticating);

            let timeout = self.config.handshake_timeout;
            match tokio::time::timeout(timeout, self.authenticate(&mut stream)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Turned away controller {}: {}", controller, e);
                    self.transition(PairingState::Hosting);
                    continue;
                }
                Err(_) => {
                    tracing::warn!("Controller {} timed out during authentication", controller);
                    self.transition(PairingState::Hosting);
                    continue;
                }
            }

            self.transition(PairingState::CredentialExchange);
            let credentials = tokio::time::timeout(timeout, receive_credentials(&mut stream))
                .await
                .map_err(|_| PairingError::Handshake("credential exchange timed out".into()))??;

            tracing::info!(
                "Received credentials for \"{}\" (station {}:{})",
                credentials.network_name,
                credentials.address,
                credentials.rendezvous_port
            );
            return Ok(PairingOffer {
                controller,
                credentials,
            });
        }
    }

    /// Liveness check and secret verification
    ///
    /// On any rejection the controller gets the rejection marker and nothing
    /// else.
    pub async fn authenticate<S>(&self, stream: &mut S) -> PairingResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut marker = [0u8; 2];
        stream.read_exact(&mut marker).await?;
        if marker != PAIRING_MARKER {
            reject(stream).await?;
            return Err(PairingError::Handshake(format!(
                "unexpected liveness marker {:02x?}",
                marker
            )));
        }
        stream.write_all(&PAIRING_MARKER).await?;

        let mut field = [0u8; SECRET_LEN];
        stream.read_exact(&mut field).await?;
        let accepted = matches!(decode_text("secret", &field), Ok(secret) if secret == self.secret);
        if !accepted {
            reject(stream).await?;
            return Err(PairingError::AuthenticationFailed);
        }

        stream.write_all(&[AUTH_ACCEPTED]).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Leave the temporary network, join the station's and reach its dispatcher
    pub async fn connect_station(&mut self, offer: &PairingOffer) -> PairingResult<TcpStream> {
        self.stop_hosting().await;

        self.transition(PairingState::Joining);
        let credentials = &offer.credentials;
        tracing::info!(
            "Joining \"{}\" as directed by controller {}",
            credentials.network_name,
            offer.controller
        );
        let mut joined = false;
        for attempt in 1..=self.config.join_attempts {
            match self
                .client
                .join(&credentials.network_name, &credentials.network_secret)
                .await
            {
                Ok(()) => {
                    joined = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        "Join attempt {}/{} failed: {}",
                        attempt,
                        self.config.join_attempts,
                        e
                    );
                    tokio::time::sleep(self.config.join_retry).await;
                }
            }
        }
        if !joined {
            return Err(PairingError::JoinFailed {
                attempts: self.config.join_attempts,
            });
        }

        self.transition(PairingState::RendezvousHandshake);
        let station = resolve_host(&credentials.address, credentials.rendezvous_port).await?;
        let mut last_error = None;
        for attempt in 1..=self.config.join_attempts {
            match request_session(station, self.config.handshake_timeout).await {
                Ok(stream) => {
                    self.station = Some(station);
                    self.transition(PairingState::Operational);
                    tracing::info!("Session established with station {}", station);
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::warn!(
                        "Rendezvous attempt {}/{} with {} failed: {}",
                        attempt,
                        self.config.join_attempts,
                        station,
                        e
                    );
                    last_error = Some(e);
                    tokio::time::sleep(self.config.join_retry).await;
                }
            }
        }
        Err(last_error.map_or(
            PairingError::JoinFailed {
                attempts: self.config.join_attempts,
            },
            PairingError::from,
        ))
    }

    /// Pair and connect, starting over after every failure
    pub async fn run(&mut self) -> PairingResult<TcpStream> {
        loop {
            self.transition(PairingState::Idle);
            let listener = self.host().await?;

            let result = match self.await_controller(&listener).await {
                Ok(offer) => {
                    drop(listener);
                    self.connect_station(&offer).await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::error!("Pairing failed: {}", e);
                    self.transition(PairingState::Failed);
                    self.stop_hosting().await;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    async fn stop_hosting(&mut self) {
        if !self.hosting {
            return;
        }
        self.hosting = false;
        if let Err(e) = self.host.stop().await {
            tracing::warn!("Failed to stop the temporary network: {}", e);
        }
    }
}

async fn reject<S>(stream: &mut S) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&REJECTION_MARKER).await?;
    stream.shutdown().await
}

async fn receive_credentials<S>(stream: &mut S) -> PairingResult<StationCredentials>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let credentials = StationCredentials::read_from(stream).await?;
    stream.write_all(&CREDENTIALS_ACK).await?;
    stream.flush().await?;
    Ok(credentials)
}

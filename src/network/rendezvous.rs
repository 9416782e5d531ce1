//! Peer side of the rendezvous handshake
//!
//! A vehicle connects to the station's well-known port, echoes the liveness
//! marker, and is redirected to a dedicated port for its session.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::handshake::RENDEZVOUS_MARKER;

#[derive(Error, Debug)]
pub enum RendezvousError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected liveness marker {0:02x?}")]
    BadMarker([u8; 2]),

    #[error("Rendezvous timed out")]
    Timeout,
}

pub type RendezvousResult<T> = Result<T, RendezvousError>;

/// Run the rendezvous handshake and connect to the dedicated port
pub async fn request_session(
    rendezvous: SocketAddr,
    timeout: Duration,
) -> RendezvousResult<TcpStream> {
    let port = tokio::time::timeout(timeout, negotiate_port(rendezvous))
        .await
        .map_err(|_| RendezvousError::Timeout)??;

    let dedicated = SocketAddr::new(rendezvous.ip(), port);
    tracing::info!("Redirected to dedicated port {}", port);

    let stream = tokio::time::timeout(timeout, TcpStream::connect(dedicated))
        .await
        .map_err(|_| RendezvousError::Timeout)??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn negotiate_port(rendezvous: SocketAddr) -> RendezvousResult<u16> {
    let mut stream = TcpStream::connect(rendezvous).await?;

    let mut marker = [0u8; 2];
    stream.read_exact(&mut marker).await?;
    if marker != RENDEZVOUS_MARKER {
        return Err(RendezvousError::BadMarker(marker));
    }
    stream.write_all(&RENDEZVOUS_MARKER).await?;

    let port = stream.read_u16().await?;
    Ok(port)
}

//! Station side of pairing
//!
//! Connects to a vehicle's temporary network, proves the shared secret, and
//! hands over the credentials of the station's permanent network.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::handshake::{
    encode_text, FieldError, StationCredentials, AUTH_ACCEPTED, CREDENTIALS_ACK, PAIRING_MARKER,
    REJECTION_MARKER, SECRET_LEN,
};

#[derive(Error, Debug)]
pub enum PairError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Field error: {0}")]
    Field(#[from] FieldError),

    #[error("Vehicle rejected the shared secret")]
    AuthenticationFailed,

    #[error("Unexpected handshake bytes: {0:02x?}")]
    UnexpectedReply(Vec<u8>),

    #[error("Pairing timed out")]
    Timeout,
}

pub type PairResult<T> = Result<T, PairError>;

/// Push station credentials to a hosting vehicle
pub async fn pair_vehicle(
    vehicle: SocketAddr,
    secret: &str,
    credentials: &StationCredentials,
    timeout: Duration,
) -> PairResult<()> {
    tracing::info!("Pairing with vehicle at {}", vehicle);
    let pairing = async {
        let mut stream = TcpStream::connect(vehicle).await?;
        offer_credentials(&mut stream, secret, credentials).await
    };

    tokio::time::timeout(timeout, pairing)
        .await
        .map_err(|_| PairError::Timeout)??;

    tracing::info!(
        "Vehicle at {} accepted credentials for {}",
        vehicle,
        credentials.network_name
    );
    Ok(())
}

/// Controller half of the pairing exchange over any stream
pub async fn offer_credentials<S>(
    stream: &mut S,
    secret: &str,
    credentials: &StationCredentials,
) -> PairResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Encode everything up front so bad input never reaches the wire
    let secret_field = encode_text::<SECRET_LEN>("secret", secret)?;
    let credential_bytes = credentials.to_bytes()?;

    stream.write_all(&PAIRING_MARKER).await?;
    let mut echo = [0u8; 2];
    stream.read_exact(&mut echo).await?;
    if echo != PAIRING_MARKER {
        return Err(PairError::UnexpectedReply(echo.to_vec()));
    }

    stream.write_all(&secret_field).await?;
    match stream.read_u8().await? {
        AUTH_ACCEPTED => {}
        first if first == REJECTION_MARKER[0] => {
            let mut rest = [0u8; 3];
            stream.read_exact(&mut rest).await?;
            if rest == REJECTION_MARKER[1..] {
                return Err(PairError::AuthenticationFailed);
            }
            let mut reply = vec![first];
            reply.extend_from_slice(&rest);
            return Err(PairError::UnexpectedReply(reply));
        }
        other => return Err(PairError::UnexpectedReply(vec![other])),
    }

    stream.write_all(&credential_bytes).await?;
    stream.flush().await?;

    let mut ack = [0u8; 2];
    stream.read_exact(&mut ack).await?;
    if ack != CREDENTIALS_ACK {
        return Err(PairError::UnexpectedReply(ack.to_vec()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> StationCredentials {
        StationCredentials {
            network_name: "StationNet".to_string(),
            network_secret: "trackside".to_string(),
            address: "10.0.0.1".to_string(),
            rendezvous_port: 4000,
        }
    }

    #[tokio::test]
    async fn test_offer_credentials_accepted() {
        let mut secret = [0u8; SECRET_LEN];
        secret[..6].copy_from_slice(b"abc123");
        let wire = credentials().to_bytes().unwrap();
        let mut vehicle = tokio_test::io::Builder::new()
            .write(&PAIRING_MARKER)
            .read(&PAIRING_MARKER)
            .write(&secret)
            .read(&[AUTH_ACCEPTED])
            .write(&wire)
            .read(&CREDENTIALS_ACK)
            .build();

        offer_credentials(&mut vehicle, "abc123", &credentials())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_offer_credentials_rejected() {
        let mut secret = [0u8; SECRET_LEN];
        secret[..5].copy_from_slice(b"wrong");
        let mut vehicle = tokio_test::io::Builder::new()
            .write(&PAIRING_MARKER)
            .read(&PAIRING_MARKER)
            .write(&secret)
            .read(&REJECTION_MARKER)
            .build();

        let result = offer_credentials(&mut vehicle, "wrong", &credentials()).await;
        assert!(matches!(result, Err(PairError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn test_secret_too_long_sends_nothing() {
        let mut vehicle = tokio_test::io::Builder::new().build();
        let result = offer_credentials(&mut vehicle, "this secret is far too long", &credentials()).await;
        assert!(matches!(
            result,
            Err(PairError::Field(FieldError::FieldTooLong { .. }))
        ));
    }
}

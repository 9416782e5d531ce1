//! Handshake markers and fixed-width fields
//!
//! The rendezvous and pairing exchanges happen before any framed Session
//! exists, so they use raw markers and fixed-width text fields.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Rendezvous liveness marker (station → vehicle, echoed back)
pub const RENDEZVOUS_MARKER: [u8; 2] = [0x00, 0x00];

/// Pairing liveness marker (controller → vehicle, echoed back)
pub const PAIRING_MARKER: [u8; 2] = [0xFF, 0xFF];

/// Sent by the vehicle after a correct shared secret
pub const AUTH_ACCEPTED: u8 = 0xFF;

/// Sent by the vehicle before dropping a rejected controller
pub const REJECTION_MARKER: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];

/// Sent by the vehicle once the station credentials are received
pub const CREDENTIALS_ACK: [u8; 2] = [0xFF, 0xFF];

pub const SECRET_LEN: usize = 16;
pub const NETWORK_NAME_LEN: usize = 32;
pub const NETWORK_SECRET_LEN: usize = 16;
pub const ADDRESS_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum FieldError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{field} is {len} bytes, field holds {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{0} is not valid UTF-8")]
    MalformedField(&'static str),
}

pub type FieldResult<T> = Result<T, FieldError>;

/// Pad text to a fixed-width NUL-padded field
pub fn encode_text<const N: usize>(field: &'static str, text: &str) -> FieldResult<[u8; N]> {
    let bytes = text.as_bytes();
    if bytes.len() > N {
        return Err(FieldError::FieldTooLong {
            field,
            len: bytes.len(),
            max: N,
        });
    }
    let mut out = [0u8; N];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// Decode a fixed-width NUL-padded field
pub fn decode_text(field: &'static str, bytes: &[u8]) -> FieldResult<String> {
    let end = bytes
        .iter()
        .rposition(|b| *b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    std::str::from_utf8(&bytes[..end])
        .map(str::to_owned)
        .map_err(|_| FieldError::MalformedField(field))
}

/// Read a fixed-width text field from a stream
pub async fn read_text<const N: usize, R>(reader: &mut R, field: &'static str) -> FieldResult<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).await?;
    decode_text(field, &buf)
}

/// Credentials of the station's permanent network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationCredentials {
    pub network_name: String,
    pub network_secret: String,
    pub address: String,
    pub rendezvous_port: u16,
}

impl StationCredentials {
    pub const WIRE_LEN: usize = NETWORK_NAME_LEN + NETWORK_SECRET_LEN + ADDRESS_LEN + 2;

    /// Encode into the fixed-width wire layout
    pub fn to_bytes(&self) -> FieldResult<Vec<u8>> {
        let mut out = Vec::with_capacity(Self::WIRE_LEN);
        out.extend_from_slice(&encode_text::<NETWORK_NAME_LEN>("network name", &self.network_name)?);
        out.extend_from_slice(&encode_text::<NETWORK_SECRET_LEN>(
            "network secret",
            &self.network_secret,
        )?);
        out.extend_from_slice(&encode_text::<ADDRESS_LEN>("address", &self.address)?);
        out.extend_from_slice(&self.rendezvous_port.to_be_bytes());
        Ok(out)
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> FieldResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.to_bytes()?).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R>(reader: &mut R) -> FieldResult<Self>
    where
        R: AsyncRead + Unpin,
    {
        let network_name = read_text::<NETWORK_NAME_LEN, _>(reader, "network name").await?;
        let network_secret = read_text::<NETWORK_SECRET_LEN, _>(reader, "network secret").await?;
        let address = read_text::<ADDRESS_LEN, _>(reader, "address").await?;
        let rendezvous_port = reader.read_u16().await?;
        Ok(Self {
            network_name,
            network_secret,
            address,
            rendezvous_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_field_padding() {
        let field = encode_text::<SECRET_LEN>("secret", "hunter2").unwrap();
        assert_eq!(&field[..7], b"hunter2");
        assert!(field[7..].iter().all(|b| *b == 0));
        assert_eq!(decode_text("secret", &field).unwrap(), "hunter2");
    }

    #[test]
    fn test_text_field_too_long() {
        let err = encode_text::<4>("secret", "toolong").unwrap_err();
        assert!(matches!(err, FieldError::FieldTooLong { len: 7, max: 4, .. }));
    }

    #[test]
    fn test_malformed_text_field() {
        let err = decode_text("secret", &[0xC3, 0x28, 0, 0]).unwrap_err();
        assert!(matches!(err, FieldError::MalformedField("secret")));
    }

    #[tokio::test]
    async fn test_credentials_over_stream() {
        let credentials = StationCredentials {
            network_name: "StationNet".to_string(),
            network_secret: "s3cret".to_string(),
            address: "192.168.50.1".to_string(),
            rendezvous_port: 4000,
        };
        let bytes = credentials.to_bytes().unwrap();
        assert_eq!(bytes.len(), StationCredentials::WIRE_LEN);
        assert_eq!(&bytes[bytes.len() - 2..], &[0x0F, 0xA0]);

        let (mut a, mut b) = tokio::io::duplex(256);
        credentials.write_to(&mut a).await.unwrap();
        let received = StationCredentials::read_from(&mut b).await.unwrap();
        assert_eq!(received, credentials);
    }
}

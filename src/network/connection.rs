//! Framed connections
//!
//! Wraps a byte stream with:
//! - The frame codec for the link's dialect
//! - A receive buffer owned by this connection alone
//! - The link's conversation tracker

use bytes::BytesMut;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::{CodecError, ConversationTracker, Dialect, FrameCodec, Packet};

const READ_CHUNK: usize = 4096;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Garbage dropped while resynchronizing
    pub bytes_skipped: u64,
}

/// A framed connection to one peer
pub struct Connection<S = TcpStream> {
    peer: Option<SocketAddr>,
    stream: S,
    codec: FrameCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
    conversations: ConversationTracker,
    stats: ConnectionStats,
}

impl Connection<TcpStream> {
    /// Wrap an accepted or connected TCP stream
    pub fn tcp(stream: TcpStream, dialect: Dialect) -> Self {
        let peer = stream.peer_addr().ok();
        let mut conn = Self::new(stream, dialect);
        conn.peer = peer;
        conn
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, dialect: Dialect) -> Self {
        Self {
            peer: None,
            stream,
            codec: FrameCodec::new(dialect),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(64),
            conversations: ConversationTracker::new(),
            stats: ConnectionStats::default(),
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn dialect(&self) -> Dialect {
        self.codec.dialect()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn conversations(&mut self) -> &mut ConversationTracker {
        &mut self.conversations
    }

    /// Send a packet
    pub async fn send(&mut self, packet: &Packet) -> ConnectionResult<()> {
        self.write_buf.clear();
        self.codec.encode(packet, &mut self.write_buf)?;

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;
        Ok(())
    }

    /// Decode the next frame already in the receive buffer
    pub fn next_buffered(&mut self) -> Option<Packet> {
        let buffered = self.read_buf.len();
        let packet = self.codec.decode(&mut self.read_buf);
        let frame_len = packet
            .as_ref()
            .map_or(0, |p| self.codec.dialect().header_len() + p.payload().len());
        self.stats.bytes_skipped += (buffered - self.read_buf.len() - frame_len) as u64;

        let packet = packet?;
        self.stats.frames_received += 1;
        Some(packet)
    }

    /// Read once from the stream into the receive buffer
    ///
    /// Returns the number of bytes read, 0 on end of stream. Cancel safe.
    pub async fn fill(&mut self) -> ConnectionResult<usize> {
        self.read_buf.reserve(READ_CHUNK);
        let n = self.stream.read_buf(&mut self.read_buf).await?;
        self.stats.bytes_received += n as u64;
        Ok(n)
    }

    /// Receive the next frame (returns None on a clean close)
    pub async fn recv(&mut self) -> ConnectionResult<Option<Packet>> {
        loop {
            if let Some(packet) = self.next_buffered() {
                return Ok(Some(packet));
            }

            if self.fill().await? == 0 {
                return if self.read_buf.is_empty() {
                    Ok(None)
                } else {
                    Err(ConnectionError::Closed)
                };
            }
        }
    }

    /// Close the write half and forget all conversations
    pub async fn shutdown(&mut self) -> ConnectionResult<()> {
        self.conversations.close_all();
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketType;

    #[tokio::test]
    async fn test_send_and_recv_over_duplex() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = Connection::new(a, Dialect::Sequential);
        let mut right = Connection::new(b, Dialect::Sequential);

        let packet = Packet::new(PacketType::SetThrottle, vec![50]).unwrap();
        left.send(&packet).await.unwrap();
        assert_eq!(right.recv().await.unwrap(), Some(packet));
        assert_eq!(left.stats().frames_sent, 1);
        assert_eq!(right.stats().frames_received, 1);
    }

    #[tokio::test]
    async fn test_recv_across_split_reads() {
        let stream = tokio_test::io::Builder::new()
            .read(&[0x52, 0x46, 0x2D, 0x05])
            .read(&[0x00, 0x01])
            .read(&[0xD6])
            .build();
        let mut conn = Connection::new(stream, Dialect::Sequential);

        let packet = conn.recv().await.unwrap().unwrap();
        assert_eq!(packet.packet_type(), Some(PacketType::Acknowledge));
        assert_eq!(packet.payload().as_ref(), &[0xD6]);
        assert_eq!(conn.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_garbage_is_counted() {
        let stream = tokio_test::io::Builder::new()
            .read(&[0xAA, 0x52, 0xBB, 0x52, 0x46, 0x2D, 0x01, 0x00, 0x00])
            .build();
        let mut conn = Connection::new(stream, Dialect::Sequential);

        let packet = conn.recv().await.unwrap().unwrap();
        assert_eq!(packet.packet_type(), Some(PacketType::GetThrottle));
        assert_eq!(conn.stats().bytes_skipped, 3);
    }

    #[tokio::test]
    async fn test_truncated_frame_at_eof_is_an_error() {
        let stream = tokio_test::io::Builder::new()
            .read(&[0x52, 0x46, 0x2D, 0x05, 0x00])
            .build();
        let mut conn = Connection::new(stream, Dialect::Sequential);
        assert!(matches!(conn.recv().await, Err(ConnectionError::Closed)));
    }
}

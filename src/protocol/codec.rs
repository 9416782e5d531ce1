//! Frame codec for encoding/decoding packets
//!
//! Handles framing of packets on a byte stream, including resynchronization
//! after corrupted or missing bytes.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use super::{Dialect, Packet, PacketKind, PacketType, MAGIC_BYTES, MAX_PAYLOAD_LEN};

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Payload too large: {0} bytes (max: 65535)")]
    PayloadTooLarge(usize),

    #[error("{ty} cannot be sent in the {dialect} dialect")]
    UnsupportedType { ty: PacketType, dialect: Dialect },

    #[error("Unrecognized packet type {0:#04x} cannot be encoded")]
    UnknownType(u8),

    #[error("Correlated packet is missing its conversation id")]
    MissingConversation,

    #[error("Sequential packet must not carry a conversation id")]
    UnexpectedConversation,
}

/// Result of a decode attempt on a byte slice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A full frame; `consumed` covers it and any garbage skipped before it
    Frame { packet: Packet, consumed: usize },
    /// More bytes are needed; the leading `discard` bytes were garbage
    Incomplete { discard: usize },
}

/// Frame encoder/decoder for one dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    dialect: Dialect,
}

impl FrameCodec {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Encode a packet into a buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), CodecError> {
        let type_byte = match packet.kind() {
            PacketKind::Known(ty) => ty.to_wire(self.dialect).ok_or(CodecError::UnsupportedType {
                ty,
                dialect: self.dialect,
            })?,
            PacketKind::Unrecognized(value) => return Err(CodecError::UnknownType(value)),
        };

        let payload = packet.payload();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge(payload.len()));
        }

        let conversation = match (self.dialect, packet.conversation()) {
            (Dialect::Correlated, Some(id)) => Some(id),
            (Dialect::Correlated, None) => return Err(CodecError::MissingConversation),
            (Dialect::Sequential, Some(_)) => return Err(CodecError::UnexpectedConversation),
            (Dialect::Sequential, None) => None,
        };

        buf.reserve(self.dialect.header_len() + payload.len());
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u8(type_byte);
        if let Some(id) = conversation {
            buf.put_u32(id);
        }
        buf.put_u16(payload.len() as u16);
        buf.put_slice(payload);

        Ok(())
    }

    /// Encode a packet into a fresh byte vector
    pub fn encode_to_vec(&self, packet: &Packet) -> Result<Vec<u8>, CodecError> {
        let mut buf = BytesMut::new();
        self.encode(packet, &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Attempt to decode one frame from the front of `bytes`
    ///
    /// Never consumes part of a frame. Leading bytes that do not start with
    /// the magic are skipped one at a time.
    pub fn decode_slice(&self, bytes: &[u8]) -> Decoded {
        let header_len = self.dialect.header_len();
        let mut skipped = 0;

        loop {
            let rest = &bytes[skipped..];
            if rest.len() < header_len {
                return Decoded::Incomplete { discard: skipped };
            }

            if rest[..MAGIC_BYTES.len()] != MAGIC_BYTES {
                skipped += 1;
                continue;
            }

            let type_byte = rest[3];
            let (conversation, length_at) = if self.dialect.has_conversation() {
                let id = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
                (Some(id), 8)
            } else {
                (None, 4)
            };
            let length = u16::from_be_bytes([rest[length_at], rest[length_at + 1]]) as usize;

            if rest.len() < header_len + length {
                return Decoded::Incomplete { discard: skipped };
            }

            let kind = match PacketType::from_wire(self.dialect, type_byte) {
                Some(ty) => PacketKind::Known(ty),
                None => PacketKind::Unrecognized(type_byte),
            };
            let payload = bytes::Bytes::copy_from_slice(&rest[header_len..header_len + length]);

            // The length field caps the payload at MAX_PAYLOAD_LEN
            let packet = match Packet::from_parts(kind, conversation, payload) {
                Ok(packet) => packet,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };

            return Decoded::Frame {
                packet,
                consumed: skipped + header_len + length,
            };
        }
    }

    /// Attempt to decode a frame from a receive buffer
    ///
    /// Returns `None` if more data is needed. Garbage in front of the next
    /// frame is dropped from the buffer, partial frames are left in place.
    pub fn decode(&self, buf: &mut BytesMut) -> Option<Packet> {
        match self.decode_slice(buf) {
            Decoded::Frame { packet, consumed } => {
                let frame_len = self.dialect.header_len() + packet.payload().len();
                if consumed > frame_len {
                    tracing::debug!("Resynchronized after {} garbage bytes", consumed - frame_len);
                }
                buf.advance(consumed);
                Some(packet)
            }
            Decoded::Incomplete { discard } => {
                if discard > 0 {
                    tracing::debug!("Discarding {} bytes with no frame start", discard);
                    buf.advance(discard);
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::error_codes;

    fn sequential() -> FrameCodec {
        FrameCodec::new(Dialect::Sequential)
    }

    fn correlated() -> FrameCodec {
        FrameCodec::new(Dialect::Correlated)
    }

    #[test]
    fn test_set_light_wire_bytes() {
        let packet = Packet::new(PacketType::SetLight, vec![0x00, 0x01]).unwrap();
        let bytes = sequential().encode_to_vec(&packet).unwrap();
        assert_eq!(bytes, [0x52, 0x46, 0x2D, 0x02, 0x00, 0x02, 0x00, 0x01]);
    }

    #[test]
    fn test_correlated_wire_bytes() {
        let packet = Packet::correlated(PacketType::Acknowledge, 0x0102_0304, vec![0xD6]).unwrap();
        let bytes = correlated().encode_to_vec(&packet).unwrap();
        assert_eq!(
            bytes,
            [0x52, 0x46, 0x2D, 0x05, 0x01, 0x02, 0x03, 0x04, 0x00, 0x01, 0xD6]
        );
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let codec = correlated();
        let original = Packet::correlated(PacketType::GetLight, 42, vec![0x01]).unwrap();
        let mut buf = BytesMut::new();
        codec.encode(&original, &mut buf).unwrap();
        let encoded_len = buf.len();

        match codec.decode_slice(&buf) {
            Decoded::Frame { packet, consumed } => {
                assert_eq!(packet, original);
                assert_eq!(consumed, encoded_len);
            }
            other => panic!("Expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn test_multiple_frames() {
        let codec = sequential();
        let mut buf = BytesMut::new();
        let packets = vec![
            Packet::new(PacketType::SetThrottle, vec![(-42i8) as u8]).unwrap(),
            Packet::new(PacketType::GetThrottle, Vec::new()).unwrap(),
            Packet::error(error_codes::UNKNOWN_TYPE, "nope"),
        ];
        for packet in &packets {
            codec.encode(packet, &mut buf).unwrap();
        }

        for original in &packets {
            assert_eq!(codec.decode(&mut buf).as_ref(), Some(original));
        }
        assert!(buf.is_empty());
        assert_eq!(codec.decode(&mut buf), None);
    }

    #[test]
    fn test_resync_after_garbage_prefix() {
        let codec = sequential();
        let first = Packet::new(PacketType::SetLight, vec![0x01, 0x01]).unwrap();
        let second = Packet::new(PacketType::EStop, Vec::new()).unwrap();

        let mut buf = BytesMut::new();
        buf.put_u8(0x7F);
        codec.encode(&first, &mut buf).unwrap();
        codec.encode(&second, &mut buf).unwrap();

        match codec.decode_slice(&buf) {
            Decoded::Frame { packet, consumed } => {
                assert_eq!(packet, first);
                assert_eq!(consumed, 1 + 8);
            }
            other => panic!("Expected a frame, got {:?}", other),
        }

        assert_eq!(codec.decode(&mut buf), Some(first));
        assert_eq!(codec.decode(&mut buf), Some(second));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_resync_on_partial_magic() {
        // A truncated frame start ("RF") followed by a real frame
        let codec = sequential();
        let packet = Packet::new(PacketType::GetThrottle, Vec::new()).unwrap();
        let mut buf = BytesMut::from(&b"RF"[..]);
        codec.encode(&packet, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf), Some(packet));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_header_is_incomplete() {
        let codec = correlated();
        let packet = Packet::correlated(PacketType::GetThrottle, 2, Vec::new()).unwrap();
        let bytes = codec.encode_to_vec(&packet).unwrap();

        for cut in 0..bytes.len() {
            assert_eq!(
                codec.decode_slice(&bytes[..cut]),
                Decoded::Incomplete { discard: 0 },
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_short_payload_consumes_nothing() {
        let codec = sequential();
        let packet = Packet::new(PacketType::SetLight, vec![0x00, 0x01]).unwrap();
        let bytes = codec.encode_to_vec(&packet).unwrap();

        let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert_eq!(codec.decode(&mut buf), None);
        assert_eq!(buf.len(), bytes.len() - 1);

        buf.put_u8(bytes[bytes.len() - 1]);
        assert_eq!(codec.decode(&mut buf), Some(packet));
    }

    #[test]
    fn test_unrecognized_type_is_framed() {
        let codec = sequential();
        let bytes = [0x52, 0x46, 0x2D, 0x09, 0x00, 0x01, 0xAA];
        match codec.decode_slice(&bytes) {
            Decoded::Frame { packet, consumed } => {
                assert_eq!(packet.kind(), PacketKind::Unrecognized(0x09));
                assert_eq!(packet.payload().as_ref(), &[0xAA]);
                assert_eq!(consumed, bytes.len());
            }
            other => panic!("Expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_rejects_dialect_mismatch() {
        let end = Packet::correlated(PacketType::EndConversation, 4, Vec::new()).unwrap();
        assert!(matches!(
            sequential().encode_to_vec(&end.clone().with_conversation(None)),
            Err(CodecError::UnsupportedType { .. })
        ));
        let tagged = Packet::correlated(PacketType::Acknowledge, 4, Vec::new()).unwrap();
        assert!(matches!(
            sequential().encode_to_vec(&tagged),
            Err(CodecError::UnexpectedConversation)
        ));

        let ack = Packet::new(PacketType::Acknowledge, Vec::new()).unwrap();
        assert!(matches!(
            correlated().encode_to_vec(&ack),
            Err(CodecError::MissingConversation)
        ));
    }
}

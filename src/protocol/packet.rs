//! Packet definitions
//!
//! Defines the command packet types exchanged between the station and a vehicle.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::CodecError;

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Wire dialect of a link
///
/// Both dialects share one frame layout; the correlated dialect adds a
/// conversation id between the type and length fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// One request in flight at a time, no conversation field
    #[default]
    Sequential,
    /// Interleaved requests tagged with conversation ids
    Correlated,
}

impl Dialect {
    /// Fixed header size for this dialect
    pub fn header_len(self) -> usize {
        match self {
            Dialect::Sequential => 6,
            Dialect::Correlated => 10,
        }
    }

    pub fn has_conversation(self) -> bool {
        matches!(self, Dialect::Correlated)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Sequential => write!(f, "sequential"),
            Dialect::Correlated => write!(f, "correlated"),
        }
    }
}

/// Packet type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    SetThrottle,
    GetThrottle,
    SetLight,
    GetLight,
    EStop,
    Acknowledge,
    /// Retires a conversation id (correlated dialect only)
    EndConversation,
    Error,
}

impl PacketType {
    pub const ALL: [PacketType; 8] = [
        PacketType::SetThrottle,
        PacketType::GetThrottle,
        PacketType::SetLight,
        PacketType::GetLight,
        PacketType::EStop,
        PacketType::Acknowledge,
        PacketType::EndConversation,
        PacketType::Error,
    ];

    /// Wire value of this type in the given dialect
    pub fn to_wire(self, dialect: Dialect) -> Option<u8> {
        let value = match (self, dialect) {
            (PacketType::SetThrottle, _) => 0,
            (PacketType::GetThrottle, _) => 1,
            (PacketType::SetLight, _) => 2,
            (PacketType::GetLight, _) => 3,
            (PacketType::EStop, _) => 4,
            (PacketType::Acknowledge, _) => 5,
            (PacketType::EndConversation, Dialect::Sequential) => return None,
            (PacketType::EndConversation, Dialect::Correlated) => 6,
            (PacketType::Error, Dialect::Sequential) => 6,
            (PacketType::Error, Dialect::Correlated) => 7,
        };
        Some(value)
    }

    /// Look up a wire value in the given dialect
    pub fn from_wire(dialect: Dialect, value: u8) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.to_wire(dialect) == Some(value))
    }

    /// Whether this type opens a new exchange
    pub fn is_request(self) -> bool {
        matches!(
            self,
            PacketType::SetThrottle
                | PacketType::GetThrottle
                | PacketType::SetLight
                | PacketType::GetLight
                | PacketType::EStop
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketType::SetThrottle => "SET_THROTTLE",
            PacketType::GetThrottle => "GET_THROTTLE",
            PacketType::SetLight => "SET_LIGHT",
            PacketType::GetLight => "GET_LIGHT",
            PacketType::EStop => "E_STOP",
            PacketType::Acknowledge => "ACKNOWLEDGE",
            PacketType::EndConversation => "END_CONVERSATION",
            PacketType::Error => "ERROR",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Type field of a decoded packet
///
/// Framing does not require a known type, so unknown values are kept as-is
/// for the receiver to reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Known(PacketType),
    Unrecognized(u8),
}

impl PacketKind {
    pub fn known(self) -> Option<PacketType> {
        match self {
            PacketKind::Known(ty) => Some(ty),
            PacketKind::Unrecognized(_) => None,
        }
    }
}

impl From<PacketType> for PacketKind {
    fn from(ty: PacketType) -> Self {
        PacketKind::Known(ty)
    }
}

/// A single command packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketKind,
    conversation: Option<u32>,
    payload: Bytes,
}

impl Packet {
    /// Create a packet without a conversation id
    pub fn new(ty: PacketType, payload: impl Into<Bytes>) -> Result<Self, CodecError> {
        Self::build(PacketKind::Known(ty), None, payload.into())
    }

    /// Create a packet tagged with a conversation id
    pub fn correlated(
        ty: PacketType,
        conversation: u32,
        payload: impl Into<Bytes>,
    ) -> Result<Self, CodecError> {
        Self::build(PacketKind::Known(ty), Some(conversation), payload.into())
    }

    /// Create a packet from raw parts, as produced by the decoder
    pub fn from_parts(
        kind: PacketKind,
        conversation: Option<u32>,
        payload: impl Into<Bytes>,
    ) -> Result<Self, CodecError> {
        Self::build(kind, conversation, payload.into())
    }

    fn build(kind: PacketKind, conversation: Option<u32>, payload: Bytes) -> Result<Self, CodecError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            kind,
            conversation,
            payload,
        })
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Known packet type, if any
    pub fn packet_type(&self) -> Option<PacketType> {
        self.kind.known()
    }

    pub fn conversation(&self) -> Option<u32> {
        self.conversation
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The same packet re-tagged with another conversation id
    pub fn with_conversation(mut self, conversation: Option<u32>) -> Self {
        self.conversation = conversation;
        self
    }

    /// Build an error reply
    pub fn error(code: u8, message: &str) -> Self {
        let mut payload = Vec::with_capacity(1 + message.len());
        payload.push(code);
        payload.extend_from_slice(message.as_bytes());
        payload.truncate(MAX_PAYLOAD_LEN);
        Self {
            kind: PacketKind::Known(PacketType::Error),
            conversation: None,
            payload: payload.into(),
        }
    }

    /// Split an error payload into code and message
    pub fn error_details(&self) -> Option<(u8, String)> {
        if self.packet_type() != Some(PacketType::Error) {
            return None;
        }
        let (&code, rest) = self.payload.split_first()?;
        Some((code, String::from_utf8_lossy(rest).into_owned()))
    }
}

/// Error codes carried in ERROR payloads
pub mod error_codes {
    pub const UNKNOWN_TYPE: u8 = 1;
    pub const MALFORMED_PAYLOAD: u8 = 2;
    pub const OUT_OF_RANGE: u8 = 3;
    pub const ACTUATOR_FAILURE: u8 = 4;
    pub const UNKNOWN_CONVERSATION: u8 = 5;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values_are_pinned() {
        assert_eq!(PacketType::SetLight.to_wire(Dialect::Sequential), Some(2));
        assert_eq!(PacketType::Error.to_wire(Dialect::Sequential), Some(6));
        assert_eq!(PacketType::Error.to_wire(Dialect::Correlated), Some(7));
        assert_eq!(PacketType::EndConversation.to_wire(Dialect::Sequential), None);
        assert_eq!(PacketType::EndConversation.to_wire(Dialect::Correlated), Some(6));
    }

    #[test]
    fn test_from_wire_inverts_to_wire() {
        for dialect in [Dialect::Sequential, Dialect::Correlated] {
            for ty in PacketType::ALL {
                if let Some(value) = ty.to_wire(dialect) {
                    assert_eq!(PacketType::from_wire(dialect, value), Some(ty));
                }
            }
        }
        assert_eq!(PacketType::from_wire(Dialect::Sequential, 7), None);
        assert_eq!(PacketType::from_wire(Dialect::Correlated, 8), None);
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(
            Packet::new(PacketType::Acknowledge, payload),
            Err(CodecError::PayloadTooLarge(65536))
        ));
        assert!(Packet::new(PacketType::Acknowledge, vec![0u8; MAX_PAYLOAD_LEN]).is_ok());
    }

    #[test]
    fn test_error_details() {
        let packet = Packet::error(error_codes::OUT_OF_RANGE, "throttle 120");
        assert_eq!(
            packet.error_details(),
            Some((error_codes::OUT_OF_RANGE, "throttle 120".to_string()))
        );
    }
}

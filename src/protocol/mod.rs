//! Protocol module - Defines the RailFi wire formats
//!
//! Command frames use a small binary layout:
//! - 3 bytes magic (`RF-`)
//! - 1 byte packet type
//! - 4 bytes conversation id (big-endian, correlated dialect only)
//! - 2 bytes payload length (big-endian)
//! - Variable length payload
//!
//! The pairing and rendezvous handshakes use raw markers and fixed-width
//! fields instead of frames, see [`handshake`].

mod codec;
mod conversation;
pub mod handshake;
mod packet;

pub use codec::*;
pub use conversation::*;
pub use packet::*;

/// Magic bytes that open every frame
pub const MAGIC_BYTES: [u8; 3] = *b"RF-";

/// Well-known port the station's dispatcher listens on
pub const DEFAULT_RENDEZVOUS_PORT: u16 = 4000;

/// Port a hosting vehicle accepts pairing controllers on
pub const DEFAULT_DISCOVERY_PORT: u16 = 2000;

/// Prefix of the temporary network name a vehicle advertises
pub const NETWORK_NAME_PREFIX: &str = "RailFi";

/// Throttle values are signed percentages
pub const THROTTLE_RANGE: std::ops::RangeInclusive<i8> = -100..=100;

/// Light channel numbers
pub mod channels {
    pub const HEADLIGHT: u8 = 0;
    pub const REAR_LIGHT: u8 = 1;
    pub const COUNT: u8 = 2;
}

/// Build the advertised temporary network name for a vehicle
pub fn pairing_network_name(road_acronym: &str, loco_number: &str) -> String {
    format!("{}_{}_{}", NETWORK_NAME_PREFIX, road_acronym, loco_number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_network_name() {
        assert_eq!(pairing_network_name("USSC", "148"), "RailFi_USSC_148");
    }
}

//! Packet header codec.

use crate::core::constants::{KEY_GEN_HANDSHAKE, PACKET_HEADER_SIZE, PROTOCOL_VERSION};
use crate::core::error::WireError;

/// Header flag: the packet body is plaintext handshake traffic.
pub const FLAG_HANDSHAKE: u8 = 0x01;

const FLAG_MASK: u8 = FLAG_HANDSHAKE;

/// Packet header, authenticated as AEAD additional data.
///
/// Wire format (12 bytes):
/// ```text
/// +---------+--------+------------+--------------------+
/// | Version | Flags  | Key Gen    | Packet ID          |
/// | 1 byte  | 1 byte | 2 (LE16)   | 8 bytes (LE64)     |
/// +---------+--------+------------+--------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Format version.
    pub version: u8,
    /// The packet body is unencrypted handshake traffic.
    pub handshake: bool,
    /// Key generation the body is encrypted under
    /// ([`KEY_GEN_HANDSHAKE`] for plaintext packets).
    pub key_gen: u16,
    /// Per-generation monotonically increasing packet id.
    pub packet_id: u64,
}

impl PacketHeader {
    /// Header for an encrypted data packet.
    pub fn new(key_gen: u16, packet_id: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            handshake: false,
            key_gen,
            packet_id,
        }
    }

    /// Header for a plaintext handshake packet.
    pub fn handshake(packet_id: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            handshake: true,
            key_gen: KEY_GEN_HANDSHAKE,
            packet_id,
        }
    }

    /// Serialize to the 12-byte wire form.
    pub fn to_bytes(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = if self.handshake { FLAG_HANDSHAKE } else { 0 };
        buf[2..4].copy_from_slice(&self.key_gen.to_le_bytes());
        buf[4..12].copy_from_slice(&self.packet_id.to_le_bytes());
        buf
    }

    /// Parse from the wire, rejecting unknown versions and reserved flags.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(WireError::TooShort {
                expected: PACKET_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0] != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(bytes[0]));
        }
        let flags = bytes[1];
        if flags & !FLAG_MASK != 0 {
            return Err(WireError::InvalidFlags(flags));
        }
        Ok(Self {
            version: bytes[0],
            handshake: flags & FLAG_HANDSHAKE != 0,
            key_gen: u16::from_le_bytes([bytes[2], bytes[3]]),
            packet_id: u64::from_le_bytes(bytes[4..12].try_into().expect("length checked")),
        })
    }
}

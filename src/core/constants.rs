//! Protocol constants.
//!
//! Wire-format values are fixed by the protocol and MUST NOT be changed;
//! timing values are defaults that [`crate::SessionOptions`] can override.

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Protocol format version carried in every packet header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Packet header size: version (1) + flags (1) + key generation (2) +
/// packet id (8).
pub const PACKET_HEADER_SIZE: usize = 12;

/// Message container header size: type (2) + length (2).
pub const MESSAGE_HEADER_SIZE: usize = 4;

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// XChaCha20 nonce size.
pub const AEAD_NONCE_SIZE: usize = 24;

/// Symmetric session key size (XChaCha20-Poly1305).
pub const KEY_SIZE: usize = 32;

/// Session identifier size: creation timestamp (8) + random (8).
pub const SESSION_ID_SIZE: usize = 16;

/// X25519 ephemeral public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size.
pub const SIGNATURE_SIZE: usize = 64;

/// Handshake transcript hash size (Blake2s256).
pub const TRANSCRIPT_SIZE: usize = 32;

/// Key-exchange message body size: ephemeral public (32) + session id (16) +
/// transcript (32) + signature (64) + answers mode (1) + key generation (2).
pub const KEY_EXCHANGE_BODY_SIZE: usize =
    PUBLIC_KEY_SIZE + SESSION_ID_SIZE + TRANSCRIPT_SIZE + SIGNATURE_SIZE + 1 + 2;

/// Fragment header size: message id (4) + index (2) + total (2) +
/// original type (2).
pub const FRAGMENT_HEADER_SIZE: usize = 10;

/// Negotiation message body size: version (1) + payload size limit (4) +
/// flags (1).
pub const NEGOTIATION_BODY_SIZE: usize = 6;

/// Fixed per-packet overhead for a single contained message.
pub const PACKET_OVERHEAD: usize = PACKET_HEADER_SIZE + MESSAGE_HEADER_SIZE + AEAD_TAG_SIZE;

/// Key-generation sentinel marking plaintext handshake packets.
pub const KEY_GEN_HANDSHAKE: u16 = 0xFFFF;

/// Highest generation the key exchanger will negotiate; `0xFFFF` is the
/// handshake sentinel.
pub const MAX_KEY_GENERATION: u16 = 0xFFFE;

// =============================================================================
// KEY RING
// =============================================================================

/// Number of concurrently valid key slots (oldest, previous, current, newest).
pub const KEY_RING_SLOTS: usize = 4;

// =============================================================================
// SIZE DEFAULTS
// =============================================================================

/// Default per-packet plaintext payload limit when the transport gives no
/// MTU hint. Container lengths are 16-bit, so the limit never exceeds 65535.
pub const DEFAULT_PAYLOAD_SIZE_LIMIT: u32 = 8160;

/// Default cap on a single fragmented write (64 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1 << 26;

// =============================================================================
// TIMING DEFAULTS
// =============================================================================

/// Merge window used when `send_delay` is left to auto-tune.
pub const DEFAULT_SEND_DELAY: Duration = Duration::from_micros(200);

/// Default re-key cadence.
pub const DEFAULT_KEY_UPDATE_INTERVAL: Duration = Duration::from_secs(60);

/// Default handshake retransmit interval.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Handshake retransmit backoff multiplier.
pub const RETRY_BACKOFF: u32 = 2;

/// Handshake retransmit backoff cap, as a multiple of the retry interval.
pub const RETRY_BACKOFF_CAP: u32 = 8;

/// Negotiation retransmit attempts before giving up.
pub const NEGOTIATION_MAX_RETRIES: u32 = 10;

/// Send keepalive ping if idle for this long.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Partial fragment reassemblies older than this are evicted.
pub const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence of the fragment-table eviction sweep.
pub const FRAGMENT_GC_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// FAILURE THRESHOLDS
// =============================================================================

/// Default number of consecutive header-parse/decrypt failures tolerated
/// before the session errors out.
pub const DEFAULT_DECRYPT_FAIL_THRESHOLD: u64 = 32;

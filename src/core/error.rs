//! Error types, layered per subsystem.

use std::sync::Arc;

use thiserror::Error;

use crate::session::SessionState;

/// Errors produced by the frame codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Packet carries an unknown format version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Reserved header flag bits are set.
    #[error("invalid header flags: {0:#04x}")]
    InvalidFlags(u8),

    /// Buffer is too short for the structure being parsed.
    #[error("truncated input: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum required length.
        expected: usize,
        /// Length actually available.
        actual: usize,
    },

    /// A container length field points past the end of the packet.
    #[error("message length {length} overruns remaining {remaining} bytes")]
    LengthOverrun {
        /// Declared body length.
        length: usize,
        /// Bytes remaining in the buffer.
        remaining: usize,
    },

    /// Packet exceeds the session's packet size limit.
    #[error("packet of {size} bytes exceeds limit of {limit}")]
    PacketTooLarge {
        /// Observed packet size.
        size: usize,
        /// Session packet size limit.
        limit: usize,
    },
}

/// Errors in the cryptographic layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed under every candidate key slot.
    #[error("AEAD decryption failed (invalid tag or unknown key generation)")]
    DecryptionFailed,

    /// Handshake signature or transcript did not verify.
    #[error("handshake signature verification failed")]
    InvalidSignature,

    /// Key derivation failed (non-contributory DH or KDF error).
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// The key generation space is exhausted.
    #[error("key generation space exhausted")]
    GenerationExhausted,
}

/// Top-level session errors.
///
/// Cloneable so one flush result can fan out to every send token in a merge
/// slot; transport errors are therefore carried behind an `Arc`.
#[derive(Debug, Error, Clone)]
pub enum SessionError {
    /// `start` was called on a session that already left the `New` state.
    #[error("session already started")]
    AlreadyStarted,

    /// The session is closing or closed.
    #[error("session already closed")]
    AlreadyClosed,

    /// The operation was cancelled by session teardown.
    #[error("operation canceled")]
    Canceled,

    /// Payload exceeds the per-packet limit and fragmentation cannot help.
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooBig {
        /// Size of the rejected payload.
        size: usize,
        /// Applicable limit.
        limit: usize,
    },

    /// Too many consecutive packets failed to parse or decrypt.
    #[error("{0} sequential decrypt failures")]
    TooManyDecryptFails(u64),

    /// The peers' key-exchange answer modes are incompatible.
    #[error("key exchange answers-mode mismatch with peer")]
    AnswersModeMismatch,

    /// The peer's handshake signature did not verify.
    #[error("invalid handshake signature")]
    InvalidSignature,

    /// The peers speak different protocol versions.
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    ProtocolVersion {
        /// Our version.
        local: u8,
        /// The peer's version.
        remote: u8,
    },

    /// A message arrived that no subsystem or handler accepts.
    #[error("unexpected message type {0}")]
    UnexpectedMessage(u16),

    /// Parameter negotiation never completed.
    #[error("negotiation timed out")]
    NegotiationTimeout,

    /// A fragmented message was evicted before completion.
    #[error("fragment reassembly timed out")]
    FragmentTimeout,

    /// The caller's read buffer is smaller than the pending message.
    #[error("read buffer of {got} bytes too small for {needed}-byte message")]
    ShortBuffer {
        /// Message size.
        needed: usize,
        /// Caller buffer size.
        got: usize,
    },

    /// The peer closed the session (close-notify or transport EOF).
    #[error("peer closed the session")]
    PeerClosed,

    /// The operation requires an established session.
    #[error("session not ready: state is {0:?}")]
    NotReady(SessionState),

    /// Transport I/O error.
    #[error("transport error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    /// Cryptographic failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Frame codec failure.
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(Arc::new(err))
    }
}

impl SessionError {
    /// Whether this error terminates the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::TooManyDecryptFails(_)
                | SessionError::AnswersModeMismatch
                | SessionError::InvalidSignature
                | SessionError::ProtocolVersion { .. }
                | SessionError::NegotiationTimeout
                | SessionError::PeerClosed
                | SessionError::Io(_)
                | SessionError::Crypto(_)
                | SessionError::Wire(_)
        )
    }
}

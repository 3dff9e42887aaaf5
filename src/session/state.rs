//! Session lifecycle state and identifiers.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;

use crate::core::constants::SESSION_ID_SIZE;

/// Lifecycle state of a session.
///
/// The variants form a total order used by
/// [`wait_for_state`](crate::Session::wait_for_state): a session at a later
/// state satisfies a wait for any earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Created, not started.
    New,
    /// Pre-handshake parameter exchange in progress.
    Negotiating,
    /// First key exchange in progress.
    KeyExchanging,
    /// Keys installed; application traffic flows.
    Established,
    /// Teardown initiated; background tasks draining.
    Closing,
    /// All tasks joined; the session is inert.
    Closed,
}

/// Unique session identifier: creation time plus random tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    /// Creation timestamp, nanoseconds since the Unix epoch.
    pub created_at: u64,
    /// Random discriminator.
    pub random: u64,
}

impl SessionId {
    /// Generate an id for a session created now.
    pub fn generate() -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            created_at,
            random: OsRng.next_u64(),
        }
    }

    /// Serialize to the 16-byte wire form.
    pub fn to_bytes(self) -> [u8; SESSION_ID_SIZE] {
        let mut buf = [0u8; SESSION_ID_SIZE];
        buf[0..8].copy_from_slice(&self.created_at.to_le_bytes());
        buf[8..16].copy_from_slice(&self.random.to_le_bytes());
        buf
    }

    /// Rebuild from the wire form.
    pub fn from_bytes(bytes: &[u8; SESSION_ID_SIZE]) -> Self {
        Self {
            created_at: u64::from_le_bytes(bytes[0..8].try_into().expect("fixed size")),
            random: u64::from_le_bytes(bytes[8..16].try_into().expect("fixed size")),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}", self.created_at, self.random)
    }
}

//! # shroud
//!
//! An authenticated, encrypted, message-oriented bidirectional channel
//! layered over any packet transport (UDP socket, pipe, in-memory pair).
//!
//! Two endpoints, each holding a long-term Ed25519 [`Identity`], mutually
//! authenticate, negotiate forward-secret XChaCha20-Poly1305 session keys
//! via signed ephemeral X25519 exchanges (optionally mixed with a PSK), and
//! then exchange framed messages multiplexed over logical channels. The
//! engine provides:
//!
//! - **Coalescing sends**: small writes merge into one packet per send
//!   delay window, each acknowledged through a [`SendToken`].
//! - **Key rotation**: periodic re-keying into a four-slot key ring, with
//!   decryption tolerant of in-flight rotation.
//! - **Replay rejection**: per-generation monotonic packet ids.
//! - **Fragmentation**: payloads beyond the packet limit are split and
//!   reassembled transparently when enabled.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shroud::{packet_pipe, Identity, NopEventHandler, Session, SessionOptions};
//!
//! # async fn run() -> Result<(), shroud::SessionError> {
//! let alice = Identity::generate();
//! let bob = Identity::generate();
//! let (conn_a, conn_b) = packet_pipe(64);
//!
//! let sess_a = Session::new(
//!     alice.clone(),
//!     bob.peer_identity(),
//!     conn_a,
//!     Arc::new(NopEventHandler),
//!     SessionOptions::default(),
//! );
//! let sess_b = Session::new(
//!     bob,
//!     alice.peer_identity(),
//!     conn_b,
//!     Arc::new(NopEventHandler),
//!     SessionOptions::default(),
//! );
//! sess_a.start()?;
//! sess_b.start()?;
//!
//! sess_a.write(b"hello").await?;
//! let mut buf = [0u8; 16];
//! let n = sess_b.read(&mut buf).await?;
//! assert_eq!(&buf[..n], b"hello");
//!
//! sess_a.close_and_wait().await?;
//! sess_b.close_and_wait().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod core;
pub mod crypto;
pub mod session;
pub mod transport;
pub mod wire;

pub use crate::core::{
    AnswersMode, CryptoError, KeyExchangerOptions, NegotiatorEnable, NegotiatorOptions,
    SessionError, SessionOptions, WireError,
};
pub use crate::crypto::{Identity, PeerIdentity};
pub use crate::session::{
    EventHandler, NopEventHandler, SendToken, Session, SessionId, SessionState,
};
pub use crate::transport::{packet_pipe, PipeTransport, Transport};
pub use crate::wire::MessageType;

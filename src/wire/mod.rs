//! On-wire packet and message-container codecs.
//!
//! A packet is `[header][body]` where the 12-byte header doubles as the AEAD
//! additional data. Encrypted bodies are `ciphertext || tag`; plaintext
//! bodies (handshake traffic only) are raw message containers. A container
//! is `type:2 | length:2 | body[length]`, little-endian throughout.

mod message;
mod packet;

pub use message::{encode_message, MessageIter, MessageType};
pub use packet::{PacketHeader, FLAG_HANDSHAKE};

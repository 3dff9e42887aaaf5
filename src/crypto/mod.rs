//! Cryptographic building blocks: identities, AEAD, key derivation, the
//! four-slot key ring, and replay filtering.

mod aead;
mod identity;
mod kdf;
mod keyring;
mod replay;

pub use aead::{construct_nonce, open, seal, CipherKey};
pub use identity::{Fingerprint, Identity, PeerIdentity};
pub use kdf::{derive_session_key, transcript_hash};
pub use keyring::{KeyRing, KeySlot};
pub use replay::ReplayFilter;

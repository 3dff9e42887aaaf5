//! XChaCha20-Poly1305 AEAD with nonces bound to the key ring.
//!
//! Nonce layout (24 bytes):
//! ```text
//! [ key_gen (2, LE) | packet_id (8, LE) | zeros (14) ]
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroize;

use crate::core::constants::{AEAD_NONCE_SIZE, AEAD_TAG_SIZE, KEY_SIZE};
use crate::core::error::CryptoError;

/// A symmetric session key.
///
/// Zeroized on drop.
#[derive(Clone)]
pub struct CipherKey {
    key: [u8; KEY_SIZE],
}

impl CipherKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Raw key bytes. Handle with care.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl Drop for CipherKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Construct the 24-byte nonce for a `(key_gen, packet_id)` pair.
pub fn construct_nonce(key_gen: u16, packet_id: u64) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[0..2].copy_from_slice(&key_gen.to_le_bytes());
    nonce[2..10].copy_from_slice(&packet_id.to_le_bytes());
    nonce
}

/// Encrypt `plaintext`, returning `ciphertext || tag`.
pub fn seal(
    key: &CipherKey,
    nonce: &[u8; AEAD_NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Decrypt `ciphertext || tag`, verifying the tag and `aad`.
pub fn open(
    key: &CipherKey,
    nonce: &[u8; AEAD_NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < AEAD_TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

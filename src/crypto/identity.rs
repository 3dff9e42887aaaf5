//! Long-term Ed25519 identities.

use std::fmt;

use blake2::{Blake2s256, Digest};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::core::constants::{PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use crate::core::error::CryptoError;

/// Stable identifier derived from an identity public key.
pub type Fingerprint = [u8; 16];

fn fingerprint_of(public_key: &[u8; PUBLIC_KEY_SIZE]) -> Fingerprint {
    let digest = Blake2s256::digest(public_key);
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    id
}

/// A long-term signing identity (Ed25519 keypair).
///
/// Immutable for the session's lifetime. The secret key material is zeroized
/// on drop.
#[derive(Clone)]
pub struct Identity {
    signing: SigningKey,
}

// Prevent secret key material from leaking into logs.
impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("secret", &"[REDACTED]")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl Identity {
    /// Generate a fresh identity from the operating system RNG.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        let signing = SigningKey::from_bytes(&secret);
        secret.zeroize();
        Self { signing }
    }

    /// Restore an identity from stored secret key bytes.
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    /// The identity's public key.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing.verifying_key().to_bytes()
    }

    /// Stable identifier derived from the public key.
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint_of(&self.public_key())
    }

    /// The verification-only view of this identity, as handed to the peer.
    pub fn peer_identity(&self) -> PeerIdentity {
        PeerIdentity {
            verifying: self.signing.verifying_key(),
        }
    }

    /// Sign a message with the long-term key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }
}

/// The remote endpoint's long-term identity (verification key only).
#[derive(Clone)]
pub struct PeerIdentity {
    verifying: VerifyingKey,
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl PeerIdentity {
    /// Build from the peer's public key bytes.
    pub fn from_bytes(public_key: &[u8; PUBLIC_KEY_SIZE]) -> Result<Self, CryptoError> {
        let verifying =
            VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self { verifying })
    }

    /// The peer's public key.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.verifying.to_bytes()
    }

    /// Stable identifier derived from the public key.
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint_of(&self.public_key())
    }

    /// Verify a signature made by this identity.
    pub fn verify(
        &self,
        message: &[u8],
        signature: &[u8; SIGNATURE_SIZE],
    ) -> Result<(), CryptoError> {
        let signature = Signature::from_bytes(signature);
        self.verifying
            .verify(message, &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let identity = Identity::generate();
        let peer = identity.peer_identity();

        let signature = identity.sign(b"handshake transcript");
        peer.verify(b"handshake transcript", &signature).unwrap();
        assert_eq!(
            peer.verify(b"tampered", &signature),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn fingerprints_are_stable_and_distinct() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_eq!(a.fingerprint(), a.peer_identity().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn from_bytes_restores_identity() {
        let mut secret = [7u8; 32];
        let a = Identity::from_bytes(&secret);
        let b = Identity::from_bytes(&secret);
        secret.zeroize();
        assert_eq!(a.public_key(), b.public_key());
    }
}

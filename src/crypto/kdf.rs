//! Key derivation and handshake transcript hashing.

use blake2::{Blake2s256, Digest};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::core::constants::{KEY_SIZE, PUBLIC_KEY_SIZE, SESSION_ID_SIZE, TRANSCRIPT_SIZE};
use crate::core::error::CryptoError;

use super::aead::CipherKey;

const KDF_SALT: &[u8] = b"shroud v1";
const KDF_INFO_LABEL: &[u8] = b"session key";
const TRANSCRIPT_LABEL: &[u8] = b"shroud v1 kex";

/// Derive the symmetric session key for one generation.
///
/// ```text
/// key = HKDF-SHA256(
///     salt = "shroud v1",
///     ikm  = dh_shared || psk,
///     info = "session key" || LE16(key_gen) || lo_id || hi_id,
/// )
/// ```
///
/// The two session ids are ordered bytewise so both endpoints derive the
/// same key regardless of which one they call "local".
pub fn derive_session_key(
    dh_shared: &[u8; 32],
    psk: Option<&[u8]>,
    key_gen: u16,
    local_id: &[u8; SESSION_ID_SIZE],
    peer_id: &[u8; SESSION_ID_SIZE],
) -> Result<CipherKey, CryptoError> {
    let mut ikm = Vec::with_capacity(32 + psk.map_or(0, <[u8]>::len));
    ikm.extend_from_slice(dh_shared);
    if let Some(psk) = psk {
        ikm.extend_from_slice(psk);
    }

    let (lo, hi) = if local_id <= peer_id {
        (local_id, peer_id)
    } else {
        (peer_id, local_id)
    };

    let mut info = Vec::with_capacity(KDF_INFO_LABEL.len() + 2 + 2 * SESSION_ID_SIZE);
    info.extend_from_slice(KDF_INFO_LABEL);
    info.extend_from_slice(&key_gen.to_le_bytes());
    info.extend_from_slice(lo);
    info.extend_from_slice(hi);

    let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), &ikm);
    let mut key = [0u8; KEY_SIZE];
    hk.expand(&info, &mut key)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;

    ikm.zeroize();

    Ok(CipherKey::from_bytes(key))
}

/// Compute the handshake transcript hash bound into key-exchange signatures.
///
/// ```text
/// transcript = Blake2s256(
///     "shroud v1 kex" || LE16(key_gen) || sender_session_id
///     || ephemeral_public || psk_tag,
/// )
/// ```
///
/// `psk_tag` is `Blake2s256(psk)` when a pre-shared key is configured and
/// all zeros otherwise, so a PSK mismatch surfaces at verification instead
/// of as silent decrypt failures.
pub fn transcript_hash(
    key_gen: u16,
    sender_id: &[u8; SESSION_ID_SIZE],
    ephemeral_public: &[u8; PUBLIC_KEY_SIZE],
    psk: Option<&[u8]>,
) -> [u8; TRANSCRIPT_SIZE] {
    let psk_tag: [u8; 32] = match psk {
        Some(psk) => Blake2s256::digest(psk).into(),
        None => [0u8; 32],
    };

    let mut hasher = Blake2s256::new();
    hasher.update(TRANSCRIPT_LABEL);
    hasher.update(key_gen.to_le_bytes());
    hasher.update(sender_id);
    hasher.update(ephemeral_public);
    hasher.update(psk_tag);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID_A: [u8; SESSION_ID_SIZE] = [1u8; SESSION_ID_SIZE];
    const ID_B: [u8; SESSION_ID_SIZE] = [2u8; SESSION_ID_SIZE];

    #[test]
    fn derivation_is_symmetric_in_session_ids() {
        let shared = [0x42u8; 32];
        let a = derive_session_key(&shared, None, 0, &ID_A, &ID_B).unwrap();
        let b = derive_session_key(&shared, None, 0, &ID_B, &ID_A).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn generation_separates_keys() {
        let shared = [0x42u8; 32];
        let gen0 = derive_session_key(&shared, None, 0, &ID_A, &ID_B).unwrap();
        let gen1 = derive_session_key(&shared, None, 1, &ID_A, &ID_B).unwrap();
        assert_ne!(gen0.as_bytes(), gen1.as_bytes());
    }

    #[test]
    fn psk_separates_keys() {
        let shared = [0x42u8; 32];
        let without = derive_session_key(&shared, None, 0, &ID_A, &ID_B).unwrap();
        let with = derive_session_key(&shared, Some(&[1, 2, 3]), 0, &ID_A, &ID_B).unwrap();
        assert_ne!(without.as_bytes(), with.as_bytes());
    }

    #[test]
    fn transcript_binds_all_inputs() {
        let eph = [0x11u8; PUBLIC_KEY_SIZE];
        let base = transcript_hash(0, &ID_A, &eph, None);
        assert_eq!(base, transcript_hash(0, &ID_A, &eph, None));
        assert_ne!(base, transcript_hash(1, &ID_A, &eph, None));
        assert_ne!(base, transcript_hash(0, &ID_B, &eph, None));
        assert_ne!(base, transcript_hash(0, &ID_A, &[0x22; 32], None));
        assert_ne!(base, transcript_hash(0, &ID_A, &eph, Some(&[1])));
    }
}

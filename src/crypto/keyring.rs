//! Four-slot key ring with atomic publication.
//!
//! At steady state the slots hold (oldest-still-valid, previous, current,
//! newest). Only the key-exchange task installs keys; every other task reads
//! `Arc` clones taken under a short read lock, so no lock is held across the
//! AEAD itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::core::constants::{KEY_RING_SLOTS, KEY_SIZE, PACKET_HEADER_SIZE};
use crate::core::error::CryptoError;
use crate::wire::PacketHeader;

use super::aead::{construct_nonce, open, CipherKey};

/// One installed key with its generation and tx packet-id counter.
#[derive(Clone)]
pub struct KeySlot {
    /// Key generation, incremented on every rotation.
    pub generation: u16,
    /// The symmetric key.
    pub key: Arc<CipherKey>,
    /// Next outgoing packet id under this generation (ids start at 1).
    next_packet_id: Arc<AtomicU64>,
}

impl KeySlot {
    fn new(generation: u16, key: CipherKey) -> Self {
        Self {
            generation,
            key: Arc::new(key),
            next_packet_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Reserve the next outgoing packet id for this generation.
    pub fn next_packet_id(&self) -> u64 {
        self.next_packet_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Holds up to four concurrently valid keys.
pub struct KeyRing {
    // Index 0 is the oldest slot, the last occupied index the newest.
    slots: RwLock<[Option<KeySlot>; KEY_RING_SLOTS]>,
}

impl KeyRing {
    /// An empty ring.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new([None, None, None, None]),
        }
    }

    /// Install a key for `generation`, evicting the oldest slot if full.
    ///
    /// Installing an already-present generation is a no-op: derivation is
    /// deterministic, so a duplicate install carries the same key.
    pub fn install(&self, generation: u16, key: CipherKey) {
        let mut slots = self.slots.write().expect("key ring lock poisoned");
        if slots
            .iter()
            .flatten()
            .any(|slot| slot.generation == generation)
        {
            return;
        }
        let slot = KeySlot::new(generation, key);
        if let Some(free) = slots.iter_mut().find(|s| s.is_none()) {
            *free = Some(slot);
        } else {
            slots.rotate_left(1);
            slots[KEY_RING_SLOTS - 1] = Some(slot);
        }
    }

    /// The newest installed slot.
    pub fn newest(&self) -> Option<KeySlot> {
        let slots = self.slots.read().expect("key ring lock poisoned");
        slots
            .iter()
            .flatten()
            .max_by_key(|slot| slot.generation)
            .cloned()
    }

    /// The slot for an exact generation.
    pub fn get(&self, generation: u16) -> Option<KeySlot> {
        let slots = self.slots.read().expect("key ring lock poisoned");
        slots
            .iter()
            .flatten()
            .find(|slot| slot.generation == generation)
            .cloned()
    }

    /// Whether a generation is installed.
    pub fn contains(&self, generation: u16) -> bool {
        self.get(generation).is_some()
    }

    /// Snapshot of the raw key bytes per slot, oldest first.
    pub fn snapshot(&self) -> [Option<[u8; KEY_SIZE]>; KEY_RING_SLOTS] {
        let slots = self.slots.read().expect("key ring lock poisoned");
        let mut out = [None; KEY_RING_SLOTS];
        for (out_slot, slot) in out.iter_mut().zip(slots.iter()) {
            *out_slot = slot.as_ref().map(|s| *s.key.as_bytes());
        }
        out
    }

    /// Decrypt a packet body under the ring.
    ///
    /// The slot matching the header's generation is tried first; on failure
    /// the remaining slots are tried to tolerate in-flight rotation. Returns
    /// the plaintext and the generation that succeeded.
    pub fn decrypt(
        &self,
        header: &PacketHeader,
        header_bytes: &[u8; PACKET_HEADER_SIZE],
        body: &[u8],
    ) -> Result<(u16, Vec<u8>), CryptoError> {
        let nonce = construct_nonce(header.key_gen, header.packet_id);

        let candidates: Vec<KeySlot> = {
            let slots = self.slots.read().expect("key ring lock poisoned");
            let mut candidates: Vec<KeySlot> = slots.iter().flatten().cloned().collect();
            candidates.sort_by_key(|slot| slot.generation != header.key_gen);
            candidates
        };

        for slot in candidates {
            if let Ok(plaintext) = open(&slot.key, &nonce, header_bytes, body) {
                return Ok((slot.generation, plaintext));
            }
        }
        Err(CryptoError::DecryptionFailed)
    }
}

impl Default for KeyRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aead::seal;

    fn key(byte: u8) -> CipherKey {
        CipherKey::from_bytes([byte; KEY_SIZE])
    }

    #[test]
    fn install_fills_then_rotates() {
        let ring = KeyRing::new();
        for gen in 0..6u16 {
            ring.install(gen, key(gen as u8));
        }
        let snapshot = ring.snapshot();
        assert!(snapshot.iter().all(Option::is_some));
        // Oldest two generations were evicted.
        assert!(!ring.contains(0));
        assert!(!ring.contains(1));
        for gen in 2..6u16 {
            assert!(ring.contains(gen));
        }
        assert_eq!(ring.newest().unwrap().generation, 5);
    }

    #[test]
    fn duplicate_install_is_noop() {
        let ring = KeyRing::new();
        ring.install(0, key(1));
        ring.install(0, key(2));
        assert_eq!(ring.snapshot()[0], Some([1u8; KEY_SIZE]));
        assert_eq!(ring.snapshot()[1], None);
    }

    #[test]
    fn packet_ids_increase_per_slot() {
        let ring = KeyRing::new();
        ring.install(0, key(1));
        let slot = ring.newest().unwrap();
        assert_eq!(slot.next_packet_id(), 1);
        assert_eq!(slot.next_packet_id(), 2);
        // A re-fetched slot shares the counter.
        assert_eq!(ring.get(0).unwrap().next_packet_id(), 3);
    }

    #[test]
    fn decrypt_prefers_indicated_generation_and_falls_back() {
        let ring = KeyRing::new();
        ring.install(0, key(0x10));
        ring.install(1, key(0x20));

        let header = PacketHeader::new(1, 5);
        let header_bytes = header.to_bytes();
        let nonce = construct_nonce(1, 5);
        let body = seal(&key(0x20), &nonce, &header_bytes, b"payload").unwrap();

        let (generation, plaintext) = ring.decrypt(&header, &header_bytes, &body).unwrap();
        assert_eq!(generation, 1);
        assert_eq!(plaintext, b"payload");

        // A later install does not disturb packets under older generations.
        let header_stale = PacketHeader::new(1, 6);
        let stale_bytes = header_stale.to_bytes();
        let stale_nonce = construct_nonce(1, 6);
        let stale_body = seal(&key(0x20), &stale_nonce, &stale_bytes, b"late").unwrap();
        ring.install(2, key(0x30));
        let (generation, plaintext) = ring.decrypt(&header_stale, &stale_bytes, &stale_body).unwrap();
        assert_eq!(generation, 1);
        assert_eq!(plaintext, b"late");
    }

    #[test]
    fn decrypt_fails_with_no_matching_key() {
        let ring = KeyRing::new();
        ring.install(0, key(0x10));

        let header = PacketHeader::new(0, 1);
        let header_bytes = header.to_bytes();
        let nonce = construct_nonce(0, 1);
        let body = seal(&key(0x99), &nonce, &header_bytes, b"payload").unwrap();

        assert_eq!(
            ring.decrypt(&header, &header_bytes, &body),
            Err(CryptoError::DecryptionFailed)
        );
    }
}

//! Replay rejection for received packet ids.
//!
//! Accepted packet ids must be strictly greater than every previously
//! accepted id under the same key generation, so the filter keeps one
//! highest-accepted marker per generation. Retained generations are pruned
//! to the key ring depth.

use std::collections::HashMap;

use crate::core::constants::KEY_RING_SLOTS;

/// Sliding tracker of accepted packet ids per key generation.
///
/// Owned by the receive loop; single writer, no locking.
#[derive(Debug, Default)]
pub struct ReplayFilter {
    highest: HashMap<u16, u64>,
}

impl ReplayFilter {
    /// An empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept or reject a `(key_gen, packet_id)` pair, recording it when
    /// accepted.
    pub fn check_and_update(&mut self, key_gen: u16, packet_id: u64) -> bool {
        match self.highest.get_mut(&key_gen) {
            Some(highest) => {
                if packet_id <= *highest {
                    return false;
                }
                *highest = packet_id;
                true
            }
            None => {
                self.highest.insert(key_gen, packet_id);
                self.prune();
                true
            }
        }
    }

    // Keep only the newest generations; anything older has left the ring.
    fn prune(&mut self) {
        while self.highest.len() > KEY_RING_SLOTS {
            let oldest = *self
                .highest
                .keys()
                .min()
                .expect("non-empty map has a minimum");
            self.highest.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_strictly_increasing_ids() {
        let mut filter = ReplayFilter::new();
        assert!(filter.check_and_update(0, 1));
        assert!(filter.check_and_update(0, 2));
        assert!(filter.check_and_update(0, 10));
    }

    #[test]
    fn rejects_duplicates_and_reordering() {
        let mut filter = ReplayFilter::new();
        assert!(filter.check_and_update(0, 5));
        assert!(!filter.check_and_update(0, 5));
        assert!(!filter.check_and_update(0, 3));
        assert!(filter.check_and_update(0, 6));
    }

    #[test]
    fn generations_are_independent() {
        let mut filter = ReplayFilter::new();
        assert!(filter.check_and_update(0, 100));
        assert!(filter.check_and_update(1, 1));
        assert!(!filter.check_and_update(0, 100));
        assert!(filter.check_and_update(1, 2));
    }

    #[test]
    fn old_generations_are_pruned() {
        let mut filter = ReplayFilter::new();
        for gen in 0..8u16 {
            assert!(filter.check_and_update(gen, 1));
        }
        assert!(filter.highest.len() <= KEY_RING_SLOTS);
        assert!(!filter.highest.contains_key(&0));
        assert!(filter.highest.contains_key(&7));
    }
}

//! Fragmentation of oversized payloads and reassembly of received fragments.
//!
//! Fragment body layout:
//! ```text
//! [ message_id (4, LE) | index (2, LE) | total (2, LE) | orig_type (2, LE) | data ]
//! ```
//! The original message type rides in every fragment so a completed
//! reassembly is delivered exactly as a single message of that type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::core::constants::{FRAGMENT_HEADER_SIZE, SESSION_ID_SIZE};
use crate::core::error::WireError;
use crate::wire::MessageType;

/// Header of one fragment message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FragmentHeader {
    pub(crate) message_id: u32,
    pub(crate) index: u16,
    pub(crate) total: u16,
    pub(crate) orig_type: u16,
}

impl FragmentHeader {
    pub(crate) fn to_bytes(self) -> [u8; FRAGMENT_HEADER_SIZE] {
        let mut buf = [0u8; FRAGMENT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.message_id.to_le_bytes());
        buf[4..6].copy_from_slice(&self.index.to_le_bytes());
        buf[6..8].copy_from_slice(&self.total.to_le_bytes());
        buf[8..10].copy_from_slice(&self.orig_type.to_le_bytes());
        buf
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < FRAGMENT_HEADER_SIZE {
            return Err(WireError::TooShort {
                expected: FRAGMENT_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            message_id: u32::from_le_bytes(bytes[0..4].try_into().expect("length checked")),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            total: u16::from_le_bytes([bytes[6], bytes[7]]),
            orig_type: u16::from_le_bytes([bytes[8], bytes[9]]),
        })
    }
}

/// Splits oversized payloads into fragment message bodies.
pub(crate) struct Fragmenter {
    next_message_id: AtomicU32,
}

impl Fragmenter {
    pub(crate) fn new() -> Self {
        Self {
            next_message_id: AtomicU32::new(1),
        }
    }

    /// Split `payload` into fragment bodies of at most
    /// `chunk_size + FRAGMENT_HEADER_SIZE` bytes each.
    ///
    /// Returns `None` when the payload needs more than `u16::MAX` fragments.
    pub(crate) fn split(
        &self,
        orig_type: MessageType,
        payload: &[u8],
        chunk_size: usize,
    ) -> Option<Vec<Vec<u8>>> {
        debug_assert!(chunk_size > 0);
        let total = payload.len().div_ceil(chunk_size);
        if total > u16::MAX as usize {
            return None;
        }
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);

        let mut fragments = Vec::with_capacity(total);
        for (index, chunk) in payload.chunks(chunk_size).enumerate() {
            let header = FragmentHeader {
                message_id,
                index: index as u16,
                total: total as u16,
                orig_type: orig_type.to_wire(),
            };
            let mut body = Vec::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
            body.extend_from_slice(&header.to_bytes());
            body.extend_from_slice(chunk);
            fragments.push(body);
        }
        Some(fragments)
    }
}

struct Partial {
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
    orig_type: u16,
    first_seen: Instant,
}

/// Per-sender reassembly tables with timeout-based eviction.
pub(crate) struct Reassembler {
    tables: Mutex<HashMap<([u8; SESSION_ID_SIZE], u32), Partial>>,
    timeout: Duration,
}

impl Reassembler {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Insert one received fragment body.
    ///
    /// Returns the reassembled `(original type, payload)` once all
    /// fragments of the message have arrived.
    pub(crate) fn insert(
        &self,
        peer: [u8; SESSION_ID_SIZE],
        body: &[u8],
    ) -> Result<Option<(MessageType, Vec<u8>)>, WireError> {
        let header = FragmentHeader::from_bytes(body)?;
        let data = &body[FRAGMENT_HEADER_SIZE..];
        if header.total == 0 || header.index >= header.total {
            return Err(WireError::LengthOverrun {
                length: header.index as usize,
                remaining: header.total as usize,
            });
        }

        let mut tables = self.tables.lock().expect("reassembly lock poisoned");
        let partial = tables
            .entry((peer, header.message_id))
            .or_insert_with(|| Partial {
                chunks: vec![None; header.total as usize],
                received: 0,
                orig_type: header.orig_type,
                first_seen: Instant::now(),
            });

        // A total or type disagreeing with the first fragment seen is a
        // corrupt or forged message; drop the whole reassembly.
        if partial.chunks.len() != header.total as usize || partial.orig_type != header.orig_type {
            tables.remove(&(peer, header.message_id));
            return Ok(None);
        }

        let slot = &mut partial.chunks[header.index as usize];
        if slot.is_none() {
            *slot = Some(data.to_vec());
            partial.received += 1;
        }

        if partial.received == partial.chunks.len() {
            let partial = tables
                .remove(&(peer, header.message_id))
                .expect("entry exists");
            let mut payload =
                Vec::with_capacity(partial.chunks.iter().flatten().map(Vec::len).sum());
            for chunk in partial.chunks {
                payload.extend_from_slice(&chunk.expect("all fragments received"));
            }
            return Ok(Some((MessageType::from_wire(partial.orig_type), payload)));
        }
        Ok(None)
    }

    /// Evict partial reassemblies older than the timeout. Returns the
    /// number of evicted messages.
    pub(crate) fn evict_expired(&self) -> usize {
        let mut tables = self.tables.lock().expect("reassembly lock poisoned");
        let before = tables.len();
        tables.retain(|_, partial| partial.first_seen.elapsed() < self.timeout);
        before - tables.len()
    }
}

//! Send scheduling: the merge slot and the delayed flusher task.
//!
//! Producers append [`SendItem`]s to one open [`MergeSlot`]; the flusher
//! drains slots when the merge window elapses, on explicit kick, or when a
//! slot overflows. One slot becomes exactly one encrypted packet written in
//! a single transport call, after which every token in the slot is signaled
//! with that write's result.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::core::constants::MESSAGE_HEADER_SIZE;
use crate::core::error::SessionError;
use crate::core::options::AnswersMode;
use crate::crypto::{construct_nonce, seal, KeySlot};
use crate::transport::Transport;
use crate::wire::{encode_message, MessageType, PacketHeader};

use super::token::TokenShared;
use super::{KeyProgress, Shared};

/// One message queued for sending.
pub(crate) struct SendItem {
    pub(crate) msg_type: MessageType,
    pub(crate) payload: Vec<u8>,
    /// Acknowledgement token; `None` for protocol-internal sends and for
    /// all but the last fragment of a split message.
    pub(crate) token: Option<Arc<TokenShared>>,
}

impl SendItem {
    fn wire_size(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.payload.len()
    }
}

/// The outgoing packet under construction.
pub(crate) struct MergeSlot {
    items: Vec<SendItem>,
    bytes: usize,
    opened_at: Instant,
}

impl MergeSlot {
    fn new(item: SendItem) -> Self {
        let bytes = item.wire_size();
        Self {
            items: vec![item],
            bytes,
            opened_at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct SendQueue {
    open: Option<MergeSlot>,
    ready: VecDeque<MergeSlot>,
    closed: bool,
}

/// Producer-side state of the send pipeline.
pub(crate) struct SendScheduler {
    q: Mutex<SendQueue>,
    /// Signaled when a slot opens (arms the flusher's merge timer).
    armed: Notify,
    /// Signaled to flush open work immediately.
    kick: Arc<Notify>,
    /// Merge window; `None` disables batching entirely.
    send_delay: Option<Duration>,
}

impl SendScheduler {
    pub(crate) fn new(send_delay: Option<Duration>) -> Self {
        Self {
            q: Mutex::new(SendQueue::default()),
            armed: Notify::new(),
            kick: Arc::new(Notify::new()),
            send_delay,
        }
    }

    /// Handle producers use to force an immediate flush.
    pub(crate) fn kick_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.kick)
    }

    /// Append an item to the open merge slot, closing it first if the item
    /// does not fit. Returns `false` once the scheduler has shut down.
    ///
    /// The plaintext capacity is `capacity + MESSAGE_HEADER_SIZE` so a
    /// single payload of exactly the payload size limit still forms one
    /// packet.
    pub(crate) fn enqueue(&self, item: SendItem, capacity: usize) -> bool {
        let mut q = self.q.lock().expect("send queue lock poisoned");
        if q.closed {
            return false;
        }
        let fits = |slot: &MergeSlot, item: &SendItem| {
            slot.bytes + item.wire_size() <= capacity + MESSAGE_HEADER_SIZE
        };
        match q.open.as_mut() {
            Some(slot) if fits(slot, &item) => {
                slot.bytes += item.wire_size();
                slot.items.push(item);
            }
            Some(_) => {
                let full = q.open.take().expect("checked above");
                q.ready.push_back(full);
                q.open = Some(MergeSlot::new(item));
                self.kick.notify_one();
            }
            None => {
                q.open = Some(MergeSlot::new(item));
                self.armed.notify_one();
            }
        }
        if self.send_delay.is_none() {
            let slot = q.open.take().expect("just filled");
            q.ready.push_back(slot);
            self.kick.notify_one();
        }
        true
    }

    /// Convenience for protocol-internal messages with no token.
    pub(crate) fn enqueue_internal(
        &self,
        msg_type: MessageType,
        payload: Vec<u8>,
        capacity: usize,
    ) {
        self.enqueue(
            SendItem {
                msg_type,
                payload,
                token: None,
            },
            capacity,
        );
    }

    fn pop_ready(&self) -> Option<MergeSlot> {
        self.q
            .lock()
            .expect("send queue lock poisoned")
            .ready
            .pop_front()
    }

    /// Move the open slot to the ready queue.
    fn close_open(&self) {
        let mut q = self.q.lock().expect("send queue lock poisoned");
        if let Some(slot) = q.open.take() {
            q.ready.push_back(slot);
        }
    }

    fn open_deadline(&self) -> Option<Instant> {
        let delay = self.send_delay?;
        let q = self.q.lock().expect("send queue lock poisoned");
        q.open.as_ref().map(|slot| slot.opened_at + delay)
    }

    /// Stop accepting work and take everything still pending.
    fn drain(&self) -> Vec<MergeSlot> {
        let mut q = self.q.lock().expect("send queue lock poisoned");
        q.closed = true;
        let mut slots: Vec<MergeSlot> = q.ready.drain(..).collect();
        if let Some(open) = q.open.take() {
            slots.push(open);
        }
        slots
    }
}

fn complete_slot(slot: &MergeSlot, result: &Result<usize, SessionError>) {
    for item in &slot.items {
        if let Some(token) = &item.token {
            token.complete(result.clone());
        }
    }
}

impl<T: Transport> Shared<T> {
    /// The send flusher task.
    pub(crate) async fn run_flusher(self: Arc<Self>) {
        let mut keys_rx = self.keys_tx.subscribe();
        let mut paused_rx = self.paused_tx.subscribe();

        loop {
            // Hold off while the harness has the session paused.
            while *paused_rx.borrow_and_update() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return self.finish_flusher(),
                    _ = paused_rx.changed() => {}
                }
            }

            let slot = match self.scheduler.pop_ready() {
                Some(slot) => slot,
                None => {
                    let deadline = self.scheduler.open_deadline();
                    let merge_timer = async {
                        match deadline {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending().await,
                        }
                    };
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return self.finish_flusher(),
                        _ = paused_rx.changed() => {}
                        _ = self.scheduler.armed.notified() => {}
                        _ = self.scheduler.kick.notified() => self.scheduler.close_open(),
                        _ = merge_timer => self.scheduler.close_open(),
                    }
                    continue;
                }
            };

            let key = match self.wait_for_send_key(&mut keys_rx).await {
                Some(key) => key,
                None => {
                    // Session is going down; report through the terminal error.
                    complete_slot(&slot, &Err(self.exit_error()));
                    return self.finish_flusher();
                }
            };

            self.flush_slot(slot, key).await;
        }
    }

    /// Block until a usable tx key exists.
    ///
    /// Before the first key exchange completes this is the point where all
    /// sends wait for the session to become established; under
    /// `AnswerAndWait` it additionally waits until the peer has acknowledged
    /// the newest installed generation.
    async fn wait_for_send_key(
        &self,
        keys_rx: &mut tokio::sync::watch::Receiver<KeyProgress>,
    ) -> Option<KeySlot> {
        loop {
            let progress = *keys_rx.borrow_and_update();
            let target = match progress.newest {
                None => None,
                Some(newest) if self.answers_mode == AnswersMode::AnswerAndWait => {
                    (progress.confirmed >= Some(newest)).then_some(newest)
                }
                Some(newest) => Some(newest),
            };
            if let Some(generation) = target {
                if let Some(key) = self.keyring.get(generation) {
                    return Some(key);
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = keys_rx.changed() => {
                    if result.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Assemble, encrypt, and write one slot as a single packet.
    async fn flush_slot(&self, slot: MergeSlot, key: KeySlot) {
        let mut plaintext = Vec::with_capacity(slot.bytes);
        for item in &slot.items {
            encode_message(&mut plaintext, item.msg_type, &item.payload);
        }

        let packet_id = key.next_packet_id();
        let header = PacketHeader::new(key.generation, packet_id);
        let header_bytes = header.to_bytes();
        let nonce = construct_nonce(key.generation, packet_id);

        let body = match seal(&key.key, &nonce, &header_bytes, &plaintext) {
            Ok(body) => body,
            Err(err) => {
                let err = SessionError::from(err);
                complete_slot(&slot, &Err(err.clone()));
                self.fail(err);
                return;
            }
        };

        let mut wire = Vec::with_capacity(header_bytes.len() + body.len());
        wire.extend_from_slice(&header_bytes);
        wire.extend_from_slice(&body);

        let result = self
            .transport
            .send(&wire)
            .await
            .map_err(SessionError::from);
        trace!(
            packet_id,
            generation = key.generation,
            messages = slot.items.len(),
            bytes = wire.len(),
            ok = result.is_ok(),
            "flushed merge slot"
        );
        let failed = result.as_ref().err().cloned();
        complete_slot(&slot, &result);
        if let Some(err) = failed {
            self.fail(err);
        }
    }

    /// Complete everything still queued and shut the scheduler down.
    fn finish_flusher(&self) {
        let err = self.exit_error();
        for slot in self.scheduler.drain() {
            complete_slot(&slot, &Err(err.clone()));
        }
    }
}

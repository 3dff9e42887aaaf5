//! The receive loop: decrypt, replay-check, demultiplex.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::constants::{PACKET_HEADER_SIZE, SESSION_ID_SIZE};
use crate::core::error::SessionError;
use crate::crypto::ReplayFilter;
use crate::transport::Transport;
use crate::wire::{MessageIter, MessageType, PacketHeader};

use super::exchange::{KexEvent, KeyExchangeMsg, NegotiationMsg};
use super::Shared;

/// Per-type message handler pair, published copy-on-write.
pub(crate) struct HandlerEntry {
    pub(crate) on_message: Box<dyn Fn(&[u8]) -> Result<(), SessionError> + Send + Sync>,
    pub(crate) on_error: Box<dyn Fn(SessionError) + Send + Sync>,
}

impl<T: Transport> Shared<T> {
    /// The receive loop task. One per session.
    pub(crate) async fn run_receiver(self: Arc<Self>) {
        let mut filter = ReplayFilter::new();
        let mut paused_rx = self.paused_tx.subscribe();
        let mut buf = vec![0u8; self.initial_packet_limit];

        loop {
            // While paused the pending recv is dropped, which releases the
            // transport to the harness without losing queued packets.
            while *paused_rx.borrow_and_update() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = paused_rx.changed() => {}
                }
            }

            // Biased so that cancellation and pause always win over a
            // simultaneously ready packet.
            let len = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = paused_rx.changed() => continue,
                result = self.transport.recv(&mut buf) => match result {
                    Ok(len) => len,
                    Err(err)
                        if matches!(
                            err.kind(),
                            std::io::ErrorKind::UnexpectedEof
                                | std::io::ErrorKind::BrokenPipe
                                | std::io::ErrorKind::ConnectionReset
                        ) =>
                    {
                        self.fail(SessionError::PeerClosed);
                        return;
                    }
                    Err(err) => {
                        self.fail(SessionError::from(err));
                        return;
                    }
                },
            };

            self.process_packet(&mut filter, &buf[..len]).await;
        }
    }

    async fn process_packet(&self, filter: &mut ReplayFilter, packet: &[u8]) {
        let header = match PacketHeader::from_bytes(packet) {
            Ok(header) => header,
            Err(err) => {
                debug!(session = %self.id, %err, "rejected packet header");
                self.bump_decrypt_fail();
                return;
            }
        };
        let body = &packet[PACKET_HEADER_SIZE..];

        if header.handshake {
            self.process_handshake(body).await;
            return;
        }

        let header_bytes: [u8; PACKET_HEADER_SIZE] = packet[..PACKET_HEADER_SIZE]
            .try_into()
            .expect("header length checked");
        let plaintext = match self.keyring.decrypt(&header, &header_bytes, body) {
            Ok((_, plaintext)) => plaintext,
            Err(err) => {
                debug!(session = %self.id, %err, packet_id = header.packet_id, "decrypt failed");
                self.bump_decrypt_fail();
                return;
            }
        };
        self.sequential_decrypt_fails.store(0, Ordering::Relaxed);

        if !filter.check_and_update(header.key_gen, header.packet_id) {
            self.unexpected_packet_id_count
                .fetch_add(1, Ordering::Relaxed);
            if self.options.enable_debug {
                debug!(
                    session = %self.id,
                    generation = header.key_gen,
                    packet_id = header.packet_id,
                    "dropped replayed packet"
                );
            }
            return;
        }

        for message in MessageIter::new(&plaintext) {
            match message {
                Ok((msg_type, msg_body)) => self.dispatch(msg_type, msg_body).await,
                Err(err) => {
                    warn!(session = %self.id, %err, "malformed message container");
                    break;
                }
            }
        }
    }

    /// Plaintext packets may only carry handshake traffic; anything else in
    /// them is ignored.
    async fn process_handshake(&self, body: &[u8]) {
        for message in MessageIter::new(body) {
            let (msg_type, msg_body) = match message {
                Ok(parts) => parts,
                Err(err) => {
                    debug!(session = %self.id, %err, "malformed handshake container");
                    return;
                }
            };
            if !msg_type.allowed_in_handshake() {
                debug!(session = %self.id, ?msg_type, "ignored non-handshake plaintext message");
                continue;
            }
            self.route_handshake(msg_type, msg_body).await;
        }
    }

    async fn route_handshake(&self, msg_type: MessageType, body: &[u8]) {
        let event = match msg_type {
            MessageType::KeyExchange => match KeyExchangeMsg::from_bytes(body) {
                Ok(msg) => KexEvent::Exchange(msg),
                Err(err) => {
                    debug!(session = %self.id, %err, "malformed key exchange body");
                    return;
                }
            },
            MessageType::KeyExchangeAnswer => {
                if body.len() < 2 {
                    debug!(session = %self.id, "malformed key exchange answer");
                    return;
                }
                KexEvent::Answer(u16::from_le_bytes([body[0], body[1]]))
            }
            MessageType::Negotiation => match NegotiationMsg::from_bytes(body) {
                Ok(msg) => KexEvent::Negotiation(msg),
                Err(err) => {
                    debug!(session = %self.id, %err, "malformed negotiation body");
                    return;
                }
            },
            _ => return,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.kex_tx.send(event) => {}
        }
    }

    async fn dispatch(&self, msg_type: MessageType, body: &[u8]) {
        match msg_type {
            MessageType::KeyExchange
            | MessageType::KeyExchangeAnswer
            | MessageType::Negotiation => self.route_handshake(msg_type, body).await,
            MessageType::Ping => {
                let capacity = self.payload_limit.load(Ordering::Relaxed) as usize;
                self.scheduler
                    .enqueue_internal(MessageType::Pong, body.to_vec(), capacity);
            }
            MessageType::Pong | MessageType::FragmentAck => {}
            MessageType::CloseNotify => self.fail(SessionError::PeerClosed),
            MessageType::Fragment => {
                let peer = self
                    .peer_session_id
                    .get()
                    .copied()
                    .unwrap_or([0u8; SESSION_ID_SIZE]);
                match self.reassembler.insert(peer, body) {
                    Ok(Some((orig_type, payload))) => {
                        self.deliver_app(orig_type, payload).await;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(session = %self.id, %err, "malformed fragment");
                    }
                }
            }
            MessageType::ReadWrite | MessageType::Channel(_) => {
                self.deliver_app(msg_type, body.to_vec()).await;
            }
        }
    }

    /// Deliver an application message: registered handler first, the
    /// synchronous read buffer for `ReadWrite`, drop-and-log otherwise.
    async fn deliver_app(&self, msg_type: MessageType, payload: Vec<u8>) {
        let entry = {
            let handlers = self.handlers.read().expect("handler table lock poisoned");
            handlers.get(&msg_type.to_wire()).cloned()
        };
        if let Some(entry) = entry {
            // Handlers run on the receive task in receive order.
            if let Err(err) = (entry.on_message)(&payload) {
                (entry.on_error)(err);
            }
            return;
        }
        if msg_type == MessageType::ReadWrite {
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = self.read_tx.send(payload) => {}
            }
            return;
        }
        debug!(session = %self.id, ?msg_type, "no handler registered, message dropped");
    }

    fn bump_decrypt_fail(&self) {
        let fails = self.sequential_decrypt_fails.fetch_add(1, Ordering::Relaxed) + 1;
        if fails >= self.decrypt_fail_threshold {
            self.fail(SessionError::TooManyDecryptFails(fails));
        }
    }
}

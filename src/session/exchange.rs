//! Key exchange driver.
//!
//! Runs the authenticated Diffie-Hellman rounds: each round (one key
//! generation) exchanges signed X25519 ephemerals, mixes the optional PSK,
//! and installs the derived key into the ring. The driver also retransmits
//! with capped backoff, schedules periodic re-keys, answers (or omits
//! answers) per policy, and runs the pre-handshake parameter negotiation.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::rngs::OsRng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::core::constants::{
    KEY_EXCHANGE_BODY_SIZE, MAX_KEY_GENERATION, MESSAGE_HEADER_SIZE, NEGOTIATION_BODY_SIZE,
    NEGOTIATION_MAX_RETRIES, PACKET_HEADER_SIZE, PROTOCOL_VERSION, PUBLIC_KEY_SIZE,
    RETRY_BACKOFF, RETRY_BACKOFF_CAP, SESSION_ID_SIZE, SIGNATURE_SIZE, TRANSCRIPT_SIZE,
};
use crate::core::error::{CryptoError, SessionError, WireError};
use crate::core::options::{AnswersMode, KeyExchangerOptions, NegotiatorEnable};
use crate::crypto::{derive_session_key, transcript_hash};
use crate::session::SessionState;
use crate::transport::Transport;
use crate::wire::{encode_message, MessageType, PacketHeader};

use super::Shared;

/// Signed ephemeral key-exchange message body.
///
/// Wire format (147 bytes):
/// ```text
/// [ ephemeral_public (32) | session_id (16) | transcript (32)
///   | signature (64) | answers_mode (1) | key_gen (2, LE) ]
/// ```
#[derive(Debug, Clone)]
pub(crate) struct KeyExchangeMsg {
    pub(crate) ephemeral_public: [u8; PUBLIC_KEY_SIZE],
    pub(crate) session_id: [u8; SESSION_ID_SIZE],
    pub(crate) transcript: [u8; TRANSCRIPT_SIZE],
    pub(crate) signature: [u8; SIGNATURE_SIZE],
    pub(crate) answers_mode: AnswersMode,
    pub(crate) key_gen: u16,
}

impl KeyExchangeMsg {
    pub(crate) fn to_bytes(&self) -> [u8; KEY_EXCHANGE_BODY_SIZE] {
        let mut buf = [0u8; KEY_EXCHANGE_BODY_SIZE];
        buf[0..32].copy_from_slice(&self.ephemeral_public);
        buf[32..48].copy_from_slice(&self.session_id);
        buf[48..80].copy_from_slice(&self.transcript);
        buf[80..144].copy_from_slice(&self.signature);
        buf[144] = self.answers_mode.as_byte();
        buf[145..147].copy_from_slice(&self.key_gen.to_le_bytes());
        buf
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < KEY_EXCHANGE_BODY_SIZE {
            return Err(WireError::TooShort {
                expected: KEY_EXCHANGE_BODY_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            ephemeral_public: bytes[0..32].try_into().expect("length checked"),
            session_id: bytes[32..48].try_into().expect("length checked"),
            transcript: bytes[48..80].try_into().expect("length checked"),
            signature: bytes[80..144].try_into().expect("length checked"),
            answers_mode: AnswersMode::from_byte(bytes[144]),
            key_gen: u16::from_le_bytes([bytes[145], bytes[146]]),
        })
    }
}

/// Pre-handshake parameter exchange body.
///
/// Wire format (6 bytes):
/// ```text
/// [ version (1) | payload_size_limit (4, LE) | flags (1) ]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NegotiationMsg {
    pub(crate) version: u8,
    pub(crate) payload_size_limit: u32,
    pub(crate) fragmentation: bool,
}

impl NegotiationMsg {
    pub(crate) fn to_bytes(&self) -> [u8; NEGOTIATION_BODY_SIZE] {
        let mut buf = [0u8; NEGOTIATION_BODY_SIZE];
        buf[0] = self.version;
        buf[1..5].copy_from_slice(&self.payload_size_limit.to_le_bytes());
        buf[5] = u8::from(self.fragmentation);
        buf
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < NEGOTIATION_BODY_SIZE {
            return Err(WireError::TooShort {
                expected: NEGOTIATION_BODY_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            version: bytes[0],
            payload_size_limit: u32::from_le_bytes(bytes[1..5].try_into().expect("length checked")),
            fragmentation: bytes[5] & 0x01 != 0,
        })
    }
}

/// Handshake traffic routed from the receive loop to the driver.
pub(crate) enum KexEvent {
    Exchange(KeyExchangeMsg),
    Answer(u16),
    Negotiation(NegotiationMsg),
}

/// One key-exchange round in flight.
struct Round {
    generation: u16,
    secret: Option<EphemeralSecret>,
    /// Cached encoded message for retransmission.
    message: Vec<u8>,
    peer_public: Option<[u8; PUBLIC_KEY_SIZE]>,
    derived: bool,
}

/// The key-exchange driver task.
pub(crate) struct KeyExchanger<T: Transport> {
    shared: Arc<Shared<T>>,
    events: mpsc::Receiver<KexEvent>,
    next_handshake_id: u64,
    announced: bool,
    last_negotiation_reply: Option<Instant>,
}

impl<T: Transport> KeyExchanger<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>, events: mpsc::Receiver<KexEvent>) -> Self {
        Self {
            shared,
            events,
            next_handshake_id: 1,
            announced: false,
            last_negotiation_reply: None,
        }
    }

    pub(crate) async fn run(mut self) {
        if let Err(err) = self.drive().await {
            // Cancellation is ordinary teardown, not a session failure.
            if !matches!(err, SessionError::Canceled) {
                self.shared.fail(err);
            }
        }
    }

    fn opts(&self) -> &KeyExchangerOptions {
        &self.shared.options.key_exchanger
    }

    fn mode(&self) -> AnswersMode {
        self.shared.answers_mode
    }

    fn psk(&self) -> Option<&[u8]> {
        self.opts().psk.as_deref()
    }

    fn negotiation_enabled(&self) -> bool {
        match self.shared.options.negotiator.enable {
            NegotiatorEnable::Auto => self.shared.transport.max_datagram_size().is_some(),
            NegotiatorEnable::True => true,
            NegotiatorEnable::False => false,
        }
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        let mut pending = None;
        if self.negotiation_enabled() {
            pending = self.negotiate().await?;
        }
        self.shared.advance_state(SessionState::KeyExchanging);

        let retry_base = self.opts().retry_interval;
        let mut retry_in = retry_base;
        let mut retry_at = Instant::now() + retry_in;
        let mut rekey_at: Option<Instant> = None;

        let mut round = self.new_round(0);
        self.send_key_exchange(&round).await?;
        if let Some(msg) = pending.take() {
            self.on_exchange(&mut round, msg, &mut rekey_at).await?;
        }

        enum Step {
            Cancelled,
            Event(Option<KexEvent>),
            Retry,
            Rekey,
        }

        loop {
            let rekey_deadline = rekey_at;
            let derived = round.derived;
            let step = tokio::select! {
                _ = self.shared.cancel.cancelled() => Step::Cancelled,
                event = self.events.recv() => Step::Event(event),
                _ = tokio::time::sleep_until(retry_at), if !derived => Step::Retry,
                _ = async {
                    match rekey_deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                }, if derived => Step::Rekey,
            };
            match step {
                Step::Cancelled | Step::Event(None) => return Ok(()),
                Step::Event(Some(KexEvent::Exchange(msg))) => {
                    let was = round.generation;
                    self.on_exchange(&mut round, msg, &mut rekey_at).await?;
                    if round.generation != was {
                        retry_in = retry_base;
                        retry_at = Instant::now() + retry_in;
                    }
                }
                Step::Event(Some(KexEvent::Answer(generation))) => self.on_answer(generation),
                Step::Event(Some(KexEvent::Negotiation(msg))) => {
                    self.reply_negotiation(&msg).await?;
                }
                Step::Retry => {
                    self.send_key_exchange(&round).await?;
                    retry_in = (retry_in * RETRY_BACKOFF).min(retry_base * RETRY_BACKOFF_CAP);
                    retry_at = Instant::now() + retry_in;
                }
                Step::Rekey => {
                    rekey_at = None;
                    if round.generation < MAX_KEY_GENERATION {
                        round = self.new_round(round.generation + 1);
                        self.send_key_exchange(&round).await?;
                        retry_in = retry_base;
                        retry_at = Instant::now() + retry_in;
                    }
                }
            }
        }
    }

    fn new_round(&self, generation: u16) -> Round {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let session_id = self.shared.id.to_bytes();
        let transcript = transcript_hash(generation, &session_id, public.as_bytes(), self.psk());
        let msg = KeyExchangeMsg {
            ephemeral_public: *public.as_bytes(),
            session_id,
            transcript,
            signature: self.shared.identity.sign(&transcript),
            answers_mode: self.mode(),
            key_gen: generation,
        };
        if self.shared.options.enable_debug {
            debug!(session = %self.shared.id, generation, "starting key exchange round");
        }
        Round {
            generation,
            secret: Some(secret),
            message: msg.to_bytes().to_vec(),
            peer_public: None,
            derived: false,
        }
    }

    async fn on_exchange(
        &mut self,
        round: &mut Round,
        msg: KeyExchangeMsg,
        rekey_at: &mut Option<Instant>,
    ) -> Result<(), SessionError> {
        let expected =
            transcript_hash(msg.key_gen, &msg.session_id, &msg.ephemeral_public, self.psk());
        if expected != msg.transcript {
            return Err(SessionError::InvalidSignature);
        }
        self.shared
            .peer
            .verify(&msg.transcript, &msg.signature)
            .map_err(|_| SessionError::InvalidSignature)?;
        if self.mode().conflicts_with(msg.answers_mode) {
            return Err(SessionError::AnswersModeMismatch);
        }
        let _ = self.shared.peer_session_id.set(msg.session_id);

        if msg.key_gen == round.generation {
            if round.derived {
                // Peer retransmitted: it may have missed our half of the
                // round, so play it back together with an answer.
                self.send_key_exchange(round).await?;
                self.send_answer(round.generation).await?;
                return Ok(());
            }
            round.peer_public = Some(msg.ephemeral_public);
        } else if msg.key_gen > round.generation && msg.key_gen <= MAX_KEY_GENERATION {
            // The peer re-keyed first; join its round.
            *round = self.new_round(msg.key_gen);
            self.send_key_exchange(round).await?;
            round.peer_public = Some(msg.ephemeral_public);
        } else {
            // A round we already finished; remind the peer.
            if self.shared.keyring.contains(msg.key_gen) {
                self.send_answer(msg.key_gen).await?;
            }
            return Ok(());
        }

        self.try_complete(round, rekey_at).await
    }

    async fn try_complete(
        &mut self,
        round: &mut Round,
        rekey_at: &mut Option<Instant>,
    ) -> Result<(), SessionError> {
        if round.derived {
            return Ok(());
        }
        let Some(peer_public) = round.peer_public else {
            return Ok(());
        };
        let Some(secret) = round.secret.take() else {
            return Ok(());
        };

        let shared_secret = secret.diffie_hellman(&PublicKey::from(peer_public));
        if !shared_secret.was_contributory() {
            return Err(CryptoError::KeyDerivationFailed.into());
        }
        let peer_session_id = self
            .shared
            .peer_session_id
            .get()
            .copied()
            .expect("set before try_complete");
        let key = derive_session_key(
            shared_secret.as_bytes(),
            self.psk(),
            round.generation,
            &self.shared.id.to_bytes(),
            &peer_session_id,
        )?;
        self.shared.keyring.install(round.generation, key);
        round.derived = true;

        if self.mode() != AnswersMode::Disable {
            self.send_answer(round.generation).await?;
        }
        let confirmed_inline = self.mode() != AnswersMode::AnswerAndWait;
        let generation = round.generation;
        self.shared.keys_tx.send_modify(|progress| {
            if progress.newest < Some(generation) {
                progress.newest = Some(generation);
            }
            if confirmed_inline && progress.confirmed < Some(generation) {
                progress.confirmed = Some(generation);
            }
        });

        if self.shared.options.enable_debug {
            debug!(session = %self.shared.id, generation, "installed session key");
        }
        self.announce_established();
        *rekey_at = Some(Instant::now() + self.opts().key_update_interval);
        Ok(())
    }

    fn announce_established(&mut self) {
        self.shared.advance_state(SessionState::Established);
        if !self.announced {
            self.announced = true;
            if self.shared.options.enable_info {
                info!(session = %self.shared.id, "session established");
            }
            self.shared.handler.on_connect(&self.shared.id);
        }
    }

    fn on_answer(&self, generation: u16) {
        if !self.shared.keyring.contains(generation) {
            return;
        }
        self.shared.keys_tx.send_modify(|progress| {
            if progress.confirmed < Some(generation) {
                progress.confirmed = Some(generation);
            }
        });
    }

    // ---- negotiation ----

    fn local_negotiation(&self) -> NegotiationMsg {
        NegotiationMsg {
            version: PROTOCOL_VERSION,
            payload_size_limit: self.shared.payload_limit.load(Ordering::Relaxed),
            fragmentation: self.shared.options.enable_fragmentation,
        }
    }

    /// Run the pre-handshake parameter exchange.
    ///
    /// Returns a buffered key-exchange message if the peer skipped
    /// negotiation and went straight to key exchange.
    async fn negotiate(&mut self) -> Result<Option<KeyExchangeMsg>, SessionError> {
        self.shared.advance_state(SessionState::Negotiating);
        let local = self.local_negotiation();
        let mut retry_in = self.opts().retry_interval;

        enum Step {
            Cancelled,
            Timeout,
            Event(Option<KexEvent>),
        }

        for _ in 0..NEGOTIATION_MAX_RETRIES {
            self.send_handshake(MessageType::Negotiation, &local.to_bytes())
                .await?;
            let deadline = Instant::now() + retry_in;
            loop {
                let step = tokio::select! {
                    _ = self.shared.cancel.cancelled() => Step::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => Step::Timeout,
                    event = self.events.recv() => Step::Event(event),
                };
                match step {
                    Step::Cancelled | Step::Event(None) => return Err(SessionError::Canceled),
                    Step::Timeout => break,
                    Step::Event(Some(KexEvent::Negotiation(peer))) => {
                        self.apply_negotiation(&local, &peer)?;
                        // One final echo so a peer still waiting settles.
                        self.send_handshake(MessageType::Negotiation, &local.to_bytes())
                            .await?;
                        return Ok(None);
                    }
                    Step::Event(Some(KexEvent::Exchange(msg))) => return Ok(Some(msg)),
                    Step::Event(Some(KexEvent::Answer(_))) => {}
                }
            }
            retry_in = (retry_in * RETRY_BACKOFF).min(self.opts().retry_interval * RETRY_BACKOFF_CAP);
        }

        match self.shared.options.negotiator.enable {
            NegotiatorEnable::True => Err(SessionError::NegotiationTimeout),
            _ => Ok(None),
        }
    }

    fn apply_negotiation(
        &self,
        local: &NegotiationMsg,
        peer: &NegotiationMsg,
    ) -> Result<(), SessionError> {
        if peer.version != PROTOCOL_VERSION {
            return Err(SessionError::ProtocolVersion {
                local: PROTOCOL_VERSION,
                remote: peer.version,
            });
        }
        let limit = local.payload_size_limit.min(peer.payload_size_limit);
        self.shared.payload_limit.store(limit, Ordering::Relaxed);
        if self.shared.options.enable_info {
            info!(session = %self.shared.id, limit, "negotiated payload size limit");
        }
        Ok(())
    }

    /// Answer a negotiation message arriving outside the negotiation phase
    /// (the peer is still negotiating while we moved on). Rate-limited so
    /// two settled peers cannot echo each other forever.
    async fn reply_negotiation(&mut self, peer: &NegotiationMsg) -> Result<(), SessionError> {
        let local = self.local_negotiation();
        self.apply_negotiation(&local, peer)?;
        let min_gap = self.opts().retry_interval / 2;
        if self
            .last_negotiation_reply
            .is_some_and(|at| at.elapsed() < min_gap)
        {
            return Ok(());
        }
        self.last_negotiation_reply = Some(Instant::now());
        self.send_handshake(MessageType::Negotiation, &local.to_bytes())
            .await
    }

    // ---- handshake packet output ----

    async fn send_key_exchange(&mut self, round: &Round) -> Result<(), SessionError> {
        let body = round.message.clone();
        self.send_handshake(MessageType::KeyExchange, &body).await
    }

    async fn send_answer(&mut self, generation: u16) -> Result<(), SessionError> {
        if self.mode() == AnswersMode::Disable {
            return Ok(());
        }
        self.send_handshake(MessageType::KeyExchangeAnswer, &generation.to_le_bytes())
            .await
    }

    async fn send_handshake(
        &mut self,
        msg_type: MessageType,
        body: &[u8],
    ) -> Result<(), SessionError> {
        let header = PacketHeader::handshake(self.next_handshake_id);
        self.next_handshake_id += 1;
        let mut wire =
            Vec::with_capacity(PACKET_HEADER_SIZE + MESSAGE_HEADER_SIZE + body.len());
        wire.extend_from_slice(&header.to_bytes());
        encode_message(&mut wire, msg_type, body);
        self.shared.transport.send(&wire).await?;
        Ok(())
    }
}

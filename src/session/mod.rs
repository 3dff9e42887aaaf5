//! The session engine.
//!
//! A [`Session`] owns the handshake state machine, the send pipeline with
//! coalescing and acknowledgement tokens, the receive pipeline with replay
//! rejection and handler dispatch, and fragmentation. It is a cheap handle:
//! clones share one underlying session.

mod event;
mod exchange;
mod fragment;
mod receiver;
mod sender;
mod state;
mod token;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::constants::{
    FRAGMENT_GC_INTERVAL, FRAGMENT_HEADER_SIZE, FRAGMENT_TIMEOUT, KEEPALIVE_INTERVAL,
    MESSAGE_HEADER_SIZE, PACKET_HEADER_SIZE, PACKET_OVERHEAD, SESSION_ID_SIZE,
};
use crate::core::error::SessionError;
use crate::core::options::{AnswersMode, SessionOptions};
use crate::crypto::{construct_nonce, seal, Identity, KeyRing, PeerIdentity};
use crate::transport::Transport;
use crate::wire::{encode_message, MessageType, PacketHeader};

use exchange::{KexEvent, KeyExchanger};
use receiver::HandlerEntry;
use sender::{SendItem, SendScheduler};
use token::TokenPool;

pub use event::{EventHandler, NopEventHandler};
pub use state::{SessionId, SessionState};
pub use token::SendToken;

const READ_BUFFER_MESSAGES: usize = 1024;
const KEX_MAILBOX_DEPTH: usize = 64;
const CLOSE_NOTIFY_TIMEOUT: Duration = Duration::from_millis(100);

/// Key installation progress published by the key exchanger.
///
/// `newest` is the latest installed generation; `confirmed` the latest one
/// the peer has acknowledged (relevant under `AnswerAndWait`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct KeyProgress {
    pub(crate) newest: Option<u16>,
    pub(crate) confirmed: Option<u16>,
}

/// State shared between the session handle and its background tasks.
pub(crate) struct Shared<T: Transport> {
    pub(crate) id: SessionId,
    pub(crate) identity: Identity,
    pub(crate) peer: PeerIdentity,
    pub(crate) transport: Arc<T>,
    pub(crate) options: SessionOptions,
    pub(crate) answers_mode: AnswersMode,
    /// Effective payload limit; negotiation may shrink it.
    pub(crate) payload_limit: AtomicU32,
    /// Receive buffer size, fixed at the pre-negotiation limit.
    pub(crate) initial_packet_limit: usize,
    pub(crate) decrypt_fail_threshold: u64,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) state_tx: watch::Sender<SessionState>,
    pub(crate) paused_tx: watch::Sender<bool>,
    pub(crate) cancel: CancellationToken,
    pub(crate) keyring: KeyRing,
    pub(crate) keys_tx: watch::Sender<KeyProgress>,
    pub(crate) scheduler: SendScheduler,
    pub(crate) token_pool: Arc<TokenPool>,
    pub(crate) read_tx: mpsc::Sender<Vec<u8>>,
    pub(crate) read_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    pub(crate) handlers: RwLock<HashMap<u16, Arc<HandlerEntry>>>,
    pub(crate) kex_tx: mpsc::Sender<KexEvent>,
    kex_rx: StdMutex<Option<mpsc::Receiver<KexEvent>>>,
    pub(crate) fragmenter: fragment::Fragmenter,
    pub(crate) reassembler: fragment::Reassembler,
    pub(crate) peer_session_id: OnceLock<[u8; SESSION_ID_SIZE]>,
    pub(crate) unexpected_packet_id_count: AtomicU64,
    pub(crate) sequential_decrypt_fails: AtomicU64,
    pub(crate) terminal_error: OnceLock<SessionError>,
    started: AtomicBool,
}

impl<T: Transport> Shared<T> {
    /// Advance the lifecycle state; states never move backwards.
    pub(crate) fn advance_state(&self, target: SessionState) {
        self.state_tx.send_if_modified(|state| {
            if *state < target {
                *state = target;
                true
            } else {
                false
            }
        });
    }

    /// Record a terminal error, inform the handler, and initiate close.
    ///
    /// The first caller wins; later fatal errors are dropped.
    pub(crate) fn fail(&self, err: SessionError) {
        if self.terminal_error.set(err.clone()).is_err() {
            return;
        }
        if self.options.enable_info {
            info!(session = %self.id, %err, "session failed");
            self.handler.on_info(&format!("session error: {err}"));
        }
        let keep_running = self.handler.on_error(&err);
        if err.is_fatal() || !keep_running {
            self.initiate_close();
        }
    }

    /// Move to `Closing` and fire the cancellation signal.
    pub(crate) fn initiate_close(&self) {
        self.advance_state(SessionState::Closing);
        self.cancel.cancel();
    }

    /// Error to complete pending work with during teardown.
    pub(crate) fn exit_error(&self) -> SessionError {
        self.terminal_error
            .get()
            .cloned()
            .unwrap_or(SessionError::Canceled)
    }

    fn packet_size_limit(&self) -> u32 {
        self.payload_limit.load(Ordering::Relaxed) + PACKET_OVERHEAD as u32
    }

    /// Periodic keepalive probe.
    async fn run_keepalive(self: Arc<Self>) {
        let mut counter = 0u64;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {}
            }
            if *self.state_tx.borrow() != SessionState::Established {
                continue;
            }
            counter += 1;
            let capacity = self.payload_limit.load(Ordering::Relaxed) as usize;
            self.scheduler.enqueue_internal(
                MessageType::Ping,
                counter.to_le_bytes().to_vec(),
                capacity,
            );
        }
    }

    /// Periodic eviction of stale partial reassemblies.
    async fn run_fragment_gc(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(FRAGMENT_GC_INTERVAL) => {}
            }
            let evicted = self.reassembler.evict_expired();
            if evicted > 0 && self.options.enable_debug {
                debug!(session = %self.id, evicted, "evicted stale fragment reassemblies");
            }
        }
    }

    /// Joins every task after cancellation and publishes `Closed`.
    async fn supervise(self: Arc<Self>, handles: Vec<JoinHandle<()>>) {
        self.cancel.cancelled().await;
        self.advance_state(SessionState::Closing);

        // Tell the peer we are going away, unless it closed on us first.
        if !matches!(self.terminal_error.get(), Some(SessionError::PeerClosed)) {
            let _ = tokio::time::timeout(CLOSE_NOTIFY_TIMEOUT, self.send_close_notify()).await;
        }

        for handle in handles {
            let _ = handle.await;
        }
        self.advance_state(SessionState::Closed);
        if self.options.enable_debug {
            debug!(session = %self.id, "session closed");
        }
    }

    /// Best-effort encrypted close-notify, written directly to the
    /// transport (the flusher is already shutting down).
    async fn send_close_notify(&self) {
        let Some(key) = self.keyring.newest() else {
            return;
        };
        let packet_id = key.next_packet_id();
        let header = PacketHeader::new(key.generation, packet_id);
        let header_bytes = header.to_bytes();
        let nonce = construct_nonce(key.generation, packet_id);

        let mut plaintext = Vec::with_capacity(MESSAGE_HEADER_SIZE);
        encode_message(&mut plaintext, MessageType::CloseNotify, &[]);
        let Ok(body) = seal(&key.key, &nonce, &header_bytes, &plaintext) else {
            return;
        };
        let mut wire = Vec::with_capacity(PACKET_HEADER_SIZE + body.len());
        wire.extend_from_slice(&header_bytes);
        wire.extend_from_slice(&body);
        let _ = self.transport.send(&wire).await;
    }
}

/// An authenticated, encrypted, message-oriented session over a transport.
///
/// Cloning yields another handle to the same session.
pub struct Session<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> Session<T> {
    /// Create a session between `identity` and `peer` over `transport`.
    ///
    /// The session is inert until [`start`](Self::start) is called.
    pub fn new(
        identity: Identity,
        peer: PeerIdentity,
        transport: T,
        handler: Arc<dyn EventHandler>,
        options: SessionOptions,
    ) -> Self {
        let transport = Arc::new(transport);
        let payload_limit = options.resolve_payload_limit(transport.max_datagram_size());
        let cancel = CancellationToken::new();
        let (read_tx, read_rx) = mpsc::channel(READ_BUFFER_MESSAGES);
        let (kex_tx, kex_rx) = mpsc::channel(KEX_MAILBOX_DEPTH);

        let shared = Arc::new(Shared {
            id: SessionId::generate(),
            identity,
            peer,
            transport,
            answers_mode: options.key_exchanger.answers_mode,
            payload_limit: AtomicU32::new(payload_limit),
            initial_packet_limit: payload_limit as usize + PACKET_OVERHEAD,
            decrypt_fail_threshold: options.resolve_decrypt_fail_threshold(),
            handler,
            state_tx: watch::Sender::new(SessionState::New),
            paused_tx: watch::Sender::new(false),
            keyring: KeyRing::new(),
            keys_tx: watch::Sender::new(KeyProgress::default()),
            scheduler: SendScheduler::new(options.resolve_send_delay()),
            token_pool: TokenPool::new(cancel.clone()),
            read_tx,
            read_rx: Mutex::new(read_rx),
            handlers: RwLock::new(HashMap::new()),
            kex_tx,
            kex_rx: StdMutex::new(Some(kex_rx)),
            fragmenter: fragment::Fragmenter::new(),
            reassembler: fragment::Reassembler::new(FRAGMENT_TIMEOUT),
            peer_session_id: OnceLock::new(),
            unexpected_packet_id_count: AtomicU64::new(0),
            sequential_decrypt_fails: AtomicU64::new(0),
            terminal_error: OnceLock::new(),
            started: AtomicBool::new(false),
            cancel,
            options,
        });
        Self { shared }
    }

    /// Start the session's background tasks and the handshake.
    ///
    /// Must be called from within a tokio runtime. Errors from any state
    /// other than `New`.
    pub fn start(&self) -> Result<(), SessionError> {
        let state = *self.shared.state_tx.borrow();
        if state >= SessionState::Closing {
            return Err(SessionError::AlreadyClosed);
        }
        if state != SessionState::New || self.shared.started.swap(true, Ordering::AcqRel) {
            return Err(SessionError::AlreadyStarted);
        }

        let kex_rx = self
            .shared
            .kex_rx
            .lock()
            .expect("kex mailbox lock poisoned")
            .take()
            .expect("kex mailbox taken once");

        if self.shared.options.enable_debug {
            debug!(session = %self.shared.id, "starting session");
        }

        let handles = vec![
            tokio::spawn(Arc::clone(&self.shared).run_receiver()),
            tokio::spawn(Arc::clone(&self.shared).run_flusher()),
            tokio::spawn(KeyExchanger::new(Arc::clone(&self.shared), kex_rx).run()),
            tokio::spawn(Arc::clone(&self.shared).run_fragment_gc()),
            tokio::spawn(Arc::clone(&self.shared).run_keepalive()),
        ];
        tokio::spawn(Arc::clone(&self.shared).supervise(handles));
        Ok(())
    }

    /// Initiate teardown. Idempotent in effect; a second call reports
    /// [`SessionError::AlreadyClosed`].
    pub fn close(&self) -> Result<(), SessionError> {
        let state = *self.shared.state_tx.borrow();
        if state >= SessionState::Closing {
            return Err(SessionError::AlreadyClosed);
        }
        if !self.shared.started.load(Ordering::Acquire) {
            // Never started: nothing to drain.
            self.shared.cancel.cancel();
            self.shared.advance_state(SessionState::Closed);
            return Ok(());
        }
        self.shared.initiate_close();
        Ok(())
    }

    /// [`close`](Self::close) followed by [`wait_for_closure`](Self::wait_for_closure).
    pub async fn close_and_wait(&self) -> Result<(), SessionError> {
        self.close()?;
        self.wait_for_closure().await;
        Ok(())
    }

    /// Wait until every background task has exited.
    pub async fn wait_for_closure(&self) {
        let mut state_rx = self.shared.state_tx.subscribe();
        while *state_rx.borrow_and_update() != SessionState::Closed {
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait until the session has reached at least `target`, or `Closed`.
    /// Returns the state that satisfied the wait.
    pub async fn wait_for_state(&self, target: SessionState) -> SessionState {
        let mut state_rx = self.shared.state_tx.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            if state >= target || state == SessionState::Closed {
                return state;
            }
            if state_rx.changed().await.is_err() {
                return *self.shared.state_tx.borrow();
            }
        }
    }

    /// Receive the next whole `ReadWrite` message into `buf`.
    ///
    /// Messages are delivered whole: a buffer smaller than the pending
    /// message yields [`SessionError::ShortBuffer`].
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SessionError> {
        let mut rx = self.shared.read_rx.lock().await;
        let message = tokio::select! {
            message = rx.recv() => message,
            _ = self.shared.cancel.cancelled() => {
                // Drain messages that arrived before the close.
                rx.try_recv().ok()
            }
        };
        let Some(message) = message else {
            return Err(self.shared.exit_error());
        };
        if buf.len() < message.len() {
            return Err(SessionError::ShortBuffer {
                needed: message.len(),
                got: buf.len(),
            });
        }
        buf[..message.len()].copy_from_slice(&message);
        Ok(message.len())
    }

    /// Write `buf` as one `ReadWrite` message, waiting until the packet
    /// carrying it has been written to the transport.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, SessionError> {
        self.write_message(MessageType::ReadWrite, buf).await
    }

    /// Write one message of an explicit type, waiting for its flush.
    pub async fn write_message(
        &self,
        msg_type: MessageType,
        buf: &[u8],
    ) -> Result<usize, SessionError> {
        let token = self.write_message_async(msg_type, buf)?;
        let result = token.wait().await;
        token.release();
        result.map(|_| buf.len())
    }

    /// Queue one message and return its acknowledgement token immediately.
    ///
    /// The message is merged and flushed per the send-delay policy; the
    /// token signals once the carrying packet's transport write completes.
    pub fn write_message_async(
        &self,
        msg_type: MessageType,
        buf: &[u8],
    ) -> Result<SendToken, SessionError> {
        if self.shared.cancel.is_cancelled() {
            return Err(SessionError::AlreadyClosed);
        }
        let limit = self.shared.payload_limit.load(Ordering::Relaxed) as usize;
        let token = self
            .shared
            .token_pool
            .acquire(self.shared.scheduler.kick_handle());

        if buf.len() > limit {
            return self.enqueue_fragmented(msg_type, buf, limit, token);
        }

        let accepted = self.shared.scheduler.enqueue(
            SendItem {
                msg_type,
                payload: buf.to_vec(),
                token: Some(token.shared()),
            },
            limit,
        );
        if !accepted {
            token.shared().complete(Err(SessionError::AlreadyClosed));
            token.release();
            return Err(SessionError::AlreadyClosed);
        }
        Ok(token)
    }

    fn enqueue_fragmented(
        &self,
        msg_type: MessageType,
        buf: &[u8],
        limit: usize,
        token: SendToken,
    ) -> Result<SendToken, SessionError> {
        let max = self
            .shared
            .options
            .resolve_max_payload(limit as u32) as usize;
        let oversize = || SessionError::PayloadTooBig {
            size: buf.len(),
            limit: if self.shared.options.enable_fragmentation {
                max
            } else {
                limit
            },
        };
        let reject = |token: SendToken, err: SessionError| {
            token.shared().complete(Err(err.clone()));
            token.release();
            Err(err)
        };

        if !self.shared.options.enable_fragmentation || buf.len() > max {
            return reject(token, oversize());
        }
        let chunk_size = limit.saturating_sub(FRAGMENT_HEADER_SIZE);
        if chunk_size == 0 {
            return reject(token, oversize());
        }
        let Some(fragments) = self.shared.fragmenter.split(msg_type, buf, chunk_size) else {
            return reject(token, oversize());
        };

        let last = fragments.len() - 1;
        for (index, payload) in fragments.into_iter().enumerate() {
            // Only the final fragment carries the token: the send completes
            // when the packet containing the last fragment flushes.
            let item = SendItem {
                msg_type: MessageType::Fragment,
                payload,
                token: (index == last).then(|| token.shared()),
            };
            if !self.shared.scheduler.enqueue(item, limit) {
                return reject(token, SessionError::AlreadyClosed);
            }
        }
        Ok(token)
    }

    /// Register per-type message callbacks.
    ///
    /// `on_message` runs on the receive task, exactly once per received
    /// message of `msg_type`, in receive order; it must not block. An error
    /// it returns is routed to `on_error`.
    pub fn set_handler_funcs<F, E>(&self, msg_type: MessageType, on_message: F, on_error: E)
    where
        F: Fn(&[u8]) -> Result<(), SessionError> + Send + Sync + 'static,
        E: Fn(SessionError) + Send + Sync + 'static,
    {
        let entry = Arc::new(HandlerEntry {
            on_message: Box::new(on_message),
            on_error: Box::new(on_error),
        });
        self.shared
            .handlers
            .write()
            .expect("handler table lock poisoned")
            .insert(msg_type.to_wire(), entry);
    }

    /// Suspend (`true`) or resume (`false`) the receive loop and flusher so
    /// a harness can inspect the underlying transport. Non-destructive to
    /// in-flight merge slots.
    pub fn set_pause(&self, paused: bool) -> Result<(), SessionError> {
        let state = *self.shared.state_tx.borrow();
        if state >= SessionState::Closing {
            return Err(SessionError::AlreadyClosed);
        }
        if state < SessionState::Established {
            return Err(SessionError::NotReady(state));
        }
        self.shared.paused_tx.send_replace(paused);
        Ok(())
    }

    /// The session identifier.
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    /// Effective maximum plaintext payload per packet.
    pub fn payload_size_limit(&self) -> u32 {
        self.shared.payload_limit.load(Ordering::Relaxed)
    }

    /// Effective maximum packet size on the wire.
    pub fn packet_size_limit(&self) -> u32 {
        self.shared.packet_size_limit()
    }

    /// Number of packets dropped by the replay filter.
    pub fn unexpected_packet_id_count(&self) -> u64 {
        self.shared
            .unexpected_packet_id_count
            .load(Ordering::Relaxed)
    }

    /// Snapshot of the key ring's raw keys, oldest slot first.
    pub fn cipher_keys(&self) -> [Option<[u8; 32]>; 4] {
        self.shared.keyring.snapshot()
    }
}

//! Pooled send acknowledgement tokens.
//!
//! A [`SendToken`] represents one logical send. It is acquired from the
//! session's pool when the write is accepted, signaled exactly once when the
//! coalesced packet completes its transport write, and optionally released
//! back to the pool by the caller to reduce allocator pressure.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::core::error::SessionError;

/// Shared state behind a [`SendToken`].
pub(crate) struct TokenShared {
    send_id: AtomicU64,
    result: Mutex<Option<Result<usize, SessionError>>>,
    notify: Notify,
    busy: AtomicBool,
    cancel: CancellationToken,
}

impl TokenShared {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            send_id: AtomicU64::new(0),
            result: Mutex::new(None),
            notify: Notify::new(),
            busy: AtomicBool::new(true),
            cancel,
        }
    }

    /// Signal completion. Must happen exactly once per acquisition.
    pub(crate) fn complete(&self, result: Result<usize, SessionError>) {
        let mut guard = self.result.lock().expect("token lock poisoned");
        assert!(guard.is_none(), "send token completed twice");
        *guard = Some(result);
        drop(guard);
        self.notify.notify_waiters();
    }

    fn result(&self) -> Option<Result<usize, SessionError>> {
        self.result.lock().expect("token lock poisoned").clone()
    }
}

/// Pool of token allocations, owned by the session.
pub(crate) struct TokenPool {
    free: Mutex<Vec<Arc<TokenShared>>>,
    next_send_id: AtomicU64,
    cancel: CancellationToken,
}

impl TokenPool {
    pub(crate) fn new(cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            next_send_id: AtomicU64::new(1),
            cancel,
        })
    }

    /// Take a token out of the pool, resetting its state.
    pub(crate) fn acquire(self: &Arc<Self>, flush: Arc<Notify>) -> SendToken {
        let shared = self
            .free
            .lock()
            .expect("token pool lock poisoned")
            .pop()
            .unwrap_or_else(|| Arc::new(TokenShared::new(self.cancel.clone())));
        assert!(
            !shared.busy.swap(true, Ordering::AcqRel),
            "acquired a busy send token"
        );
        *shared.result.lock().expect("token lock poisoned") = None;
        shared
            .send_id
            .store(self.next_send_id.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        SendToken {
            shared,
            pool: Arc::clone(self),
            flush,
        }
    }

    fn put(&self, shared: Arc<TokenShared>) {
        assert!(
            shared.busy.swap(false, Ordering::AcqRel),
            "released a token that was not busy"
        );
        // The flusher may still hold its clone for a completed slot; in that
        // case the allocation is simply dropped instead of pooled.
        if Arc::strong_count(&shared) == 1 {
            self.free
                .lock()
                .expect("token pool lock poisoned")
                .push(shared);
        }
    }
}

/// Acknowledgement handle for one asynchronous send.
pub struct SendToken {
    shared: Arc<TokenShared>,
    pool: Arc<TokenPool>,
    flush: Arc<Notify>,
}

impl SendToken {
    /// Unique id of this send request.
    pub fn send_id(&self) -> u64 {
        self.shared.send_id.load(Ordering::Relaxed)
    }

    /// Whether the send has completed.
    pub fn is_done(&self) -> bool {
        self.shared.result().is_some()
    }

    /// The completed result: bytes written by the merged transport write.
    ///
    /// `None` until the token is signaled.
    pub fn result(&self) -> Option<Result<usize, SessionError>> {
        self.shared.result()
    }

    /// Wait until the merged packet carrying this send has been written.
    ///
    /// Resolves with [`SessionError::Canceled`] if the session shuts down
    /// before the packet is flushed.
    pub async fn wait(&self) -> Result<usize, SessionError> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(result) = self.shared.result() {
                return result;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.shared.cancel.cancelled() => {
                    return self
                        .shared
                        .result()
                        .unwrap_or(Err(SessionError::Canceled));
                }
            }
        }
    }

    /// Belay the remaining send delay, flush immediately, and wait.
    pub async fn send_now_and_wait(&self) -> Result<usize, SessionError> {
        self.flush.notify_one();
        self.wait().await
    }

    /// Return the token to the pool.
    ///
    /// Optional; only useful for high-rate senders. Calling this on a token
    /// that is neither completed nor cancelled is a programmer error and
    /// panics.
    pub fn release(self) {
        if !self.is_done() && !self.shared.cancel.is_cancelled() {
            panic!("release() called on an unfinished send token");
        }
        let SendToken { shared, pool, .. } = self;
        pool.put(shared);
    }

    /// The shared state, for the scheduler to complete later.
    pub(crate) fn shared(&self) -> Arc<TokenShared> {
        Arc::clone(&self.shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> (Arc<TokenPool>, Arc<Notify>, CancellationToken) {
        let cancel = CancellationToken::new();
        (TokenPool::new(cancel.clone()), Arc::new(Notify::new()), cancel)
    }

    #[tokio::test]
    async fn wait_returns_completed_result() {
        let (pool, flush, _cancel) = pool();
        let token = pool.acquire(flush);
        let shared = token.shared();

        let waiter = tokio::spawn(async move { token.wait().await });
        tokio::task::yield_now().await;
        shared.complete(Ok(128));

        assert_eq!(waiter.await.unwrap().unwrap(), 128);
    }

    #[tokio::test]
    async fn cancellation_resolves_pending_waits() {
        let (pool, flush, cancel) = pool();
        let token = pool.acquire(flush);
        cancel.cancel();
        assert!(matches!(token.wait().await, Err(SessionError::Canceled)));
    }

    #[tokio::test]
    async fn release_recycles_allocation() {
        let (pool, flush, _cancel) = pool();
        let token = pool.acquire(Arc::clone(&flush));
        let first_id = token.send_id();
        token.shared().complete(Ok(1));
        token.release();

        let token = pool.acquire(flush);
        assert_ne!(token.send_id(), first_id);
        token.shared().complete(Ok(2));
        token.release();
    }

    #[tokio::test]
    #[should_panic(expected = "unfinished send token")]
    async fn releasing_unfinished_token_panics() {
        let (pool, flush, _cancel) = pool();
        let token = pool.acquire(flush);
        token.release();
    }

    #[tokio::test]
    #[should_panic(expected = "completed twice")]
    async fn double_completion_panics() {
        let (pool, flush, _cancel) = pool();
        let token = pool.acquire(flush);
        token.shared().complete(Ok(1));
        token.shared().complete(Ok(2));
    }
}

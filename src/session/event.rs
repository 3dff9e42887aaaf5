//! Session event callbacks.

use crate::core::error::SessionError;

use super::state::SessionId;

/// Callbacks a session invokes on lifecycle events.
///
/// Callbacks run on the session's background tasks and must not block.
pub trait EventHandler: Send + Sync {
    /// The session reached `Established` for the first time.
    fn on_connect(&self, _id: &SessionId) {}

    /// An error surfaced. Returning `false` closes the session; fatal
    /// errors close it regardless of the return value.
    fn on_error(&self, _err: &SessionError) -> bool {
        true
    }

    /// Debug diagnostics, emitted when `enable_debug` is set.
    fn on_debug(&self, _msg: &str) {}

    /// Info diagnostics, emitted when `enable_info` is set.
    fn on_info(&self, _msg: &str) {}
}

/// Handler that ignores every event.
pub struct NopEventHandler;

impl EventHandler for NopEventHandler {}

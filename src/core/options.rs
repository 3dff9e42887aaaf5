//! Session configuration.

use std::time::Duration;

use crate::core::constants::{
    DEFAULT_DECRYPT_FAIL_THRESHOLD, DEFAULT_KEY_UPDATE_INTERVAL, DEFAULT_MAX_PAYLOAD_SIZE,
    DEFAULT_PAYLOAD_SIZE_LIMIT, DEFAULT_RETRY_INTERVAL, DEFAULT_SEND_DELAY, PACKET_OVERHEAD,
};

/// Whether a party acknowledges installed keys and whether senders block on
/// the acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnswersMode {
    /// No answers are emitted; the new key is confirmed by its first
    /// successful use.
    Disable,
    /// Answers are emitted; application sends do not wait for them.
    #[default]
    AnswerAndContinue,
    /// Answers are emitted; application sends block until the peer has
    /// acknowledged the newest installed key.
    AnswerAndWait,
}

impl AnswersMode {
    /// Wire encoding of the mode (carried in every key-exchange message).
    pub fn as_byte(self) -> u8 {
        match self {
            AnswersMode::Disable => 0,
            AnswersMode::AnswerAndContinue => 1,
            AnswersMode::AnswerAndWait => 2,
        }
    }

    /// Parse the wire encoding. Unknown values map to the default so newer
    /// peers remain compatible.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => AnswersMode::Disable,
            2 => AnswersMode::AnswerAndWait,
            _ => AnswersMode::AnswerAndContinue,
        }
    }

    /// A `Disable` side paired with an `AnswerAndWait` side deadlocks by
    /// construction, so the combination is rejected.
    pub fn conflicts_with(self, peer: AnswersMode) -> bool {
        matches!(
            (self, peer),
            (AnswersMode::Disable, AnswersMode::AnswerAndWait)
                | (AnswersMode::AnswerAndWait, AnswersMode::Disable)
        )
    }
}

/// Key exchanger configuration.
#[derive(Debug, Clone)]
pub struct KeyExchangerOptions {
    /// Answer emission policy, see [`AnswersMode`].
    pub answers_mode: AnswersMode,
    /// Re-key cadence.
    pub key_update_interval: Duration,
    /// Handshake retransmit interval (exponential backoff, capped).
    pub retry_interval: Duration,
    /// Optional pre-shared key mixed into the key derivation.
    pub psk: Option<Vec<u8>>,
}

impl Default for KeyExchangerOptions {
    fn default() -> Self {
        Self {
            answers_mode: AnswersMode::default(),
            key_update_interval: DEFAULT_KEY_UPDATE_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            psk: None,
        }
    }
}

/// Whether the pre-handshake parameter exchange runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiatorEnable {
    /// Negotiate only when the transport reports an MTU hint.
    #[default]
    Auto,
    /// Always negotiate; failure to complete is fatal.
    True,
    /// Never negotiate.
    False,
}

/// Negotiator configuration.
#[derive(Debug, Clone, Default)]
pub struct NegotiatorOptions {
    /// See [`NegotiatorEnable`].
    pub enable: NegotiatorEnable,
}

/// Session configuration. All fields have usable defaults.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Emit debug-level diagnostics.
    pub enable_debug: bool,
    /// Emit info-level diagnostics.
    pub enable_info: bool,
    /// Maximum plaintext payload per packet. `None` derives the value from
    /// the transport MTU hint, falling back to
    /// [`DEFAULT_PAYLOAD_SIZE_LIMIT`].
    pub payload_size_limit: Option<u32>,
    /// Cap on a single write before fragmentation is required. `None`
    /// defaults to [`DEFAULT_MAX_PAYLOAD_SIZE`] when fragmentation is
    /// enabled, else to the payload size limit.
    pub max_payload_size: Option<u32>,
    /// Allow payloads larger than the payload size limit to be split.
    pub enable_fragmentation: bool,
    /// Merge window for coalescing sends. `None` auto-tunes; zero disables
    /// batching entirely.
    pub send_delay: Option<Duration>,
    /// Consecutive decrypt failures tolerated before the session errors.
    pub error_on_sequential_decrypt_fails: Option<u64>,
    /// Key exchanger configuration.
    pub key_exchanger: KeyExchangerOptions,
    /// Negotiator configuration.
    pub negotiator: NegotiatorOptions,
}

impl SessionOptions {
    /// Effective payload size limit, given the transport's MTU hint.
    ///
    /// Clamped to `u16::MAX` because container length fields are 16-bit.
    pub(crate) fn resolve_payload_limit(&self, mtu_hint: Option<usize>) -> u32 {
        let limit = match self.payload_size_limit {
            Some(v) => v,
            None => match mtu_hint {
                Some(mtu) if mtu > PACKET_OVERHEAD => (mtu - PACKET_OVERHEAD) as u32,
                _ => DEFAULT_PAYLOAD_SIZE_LIMIT,
            },
        };
        limit.min(u16::MAX as u32)
    }

    /// Effective cap on a single write.
    pub(crate) fn resolve_max_payload(&self, payload_limit: u32) -> u32 {
        match self.max_payload_size {
            Some(v) => v,
            None if self.enable_fragmentation => DEFAULT_MAX_PAYLOAD_SIZE,
            None => payload_limit,
        }
    }

    /// Effective merge window; `None` means batching is disabled.
    pub(crate) fn resolve_send_delay(&self) -> Option<Duration> {
        match self.send_delay {
            Some(d) if d.is_zero() => None,
            Some(d) => Some(d),
            None => Some(DEFAULT_SEND_DELAY),
        }
    }

    /// Effective sequential decrypt failure threshold.
    pub(crate) fn resolve_decrypt_fail_threshold(&self) -> u64 {
        self.error_on_sequential_decrypt_fails
            .unwrap_or(DEFAULT_DECRYPT_FAIL_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_limit_from_mtu_hint() {
        let opts = SessionOptions::default();
        assert_eq!(
            opts.resolve_payload_limit(Some(1432)),
            (1432 - PACKET_OVERHEAD) as u32
        );
        assert_eq!(opts.resolve_payload_limit(None), DEFAULT_PAYLOAD_SIZE_LIMIT);
    }

    #[test]
    fn payload_limit_clamped_to_u16() {
        let opts = SessionOptions {
            payload_size_limit: Some(1 << 20),
            ..Default::default()
        };
        assert_eq!(opts.resolve_payload_limit(None), u16::MAX as u32);
    }

    #[test]
    fn max_payload_tracks_fragmentation() {
        let frag = SessionOptions {
            enable_fragmentation: true,
            ..Default::default()
        };
        assert_eq!(frag.resolve_max_payload(1000), DEFAULT_MAX_PAYLOAD_SIZE);

        let plain = SessionOptions::default();
        assert_eq!(plain.resolve_max_payload(1000), 1000);
    }

    #[test]
    fn zero_send_delay_disables_batching() {
        let opts = SessionOptions {
            send_delay: Some(Duration::ZERO),
            ..Default::default()
        };
        assert_eq!(opts.resolve_send_delay(), None);
        assert_eq!(
            SessionOptions::default().resolve_send_delay(),
            Some(DEFAULT_SEND_DELAY)
        );
    }

    #[test]
    fn answers_mode_conflicts() {
        assert!(AnswersMode::Disable.conflicts_with(AnswersMode::AnswerAndWait));
        assert!(AnswersMode::AnswerAndWait.conflicts_with(AnswersMode::Disable));
        assert!(!AnswersMode::Disable.conflicts_with(AnswersMode::AnswerAndContinue));
        assert!(!AnswersMode::AnswerAndWait.conflicts_with(AnswersMode::AnswerAndWait));
    }
}

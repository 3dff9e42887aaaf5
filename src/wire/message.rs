//! Message-container codec and the message type space.

use crate::core::constants::MESSAGE_HEADER_SIZE;
use crate::core::error::WireError;

/// First wire value of the application range; `Channel(0)` encodes here.
const CHANNEL_BASE: u16 = 9;

/// Type of one logical message inside a packet.
///
/// System types drive the protocol itself; application payloads travel as
/// [`MessageType::ReadWrite`] (the synchronous read/write stream) or
/// [`MessageType::Channel`] (named logical channels with registered
/// handlers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Signed ephemeral key exchange.
    KeyExchange,
    /// Acknowledgement of an installed key.
    KeyExchangeAnswer,
    /// Keepalive probe.
    Ping,
    /// Keepalive reply.
    Pong,
    /// One fragment of an oversized message.
    Fragment,
    /// Reserved fragment acknowledgement.
    FragmentAck,
    /// Pre-handshake parameter exchange.
    Negotiation,
    /// Graceful close notification.
    CloseNotify,
    /// Default application stream, delivered through `read`.
    ReadWrite,
    /// Numbered application channel, delivered through a registered handler.
    Channel(u16),
}

impl MessageType {
    /// Wire encoding of the type.
    pub fn to_wire(self) -> u16 {
        match self {
            MessageType::KeyExchange => 0,
            MessageType::KeyExchangeAnswer => 1,
            MessageType::Ping => 2,
            MessageType::Pong => 3,
            MessageType::Fragment => 4,
            MessageType::FragmentAck => 5,
            MessageType::Negotiation => 6,
            MessageType::CloseNotify => 7,
            MessageType::ReadWrite => 8,
            MessageType::Channel(n) => CHANNEL_BASE + n,
        }
    }

    /// Decode the wire encoding. Every value is valid: the range above the
    /// system types is the channel space.
    pub fn from_wire(wire: u16) -> Self {
        match wire {
            0 => MessageType::KeyExchange,
            1 => MessageType::KeyExchangeAnswer,
            2 => MessageType::Ping,
            3 => MessageType::Pong,
            4 => MessageType::Fragment,
            5 => MessageType::FragmentAck,
            6 => MessageType::Negotiation,
            7 => MessageType::CloseNotify,
            8 => MessageType::ReadWrite,
            n => MessageType::Channel(n - CHANNEL_BASE),
        }
    }

    /// Whether this is a protocol-internal type.
    pub fn is_system(self) -> bool {
        self.to_wire() < 8
    }

    /// Whether this type may appear in a plaintext handshake packet.
    pub fn allowed_in_handshake(self) -> bool {
        matches!(
            self,
            MessageType::KeyExchange | MessageType::KeyExchangeAnswer | MessageType::Negotiation
        )
    }
}

/// Append one message container to `buf`.
///
/// The body length must fit the 16-bit length field; callers enforce the
/// payload size limit which is itself clamped below `u16::MAX`.
pub fn encode_message(buf: &mut Vec<u8>, msg_type: MessageType, body: &[u8]) {
    debug_assert!(body.len() <= u16::MAX as usize);
    buf.extend_from_slice(&msg_type.to_wire().to_le_bytes());
    buf.extend_from_slice(&(body.len() as u16).to_le_bytes());
    buf.extend_from_slice(body);
}

/// Iterator over the message containers of a decrypted packet body.
pub struct MessageIter<'a> {
    buf: &'a [u8],
}

impl<'a> MessageIter<'a> {
    /// Iterate over `buf` as a container sequence.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Result<(MessageType, &'a [u8]), WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        if self.buf.len() < MESSAGE_HEADER_SIZE {
            let err = WireError::TooShort {
                expected: MESSAGE_HEADER_SIZE,
                actual: self.buf.len(),
            };
            self.buf = &[];
            return Some(Err(err));
        }
        let wire_type = u16::from_le_bytes([self.buf[0], self.buf[1]]);
        let length = u16::from_le_bytes([self.buf[2], self.buf[3]]) as usize;
        let remaining = self.buf.len() - MESSAGE_HEADER_SIZE;
        if length > remaining {
            self.buf = &[];
            return Some(Err(WireError::LengthOverrun { length, remaining }));
        }
        let body = &self.buf[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + length];
        self.buf = &self.buf[MESSAGE_HEADER_SIZE + length..];
        Some(Ok((MessageType::from_wire(wire_type), body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_wire_roundtrip() {
        let types = [
            MessageType::KeyExchange,
            MessageType::KeyExchangeAnswer,
            MessageType::Ping,
            MessageType::Pong,
            MessageType::Fragment,
            MessageType::FragmentAck,
            MessageType::Negotiation,
            MessageType::CloseNotify,
            MessageType::ReadWrite,
            MessageType::Channel(0),
            MessageType::Channel(41),
        ];
        for ty in types {
            assert_eq!(MessageType::from_wire(ty.to_wire()), ty);
        }
        assert_eq!(MessageType::Channel(0).to_wire(), 9);
    }

    #[test]
    fn system_partition() {
        assert!(MessageType::KeyExchange.is_system());
        assert!(MessageType::CloseNotify.is_system());
        assert!(!MessageType::ReadWrite.is_system());
        assert!(!MessageType::Channel(0).is_system());
    }

    #[test]
    fn encode_parse_sequence() {
        let mut buf = Vec::new();
        encode_message(&mut buf, MessageType::ReadWrite, b"hello");
        encode_message(&mut buf, MessageType::Channel(2), b"");
        encode_message(&mut buf, MessageType::Ping, &[1, 2, 3]);

        let parsed: Vec<_> = MessageIter::new(&buf).collect::<Result<_, _>>().unwrap();
        assert_eq!(
            parsed,
            vec![
                (MessageType::ReadWrite, b"hello".as_slice()),
                (MessageType::Channel(2), b"".as_slice()),
                (MessageType::Ping, [1, 2, 3].as_slice()),
            ]
        );
    }

    #[test]
    fn length_overrun_rejected() {
        let mut buf = Vec::new();
        encode_message(&mut buf, MessageType::ReadWrite, b"hello");
        buf[2] = 0xFF; // inflate the declared length
        let mut iter = MessageIter::new(&buf);
        assert!(matches!(
            iter.next(),
            Some(Err(WireError::LengthOverrun { .. }))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn truncated_header_rejected() {
        let buf = [0u8, 0, 5];
        let mut iter = MessageIter::new(&buf);
        assert!(matches!(iter.next(), Some(Err(WireError::TooShort { .. }))));
    }
}

//! Transport abstraction.
//!
//! A session runs over any packet-oriented byte transport: a connected UDP
//! socket, a pipe, or the in-memory [`packet_pipe`] used by the tests. The
//! transport carries whole packets; framing within a packet is the wire
//! codec's job.

mod pipe;

use std::io;

use async_trait::async_trait;
use tokio::net::UdpSocket;

pub use pipe::{packet_pipe, PipeTransport};

/// Recommended MTU assumption for UDP transports.
pub const UDP_MTU: usize = 1432;

/// A bidirectional packet transport.
///
/// Implementations must be datagram-shaped: one `send` carries one packet
/// and one `recv` returns exactly one packet. `recv` must be cancel-safe
/// (dropping the future loses no packet).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one packet, returning the number of bytes written.
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Receive one packet into `buf`, returning its length.
    ///
    /// Returns `ErrorKind::UnexpectedEof` when the peer is gone.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Maximum datagram size hint, if the transport knows one.
    fn max_datagram_size(&self) -> Option<usize> {
        None
    }

    /// Whether the transport delivers packets reliably and in order.
    fn is_reliable(&self) -> bool {
        true
    }
}

/// A connected UDP socket is the canonical unreliable transport.
#[async_trait]
impl Transport for UdpSocket {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }

    fn max_datagram_size(&self) -> Option<usize> {
        Some(UDP_MTU)
    }

    fn is_reliable(&self) -> bool {
        false
    }
}

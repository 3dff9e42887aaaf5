//! In-memory packet pipe for tests and local wiring.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::Transport;

/// One end of an in-memory packet pipe.
///
/// Cloning yields another handle to the same end, sharing the receive
/// queue; a test harness can hold a clone to tap or inject traffic while a
/// session owns the original.
#[derive(Clone)]
pub struct PipeTransport {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    mtu: Option<usize>,
}

/// Create a connected pair of in-memory packet transports.
pub fn packet_pipe(capacity: usize) -> (PipeTransport, PipeTransport) {
    let (tx_a, rx_b) = mpsc::channel(capacity);
    let (tx_b, rx_a) = mpsc::channel(capacity);
    (
        PipeTransport {
            tx: tx_a,
            rx: Arc::new(Mutex::new(rx_a)),
            mtu: None,
        },
        PipeTransport {
            tx: tx_b,
            rx: Arc::new(Mutex::new(rx_b)),
            mtu: None,
        },
    )
}

impl PipeTransport {
    /// Attach an MTU hint, e.g. to exercise negotiation in tests.
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = Some(mtu);
        self
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe peer dropped"))?;
        Ok(buf.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // The mutex is released if the future is dropped mid-wait, and
        // `mpsc::Receiver::recv` is cancel-safe, so a cancelled recv (pause,
        // shutdown) loses no packet.
        let mut rx = self.rx.lock().await;
        let packet = rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "pipe closed"))?;
        if packet.len() > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "packet larger than receive buffer",
            ));
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    fn max_datagram_size(&self) -> Option<usize> {
        self.mtu
    }
}

//! # Peer Channels
//!
//! One [`Channel`] wraps one TCP connection to a peer. Writes go through an
//! unbounded queue drained by a dedicated writer task, so senders stay
//! synchronous and per-connection ordering is preserved. The read half is
//! parked inside the channel as a framed reader; whichever relay role is
//! active takes it, runs its read loop, and restores it on deactivation.

use crate::core::codec::{Frame, FrameCodec};
use crate::core::packet::{encode_frame, ParsedPacket};
use crate::error::{MeshError, Result};
use crate::utils::lock;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::debug;

/// Framed read half of a channel. Exactly one task reads from it at a time.
pub type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;

/// Handle to one live peer connection.
#[derive(Debug)]
pub struct Channel {
    peer_addr: SocketAddr,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    reader: Mutex<Option<FrameReader>>,
}

impl Channel {
    /// Wrap a connected stream, spawning its writer task.
    pub fn spawn(stream: TcpStream) -> Result<std::sync::Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        tokio::spawn(async move {
            // Drains queued frames even after the sender side is dropped,
            // so a close still flushes pending control frames.
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = write_half.write_all(&bytes).await {
                    debug!(error = %e, "channel writer stopping");
                    break;
                }
            }
        });

        Ok(std::sync::Arc::new(Self {
            peer_addr,
            tx: Mutex::new(Some(tx)),
            reader: Mutex::new(Some(FramedRead::new(read_half, FrameCodec))),
        }))
    }

    /// Remote address of this connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queue raw frame bytes for transmission.
    pub fn send(&self, frame: Bytes) -> Result<()> {
        let guard = lock(&self.tx);
        match guard.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| MeshError::ConnectionClosed),
            None => Err(MeshError::ConnectionClosed),
        }
    }

    /// Encode and queue a packet.
    pub fn send_packet(&self, sender_id: i32, packet: &ParsedPacket) -> Result<()> {
        self.send(encode_frame(sender_id, packet)?)
    }

    /// Take the framed read half. Returns `None` if another task holds it.
    pub fn take_reader(&self) -> Option<FrameReader> {
        lock(&self.reader).take()
    }

    /// Return the framed read half after a read loop winds down, keeping
    /// any bytes it had buffered.
    pub fn restore_reader(&self, reader: FrameReader) {
        *lock(&self.reader) = Some(reader);
    }

    /// Stop accepting writes. The writer task drains what was already
    /// queued and then drops its half of the socket.
    pub fn close(&self) {
        lock(&self.tx).take();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        lock(&self.tx).is_none()
    }
}

/// Convenience for read loops: the next frame, or `None` on a clean end of
/// stream. Decode errors poison the connection and are surfaced as errors.
pub async fn next_frame(reader: &mut FrameReader) -> Result<Option<Frame>> {
    use futures::StreamExt;
    match reader.next().await {
        Some(Ok(frame)) => Ok(Some(frame)),
        Some(Err(e)) => Err(e),
        None => Ok(None),
    }
}

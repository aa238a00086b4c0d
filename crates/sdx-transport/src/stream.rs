use std::time::{Duration, Instant};

use sdx_core::PeerId;
use thiserror::Error;

/// Errors surfaced by stream reads/writes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The per-operation deadline elapsed.
    #[error("stream deadline exceeded")]
    TimedOut,
    /// The peer closed the stream or the connection dropped.
    #[error("stream closed")]
    Closed,
    /// Transport-level failure; retriable by reconnecting.
    #[error("stream i/o error: {0}")]
    Io(String),
}

/// Errors surfaced by transport control operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// No route to the requested peer.
    #[error("unknown peer")]
    UnknownPeer,
    /// The peer's inbound queue is full; the payload was dropped.
    #[error("peer backpressured")]
    Backpressure,
    /// The transport has shut down.
    #[error("transport closed")]
    Closed,
    /// Stream/handshake establishment failed.
    #[error("connect failed: {0}")]
    Connect(String),
    /// Transport-level send/receive failure; retriable.
    #[error("transport i/o error: {0}")]
    Io(String),
}

/// One authenticated duplex byte stream between two peers.
///
/// Reads and writes observe the configured deadline; implementations check
/// it at every blocking boundary.
pub trait DuplexStream: Send {
    /// Reads up to `buf.len()` bytes; `Ok(0)` signals a clean end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError>;
    /// Writes the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> Result<(), StreamError>;
    /// Sets the deadline applied to subsequent reads and writes.
    fn set_deadline(&mut self, deadline: Option<Instant>);
    /// Closes both directions; subsequent peer reads see end of stream.
    fn close(&mut self);

    /// Reads exactly `buf.len()` bytes.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                0 => return Err(StreamError::Closed),
                n => filled += n,
            }
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, StreamError> {
        let mut raw = [0_u8; 1];
        self.read_exact(&mut raw)?;
        Ok(raw[0])
    }

    fn read_u16_be(&mut self) -> Result<u16, StreamError> {
        let mut raw = [0_u8; 2];
        self.read_exact(&mut raw)?;
        Ok(u16::from_be_bytes(raw))
    }

    fn read_u32_be(&mut self) -> Result<u32, StreamError> {
        let mut raw = [0_u8; 4];
        self.read_exact(&mut raw)?;
        Ok(u32::from_be_bytes(raw))
    }
}

/// An inbound stream accepted from a remote peer.
pub struct InboundStream {
    pub peer: PeerId,
    pub protocol: String,
    pub stream: Box<dyn DuplexStream>,
}

/// Byte transport between authenticated peer identifiers.
///
/// Implementations authenticate the remote identity during connection
/// establishment; a delivered `PeerId` can be trusted by the caller.
pub trait StreamTransport: Send + Sync {
    /// The local node's stable peer identifier.
    fn local_peer(&self) -> PeerId;

    /// Opens an outbound duplex stream speaking `protocol`.
    fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
    ) -> Result<Box<dyn DuplexStream>, TransportError>;

    /// Waits up to `timeout` for the next inbound stream.
    fn poll_inbound_stream(&self, timeout: Duration) -> Option<InboundStream>;

    /// Sends one best-effort datagram (the gossip lane).
    fn send_datagram(&self, peer: &PeerId, bytes: &[u8]) -> Result<(), TransportError>;

    /// Waits up to `timeout` for the next inbound datagram.
    fn poll_datagram(&self, timeout: Duration) -> Option<(PeerId, Vec<u8>)>;

    /// Severs connectivity with a peer (e.g. one that stays slow).
    fn drop_peer(&self, peer: &PeerId);

    /// Peers currently reachable from this transport.
    fn connected_peers(&self) -> Vec<PeerId>;
}

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use sdx_core::PeerId;
use tracing::debug;

use crate::stream::{
    DuplexStream, InboundStream, StreamError, StreamTransport, TransportError,
};

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Default)]
struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    cond: Condvar,
}

impl Pipe {
    fn push(&self, bytes: &[u8]) -> Result<(), StreamError> {
        let mut state = self.state.lock().expect("pipe lock poisoned");
        if state.closed {
            return Err(StreamError::Closed);
        }
        state.buf.extend(bytes.iter().copied());
        self.cond.notify_all();
        Ok(())
    }

    fn pull(&self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize, StreamError> {
        let mut state = self.state.lock().expect("pipe lock poisoned");
        loop {
            if !state.buf.is_empty() {
                let n = buf.len().min(state.buf.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = state.buf.pop_front().unwrap_or(0);
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            match deadline {
                None => {
                    state = self
                        .cond
                        .wait(state)
                        .expect("pipe lock poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(StreamError::TimedOut);
                    }
                    let (next, timeout) = self
                        .cond
                        .wait_timeout(state, deadline - now)
                        .expect("pipe lock poisoned");
                    state = next;
                    if timeout.timed_out() && state.buf.is_empty() && !state.closed {
                        return Err(StreamError::TimedOut);
                    }
                }
            }
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("pipe lock poisoned");
        state.closed = true;
        self.cond.notify_all();
    }
}

/// In-process duplex stream half backed by a pair of byte pipes.
pub struct MemoryStream {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
    deadline: Option<Instant>,
}

impl MemoryStream {
    /// Creates a connected pair of stream halves.
    pub fn pair() -> (MemoryStream, MemoryStream) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());
        (
            MemoryStream {
                incoming: Arc::clone(&b_to_a),
                outgoing: Arc::clone(&a_to_b),
                deadline: None,
            },
            MemoryStream {
                incoming: a_to_b,
                outgoing: b_to_a,
                deadline: None,
            },
        )
    }
}

impl DuplexStream for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.incoming.pull(buf, self.deadline)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), StreamError> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(StreamError::TimedOut);
            }
        }
        self.outgoing.push(buf)
    }

    fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    fn close(&mut self) {
        self.incoming.close();
        self.outgoing.close();
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.close();
    }
}

struct Endpoint {
    datagram_tx: SyncSender<(PeerId, Vec<u8>)>,
    stream_tx: SyncSender<InboundStream>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<PeerId, Endpoint>,
    severed: HashSet<(PeerId, PeerId)>,
}

fn pair_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// In-memory network hub connecting [`MemoryTransport`] endpoints.
///
/// Used by tests and the simulation harness; every registered endpoint can
/// reach every other one until a link is severed.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an endpoint with default queue capacities.
    pub fn register(&self, peer: PeerId) -> MemoryTransport {
        self.register_with_capacity(peer, DEFAULT_QUEUE_CAPACITY)
    }

    /// Registers an endpoint with an explicit inbound datagram capacity;
    /// small capacities are used to provoke backpressure in tests.
    pub fn register_with_capacity(&self, peer: PeerId, datagram_capacity: usize) -> MemoryTransport {
        let (datagram_tx, datagram_rx) = sync_channel(datagram_capacity.max(1));
        let (stream_tx, stream_rx) = sync_channel(DEFAULT_QUEUE_CAPACITY);
        let mut inner = self.inner.lock().expect("network lock poisoned");
        inner.endpoints.insert(
            peer,
            Endpoint {
                datagram_tx,
                stream_tx,
            },
        );
        MemoryTransport {
            local: peer,
            network: Arc::clone(&self.inner),
            datagram_rx: Mutex::new(datagram_rx),
            stream_rx: Mutex::new(stream_rx),
        }
    }

    /// Removes an endpoint entirely.
    pub fn deregister(&self, peer: &PeerId) {
        let mut inner = self.inner.lock().expect("network lock poisoned");
        inner.endpoints.remove(peer);
    }

    /// Severs the link between two peers in both directions.
    pub fn sever(&self, a: PeerId, b: PeerId) {
        let mut inner = self.inner.lock().expect("network lock poisoned");
        inner.severed.insert(pair_key(a, b));
    }

    /// Restores a previously severed link.
    pub fn heal(&self, a: PeerId, b: PeerId) {
        let mut inner = self.inner.lock().expect("network lock poisoned");
        inner.severed.remove(&pair_key(a, b));
    }
}

/// One endpoint of a [`MemoryNetwork`].
pub struct MemoryTransport {
    local: PeerId,
    network: Arc<Mutex<NetworkInner>>,
    datagram_rx: Mutex<Receiver<(PeerId, Vec<u8>)>>,
    stream_rx: Mutex<Receiver<InboundStream>>,
}

impl StreamTransport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
    ) -> Result<Box<dyn DuplexStream>, TransportError> {
        let inner = self.network.lock().expect("network lock poisoned");
        if inner.severed.contains(&pair_key(self.local, *peer)) {
            return Err(TransportError::UnknownPeer);
        }
        let endpoint = inner.endpoints.get(peer).ok_or(TransportError::UnknownPeer)?;
        let (local_half, remote_half) = MemoryStream::pair();
        match endpoint.stream_tx.try_send(InboundStream {
            peer: self.local,
            protocol: protocol.to_string(),
            stream: Box::new(remote_half),
        }) {
            Ok(()) => Ok(Box::new(local_half)),
            Err(TrySendError::Full(_)) => Err(TransportError::Backpressure),
            Err(TrySendError::Disconnected(_)) => Err(TransportError::UnknownPeer),
        }
    }

    fn poll_inbound_stream(&self, timeout: Duration) -> Option<InboundStream> {
        let rx = self.stream_rx.lock().expect("stream queue lock poisoned");
        rx.recv_timeout(timeout).ok()
    }

    fn send_datagram(&self, peer: &PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        let inner = self.network.lock().expect("network lock poisoned");
        if inner.severed.contains(&pair_key(self.local, *peer)) {
            return Err(TransportError::UnknownPeer);
        }
        let endpoint = inner.endpoints.get(peer).ok_or(TransportError::UnknownPeer)?;
        match endpoint.datagram_tx.try_send((self.local, bytes.to_vec())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::Backpressure),
            Err(TrySendError::Disconnected(_)) => Err(TransportError::UnknownPeer),
        }
    }

    fn poll_datagram(&self, timeout: Duration) -> Option<(PeerId, Vec<u8>)> {
        let rx = self.datagram_rx.lock().expect("datagram queue lock poisoned");
        rx.recv_timeout(timeout).ok()
    }

    fn drop_peer(&self, peer: &PeerId) {
        debug!(peer = %peer, "severing in-memory link");
        let mut inner = self.network.lock().expect("network lock poisoned");
        let key = pair_key(self.local, *peer);
        inner.severed.insert(key);
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let inner = self.network.lock().expect("network lock poisoned");
        let mut peers: Vec<PeerId> = inner
            .endpoints
            .keys()
            .copied()
            .filter(|p| *p != self.local)
            .filter(|p| !inner.severed.contains(&pair_key(self.local, *p)))
            .collect();
        peers.sort();
        peers
    }
}

//! TCP transport for SDX nodes.
//!
//! Every connection opens with a signed hello carrying the dialer's Ed25519
//! identity; both sides verify before any payload flows. One persistent
//! connection per peer pair carries length-delimited datagrams (the gossip
//! lane); each exchange stream dials a fresh connection tagged with its
//! protocol identifier.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut};
use sdx_core::{time::unix_time_millis, PeerId};
use sdx_crypto::signing::{verify_signature, IdentitySigner};
use sdx_transport::{
    DuplexStream, InboundStream, StreamError, StreamTransport, TransportError,
};
use tracing::{debug, warn};

const HELLO_MAGIC: &[u8; 4] = b"SDX1";
const CONN_KIND_DATAGRAM: u8 = 0;
const CONN_KIND_STREAM: u8 = 1;
/// Hellos older than this are refused to bound replay.
const MAX_HELLO_SKEW_MILLIS: i64 = 10 * 60 * 1000;
const MAX_DATAGRAM_LEN: usize = 256 * 1024;

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    pub bind_addr: SocketAddr,
    pub handshake_timeout: Duration,
    pub datagram_queue_capacity: usize,
    pub stream_queue_capacity: usize,
}

impl TcpTransportConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            handshake_timeout: Duration::from_secs(10),
            datagram_queue_capacity: 4096,
            stream_queue_capacity: 256,
        }
    }
}

struct Hello {
    kind: u8,
    protocol: String,
    peer: PeerId,
}

fn encode_hello(
    kind: u8,
    protocol: &str,
    signer: &dyn IdentitySigner,
) -> Result<Vec<u8>, TransportError> {
    let timestamp = unix_time_millis();
    let mut covered = Vec::with_capacity(4 + 1 + 2 + protocol.len() + 8);
    covered.extend_from_slice(HELLO_MAGIC);
    covered.push(kind);
    covered.extend_from_slice(protocol.as_bytes());
    covered.extend_from_slice(&timestamp.to_be_bytes());
    let signature = signer.sign(&covered);

    let proto = protocol.as_bytes();
    if proto.len() > u16::MAX as usize {
        return Err(TransportError::Connect("protocol id too long".to_string()));
    }
    let mut out = Vec::with_capacity(4 + 1 + 2 + proto.len() + 32 + 8 + 64);
    out.put_slice(HELLO_MAGIC);
    out.put_u8(kind);
    out.put_u16(proto.len() as u16);
    out.put_slice(proto);
    out.put_slice(signer.peer_id().as_bytes());
    out.put_i64(timestamp);
    out.put_slice(&signature);
    Ok(out)
}

fn read_hello(stream: &mut TcpStream) -> Result<Hello, TransportError> {
    let mut head = [0_u8; 7];
    read_all(stream, &mut head)?;
    let mut buf: &[u8] = &head;
    let mut magic = [0_u8; 4];
    buf.copy_to_slice(&mut magic);
    if &magic != HELLO_MAGIC {
        return Err(TransportError::Connect("bad hello magic".to_string()));
    }
    let kind = buf.get_u8();
    if kind != CONN_KIND_DATAGRAM && kind != CONN_KIND_STREAM {
        return Err(TransportError::Connect("bad connection kind".to_string()));
    }
    let proto_len = buf.get_u16() as usize;
    if proto_len > 1024 {
        return Err(TransportError::Connect("protocol id too long".to_string()));
    }
    let mut rest = vec![0_u8; proto_len + 32 + 8 + 64];
    read_all(stream, &mut rest)?;
    let mut rest_buf: &[u8] = &rest;
    let proto_raw = rest_buf.copy_to_bytes(proto_len);
    let protocol = std::str::from_utf8(&proto_raw)
        .map_err(|_| TransportError::Connect("protocol id not utf-8".to_string()))?
        .to_string();
    let mut pubkey = [0_u8; 32];
    rest_buf.copy_to_slice(&mut pubkey);
    let timestamp = rest_buf.get_i64();
    let mut signature = [0_u8; 64];
    rest_buf.copy_to_slice(&mut signature);

    if (unix_time_millis() - timestamp).abs() > MAX_HELLO_SKEW_MILLIS {
        return Err(TransportError::Connect("hello timestamp skew".to_string()));
    }
    let mut covered = Vec::with_capacity(4 + 1 + protocol.len() + 8);
    covered.extend_from_slice(HELLO_MAGIC);
    covered.push(kind);
    covered.extend_from_slice(protocol.as_bytes());
    covered.extend_from_slice(&timestamp.to_be_bytes());
    if !verify_signature(&PeerId(pubkey), &covered, &signature) {
        return Err(TransportError::Connect("hello signature invalid".to_string()));
    }
    Ok(Hello {
        kind,
        protocol,
        peer: PeerId(pubkey),
    })
}

fn read_all(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), TransportError> {
    stream
        .read_exact(buf)
        .map_err(|e| TransportError::Connect(e.to_string()))
}

/// Duplex stream over one TCP connection.
pub struct TcpDuplexStream {
    stream: TcpStream,
    deadline: Option<Instant>,
}

impl TcpDuplexStream {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            deadline: None,
        }
    }

    fn apply_deadline(&self) -> Result<(), StreamError> {
        let timeout = match self.deadline {
            None => None,
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(StreamError::TimedOut);
                }
                Some(deadline - now)
            }
        };
        self.stream
            .set_read_timeout(timeout)
            .map_err(|e| StreamError::Io(e.to_string()))?;
        self.stream
            .set_write_timeout(timeout)
            .map_err(|e| StreamError::Io(e.to_string()))?;
        Ok(())
    }
}

impl DuplexStream for TcpDuplexStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        self.apply_deadline()?;
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(StreamError::TimedOut)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof
                ) =>
            {
                Err(StreamError::Closed)
            }
            Err(e) => Err(StreamError::Io(e.to_string())),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), StreamError> {
        self.apply_deadline()?;
        match self.stream.write_all(buf) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(StreamError::TimedOut)
            }
            Err(e)
                if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::BrokenPipe) =>
            {
                Err(StreamError::Closed)
            }
            Err(e) => Err(StreamError::Io(e.to_string())),
        }
    }

    fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

struct SharedState {
    signer: Arc<dyn IdentitySigner>,
    peer_book: Mutex<HashMap<PeerId, SocketAddr>>,
    datagram_conns: Mutex<HashMap<PeerId, TcpStream>>,
    datagram_tx: SyncSender<(PeerId, Vec<u8>)>,
    stream_tx: SyncSender<InboundStream>,
    closed: AtomicBool,
}

/// TCP-backed [`StreamTransport`].
pub struct TcpTransport {
    local: PeerId,
    signer: Arc<dyn IdentitySigner>,
    config: TcpTransportConfig,
    state: Arc<SharedState>,
    datagram_rx: Mutex<Receiver<(PeerId, Vec<u8>)>>,
    stream_rx: Mutex<Receiver<InboundStream>>,
    local_addr: SocketAddr,
    accept_thread: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// Binds the listener and starts the accept loop.
    pub fn bind(
        config: TcpTransportConfig,
        signer: Arc<dyn IdentitySigner>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (datagram_tx, datagram_rx) = sync_channel(config.datagram_queue_capacity.max(1));
        let (stream_tx, stream_rx) = sync_channel(config.stream_queue_capacity.max(1));
        let state = Arc::new(SharedState {
            signer: Arc::clone(&signer),
            peer_book: Mutex::new(HashMap::new()),
            datagram_conns: Mutex::new(HashMap::new()),
            datagram_tx,
            stream_tx,
            closed: AtomicBool::new(false),
        });

        let accept_state = Arc::clone(&state);
        let handshake_timeout = config.handshake_timeout;
        let accept_thread = thread::spawn(move || {
            accept_loop(&listener, &accept_state, handshake_timeout);
        });

        Ok(Self {
            local: signer.peer_id(),
            signer,
            config,
            state,
            datagram_rx: Mutex::new(datagram_rx),
            stream_rx: Mutex::new(stream_rx),
            local_addr,
            accept_thread: Some(accept_thread),
        })
    }

    /// The bound listen address (useful with an ephemeral port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Adds or replaces a dialable peer address.
    pub fn add_peer(&self, peer: PeerId, addr: SocketAddr) {
        let mut book = self.state.peer_book.lock().expect("peer book lock poisoned");
        book.insert(peer, addr);
    }

    /// Stops accepting; existing streams keep running until closed.
    pub fn shutdown(&mut self) {
        self.state.closed.store(true, Ordering::Release);
        // Unblock the accept loop with a throwaway connection.
        let _ = TcpStream::connect(self.local_addr);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        let mut conns = self
            .state
            .datagram_conns
            .lock()
            .expect("conn table lock poisoned");
        for (_, conn) in conns.drain() {
            let _ = conn.shutdown(Shutdown::Both);
        }
    }

    fn dial(&self, peer: &PeerId, kind: u8, protocol: &str) -> Result<TcpStream, TransportError> {
        let addr = {
            let book = self.state.peer_book.lock().expect("peer book lock poisoned");
            *book.get(peer).ok_or(TransportError::UnknownPeer)?
        };
        let mut stream = TcpStream::connect_timeout(&addr, self.config.handshake_timeout)
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        stream
            .set_read_timeout(Some(self.config.handshake_timeout))
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        stream
            .set_write_timeout(Some(self.config.handshake_timeout))
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let hello = encode_hello(kind, protocol, self.signer.as_ref())?;
        stream
            .write_all(&hello)
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let reply = read_hello(&mut stream)?;
        if reply.peer != *peer {
            return Err(TransportError::Connect(
                "peer identity does not match dialed peer".to_string(),
            ));
        }
        stream
            .set_read_timeout(None)
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        stream
            .set_write_timeout(None)
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(stream)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl StreamTransport for TcpTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
    ) -> Result<Box<dyn DuplexStream>, TransportError> {
        let stream = self.dial(peer, CONN_KIND_STREAM, protocol)?;
        Ok(Box::new(TcpDuplexStream::new(stream)))
    }

    fn poll_inbound_stream(&self, timeout: Duration) -> Option<InboundStream> {
        let rx = self.stream_rx.lock().expect("stream queue lock poisoned");
        rx.recv_timeout(timeout).ok()
    }

    fn send_datagram(&self, peer: &PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes.len() > MAX_DATAGRAM_LEN {
            return Err(TransportError::Io("datagram too large".to_string()));
        }
        let existing = {
            let conns = self
                .state
                .datagram_conns
                .lock()
                .expect("conn table lock poisoned");
            conns.get(peer).map(TcpStream::try_clone)
        };
        // The write happens on a cloned handle; the table lock is never
        // held across socket I/O.
        let mut conn = match existing {
            Some(Ok(conn)) => conn,
            Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
            None => {
                let conn = self.dial(peer, CONN_KIND_DATAGRAM, "")?;
                let reader = conn
                    .try_clone()
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
                let writer = conn
                    .try_clone()
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
                spawn_datagram_reader(reader, *peer, Arc::clone(&self.state));
                let mut conns = self
                    .state
                    .datagram_conns
                    .lock()
                    .expect("conn table lock poisoned");
                conns.insert(*peer, conn);
                writer
            }
        };
        let mut framed = Vec::with_capacity(4 + bytes.len());
        framed.put_u32(bytes.len() as u32);
        framed.put_slice(bytes);
        if let Err(e) = conn.write_all(&framed) {
            let _ = conn.shutdown(Shutdown::Both);
            let mut conns = self
                .state
                .datagram_conns
                .lock()
                .expect("conn table lock poisoned");
            conns.remove(peer);
            return Err(TransportError::Io(e.to_string()));
        }
        Ok(())
    }

    fn poll_datagram(&self, timeout: Duration) -> Option<(PeerId, Vec<u8>)> {
        let rx = self.datagram_rx.lock().expect("datagram queue lock poisoned");
        rx.recv_timeout(timeout).ok()
    }

    fn drop_peer(&self, peer: &PeerId) {
        debug!(peer = %peer, "dropping tcp peer");
        let mut conns = self
            .state
            .datagram_conns
            .lock()
            .expect("conn table lock poisoned");
        if let Some(conn) = conns.remove(peer) {
            let _ = conn.shutdown(Shutdown::Both);
        }
        let mut book = self.state.peer_book.lock().expect("peer book lock poisoned");
        book.remove(peer);
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let book = self.state.peer_book.lock().expect("peer book lock poisoned");
        let mut peers: Vec<PeerId> = book.keys().copied().collect();
        peers.sort();
        peers
    }
}

fn accept_loop(listener: &TcpListener, state: &Arc<SharedState>, handshake_timeout: Duration) {
    loop {
        let (stream, remote) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                if state.closed.load(Ordering::Acquire) {
                    return;
                }
                warn!(error = %e, "tcp accept failed");
                continue;
            }
        };
        if state.closed.load(Ordering::Acquire) {
            return;
        }
        let conn_state = Arc::clone(state);
        thread::spawn(move || {
            if let Err(e) = handle_inbound_conn(stream, &conn_state, handshake_timeout) {
                debug!(remote = %remote, error = %e, "inbound tcp handshake failed");
            }
        });
    }
}

fn handle_inbound_conn(
    mut stream: TcpStream,
    state: &Arc<SharedState>,
    handshake_timeout: Duration,
) -> Result<(), TransportError> {
    stream
        .set_read_timeout(Some(handshake_timeout))
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    stream
        .set_write_timeout(Some(handshake_timeout))
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    let hello = read_hello(&mut stream)?;

    // Reply with our own hello so the dialer can authenticate us.
    let reply = encode_hello(hello.kind, &hello.protocol, state.signer.as_ref())?;
    stream
        .write_all(&reply)
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    stream
        .set_read_timeout(None)
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    stream
        .set_write_timeout(None)
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    match hello.kind {
        CONN_KIND_DATAGRAM => {
            let writer = stream
                .try_clone()
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            {
                let mut conns = state
                    .datagram_conns
                    .lock()
                    .expect("conn table lock poisoned");
                conns.insert(hello.peer, writer);
            }
            spawn_datagram_reader(stream, hello.peer, Arc::clone(state));
            Ok(())
        }
        _ => {
            let inbound = InboundStream {
                peer: hello.peer,
                protocol: hello.protocol,
                stream: Box::new(TcpDuplexStream::new(stream)),
            };
            match state.stream_tx.try_send(inbound) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(mut rejected)) => {
                    rejected.stream.close();
                    Err(TransportError::Backpressure)
                }
                Err(TrySendError::Disconnected(_)) => Err(TransportError::Closed),
            }
        }
    }
}

fn spawn_datagram_reader(mut stream: TcpStream, peer: PeerId, state: Arc<SharedState>) {
    thread::spawn(move || {
        let _ = stream.set_read_timeout(None);
        loop {
            let mut head = [0_u8; 4];
            if stream.read_exact(&mut head).is_err() {
                break;
            }
            let len = u32::from_be_bytes(head) as usize;
            if len > MAX_DATAGRAM_LEN {
                warn!(peer = %peer, len, "oversize tcp datagram, dropping connection");
                break;
            }
            let mut payload = vec![0_u8; len];
            if stream.read_exact(&mut payload).is_err() {
                break;
            }
            match state.datagram_tx.try_send((peer, payload)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(peer = %peer, "inbound datagram queue full, dropping");
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        let mut conns = state
            .datagram_conns
            .lock()
            .expect("conn table lock poisoned");
        conns.remove(&peer);
    });
}

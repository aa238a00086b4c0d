use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sdx_codec::frame::{
    encode_record_list, Frame, Opcode, ReasonCode, ResponseCode, EXCHANGE_PROTOCOL_ID,
    MAX_SCHEMA_NAME_LEN,
};
use sdx_core::schema::SchemaValidator;
use sdx_core::time::unix_time_millis;
use sdx_core::{PeerId, SchemaId};
use sdx_store::{PutRecord, Store, StoreError, StoreQuery};
use sdx_transport::{DuplexStream, StreamError, StreamTransport};
use thiserror::Error;
use tracing::debug;

use crate::events::{ArrivedSender, RecordEnvelope};
use crate::metrics::{bump, ErrorKind, NodeMetrics};
use crate::policy::PolicyTable;
use crate::trust::{Decision, OpOutcome, PeerOp, PeerRegistry};

/// Server-side cap on records returned to one QUERY.
const MAX_QUERY_RESULTS: usize = 1_000;

/// Errors surfaced by the client half of the exchange protocol.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("record not found at peer")]
    NotFound,
    #[error("peer rate limited the request")]
    RateLimited,
    #[error("peer rejected the request")]
    Rejected,
    #[error("peer does not know the schema")]
    UnknownSchema,
    #[error("peer failed to validate the payload")]
    ValidationFailed,
    #[error("payload exceeds the negotiated size limit")]
    Oversize,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("deadline exceeded")]
    TimedOut,
    #[error("transport failure: {0}")]
    Transport(String),
}

impl From<StreamError> for ExchangeError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::TimedOut => ExchangeError::TimedOut,
            StreamError::Closed => ExchangeError::Transport("stream closed".to_string()),
            StreamError::Io(detail) => ExchangeError::Transport(detail),
        }
    }
}

impl ExchangeError {
    /// Transient failures are worth one retry; the rest are terminal for
    /// the announcer that produced them.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transport(_) | ExchangeError::TimedOut)
    }
}

/// Shared dependencies of the server half.
pub struct ExchangeContext {
    pub store: Arc<Store>,
    pub registry: Arc<PeerRegistry>,
    pub policy: Arc<PolicyTable>,
    pub validator: Arc<dyn SchemaValidator>,
    pub metrics: Arc<NodeMetrics>,
    pub arrived_tx: Mutex<ArrivedSender>,
    pub frame_timeout: Duration,
}

/// Serves one inbound exchange stream: exactly one request frame, exactly
/// one response frame, then close.
///
/// Phase deadlines: header, body, and response writes each get one frame
/// timeout. Any malformed input closes the stream with a protocol-error
/// NACK when the response has not been sent yet.
pub fn handle_stream(ctx: &ExchangeContext, peer: PeerId, stream: &mut dyn DuplexStream) {
    let outcome = serve(ctx, peer, stream);
    if let Err(violation) = outcome {
        debug!(peer = %peer, error = %violation, "closing exchange stream on protocol violation");
        bump(&ctx.metrics.protocol_errors);
        ctx.metrics
            .record_error(ErrorKind::Protocol, format!("{peer}: {violation}"));
        // Protocol violations count toward the peer's abuse tally.
        ctx.registry
            .note_event(&peer, PeerOp::Stream, OpOutcome::Denied, Instant::now());
        let nack = Frame::Nack {
            schema: SchemaId::from(""),
            reason: ReasonCode::ProtocolError,
            message: None,
        };
        let _ = write_frame(stream, &nack, ctx.frame_timeout);
    }
    stream.close();
}

fn serve(
    ctx: &ExchangeContext,
    peer: PeerId,
    stream: &mut dyn DuplexStream,
) -> Result<(), String> {
    // HEADER phase.
    stream.set_deadline(Some(Instant::now() + ctx.frame_timeout));
    let opcode_raw = stream.read_u8().map_err(|e| e.to_string())?;
    let opcode = Opcode::from_u8(opcode_raw).map_err(|e| e.to_string())?;
    let schema_len = stream.read_u16_be().map_err(|e| e.to_string())? as usize;
    if schema_len > MAX_SCHEMA_NAME_LEN {
        return Err("schema name over limit".to_string());
    }
    let mut schema_raw = vec![0_u8; schema_len];
    stream.read_exact(&mut schema_raw).map_err(|e| e.to_string())?;
    let schema_name =
        String::from_utf8(schema_raw).map_err(|_| "schema name not utf-8".to_string())?;
    let schema = SchemaId::new(schema_name);

    match opcode {
        Opcode::Request => serve_request(ctx, peer, schema, stream),
        Opcode::Push => serve_push(ctx, peer, schema, stream),
        Opcode::Query => serve_query(ctx, peer, schema, stream),
        Opcode::Response | Opcode::Ack | Opcode::Nack => {
            Err("response frame as request".to_string())
        }
    }
}

fn gate(ctx: &ExchangeContext, peer: &PeerId, op: PeerOp) -> Decision {
    ctx.registry.admit(peer, op, Instant::now())
}

fn reply(
    ctx: &ExchangeContext,
    stream: &mut dyn DuplexStream,
    frame: &Frame,
) -> Result<(), String> {
    write_frame(stream, frame, ctx.frame_timeout).map_err(|e| e.to_string())
}

fn nack(schema: &SchemaId, reason: ReasonCode) -> Frame {
    Frame::Nack {
        schema: schema.clone(),
        reason,
        message: None,
    }
}

fn rate_limited(schema: &SchemaId) -> Frame {
    // Trust state is never revealed; every denial looks like rate limiting.
    Frame::Response {
        schema: schema.clone(),
        code: ResponseCode::RateLimited,
        payload: Vec::new(),
    }
}

fn serve_request(
    ctx: &ExchangeContext,
    peer: PeerId,
    schema: SchemaId,
    stream: &mut dyn DuplexStream,
) -> Result<(), String> {
    let cid_len = stream.read_u16_be().map_err(|e| e.to_string())? as usize;
    let mut cid_raw = vec![0_u8; cid_len];
    stream.read_exact(&mut cid_raw).map_err(|e| e.to_string())?;
    let cid = String::from_utf8(cid_raw).map_err(|_| "cid not utf-8".to_string())?;

    if !gate(ctx, &peer, PeerOp::Fetch).is_allowed() {
        return reply(ctx, stream, &rate_limited(&schema));
    }
    if !ctx.validator.is_known(&schema) {
        return reply(ctx, stream, &nack(&schema, ReasonCode::UnknownSchema));
    }
    match ctx.store.get(&schema, &cid) {
        Ok(bytes) => {
            bump(&ctx.metrics.requests_served);
            reply(
                ctx,
                stream,
                &Frame::Response {
                    schema,
                    code: ResponseCode::Accept,
                    payload: bytes,
                },
            )
        }
        Err(StoreError::NotFound) => reply(ctx, stream, &nack(&schema, ReasonCode::NotFound)),
        Err(e) => {
            ctx.metrics
                .record_error(ErrorKind::Data, format!("request serve: {e}"));
            reply(
                ctx,
                stream,
                &Frame::Response {
                    schema,
                    code: ResponseCode::Reject,
                    payload: Vec::new(),
                },
            )
        }
    }
}

fn serve_push(
    ctx: &ExchangeContext,
    peer: PeerId,
    schema: SchemaId,
    stream: &mut dyn DuplexStream,
) -> Result<(), String> {
    let declared = stream.read_u32_be().map_err(|e| e.to_string())? as u64;
    let decision = gate(ctx, &peer, PeerOp::Push);
    if !decision.is_allowed() {
        bump(&ctx.metrics.push_rejected);
        return reply(ctx, stream, &rate_limited(&schema));
    }
    if !ctx.validator.is_known(&schema) {
        bump(&ctx.metrics.push_rejected);
        return reply(ctx, stream, &nack(&schema, ReasonCode::UnknownSchema));
    }
    let cap = ctx.policy.resolve(&peer, &schema).max_payload_bytes;
    if declared > cap {
        // Enforced before the body: the stream closes without reading it.
        bump(&ctx.metrics.push_rejected);
        return reply(ctx, stream, &nack(&schema, ReasonCode::Oversize));
    }

    // BODY phase.
    stream.set_deadline(Some(Instant::now() + ctx.frame_timeout));
    let mut payload = vec![0_u8; declared as usize];
    stream.read_exact(&mut payload).map_err(|e| e.to_string())?;

    // The body is fully drained by now, so the sender's framing stays
    // aligned even when validation fails.
    if ctx.validator.validate(&schema, &payload).is_err() {
        bump(&ctx.metrics.push_rejected);
        ctx.metrics
            .record_error(ErrorKind::Data, format!("push validation failed ({schema})"));
        return reply(ctx, stream, &nack(&schema, ReasonCode::ValidationFailed));
    }

    let received_at = unix_time_millis();
    match ctx.store.put(PutRecord {
        schema: schema.clone(),
        bytes: &payload,
        publisher: peer,
        signature: None,
        received_at,
        ttl_expires_at: None,
    }) {
        Ok(outcome) => {
            bump(&ctx.metrics.push_accepted);
            if outcome.inserted {
                let envelope = Arc::new(RecordEnvelope {
                    cid: outcome.cid.clone(),
                    schema: schema.clone(),
                    publisher: peer,
                    received_at,
                    bytes: payload,
                });
                let tx = ctx.arrived_tx.lock().expect("arrived sender lock poisoned");
                let _ = tx.send(envelope);
            }
            reply(
                ctx,
                stream,
                &Frame::Response {
                    schema,
                    code: ResponseCode::Accept,
                    payload: outcome.cid.into_bytes(),
                },
            )
        }
        Err(e) => {
            bump(&ctx.metrics.push_rejected);
            if !e.is_transient() {
                ctx.metrics
                    .record_error(ErrorKind::Data, format!("push store: {e}"));
            }
            reply(
                ctx,
                stream,
                &Frame::Response {
                    schema,
                    code: ResponseCode::Reject,
                    payload: Vec::new(),
                },
            )
        }
    }
}

fn serve_query(
    ctx: &ExchangeContext,
    peer: PeerId,
    schema: SchemaId,
    stream: &mut dyn DuplexStream,
) -> Result<(), String> {
    let query_len = stream.read_u32_be().map_err(|e| e.to_string())? as usize;
    if query_len > 64 * 1024 {
        return Err("query filter over limit".to_string());
    }
    let mut query_raw = vec![0_u8; query_len];
    stream.read_exact(&mut query_raw).map_err(|e| e.to_string())?;

    let decision = gate(ctx, &peer, PeerOp::Query);
    if !decision.is_allowed() {
        return reply(ctx, stream, &rate_limited(&schema));
    }
    if !ctx.validator.is_known(&schema) {
        return reply(ctx, stream, &nack(&schema, ReasonCode::UnknownSchema));
    }
    let mut query: StoreQuery = match serde_json::from_slice(&query_raw) {
        Ok(query) => query,
        Err(_) => return Err("query filter is not valid json".to_string()),
    };
    query.limit = Some(query.limit.unwrap_or(MAX_QUERY_RESULTS).min(MAX_QUERY_RESULTS));

    match ctx.store.query(&schema, &query) {
        Ok(records) => {
            bump(&ctx.metrics.queries_served);
            let payloads: Vec<Vec<u8>> = records.into_iter().map(|r| r.bytes).collect();
            let listed = encode_record_list(&payloads).map_err(|e| e.to_string())?;
            reply(
                ctx,
                stream,
                &Frame::Response {
                    schema,
                    code: ResponseCode::Accept,
                    payload: listed,
                },
            )
        }
        Err(e) => {
            ctx.metrics
                .record_error(ErrorKind::Data, format!("query serve: {e}"));
            reply(
                ctx,
                stream,
                &Frame::Response {
                    schema,
                    code: ResponseCode::Reject,
                    payload: Vec::new(),
                },
            )
        }
    }
}

fn write_frame(
    stream: &mut dyn DuplexStream,
    frame: &Frame,
    frame_timeout: Duration,
) -> Result<(), StreamError> {
    let encoded = frame
        .encode()
        .map_err(|e| StreamError::Io(e.to_string()))?;
    stream.set_deadline(Some(Instant::now() + frame_timeout));
    stream.write_all(&encoded)
}

/// Reads the response frame of a client-side transaction.
///
/// `max_payload` bounds the accepted payload and is enforced on the
/// declared length, before the body is read.
fn read_response(
    stream: &mut dyn DuplexStream,
    deadline: Instant,
    max_payload: u64,
) -> Result<Frame, ExchangeError> {
    stream.set_deadline(Some(deadline));
    let opcode = Opcode::from_u8(stream.read_u8()?)
        .map_err(|e| ExchangeError::Protocol(e.to_string()))?;
    let schema_len = stream.read_u16_be()? as usize;
    let mut schema_raw = vec![0_u8; schema_len];
    stream.read_exact(&mut schema_raw)?;
    let schema = SchemaId::new(
        String::from_utf8(schema_raw)
            .map_err(|_| ExchangeError::Protocol("schema not utf-8".to_string()))?,
    );

    match opcode {
        Opcode::Response => {
            let code = ResponseCode::from_u8(stream.read_u8()?)
                .map_err(|e| ExchangeError::Protocol(e.to_string()))?;
            let declared = stream.read_u32_be()? as u64;
            if declared > max_payload {
                return Err(ExchangeError::Oversize);
            }
            let mut payload = vec![0_u8; declared as usize];
            stream.read_exact(&mut payload)?;
            Ok(Frame::Response {
                schema,
                code,
                payload,
            })
        }
        Opcode::Nack | Opcode::Ack => {
            let reason = ReasonCode::from_u8(stream.read_u8()?)
                .map_err(|e| ExchangeError::Protocol(e.to_string()))?;
            let message_len = stream.read_u16_be()? as usize;
            let message = if message_len == 0 {
                None
            } else {
                let mut raw = vec![0_u8; message_len];
                stream.read_exact(&mut raw)?;
                Some(
                    String::from_utf8(raw)
                        .map_err(|_| ExchangeError::Protocol("message not utf-8".to_string()))?,
                )
            };
            if opcode == Opcode::Ack {
                Ok(Frame::Ack {
                    schema,
                    reason,
                    message,
                })
            } else {
                Ok(Frame::Nack {
                    schema,
                    reason,
                    message,
                })
            }
        }
        other => Err(ExchangeError::Protocol(format!(
            "unexpected response opcode {other:?}"
        ))),
    }
}

fn nack_to_error(reason: ReasonCode) -> ExchangeError {
    match reason {
        ReasonCode::NotFound => ExchangeError::NotFound,
        ReasonCode::UnknownSchema => ExchangeError::UnknownSchema,
        ReasonCode::ValidationFailed => ExchangeError::ValidationFailed,
        ReasonCode::Oversize => ExchangeError::Oversize,
        ReasonCode::ProtocolError | ReasonCode::None => {
            ExchangeError::Protocol("peer reported a protocol error".to_string())
        }
    }
}

fn response_to_error(code: ResponseCode) -> ExchangeError {
    match code {
        ResponseCode::RateLimited => ExchangeError::RateLimited,
        _ => ExchangeError::Rejected,
    }
}

/// One REQUEST transaction: open, send, read the response, close.
pub fn request_record(
    transport: &dyn StreamTransport,
    peer: &PeerId,
    schema: &SchemaId,
    cid: &str,
    deadline: Instant,
    max_payload: u64,
) -> Result<Vec<u8>, ExchangeError> {
    let mut stream = transport
        .open_stream(peer, EXCHANGE_PROTOCOL_ID)
        .map_err(|e| ExchangeError::Transport(e.to_string()))?;
    let frame = Frame::Request {
        schema: schema.clone(),
        cid: cid.to_string(),
    };
    let encoded = frame
        .encode()
        .map_err(|e| ExchangeError::Protocol(e.to_string()))?;
    stream.set_deadline(Some(deadline));
    stream.write_all(&encoded)?;

    let response = read_response(stream.as_mut(), deadline, max_payload);
    stream.close();
    match response? {
        Frame::Response {
            code: ResponseCode::Accept,
            payload,
            ..
        } => Ok(payload),
        Frame::Response { code, .. } => Err(response_to_error(code)),
        Frame::Nack { reason, .. } => Err(nack_to_error(reason)),
        _ => Err(ExchangeError::Protocol("unexpected reply frame".to_string())),
    }
}

/// One PUSH transaction; returns the CID assigned by the receiver.
pub fn push_record(
    transport: &dyn StreamTransport,
    peer: &PeerId,
    schema: &SchemaId,
    payload: Vec<u8>,
    deadline: Instant,
) -> Result<String, ExchangeError> {
    let mut stream = transport
        .open_stream(peer, EXCHANGE_PROTOCOL_ID)
        .map_err(|e| ExchangeError::Transport(e.to_string()))?;
    let frame = Frame::Push {
        schema: schema.clone(),
        payload,
    };
    let encoded = frame
        .encode()
        .map_err(|e| ExchangeError::Protocol(e.to_string()))?;
    stream.set_deadline(Some(deadline));
    stream.write_all(&encoded)?;

    let response = read_response(stream.as_mut(), deadline, 4 * 1024);
    stream.close();
    match response? {
        Frame::Response {
            code: ResponseCode::Accept,
            payload,
            ..
        } => String::from_utf8(payload)
            .map_err(|_| ExchangeError::Protocol("cid not utf-8".to_string())),
        Frame::Response { code, .. } => Err(response_to_error(code)),
        Frame::Nack { reason, .. } => Err(nack_to_error(reason)),
        _ => Err(ExchangeError::Protocol("unexpected reply frame".to_string())),
    }
}

/// One QUERY transaction; returns the matching record payloads.
pub fn query_records(
    transport: &dyn StreamTransport,
    peer: &PeerId,
    schema: &SchemaId,
    query: &StoreQuery,
    deadline: Instant,
    max_payload: u64,
) -> Result<Vec<Vec<u8>>, ExchangeError> {
    let mut stream = transport
        .open_stream(peer, EXCHANGE_PROTOCOL_ID)
        .map_err(|e| ExchangeError::Transport(e.to_string()))?;
    let query_raw = serde_json::to_vec(query)
        .map_err(|e| ExchangeError::Protocol(e.to_string()))?;
    let frame = Frame::Query {
        schema: schema.clone(),
        query: query_raw,
    };
    let encoded = frame
        .encode()
        .map_err(|e| ExchangeError::Protocol(e.to_string()))?;
    stream.set_deadline(Some(deadline));
    stream.write_all(&encoded)?;

    let response = read_response(stream.as_mut(), deadline, max_payload);
    stream.close();
    match response? {
        Frame::Response {
            code: ResponseCode::Accept,
            payload,
            ..
        } => sdx_codec::frame::decode_record_list(&payload)
            .map_err(|e| ExchangeError::Protocol(e.to_string())),
        Frame::Response { code, .. } => Err(response_to_error(code)),
        Frame::Nack { reason, .. } => Err(nack_to_error(reason)),
        _ => Err(ExchangeError::Protocol("unexpected reply frame".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        handle_stream, push_record, query_records, request_record, ExchangeContext, ExchangeError,
    };
    use crate::config::NodeConfig;
    use crate::metrics::NodeMetrics;
    use crate::policy::{EffectivePolicy, PolicyEntry, PolicyScope, PolicyTable};
    use crate::trust::{GateConfig, PeerRegistry, TrustLevel};
    use sdx_codec::frame::EXCHANGE_PROTOCOL_ID;
    use sdx_core::cid::cid_string;
    use sdx_core::schema::SchemaCatalog;
    use sdx_core::{PeerId, SchemaId};
    use sdx_store::{PutRecord, Store, StoreOptions, StoreQuery};
    use sdx_transport::memory::MemoryNetwork;
    use sdx_transport::StreamTransport;
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    struct Harness {
        ctx: Arc<ExchangeContext>,
        server: Arc<sdx_transport::memory::MemoryTransport>,
        client: Arc<sdx_transport::memory::MemoryTransport>,
        server_peer: PeerId,
        client_peer: PeerId,
        arrived_rx: std::sync::mpsc::Receiver<crate::events::RecordArrived>,
    }

    fn harness() -> Harness {
        let network = MemoryNetwork::new();
        let server_peer = PeerId([0xA1; 32]);
        let client_peer = PeerId([0xB2; 32]);
        let server = Arc::new(network.register(server_peer));
        let client = Arc::new(network.register(client_peer));

        let mut catalog = SchemaCatalog::new();
        catalog.register(SchemaId::from("OMM"));
        catalog.register_with_rule(SchemaId::from("CDM"), |bytes| !bytes.is_empty());

        let metrics = Arc::new(NodeMetrics::new());
        let registry = Arc::new(PeerRegistry::new(
            GateConfig::default(),
            Arc::clone(&metrics),
        ));
        registry.set_trust(client_peer, TrustLevel::Trusted);
        let (arrived_tx, arrived_rx) = channel();
        let ctx = Arc::new(ExchangeContext {
            store: Arc::new(Store::open_in_memory(StoreOptions::default()).expect("store")),
            registry,
            policy: Arc::new(PolicyTable::new(EffectivePolicy::default())),
            validator: Arc::new(catalog),
            metrics,
            arrived_tx: Mutex::new(arrived_tx),
            frame_timeout: Duration::from_secs(2),
        });
        Harness {
            ctx,
            server,
            client,
            server_peer,
            client_peer,
            arrived_rx,
        }
    }

    /// Runs the server side for exactly one stream.
    fn serve_one(h: &Harness) -> thread::JoinHandle<()> {
        let ctx = Arc::clone(&h.ctx);
        let server = Arc::clone(&h.server);
        thread::spawn(move || {
            let mut inbound = server
                .poll_inbound_stream(Duration::from_secs(2))
                .expect("stream should arrive");
            assert_eq!(inbound.protocol, EXCHANGE_PROTOCOL_ID);
            handle_stream(&ctx, inbound.peer, inbound.stream.as_mut());
        })
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(2)
    }

    #[test]
    fn request_hit_returns_bytes() {
        let h = harness();
        let bytes = vec![0x42; 64];
        let outcome = h
            .ctx
            .store
            .put(PutRecord {
                schema: SchemaId::from("OMM"),
                bytes: &bytes,
                publisher: h.server_peer,
                signature: None,
                received_at: 1,
                ttl_expires_at: None,
            })
            .expect("seed put should succeed");
        let server = serve_one(&h);
        let fetched = request_record(
            h.client.as_ref(),
            &h.server_peer,
            &SchemaId::from("OMM"),
            &outcome.cid,
            deadline(),
            10 * 1024 * 1024,
        )
        .expect("request should succeed");
        assert_eq!(fetched, bytes);
        server.join().expect("server thread should finish");
    }

    #[test]
    fn request_miss_is_not_found() {
        let h = harness();
        let server = serve_one(&h);
        let err = request_record(
            h.client.as_ref(),
            &h.server_peer,
            &SchemaId::from("OMM"),
            &cid_string(b"missing"),
            deadline(),
            1024,
        )
        .expect_err("missing record should fail");
        assert_eq!(err, ExchangeError::NotFound);
        server.join().expect("server thread should finish");
    }

    #[test]
    fn unknown_schema_is_nacked() {
        let h = harness();
        let server = serve_one(&h);
        let err = request_record(
            h.client.as_ref(),
            &h.server_peer,
            &SchemaId::from("NOPE"),
            &cid_string(b"x"),
            deadline(),
            1024,
        )
        .expect_err("unknown schema should fail");
        assert_eq!(err, ExchangeError::UnknownSchema);
        server.join().expect("server thread should finish");
    }

    #[test]
    fn untrusted_peer_sees_rate_limited_not_trust_state() {
        let h = harness();
        h.ctx.registry.set_trust(h.client_peer, TrustLevel::Untrusted);
        let server = serve_one(&h);
        let err = request_record(
            h.client.as_ref(),
            &h.server_peer,
            &SchemaId::from("OMM"),
            &cid_string(b"x"),
            deadline(),
            1024,
        )
        .expect_err("untrusted peer should fail");
        assert_eq!(err, ExchangeError::RateLimited);
        server.join().expect("server thread should finish");
    }

    #[test]
    fn push_stores_validates_and_announces_arrival() {
        let h = harness();
        let server = serve_one(&h);
        let payload = br#"{"norad": 25544}"#.to_vec();
        let cid = push_record(
            h.client.as_ref(),
            &h.server_peer,
            &SchemaId::from("OMM"),
            payload.clone(),
            deadline(),
        )
        .expect("push should succeed");
        assert_eq!(cid, cid_string(&payload));
        assert!(h
            .ctx
            .store
            .has(&SchemaId::from("OMM"), &cid)
            .expect("has should succeed"));
        let arrived = h
            .arrived_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("arrival should be emitted");
        assert_eq!(arrived.cid, cid);
        server.join().expect("server thread should finish");
    }

    #[test]
    fn push_from_limited_peer_is_refused() {
        let h = harness();
        h.ctx.registry.set_trust(h.client_peer, TrustLevel::Limited);
        let server = serve_one(&h);
        let err = push_record(
            h.client.as_ref(),
            &h.server_peer,
            &SchemaId::from("OMM"),
            vec![1, 2, 3],
            deadline(),
        )
        .expect_err("limited peer cannot push");
        assert_eq!(err, ExchangeError::RateLimited);
        server.join().expect("server thread should finish");
    }

    #[test]
    fn oversize_push_is_refused_before_body() {
        let h = harness();
        h.ctx.policy.set(
            PolicyScope::System,
            PolicyEntry {
                max_payload_bytes: Some(16),
                ..PolicyEntry::default()
            },
        );
        let server = serve_one(&h);
        let err = push_record(
            h.client.as_ref(),
            &h.server_peer,
            &SchemaId::from("OMM"),
            vec![0; 17],
            deadline(),
        )
        .expect_err("oversize push should fail");
        assert_eq!(err, ExchangeError::Oversize);
        // Nothing was stored.
        assert_eq!(
            h.ctx.store.stats().expect("stats should read").records,
            0
        );
        server.join().expect("server thread should finish");
    }

    #[test]
    fn exactly_at_limit_push_is_accepted() {
        let h = harness();
        h.ctx.policy.set(
            PolicyScope::System,
            PolicyEntry {
                max_payload_bytes: Some(16),
                ..PolicyEntry::default()
            },
        );
        let server = serve_one(&h);
        push_record(
            h.client.as_ref(),
            &h.server_peer,
            &SchemaId::from("OMM"),
            vec![0; 16],
            deadline(),
        )
        .expect("at-limit push should succeed");
        server.join().expect("server thread should finish");
    }

    #[test]
    fn zero_byte_push_follows_the_validator() {
        let h = harness();
        // OMM accepts anything, including empty payloads.
        let server = serve_one(&h);
        push_record(
            h.client.as_ref(),
            &h.server_peer,
            &SchemaId::from("OMM"),
            Vec::new(),
            deadline(),
        )
        .expect("empty payload should pass the permissive schema");
        server.join().expect("server thread should finish");

        // CDM rejects empty payloads.
        let server = serve_one(&h);
        let err = push_record(
            h.client.as_ref(),
            &h.server_peer,
            &SchemaId::from("CDM"),
            Vec::new(),
            deadline(),
        )
        .expect_err("empty payload should fail the strict schema");
        assert_eq!(err, ExchangeError::ValidationFailed);
        server.join().expect("server thread should finish");
    }

    #[test]
    fn query_streams_matching_records() {
        let h = harness();
        for (i, payload) in [b"one".as_slice(), b"two", b"three"].iter().enumerate() {
            h.ctx
                .store
                .put(PutRecord {
                    schema: SchemaId::from("OMM"),
                    bytes: payload,
                    publisher: h.server_peer,
                    signature: None,
                    received_at: 100 + i as i64,
                    ttl_expires_at: None,
                })
                .expect("seed put should succeed");
        }
        let server = serve_one(&h);
        let records = query_records(
            h.client.as_ref(),
            &h.server_peer,
            &SchemaId::from("OMM"),
            &StoreQuery {
                since: Some(101),
                ..StoreQuery::default()
            },
            deadline(),
            10 * 1024 * 1024,
        )
        .expect("query should succeed");
        assert_eq!(records.len(), 2);
        server.join().expect("server thread should finish");
    }

    #[test]
    fn malformed_opener_is_nacked_and_counted() {
        let h = harness();
        let server = serve_one(&h);
        let mut stream = h
            .client
            .open_stream(&h.server_peer, EXCHANGE_PROTOCOL_ID)
            .expect("stream should open");
        use sdx_transport::DuplexStream;
        stream.write_all(&[0xFF, 0x00, 0x00]).expect("write");
        server.join().expect("server thread should finish");
        assert_eq!(h.ctx.metrics.snapshot().protocol_errors, 1);
    }
}

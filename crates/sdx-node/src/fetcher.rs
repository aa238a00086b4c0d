use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use lru::LruCache;
use sdx_core::cid::cid_matches;
use sdx_core::schema::SchemaValidator;
use sdx_core::time::unix_time_millis;
use sdx_core::PeerId;
use sdx_store::{PutRecord, Store};
use sdx_transport::StreamTransport;
use tracing::{debug, warn};

use crate::config::NodeConfig;
use crate::events::{ArrivedSender, RecordEnvelope};
use crate::exchange::{request_record, ExchangeError};
use crate::inflight::InFlightSet;
use crate::metrics::{bump, ErrorKind, NodeMetrics};
use crate::tipqueue::{Tip, TipQueue};
use crate::trust::{Decision, OpOutcome, PeerOp, PeerRegistry};

/// Deadline extension granted to a rate-limited tip on requeue.
const REQUEUE_EXTENSION: Duration = Duration::from_millis(500);
/// Shutdown poll granularity inside backoff sleeps.
const BACKOFF_SLICE: Duration = Duration::from_millis(100);
/// CIDs tracked for alternate announcers and per-announcer failures.
const ANNOUNCER_BOOK_CAPACITY: usize = 4096;

/// Fetch scheduling knobs lifted out of the node config.
#[derive(Debug, Clone, Copy)]
pub struct FetchSettings {
    pub max_fetch_latency: Duration,
    pub retry_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_multiplier: u32,
    pub rate_limited_requeues: u32,
}

impl From<&NodeConfig> for FetchSettings {
    fn from(config: &NodeConfig) -> Self {
        Self {
            max_fetch_latency: config.max_fetch_latency,
            retry_attempts: config.fetch_retry_attempts.max(1),
            backoff_initial: config.fetch_backoff_initial,
            backoff_multiplier: config.fetch_backoff_multiplier.max(1),
            rate_limited_requeues: config.rate_limited_requeues,
        }
    }
}

#[derive(Default)]
struct CidSources {
    candidates: Vec<PeerId>,
    failed: HashSet<PeerId>,
}

/// Remembers, per CID, which peers also announced it and which peers have
/// already failed to serve it. Duplicate announcements land here so the
/// fetcher can fail over without a second fetch being scheduled.
pub struct AnnouncerBook {
    inner: Mutex<LruCache<String, CidSources>>,
}

impl Default for AnnouncerBook {
    fn default() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(ANNOUNCER_BOOK_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }
}

impl AnnouncerBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records another announcer for a CID.
    pub fn note_announcer(&self, cid: &str, peer: PeerId) {
        let mut inner = self.inner.lock().expect("announcer book lock poisoned");
        let sources = inner.get_or_insert_mut(cid.to_string(), CidSources::default);
        if !sources.failed.contains(&peer) && !sources.candidates.contains(&peer) {
            sources.candidates.push(peer);
        }
    }

    /// Marks a peer as failed for a CID; it will not be asked again.
    pub fn mark_failed(&self, cid: &str, peer: PeerId) {
        let mut inner = self.inner.lock().expect("announcer book lock poisoned");
        let sources = inner.get_or_insert_mut(cid.to_string(), CidSources::default);
        sources.candidates.retain(|p| *p != peer);
        sources.failed.insert(peer);
    }

    /// Every announcer currently recorded for a CID.
    pub fn known_announcers(&self, cid: &str) -> Vec<PeerId> {
        let mut inner = self.inner.lock().expect("announcer book lock poisoned");
        inner
            .get(cid)
            .map(|sources| sources.candidates.clone())
            .unwrap_or_default()
    }

    /// Builds the candidate order for a tip: its announcer, its recorded
    /// alternates, then any book entries, skipping known failures.
    fn candidates_for(&self, tip: &Tip) -> Vec<PeerId> {
        let mut inner = self.inner.lock().expect("announcer book lock poisoned");
        let sources = inner.get_or_insert_mut(tip.cid.clone(), CidSources::default);
        let mut ordered = Vec::new();
        for peer in std::iter::once(tip.announcer)
            .chain(tip.alternates.iter().copied())
            .chain(sources.candidates.iter().copied())
        {
            if !sources.failed.contains(&peer) && !ordered.contains(&peer) {
                ordered.push(peer);
            }
        }
        ordered
    }
}

/// Shared dependencies of the fetch workers.
pub struct FetcherContext {
    pub queue: Arc<TipQueue>,
    pub store: Arc<Store>,
    pub registry: Arc<PeerRegistry>,
    pub transport: Arc<dyn StreamTransport>,
    pub validator: Arc<dyn SchemaValidator>,
    pub inflight: Arc<InFlightSet>,
    pub announcers: Arc<AnnouncerBook>,
    pub metrics: Arc<NodeMetrics>,
    pub settings: FetchSettings,
    pub shutdown: Arc<AtomicBool>,
}

/// Bounded pool of fetch workers draining the tip queue.
pub struct FetcherPool {
    workers: Vec<JoinHandle<()>>,
}

impl FetcherPool {
    /// Spawns `workers` threads (at least one).
    pub fn start(ctx: Arc<FetcherContext>, arrived_tx: ArrivedSender, workers: usize) -> Self {
        let mut handles = Vec::new();
        for index in 0..workers.max(1) {
            let ctx = Arc::clone(&ctx);
            let arrived_tx = arrived_tx.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("sdx-fetch-{index}"))
                    .spawn(move || worker_loop(&ctx, &arrived_tx))
                    .expect("fetch worker should spawn"),
            );
        }
        Self { workers: handles }
    }

    /// Joins every worker; the caller closes the queue first.
    pub fn join(self) {
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

fn worker_loop(ctx: &FetcherContext, arrived_tx: &ArrivedSender) {
    while let Some(tip) = ctx.queue.dequeue() {
        if ctx.shutdown.load(Ordering::Acquire) {
            break;
        }
        process_tip(ctx, arrived_tx, tip);
    }
}

fn process_tip(ctx: &FetcherContext, arrived_tx: &ArrivedSender, mut tip: Tip) {
    // Another worker or a direct push may have landed the bytes already.
    if ctx.store.has(&tip.schema, &tip.cid).unwrap_or(false) {
        return;
    }

    let deadline = tip.received_at + ctx.settings.max_fetch_latency;
    let now = Instant::now();
    if now >= deadline {
        bump(&ctx.metrics.fetch_deadline_exceeded);
        return;
    }

    match ctx.registry.evaluate(&tip.announcer, PeerOp::Fetch, now) {
        Decision::Deny => {
            debug!(cid = %tip.cid, announcer = %tip.announcer, "fetch denied by trust gate");
            return;
        }
        Decision::RateLimited => {
            if tip.requeues < ctx.settings.rate_limited_requeues {
                tip.requeues += 1;
                // Re-entering at the tail of its priority band, with a small
                // deadline extension so the wait does not eat the budget.
                tip.received_at += REQUEUE_EXTENSION;
                ctx.queue.enqueue(tip);
            } else {
                bump(&ctx.metrics.fetch_failed);
            }
            return;
        }
        Decision::Allow | Decision::AllowWithCap(_) => {}
    }

    // Single flight per CID: losers drop their tip and rely on the winner.
    let Some(_guard) = ctx
        .inflight
        .try_claim(tip.schema.clone(), tip.cid.clone())
    else {
        bump(&ctx.metrics.fetch_inflight_collapsed);
        return;
    };

    // The store may have caught up while we were claiming.
    if ctx.store.has(&tip.schema, &tip.cid).unwrap_or(false) {
        return;
    }

    for candidate in ctx.announcers.candidates_for(&tip) {
        if fetch_from(ctx, arrived_tx, &tip, candidate, deadline) {
            bump(&ctx.metrics.fetch_ok);
            return;
        }
        if Instant::now() >= deadline {
            bump(&ctx.metrics.fetch_deadline_exceeded);
            return;
        }
    }
    debug!(cid = %tip.cid, "no announcer could serve the record");
    bump(&ctx.metrics.fetch_failed);
}

/// Attempts the full transaction against one candidate; true on success.
fn fetch_from(
    ctx: &FetcherContext,
    arrived_tx: &ArrivedSender,
    tip: &Tip,
    candidate: PeerId,
    deadline: Instant,
) -> bool {
    ctx.registry
        .note_event(&candidate, PeerOp::Fetch, OpOutcome::Ok, Instant::now());

    let mut backoff = ctx.settings.backoff_initial;
    for attempt in 0..ctx.settings.retry_attempts {
        if ctx.shutdown.load(Ordering::Acquire) {
            return false;
        }
        match request_record(
            ctx.transport.as_ref(),
            &candidate,
            &tip.schema,
            &tip.cid,
            deadline,
            tip.policy.max_payload_bytes,
        ) {
            Ok(bytes) => {
                return ingest(ctx, arrived_tx, tip, candidate, bytes);
            }
            Err(ExchangeError::NotFound) => {
                // This announcer no longer (or never) had the record.
                ctx.announcers.mark_failed(&tip.cid, candidate);
                return false;
            }
            Err(ExchangeError::RateLimited) => {
                ctx.announcers.mark_failed(&tip.cid, candidate);
                return false;
            }
            Err(e) if e.is_transient() => {
                if Instant::now() >= deadline {
                    return false;
                }
                debug!(
                    cid = %tip.cid,
                    peer = %candidate,
                    attempt,
                    error = %e,
                    "transient fetch failure, backing off"
                );
                // A little jitter keeps a fleet of nodes from retrying an
                // announcer in lockstep.
                let jitter =
                    Duration::from_millis(rand::Rng::gen_range(&mut rand::thread_rng(), 0..100));
                if !sleep_with_shutdown(ctx, backoff + jitter, deadline) {
                    return false;
                }
                backoff *= ctx.settings.backoff_multiplier;
            }
            Err(e) => {
                debug!(cid = %tip.cid, peer = %candidate, error = %e, "fetch rejected");
                ctx.announcers.mark_failed(&tip.cid, candidate);
                return false;
            }
        }
    }
    ctx.announcers.mark_failed(&tip.cid, candidate);
    false
}

/// Validates and stores fetched bytes; true when the record landed.
fn ingest(
    ctx: &FetcherContext,
    arrived_tx: &ArrivedSender,
    tip: &Tip,
    candidate: PeerId,
    bytes: Vec<u8>,
) -> bool {
    if !cid_matches(&tip.cid, &bytes) {
        // A peer that serves bytes under the wrong CID is lying; never ask
        // it for this CID again.
        bump(&ctx.metrics.cid_mismatch);
        ctx.metrics.record_error(
            ErrorKind::Data,
            format!("cid mismatch from {candidate} for {}", tip.cid),
        );
        ctx.registry
            .note_event(&candidate, PeerOp::Fetch, OpOutcome::Denied, Instant::now());
        ctx.announcers.mark_failed(&tip.cid, candidate);
        return false;
    }
    if ctx.validator.validate(&tip.schema, &bytes).is_err() {
        bump(&ctx.metrics.fetch_failed);
        ctx.metrics.record_error(
            ErrorKind::Data,
            format!("fetched payload failed validation ({})", tip.schema),
        );
        ctx.announcers.mark_failed(&tip.cid, candidate);
        return false;
    }

    let received_at = unix_time_millis();
    let ttl_expires_at = if tip.policy.auto_pin {
        None
    } else {
        Some(received_at + tip.policy.ttl.as_millis() as i64)
    };
    match ctx.store.put(PutRecord {
        schema: tip.schema.clone(),
        bytes: &bytes,
        publisher: tip.announcer,
        signature: None,
        received_at,
        ttl_expires_at,
    }) {
        Ok(outcome) => {
            // Duplicate announcers seen while the fetch was pending become
            // observation rows of the landed record.
            for peer in ctx.announcers.known_announcers(&tip.cid) {
                if peer != tip.announcer {
                    let _ = ctx
                        .store
                        .record_observation(&tip.schema, &outcome.cid, peer, received_at);
                }
            }
            if outcome.inserted {
                let envelope = Arc::new(RecordEnvelope {
                    cid: outcome.cid,
                    schema: tip.schema.clone(),
                    publisher: tip.announcer,
                    received_at,
                    bytes,
                });
                let _ = arrived_tx.send(envelope);
            }
            true
        }
        Err(e) => {
            warn!(cid = %tip.cid, error = %e, "store write failed after fetch");
            if !e.is_transient() {
                ctx.metrics
                    .record_error(ErrorKind::Data, format!("fetch store: {e}"));
            }
            false
        }
    }
}

/// Sleeps in slices, aborting early on shutdown or deadline; true when the
/// full backoff elapsed.
fn sleep_with_shutdown(ctx: &FetcherContext, backoff: Duration, deadline: Instant) -> bool {
    let until = Instant::now() + backoff;
    while Instant::now() < until {
        if ctx.shutdown.load(Ordering::Acquire) {
            return false;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(BACKOFF_SLICE.min(until - Instant::now()));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::{AnnouncerBook, FetchSettings, FetcherContext, FetcherPool};
    use crate::config::NodeConfig;
    use crate::exchange::{handle_stream, ExchangeContext};
    use crate::inflight::InFlightSet;
    use crate::metrics::NodeMetrics;
    use crate::policy::{EffectivePolicy, PolicyTable};
    use crate::tipqueue::{Tip, TipQueue};
    use crate::trust::{GateConfig, PeerRegistry, TrustLevel};
    use sdx_core::cid::cid_string;
    use sdx_core::schema::SchemaCatalog;
    use sdx_core::{PeerId, SchemaId};
    use sdx_store::{PutRecord, Store, StoreOptions};
    use sdx_transport::memory::MemoryNetwork;
    use sdx_transport::StreamTransport;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    fn catalog() -> Arc<SchemaCatalog> {
        let mut catalog = SchemaCatalog::new();
        catalog.register(SchemaId::from("OMM"));
        Arc::new(catalog)
    }

    /// Spins up a remote node that serves its store over the exchange
    /// protocol until dropped.
    fn serve_remote(
        network: &MemoryNetwork,
        peer: PeerId,
        store: Arc<Store>,
    ) -> (Arc<AtomicBool>, thread::JoinHandle<()>) {
        let transport = Arc::new(network.register(peer));
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let metrics = Arc::new(NodeMetrics::new());
        let registry = Arc::new(PeerRegistry::new(
            GateConfig::default(),
            Arc::clone(&metrics),
        ));
        let (arrived_tx, _arrived_rx) = channel();
        let handle = thread::spawn(move || {
            let ctx = ExchangeContext {
                store,
                registry,
                policy: Arc::new(PolicyTable::new(EffectivePolicy::default())),
                validator: catalog(),
                metrics,
                arrived_tx: Mutex::new(arrived_tx),
                frame_timeout: Duration::from_secs(1),
            };
            while !stop_flag.load(Ordering::Acquire) {
                if let Some(mut inbound) =
                    transport.poll_inbound_stream(Duration::from_millis(50))
                {
                    handle_stream(&ctx, inbound.peer, inbound.stream.as_mut());
                }
            }
        });
        (stop, handle)
    }

    struct LocalNode {
        ctx: Arc<FetcherContext>,
        arrived_rx: std::sync::mpsc::Receiver<crate::events::RecordArrived>,
        pool: FetcherPool,
    }

    fn local_node(network: &MemoryNetwork, peer: PeerId, settings: FetchSettings) -> LocalNode {
        let metrics = Arc::new(NodeMetrics::new());
        let registry = Arc::new(PeerRegistry::new(
            GateConfig::default(),
            Arc::clone(&metrics),
        ));
        let ctx = Arc::new(FetcherContext {
            queue: Arc::new(TipQueue::new(128)),
            store: Arc::new(Store::open_in_memory(StoreOptions::default()).expect("store")),
            registry,
            transport: Arc::new(network.register(peer)),
            validator: catalog(),
            inflight: Arc::new(InFlightSet::new()),
            announcers: Arc::new(AnnouncerBook::new()),
            metrics,
            settings,
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        let (arrived_tx, arrived_rx) = channel();
        let pool = FetcherPool::start(Arc::clone(&ctx), arrived_tx, 2);
        LocalNode {
            ctx,
            arrived_rx,
            pool,
        }
    }

    fn settings() -> FetchSettings {
        FetchSettings {
            max_fetch_latency: Duration::from_secs(5),
            retry_attempts: 2,
            backoff_initial: Duration::from_millis(50),
            backoff_multiplier: 2,
            rate_limited_requeues: 1,
        }
    }

    fn tip_for(cid: &str, announcer: PeerId) -> Tip {
        Tip {
            cid: cid.to_string(),
            schema: SchemaId::from("OMM"),
            announcer,
            alternates: Vec::new(),
            priority: 128,
            received_at: Instant::now(),
            announced_at_millis: 0,
            policy: EffectivePolicy::default(),
            requeues: 0,
        }
    }

    fn shutdown(node: LocalNode) {
        node.ctx.shutdown.store(true, Ordering::Release);
        node.ctx.queue.close();
        node.pool.join();
    }

    #[test]
    fn fetches_announced_record_end_to_end() {
        let network = MemoryNetwork::new();
        let remote_peer = PeerId([0xA; 32]);
        let remote_store =
            Arc::new(Store::open_in_memory(StoreOptions::default()).expect("store"));
        let bytes = vec![0x42; 64];
        let outcome = remote_store
            .put(PutRecord {
                schema: SchemaId::from("OMM"),
                bytes: &bytes,
                publisher: remote_peer,
                signature: None,
                received_at: 1,
                ttl_expires_at: None,
            })
            .expect("seed put should succeed");
        let (stop, server) = serve_remote(&network, remote_peer, remote_store);

        let node = local_node(&network, PeerId([0xB; 32]), settings());
        node.ctx.queue.enqueue(tip_for(&outcome.cid, remote_peer));

        let arrived = node
            .arrived_rx
            .recv_timeout(Duration::from_secs(3))
            .expect("record should arrive");
        assert_eq!(arrived.cid, outcome.cid);
        assert_eq!(arrived.bytes, bytes);
        assert!(node
            .ctx
            .store
            .has(&SchemaId::from("OMM"), &outcome.cid)
            .expect("has should succeed"));
        assert_eq!(node.ctx.metrics.snapshot().fetch_ok, 1);
        assert!(node.ctx.inflight.is_empty());

        stop.store(true, Ordering::Release);
        server.join().expect("server should stop");
        shutdown(node);
    }

    /// A peer that answers every REQUEST with bytes that do not hash to the
    /// requested CID.
    fn serve_lying_remote(
        network: &MemoryNetwork,
        peer: PeerId,
    ) -> (Arc<AtomicBool>, thread::JoinHandle<()>) {
        use sdx_codec::frame::{Frame, ResponseCode};
        use sdx_transport::DuplexStream;
        let transport = Arc::new(network.register(peer));
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::Acquire) {
                let Some(mut inbound) =
                    transport.poll_inbound_stream(Duration::from_millis(50))
                else {
                    continue;
                };
                let stream = inbound.stream.as_mut();
                stream.set_deadline(Some(Instant::now() + Duration::from_secs(1)));
                // Drain the request header and cid.
                let Ok(_opcode) = stream.read_u8() else { continue };
                let Ok(schema_len) = stream.read_u16_be() else { continue };
                let mut schema_raw = vec![0_u8; schema_len as usize];
                if stream.read_exact(&mut schema_raw).is_err() {
                    continue;
                }
                let Ok(cid_len) = stream.read_u16_be() else { continue };
                let mut cid_raw = vec![0_u8; cid_len as usize];
                if stream.read_exact(&mut cid_raw).is_err() {
                    continue;
                }
                let reply = Frame::Response {
                    schema: SchemaId::from("OMM"),
                    code: ResponseCode::Accept,
                    payload: b"not what was promised".to_vec(),
                };
                let encoded = reply.encode().expect("reply should encode");
                let _ = stream.write_all(&encoded);
                stream.close();
            }
        });
        (stop, handle)
    }

    #[test]
    fn cid_mismatch_discards_and_blacklists_the_announcer() {
        let network = MemoryNetwork::new();
        let liar = PeerId([0xA; 32]);
        let (stop, server) = serve_lying_remote(&network, liar);

        let mut fast = settings();
        fast.max_fetch_latency = Duration::from_secs(2);
        let node = local_node(&network, PeerId([0xB; 32]), fast);
        let promised_cid = cid_string(b"what was promised");
        node.ctx.queue.enqueue(tip_for(&promised_cid, liar));

        // Nothing arrives and the store stays unchanged.
        assert!(node
            .arrived_rx
            .recv_timeout(Duration::from_secs(2))
            .is_err());
        let snap = node.ctx.metrics.snapshot();
        assert_eq!(snap.cid_mismatch, 1);
        assert_eq!(snap.fetch_ok, 0);
        assert_eq!(
            node.ctx.store.stats().expect("stats should read").records,
            0
        );

        // The liar is blacklisted for this CID: a second tip fails without
        // another mismatch being recorded.
        node.ctx.queue.enqueue(tip_for(&promised_cid, liar));
        thread::sleep(Duration::from_millis(300));
        assert_eq!(node.ctx.metrics.snapshot().cid_mismatch, 1);

        stop.store(true, Ordering::Release);
        server.join().expect("server should stop");
        shutdown(node);
    }

    #[test]
    fn denied_announcer_drops_the_tip() {
        let network = MemoryNetwork::new();
        let remote_peer = PeerId([0xA; 32]);
        let node = local_node(&network, PeerId([0xB; 32]), settings());
        node.ctx.registry.set_trust(remote_peer, TrustLevel::Untrusted);
        node.ctx
            .queue
            .enqueue(tip_for(&cid_string(b"record"), remote_peer));
        assert!(node
            .arrived_rx
            .recv_timeout(Duration::from_millis(300))
            .is_err());
        assert_eq!(node.ctx.metrics.snapshot().fetch_ok, 0);
        shutdown(node);
    }

    #[test]
    fn unresponsive_announcer_hits_the_deadline() {
        let network = MemoryNetwork::new();
        let remote_peer = PeerId([0xA; 32]);
        // Register the remote endpoint but never serve its streams.
        let _silent = network.register(remote_peer);

        let mut fast = settings();
        fast.max_fetch_latency = Duration::from_millis(400);
        fast.retry_attempts = 1;
        let node = local_node(&network, PeerId([0xB; 32]), fast);
        node.ctx
            .queue
            .enqueue(tip_for(&cid_string(b"never served"), remote_peer));

        let waited = Instant::now();
        while node.ctx.metrics.snapshot().fetch_deadline_exceeded == 0
            && waited.elapsed() < Duration::from_secs(3)
        {
            thread::sleep(Duration::from_millis(25));
        }
        assert!(node.ctx.metrics.snapshot().fetch_deadline_exceeded >= 1);
        // The in-flight claim was released despite the timeout.
        assert!(node.ctx.inflight.is_empty());
        shutdown(node);
    }

    #[test]
    fn already_stored_tip_is_skipped_without_network() {
        let network = MemoryNetwork::new();
        let node = local_node(&network, PeerId([0xB; 32]), settings());
        let outcome = node
            .ctx
            .store
            .put(PutRecord {
                schema: SchemaId::from("OMM"),
                bytes: b"already here",
                publisher: PeerId([0xC; 32]),
                signature: None,
                received_at: 1,
                ttl_expires_at: None,
            })
            .expect("seed put should succeed");
        // Announcer does not even exist on the network.
        node.ctx
            .queue
            .enqueue(tip_for(&outcome.cid, PeerId([0xEE; 32])));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(node.ctx.metrics.snapshot().fetch_failed, 0);
        assert_eq!(node.ctx.metrics.snapshot().fetch_deadline_exceeded, 0);
        shutdown(node);
    }

    #[test]
    fn announcer_book_orders_and_filters_candidates() {
        let book = AnnouncerBook::new();
        let cid = "bcid";
        book.note_announcer(cid, PeerId([2; 32]));
        book.note_announcer(cid, PeerId([3; 32]));
        book.mark_failed(cid, PeerId([3; 32]));

        let mut tip = tip_for(cid, PeerId([1; 32]));
        tip.alternates.push(PeerId([4; 32]));
        let candidates = book.candidates_for(&tip);
        assert_eq!(
            candidates,
            vec![PeerId([1; 32]), PeerId([4; 32]), PeerId([2; 32])]
        );
    }
}

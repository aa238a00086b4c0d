use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use sdx_codec::announcement::Announcement;
use sdx_codec::frame::EXCHANGE_PROTOCOL_ID;
use sdx_core::schema::SchemaValidator;
use sdx_core::time::unix_time_millis;
use sdx_core::{PeerId, SchemaId};
use sdx_crypto::signing::IdentitySigner;
use sdx_store::{PutRecord, Store, StoreError};
use sdx_transport::{StreamTransport, TransportError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{AnnouncementBus, BusAdmission};
use crate::config::NodeConfig;
use crate::events::{ArrivedSender, RecordEnvelope};
use crate::exchange::{handle_stream, ExchangeContext};
use crate::fetcher::{AnnouncerBook, FetchSettings, FetcherContext, FetcherPool};
use crate::inflight::InFlightSet;
use crate::metrics::{bump, ErrorKind, NodeMetrics};
use crate::policy::PolicyTable;
use crate::subscriptions::{
    SessionDelivery, SessionId, SessionInfo, SubscribeError, SubscriptionManager,
    SubscriptionSpec,
};
use crate::tipqueue::{derive_priority, EnqueueOutcome, Tip, TipQueue};
use crate::trust::{PeerOp, PeerRegistry};

/// Errors returned by the local publish entry point.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("schema validator rejected the record")]
    SchemaRejected,
    #[error(transparent)]
    Store(StoreError),
    #[error("transport failure: {0}")]
    Transport(TransportError),
}

/// Everything the engine needs from its host.
pub struct NodeServiceParams {
    pub config: NodeConfig,
    pub store: Arc<Store>,
    pub transport: Arc<dyn StreamTransport>,
    pub validator: Arc<dyn SchemaValidator>,
    pub signer: Arc<dyn IdentitySigner>,
    pub registry: Arc<PeerRegistry>,
    pub policy: Arc<PolicyTable>,
    pub metrics: Arc<NodeMetrics>,
    /// Schemas this node ingests from the gossip overlay.
    pub schemas: Vec<SchemaId>,
}

/// The assembled ingest-and-distribution engine.
///
/// Startup order: delivery pump, fetch workers, stream acceptor, gossip
/// ingest. Shutdown drains in reverse.
pub struct NodeService {
    config: NodeConfig,
    store: Arc<Store>,
    transport: Arc<dyn StreamTransport>,
    validator: Arc<dyn SchemaValidator>,
    signer: Arc<dyn IdentitySigner>,
    registry: Arc<PeerRegistry>,
    policy: Arc<PolicyTable>,
    metrics: Arc<NodeMetrics>,
    bus: Arc<AnnouncementBus>,
    queue: Arc<TipQueue>,
    subs: Arc<SubscriptionManager>,
    announcers: Arc<AnnouncerBook>,
    arrived_tx: ArrivedSender,
    shutdown: Arc<AtomicBool>,
    fetch_pool: Option<FetcherPool>,
    ingest_thread: Option<JoinHandle<()>>,
    accept_thread: Option<JoinHandle<()>>,
    pump_thread: Option<JoinHandle<()>>,
}

impl NodeService {
    /// Wires the subsystems together and starts every loop.
    pub fn start(params: NodeServiceParams) -> Self {
        let config = params.config.sanitized();
        let metrics = params.metrics;
        let shutdown = Arc::new(AtomicBool::new(false));
        let queue = Arc::new(TipQueue::new(config.tip_queue_capacity));
        let inflight = Arc::new(InFlightSet::new());
        let announcers = Arc::new(AnnouncerBook::new());
        let subs = Arc::new(SubscriptionManager::new(&config, Arc::clone(&metrics)));
        let bus = Arc::new(AnnouncementBus::new(
            Arc::clone(&params.transport),
            Arc::clone(&params.registry),
            Arc::clone(&metrics),
            config.dedup_window,
            config.dedup_capacity,
            config.slow_peer_threshold,
        ));
        let (arrived_tx, arrived_rx) = channel();

        // Delivery pump: one-way arrival events into the session manager.
        let pump_thread = {
            let subs = Arc::clone(&subs);
            let store = Arc::clone(&params.store);
            let metrics = Arc::clone(&metrics);
            let shutdown = Arc::clone(&shutdown);
            let poll = config.poll_interval;
            let maintenance = config.maintenance_interval;
            thread::Builder::new()
                .name("sdx-delivery".to_string())
                .spawn(move || {
                    let mut last_maintenance = Instant::now();
                    loop {
                        match arrived_rx.recv_timeout(poll) {
                            Ok(envelope) => {
                                bump(&metrics.records_delivered);
                                subs.on_record(&envelope, Instant::now());
                            }
                            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                        }
                        let now = Instant::now();
                        if now.saturating_duration_since(last_maintenance) >= maintenance {
                            last_maintenance = now;
                            subs.tick(now);
                            match store.prune(unix_time_millis()) {
                                Ok(_) => {}
                                Err(StoreError::ReadOnly) => {}
                                Err(e) => warn!(error = %e, "store prune failed"),
                            }
                        }
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                    }
                })
                .expect("delivery pump should spawn")
        };

        // Fetch workers.
        let fetch_ctx = Arc::new(FetcherContext {
            queue: Arc::clone(&queue),
            store: Arc::clone(&params.store),
            registry: Arc::clone(&params.registry),
            transport: Arc::clone(&params.transport),
            validator: Arc::clone(&params.validator),
            inflight,
            announcers: Arc::clone(&announcers),
            metrics: Arc::clone(&metrics),
            settings: FetchSettings::from(&config),
            shutdown: Arc::clone(&shutdown),
        });
        let fetch_pool = FetcherPool::start(fetch_ctx, arrived_tx.clone(), config.fetch_workers);

        // Inbound exchange streams.
        let accept_thread = {
            let exchange_ctx = Arc::new(ExchangeContext {
                store: Arc::clone(&params.store),
                registry: Arc::clone(&params.registry),
                policy: Arc::clone(&params.policy),
                validator: Arc::clone(&params.validator),
                metrics: Arc::clone(&metrics),
                arrived_tx: Mutex::new(arrived_tx.clone()),
                frame_timeout: config.frame_timeout,
            });
            let transport = Arc::clone(&params.transport);
            let registry = Arc::clone(&params.registry);
            let shutdown = Arc::clone(&shutdown);
            let poll = config.poll_interval;
            let max_streams = config.max_inbound_streams;
            thread::Builder::new()
                .name("sdx-accept".to_string())
                .spawn(move || {
                    let active = Arc::new(AtomicUsize::new(0));
                    while !shutdown.load(Ordering::Acquire) {
                        let Some(mut inbound) = transport.poll_inbound_stream(poll) else {
                            continue;
                        };
                        if inbound.protocol != EXCHANGE_PROTOCOL_ID {
                            debug!(protocol = %inbound.protocol, "unknown stream protocol");
                            inbound.stream.close();
                            continue;
                        }
                        // Untrusted peers cannot open streams at all.
                        if !registry
                            .admit(&inbound.peer, PeerOp::Stream, Instant::now())
                            .is_allowed()
                        {
                            inbound.stream.close();
                            continue;
                        }
                        if active.load(Ordering::Acquire) >= max_streams {
                            inbound.stream.close();
                            continue;
                        }
                        active.fetch_add(1, Ordering::AcqRel);
                        let ctx = Arc::clone(&exchange_ctx);
                        let spawn_active = Arc::clone(&active);
                        let spawned = thread::Builder::new()
                            .name("sdx-stream".to_string())
                            .spawn(move || {
                                handle_stream(&ctx, inbound.peer, inbound.stream.as_mut());
                                spawn_active.fetch_sub(1, Ordering::AcqRel);
                            });
                        if spawned.is_err() {
                            active.fetch_sub(1, Ordering::AcqRel);
                        }
                    }
                })
                .expect("stream acceptor should spawn")
        };

        // Gossip ingest: datagrams -> bus admission -> tips.
        let ingest_thread = {
            let bus = Arc::clone(&bus);
            let store = Arc::clone(&params.store);
            let transport = Arc::clone(&params.transport);
            let registry = Arc::clone(&params.registry);
            let policy = Arc::clone(&params.policy);
            let validator = Arc::clone(&params.validator);
            let announcers = Arc::clone(&announcers);
            let queue = Arc::clone(&queue);
            let metrics = Arc::clone(&metrics);
            let shutdown = Arc::clone(&shutdown);
            let poll = config.poll_interval;
            let pin_bonus = config.pin_priority_bonus;
            let schema_bonus = config.schema_priority_bonus.clone();
            let interest: std::collections::HashSet<SchemaId> =
                params.schemas.iter().cloned().collect();
            thread::Builder::new()
                .name("sdx-ingest".to_string())
                .spawn(move || {
                    while !shutdown.load(Ordering::Acquire) {
                        let Some((from, raw)) = transport.poll_datagram(poll) else {
                            continue;
                        };
                        let now = Instant::now();
                        match bus.handle_remote(from, &raw, now) {
                            BusAdmission::Admitted(ann) => {
                                if !validator.is_known(&ann.schema_id)
                                    || !interest.contains(&ann.schema_id)
                                {
                                    debug!(schema = %ann.schema_id, "announcement outside interest set");
                                    continue;
                                }
                                announcers.note_announcer(&ann.cid, ann.publisher);
                                let effective = policy.resolve(&ann.publisher, &ann.schema_id);
                                if !effective.auto_fetch {
                                    debug!(cid = %ann.cid, "auto-fetch disabled by policy");
                                    continue;
                                }
                                let level = registry.effective_level(&ann.publisher, now);
                                let bonus = schema_bonus
                                    .get(ann.schema_id.as_str())
                                    .copied()
                                    .unwrap_or(0);
                                let tip = Tip {
                                    cid: ann.cid.clone(),
                                    schema: ann.schema_id.clone(),
                                    announcer: ann.publisher,
                                    alternates: Vec::new(),
                                    priority: derive_priority(
                                        level, &effective, bonus, pin_bonus,
                                    ),
                                    received_at: now,
                                    announced_at_millis: ann.timestamp_millis,
                                    policy: effective,
                                    requeues: 0,
                                };
                                match queue.enqueue(tip) {
                                    EnqueueOutcome::Queued => bump(&metrics.tips_enqueued),
                                    EnqueueOutcome::EvictedLowest => {
                                        bump(&metrics.tips_enqueued);
                                        bump(&metrics.tips_evicted);
                                    }
                                    EnqueueOutcome::Discarded => bump(&metrics.tips_discarded),
                                    EnqueueOutcome::Closed => {}
                                }
                            }
                            BusAdmission::Duplicate(ann) => {
                                // Remember the extra source for failover; if
                                // the record already landed, the duplicate
                                // becomes another observation row.
                                announcers.note_announcer(&ann.cid, ann.publisher);
                                let _ = store.record_observation(
                                    &ann.schema_id,
                                    &ann.cid,
                                    ann.publisher,
                                    unix_time_millis(),
                                );
                            }
                            BusAdmission::Malformed => {
                                metrics.record_error(
                                    ErrorKind::Protocol,
                                    format!("malformed announcement from {from}"),
                                );
                            }
                            BusAdmission::InvalidSignature
                            | BusAdmission::Denied
                            | BusAdmission::SchemaDisabled => {}
                        }
                    }
                })
                .expect("gossip ingest should spawn")
        };

        info!(
            peer = %params.transport.local_peer(),
            workers = config.fetch_workers,
            schemas = params.schemas.len(),
            "node service started"
        );

        Self {
            config,
            store: params.store,
            transport: params.transport,
            validator: params.validator,
            signer: params.signer,
            registry: params.registry,
            policy: params.policy,
            metrics,
            bus,
            queue,
            subs,
            announcers,
            arrived_tx,
            shutdown,
            fetch_pool: Some(fetch_pool),
            ingest_thread: Some(ingest_thread),
            accept_thread: Some(accept_thread),
            pump_thread: Some(pump_thread),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.transport.local_peer()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &Arc<PolicyTable> {
        &self.policy
    }

    pub fn metrics(&self) -> &Arc<NodeMetrics> {
        &self.metrics
    }

    pub fn bus(&self) -> &Arc<AnnouncementBus> {
        &self.bus
    }

    pub fn announcer_book(&self) -> &Arc<AnnouncerBook> {
        &self.announcers
    }

    /// Stores a local record, signs and broadcasts its announcement, and
    /// feeds local sessions. The entry point used by producers and sync
    /// workers.
    pub fn publish_record(
        &self,
        schema: SchemaId,
        bytes: Vec<u8>,
        pin: bool,
    ) -> Result<String, PublishError> {
        if self.validator.validate(&schema, &bytes).is_err() {
            return Err(PublishError::SchemaRejected);
        }
        let received_at = unix_time_millis();
        let signature = self.signer.sign(&bytes);
        let local = self.local_peer();
        let effective = self.policy.resolve(&local, &schema);
        let ttl_expires_at = if pin || effective.auto_pin {
            None
        } else {
            Some(received_at + effective.ttl.as_millis() as i64)
        };
        let outcome = self
            .store
            .put(PutRecord {
                schema: schema.clone(),
                bytes: &bytes,
                publisher: local,
                signature: Some(signature.to_vec()),
                received_at,
                ttl_expires_at,
            })
            .map_err(PublishError::Store)?;

        let announcement = Announcement::sign(
            schema.clone(),
            outcome.cid.clone(),
            received_at,
            None,
            self.signer.as_ref(),
        );
        self.bus
            .publish(&announcement)
            .map_err(PublishError::Transport)?;

        if outcome.inserted {
            let envelope = Arc::new(RecordEnvelope {
                cid: outcome.cid.clone(),
                schema,
                publisher: local,
                received_at,
                bytes,
            });
            let _ = self.arrived_tx.send(envelope);
        }
        Ok(outcome.cid)
    }

    /// Creates a local delivery session.
    pub fn subscribe(
        &self,
        spec: SubscriptionSpec,
    ) -> Result<(SessionId, std::sync::mpsc::Receiver<SessionDelivery>), SubscribeError> {
        self.subs.create(self.local_peer(), spec)
    }

    /// Creates a delivery session on behalf of a remote client peer.
    pub fn subscribe_for_peer(
        &self,
        owner: PeerId,
        spec: SubscriptionSpec,
    ) -> Result<(SessionId, std::sync::mpsc::Receiver<SessionDelivery>), SubscribeError> {
        self.subs.create(owner, spec)
    }

    pub fn cancel_subscription(&self, id: SessionId) -> bool {
        self.subs.cancel(id)
    }

    pub fn list_subscriptions(&self) -> Vec<SessionInfo> {
        self.subs.list()
    }

    /// Handles a peer disconnect: sessions, gossip topics, trust bookkeeping.
    pub fn peer_departed(&self, peer: &PeerId) {
        let closed = self.subs.cancel_for_peer(peer);
        self.bus.remove_peer(peer);
        if closed > 0 {
            debug!(peer = %peer, closed, "closed sessions for departed peer");
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Stops every loop and drains in reverse startup order.
    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("node service stopping");
        // Ingest first so no new tips form, then the acceptor, then the
        // workers, then delivery.
        if let Some(handle) = self.ingest_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        self.queue.close();
        if let Some(pool) = self.fetch_pool.take() {
            pool.join();
        }
        if let Some(handle) = self.pump_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NodeService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

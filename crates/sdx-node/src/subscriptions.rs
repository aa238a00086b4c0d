use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sdx_core::time::unix_time_millis;
use sdx_core::{PeerId, SchemaId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::NodeConfig;
use crate::events::RecordArrived;
use crate::filter::{FilterSet, RecordView};
use crate::metrics::{bump, NodeMetrics};

/// Per-session delivery queue depth; matches flow beyond it wait for the
/// next tick, and are dropped once the retry buffer is also full.
const SESSION_CHANNEL_DEPTH: usize = 256;
const PENDING_RETRY_DEPTH: usize = 1024;

/// Client-facing delivery modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// First matching record, then the session terminates.
    Single,
    /// Matches as they arrive, shaped by the session token bucket.
    Streaming,
    /// Matches grouped by size or window.
    Batch,
}

/// Parameters of one subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    pub schema: SchemaId,
    pub mode: DeliveryMode,
    #[serde(default)]
    pub filters: FilterSet,
    #[serde(default)]
    pub messages_per_minute: Option<u32>,
    #[serde(default, with = "humantime_serde::option")]
    pub batch_window: Option<Duration>,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// One delivery handed to the session's channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDelivery {
    Record(RecordArrived),
    Batch(Vec<RecordArrived>),
}

/// Errors returned by session creation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("per-peer session cap reached")]
    PerPeerCapExceeded,
    #[error("global session cap reached")]
    GlobalCapExceeded,
}

/// Listing entry for the admin surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub owner: PeerId,
    pub schema: SchemaId,
    pub mode: DeliveryMode,
    pub created_at: i64,
    pub delivered: u64,
}

struct SessionBucket {
    tokens: f64,
    last_refill: Instant,
    per_minute: f64,
}

impl SessionBucket {
    fn new(per_minute: u32, now: Instant) -> Self {
        let per_minute = f64::from(per_minute.max(1));
        Self {
            tokens: per_minute,
            last_refill: now,
            per_minute,
        }
    }

    fn take(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.per_minute / 60.0).min(self.per_minute);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct Session {
    id: SessionId,
    owner: PeerId,
    spec: SubscriptionSpec,
    sink: SyncSender<SessionDelivery>,
    delivered_cids: HashSet<String>,
    pending: VecDeque<SessionDelivery>,
    batch_buf: Vec<RecordArrived>,
    batch_window: Duration,
    batch_size: usize,
    batch_deadline: Instant,
    bucket: SessionBucket,
    created_at: Instant,
    created_at_millis: i64,
    last_match: Instant,
    delivered: u64,
    done: bool,
}

impl Session {
    /// Queues a delivery for flushing; retries ride the pending buffer so a
    /// record is never queued twice.
    fn offer(&mut self, delivery: SessionDelivery) {
        if self.pending.len() >= PENDING_RETRY_DEPTH {
            // Keep the oldest; later matches lose under sustained pressure.
            return;
        }
        self.pending.push_back(delivery);
    }

    /// Flushes pending deliveries; false when the client side is gone.
    fn flush(&mut self) -> bool {
        while let Some(delivery) = self.pending.pop_front() {
            let delivered_count = match &delivery {
                SessionDelivery::Record(_) => 1,
                SessionDelivery::Batch(group) => group.len() as u64,
            };
            match self.sink.try_send(delivery) {
                Ok(()) => {
                    self.delivered += delivered_count;
                }
                Err(TrySendError::Full(delivery)) => {
                    self.pending.push_front(delivery);
                    return true;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
        true
    }
}

/// Client-facing delivery: per-peer streaming sessions with field filters,
/// session caps, and three delivery modes.
pub struct SubscriptionManager {
    sessions: Mutex<HashMap<u64, Session>>,
    next_id: AtomicU64,
    cap_per_peer: usize,
    cap_global: usize,
    single_ttl: Duration,
    default_batch_window: Duration,
    default_batch_size: usize,
    inactivity_factor: u32,
    default_messages_per_minute: u32,
    metrics: Arc<NodeMetrics>,
}

impl SubscriptionManager {
    pub fn new(config: &NodeConfig, metrics: Arc<NodeMetrics>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            cap_per_peer: config.session_cap_per_peer,
            cap_global: config.session_cap_global,
            single_ttl: config.single_session_ttl,
            default_batch_window: config.default_batch_window,
            default_batch_size: config.default_batch_size,
            inactivity_factor: config.inactivity_batch_factor,
            default_messages_per_minute: config.default_messages_per_minute,
            metrics,
        }
    }

    /// Creates a session; the returned receiver is the delivery channel.
    pub fn create(
        &self,
        owner: PeerId,
        spec: SubscriptionSpec,
    ) -> Result<(SessionId, Receiver<SessionDelivery>), SubscribeError> {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        if sessions.len() >= self.cap_global {
            return Err(SubscribeError::GlobalCapExceeded);
        }
        let owned = sessions.values().filter(|s| s.owner == owner).count();
        if owned >= self.cap_per_peer {
            return Err(SubscribeError::PerPeerCapExceeded);
        }

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sink, source) = sync_channel(SESSION_CHANNEL_DEPTH);
        let now = Instant::now();
        let batch_window = spec.batch_window.unwrap_or(self.default_batch_window);
        let batch_size = spec.batch_size.unwrap_or(self.default_batch_size).max(1);
        let per_minute = spec
            .messages_per_minute
            .unwrap_or(self.default_messages_per_minute);
        debug!(session = %id, schema = %spec.schema, mode = ?spec.mode, "session created");
        sessions.insert(
            id.0,
            Session {
                id,
                owner,
                spec,
                sink,
                delivered_cids: HashSet::new(),
                pending: VecDeque::new(),
                batch_buf: Vec::new(),
                batch_window,
                batch_size,
                batch_deadline: now + batch_window,
                bucket: SessionBucket::new(per_minute, now),
                created_at: now,
                created_at_millis: unix_time_millis(),
                last_match: now,
                delivered: 0,
                done: false,
            },
        );
        Ok((id, source))
    }

    /// Terminates one session.
    pub fn cancel(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let removed = sessions.remove(&id.0).is_some();
        if removed {
            bump(&self.metrics.sessions_closed);
        }
        removed
    }

    /// Terminates every session owned by a disconnected peer.
    pub fn cancel_for_peer(&self, owner: &PeerId) -> usize {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let doomed: Vec<u64> = sessions
            .iter()
            .filter(|(_, s)| s.owner == *owner)
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            sessions.remove(id);
            bump(&self.metrics.sessions_closed);
        }
        doomed.len()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().expect("session lock poisoned");
        let mut infos: Vec<SessionInfo> = sessions
            .values()
            .map(|s| SessionInfo {
                id: s.id,
                owner: s.owner,
                schema: s.spec.schema.clone(),
                mode: s.spec.mode,
                created_at: s.created_at_millis,
                delivered: s.delivered,
            })
            .collect();
        infos.sort_by_key(|info| info.id.0);
        infos
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("session lock poisoned").len()
    }

    /// Routes one arrived record to every matching session.
    pub fn on_record(&self, arrived: &RecordArrived, now: Instant) {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let view = RecordView::new(arrived);
        for session in sessions.values_mut() {
            if session.done || session.spec.schema != arrived.schema {
                continue;
            }
            if !session.spec.filters.matches(&view) {
                continue;
            }
            // Delivered-set insertion happens at match time so backpressure
            // retries can never duplicate a CID on this session.
            if !session.delivered_cids.insert(arrived.cid.clone()) {
                continue;
            }
            session.last_match = now;
            match session.spec.mode {
                DeliveryMode::Single => {
                    session.offer(SessionDelivery::Record(Arc::clone(arrived)));
                    session.done = true;
                }
                DeliveryMode::Streaming => {
                    // Over the session rate the match is dropped, not
                    // deferred; the CID stays marked as delivered.
                    if session.bucket.take(now) {
                        session.offer(SessionDelivery::Record(Arc::clone(arrived)));
                    }
                }
                DeliveryMode::Batch => {
                    session.batch_buf.push(Arc::clone(arrived));
                    if session.batch_buf.len() >= session.batch_size {
                        let group = std::mem::take(&mut session.batch_buf);
                        session.offer(SessionDelivery::Batch(group));
                        session.batch_deadline = now + session.batch_window;
                    }
                }
            }
            let _ = session.flush();
        }
    }

    /// Periodic sweep: batch-window flushes, backpressure retries, and
    /// inactivity/lifecycle closures.
    pub fn tick(&self, now: Instant) {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let mut closed: Vec<u64> = Vec::new();
        for (raw_id, session) in sessions.iter_mut() {
            if session.spec.mode == DeliveryMode::Batch
                && now >= session.batch_deadline
            {
                if !session.batch_buf.is_empty() {
                    let group = std::mem::take(&mut session.batch_buf);
                    session.offer(SessionDelivery::Batch(group));
                }
                session.batch_deadline = now + session.batch_window;
            }

            let alive = session.flush();
            if !alive {
                closed.push(*raw_id);
                continue;
            }
            if session.done && session.pending.is_empty() {
                closed.push(*raw_id);
                continue;
            }
            let expired = match session.spec.mode {
                DeliveryMode::Single => {
                    now.saturating_duration_since(session.created_at) > self.single_ttl
                }
                DeliveryMode::Streaming | DeliveryMode::Batch => {
                    let idle = now.saturating_duration_since(session.last_match);
                    idle > session.batch_window * self.inactivity_factor
                }
            };
            if expired {
                closed.push(*raw_id);
            }
        }
        for raw_id in closed {
            if let Some(session) = sessions.remove(&raw_id) {
                debug!(session = %session.id, "session closed");
                bump(&self.metrics.sessions_closed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DeliveryMode, SessionDelivery, SubscribeError, SubscriptionManager, SubscriptionSpec,
    };
    use crate::config::NodeConfig;
    use crate::events::RecordEnvelope;
    use crate::filter::{FieldFilter, FilterOp, FilterSet};
    use crate::metrics::NodeMetrics;
    use sdx_core::{PeerId, SchemaId};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn manager(config: NodeConfig) -> SubscriptionManager {
        SubscriptionManager::new(&config, Arc::new(NodeMetrics::new()))
    }

    fn spec(mode: DeliveryMode) -> SubscriptionSpec {
        SubscriptionSpec {
            schema: SchemaId::from("OMM"),
            mode,
            filters: FilterSet::default(),
            messages_per_minute: None,
            batch_window: None,
            batch_size: None,
        }
    }

    fn arrived(cid: &str, bytes: &[u8]) -> super::RecordArrived {
        Arc::new(RecordEnvelope {
            cid: cid.to_string(),
            schema: SchemaId::from("OMM"),
            publisher: PeerId([1; 32]),
            received_at: 1_000,
            bytes: bytes.to_vec(),
        })
    }

    #[test]
    fn streaming_session_receives_matches() {
        let mgr = manager(NodeConfig::default());
        let (_, rx) = mgr
            .create(PeerId([9; 32]), spec(DeliveryMode::Streaming))
            .expect("session should create");
        let now = Instant::now();
        mgr.on_record(&arrived("bcid1", b"{}"), now);
        match rx.try_recv().expect("delivery should arrive") {
            SessionDelivery::Record(rec) => assert_eq!(rec.cid, "bcid1"),
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn same_cid_is_never_delivered_twice() {
        let mgr = manager(NodeConfig::default());
        let (_, rx) = mgr
            .create(PeerId([9; 32]), spec(DeliveryMode::Streaming))
            .expect("session should create");
        let now = Instant::now();
        mgr.on_record(&arrived("bcid1", b"{}"), now);
        mgr.on_record(&arrived("bcid1", b"{}"), now + Duration::from_millis(1));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn filters_gate_delivery() {
        let mgr = manager(NodeConfig::default());
        let mut streaming = spec(DeliveryMode::Streaming);
        streaming.filters = FilterSet(vec![FieldFilter {
            field: "norad".to_string(),
            op: FilterOp::Eq,
            value: json!(25544),
        }]);
        let (_, rx) = mgr
            .create(PeerId([9; 32]), streaming)
            .expect("session should create");
        let now = Instant::now();
        mgr.on_record(&arrived("bmiss", br#"{"norad": 11111}"#), now);
        mgr.on_record(&arrived("bhit", br#"{"norad": 25544}"#), now);
        match rx.try_recv().expect("matching record should arrive") {
            SessionDelivery::Record(rec) => assert_eq!(rec.cid, "bhit"),
            other => panic!("expected record, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn single_mode_delivers_once_then_closes() {
        let mgr = manager(NodeConfig::default());
        let (_, rx) = mgr
            .create(PeerId([9; 32]), spec(DeliveryMode::Single))
            .expect("session should create");
        let now = Instant::now();
        mgr.on_record(&arrived("bcid1", b"{}"), now);
        mgr.on_record(&arrived("bcid2", b"{}"), now);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        mgr.tick(now + Duration::from_millis(1));
        assert_eq!(mgr.session_count(), 0);
    }

    #[test]
    fn batch_mode_groups_by_size() {
        let mgr = manager(NodeConfig::default());
        let mut batch = spec(DeliveryMode::Batch);
        batch.batch_size = Some(2);
        let (_, rx) = mgr
            .create(PeerId([9; 32]), batch)
            .expect("session should create");
        let now = Instant::now();
        mgr.on_record(&arrived("b1", b"{}"), now);
        assert!(rx.try_recv().is_err());
        mgr.on_record(&arrived("b2", b"{}"), now);
        match rx.try_recv().expect("batch should arrive") {
            SessionDelivery::Batch(group) => assert_eq!(group.len(), 2),
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[test]
    fn batch_mode_flushes_on_window() {
        let mgr = manager(NodeConfig::default());
        let mut batch = spec(DeliveryMode::Batch);
        batch.batch_window = Some(Duration::from_millis(50));
        batch.batch_size = Some(100);
        let (_, rx) = mgr
            .create(PeerId([9; 32]), batch)
            .expect("session should create");
        let now = Instant::now();
        mgr.on_record(&arrived("b1", b"{}"), now);
        mgr.tick(now + Duration::from_millis(60));
        match rx.try_recv().expect("window flush should arrive") {
            SessionDelivery::Batch(group) => assert_eq!(group.len(), 1),
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[test]
    fn session_caps_are_enforced() {
        let mut config = NodeConfig::default();
        config.session_cap_per_peer = 1;
        config.session_cap_global = 2;
        let mgr = manager(config);
        let peer_a = PeerId([1; 32]);
        let peer_b = PeerId([2; 32]);
        let _a = mgr
            .create(peer_a, spec(DeliveryMode::Streaming))
            .expect("first session should create");
        assert_eq!(
            mgr.create(peer_a, spec(DeliveryMode::Streaming)).err(),
            Some(SubscribeError::PerPeerCapExceeded)
        );
        let _b = mgr
            .create(peer_b, spec(DeliveryMode::Streaming))
            .expect("second peer session should create");
        assert_eq!(
            mgr.create(PeerId([3; 32]), spec(DeliveryMode::Streaming)).err(),
            Some(SubscribeError::GlobalCapExceeded)
        );
    }

    #[test]
    fn single_session_expires_without_match() {
        let mut config = NodeConfig::default();
        config.single_session_ttl = Duration::from_millis(10);
        let mgr = manager(config);
        let _rx = mgr
            .create(PeerId([9; 32]), spec(DeliveryMode::Single))
            .expect("session should create");
        mgr.tick(Instant::now() + Duration::from_millis(50));
        assert_eq!(mgr.session_count(), 0);
    }

    #[test]
    fn idle_streaming_session_expires() {
        let mut config = NodeConfig::default();
        config.default_batch_window = Duration::from_millis(10);
        config.inactivity_batch_factor = 5;
        let mgr = manager(config);
        let _rx = mgr
            .create(PeerId([9; 32]), spec(DeliveryMode::Streaming))
            .expect("session should create");
        mgr.tick(Instant::now() + Duration::from_millis(200));
        assert_eq!(mgr.session_count(), 0);
    }

    #[test]
    fn cancel_for_peer_sweeps_sessions() {
        let mgr = manager(NodeConfig::default());
        let peer = PeerId([9; 32]);
        let _a = mgr
            .create(peer, spec(DeliveryMode::Streaming))
            .expect("session should create");
        let _b = mgr
            .create(peer, spec(DeliveryMode::Batch))
            .expect("session should create");
        assert_eq!(mgr.cancel_for_peer(&peer), 2);
        assert_eq!(mgr.session_count(), 0);
    }
}

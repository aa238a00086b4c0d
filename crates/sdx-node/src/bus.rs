use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use sdx_codec::announcement::Announcement;
use sdx_core::{PeerId, SchemaId};
use sdx_transport::{StreamTransport, TransportError};
use tracing::{debug, warn};

use crate::metrics::{bump, NodeMetrics};
use crate::trust::{PeerOp, PeerRegistry};

/// Local subscriber channel depth.
const TOPIC_CHANNEL_DEPTH: usize = 1024;

/// Outcome of admitting one remote announcement at the bus boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusAdmission {
    /// Fresh, verified, inside rate; delivered to local subscribers.
    Admitted(Announcement),
    /// Valid but its CID was already seen inside the de-dup window. The
    /// announcer is still useful as an alternate source for the CID.
    Duplicate(Announcement),
    /// Undecodable bytes.
    Malformed,
    /// Signature did not verify under the declared publisher.
    InvalidSignature,
    /// The announcer is over rate or not permitted to announce.
    Denied,
    /// A per-peer schema override disables this schema.
    SchemaDisabled,
}

struct Topic {
    local: Vec<SyncSender<(Announcement, PeerId)>>,
    remote: HashSet<PeerId>,
}

impl Topic {
    fn new() -> Self {
        Self {
            local: Vec::new(),
            remote: HashSet::new(),
        }
    }
}

struct BusInner {
    topics: HashMap<SchemaId, Topic>,
    seen: LruCache<String, Instant>,
    slow_peers: HashMap<PeerId, u32>,
}

/// Pub/sub fan-out of announcement records, one logical topic per schema.
///
/// Deduplicates by CID inside a sliding window and rate-limits per
/// publisher through the trust gate; drops toward backpressured peers are
/// never queued unbounded.
pub struct AnnouncementBus {
    transport: Arc<dyn StreamTransport>,
    registry: Arc<PeerRegistry>,
    metrics: Arc<NodeMetrics>,
    dedup_window: Duration,
    slow_peer_threshold: u32,
    inner: Mutex<BusInner>,
}

impl AnnouncementBus {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        registry: Arc<PeerRegistry>,
        metrics: Arc<NodeMetrics>,
        dedup_window: Duration,
        dedup_capacity: usize,
        slow_peer_threshold: u32,
    ) -> Self {
        let capacity = NonZeroUsize::new(dedup_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            transport,
            registry,
            metrics,
            dedup_window,
            slow_peer_threshold,
            inner: Mutex::new(BusInner {
                topics: HashMap::new(),
                seen: LruCache::new(capacity),
                slow_peers: HashMap::new(),
            }),
        }
    }

    /// Subscribes locally to one schema topic; lazy topic creation.
    pub fn subscribe(&self, schema: SchemaId) -> Receiver<(Announcement, PeerId)> {
        let (tx, rx) = sync_channel(TOPIC_CHANNEL_DEPTH);
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        inner.topics.entry(schema).or_insert_with(Topic::new).local.push(tx);
        rx
    }

    /// Declares that `peer` wants announcements on `schema`.
    pub fn set_remote_subscription(&self, peer: PeerId, schema: SchemaId, subscribed: bool) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        let topic = inner.topics.entry(schema).or_insert_with(Topic::new);
        if subscribed {
            topic.remote.insert(peer);
        } else {
            topic.remote.remove(&peer);
        }
    }

    /// Drops every subscription held by a departed peer.
    pub fn remove_peer(&self, peer: &PeerId) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        for topic in inner.topics.values_mut() {
            topic.remote.remove(peer);
        }
        inner.slow_peers.remove(peer);
    }

    /// Returns true when `cid` was marked seen within the de-dup window,
    /// marking it seen otherwise.
    fn check_and_mark_seen(&self, inner: &mut BusInner, cid: &str, now: Instant) -> bool {
        if let Some(last) = inner.seen.get(cid) {
            if now.saturating_duration_since(*last) < self.dedup_window {
                return true;
            }
        }
        inner.seen.put(cid.to_string(), now);
        false
    }

    /// Broadcasts a locally produced announcement.
    ///
    /// Returns once every copy has been handed to the transport; no
    /// delivery acknowledgement is implied. The local CID is marked seen so
    /// the node does not schedule a fetch of its own record.
    pub fn publish(&self, announcement: &Announcement) -> Result<usize, TransportError> {
        let encoded = announcement
            .encode()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let now = Instant::now();

        let (remote_peers, local_targets) = {
            let mut inner = self.inner.lock().expect("bus lock poisoned");
            inner.seen.put(announcement.cid.clone(), now);
            match inner.topics.get(&announcement.schema_id) {
                Some(topic) => (
                    topic.remote.iter().copied().collect::<Vec<_>>(),
                    topic.local.clone(),
                ),
                None => (Vec::new(), Vec::new()),
            }
        };

        self.deliver_local(&local_targets, announcement, self.transport.local_peer());

        let mut sent = 0;
        for peer in remote_peers {
            match self.transport.send_datagram(&peer, &encoded) {
                Ok(()) => {
                    sent += 1;
                    let mut inner = self.inner.lock().expect("bus lock poisoned");
                    inner.slow_peers.remove(&peer);
                }
                Err(TransportError::Backpressure) => self.note_slow_peer(peer),
                Err(e) => {
                    debug!(peer = %peer, error = %e, "announcement send failed");
                }
            }
        }
        Ok(sent)
    }

    /// Admits one announcement received on the gossip lane.
    pub fn handle_remote(&self, from: PeerId, raw: &[u8], now: Instant) -> BusAdmission {
        bump(&self.metrics.announcements_received);
        let Ok(announcement) = Announcement::decode(raw) else {
            bump(&self.metrics.announcements_invalid);
            return BusAdmission::Malformed;
        };
        // Signature first: nothing else is trusted before it verifies.
        if !announcement.verify() {
            bump(&self.metrics.announcements_invalid);
            self.registry.note_event(
                &from,
                PeerOp::Announce,
                crate::trust::OpOutcome::Denied,
                now,
            );
            return BusAdmission::InvalidSignature;
        }
        if self
            .registry
            .schema_disabled(&from, &announcement.schema_id)
        {
            self.registry.note_event(
                &from,
                PeerOp::Announce,
                crate::trust::OpOutcome::Denied,
                now,
            );
            return BusAdmission::SchemaDisabled;
        }
        if !self.registry.admit(&from, PeerOp::Announce, now).is_allowed() {
            bump(&self.metrics.announce_rate_dropped);
            return BusAdmission::Denied;
        }

        let (duplicate, local_targets) = {
            let mut inner = self.inner.lock().expect("bus lock poisoned");
            let duplicate = self.check_and_mark_seen(&mut inner, &announcement.cid, now);
            let local_targets = inner
                .topics
                .get(&announcement.schema_id)
                .map(|topic| topic.local.clone())
                .unwrap_or_default();
            (duplicate, local_targets)
        };
        if duplicate {
            bump(&self.metrics.announcements_deduped);
            return BusAdmission::Duplicate(announcement);
        }

        self.deliver_local(&local_targets, &announcement, from);
        BusAdmission::Admitted(announcement)
    }

    fn deliver_local(
        &self,
        targets: &[SyncSender<(Announcement, PeerId)>],
        announcement: &Announcement,
        from: PeerId,
    ) {
        for target in targets {
            match target.try_send((announcement.clone(), from)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // A stalled local subscriber loses announcements rather
                    // than stalling the bus.
                    bump(&self.metrics.slow_peer_dropped);
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    fn note_slow_peer(&self, peer: PeerId) {
        bump(&self.metrics.slow_peer_dropped);
        let drops = {
            let mut inner = self.inner.lock().expect("bus lock poisoned");
            let drops = inner.slow_peers.entry(peer).or_insert(0);
            *drops += 1;
            *drops
        };
        if drops >= self.slow_peer_threshold {
            warn!(peer = %peer, drops, "peer stayed slow, disconnecting");
            self.transport.drop_peer(&peer);
            self.remove_peer(&peer);
        }
    }
}

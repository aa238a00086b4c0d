use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use sdx_core::time::unix_time_millis;

/// How many occurrences per error kind the log keeps.
const ERROR_LOG_DEPTH: usize = 32;

/// Error taxonomy used for counters and the admin-facing error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport reset, timeout, backpressure; handled locally.
    Transient,
    /// Malformed frame, unknown opcode, oversize field.
    Protocol,
    /// Trust denial, rate limit, disabled schema; not an error log entry.
    Policy,
    /// CID mismatch, validation failure, corrupt store.
    Data,
    /// Unrecoverable; propagates to the process root.
    Fatal,
}

/// One recorded error occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub at_millis: i64,
    pub detail: String,
}

/// Counters maintained by the engine. All increments are lock-free.
#[derive(Debug, Default)]
pub struct NodeMetrics {
    pub announcements_received: AtomicU64,
    pub announcements_invalid: AtomicU64,
    pub announcements_deduped: AtomicU64,
    pub announce_rate_dropped: AtomicU64,
    pub slow_peer_dropped: AtomicU64,
    pub tips_enqueued: AtomicU64,
    pub tips_evicted: AtomicU64,
    pub tips_discarded: AtomicU64,
    pub fetch_ok: AtomicU64,
    pub fetch_failed: AtomicU64,
    pub fetch_deadline_exceeded: AtomicU64,
    pub fetch_inflight_collapsed: AtomicU64,
    pub cid_mismatch: AtomicU64,
    pub push_accepted: AtomicU64,
    pub push_rejected: AtomicU64,
    pub queries_served: AtomicU64,
    pub requests_served: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub trust_denials: AtomicU64,
    pub records_delivered: AtomicU64,
    pub sessions_closed: AtomicU64,
    errors: Mutex<HashMap<ErrorKind, VecDeque<ErrorEvent>>>,
}

/// Plain snapshot of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub announcements_received: u64,
    pub announcements_invalid: u64,
    pub announcements_deduped: u64,
    pub announce_rate_dropped: u64,
    pub slow_peer_dropped: u64,
    pub tips_enqueued: u64,
    pub tips_evicted: u64,
    pub tips_discarded: u64,
    pub fetch_ok: u64,
    pub fetch_failed: u64,
    pub fetch_deadline_exceeded: u64,
    pub fetch_inflight_collapsed: u64,
    pub cid_mismatch: u64,
    pub push_accepted: u64,
    pub push_rejected: u64,
    pub queries_served: u64,
    pub requests_served: u64,
    pub protocol_errors: u64,
    pub trust_denials: u64,
    pub records_delivered: u64,
    pub sessions_closed: u64,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a non-transient error occurrence for the admin surface.
    pub fn record_error(&self, kind: ErrorKind, detail: impl Into<String>) {
        let mut errors = self.errors.lock().expect("error log lock poisoned");
        let log = errors.entry(kind).or_default();
        if log.len() == ERROR_LOG_DEPTH {
            log.pop_front();
        }
        log.push_back(ErrorEvent {
            at_millis: unix_time_millis(),
            detail: detail.into(),
        });
    }

    /// The most recent occurrences of one error kind, oldest first.
    pub fn recent_errors(&self, kind: ErrorKind) -> Vec<ErrorEvent> {
        let errors = self.errors.lock().expect("error log lock poisoned");
        errors
            .get(&kind)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            announcements_received: self.announcements_received.load(Ordering::Relaxed),
            announcements_invalid: self.announcements_invalid.load(Ordering::Relaxed),
            announcements_deduped: self.announcements_deduped.load(Ordering::Relaxed),
            announce_rate_dropped: self.announce_rate_dropped.load(Ordering::Relaxed),
            slow_peer_dropped: self.slow_peer_dropped.load(Ordering::Relaxed),
            tips_enqueued: self.tips_enqueued.load(Ordering::Relaxed),
            tips_evicted: self.tips_evicted.load(Ordering::Relaxed),
            tips_discarded: self.tips_discarded.load(Ordering::Relaxed),
            fetch_ok: self.fetch_ok.load(Ordering::Relaxed),
            fetch_failed: self.fetch_failed.load(Ordering::Relaxed),
            fetch_deadline_exceeded: self.fetch_deadline_exceeded.load(Ordering::Relaxed),
            fetch_inflight_collapsed: self.fetch_inflight_collapsed.load(Ordering::Relaxed),
            cid_mismatch: self.cid_mismatch.load(Ordering::Relaxed),
            push_accepted: self.push_accepted.load(Ordering::Relaxed),
            push_rejected: self.push_rejected.load(Ordering::Relaxed),
            queries_served: self.queries_served.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            trust_denials: self.trust_denials.load(Ordering::Relaxed),
            records_delivered: self.records_delivered.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
        }
    }
}

/// Shorthand for relaxed counter bumps.
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

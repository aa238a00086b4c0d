use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use sdx_core::{PeerId, SchemaId};

use crate::policy::EffectivePolicy;
use crate::trust::TrustLevel;

/// Transient scheduling record for one admitted announcement.
///
/// Lives only inside the queue and the fetch workers; never persisted.
#[derive(Debug, Clone)]
pub struct Tip {
    pub cid: String,
    pub schema: SchemaId,
    pub announcer: PeerId,
    /// Other peers that announced the same CID; tried in order after the
    /// primary announcer fails.
    pub alternates: Vec<PeerId>,
    pub priority: u8,
    pub received_at: Instant,
    pub announced_at_millis: i64,
    pub policy: EffectivePolicy,
    /// Requeue budget already spent on rate-limit deferrals.
    pub requeues: u32,
}

/// Derives the queue priority for a tip, clamped to `0..=255` by the u8
/// arithmetic: `base(trust) + pin bonus + schema bonus`.
pub fn derive_priority(
    level: TrustLevel,
    policy: &EffectivePolicy,
    schema_bonus: u8,
    pin_bonus: u8,
) -> u8 {
    let base: u8 = match level {
        TrustLevel::Admin => 240,
        TrustLevel::Trusted => 200,
        TrustLevel::Standard => 128,
        TrustLevel::Limited => 64,
        TrustLevel::Untrusted => 0,
    };
    let policy_bonus = if policy.auto_pin { pin_bonus } else { 0 };
    base.saturating_add(policy_bonus).saturating_add(schema_bonus)
}

/// Result of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The queue was full; the lowest-priority resident tip was evicted.
    EvictedLowest,
    /// The queue was full and the new tip ranked below everything resident.
    Discarded,
    Closed,
}

struct Entry {
    seq: u64,
    tip: Tip,
}

impl Entry {
    // Best-first ordering key: highest priority, then earliest receipt,
    // then arrival sequence.
    fn key(&self) -> (u8, Instant, u64) {
        (255 - self.tip.priority, self.tip.received_at, self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key().cmp(&other.key())
    }
}

struct QueueState {
    entries: BTreeSet<Entry>,
    next_seq: u64,
    closed: bool,
    evicted: u64,
    discarded: u64,
}

/// Bounded priority queue of announcement tips.
///
/// `dequeue` blocks until an item is available or the queue closes; order
/// is strictly descending priority with ties broken by earliest receipt.
pub struct TipQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl TipQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: BTreeSet::new(),
                next_seq: 0,
                closed: false,
                evicted: 0,
                discarded: 0,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn enqueue(&self, tip: Tip) -> EnqueueOutcome {
        let mut state = self.state.lock().expect("tip queue lock poisoned");
        if state.closed {
            return EnqueueOutcome::Closed;
        }
        let mut outcome = EnqueueOutcome::Queued;
        if state.entries.len() >= self.capacity {
            let lowest_priority = state
                .entries
                .iter()
                .next_back()
                .map(|entry| entry.tip.priority)
                .unwrap_or(0);
            if tip.priority <= lowest_priority {
                state.discarded += 1;
                return EnqueueOutcome::Discarded;
            }
            state.entries.pop_last();
            state.evicted += 1;
            outcome = EnqueueOutcome::EvictedLowest;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(Entry { seq, tip });
        self.available.notify_one();
        outcome
    }

    /// Blocks until a tip is available; `None` once closed and drained.
    pub fn dequeue(&self) -> Option<Tip> {
        let mut state = self.state.lock().expect("tip queue lock poisoned");
        loop {
            if let Some(entry) = state.entries.pop_first() {
                return Some(entry.tip);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .expect("tip queue lock poisoned");
        }
    }

    /// Non-blocking variant used by tests.
    pub fn try_dequeue(&self) -> Option<Tip> {
        let mut state = self.state.lock().expect("tip queue lock poisoned");
        state.entries.pop_first().map(|entry| entry.tip)
    }

    /// Closes the queue; blocked consumers drain the remainder, then stop.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("tip queue lock poisoned");
        state.closed = true;
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("tip queue lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.state.lock().expect("tip queue lock poisoned").evicted
    }

    pub fn discarded(&self) -> u64 {
        self.state.lock().expect("tip queue lock poisoned").discarded
    }
}

#[cfg(test)]
mod tests {
    use super::{derive_priority, EnqueueOutcome, Tip, TipQueue};
    use crate::policy::EffectivePolicy;
    use crate::trust::TrustLevel;
    use sdx_core::{PeerId, SchemaId};
    use std::time::{Duration, Instant};

    fn tip(cid: &str, priority: u8, received_at: Instant) -> Tip {
        Tip {
            cid: cid.to_string(),
            schema: SchemaId::from("OMM"),
            announcer: PeerId([1; 32]),
            alternates: Vec::new(),
            priority,
            received_at,
            announced_at_millis: 0,
            policy: EffectivePolicy::default(),
            requeues: 0,
        }
    }

    #[test]
    fn dequeue_is_priority_ordered_with_fifo_ties() {
        let queue = TipQueue::new(16);
        let start = Instant::now();
        queue.enqueue(tip("low", 10, start));
        queue.enqueue(tip("high", 200, start + Duration::from_millis(5)));
        queue.enqueue(tip("tie-late", 100, start + Duration::from_millis(2)));
        queue.enqueue(tip("tie-early", 100, start + Duration::from_millis(1)));

        let order: Vec<String> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|t| t.cid)
            .collect();
        assert_eq!(order, vec!["high", "tie-early", "tie-late", "low"]);
    }

    #[test]
    fn full_queue_evicts_lowest_priority() {
        let queue = TipQueue::new(2);
        let start = Instant::now();
        queue.enqueue(tip("a", 10, start));
        queue.enqueue(tip("b", 20, start));
        assert_eq!(
            queue.enqueue(tip("c", 30, start)),
            EnqueueOutcome::EvictedLowest
        );
        assert_eq!(queue.evicted(), 1);
        let order: Vec<String> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|t| t.cid)
            .collect();
        assert_eq!(order, vec!["c", "b"]);
    }

    #[test]
    fn full_queue_discards_strictly_lower_new_tip() {
        let queue = TipQueue::new(2);
        let start = Instant::now();
        queue.enqueue(tip("a", 50, start));
        queue.enqueue(tip("b", 60, start));
        assert_eq!(queue.enqueue(tip("c", 40, start)), EnqueueOutcome::Discarded);
        assert_eq!(queue.discarded(), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn close_unblocks_consumers() {
        let queue = std::sync::Arc::new(TipQueue::new(4));
        let consumer = {
            let queue = std::sync::Arc::clone(&queue);
            std::thread::spawn(move || queue.dequeue())
        };
        std::thread::sleep(Duration::from_millis(50));
        queue.close();
        assert!(consumer.join().expect("consumer should finish").is_none());
    }

    #[test]
    fn closed_queue_rejects_new_tips_but_drains() {
        let queue = TipQueue::new(4);
        queue.enqueue(tip("a", 10, Instant::now()));
        queue.close();
        assert_eq!(
            queue.enqueue(tip("b", 20, Instant::now())),
            EnqueueOutcome::Closed
        );
        assert_eq!(queue.dequeue().map(|t| t.cid), Some("a".to_string()));
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn priority_derivation_uses_base_and_bonuses() {
        let pinned = EffectivePolicy {
            auto_pin: true,
            ..EffectivePolicy::default()
        };
        let unpinned = EffectivePolicy::default();
        assert_eq!(derive_priority(TrustLevel::Standard, &unpinned, 0, 16), 128);
        assert_eq!(derive_priority(TrustLevel::Standard, &pinned, 4, 16), 148);
        assert_eq!(derive_priority(TrustLevel::Admin, &pinned, 200, 16), 255);
        assert_eq!(derive_priority(TrustLevel::Limited, &unpinned, 0, 16), 64);
        assert_eq!(derive_priority(TrustLevel::Trusted, &unpinned, 0, 16), 200);
    }
}

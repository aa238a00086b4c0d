use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use sdx_core::time::unix_time_millis;
use sdx_core::{PeerId, SchemaId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics::{bump, NodeMetrics};

/// Peer trust levels, weakest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Untrusted,
    Limited,
    Standard,
    Trusted,
    Admin,
}

impl TrustLevel {
    /// The next level down, used for abuse demotion.
    fn demoted(self) -> TrustLevel {
        match self {
            TrustLevel::Admin => TrustLevel::Admin,
            TrustLevel::Trusted => TrustLevel::Standard,
            TrustLevel::Standard => TrustLevel::Limited,
            TrustLevel::Limited | TrustLevel::Untrusted => TrustLevel::Untrusted,
        }
    }
}

/// Gated operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerOp {
    Announce,
    Fetch,
    Push,
    Query,
    Stream,
}

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Permitted without a cap (Admin only).
    Allow,
    /// Permitted; at most `n` operations remain in the current bucket.
    AllowWithCap(u32),
    /// Permitted in principle but the bucket is empty right now.
    RateLimited,
    /// The operation is not available at this trust level.
    Deny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow | Decision::AllowWithCap(_))
    }
}

/// Outcome reported back to the gate after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    Ok,
    Denied,
}

/// Per-level token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateSpec {
    pub ops_per_sec: f64,
    pub burst: f64,
}

/// Refill/burst table keyed by trust level. Admin is uncapped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrustRates {
    pub limited: RateSpec,
    pub standard: RateSpec,
    pub trusted: RateSpec,
}

impl Default for TrustRates {
    fn default() -> Self {
        Self {
            limited: RateSpec {
                ops_per_sec: 1.0,
                burst: 2.0,
            },
            standard: RateSpec {
                ops_per_sec: 10.0,
                burst: 20.0,
            },
            trusted: RateSpec {
                ops_per_sec: 100.0,
                burst: 200.0,
            },
        }
    }
}

impl TrustRates {
    fn for_level(&self, level: TrustLevel) -> Option<RateSpec> {
        match level {
            TrustLevel::Untrusted => None,
            TrustLevel::Limited => Some(self.limited),
            TrustLevel::Standard => Some(self.standard),
            TrustLevel::Trusted => Some(self.trusted),
            TrustLevel::Admin => None,
        }
    }
}

/// True when `level` may perform `op` at all, caps aside.
fn op_permitted(level: TrustLevel, op: PeerOp) -> bool {
    match level {
        TrustLevel::Untrusted => false,
        TrustLevel::Limited => !matches!(op, PeerOp::Push),
        // Standard and above may push.
        TrustLevel::Standard | TrustLevel::Trusted | TrustLevel::Admin => true,
    }
}

/// Lazily refilled token bucket; no background thread.
#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(spec: RateSpec, now: Instant) -> Self {
        Self {
            tokens: spec.burst,
            last_refill: now,
        }
    }

    fn available(&self, spec: RateSpec, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * spec.ops_per_sec).min(spec.burst)
    }

    fn consume(&mut self, spec: RateSpec, now: Instant) -> bool {
        let available = self.available(spec, now);
        self.last_refill = now;
        if available >= 1.0 {
            self.tokens = available - 1.0;
            true
        } else {
            self.tokens = available;
            false
        }
    }
}

/// Per-schema gate overrides carried on a peer record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaOverride {
    pub schema: SchemaId,
    /// When set, announcements/pushes for this schema are refused outright.
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug)]
struct PeerState {
    level: TrustLevel,
    last_seen: i64,
    buckets: HashMap<PeerOp, TokenBucket>,
    denials: VecDeque<Instant>,
    demoted_until: Option<Instant>,
    abuse_count: u64,
    schema_overrides: Vec<SchemaOverride>,
}

impl PeerState {
    fn new(level: TrustLevel) -> Self {
        Self {
            level,
            last_seen: unix_time_millis(),
            buckets: HashMap::new(),
            denials: VecDeque::new(),
            demoted_until: None,
            abuse_count: 0,
            schema_overrides: Vec::new(),
        }
    }

    fn effective_level(&self, now: Instant) -> TrustLevel {
        match self.demoted_until {
            Some(until) if now < until => self.level.demoted(),
            _ => self.level,
        }
    }
}

/// Public view of a peer record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub trust_level: TrustLevel,
    pub last_seen: i64,
    pub abuse_count: u64,
    #[serde(default)]
    pub schema_overrides: Vec<SchemaOverride>,
}

/// Errors returned by registry persistence.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read peer registry: {0}")]
    Read(std::io::Error),
    #[error("failed to write peer registry: {0}")]
    Write(std::io::Error),
    #[error("failed to decode peer registry: {0}")]
    Decode(serde_json::Error),
    #[error("failed to encode peer registry: {0}")]
    Encode(serde_json::Error),
}

/// Gate policy knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    pub rates: TrustRates,
    pub default_level: TrustLevel,
    /// Denials inside this sliding window count toward demotion.
    #[serde(with = "humantime_serde")]
    pub abuse_window: Duration,
    pub abuse_threshold: u32,
    /// How long a demotion lasts.
    #[serde(with = "humantime_serde")]
    pub cool_off: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            rates: TrustRates::default(),
            default_level: TrustLevel::Limited,
            abuse_window: Duration::from_secs(60),
            abuse_threshold: 3,
            cool_off: Duration::from_secs(60),
        }
    }
}

/// Per-peer trust levels and token-bucket rate limits.
///
/// Evaluations are pure reads of in-memory state; consumption happens in
/// `note_event`. The registry lock is never held across I/O.
pub struct PeerRegistry {
    inner: RwLock<HashMap<PeerId, PeerState>>,
    config: GateConfig,
    metrics: Arc<NodeMetrics>,
}

impl PeerRegistry {
    pub fn new(config: GateConfig, metrics: Arc<NodeMetrics>) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            config,
            metrics,
        }
    }

    /// Pure gate decision for `(peer, op)` at `now`; consumes nothing.
    pub fn evaluate(&self, peer: &PeerId, op: PeerOp, now: Instant) -> Decision {
        let inner = self.inner.read().expect("registry lock poisoned");
        let (level, bucket) = match inner.get(peer) {
            Some(state) => (
                state.effective_level(now),
                state.buckets.get(&op).copied(),
            ),
            None => (self.config.default_level, None),
        };
        drop(inner);

        if !op_permitted(level, op) {
            return Decision::Deny;
        }
        let Some(spec) = self.config.rates.for_level(level) else {
            // Admin is uncapped; Untrusted was rejected above.
            return Decision::Allow;
        };
        let available = bucket
            .map(|b| b.available(spec, now))
            .unwrap_or(spec.burst);
        if available >= 1.0 {
            Decision::AllowWithCap(available as u32)
        } else {
            Decision::RateLimited
        }
    }

    /// Records an operation outcome: consumes a token on `Ok`, counts abuse
    /// on `Denied` and demotes repeat offenders for the cool-off.
    pub fn note_event(&self, peer: &PeerId, op: PeerOp, outcome: OpOutcome, now: Instant) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let default_level = self.config.default_level;
        let state = inner
            .entry(*peer)
            .or_insert_with(|| PeerState::new(default_level));
        state.last_seen = unix_time_millis();
        match outcome {
            OpOutcome::Ok => {
                let level = state.effective_level(now);
                if let Some(spec) = self.config.rates.for_level(level) {
                    let bucket = state
                        .buckets
                        .entry(op)
                        .or_insert_with(|| TokenBucket::full(spec, now));
                    bucket.consume(spec, now);
                }
            }
            OpOutcome::Denied => {
                bump(&self.metrics.trust_denials);
                state.abuse_count += 1;
                state.denials.push_back(now);
                let window = self.config.abuse_window;
                while let Some(oldest) = state.denials.front() {
                    if now.saturating_duration_since(*oldest) > window {
                        state.denials.pop_front();
                    } else {
                        break;
                    }
                }
                if state.denials.len() as u32 >= self.config.abuse_threshold
                    && state.level != TrustLevel::Admin
                {
                    state.demoted_until = Some(now + self.config.cool_off);
                    state.denials.clear();
                    warn!(
                        peer = %peer,
                        level = ?state.level,
                        demoted_to = ?state.level.demoted(),
                        "peer demoted for repeated denials"
                    );
                }
            }
        }
    }

    /// Gate-and-consume in one step: evaluates, then records the outcome.
    pub fn admit(&self, peer: &PeerId, op: PeerOp, now: Instant) -> Decision {
        let decision = self.evaluate(peer, op, now);
        let outcome = if decision.is_allowed() {
            OpOutcome::Ok
        } else {
            OpOutcome::Denied
        };
        self.note_event(peer, op, outcome, now);
        decision
    }

    /// The configured (not demotion-adjusted) trust level for a peer.
    pub fn trust_level(&self, peer: &PeerId) -> TrustLevel {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .get(peer)
            .map(|s| s.level)
            .unwrap_or(self.config.default_level)
    }

    /// The demotion-adjusted level used for priority derivation.
    pub fn effective_level(&self, peer: &PeerId, now: Instant) -> TrustLevel {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .get(peer)
            .map(|s| s.effective_level(now))
            .unwrap_or(self.config.default_level)
    }

    pub fn set_trust(&self, peer: PeerId, level: TrustLevel) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let state = inner
            .entry(peer)
            .or_insert_with(|| PeerState::new(level));
        state.level = level;
        state.demoted_until = None;
        state.buckets.clear();
        debug!(peer = %peer, level = ?level, "trust level set");
    }

    pub fn set_schema_overrides(&self, peer: PeerId, overrides: Vec<SchemaOverride>) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let default_level = self.config.default_level;
        let state = inner
            .entry(peer)
            .or_insert_with(|| PeerState::new(default_level));
        state.schema_overrides = overrides;
    }

    /// True when the peer has disabled the given schema via an override.
    pub fn schema_disabled(&self, peer: &PeerId, schema: &SchemaId) -> bool {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .get(peer)
            .map(|s| {
                s.schema_overrides
                    .iter()
                    .any(|o| o.disabled && o.schema == *schema)
            })
            .unwrap_or(false)
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerRecord> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.get(peer).map(|state| PeerRecord {
            peer_id: *peer,
            trust_level: state.level,
            last_seen: state.last_seen,
            abuse_count: state.abuse_count,
            schema_overrides: state.schema_overrides.clone(),
        })
    }

    pub fn list(&self) -> Vec<PeerRecord> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut records: Vec<PeerRecord> = inner
            .iter()
            .map(|(peer, state)| PeerRecord {
                peer_id: *peer,
                trust_level: state.level,
                last_seen: state.last_seen,
                abuse_count: state.abuse_count,
                schema_overrides: state.schema_overrides.clone(),
            })
            .collect();
        records.sort_by_key(|r| r.peer_id);
        records
    }

    /// Persists the registry as JSON, atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RegistryError> {
        let records = self.list();
        let encoded =
            serde_json::to_vec_pretty(&records).map_err(RegistryError::Encode)?;
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, encoded).map_err(RegistryError::Write)?;
        fs::rename(&tmp, path).map_err(RegistryError::Write)
    }

    /// Loads persisted peer records into the registry, replacing its state.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<usize, RegistryError> {
        let raw = fs::read(path.as_ref()).map_err(RegistryError::Read)?;
        let records: Vec<PeerRecord> =
            serde_json::from_slice(&raw).map_err(RegistryError::Decode)?;
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.clear();
        let count = records.len();
        for record in records {
            let mut state = PeerState::new(record.trust_level);
            state.last_seen = record.last_seen;
            state.abuse_count = record.abuse_count;
            state.schema_overrides = record.schema_overrides;
            inner.insert(record.peer_id, state);
        }
        Ok(count)
    }

    /// Loads the registry when the file exists; a missing file is empty.
    pub fn load_if_present(&self, path: impl AsRef<Path>) -> Result<usize, RegistryError> {
        if !path.as_ref().exists() {
            return Ok(0);
        }
        self.load(path)
    }
}

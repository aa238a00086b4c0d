use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use sdx_core::{PeerId, SchemaId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default payload cap applied when no policy entry overrides it.
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 10 * 1024 * 1024;
/// Default record TTL applied when no policy entry overrides it.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Policy scope, most specific first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum PolicyScope {
    PeerAndSchema { peer: PeerId, schema: SchemaId },
    Peer { peer: PeerId },
    Schema { schema: SchemaId },
    System,
}

/// One stored policy entry; unset fields fall through to wider scopes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_fetch: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_pin: Option<bool>,
    #[serde(default, with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload_bytes: Option<u64>,
}

/// Fully resolved handling policy for one announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectivePolicy {
    pub auto_fetch: bool,
    pub auto_pin: bool,
    pub ttl: Duration,
    pub max_payload_bytes: u64,
}

impl Default for EffectivePolicy {
    fn default() -> Self {
        Self {
            auto_fetch: true,
            auto_pin: false,
            ttl: DEFAULT_TTL,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    #[serde(flatten)]
    scope: PolicyScope,
    #[serde(flatten)]
    entry: PolicyEntry,
}

/// Errors returned by policy persistence.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy table: {0}")]
    Read(std::io::Error),
    #[error("failed to write policy table: {0}")]
    Write(std::io::Error),
    #[error("failed to decode policy table: {0}")]
    Decode(serde_json::Error),
    #[error("failed to encode policy table: {0}")]
    Encode(serde_json::Error),
}

/// Lookup table resolving per-announcement handling policy through the
/// four-tier override hierarchy.
///
/// Resolution is strictly `PeerAndSchema > Peer > Schema > System`, first
/// hit per field; the system entry is always present.
pub struct PolicyTable {
    entries: RwLock<HashMap<PolicyScope, PolicyEntry>>,
    system_default: EffectivePolicy,
}

impl PolicyTable {
    pub fn new(system_default: EffectivePolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            system_default,
        }
    }

    /// Sets (or replaces) the entry for one scope.
    pub fn set(&self, scope: PolicyScope, entry: PolicyEntry) {
        debug!(?scope, "policy entry set");
        let mut entries = self.entries.write().expect("policy lock poisoned");
        entries.insert(scope, entry);
    }

    /// Removes the entry for one scope; the system default is not removable.
    pub fn remove(&self, scope: &PolicyScope) -> bool {
        let mut entries = self.entries.write().expect("policy lock poisoned");
        entries.remove(scope).is_some()
    }

    pub fn list(&self) -> Vec<(PolicyScope, PolicyEntry)> {
        let entries = self.entries.read().expect("policy lock poisoned");
        let mut out: Vec<(PolicyScope, PolicyEntry)> = entries
            .iter()
            .map(|(scope, entry)| (scope.clone(), entry.clone()))
            .collect();
        out.sort_by_key(|(scope, _)| format!("{scope:?}"));
        out
    }

    /// Resolves the effective policy for `(announcer, schema)`.
    pub fn resolve(&self, announcer: &PeerId, schema: &SchemaId) -> EffectivePolicy {
        let entries = self.entries.read().expect("policy lock poisoned");
        let chain = [
            entries.get(&PolicyScope::PeerAndSchema {
                peer: *announcer,
                schema: schema.clone(),
            }),
            entries.get(&PolicyScope::Peer { peer: *announcer }),
            entries.get(&PolicyScope::Schema {
                schema: schema.clone(),
            }),
            entries.get(&PolicyScope::System),
        ];

        let mut resolved = self.system_default;
        resolved.auto_fetch = first_field(&chain, |e| e.auto_fetch)
            .unwrap_or(self.system_default.auto_fetch);
        resolved.auto_pin =
            first_field(&chain, |e| e.auto_pin).unwrap_or(self.system_default.auto_pin);
        resolved.ttl = first_field(&chain, |e| e.ttl).unwrap_or(self.system_default.ttl);
        resolved.max_payload_bytes = first_field(&chain, |e| e.max_payload_bytes)
            .unwrap_or(self.system_default.max_payload_bytes);
        resolved
    }

    /// Persists the table as JSON, atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PolicyError> {
        let persisted: Vec<PersistedEntry> = self
            .list()
            .into_iter()
            .map(|(scope, entry)| PersistedEntry { scope, entry })
            .collect();
        let encoded = serde_json::to_vec_pretty(&persisted).map_err(PolicyError::Encode)?;
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, encoded).map_err(PolicyError::Write)?;
        fs::rename(&tmp, path).map_err(PolicyError::Write)
    }

    /// Loads entries from JSON, replacing the in-memory table.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<usize, PolicyError> {
        let raw = fs::read(path.as_ref()).map_err(PolicyError::Read)?;
        let persisted: Vec<PersistedEntry> =
            serde_json::from_slice(&raw).map_err(PolicyError::Decode)?;
        let mut entries = self.entries.write().expect("policy lock poisoned");
        entries.clear();
        let count = persisted.len();
        for item in persisted {
            entries.insert(item.scope, item.entry);
        }
        Ok(count)
    }

    pub fn load_if_present(&self, path: impl AsRef<Path>) -> Result<usize, PolicyError> {
        if !path.as_ref().exists() {
            return Ok(0);
        }
        self.load(path)
    }
}

fn first_field<T, F>(chain: &[Option<&PolicyEntry>; 4], pick: F) -> Option<T>
where
    F: Fn(&PolicyEntry) -> Option<T>,
{
    chain.iter().flatten().find_map(|entry| pick(entry))
}

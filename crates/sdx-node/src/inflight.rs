use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use sdx_core::SchemaId;

/// Concurrent set collapsing simultaneous fetches of one CID.
///
/// Check-and-insert is a single atomic step under the mutex; the critical
/// section is set membership plus insert, nothing else. Never hold the
/// guard across a store write or any I/O.
#[derive(Debug, Default)]
pub struct InFlightSet {
    inner: Mutex<HashSet<(SchemaId, String)>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claims `(schema, cid)`; `None` when already in flight.
    pub fn try_claim(
        self: &Arc<Self>,
        schema: SchemaId,
        cid: String,
    ) -> Option<InFlightGuard> {
        let mut inner = self.inner.lock().expect("in-flight lock poisoned");
        if !inner.insert((schema.clone(), cid.clone())) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(self),
            key: Some((schema, cid)),
        })
    }

    pub fn contains(&self, schema: &SchemaId, cid: &str) -> bool {
        let inner = self.inner.lock().expect("in-flight lock poisoned");
        inner.contains(&(schema.clone(), cid.to_string()))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("in-flight lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &(SchemaId, String)) {
        let mut inner = self.inner.lock().expect("in-flight lock poisoned");
        inner.remove(key);
    }
}

/// RAII claim on an in-flight CID; releases on drop, however the fetch
/// terminates.
#[derive(Debug)]
pub struct InFlightGuard {
    set: Arc<InFlightSet>,
    key: Option<(SchemaId, String)>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.set.release(&key);
        }
    }
}

//! Content-addressed local persistence for SDX records.
//!
//! One logical table per schema, keyed by CID, with a separate observation
//! index for time-windowed per-peer replays. All writes are transactional;
//! a corruption detection flips the store into read-only degraded mode.

pub mod error;
pub mod store;

pub use error::StoreError;
pub use store::{
    Observation, PutOutcome, PutRecord, Store, StoreOptions, StoreQuery, StoreStats, StoredRecord,
};

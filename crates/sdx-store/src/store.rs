use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use sdx_core::cid::{cid_matches, cid_string};
use sdx_core::schema::SchemaValidator;
use sdx_core::{PeerId, SchemaId};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::StoreError;

/// On-disk schema version; a mismatch at startup aborts.
pub const SCHEMA_VERSION: i64 = 1;

/// Default cap on result rows per query.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Store construction options.
pub struct StoreOptions {
    /// Optional quota on the sum of stored record bytes.
    pub max_total_bytes: Option<u64>,
    /// Optional validator consulted on every `put`.
    pub validator: Option<Arc<dyn SchemaValidator>>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_total_bytes: None,
            validator: None,
        }
    }
}

/// One write request.
pub struct PutRecord<'a> {
    pub schema: SchemaId,
    pub bytes: &'a [u8],
    pub publisher: PeerId,
    pub signature: Option<Vec<u8>>,
    pub received_at: i64,
    pub ttl_expires_at: Option<i64>,
}

/// Result of a `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub cid: String,
    /// False when the CID was already present and only an observation row
    /// was recorded.
    pub inserted: bool,
}

/// One stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub cid: String,
    pub schema_id: SchemaId,
    pub publisher: PeerId,
    pub received_at: i64,
    pub bytes: Vec<u8>,
    pub signature: Option<Vec<u8>>,
    pub ttl_expires_at: Option<i64>,
}

/// One `(publisher, received_at)` observation of a CID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub publisher: PeerId,
    pub received_at: i64,
}

/// Time-windowed index query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreQuery {
    #[serde(default)]
    pub publisher: Option<PeerId>,
    #[serde(default)]
    pub since: Option<i64>,
    #[serde(default)]
    pub until: Option<i64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Aggregate store counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub records: u64,
    pub total_bytes: u64,
}

/// Content-addressed SQLite-backed record store.
pub struct Store {
    conn: Mutex<Connection>,
    read_only: AtomicBool,
    max_total_bytes: Option<u64>,
    validator: Option<Arc<dyn SchemaValidator>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("read_only", &self.read_only.load(Ordering::Relaxed))
            .field("max_total_bytes", &self.max_total_bytes)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl Store {
    /// Opens (and if necessary initializes) the store at `path`.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        Self::with_connection(conn, options)
    }

    /// Opens an in-memory store; used by tests and simulations.
    pub fn open_in_memory(options: StoreOptions) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, options)
    }

    fn with_connection(conn: Connection, options: StoreOptions) -> Result<Self, StoreError> {
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => init_schema(&conn)?,
            SCHEMA_VERSION => {}
            found => {
                return Err(StoreError::Migration {
                    found,
                    expected: SCHEMA_VERSION,
                })
            }
        }
        Ok(Self {
            conn: Mutex::new(conn),
            read_only: AtomicBool::new(false),
            max_total_bytes: options.max_total_bytes,
            validator: options.validator,
        })
    }

    /// True once corruption has been detected and writes are refused.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    fn degrade(&self, detail: &str) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            error!(detail, "store corruption detected, degrading to read-only");
        }
    }

    /// Inserts a record, or records another observation of an existing CID.
    pub fn put(&self, record: PutRecord<'_>) -> Result<PutOutcome, StoreError> {
        if self.is_read_only() {
            return Err(StoreError::ReadOnly);
        }
        if let Some(validator) = &self.validator {
            if validator.validate(&record.schema, record.bytes).is_err() {
                return Err(StoreError::SchemaRejected);
            }
        }
        let cid = cid_string(record.bytes);

        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        let existing: Option<Vec<u8>> = tx
            .query_row(
                "SELECT bytes FROM records WHERE schema_id = ?1 AND cid = ?2",
                params![record.schema.as_str(), cid],
                |row| row.get(0),
            )
            .optional()?;

        let inserted = match existing {
            Some(stored) => {
                if stored != record.bytes {
                    // Unreachable under the hash assumption.
                    drop(tx);
                    drop(conn);
                    self.degrade("cid collision with differing bytes");
                    return Err(StoreError::Corrupt(format!(
                        "cid collision with differing bytes for {cid}"
                    )));
                }
                tx.execute(
                    "UPDATE records SET received_at = ?1,
                        ttl_expires_at = CASE
                            WHEN ttl_expires_at IS NULL OR ?2 IS NULL THEN NULL
                            ELSE MAX(ttl_expires_at, ?2)
                        END
                     WHERE schema_id = ?3 AND cid = ?4",
                    params![
                        record.received_at,
                        record.ttl_expires_at,
                        record.schema.as_str(),
                        cid
                    ],
                )?;
                false
            }
            None => {
                if let Some(quota) = self.max_total_bytes {
                    let used: i64 = tx.query_row(
                        "SELECT value FROM store_meta WHERE key = 'total_bytes'",
                        [],
                        |row| row.get(0),
                    )?;
                    if used as u64 + record.bytes.len() as u64 > quota {
                        return Err(StoreError::Full);
                    }
                }
                tx.execute(
                    "INSERT INTO records
                        (schema_id, cid, publisher, received_at, bytes, signature, ttl_expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        record.schema.as_str(),
                        cid,
                        record.publisher.as_bytes().as_slice(),
                        record.received_at,
                        record.bytes,
                        record.signature,
                        record.ttl_expires_at
                    ],
                )?;
                tx.execute(
                    "UPDATE store_meta SET value = value + ?1 WHERE key = 'total_bytes'",
                    params![record.bytes.len() as i64],
                )?;
                true
            }
        };

        tx.execute(
            "INSERT INTO observations (schema_id, publisher, received_at, cid)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.schema.as_str(),
                record.publisher.as_bytes().as_slice(),
                record.received_at,
                cid
            ],
        )?;
        tx.commit()?;
        Ok(PutOutcome { cid, inserted })
    }

    /// Returns the record bytes for `(schema, cid)`.
    pub fn get(&self, schema: &SchemaId, cid: &str) -> Result<Vec<u8>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT bytes FROM records WHERE schema_id = ?1 AND cid = ?2",
                params![schema.as_str(), cid],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);
        let bytes = bytes.ok_or(StoreError::NotFound)?;
        if !cid_matches(cid, &bytes) {
            self.degrade("stored bytes no longer match cid");
            return Err(StoreError::Corrupt(format!("bytes do not match {cid}")));
        }
        Ok(bytes)
    }

    pub fn has(&self, schema: &SchemaId, cid: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM records WHERE schema_id = ?1 AND cid = ?2",
                params![schema.as_str(), cid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Runs a time-windowed query; newest first, ties broken on `cid`.
    pub fn query(
        &self,
        schema: &SchemaId,
        query: &StoreQuery,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        let mut sql = String::from(
            "SELECT cid, schema_id, publisher, received_at, bytes, signature, ttl_expires_at
             FROM records WHERE schema_id = ?1",
        );
        let mut args: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(schema.as_str().to_string())];
        if let Some(publisher) = &query.publisher {
            args.push(rusqlite::types::Value::Blob(
                publisher.as_bytes().to_vec(),
            ));
            sql.push_str(&format!(" AND publisher = ?{}", args.len()));
        }
        if let Some(since) = query.since {
            args.push(rusqlite::types::Value::Integer(since));
            sql.push_str(&format!(" AND received_at >= ?{}", args.len()));
        }
        if let Some(until) = query.until {
            args.push(rusqlite::types::Value::Integer(until));
            sql.push_str(&format!(" AND received_at <= ?{}", args.len()));
        }
        args.push(rusqlite::types::Value::Integer(limit as i64));
        sql.push_str(&format!(
            " ORDER BY received_at DESC, cid ASC LIMIT ?{}",
            args.len()
        ));

        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Records one more `(publisher, received_at)` observation of an
    /// already-stored CID; false when the record is absent or that
    /// publisher is already on file for it.
    pub fn record_observation(
        &self,
        schema: &SchemaId,
        cid: &str,
        publisher: PeerId,
        received_at: i64,
    ) -> Result<bool, StoreError> {
        if self.is_read_only() {
            return Err(StoreError::ReadOnly);
        }
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM records WHERE schema_id = ?1 AND cid = ?2",
                params![schema.as_str(), cid],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(false);
        }
        let observed: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM observations
                 WHERE schema_id = ?1 AND cid = ?2 AND publisher = ?3",
                params![schema.as_str(), cid, publisher.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        if observed.is_some() {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO observations (schema_id, publisher, received_at, cid)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                schema.as_str(),
                publisher.as_bytes().as_slice(),
                received_at,
                cid
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// All observations recorded for `(schema, cid)`, oldest first.
    pub fn observations(
        &self,
        schema: &SchemaId,
        cid: &str,
    ) -> Result<Vec<Observation>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT publisher, received_at FROM observations
             WHERE schema_id = ?1 AND cid = ?2 ORDER BY received_at ASC",
        )?;
        let rows = stmt.query_map(params![schema.as_str(), cid], |row| {
            let publisher: Vec<u8> = row.get(0)?;
            let received_at: i64 = row.get(1)?;
            Ok((publisher, received_at))
        })?;
        let mut observations = Vec::new();
        for row in rows {
            let (publisher, received_at) = row?;
            let bytes: [u8; 32] = publisher
                .try_into()
                .map_err(|_| StoreError::Corrupt("observation publisher length".to_string()))?;
            observations.push(Observation {
                publisher: PeerId(bytes),
                received_at,
            });
        }
        Ok(observations)
    }

    /// Removes rows whose TTL expired before `now`; returns how many.
    pub fn prune(&self, now: i64) -> Result<usize, StoreError> {
        if self.is_read_only() {
            return Err(StoreError::ReadOnly);
        }
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        let reclaimed: i64 = tx.query_row(
            "SELECT COALESCE(SUM(LENGTH(bytes)), 0) FROM records
             WHERE ttl_expires_at IS NOT NULL AND ttl_expires_at < ?1",
            params![now],
            |row| row.get(0),
        )?;
        tx.execute(
            "DELETE FROM observations WHERE (schema_id, cid) IN (
                SELECT schema_id, cid FROM records
                WHERE ttl_expires_at IS NOT NULL AND ttl_expires_at < ?1)",
            params![now],
        )?;
        let deleted = tx.execute(
            "DELETE FROM records WHERE ttl_expires_at IS NOT NULL AND ttl_expires_at < ?1",
            params![now],
        )?;
        tx.execute(
            "UPDATE store_meta SET value = MAX(0, value - ?1) WHERE key = 'total_bytes'",
            params![reclaimed],
        )?;
        tx.commit()?;
        if deleted > 0 {
            warn!(deleted, "pruned expired records");
        }
        Ok(deleted)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let records: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        let total_bytes: i64 = conn.query_row(
            "SELECT value FROM store_meta WHERE key = 'total_bytes'",
            [],
            |row| row.get(0),
        )?;
        Ok(StoreStats {
            records: records as u64,
            total_bytes: total_bytes.max(0) as u64,
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRecord> {
    let publisher: Vec<u8> = row.get(2)?;
    let publisher: [u8; 32] = publisher.try_into().map_err(|_| {
        rusqlite::Error::InvalidColumnType(
            2,
            "publisher".to_string(),
            rusqlite::types::Type::Blob,
        )
    })?;
    Ok(StoredRecord {
        cid: row.get(0)?,
        schema_id: SchemaId::new(row.get::<_, String>(1)?),
        publisher: PeerId(publisher),
        received_at: row.get(3)?,
        bytes: row.get(4)?,
        signature: row.get(5)?,
        ttl_expires_at: row.get(6)?,
    })
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "BEGIN;
         CREATE TABLE records (
             schema_id      TEXT NOT NULL,
             cid            TEXT NOT NULL,
             publisher      BLOB NOT NULL,
             received_at    INTEGER NOT NULL,
             bytes          BLOB NOT NULL,
             signature      BLOB,
             ttl_expires_at INTEGER,
             PRIMARY KEY (schema_id, cid)
         );
         CREATE INDEX records_by_time
             ON records (schema_id, received_at DESC, cid ASC);
         CREATE TABLE observations (
             schema_id   TEXT NOT NULL,
             publisher   BLOB NOT NULL,
             received_at INTEGER NOT NULL,
             cid         TEXT NOT NULL
         );
         CREATE INDEX observations_by_peer
             ON observations (schema_id, publisher, received_at);
         CREATE TABLE store_meta (key TEXT PRIMARY KEY, value INTEGER NOT NULL);
         INSERT INTO store_meta (key, value) VALUES ('total_bytes', 0);
         COMMIT;",
    )?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{PutRecord, Store, StoreError, StoreOptions, StoreQuery};
    use sdx_core::cid::cid_string;
    use sdx_core::schema::SchemaCatalog;
    use sdx_core::{PeerId, SchemaId};
    use std::sync::Arc;

    fn store() -> Store {
        Store::open_in_memory(StoreOptions::default()).expect("store should open")
    }

    fn put_req<'a>(bytes: &'a [u8], publisher: PeerId, received_at: i64) -> PutRecord<'a> {
        PutRecord {
            schema: SchemaId::from("OMM"),
            bytes,
            publisher,
            signature: None,
            received_at,
            ttl_expires_at: None,
        }
    }

    #[test]
    fn put_then_get_returns_identical_bytes() {
        let store = store();
        let bytes = vec![0x42; 64];
        let outcome = store
            .put(put_req(&bytes, PeerId([1; 32]), 1_000))
            .expect("put should succeed");
        assert!(outcome.inserted);
        assert_eq!(outcome.cid, cid_string(&bytes));

        let fetched = store
            .get(&SchemaId::from("OMM"), &outcome.cid)
            .expect("get should succeed");
        assert_eq!(fetched, bytes);
        assert!(store
            .has(&SchemaId::from("OMM"), &outcome.cid)
            .expect("has should succeed"));
    }

    #[test]
    fn get_missing_returns_not_found() {
        let store = store();
        match store.get(&SchemaId::from("OMM"), &cid_string(b"nothing")) {
            Err(StoreError::NotFound) => {}
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_put_is_idempotent_with_observations() {
        let store = store();
        let bytes = vec![9; 16];
        let first = store
            .put(put_req(&bytes, PeerId([1; 32]), 1_000))
            .expect("first put should succeed");
        let second = store
            .put(put_req(&bytes, PeerId([2; 32]), 2_000))
            .expect("second put should succeed");
        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(first.cid, second.cid);

        let stats = store.stats().expect("stats should read");
        assert_eq!(stats.records, 1);
        assert_eq!(stats.total_bytes, 16);

        let observations = store
            .observations(&SchemaId::from("OMM"), &first.cid)
            .expect("observations should read");
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].publisher, PeerId([1; 32]));
        assert_eq!(observations[1].publisher, PeerId([2; 32]));

        // received_at reflects the most recent arrival.
        let rows = store
            .query(&SchemaId::from("OMM"), &StoreQuery::default())
            .expect("query should succeed");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].received_at, 2_000);
    }

    #[test]
    fn query_orders_newest_first_with_cid_tiebreak() {
        let store = store();
        let mut cids = Vec::new();
        for (i, payload) in [b"aaa".as_slice(), b"bbb", b"ccc"].iter().enumerate() {
            let outcome = store
                .put(put_req(payload, PeerId([1; 32]), 1_000 + i as i64))
                .expect("put should succeed");
            cids.push(outcome.cid);
        }
        // Two records sharing a timestamp to exercise the tie-break.
        let tied_a = store
            .put(put_req(b"tied-a", PeerId([1; 32]), 5_000))
            .expect("put should succeed");
        let tied_b = store
            .put(put_req(b"tied-b", PeerId([1; 32]), 5_000))
            .expect("put should succeed");

        let rows = store
            .query(&SchemaId::from("OMM"), &StoreQuery::default())
            .expect("query should succeed");
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].received_at, 5_000);
        assert_eq!(rows[1].received_at, 5_000);
        let mut tied: Vec<String> = vec![rows[0].cid.clone(), rows[1].cid.clone()];
        tied.sort();
        assert_eq!(rows[0].cid, tied[0]);
        assert_eq!(rows[1].cid, tied[1]);
        assert!(tied.contains(&tied_a.cid) && tied.contains(&tied_b.cid));
    }

    #[test]
    fn query_filters_by_publisher_and_window() {
        let store = store();
        store
            .put(put_req(b"from-a", PeerId([0xA; 32]), 100))
            .expect("put should succeed");
        store
            .put(put_req(b"from-b", PeerId([0xB; 32]), 200))
            .expect("put should succeed");

        let rows = store
            .query(
                &SchemaId::from("OMM"),
                &StoreQuery {
                    publisher: Some(PeerId([0xB; 32])),
                    since: Some(150),
                    until: Some(250),
                    limit: Some(10),
                },
            )
            .expect("query should succeed");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].publisher, PeerId([0xB; 32]));
    }

    #[test]
    fn quota_rejects_with_full() {
        let store = Store::open_in_memory(StoreOptions {
            max_total_bytes: Some(10),
            validator: None,
        })
        .expect("store should open");
        store
            .put(put_req(b"12345678", PeerId([1; 32]), 1))
            .expect("first put fits");
        match store.put(put_req(b"overflow", PeerId([1; 32]), 2)) {
            Err(StoreError::Full) => {}
            other => panic!("expected full, got {other:?}"),
        }
    }

    #[test]
    fn validator_rejection_is_surfaced() {
        let mut catalog = SchemaCatalog::new();
        catalog.register_with_rule(SchemaId::from("OMM"), |bytes| !bytes.is_empty());
        let store = Store::open_in_memory(StoreOptions {
            max_total_bytes: None,
            validator: Some(Arc::new(catalog)),
        })
        .expect("store should open");
        match store.put(put_req(b"", PeerId([1; 32]), 1)) {
            Err(StoreError::SchemaRejected) => {}
            other => panic!("expected schema rejection, got {other:?}"),
        }
    }

    #[test]
    fn record_observation_requires_the_record() {
        let store = store();
        let missing = store
            .record_observation(
                &SchemaId::from("OMM"),
                &cid_string(b"absent"),
                PeerId([3; 32]),
                10,
            )
            .expect("observation call should run");
        assert!(!missing);

        let outcome = store
            .put(put_req(b"present", PeerId([1; 32]), 1))
            .expect("put should succeed");
        let added = store
            .record_observation(&SchemaId::from("OMM"), &outcome.cid, PeerId([3; 32]), 10)
            .expect("observation call should run");
        assert!(added);
        let observations = store
            .observations(&SchemaId::from("OMM"), &outcome.cid)
            .expect("observations should read");
        assert_eq!(observations.len(), 2);
    }

    #[test]
    fn prune_removes_expired_rows_and_reclaims_quota() {
        let store = store();
        let mut expiring = put_req(b"short-lived", PeerId([1; 32]), 1);
        expiring.ttl_expires_at = Some(100);
        store.put(expiring).expect("put should succeed");
        let keep = store
            .put(put_req(b"pinned", PeerId([1; 32]), 1))
            .expect("put should succeed");

        let removed = store.prune(200).expect("prune should succeed");
        assert_eq!(removed, 1);
        let stats = store.stats().expect("stats should read");
        assert_eq!(stats.records, 1);
        assert_eq!(stats.total_bytes, "pinned".len() as u64);
        assert!(store
            .has(&SchemaId::from("OMM"), &keep.cid)
            .expect("has should succeed"));
    }

    #[test]
    fn pinned_ttl_wins_on_duplicate_put() {
        let store = store();
        let mut short = put_req(b"record", PeerId([1; 32]), 1);
        short.ttl_expires_at = Some(100);
        store.put(short).expect("put should succeed");
        // Second observation pins the record.
        store
            .put(put_req(b"record", PeerId([2; 32]), 2))
            .expect("put should succeed");
        let removed = store.prune(10_000).expect("prune should succeed");
        assert_eq!(removed, 0);
    }

    #[test]
    fn version_mismatch_aborts_open() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("records.db");
        {
            let conn = rusqlite::Connection::open(&path).expect("db should open");
            conn.pragma_update(None, "user_version", 99_i64)
                .expect("pragma should set");
        }
        match Store::open(&path, StoreOptions::default()) {
            Err(StoreError::Migration { found, expected }) => {
                assert_eq!(found, 99);
                assert_eq!(expected, super::SCHEMA_VERSION);
            }
            other => panic!("expected migration error, got {other:?}"),
        }
    }

    #[test]
    fn corruption_degrades_to_read_only() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("records.db");
        let cid;
        {
            let store = Store::open(&path, StoreOptions::default()).expect("store should open");
            cid = store
                .put(put_req(b"healthy", PeerId([1; 32]), 1))
                .expect("put should succeed")
                .cid;
        }
        {
            let conn = rusqlite::Connection::open(&path).expect("db should open");
            conn.execute(
                "UPDATE records SET bytes = X'DEADBEEF' WHERE cid = ?1",
                rusqlite::params![cid],
            )
            .expect("tamper should apply");
        }
        let store = Store::open(&path, StoreOptions::default()).expect("store should open");
        match store.get(&SchemaId::from("OMM"), &cid) {
            Err(StoreError::Corrupt(_)) => {}
            other => panic!("expected corruption, got {other:?}"),
        }
        assert!(store.is_read_only());
        match store.put(put_req(b"more", PeerId([1; 32]), 2)) {
            Err(StoreError::ReadOnly) => {}
            other => panic!("expected read-only, got {other:?}"),
        }
    }
}

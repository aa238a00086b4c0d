use thiserror::Error;

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record under the requested `(schema, cid)`.
    #[error("record not found")]
    NotFound,
    /// The configured byte quota would be exceeded.
    #[error("store quota exceeded")]
    Full,
    /// Stored bytes no longer match their CID, or an equivalent
    /// inconsistency. The store degrades to read-only when this surfaces.
    #[error("store corruption: {0}")]
    Corrupt(String),
    /// Underlying database failure; retriable.
    #[error("store i/o error: {0}")]
    Io(String),
    /// The schema validator rejected the payload.
    #[error("schema rejected payload")]
    SchemaRejected,
    /// The store is in read-only degraded mode.
    #[error("store is read-only")]
    ReadOnly,
    /// On-disk schema version does not match this build.
    #[error("store schema version mismatch: found {found}, expected {expected}")]
    Migration { found: i64, expected: i64 },
}

impl StoreError {
    /// True for failures the caller may retry without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

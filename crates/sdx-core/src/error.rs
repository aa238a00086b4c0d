use thiserror::Error;

/// Shared lightweight error type for core primitive operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Peer identifier bytes or encoding are malformed.
    #[error("invalid peer id")]
    InvalidPeerId,
    /// Content identifier is malformed or unsupported.
    #[error("invalid cid: {0}")]
    InvalidCid(&'static str),
}

use thiserror::Error;

/// Errors returned by frame/announcement codec operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer ended before the declared frame length.
    #[error("truncated input")]
    Truncated,
    /// Frame-level validation failure.
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    /// Announcement-level validation failure.
    #[error("invalid announcement: {0}")]
    InvalidAnnouncement(&'static str),
}

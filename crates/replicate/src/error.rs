//! Replication Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use crate::Key;
use derive_more::{Display, Error};

/// A replication error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Input could not be interpreted as a 32-byte log key.
    #[display("invalid key: {_0}")]
    InvalidKey(#[error(not(source))] String),
    /// The log could not be opened (missing, corrupt or locked).
    #[display("log unavailable: {_0}")]
    Unavailable(#[error(not(source))] Key),
    /// The log exists but is not a valid drive (no content log header).
    #[display("not a drive: {_0}")]
    InvalidDrive(#[error(not(source))] Key),
    /// The replication client could not reach the network daemon.
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// The client has been closed; no further calls are accepted.
    #[display("replication client closed")]
    Closed,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Network(_))
    }
}

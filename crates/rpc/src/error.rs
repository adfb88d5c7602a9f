//! Command Channel Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A command channel error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for command channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Nothing is listening at the endpoint (or it refused the connection).
    #[display("could not connect to {_0}")]
    Connect(#[error(not(source))] String),
    /// The peer did not answer in time.
    #[display("timed out")]
    Timeout,
    /// Reading or writing the socket failed mid-conversation.
    #[display("connection error")]
    Io,
    /// The peer sent something that is not a valid message, or is not a
    /// mirroring service at all.
    #[display("protocol error: {_0}")]
    Protocol(#[error(not(source))] String),
    /// Resource type name is neither a current nor a legacy name.
    #[display("unknown resource type: {_0:?}")]
    UnknownType(#[error(not(source))] String),
    /// The service processed the command and rejected it.
    #[display("service error: {_0}")]
    Remote(#[error(not(source))] String),
    /// The service closed the connection before answering.
    #[display("connection closed")]
    Closed,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout | Self::Io)
    }
}

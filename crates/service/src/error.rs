//! Service Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Errors from the replication client
//! and the store are raised into one of the kinds below, so the full chain is
//! still visible with `{:?}`.

use derive_more::{Display, Error};
use dmirror_replicate::Key;

/// A service error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for service operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// ### Startup
/// - [`ErrorKind::AlreadyRunning`]
/// - [`ErrorKind::Listen`]
/// - [`ErrorKind::Recovery`]
///
/// ### Per-command
/// - [`ErrorKind::InvalidKey`]
/// - [`ErrorKind::Open`]
/// - [`ErrorKind::Stopped`]
///
/// ### Dependency Errors
/// - [`ErrorKind::Replication`]
/// - [`ErrorKind::Store`]
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Another mirroring service answered on the endpoint.
    #[display("a mirroring service is already running on {_0}")]
    AlreadyRunning(#[error(not(source))] String),
    /// The key is not 32 bytes of raw data or hex.
    #[display("invalid key: {_0}")]
    InvalidKey(#[error(not(source))] String),
    /// The replication client is unavailable or rejected a call.
    #[display("replication client error")]
    Replication,
    /// Reading or writing the membership or type store failed.
    #[display("store error")]
    Store,
    /// A log or drive could not be opened or resolved.
    #[display("could not open {_0}")]
    Open(#[error(not(source))] Key),
    /// The command listener could not be bound.
    #[display("could not listen on {_0}")]
    Listen(#[error(not(source))] String),
    /// Strict recovery hit a row it could not restore.
    #[display("recovery aborted")]
    Recovery,
    /// The service has shut down.
    #[display("service stopped")]
    Stopped,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Replication | Self::Store | Self::Open(_))
    }
}

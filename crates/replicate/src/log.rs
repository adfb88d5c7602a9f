//! Log and drive accessors.
//!
//! A [`Log`] is a single append-only, key-addressed replicated log. A [`Drive`]
//! is a compound resource made of exactly two logs: a metadata log (whose key
//! is the drive key) and a content log whose key is only known once the
//! metadata log has been read. Both are opened through a [`LogStore`].

use crate::error::Result;
use crate::key::{DiscoveryKey, Key};
use crate::{DriveHandle, LogHandle};
use async_trait::async_trait;

/// Opaque handle for an outstanding download request.
///
/// Issued by [`Log::download`]; the only way to cancel the request is to
/// hand it back to [`Log::undownload`], so whoever holds it owns the right to
/// cancel.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct DownloadRequest(u64);

impl DownloadRequest {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A single replicated log.
#[async_trait]
pub trait Log: Send + Sync {
    fn key(&self) -> &Key;

    fn discovery_key(&self) -> DiscoveryKey {
        self.key().discovery_key()
    }

    /// Wait until the log has loaded its local state.
    async fn ready(&self) -> Result<()>;

    /// Request every block of the log, now and as it grows.
    fn download(&self) -> DownloadRequest;

    /// Cancel a request previously issued by [`download`](Self::download).
    fn undownload(&self, request: DownloadRequest);
}

/// A compound resource presented as one versioned filesystem.
#[async_trait]
pub trait Drive: Send + Sync {
    fn key(&self) -> &Key;

    async fn ready(&self) -> Result<()>;

    /// The metadata log; always available once the drive is open.
    fn metadata(&self) -> LogHandle;

    /// The content log, resolved from the metadata log's header.
    ///
    /// Returns [`InvalidDrive`](crate::error::ErrorKind::InvalidDrive) when
    /// the metadata log does not describe a drive.
    async fn content(&self) -> Result<LogHandle>;
}

/// Factory for logs and drives, scoped to one namespace of the node.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Open (or create a sparse local copy of) the log with the given key.
    async fn get(&self, key: &Key) -> Result<LogHandle>;

    /// Open the drive whose metadata log has the given key.
    ///
    /// Opening a drive joins it to replication; the caller does not need to
    /// announce the metadata or content logs separately.
    async fn open_drive(&self, key: &Key) -> Result<DriveHandle>;
}

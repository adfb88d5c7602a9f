//! The mirroring orchestrator.
//!
//! [`Mirroring`] owns the in-memory view of what is being mirrored and keeps
//! the replication client and the persistent stores in line with it:
//!
//! - **Downloads**: base key → open log plus its outstanding download
//!   request. A key is "in the mirror set" exactly when it has an entry here.
//! - **Drive index**: drive key → the two base keys it was mirrored as.
//!
//! Mirroring a drive is mirroring its metadata and content logs as two bases.
//! The membership store only ever sees base keys; the type store only ever
//! sees the key the caller addressed.

use crate::error::{ErrorKind, Result};
use crate::locks::{KeyGuard, KeyLocks};
use crate::resource::ResourceRequest;
use crate::stores::Stores;
use async_stream::stream;
use dmirror_replicate::{ClientHandle, DownloadRequest, IntoKey, Key, LogHandle, LogStoreHandle, NetworkConfig};
use dmirror_rpc::protocol::List;
use dmirror_rpc::{ResourceKind, Status};
use exn::ResultExt;
use futures::{Stream, TryStreamExt};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::instrument;

struct Download {
    log: LogHandle,
    request: DownloadRequest,
}

/// The two base logs a drive is made of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Constituents {
    pub metadata: Key,
    pub content: Key,
}

impl Constituents {
    /// Constituent keys other than the drive's own key.
    fn others(&self, drive: &Key) -> impl Iterator<Item = Key> {
        [self.metadata, self.content].into_iter().filter(move |key| key != drive)
    }
}

#[derive(Default)]
struct MirrorState {
    downloads: HashMap<Key, Download>,
    drives: HashMap<Key, Constituents>,
}

pub struct Mirroring {
    client: ClientHandle,
    logs: LogStoreHandle,
    stores: Stores,
    // Never held across an await.
    state: Mutex<MirrorState>,
    locks: KeyLocks,
    closed: AtomicBool,
}

impl Mirroring {
    /// Logs are opened through the client's log store for `namespace`.
    pub fn new(client: ClientHandle, stores: Stores, namespace: &str) -> Self {
        let logs = client.logs(namespace);
        Self {
            client,
            logs,
            stores,
            state: Mutex::new(MirrorState::default()),
            locks: KeyLocks::default(),
            closed: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, MirrorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            exn::bail!(ErrorKind::Stopped);
        }
        Ok(())
    }

    fn normalize(key: impl IntoKey) -> Result<Key> {
        match key.into_key() {
            Ok(key) => Ok(key),
            Err(e) => {
                let message = e.to_string();
                Err(e).or_raise(|| ErrorKind::InvalidKey(message))
            },
        }
    }

    /// Whether the base key is in the mirror set.
    pub fn is_mirrored(&self, key: &Key) -> bool {
        self.state().downloads.contains_key(key)
    }

    /// Constituents of a mirrored drive.
    pub fn drive(&self, key: &Key) -> Option<Constituents> {
        self.state().drives.get(key).copied()
    }

    /// Base keys currently in the mirror set, in key order.
    pub fn mirrored(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.state().downloads.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Start mirroring a resource and record it in both stores.
    ///
    /// Mirroring something that is already mirrored keeps the existing
    /// download and rewrites the store rows.
    #[instrument(skip(self, key), fields(key = tracing::field::Empty))]
    pub async fn mirror(&self, key: impl IntoKey, kind: Option<ResourceKind>) -> Result<Status> {
        self.check_open()?;
        let key = Self::normalize(key)?;
        tracing::Span::current().record("key", tracing::field::display(&key));
        let request = ResourceRequest::new(key, kind);
        let _guard = self.locks.lock(key).await;
        match request {
            ResourceRequest::Base(key) => self.mirror_base(key, None, true, true).await?,
            ResourceRequest::Drive(key) => self.mirror_drive(key).await?,
        }
        self.stores.types.put(&key, request.kind()).await?;
        tracing::info!(%key, kind = %request.kind(), "Mirroring");
        Ok(self.status_of(&key, kind))
    }

    /// Stop mirroring a resource and forget it in both stores. Unmirroring
    /// something that is not mirrored succeeds without doing anything.
    #[instrument(skip(self, key), fields(key = tracing::field::Empty))]
    pub async fn unmirror(&self, key: impl IntoKey, kind: Option<ResourceKind>) -> Result<Status> {
        self.check_open()?;
        let key = Self::normalize(key)?;
        tracing::Span::current().record("key", tracing::field::display(&key));
        let request = ResourceRequest::new(key, kind);
        let _guard = self.locks.lock(key).await;
        match request {
            ResourceRequest::Base(key) => self.unmirror_base(key).await?,
            ResourceRequest::Drive(key) => self.unmirror_drive(key).await?,
        }
        self.stores.types.del(&key).await?;
        tracing::info!(%key, kind = %request.kind(), "Stopped mirroring");
        Ok(self.status_of(&key, kind))
    }

    /// Current mirroring state; no I/O.
    pub fn status(&self, key: impl IntoKey, kind: Option<ResourceKind>) -> Result<Status> {
        self.check_open()?;
        let key = Self::normalize(key)?;
        Ok(self.status_of(&key, kind))
    }

    fn status_of(&self, key: &Key, kind: Option<ResourceKind>) -> Status {
        let state = self.state();
        let mirroring = match ResourceRequest::new(*key, kind) {
            ResourceRequest::Base(key) => state.downloads.contains_key(&key),
            ResourceRequest::Drive(key) => state.drives.get(&key).is_some_and(|drive| {
                state.downloads.contains_key(&drive.metadata) && state.downloads.contains_key(&drive.content)
            }),
        };
        Status { key: *key, kind, mirroring }
    }

    /// Every resource in the type store, in key order.
    ///
    /// Reports what callers asked for rather than live state: every entry
    /// has `mirroring: true`.
    pub fn list(&self) -> impl Stream<Item = Result<Status>> + Send + '_ {
        stream! {
            if let Err(e) = self.check_open() {
                yield Err(e);
                return;
            }
            for await entry in self.stores.types.entries() {
                yield entry.map(|(key, kind)| Status { key, kind: Some(kind), mirroring: true });
            }
        }
    }

    pub async fn list_all(&self) -> Result<List> {
        let mirroring = self.list().try_collect().await?;
        Ok(List { mirroring })
    }

    /// Mirror a single base log.
    ///
    /// `log` is used instead of opening the key when the caller already has
    /// it. `replicate` is off for drive constituents (opening the drive has
    /// joined them already) and `persist` is off during recovery, where the
    /// membership row is what is being replayed.
    pub(crate) async fn mirror_base(
        &self,
        key: Key,
        log: Option<LogHandle>,
        replicate: bool,
        persist: bool,
    ) -> Result<()> {
        let mut inserted = false;
        if self.is_mirrored(&key) {
            tracing::debug!(%key, "Already mirrored; keeping existing download");
        } else {
            let log = match log {
                Some(log) => log,
                None => self.logs.get(&key).await.or_raise(|| ErrorKind::Open(key))?,
            };
            log.ready().await.or_raise(|| ErrorKind::Open(key))?;
            if replicate {
                self.client.replicate(&*log).await.or_raise(|| ErrorKind::Replication)?;
            }
            let request = log.download();
            match self.state().downloads.entry(key) {
                // Lost a race with a drive constituent of the same key.
                Entry::Occupied(_) => log.undownload(request),
                Entry::Vacant(slot) => {
                    slot.insert(Download { log, request });
                    inserted = true;
                },
            }
            tracing::debug!(%key, replicate, "Downloading");
        }
        if persist && let Err(e) = self.stores.bases.put(&key).await {
            // Every key in the mirror set has a membership row. A download
            // started by an earlier call keeps the row that call wrote.
            if inserted {
                self.cancel_download(&key);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn mirror_drive(&self, key: Key) -> Result<()> {
        let (constituents, metadata, content) = self.open_drive(key, true).await?;
        let _guards = self.lock_constituents(&key, &constituents).await;
        // Both halves always run to completion.
        let (metadata, content) = futures::join!(
            self.mirror_base(constituents.metadata, Some(metadata), false, true),
            self.mirror_base(constituents.content, Some(content), false, true),
        );
        metadata.and(content)?;
        self.state().drives.insert(key, constituents);
        Ok(())
    }

    /// Open a drive and resolve both of its logs, replicating the metadata
    /// log first when asked to.
    pub(crate) async fn open_drive(&self, key: Key, replicate: bool) -> Result<(Constituents, LogHandle, LogHandle)> {
        let drive = self.logs.open_drive(&key).await.or_raise(|| ErrorKind::Open(key))?;
        drive.ready().await.or_raise(|| ErrorKind::Open(key))?;
        let metadata = drive.metadata();
        if replicate {
            self.client.replicate(&*metadata).await.or_raise(|| ErrorKind::Replication)?;
        }
        let content = drive.content().await.or_raise(|| ErrorKind::Open(key))?;
        let constituents = Constituents { metadata: *metadata.key(), content: *content.key() };
        Ok((constituents, metadata, content))
    }

    async fn lock_constituents(&self, drive: &Key, constituents: &Constituents) -> Vec<KeyGuard> {
        self.locks.lock_all(constituents.others(drive)).await
    }

    async fn unmirror_base(&self, key: Key) -> Result<()> {
        let Some(log) = self.state().downloads.get(&key).map(|download| download.log.clone()) else {
            return Ok(());
        };
        self.client
            .configure(&log.discovery_key(), NetworkConfig::UNANNOUNCE)
            .await
            .or_raise(|| ErrorKind::Replication)?;
        self.cancel_download(&key);
        self.stores.bases.del(&key).await?;
        tracing::debug!(%key, "Cancelled download");
        Ok(())
    }

    async fn unmirror_drive(&self, key: Key) -> Result<()> {
        let constituents = match self.drive(&key) {
            Some(constituents) => constituents,
            // Not indexed (a partial mirror, or recovery could not resolve
            // it) while its metadata log is still mirrored.
            None if self.is_mirrored(&key) => self.open_drive(key, false).await?.0,
            None => return Ok(()),
        };
        let _guards = self.lock_constituents(&key, &constituents).await;
        let (metadata, content) =
            futures::join!(self.unmirror_base(constituents.metadata), self.unmirror_base(constituents.content));
        metadata.and(content)?;
        self.state().drives.remove(&key);
        Ok(())
    }

    fn cancel_download(&self, key: &Key) {
        let download = self.state().downloads.remove(key);
        if let Some(Download { log, request }) = download {
            log.undownload(request);
        }
    }

    /// Cancel every download and clear in-memory state, leaving both stores
    /// untouched. Later commands fail with [`ErrorKind::Stopped`].
    pub(crate) fn drain(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let (downloads, drives) = {
            let mut state = self.state();
            (std::mem::take(&mut state.downloads), std::mem::take(&mut state.drives))
        };
        let count = downloads.len();
        for Download { log, request } in downloads.into_values() {
            log.undownload(request);
        }
        tracing::debug!(downloads = count, drives = drives.len(), "Drained mirroring state");
        count
    }

    pub(crate) fn index_drive(&self, key: Key, constituents: Constituents) {
        self.state().drives.insert(key, constituents);
    }

    /// Stream base keys from the membership store (for recovery).
    pub(crate) fn membership(&self) -> impl Stream<Item = Result<Key>> + Send + '_ {
        self.stores.bases.keys()
    }
}

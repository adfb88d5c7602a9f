//! In-memory replication client.
//!
//! Nothing leaves the process: logs are empty, announcements are recorded but
//! never published, and download requests are only bookkeeping. Used by the
//! service binary when no swarm daemon is configured, and by tests that need
//! to observe exactly what the orchestrator asked the network layer to do.

use crate::client::{NetworkConfig, ReplicationClient};
use crate::error::{ErrorKind, Result};
use crate::key::{DiscoveryKey, Key};
use crate::log::{DownloadRequest, Drive, Log, LogStore};
use crate::{DriveHandle, LogHandle, LogStoreHandle};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Context used to derive a drive's content key from its metadata key.
const CONTENT_KEY_CONTEXT: &str = "dmirror memory drive content key v1";

#[derive(Default)]
struct State {
    ready: bool,
    closed: bool,
    unavailable: bool,
    broken: HashSet<Key>,
    invalid_drives: HashSet<Key>,
    namespaces: BTreeSet<String>,
    network: HashMap<DiscoveryKey, NetworkConfig>,
    configure_calls: Vec<(DiscoveryKey, NetworkConfig)>,
    replications: HashMap<Key, usize>,
    opens: HashMap<Key, usize>,
    downloads: HashMap<Key, HashSet<u64>>,
    next_request: u64,
}

type Shared = Arc<Mutex<State>>;

// Poisoning is ignored: no critical section leaves `State` half-updated.
fn lock(state: &Shared) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory [`ReplicationClient`].
///
/// # Examples
///
/// ```
/// use dmirror_replicate::memory::MemoryClient;
/// use dmirror_replicate::{Key, ReplicationClient};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let key = Key::from_bytes([1; 32]);
/// let client = MemoryClient::default();
/// client.ready().await?;
/// let log = client.logs("example").get(&key).await?;
/// let request = log.download();
/// assert_eq!(client.active_downloads(&key), 1);
/// log.undownload(request);
/// assert_eq!(client.active_downloads(&key), 0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryClient {
    name: String,
    state: Shared,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }
}

impl MemoryClient {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// A client whose [`ready()`](ReplicationClient::ready) always fails, as
    /// if the daemon were not running.
    pub fn unavailable() -> Self {
        let client = Self::default();
        lock(&client.state).unavailable = true;
        client
    }

    /// Make opening the given log (or a drive rooted at it) fail.
    pub fn set_broken(&self, key: Key, broken: bool) {
        let mut state = lock(&self.state);
        match broken {
            true => state.broken.insert(key),
            false => state.broken.remove(&key),
        };
    }

    /// Make the given key open as a log, but fail to resolve as a drive.
    pub fn set_invalid_drive(&self, key: Key) {
        lock(&self.state).invalid_drives.insert(key);
    }

    /// Content key of the drive rooted at `key`.
    pub fn drive_content_key(key: &Key) -> Key {
        Key::from_bytes(blake3::derive_key(CONTENT_KEY_CONTEXT, key.as_bytes()))
    }

    pub fn is_ready(&self) -> bool {
        lock(&self.state).ready
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Whether the discovery key is currently announced.
    pub fn is_announced(&self, discovery_key: &DiscoveryKey) -> bool {
        lock(&self.state).network.get(discovery_key).is_some_and(|c| c.announce)
    }

    /// Number of [`replicate()`](ReplicationClient::replicate) calls for a log.
    pub fn replications(&self, key: &Key) -> usize {
        lock(&self.state).replications.get(key).copied().unwrap_or(0)
    }

    /// Number of times the log (or a drive rooted at it) has been opened.
    pub fn opens(&self, key: &Key) -> usize {
        lock(&self.state).opens.get(key).copied().unwrap_or(0)
    }

    /// Download requests issued for a log and not yet cancelled.
    pub fn active_downloads(&self, key: &Key) -> usize {
        lock(&self.state).downloads.get(key).map_or(0, HashSet::len)
    }

    /// Download requests not yet cancelled, across all logs.
    pub fn total_downloads(&self) -> usize {
        lock(&self.state).downloads.values().map(HashSet::len).sum()
    }

    /// Every [`configure()`](ReplicationClient::configure) call, in order.
    pub fn configure_calls(&self) -> Vec<(DiscoveryKey, NetworkConfig)> {
        lock(&self.state).configure_calls.clone()
    }

    /// Namespaces that log stores were requested for.
    pub fn namespaces(&self) -> Vec<String> {
        lock(&self.state).namespaces.iter().cloned().collect()
    }

    fn check_open(state: &State) -> Result<()> {
        if state.closed {
            exn::bail!(ErrorKind::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicationClient for MemoryClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ready(&self) -> Result<()> {
        let mut state = lock(&self.state);
        Self::check_open(&state)?;
        if state.unavailable {
            exn::bail!(ErrorKind::Network(format!("{} replication daemon is unreachable", self.name)));
        }
        state.ready = true;
        tracing::debug!(client = %self.name, "Replication client ready");
        Ok(())
    }

    fn logs(&self, namespace: &str) -> LogStoreHandle {
        lock(&self.state).namespaces.insert(namespace.to_string());
        Arc::new(MemoryLogStore { state: self.state.clone() })
    }

    async fn replicate(&self, log: &dyn Log) -> Result<()> {
        let mut state = lock(&self.state);
        Self::check_open(&state)?;
        *state.replications.entry(*log.key()).or_default() += 1;
        state.network.insert(log.discovery_key(), NetworkConfig::JOIN);
        tracing::trace!(key = %log.key(), "Replicating log");
        Ok(())
    }

    async fn configure(&self, discovery_key: &DiscoveryKey, config: NetworkConfig) -> Result<()> {
        let mut state = lock(&self.state);
        Self::check_open(&state)?;
        state.network.insert(*discovery_key, config);
        state.configure_calls.push((*discovery_key, config));
        tracing::trace!(%discovery_key, announce = config.announce, "Configured network participation");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        lock(&self.state).closed = true;
        tracing::debug!(client = %self.name, "Replication client closed");
        Ok(())
    }
}

struct MemoryLogStore {
    state: Shared,
}

impl MemoryLogStore {
    fn open_log(&self, key: &Key) -> Result<LogHandle> {
        let mut state = lock(&self.state);
        MemoryClient::check_open(&state)?;
        if state.broken.contains(key) {
            exn::bail!(ErrorKind::Unavailable(*key));
        }
        *state.opens.entry(*key).or_default() += 1;
        Ok(Arc::new(MemoryLog { key: *key, state: self.state.clone() }))
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn get(&self, key: &Key) -> Result<LogHandle> {
        self.open_log(key)
    }

    async fn open_drive(&self, key: &Key) -> Result<DriveHandle> {
        let metadata = self.open_log(key)?;
        let mut state = lock(&self.state);
        state.network.insert(key.discovery_key(), NetworkConfig::JOIN);
        if !state.invalid_drives.contains(key) {
            let content = MemoryClient::drive_content_key(key);
            state.network.insert(content.discovery_key(), NetworkConfig::JOIN);
        }
        Ok(Arc::new(MemoryDrive { key: *key, metadata, state: self.state.clone() }))
    }
}

struct MemoryLog {
    key: Key,
    state: Shared,
}

#[async_trait]
impl Log for MemoryLog {
    fn key(&self) -> &Key {
        &self.key
    }

    async fn ready(&self) -> Result<()> {
        if lock(&self.state).broken.contains(&self.key) {
            exn::bail!(ErrorKind::Unavailable(self.key));
        }
        Ok(())
    }

    fn download(&self) -> DownloadRequest {
        let mut state = lock(&self.state);
        state.next_request += 1;
        let id = state.next_request;
        state.downloads.entry(self.key).or_default().insert(id);
        DownloadRequest::new(id)
    }

    fn undownload(&self, request: DownloadRequest) {
        let mut state = lock(&self.state);
        if let Some(requests) = state.downloads.get_mut(&self.key) {
            requests.remove(&request.id());
            if requests.is_empty() {
                state.downloads.remove(&self.key);
            }
        }
    }
}

struct MemoryDrive {
    key: Key,
    metadata: LogHandle,
    state: Shared,
}

#[async_trait]
impl Drive for MemoryDrive {
    fn key(&self) -> &Key {
        &self.key
    }

    async fn ready(&self) -> Result<()> {
        self.metadata.ready().await
    }

    fn metadata(&self) -> LogHandle {
        self.metadata.clone()
    }

    async fn content(&self) -> Result<LogHandle> {
        let mut state = lock(&self.state);
        if state.invalid_drives.contains(&self.key) {
            exn::bail!(ErrorKind::InvalidDrive(self.key));
        }
        let key = MemoryClient::drive_content_key(&self.key);
        *state.opens.entry(key).or_default() += 1;
        Ok(Arc::new(MemoryLog { key, state: self.state.clone() }))
    }
}

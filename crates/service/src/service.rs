//! Service lifecycle: guarded startup, recovery, serving, and shutdown.

use crate::error::{ErrorKind, Result};
use crate::mirror::Mirroring;
use crate::recovery::RecoveryReport;
use crate::server::{ServerEvent, accept_loop};
use crate::stores::{DEFAULT_NAMESPACE, DEFAULT_VERSION, Stores};
use dmirror_replicate::ClientHandle;
use dmirror_store::{Database, Location};
use exn::ResultExt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Default command channel port.
pub const DEFAULT_PORT: u16 = 49737;
const EVENT_CAPACITY: usize = 64;

/// Startup options for [`MirroringService::open`].
#[derive(Clone, Debug)]
pub struct Options {
    /// Where the command channel listens, and where the "already running"
    /// probe looks. Port `0` picks a free port (and skips the probe).
    pub endpoint: SocketAddr,
    pub probe_timeout: Duration,
    pub database: Location,
    /// Root of both stores, and the log store namespace.
    pub namespace: String,
    pub version: String,
    /// Abort startup on the first row recovery cannot restore.
    pub strict_recovery: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            endpoint: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            probe_timeout: Duration::from_millis(500),
            database: Location::Memory,
            namespace: DEFAULT_NAMESPACE.to_string(),
            version: DEFAULT_VERSION.to_string(),
            strict_recovery: false,
        }
    }
}

struct Inner {
    mirroring: Mirroring,
    client: ClientHandle,
    db: Database,
    local_addr: SocketAddr,
    recovery: RecoveryReport,
    events: broadcast::Sender<ServerEvent>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
    closing: AtomicBool,
    accept: Mutex<Option<JoinHandle<()>>>,
}

/// A running mirroring service.
///
/// Cheap to clone; every clone controls the same service. The service keeps
/// running until [`close`](Self::close) is called, either directly or by a
/// client sending `stop`.
#[derive(Clone)]
pub struct MirroringService {
    inner: Arc<Inner>,
}

impl MirroringService {
    /// Start the service.
    ///
    /// Fails with [`ErrorKind::AlreadyRunning`] without touching `client` or
    /// the database if another service answers on the endpoint. Otherwise
    /// waits for the client, opens the stores, binds the listener and runs
    /// recovery before accepting the first connection. If any step fails,
    /// everything opened so far is closed again.
    #[instrument("starting mirroring service", skip_all, fields(endpoint = %options.endpoint))]
    pub async fn open(options: Options, client: ClientHandle) -> Result<Self> {
        if options.endpoint.port() != 0 && dmirror_rpc::probe(options.endpoint, options.probe_timeout).await {
            exn::bail!(ErrorKind::AlreadyRunning(options.endpoint.to_string()));
        }
        client.ready().await.or_raise(|| ErrorKind::Replication)?;
        let db = match Database::open(&options.database).await.or_raise(|| ErrorKind::Store) {
            Ok(db) => db,
            Err(e) => {
                Self::close_client(&client).await;
                return Err(e);
            },
        };
        match Self::start(&options, client.clone(), db.clone()).await {
            Ok(service) => Ok(service),
            Err(e) => {
                Self::close_client(&client).await;
                db.close().await;
                Err(e)
            },
        }
    }

    async fn start(options: &Options, client: ClientHandle, db: Database) -> Result<Self> {
        let stores = Stores::open(&db, &options.namespace, &options.version)?;
        let listener =
            TcpListener::bind(options.endpoint).await.or_raise(|| ErrorKind::Listen(options.endpoint.to_string()))?;
        let local_addr = listener.local_addr().or_raise(|| ErrorKind::Listen(options.endpoint.to_string()))?;

        let mirroring = Mirroring::new(client.clone(), stores, &options.namespace);
        // The listener is bound but not accepting; on failure it is dropped.
        let recovery = mirroring.recover(options.strict_recovery).await?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shutdown = CancellationToken::new();
        let service = Self {
            inner: Arc::new(Inner {
                mirroring,
                client,
                db,
                local_addr,
                recovery,
                events,
                shutdown: shutdown.clone(),
                stopped: CancellationToken::new(),
                closing: AtomicBool::new(false),
                accept: Mutex::new(None),
            }),
        };
        let task = tokio::spawn(accept_loop(listener, service.clone(), shutdown));
        *service.inner.accept.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        tracing::info!(
            %local_addr,
            client = service.inner.client.name(),
            restored = service.inner.recovery.restored.len(),
            "Mirroring service listening"
        );
        Ok(service)
    }

    async fn close_client(client: &ClientHandle) {
        if let Err(e) = client.close().await {
            tracing::warn!(error = ?e, "Could not close replication client");
        }
    }

    pub fn mirroring(&self) -> &Mirroring {
        &self.inner.mirroring
    }

    /// Address the command channel is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// What startup recovery restored.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.inner.recovery
    }

    /// Receive [`ServerEvent`]s from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn publish(&self, event: ServerEvent) {
        // No subscribers is fine.
        _ = self.inner.events.send(event);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.is_cancelled()
    }

    /// Wait until the service has completely shut down.
    pub async fn stopped(&self) {
        self.inner.stopped.cancelled().await;
    }

    /// Shut down: stop accepting connections and wait for open ones to
    /// finish their current command, cancel every download, then close the
    /// replication client and the database. Persisted state is untouched.
    ///
    /// Calling this more than once (or concurrently) is fine; later calls
    /// wait for the first one to finish.
    #[instrument("stopping mirroring service", skip(self), fields(endpoint = %self.inner.local_addr))]
    pub async fn close(&self) -> Result<()> {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            self.stopped().await;
            return Ok(());
        }
        self.inner.shutdown.cancel();
        let task = self.inner.accept.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "Command server task failed");
        }
        let drained = self.inner.mirroring.drain();
        let result = self.inner.client.close().await.or_raise(|| ErrorKind::Replication);
        self.inner.db.close().await;
        self.inner.stopped.cancel();
        tracing::info!(drained, "Mirroring service stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmirror_replicate::memory::MemoryClient;

    fn options() -> Options {
        Options { endpoint: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), ..Options::default() }
    }

    #[tokio::test]
    async fn test_open_and_close() {
        let client = MemoryClient::default();
        let service = MirroringService::open(options(), Arc::new(client.clone())).await.unwrap();
        assert!(client.is_ready());
        assert_ne!(service.local_addr().port(), 0);
        assert!(service.recovery().is_clean());
        assert_eq!(client.namespaces(), vec![DEFAULT_NAMESPACE.to_string()]);

        service.close().await.unwrap();
        assert!(service.is_stopped());
        assert!(client.is_closed());
        // Idempotent.
        service.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_client() {
        let err = MirroringService::open(options(), Arc::new(MemoryClient::unavailable())).await.err().unwrap();
        assert!(matches!(&*err, ErrorKind::Replication));
    }

    #[tokio::test]
    async fn test_listen_failure_closes_client() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = MemoryClient::default();
        // Something that is not a mirroring service holds the port: the probe
        // says "not running", then binding fails.
        let options = Options { endpoint: taken.local_addr().unwrap(), probe_timeout: Duration::from_millis(100), ..options() };
        let err = MirroringService::open(options, Arc::new(client.clone())).await.err().unwrap();
        assert!(matches!(&*err, ErrorKind::Listen(_)));
        assert!(client.is_closed());
    }
}

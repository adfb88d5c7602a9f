//! Command client.

use crate::error::{ErrorKind, Result};
use crate::framing::Channel;
use crate::protocol::{Ack, List, Method, PROTOCOL, Pong, Request, ResourceKind, Response, Status, Target};
use dmirror_replicate::IntoKey;
use exn::ResultExt;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::instrument;

/// How [`Client::connect`] behaves when nothing is listening yet.
#[derive(Clone, Copy, Debug)]
pub struct ConnectOptions {
    /// Attempts after the first one; `0` disables retrying.
    pub retries: u32,
    /// Delay before the first retry, doubled after each failed attempt.
    pub backoff: Duration,
    /// Limit for each individual connection attempt.
    pub timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_millis(100),
            timeout: Duration::from_secs(2),
        }
    }
}

impl ConnectOptions {
    /// A single attempt.
    pub fn no_retry(timeout: Duration) -> Self {
        Self { retries: 0, timeout, ..Self::default() }
    }
}

/// A connection to a running mirroring service.
///
/// Commands are sent one at a time; each call waits for its response.
pub struct Client {
    channel: Channel<TcpStream>,
    endpoint: SocketAddr,
    next_id: u64,
}

impl Client {
    pub async fn connect(endpoint: SocketAddr, options: ConnectOptions) -> Result<Self> {
        let mut backoff = options.backoff;
        let mut attempt = 0;
        let stream = loop {
            let result = match tokio::time::timeout(options.timeout, TcpStream::connect(endpoint)).await {
                Ok(result) => result.or_raise(|| ErrorKind::Connect(endpoint.to_string())),
                Err(elapsed) => Err(elapsed).or_raise(|| ErrorKind::Timeout),
            };
            match result {
                Ok(stream) => break stream,
                Err(e) if attempt < options.retries => {
                    attempt += 1;
                    tracing::debug!(%endpoint, attempt, error = %e, "Connection attempt failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                },
                Err(e) => return Err(e),
            }
        };
        // Small request/response messages; don't wait to coalesce.
        stream.set_nodelay(true).or_raise(|| ErrorKind::Io)?;
        Ok(Self { channel: Channel::new(stream), endpoint, next_id: 1 })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    async fn call<T: DeserializeOwned>(&mut self, method: Method, params: Option<Target>) -> Result<T> {
        let id = self.next_id;
        self.next_id += 1;
        self.channel.send(&Request { id, method, params }).await?;
        loop {
            let Some(response) = self.channel.recv::<Response>().await? else {
                exn::bail!(ErrorKind::Closed);
            };
            if response.id == id {
                return response.into_result();
            }
            // Unsolicited errors (id 0) refer to a line the service could not
            // parse; nothing else is in flight on this connection.
            if let Some(message) = response.error {
                exn::bail!(ErrorKind::Remote(message));
            }
            tracing::debug!(expected = id, received = response.id, "Discarding stray response");
        }
    }

    #[instrument(skip(self, key), fields(endpoint = %self.endpoint))]
    pub async fn mirror(&mut self, key: impl IntoKey, kind: Option<ResourceKind>) -> Result<Status> {
        let key = key.into_key().or_raise(|| ErrorKind::Protocol("invalid key".to_string()))?;
        self.call(Method::Mirror, Some(Target::new(key, kind))).await
    }

    #[instrument(skip(self, key), fields(endpoint = %self.endpoint))]
    pub async fn unmirror(&mut self, key: impl IntoKey, kind: Option<ResourceKind>) -> Result<Status> {
        let key = key.into_key().or_raise(|| ErrorKind::Protocol("invalid key".to_string()))?;
        self.call(Method::Unmirror, Some(Target::new(key, kind))).await
    }

    pub async fn status(&mut self, key: impl IntoKey, kind: Option<ResourceKind>) -> Result<Status> {
        let key = key.into_key().or_raise(|| ErrorKind::Protocol("invalid key".to_string()))?;
        self.call(Method::Status, Some(Target::new(key, kind))).await
    }

    pub async fn list(&mut self) -> Result<List> {
        self.call(Method::List, None).await
    }

    /// Ask the service to shut down. Returns once the service has
    /// acknowledged; shutdown continues after that.
    pub async fn stop(&mut self) -> Result<()> {
        let ack: Ack = self.call(Method::Stop, None).await?;
        if !ack.ok {
            exn::bail!(ErrorKind::Remote("stop was refused".to_string()));
        }
        Ok(())
    }

    pub async fn ping(&mut self) -> Result<Pong> {
        self.call(Method::Ping, None).await
    }
}

/// Check whether a mirroring service answers at `endpoint`.
///
/// Makes a single connection attempt and a `ping`, both bounded by
/// `timeout`. Anything other than a well-formed pong with the expected
/// protocol (refused connection, timeout, garbage) counts as "not running".
pub async fn probe(endpoint: SocketAddr, timeout: Duration) -> bool {
    let attempt = async {
        let mut client = Client::connect(endpoint, ConnectOptions::no_retry(timeout)).await?;
        client.ping().await
    };
    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(pong)) if pong.protocol == PROTOCOL => true,
        Ok(Ok(pong)) => {
            tracing::debug!(%endpoint, protocol = %pong.protocol, "Endpoint speaks a different protocol");
            false
        },
        Ok(Err(e)) => {
            tracing::trace!(%endpoint, error = %e, "Probe failed");
            false
        },
        Err(_) => false,
    }
}

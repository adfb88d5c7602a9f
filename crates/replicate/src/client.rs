//! Replication client trait.

use crate::LogStoreHandle;
use crate::error::Result;
use crate::key::DiscoveryKey;
use crate::log::Log;
use async_trait::async_trait;

/// Network participation settings for a single discovery key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Announce this node as a peer for the discovery key.
    pub announce: bool,
    /// Look up other peers for the discovery key.
    pub lookup: bool,
}

impl NetworkConfig {
    /// Full participation: announce and look up.
    pub const JOIN: Self = Self { announce: true, lookup: true };
    /// Stop announcing; existing connections are left alone.
    pub const UNANNOUNCE: Self = Self { announce: false, lookup: true };
}

/// Handle to the node's replication subsystem.
///
/// Implementations talk to whatever daemon owns the swarm. The mirroring
/// service only ever needs to mark logs for replication, toggle announcement
/// and open logs through the client's [`LogStore`](crate::LogStore).
#[async_trait]
pub trait ReplicationClient: Send + Sync {
    /// Name of the implementation (used for logging only).
    fn name(&self) -> &str;

    /// Wait until the client is connected and usable.
    async fn ready(&self) -> Result<()>;

    /// Log store scoped to `namespace`. Logs opened through different
    /// namespaces with the same key are the same log.
    fn logs(&self, namespace: &str) -> LogStoreHandle;

    /// Start replicating a log: join its discovery key and serve its blocks.
    async fn replicate(&self, log: &dyn Log) -> Result<()>;

    /// Change network participation for a discovery key.
    async fn configure(&self, discovery_key: &DiscoveryKey, config: NetworkConfig) -> Result<()>;

    /// Disconnect. Outstanding download requests are abandoned.
    async fn close(&self) -> Result<()>;
}

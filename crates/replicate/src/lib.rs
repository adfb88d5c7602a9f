//! Contracts for the node's replication layer.
//!
//! The mirroring service never touches log data itself. Everything it needs
//! from the storage engine and the swarm is expressed by three traits:
//!
//! - [`ReplicationClient`]: readiness, announcing logs, closing.
//! - [`LogStore`]: opening logs and drives by key.
//! - [`Log`] / [`Drive`]: downloading a log, resolving a drive's two logs.
//!
//! [`memory::MemoryClient`] implements all of them in-process.

mod client;
pub mod error;
mod key;
mod log;
pub mod memory;

pub use crate::client::{NetworkConfig, ReplicationClient};
pub use crate::key::{DiscoveryKey, IntoKey, KEY_LENGTH, Key};
pub use crate::log::{DownloadRequest, Drive, Log, LogStore};
use std::sync::Arc;

pub type ClientHandle = Arc<dyn ReplicationClient>;
pub type LogStoreHandle = Arc<dyn LogStore>;
pub type LogHandle = Arc<dyn Log>;
pub type DriveHandle = Arc<dyn Drive>;

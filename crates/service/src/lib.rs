//! The mirroring service.
//!
//! Tells a node's replication layer which logs and drives to keep
//! downloading, and remembers that across restarts.
//!
//! - [`Mirroring`] is the orchestrator: mirror, unmirror, status and list,
//!   plus startup [recovery](Mirroring::recover) from the membership store.
//! - [`MirroringService`] wraps it in a lifecycle and a TCP command server
//!   speaking the [`dmirror_rpc`] protocol.

pub mod error;
mod locks;
mod mirror;
mod recovery;
mod resource;
mod server;
mod service;
mod stores;

pub use crate::mirror::{Constituents, Mirroring};
pub use crate::recovery::{Failure, RecoveryReport};
pub use crate::resource::ResourceRequest;
pub use crate::server::ServerEvent;
pub use crate::service::{DEFAULT_PORT, MirroringService, Options};
pub use crate::stores::{DEFAULT_NAMESPACE, DEFAULT_VERSION, MembershipStore, Stores, TypeStore};

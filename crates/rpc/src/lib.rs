//! The mirroring service's command channel.
//!
//! A TCP connection carries newline-delimited JSON: [`protocol::Request`]s
//! from the client, one [`protocol::Response`] per request from the service.
//! [`framing::Channel`] does the line framing for both sides and [`Client`]
//! is the typed client used by the CLI and by the service's own startup probe.

mod client;
pub mod error;
pub mod framing;
pub mod protocol;

pub use crate::client::{Client, ConnectOptions, probe};
pub use crate::protocol::{List, ResourceKind, Status};

//! Ordered key-value store on SQLite.
//!
//! The mirroring service persists two small sets of records: which keys are
//! mirrored, and what kind of resource each key is. Both fit a single table
//! of JSON values keyed by a `/`-separated path. This crate provides that
//! table through [`Database`] and carves it into namespaces with [`Tree`].
//!
//! Writes are durable once they return (`synchronous = FULL`), so a record
//! written right before a crash is seen on the next start.

mod db;
pub mod error;
mod models;
mod tree;

pub use crate::db::{Database, Location};
pub use crate::tree::{Entry, Tree};

//! The two persistent stores: which base logs are mirrored, and what kind of
//! resource each addressed key is.

use crate::error::{ErrorKind, Result};
use dmirror_replicate::Key;
use dmirror_rpc::ResourceKind;
use dmirror_store::{Database, Tree};
use exn::ResultExt;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

pub const DEFAULT_NAMESPACE: &str = "dhub-mirroring-service";
pub const DEFAULT_VERSION: &str = "v1";
const BASES: &str = "bases";
const TYPES: &str = "types";

/// Value of a membership row. Carries nothing yet; stored as `{}`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Membership {}

/// Hex base-log key → [`Membership`]. One row per mirrored base log.
#[derive(Clone, Debug)]
pub struct MembershipStore {
    tree: Tree,
}

impl MembershipStore {
    pub async fn put(&self, key: &Key) -> Result<()> {
        self.tree.put(&key.to_hex(), &Membership::default()).await.or_raise(|| ErrorKind::Store)
    }

    /// Removing a key that has no row is not an error.
    pub async fn del(&self, key: &Key) -> Result<()> {
        self.tree.del(&key.to_hex()).await.or_raise(|| ErrorKind::Store)?;
        Ok(())
    }

    pub async fn contains(&self, key: &Key) -> Result<bool> {
        let row: Option<Membership> = self.tree.get(&key.to_hex()).await.or_raise(|| ErrorKind::Store)?;
        Ok(row.is_some())
    }

    /// Every mirrored base key, in key order.
    pub fn keys(&self) -> impl Stream<Item = Result<Key>> + Send + '_ {
        self.tree.stream::<Membership>().map(|entry| {
            let entry = entry.or_raise(|| ErrorKind::Store)?;
            Key::from_hex(&entry.key).or_raise(|| ErrorKind::Store)
        })
    }
}

/// Hex top-level key → [`ResourceKind`]. One row per resource a caller asked
/// to mirror, keyed by the key the caller used.
#[derive(Clone, Debug)]
pub struct TypeStore {
    tree: Tree,
}

impl TypeStore {
    pub async fn put(&self, key: &Key, kind: ResourceKind) -> Result<()> {
        self.tree.put(&key.to_hex(), &kind).await.or_raise(|| ErrorKind::Store)
    }

    pub async fn del(&self, key: &Key) -> Result<()> {
        self.tree.del(&key.to_hex()).await.or_raise(|| ErrorKind::Store)?;
        Ok(())
    }

    pub async fn get(&self, key: &Key) -> Result<Option<ResourceKind>> {
        self.tree.get(&key.to_hex()).await.or_raise(|| ErrorKind::Store)
    }

    /// Every row, in key order.
    pub fn entries(&self) -> impl Stream<Item = Result<(Key, ResourceKind)>> + Send + '_ {
        self.tree.stream::<ResourceKind>().map(|entry| {
            let entry = entry.or_raise(|| ErrorKind::Store)?;
            let key = Key::from_hex(&entry.key).or_raise(|| ErrorKind::Store)?;
            Ok((key, entry.value))
        })
    }
}

/// Both stores, rooted at `<namespace>/<version>`.
#[derive(Clone, Debug)]
pub struct Stores {
    pub bases: MembershipStore,
    pub types: TypeStore,
}

impl Stores {
    pub fn open(db: &Database, namespace: &str, version: &str) -> Result<Self> {
        let root = db.tree(namespace).and_then(|tree| tree.sub(version)).or_raise(|| ErrorKind::Store)?;
        Ok(Self {
            bases: MembershipStore { tree: root.sub(BASES).or_raise(|| ErrorKind::Store)? },
            types: TypeStore { tree: root.sub(TYPES).or_raise(|| ErrorKind::Store)? },
        })
    }
}

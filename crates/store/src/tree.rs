//! Namespaced views over the entries table.
//!
//! A [`Tree`] is a key prefix. [`Tree::sub`] appends a segment, so the
//! service's two stores live at `<namespace>/<version>/bases/...` and
//! `<namespace>/<version>/types/...` in one table. Keys and prefixes are
//! compared bytewise, which makes every tree a contiguous, ordered key range.

use crate::error::{ErrorKind, Result};
use crate::models::EntryRow;
use async_stream::stream;
use exn::ResultExt;
use futures::{Stream, StreamExt, TryStreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use time::UtcDateTime;
use tracing::instrument;

const SEPARATOR: char = '/';
// The byte directly after `/`; `prefix/` <= key < `prefix0` covers the tree.
const SEPARATOR_UPPER: char = '0';

/// A key-value pair read from a [`Tree`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<V> {
    /// Key relative to the tree.
    pub key: String,
    pub value: V,
}

/// An ordered, namespaced key-value map.
///
/// Values are stored as JSON. Only direct children are visible: a
/// sub-tree's entries never appear when streaming its parent.
#[derive(Debug, Clone)]
pub struct Tree {
    pool: SqlitePool,
    prefix: String,
}

fn validate_segment(segment: &str) -> Result<&str> {
    if segment.is_empty() || segment.contains(SEPARATOR) || segment.contains('\0') {
        exn::bail!(ErrorKind::InvalidKey(segment.to_string()));
    }
    Ok(segment)
}

impl Tree {
    pub(crate) fn root(pool: SqlitePool, namespace: &str) -> Result<Self> {
        let prefix = validate_segment(namespace)?.to_string();
        Ok(Self { pool, prefix })
    }

    /// Full path of this tree, e.g. `dhub-mirroring-service/v1/bases`.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Child tree one segment below this one.
    pub fn sub(&self, name: impl AsRef<str>) -> Result<Self> {
        let name = validate_segment(name.as_ref())?;
        Ok(Self {
            pool: self.pool.clone(),
            prefix: format!("{}{SEPARATOR}{name}", self.prefix),
        })
    }

    fn path(&self, key: &str) -> Result<String> {
        Ok(format!("{}{SEPARATOR}{}", self.prefix, validate_segment(key)?))
    }

    fn range(&self) -> (String, String) {
        (format!("{}{SEPARATOR}", self.prefix), format!("{}{SEPARATOR_UPPER}", self.prefix))
    }

    /// Insert or overwrite a value.
    #[instrument(skip(self, value), fields(tree = %self.prefix))]
    pub async fn put<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> Result<()> {
        let path = self.path(key)?;
        let json = serde_json::to_string(value).or_raise(|| ErrorKind::InvalidData(path.clone()))?;
        sqlx::query(include_str!("../queries/put.sql"))
            .bind(&path)
            .bind(json)
            .bind(UtcDateTime::now().unix_timestamp())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        let path = self.path(key)?;
        let row: Option<EntryRow> = sqlx::query_as(include_str!("../queries/get.sql"))
            .bind(&path)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(|row| row.decode()).transpose()
    }

    /// Delete a value. Returns `true` if a row was removed; deleting a
    /// missing key is not an error.
    #[instrument(skip(self), fields(tree = %self.prefix))]
    pub async fn del(&self, key: &str) -> Result<bool> {
        let path = self.path(key)?;
        let result = sqlx::query(include_str!("../queries/delete.sql"))
            .bind(&path)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Stream every direct entry of this tree in ascending key order.
    ///
    /// The stream is lazy and single-pass: rows are fetched as it is polled.
    /// A row that fails to decode is yielded as an error without ending the
    /// stream; a database failure ends it.
    pub fn stream<'a, V>(&'a self) -> impl Stream<Item = Result<Entry<V>>> + Send + 'a
    where
        V: DeserializeOwned + Send + 'a,
    {
        let (lower, upper) = self.range();
        let offset = lower.len();
        stream!({
            let mut rows = sqlx::query_as::<_, EntryRow>(include_str!("../queries/scan.sql"))
                .bind(lower)
                .bind(upper)
                .fetch(&self.pool);
            while let Some(row) = rows.next().await {
                let row = match row.or_raise(|| ErrorKind::Database) {
                    Ok(row) => row,
                    Err(e) => {
                        yield Err(e);
                        return;
                    },
                };
                // Entries of nested trees share the range; skip them.
                if row.key[offset..].contains(SEPARATOR) {
                    continue;
                }
                let key = row.key[offset..].to_string();
                yield row.decode().map(|value| Entry { key, value });
            }
        })
    }

    /// Collect every direct entry into a [`Vec`].
    pub async fn entries<V: DeserializeOwned + Send + 'static>(&self) -> Result<Vec<Entry<V>>> {
        self.stream().try_collect().await
    }
}

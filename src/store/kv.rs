//! Ordered KV wrapper (C1): per-tenant partitions over a byte-ordered
//! keyspace, with batched put/del and bounded range iteration.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::{Result, unexpected};

/// A bounded range over the keyspace, used by [`Kv::range`].
#[derive(Clone, Debug, Default)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub gte: Option<Vec<u8>>,
    /// Exclusive lower bound.
    pub gt: Option<Vec<u8>>,
    /// Inclusive upper bound.
    pub lte: Option<Vec<u8>>,
    /// Exclusive upper bound.
    pub lt: Option<Vec<u8>>,
    /// Iterate in reverse (descending key) order.
    pub reverse: bool,
    /// Maximum number of entries to return.
    pub limit: Option<usize>,
}

/// A single mutation within a [`Kv::batch`] call.
pub enum Op {
    /// Set `key` to `value`.
    Put(Vec<u8>, Vec<u8>),
    /// Remove `key`.
    Del(Vec<u8>),
}

/// An ordered, byte-keyed key-value store, partitioned per tenant. All
/// mutation goes through [`Kv::batch`], which is atomic: either every
/// operation in the batch applies, or none do.
pub trait Kv: Send + Sync {
    /// Returns a handle scoped to the given partition name (a tenant, or a
    /// nested namespace within a tenant, e.g. `messages`, `index`, `events`).
    fn partition(&self, name: &str) -> Self
    where
        Self: Sized;

    /// Fetches the value stored at `key`, if any.
    fn get(&self, key: &[u8]) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Applies every operation in `ops` atomically.
    fn batch(&self, ops: Vec<Op>) -> impl Future<Output = Result<()>> + Send;

    /// Iterates the keyspace within `range`, in byte-lexicographic (or
    /// reverse) order, yielding a consistent snapshot taken at call time.
    fn range(&self, range: KeyRange) -> impl Future<Output = Result<Vec<(Vec<u8>, Vec<u8>)>>> + Send;

    /// Removes every key under this partition. Used by test teardown and
    /// `purge` operations.
    fn purge(&self) -> impl Future<Output = Result<()>> + Send;
}

/// A `sled`-backed [`Kv`] implementation: one `sled::Tree` per partition
/// path, keyed by the joined partition name as a tree-name prefix.
#[derive(Clone)]
pub struct SledKv {
    db: sled::Db,
    prefix: String,
}

impl SledKv {
    /// Opens (or creates) a sled database at `path`.
    ///
    /// # Errors
    /// Returns [`crate::Error::InternalError`] if the backing engine fails
    /// to open.
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path).map_err(|e| unexpected!("failed to open sled db: {e}"))?;
        Ok(Self { db, prefix: String::new() })
    }

    fn tree(&self) -> Result<sled::Tree> {
        let name = if self.prefix.is_empty() { "default".to_string() } else { self.prefix.clone() };
        self.db.open_tree(name).map_err(|e| unexpected!("failed to open sled tree: {e}"))
    }
}

impl Kv for SledKv {
    fn partition(&self, name: &str) -> Self {
        let prefix =
            if self.prefix.is_empty() { name.to_string() } else { format!("{}/{name}", self.prefix) };
        Self { db: self.db.clone(), prefix }
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tree = self.tree()?;
        let value = tree.get(key).map_err(|e| unexpected!("sled get failed: {e}"))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    async fn batch(&self, ops: Vec<Op>) -> Result<()> {
        let tree = self.tree()?;
        let mut batch = sled::Batch::default();
        for op in ops {
            match op {
                Op::Put(k, v) => batch.insert(k, v),
                Op::Del(k) => batch.remove(k),
            }
        }
        tree.apply_batch(batch).map_err(|e| unexpected!("sled batch failed: {e}"))?;
        Ok(())
    }

    async fn range(&self, range: KeyRange) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tree = self.tree()?;
        let lower = match (&range.gte, &range.gt) {
            (Some(v), _) => std::ops::Bound::Included(v.clone()),
            (None, Some(v)) => std::ops::Bound::Excluded(v.clone()),
            (None, None) => std::ops::Bound::Unbounded,
        };
        let upper = match (&range.lte, &range.lt) {
            (Some(v), _) => std::ops::Bound::Included(v.clone()),
            (None, Some(v)) => std::ops::Bound::Excluded(v.clone()),
            (None, None) => std::ops::Bound::Unbounded,
        };

        let iter = tree.range((lower, upper));
        let mut items: Vec<(Vec<u8>, Vec<u8>)> = if range.reverse {
            iter.rev()
                .map(|r| r.map(|(k, v)| (k.to_vec(), v.to_vec())))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| unexpected!("sled range failed: {e}"))?
        } else {
            iter.map(|r| r.map(|(k, v)| (k.to_vec(), v.to_vec())))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| unexpected!("sled range failed: {e}"))?
        };

        if let Some(limit) = range.limit {
            items.truncate(limit);
        }
        Ok(items)
    }

    async fn purge(&self) -> Result<()> {
        let tree = self.tree()?;
        tree.clear().map_err(|e| unexpected!("sled clear failed: {e}"))?;
        Ok(())
    }
}

/// An in-memory [`Kv`] implementation backed by a shared `BTreeMap`, used by
/// `test-support` and unit tests, where sled's durability guarantees are
/// unnecessary overhead.
#[derive(Clone, Default)]
pub struct MemKv {
    prefix: String,
    data: Arc<Mutex<BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u8>>>>>,
}

impl MemKv {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&self) -> Vec<u8> {
        self.prefix.as_bytes().to_vec()
    }
}

impl Kv for MemKv {
    fn partition(&self, name: &str) -> Self {
        let prefix =
            if self.prefix.is_empty() { name.to_string() } else { format!("{}/{name}", self.prefix) };
        Self { prefix, data: self.data.clone() }
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let data = self.data.lock().expect("lock poisoned");
        Ok(data.get(&self.key()).and_then(|tree| tree.get(key).cloned()))
    }

    async fn batch(&self, ops: Vec<Op>) -> Result<()> {
        let mut data = self.data.lock().expect("lock poisoned");
        let tree = data.entry(self.key()).or_default();
        for op in ops {
            match op {
                Op::Put(k, v) => {
                    tree.insert(k, v);
                }
                Op::Del(k) => {
                    tree.remove(&k);
                }
            }
        }
        Ok(())
    }

    async fn range(&self, range: KeyRange) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.lock().expect("lock poisoned");
        let Some(tree) = data.get(&self.key()) else {
            return Ok(Vec::new());
        };

        let lower = match (&range.gte, &range.gt) {
            (Some(v), _) => std::ops::Bound::Included(v.clone()),
            (None, Some(v)) => std::ops::Bound::Excluded(v.clone()),
            (None, None) => std::ops::Bound::Unbounded,
        };
        let upper = match (&range.lte, &range.lt) {
            (Some(v), _) => std::ops::Bound::Included(v.clone()),
            (None, Some(v)) => std::ops::Bound::Excluded(v.clone()),
            (None, None) => std::ops::Bound::Unbounded,
        };

        let mut items: Vec<(Vec<u8>, Vec<u8>)> =
            tree.range((lower, upper)).map(|(k, v)| (k.clone(), v.clone())).collect();
        if range.reverse {
            items.reverse();
        }
        if let Some(limit) = range.limit {
            items.truncate(limit);
        }
        Ok(items)
    }

    async fn purge(&self) -> Result<()> {
        let mut data = self.data.lock().expect("lock poisoned");
        data.remove(&self.key());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn partitions_are_isolated() {
        let kv = MemKv::new();
        let a = kv.partition("tenant-a");
        let b = kv.partition("tenant-b");

        a.batch(vec![Op::Put(b"k".to_vec(), b"a-value".to_vec())]).await.unwrap();
        b.batch(vec![Op::Put(b"k".to_vec(), b"b-value".to_vec())]).await.unwrap();

        assert_eq!(a.get(b"k").await.unwrap(), Some(b"a-value".to_vec()));
        assert_eq!(b.get(b"k").await.unwrap(), Some(b"b-value".to_vec()));
    }

    #[tokio::test]
    async fn range_respects_bounds_and_limit() {
        let kv = MemKv::new().partition("t");
        kv.batch(vec![
            Op::Put(b"a".to_vec(), b"1".to_vec()),
            Op::Put(b"b".to_vec(), b"2".to_vec()),
            Op::Put(b"c".to_vec(), b"3".to_vec()),
        ])
        .await
        .unwrap();

        let items =
            kv.range(KeyRange { gte: Some(b"a".to_vec()), lt: Some(b"c".to_vec()), ..Default::default() })
                .await
                .unwrap();
        assert_eq!(items.len(), 2);

        let limited = kv.range(KeyRange { limit: Some(1), ..Default::default() }).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}

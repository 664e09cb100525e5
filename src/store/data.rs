//! External data store: the blob/CAR collaborator for large record payloads
//! is out of scope for this crate (specified only by interface); this module
//! gives the trait its pluggable seam plus a minimal KV-backed default.

use std::future::Future;

use crate::store::kv::{Kv, Op};
use crate::Result;

/// Persists record payloads too large to embed inline (> [`crate::data::MAX_ENCODED_SIZE`]),
/// addressed by their `dataCid`.
pub trait DataStore: Send + Sync {
    /// Stores `data` under `data_cid` for `owner`.
    fn put(&self, owner: &str, data_cid: &str, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Fetches previously-stored data, if any.
    fn get(&self, owner: &str, data_cid: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Removes stored data. Missing `data_cid` is a no-op.
    fn delete(&self, owner: &str, data_cid: &str) -> impl Future<Output = Result<()>> + Send;
}

/// A [`DataStore`] backed directly by a [`Kv`] partition. Adequate for
/// deployments with no dedicated blob store; large deployments should
/// provide their own `DataStore` backed by object storage or a CAR file.
#[derive(Clone)]
pub struct KvDataStore<K> {
    kv: K,
}

impl<K: Kv> KvDataStore<K> {
    /// Creates a data store rooted at the `data` partition of `kv`.
    pub fn new(kv: K) -> Self {
        Self { kv: kv.partition("data") }
    }
}

impl<K: Kv> DataStore for KvDataStore<K> {
    async fn put(&self, owner: &str, data_cid: &str, data: &[u8]) -> Result<()> {
        let partition = self.kv.partition(owner);
        partition.batch(vec![Op::Put(data_cid.as_bytes().to_vec(), data.to_vec())]).await
    }

    async fn get(&self, owner: &str, data_cid: &str) -> Result<Option<Vec<u8>>> {
        let partition = self.kv.partition(owner);
        partition.get(data_cid.as_bytes()).await
    }

    async fn delete(&self, owner: &str, data_cid: &str) -> Result<()> {
        let partition = self.kv.partition(owner);
        partition.batch(vec![Op::Del(data_cid.as_bytes().to_vec())]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::MemKv;

    #[tokio::test]
    async fn put_get_delete() {
        let store = KvDataStore::new(MemKv::new());
        store.put("alice", "cid1", b"payload").await.unwrap();
        assert_eq!(store.get("alice", "cid1").await.unwrap(), Some(b"payload".to_vec()));
        store.delete("alice", "cid1").await.unwrap();
        assert_eq!(store.get("alice", "cid1").await.unwrap(), None);
    }
}

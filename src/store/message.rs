//! Message Store (C3): canonical per-tenant storage of messages by CID,
//! delegating index maintenance to [`crate::store::index`]. See design
//! notes §4.3.

use std::future::Future;

use crate::store::index::{self, Cursor, Filter, QueryOptions};
use crate::store::kv::{Kv, Op};
use crate::store::Entry;
use crate::{Result, unexpected};

/// Canonical storage and query access for a tenant's messages.
pub trait MessageStore: Send + Sync {
    /// Stores `entry` under `message_cid`, indexing it by `entry.indexes`.
    fn put(&self, owner: &str, message_cid: &str, entry: &Entry) -> impl Future<Output = Result<()>> + Send;

    /// Runs a disjunctive filter query, returning a page of entries and the
    /// cursor for the next page, if any.
    fn query(
        &self, owner: &str, filters: &[Filter], opts: &QueryOptions,
    ) -> impl Future<Output = Result<(Vec<Entry>, Option<Cursor>)>> + Send;

    /// Fetches a single message by CID, if stored.
    fn get(&self, owner: &str, message_cid: &str) -> impl Future<Output = Result<Option<Entry>>> + Send;

    /// Removes a message and its index entry. Missing `message_cid` is a
    /// no-op.
    fn delete(&self, owner: &str, message_cid: &str) -> impl Future<Output = Result<()>> + Send;

    /// Removes every message belonging to `owner`.
    fn purge(&self, owner: &str) -> impl Future<Output = Result<()>> + Send;
}

/// A [`MessageStore`] backed by a [`Kv`], partitioned per tenant into
/// `messages` (canonical storage) and `index` (the [`index`] keyspace).
#[derive(Clone)]
pub struct KvMessageStore<K> {
    kv: K,
}

impl<K: Kv> KvMessageStore<K> {
    /// Creates a message store rooted at `kv`.
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    fn messages(&self, owner: &str) -> K {
        self.kv.partition(owner).partition("messages")
    }

    fn index(&self, owner: &str) -> K {
        self.kv.partition(owner).partition("index")
    }
}

impl<K: Kv> MessageStore for KvMessageStore<K> {
    async fn put(&self, owner: &str, message_cid: &str, entry: &Entry) -> Result<()> {
        let bytes =
            serde_json::to_vec(entry).map_err(|e| unexpected!("failed to encode message entry: {e}"))?;
        self.messages(owner).batch(vec![Op::Put(message_cid.as_bytes().to_vec(), bytes)]).await?;
        index::put(&self.index(owner), message_cid, message_cid, &entry.indexes).await
    }

    async fn query(
        &self, owner: &str, filters: &[Filter], opts: &QueryOptions,
    ) -> Result<(Vec<Entry>, Option<Cursor>)> {
        let (matched, cursor) = index::query(&self.index(owner), filters, opts).await?;
        let messages = self.messages(owner);

        let mut entries = Vec::with_capacity(matched.len());
        for candidate in matched {
            let Some(bytes) = messages.get(candidate.item_id.as_bytes()).await? else {
                continue; // index and canonical store briefly disagree during a delete; skip.
            };
            let entry: Entry =
                serde_json::from_slice(&bytes).map_err(|e| unexpected!("corrupt message entry: {e}"))?;
            entries.push(entry);
        }
        Ok((entries, cursor))
    }

    async fn get(&self, owner: &str, message_cid: &str) -> Result<Option<Entry>> {
        let Some(bytes) = self.messages(owner).get(message_cid.as_bytes()).await? else {
            return Ok(None);
        };
        let entry: Entry =
            serde_json::from_slice(&bytes).map_err(|e| unexpected!("corrupt message entry: {e}"))?;
        Ok(Some(entry))
    }

    async fn delete(&self, owner: &str, message_cid: &str) -> Result<()> {
        index::delete(&self.index(owner), message_cid).await?;
        self.messages(owner).batch(vec![Op::Del(message_cid.as_bytes().to_vec())]).await
    }

    async fn purge(&self, owner: &str) -> Result<()> {
        self.messages(owner).purge().await?;
        self.index(owner).purge().await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::kv::MemKv;
    use crate::store::EntryType;

    fn write_entry(record_id: &str, timestamp: i64) -> Entry {
        use crate::auth::Authorization;
        use crate::records::{Write, WriteDescriptor};
        use crate::{Descriptor, Interface, Method};

        let write = Write {
            descriptor: WriteDescriptor {
                base: Descriptor {
                    interface: Interface::Records,
                    method: Method::Write,
                    message_timestamp: chrono::DateTime::from_timestamp(timestamp, 0).unwrap(),
                },
                record_id: record_id.to_string(),
                date_created: chrono::DateTime::from_timestamp(timestamp, 0).unwrap(),
                data_cid: "cid".to_string(),
                data_size: 0,
                data_format: "application/json".to_string(),
                ..Default::default()
            },
            authorization: Authorization::default(),
            encoded_data: None,
        };
        let indexes = std::collections::BTreeMap::from([
            ("recordId".to_string(), json!(record_id)),
            ("messageTimestamp".to_string(), json!(timestamp)),
        ]);
        Entry { message: EntryType::Write(write), indexes }
    }

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let store = KvMessageStore::new(MemKv::new());
        let entry = write_entry("rec1", 1);
        store.put("alice", "cid1", &entry).await.unwrap();

        let fetched = store.get("alice", "cid1").await.unwrap().unwrap();
        assert_eq!(fetched.as_write().unwrap().descriptor.record_id, "rec1");

        store.delete("alice", "cid1").await.unwrap();
        assert!(store.get("alice", "cid1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_filters_by_index() {
        let store = KvMessageStore::new(MemKv::new());
        store.put("alice", "cid1", &write_entry("rec1", 1)).await.unwrap();
        store.put("alice", "cid2", &write_entry("rec2", 2)).await.unwrap();

        let mut filter = Filter::default();
        filter.0.insert(
            "recordId".to_string(),
            crate::store::index::FilterVal::Equal(json!("rec2")),
        );
        let opts = QueryOptions {
            sort_property: "messageTimestamp".to_string(),
            reverse: false,
            limit: None,
            cursor: None,
        };
        let (entries, _) = store.query("alice", &[filter], &opts).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].as_write().unwrap().descriptor.record_id, "rec2");
    }
}

//! Assembles the storage/resolution/verification collaborators behind a
//! single [`Provider`] impl: [`Dwn`]. Construction is generic over the
//! backing [`Kv`] so the same wiring serves a durable `sled` deployment and
//! an in-memory one for tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::auth::SignatureCache;
use crate::data::MAX_ENCODED_SIZE;
use crate::did::{DidResolver, Document, Resolver};
use crate::provider::{DataStore, EventLog, EventStream, MessageStore, Provider};
use crate::store::data::KvDataStore;
use crate::store::events::{BroadcastEventStream, Cursor as EventCursor, Event, KvEventLog};
use crate::store::index::{Cursor, Filter, QueryOptions};
use crate::store::kv::{Kv, MemKv, SledKv};
use crate::store::Entry;
use crate::Result;

/// Deployment-time settings for a [`Dwn`], matching the node's configuration
/// surface: DID resolution (and its cache), the inline/external payload
/// threshold, and the backing locations for durable storage.
#[derive(Clone, Debug)]
pub struct DwnConfig {
    /// HTTPS endpoint for `did:ion` resolution. `did:key` is always enabled
    /// and needs no configuration. `None` disables `did:ion` support.
    pub did_ion_endpoint: Option<String>,

    /// Resolved DID documents are cached for this many seconds.
    pub did_cache_ttl_seconds: u64,

    /// Maximum number of resolved DID documents held in the resolver cache.
    pub did_cache_max_entries: usize,

    /// Payloads at or below this size (bytes) are stored inline as
    /// `encodedData` rather than in the external [`DataStore`].
    pub data_size_inline_threshold: usize,

    /// Backing path/name for the message store's `sled` database.
    pub message_store_location: String,

    /// Backing path/name for the event log's `sled` database.
    pub event_log_location: String,
}

impl Default for DwnConfig {
    fn default() -> Self {
        Self {
            did_ion_endpoint: None,
            did_cache_ttl_seconds: 600,
            did_cache_max_entries: 100_000,
            data_size_inline_threshold: MAX_ENCODED_SIZE,
            message_store_location: "dwn-messages".to_string(),
            event_log_location: "dwn-events".to_string(),
        }
    }
}

/// A fully-wired node: message store, event log, live event stream, external
/// data store, DID resolver, and signature cache, generic over the ordered
/// [`Kv`] backing storage.
///
/// `data_size_inline_threshold` is carried for deployments that want to read
/// back the configured value; the inline/external split itself is applied at
/// [`MAX_ENCODED_SIZE`], the crate-wide constant the threshold is seeded from
/// (see [`crate::records::write`]).
#[derive(Clone)]
pub struct Dwn<K> {
    messages: crate::store::message::KvMessageStore<K>,
    events: KvEventLog<K>,
    stream: BroadcastEventStream,
    data: KvDataStore<K>,
    resolver: Arc<Resolver>,
    signature_cache: Arc<SignatureCache>,
    data_size_inline_threshold: usize,
}

impl<K: Kv + Clone> Dwn<K> {
    /// Wires a node's collaborators from an already-opened `Kv` handle (or
    /// two, if the message store and event log should live on separate
    /// backing stores) and a [`DwnConfig`].
    #[must_use]
    pub fn new(message_kv: K, event_kv: K, config: DwnConfig) -> Self {
        Self {
            messages: crate::store::message::KvMessageStore::new(message_kv.clone()),
            events: KvEventLog::new(event_kv),
            stream: BroadcastEventStream::new(),
            data: KvDataStore::new(message_kv),
            resolver: Arc::new(Resolver::new(
                config.did_ion_endpoint,
                config.did_cache_ttl_seconds,
                config.did_cache_max_entries,
            )),
            signature_cache: Arc::new(SignatureCache::default()),
            data_size_inline_threshold: config.data_size_inline_threshold,
        }
    }

    /// The configured inline/external payload size threshold.
    #[must_use]
    pub const fn data_size_inline_threshold(&self) -> usize {
        self.data_size_inline_threshold
    }
}

impl Dwn<SledKv> {
    /// Opens a durable node backed by `sled` databases at the locations
    /// named in `config`.
    ///
    /// # Errors
    /// Returns [`crate::Error::InternalError`] if either backing database
    /// fails to open.
    pub fn open(config: DwnConfig) -> Result<Self> {
        let message_kv = SledKv::open(&config.message_store_location)?;
        let event_kv = if config.event_log_location == config.message_store_location {
            message_kv.clone()
        } else {
            SledKv::open(&config.event_log_location)?
        };
        Ok(Self::new(message_kv, event_kv, config))
    }
}

impl Dwn<MemKv> {
    /// Builds an in-memory node sharing one [`MemKv`] across the message
    /// store and event log. Intended for tests and ephemeral deployments.
    #[must_use]
    pub fn in_memory() -> Self {
        let kv = MemKv::new();
        Self::new(kv.clone(), kv, DwnConfig::default())
    }
}

impl<K: Kv + Clone + Send + Sync> MessageStore for Dwn<K> {
    async fn put(&self, owner: &str, message_cid: &str, entry: &Entry) -> Result<()> {
        self.messages.put(owner, message_cid, entry).await
    }

    async fn query(
        &self, owner: &str, filters: &[Filter], opts: &QueryOptions,
    ) -> Result<(Vec<Entry>, Option<Cursor>)> {
        self.messages.query(owner, filters, opts).await
    }

    async fn get(&self, owner: &str, message_cid: &str) -> Result<Option<Entry>> {
        self.messages.get(owner, message_cid).await
    }

    async fn delete(&self, owner: &str, message_cid: &str) -> Result<()> {
        self.messages.delete(owner, message_cid).await
    }

    async fn purge(&self, owner: &str) -> Result<()> {
        self.messages.purge(owner).await
    }
}

impl<K: Kv + Clone + Send + Sync> EventLog for Dwn<K> {
    /// Appends to the durable log, then broadcasts the same event to any
    /// live subscribers: the two views of "an event happened" are kept in
    /// sync at this single call site so handlers only ever call `append`.
    async fn append(
        &self, owner: &str, message_cid: &str, indexes: BTreeMap<String, Value>,
    ) -> Result<u64> {
        let seq = self.events.append(owner, message_cid, indexes.clone()).await?;
        self.stream.publish(owner, Event { message_cid: message_cid.to_string(), indexes }).await?;
        Ok(seq)
    }

    async fn events_since(
        &self, owner: &str, since: Option<EventCursor>,
    ) -> Result<Vec<(EventCursor, Event)>> {
        self.events.events_since(owner, since).await
    }

    async fn delete_by_cid(&self, owner: &str, message_cids: &[String]) -> Result<()> {
        self.events.delete_by_cid(owner, message_cids).await
    }
}

impl<K: Kv + Clone + Send + Sync> EventStream for Dwn<K> {
    async fn publish(&self, owner: &str, event: Event) -> Result<()> {
        self.stream.publish(owner, event).await
    }

    async fn subscribe(&self, owner: &str) -> Result<tokio::sync::broadcast::Receiver<Event>> {
        self.stream.subscribe(owner).await
    }
}

impl<K: Kv + Clone + Send + Sync> DataStore for Dwn<K> {
    async fn put(&self, owner: &str, data_cid: &str, data: &[u8]) -> Result<()> {
        DataStore::put(&self.data, owner, data_cid, data).await
    }

    async fn get(&self, owner: &str, data_cid: &str) -> Result<Option<Vec<u8>>> {
        DataStore::get(&self.data, owner, data_cid).await
    }

    async fn delete(&self, owner: &str, data_cid: &str) -> Result<()> {
        DataStore::delete(&self.data, owner, data_cid).await
    }
}

impl<K: Kv + Clone + Send + Sync> DidResolver for Dwn<K> {
    async fn resolve(&self, did: &str) -> Result<Document> {
        self.resolver.resolve(did).await
    }
}

impl<K: Kv + Clone + Send + Sync> Provider for Dwn<K> {
    fn signature_cache(&self) -> &SignatureCache {
        &self.signature_cache
    }
}

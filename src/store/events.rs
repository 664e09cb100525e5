//! Event Log (C4): an append-only, per-tenant log of `(messageCid, indexes)`
//! pairs ordered by append time, used for subscription tailing and replay.
//! See design notes §4.4.

use std::collections::BTreeMap;
use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::kv::{KeyRange, Kv, Op};
use crate::{Result, unexpected};

/// One appended event: the CID of the message that produced it, and the
/// flattened indexes extracted from that message.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Event {
    /// The CID of the message this event records.
    pub message_cid: String,
    /// The message's flattened indexes, for subscription filter matching.
    pub indexes: BTreeMap<String, Value>,
}

/// A cursor into the event log: the sequence number of the last event
/// returned.
pub type Cursor = u64;

fn seq_key(seq: u64) -> Vec<u8> {
    seq.to_be_bytes().to_vec()
}

fn cid_key(message_cid: &str) -> Vec<u8> {
    format!("/by-cid/{message_cid}").into_bytes()
}

async fn next_seq(kv: &impl Kv) -> Result<u64> {
    let range = kv.range(KeyRange { reverse: true, limit: Some(1), ..Default::default() }).await?;
    Ok(range
        .into_iter()
        .find(|(k, _)| k.len() == 8)
        .map(|(k, _)| u64::from_be_bytes(k.try_into().unwrap_or_default()) + 1)
        .unwrap_or(0))
}

/// Appends an event to the log. `kv` must be scoped to the owning tenant's
/// `events` partition.
///
/// # Errors
/// Returns [`crate::Error::InternalError`] if the batch write fails.
pub async fn append(kv: &impl Kv, message_cid: &str, indexes: BTreeMap<String, Value>) -> Result<u64> {
    let seq = next_seq(kv).await?;
    let event = Event { message_cid: message_cid.to_string(), indexes };
    let bytes = serde_json::to_vec(&event).map_err(|e| unexpected!("failed to encode event: {e}"))?;
    kv.batch(vec![
        Op::Put(seq_key(seq), bytes),
        Op::Put(cid_key(message_cid), seq_key(seq)),
    ])
    .await?;
    Ok(seq)
}

/// Returns every event appended after `since` (exclusive), in append order.
///
/// # Errors
/// Returns [`crate::Error::InternalError`] if a stored event is corrupt.
pub async fn events_since(kv: &impl Kv, since: Option<Cursor>) -> Result<Vec<(Cursor, Event)>> {
    let gt = since.map(seq_key);
    let range = kv.range(KeyRange { gt, ..Default::default() }).await?;

    let mut out = Vec::new();
    for (key, bytes) in range {
        if key.len() != 8 {
            continue; // skip `/by-cid/...` reverse-lookup entries
        }
        let seq = u64::from_be_bytes(key.try_into().unwrap_or_default());
        let event: Event =
            serde_json::from_slice(&bytes).map_err(|e| unexpected!("corrupt event entry: {e}"))?;
        out.push((seq, event));
    }
    Ok(out)
}

/// Removes events by message CID, e.g. when a conflict-resolution loser is
/// reaped. Missing CIDs are a no-op.
///
/// # Errors
/// Returns [`crate::Error::InternalError`] if the batch delete fails.
pub async fn delete_by_cid(kv: &impl Kv, message_cids: &[String]) -> Result<()> {
    let mut ops = Vec::new();
    for message_cid in message_cids {
        if let Some(seq_bytes) = kv.get(&cid_key(message_cid)).await? {
            ops.push(Op::Del(seq_bytes));
            ops.push(Op::Del(cid_key(message_cid)));
        }
    }
    if ops.is_empty() {
        return Ok(());
    }
    kv.batch(ops).await
}

/// A per-tenant durable event log, scoping the free functions above to an
/// `owner` partition of some backing [`Kv`].
pub trait EventLog: Send + Sync {
    /// Appends an event to `owner`'s log.
    fn append(
        &self, owner: &str, message_cid: &str, indexes: BTreeMap<String, Value>,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Returns every event appended to `owner`'s log after `since`.
    fn events_since(
        &self, owner: &str, since: Option<Cursor>,
    ) -> impl Future<Output = Result<Vec<(Cursor, Event)>>> + Send;

    /// Removes events by message CID from `owner`'s log.
    fn delete_by_cid(&self, owner: &str, message_cids: &[String]) -> impl Future<Output = Result<()>> + Send;
}

/// An [`EventLog`] backed by a [`Kv`], one `events` partition per tenant.
#[derive(Clone)]
pub struct KvEventLog<K> {
    kv: K,
}

impl<K: Kv> KvEventLog<K> {
    /// Creates an event log rooted at the `events` partition of `kv`.
    pub fn new(kv: K) -> Self {
        Self { kv: kv.partition("events") }
    }

    fn tenant(&self, owner: &str) -> K {
        self.kv.partition(owner)
    }
}

impl<K: Kv> EventLog for KvEventLog<K> {
    async fn append(&self, owner: &str, message_cid: &str, indexes: BTreeMap<String, Value>) -> Result<u64> {
        append(&self.tenant(owner), message_cid, indexes).await
    }

    async fn events_since(&self, owner: &str, since: Option<Cursor>) -> Result<Vec<(Cursor, Event)>> {
        events_since(&self.tenant(owner), since).await
    }

    async fn delete_by_cid(&self, owner: &str, message_cids: &[String]) -> Result<()> {
        delete_by_cid(&self.tenant(owner), message_cids).await
    }
}

/// A live tail of the event log, used to implement `Subscribe` handlers: a
/// process-wide broadcast of newly appended events, independent of the
/// durable log used for replay.
pub trait EventStream: Send + Sync {
    /// Publishes an event to current subscribers. Has no effect if nobody is
    /// subscribed.
    fn publish(&self, owner: &str, event: Event) -> impl Future<Output = Result<()>> + Send;

    /// Subscribes to future events for `owner`.
    fn subscribe(
        &self, owner: &str,
    ) -> impl Future<Output = Result<tokio::sync::broadcast::Receiver<Event>>> + Send;
}

/// An [`EventStream`] backed by one `tokio::sync::broadcast` channel per
/// tenant, created lazily and kept for the process's lifetime.
#[derive(Clone, Default)]
pub struct BroadcastEventStream {
    channels: std::sync::Arc<std::sync::Mutex<BTreeMap<String, tokio::sync::broadcast::Sender<Event>>>>,
}

impl BroadcastEventStream {
    /// Creates an empty event stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, owner: &str) -> tokio::sync::broadcast::Sender<Event> {
        let mut channels = self.channels.lock().expect("lock poisoned");
        channels
            .entry(owner.to_string())
            .or_insert_with(|| tokio::sync::broadcast::channel(1024).0)
            .clone()
    }
}

impl EventStream for BroadcastEventStream {
    async fn publish(&self, owner: &str, event: Event) -> Result<()> {
        // No subscribers is not an error: the log itself is the durable record.
        let _ = self.sender(owner).send(event);
        Ok(())
    }

    async fn subscribe(&self, owner: &str) -> Result<tokio::sync::broadcast::Receiver<Event>> {
        Ok(self.sender(owner).subscribe())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::kv::MemKv;

    #[tokio::test]
    async fn append_and_read_in_order() {
        let kv = MemKv::new();
        append(&kv, "cid1", BTreeMap::from([("k".to_string(), json!(1))])).await.unwrap();
        append(&kv, "cid2", BTreeMap::from([("k".to_string(), json!(2))])).await.unwrap();

        let events = events_since(&kv, None).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].1.message_cid, "cid1");
        assert_eq!(events[1].1.message_cid, "cid2");
    }

    #[tokio::test]
    async fn since_cursor_excludes_prior_events() {
        let kv = MemKv::new();
        let seq1 = append(&kv, "cid1", BTreeMap::new()).await.unwrap();
        append(&kv, "cid2", BTreeMap::new()).await.unwrap();

        let events = events_since(&kv, Some(seq1)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.message_cid, "cid2");
    }

    #[tokio::test]
    async fn delete_by_cid_removes_event() {
        let kv = MemKv::new();
        append(&kv, "cid1", BTreeMap::new()).await.unwrap();
        delete_by_cid(&kv, &["cid1".to_string()]).await.unwrap();
        assert!(events_since(&kv, None).await.unwrap().is_empty());
    }
}

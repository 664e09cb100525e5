//! # Event
//!
//! Subscription plumbing shared by `RecordsSubscribe` and `MessagesSubscribe`:
//! a filter that is evaluated against the flattened index properties stored
//! alongside each published event, and a `Stream` wrapper handed back to
//! local clients.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::MessagesFilter;
use crate::records::{RecordsFilter, TagFilter};
use crate::OneOrMany;

/// A published store event: the CID of the message and the index properties
/// it was stored under.
pub use crate::store::events::Event;

/// Filter to use when subscribing to events.
#[derive(Debug, Deserialize, Serialize)]
#[allow(missing_docs)]
pub enum SubscribeFilter {
    Messages(Vec<MessagesFilter>),
    Records(RecordsFilter),
}

impl Default for SubscribeFilter {
    fn default() -> Self {
        Self::Messages(Vec::default())
    }
}

/// Used by local clients to handle events subscribed to.
pub struct Subscriber {
    inner: Pin<Box<dyn Stream<Item = Event> + Send>>,
}

impl Default for Subscriber {
    fn default() -> Self {
        Self { inner: Box::pin(futures::stream::empty()) }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").finish()
    }
}

impl Subscriber {
    /// Wrap a provider's subscription stream for ease of surfacing to users.
    #[must_use]
    pub fn new(stream: Pin<Box<dyn Stream<Item = Event> + Send>>) -> Self {
        Self { inner: stream }
    }
}

impl Stream for Subscriber {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl SubscribeFilter {
    /// Check the event matches the filter.
    #[must_use]
    pub fn is_match(&self, event: &Event) -> bool {
        match self {
            Self::Messages(filters) => filters.iter().any(|f| f.is_match(&event.indexes)),
            Self::Records(filter) => {
                if event.indexes.get("interface").and_then(Value::as_str) != Some("Records") {
                    return false;
                }
                filter.is_match(&event.indexes)
            }
        }
    }
}

impl RecordsFilter {
    #[allow(clippy::too_many_lines)]
    pub(crate) fn is_match(&self, indexes: &std::collections::BTreeMap<String, Value>) -> bool {
        let author_list = self.author.as_ref().map(OneOrMany::to_vec).unwrap_or_default();
        if !author_list.is_empty() {
            let Some(actual) = indexes.get("author").and_then(Value::as_str) else {
                return false;
            };
            if !author_list.iter().any(|a| a == actual) {
                return false;
            }
        }
        if let Some(attester) = &self.attester {
            if indexes.get("attester").and_then(Value::as_str) != Some(attester.as_str()) {
                return false;
            }
        }
        let recipient_list = self.recipient.as_ref().map(OneOrMany::to_vec).unwrap_or_default();
        if !recipient_list.is_empty() {
            let Some(actual) = indexes.get("recipient").and_then(Value::as_str) else {
                return false;
            };
            if !recipient_list.iter().any(|r| r == actual) {
                return false;
            }
        }
        if let Some(protocol) = &self.protocol {
            if indexes.get("protocol").and_then(Value::as_str) != Some(protocol.as_str()) {
                return false;
            }
        }
        if let Some(protocol_path) = &self.protocol_path {
            if indexes.get("protocolPath").and_then(Value::as_str) != Some(protocol_path.as_str())
            {
                return false;
            }
        }
        if let Some(published) = self.published {
            if indexes.get("published").and_then(Value::as_bool) != Some(published) {
                return false;
            }
        }
        if let Some(context_id) = &self.context_id {
            if indexes.get("contextId").and_then(Value::as_str) != Some(context_id.as_str()) {
                return false;
            }
        }
        if let Some(schema) = &self.schema {
            if indexes.get("schema").and_then(Value::as_str) != Some(schema.as_str()) {
                return false;
            }
        }
        if let Some(record_id) = &self.record_id {
            if indexes.get("recordId").and_then(Value::as_str) != Some(record_id.as_str()) {
                return false;
            }
        }
        if let Some(parent_id) = &self.parent_id {
            if indexes.get("parentId").and_then(Value::as_str) != Some(parent_id.as_str()) {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            for (property, filter) in tags {
                let value = indexes.get(&format!("tag.{property}")).unwrap_or(&Value::Null);
                if !filter.is_match(value) {
                    return false;
                }
            }
        }
        if let Some(data_format) = &self.data_format {
            if indexes.get("dataFormat").and_then(Value::as_str) != Some(data_format.as_str()) {
                return false;
            }
        }
        if let Some(data_size) = &self.data_size {
            let Some(size) = indexes.get("dataSize").and_then(Value::as_u64) else {
                return false;
            };
            if !data_size.contains(&(size as usize)) {
                return false;
            }
        }
        if let Some(data_cid) = &self.data_cid {
            if indexes.get("dataCid").and_then(Value::as_str) != Some(data_cid.as_str()) {
                return false;
            }
        }
        if !date_matches(self.date_created.as_ref(), indexes.get("dateCreated")) {
            return false;
        }
        if !date_matches(self.date_published.as_ref(), indexes.get("datePublished")) {
            return false;
        }
        // A record's `dateUpdated` is the `messageTimestamp` of its latest write; no
        // separate index property is stored for it.
        if !date_matches(self.date_updated.as_ref(), indexes.get("messageTimestamp")) {
            return false;
        }

        true
    }
}

fn date_matches(range: Option<&crate::DateRange>, value: Option<&Value>) -> bool {
    let Some(range) = range else {
        return true;
    };
    let Some(date) = value.and_then(Value::as_str).and_then(|s| s.parse::<DateTime<Utc>>().ok())
    else {
        return false;
    };
    range.contains(&date)
}

impl TagFilter {
    fn is_match(&self, tag: &Value) -> bool {
        match self {
            Self::StartsWith(value) => {
                let tag = tag.as_str().unwrap_or_default();
                tag.starts_with(value)
            }
            Self::Range(range) => {
                let tag = tag.as_u64().unwrap_or_default();
                range.contains(&usize::try_from(tag).unwrap_or_default())
            }
            Self::Equal(value) => tag == value,
        }
    }
}

impl MessagesFilter {
    pub(crate) fn is_match(&self, indexes: &std::collections::BTreeMap<String, Value>) -> bool {
        if let Some(interface) = self.interface {
            if indexes.get("interface").and_then(Value::as_str) != Some(interface.to_string().as_str()) {
                return false;
            }
        }
        if let Some(method) = self.method {
            if indexes.get("method").and_then(Value::as_str) != Some(method.to_string().as_str()) {
                return false;
            }
        }
        if let Some(protocol) = &self.protocol {
            if indexes.get("protocol").and_then(Value::as_str) != Some(protocol.as_str()) {
                return false;
            }
        }
        if !date_matches(self.message_timestamp.as_ref(), indexes.get("messageTimestamp")) {
            return false;
        }

        true
    }
}

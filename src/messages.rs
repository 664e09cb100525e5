//! # Messages
//!
//! Tenant-wide message/event lookup: `MessagesQuery` fetches the CIDs of
//! messages matching a filter since an optional cursor, and `MessagesRead`
//! fetches a single message (and its data, for `RecordsWrite`) by CID.

pub mod query;
pub mod read;
pub mod subscribe;

pub use self::query::{Query, QueryBuilder, QueryDescriptor, QueryReply};
pub use self::read::{Read, ReadDescriptor, ReadReply};
pub use self::subscribe::{Subscribe, SubscribeBuilder, SubscribeDescriptor, SubscribeReply};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{DateRange, Interface, Method};

/// Filter accepted by `MessagesQuery`/`MessagesSubscribe`: matches on the
/// message's interface, method, protocol, and/or `messageTimestamp`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesFilter {
    /// Restrict to messages of the given interface.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<Interface>,

    /// Restrict to messages invoking the given method.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,

    /// Restrict to messages belonging to the given protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Restrict to messages whose `messageTimestamp` falls within the range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_timestamp: Option<DateRange>,
}

impl MessagesFilter {
    /// Returns a new, unconstrained filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given interface.
    #[must_use]
    pub const fn interface(mut self, interface: Interface) -> Self {
        self.interface = Some(interface);
        self
    }

    /// Restrict to the given method.
    #[must_use]
    pub const fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Restrict to the given protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Restrict to the given `messageTimestamp` range.
    #[must_use]
    pub const fn message_timestamp(mut self, range: DateRange) -> Self {
        self.message_timestamp = Some(range);
        self
    }

    /// Converts this filter into the index engine's representation (§4.2),
    /// for use as one disjunct of a [`crate::store::index::query`] call.
    /// Candidates it returns are still re-checked against [`Self::is_match`].
    pub(crate) fn to_store_filter(&self) -> crate::store::index::Filter {
        use crate::store::index::{Filter, FilterVal, ValueRange};

        let mut filter = Filter::default();
        if let Some(interface) = self.interface {
            filter.0.insert("interface".to_string(), FilterVal::Equal(Value::String(interface.to_string())));
        }
        if let Some(method) = self.method {
            filter.0.insert("method".to_string(), FilterVal::Equal(Value::String(method.to_string())));
        }
        if let Some(protocol) = &self.protocol {
            filter.0.insert("protocol".to_string(), FilterVal::Equal(Value::String(protocol.clone())));
        }
        if let Some(range) = &self.message_timestamp {
            filter.0.insert(
                "messageTimestamp".to_string(),
                FilterVal::Range(ValueRange {
                    gte: range.lower.map(|d| Value::String(d.to_rfc3339())),
                    lte: range.upper.map(|d| Value::String(d.to_rfc3339())),
                    ..Default::default()
                }),
            );
        }
        filter
    }
}

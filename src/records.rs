//! # Records

mod delete;
pub(crate) mod protocol;
mod query;
mod read;
mod subscribe;
pub(crate) mod write;

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::delete::{Delete, DeleteBuilder, DeleteDescriptor};
pub use self::query::{Query, QueryBuilder, QueryDescriptor};
pub use self::read::{Read, ReadBuilder, ReadDescriptor};
pub use self::subscribe::{Subscribe, SubscribeBuilder, SubscribeDescriptor, SubscribeReply};
pub use self::write::{
    Attestation, Data, DelegatedGrant, SignaturePayload, Write, WriteBuilder, WriteDescriptor,
};
pub use crate::data::DataStream;
use crate::{DateRange, Lower, OneOrMany, Range, Result, Upper, utils};

/// Records filter.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsFilter {
    /// Get a single object by its ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,

    /// Records matching the specified author.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<OneOrMany<String>>,

    /// Records matching the specified creator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attester: Option<String>,

    /// Records matching the specified recipient(s).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<OneOrMany<String>>,

    /// Records with the specified context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// The CID of the parent object .
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Entry matching the specified protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Entry protocol path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_path: Option<String>,

    /// Records with the specified schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// The MIME type of the requested data. For example, `application/json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_format: Option<String>,

    /// Match records with the specified tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, TagFilter>>,

    /// CID of the data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_cid: Option<String>,

    /// Records with a size within the range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_size: Option<Range<usize>>,

    /// Whether the record is published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,

    /// Filter messages published within the specified range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_published: Option<DateRange>,

    /// Filter messages created within the specified range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_created: Option<DateRange>,

    /// Match messages updated within the specified range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_updated: Option<DateRange>,
}

/// A byte-size range, used both by `dataSize` filters and by a protocol
/// rule set's `$size` constraint.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SizeRange {
    /// Minimum size in bytes, inclusive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<usize>,
    /// Maximum size in bytes, inclusive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<usize>,
}

impl SizeRange {
    /// Whether `size` falls within this range.
    #[must_use]
    pub fn contains(&self, size: usize) -> bool {
        self.min.is_none_or(|min| size >= min) && self.max.is_none_or(|max| size <= max)
    }
}

impl RecordsFilter {
    /// Normalizes `RecordsFilter` protocol and schema URLs within a provided.
    pub(crate) fn normalize(&self) -> Result<Self> {
        let mut filter = self.clone();
        filter.protocol = if let Some(protocol) = &self.protocol {
            Some(utils::clean_url(protocol)?)
        } else {
            None
        };
        filter.schema =
            if let Some(schema) = &self.schema { Some(utils::clean_url(schema)?) } else { None };

        Ok(filter)
    }

    /// Converts this filter into the index engine's representation (§4.2):
    /// every constrained property becomes a condition in one conjunction, so
    /// the query planner can pick the most selective search property from
    /// the full set rather than just the first one found. Candidates it
    /// returns are still re-checked against [`Self::is_match`], which also
    /// covers conditions that have no direct index counterpart (tag
    /// `startsWith`, `dateUpdated`).
    pub(crate) fn to_store_filter(&self) -> crate::store::index::Filter {
        use crate::store::index::{Filter, FilterVal, ValueRange};

        fn date_range(range: &DateRange) -> ValueRange {
            ValueRange {
                gte: range.lower.map(|d| Value::String(d.to_rfc3339())),
                lte: range.upper.map(|d| Value::String(d.to_rfc3339())),
                ..Default::default()
            }
        }

        fn usize_range(range: &Range<usize>) -> ValueRange {
            let mut out = ValueRange::default();
            match &range.lower {
                Some(Lower::Inclusive(v)) => out.gte = Some(Value::from(*v)),
                Some(Lower::Exclusive(v)) => out.gt = Some(Value::from(*v)),
                None => {}
            }
            match &range.upper {
                Some(Upper::Inclusive(v)) => out.lte = Some(Value::from(*v)),
                Some(Upper::Exclusive(v)) => out.lt = Some(Value::from(*v)),
                None => {}
            }
            out
        }

        let mut filter = Filter::default();
        if let Some(record_id) = &self.record_id {
            filter.0.insert("recordId".to_string(), FilterVal::Equal(Value::String(record_id.clone())));
        }
        if let Some(attester) = &self.attester {
            filter.0.insert("attester".to_string(), FilterVal::Equal(Value::String(attester.clone())));
        }
        if let Some(parent_id) = &self.parent_id {
            filter.0.insert("parentId".to_string(), FilterVal::Equal(Value::String(parent_id.clone())));
        }
        if let Some(recipient) = &self.recipient {
            let values = recipient.to_vec().into_iter().map(Value::String).collect();
            filter.0.insert("recipient".to_string(), FilterVal::OneOf(values));
        }
        if let Some(context_id) = &self.context_id {
            filter.0.insert("contextId".to_string(), FilterVal::Equal(Value::String(context_id.clone())));
        }
        if let Some(protocol) = &self.protocol {
            filter.0.insert("protocol".to_string(), FilterVal::Equal(Value::String(protocol.clone())));
        }
        if let Some(protocol_path) = &self.protocol_path {
            filter.0.insert("protocolPath".to_string(), FilterVal::Equal(Value::String(protocol_path.clone())));
        }
        if let Some(schema) = &self.schema {
            filter.0.insert("schema".to_string(), FilterVal::Equal(Value::String(schema.clone())));
        }
        if let Some(data_format) = &self.data_format {
            filter.0.insert("dataFormat".to_string(), FilterVal::Equal(Value::String(data_format.clone())));
        }
        if let Some(data_cid) = &self.data_cid {
            filter.0.insert("dataCid".to_string(), FilterVal::Equal(Value::String(data_cid.clone())));
        }
        if let Some(author) = &self.author {
            let values = author.to_vec().into_iter().map(Value::String).collect();
            filter.0.insert("author".to_string(), FilterVal::OneOf(values));
        }
        if let Some(published) = self.published {
            filter.0.insert("published".to_string(), FilterVal::Equal(Value::Bool(published)));
        }
        if let Some(data_size) = &self.data_size {
            filter.0.insert("dataSize".to_string(), FilterVal::Range(usize_range(data_size)));
        }
        if let Some(range) = &self.date_created {
            filter.0.insert("dateCreated".to_string(), FilterVal::Range(date_range(range)));
        }
        if let Some(range) = &self.date_published {
            filter.0.insert("datePublished".to_string(), FilterVal::Range(date_range(range)));
        }
        if let Some(tags) = &self.tags {
            for (key, tag_filter) in tags {
                if let TagFilter::Equal(value) = tag_filter {
                    filter.0.insert(format!("tag.{key}"), FilterVal::Equal(value.clone()));
                }
            }
        }
        filter
    }
}

/// `EntryType` sort.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Sort {
    /// Sort `date_created` from oldest to newest.
    #[serde(rename="createdAscending")]
    CreatedAsc,

    /// Sort `date_created` newest to oldest.
    #[serde(rename="createdDescending")]
    CreatedDesc,

    /// Sort `date_published` from oldest to newest.
    #[serde(rename="publishedAscending")]
    PublishedAsc,

    /// Sort `date_published` from newest to oldest.
    #[serde(rename="publishedDescending")]
    PublishedDesc,

    /// Sort `message_timestamp` from oldest to newest.
    #[serde(rename="timestampAscending")]
    #[default]
    TimestampAsc,

    /// Sort `message_timestamp` from newest to oldest.
    #[serde(rename="timestampDescending")]
    TimestampDesc,
}

impl Display for Sort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreatedAsc | Self::CreatedDesc => write!(f, "dateCreated"),
            Self::PublishedAsc | Self::PublishedDesc => write!(f, "datePublished"),
            Self::TimestampAsc | Self::TimestampDesc => write!(f, "messageTimestamp"),
        }
    }
}

/// Tag filter.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TagFilter {
    /// Match tags starting with a string value.
    StartsWith(String),

    /// Filter tags by range.
    Range(Range<usize>),

    /// Filter by a specific value.
    Equal(Value),
}

impl Default for TagFilter {
    fn default() -> Self {
        Self::Equal(Value::Null)
    }
}

/// Implement  builder-like behaviour.
impl RecordsFilter {
    /// Returns a new [`RecordsFilter`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one or more authors to the filter.
    #[must_use]
    pub fn add_author(mut self, author: impl Into<String>) -> Self {
        match &mut self.author {
            Some(OneOrMany::Many(existing)) => {
                existing.push(author.into());
            }
            Some(OneOrMany::One(existing)) => {
                self.author = Some(OneOrMany::Many(vec![existing.clone(), author.into()]));
            }
            None => {
                self.author = Some(OneOrMany::One(author.into()));
            }
        }
        self
    }

    /// Add an attester to the filter.
    #[must_use]
    pub fn attester(mut self, attester: impl Into<String>) -> Self {
        self.attester = Some(attester.into());
        self
    }

    /// Add one or more recipients to the filter.
    #[must_use]
    pub fn add_recipient(mut self, recipient: impl Into<String>) -> Self {
        match &mut self.recipient {
            Some(OneOrMany::Many(existing)) => {
                existing.push(recipient.into());
            }
            Some(OneOrMany::One(existing)) => {
                self.recipient = Some(OneOrMany::Many(vec![existing.clone(), recipient.into()]));
            }
            None => {
                self.recipient = Some(OneOrMany::One(recipient.into()));
            }
        }
        self
    }

    /// Add a protocol to the filter.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Add a protocol path to the filter.
    #[must_use]
    pub fn protocol_path(mut self, protocol_path: impl Into<String>) -> Self {
        self.protocol_path = Some(protocol_path.into());
        self
    }

    /// Specify a protocol schema on the filter.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Add a published flag to the filter.
    #[must_use]
    pub const fn published(mut self, published: bool) -> Self {
        self.published = Some(published);
        self
    }

    /// Add a context ID to the filter.
    #[must_use]
    pub fn context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Add a record ID to the filter.
    #[must_use]
    pub fn record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Add a parent ID to the filter.
    #[must_use]
    pub fn parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Add a tag to the filter.
    #[must_use]
    pub fn add_tag(mut self, key: impl Into<String>, value: TagFilter) -> Self {
        if let Some(existing) = &mut self.tags {
            existing.insert(key.into(), value);
        } else {
            let mut tags = BTreeMap::new();
            tags.insert(key.into(), value);
            self.tags = Some(tags);
        }
        self
    }

    /// Add a data format to the filter.
    #[must_use]
    pub fn data_format(mut self, data_format: impl Into<String>) -> Self {
        self.data_format = Some(data_format.into());
        self
    }

    /// Add a data size to the filter.
    #[must_use]
    pub const fn data_size(mut self, data_size: Range<usize>) -> Self {
        self.data_size = Some(data_size);
        self
    }

    /// Add a data CID to the filter.
    #[must_use]
    pub fn data_cid(mut self, data_cid: impl Into<String>) -> Self {
        self.data_cid = Some(data_cid.into());
        self
    }

    /// Add a date created to the filter.
    #[must_use]
    pub const fn date_created(mut self, date_created: DateRange) -> Self {
        self.date_created = Some(date_created);
        self
    }

    /// Add a date published to the filter.
    #[must_use]
    pub const fn date_published(mut self, date_published: DateRange) -> Self {
        self.date_published = Some(date_published);
        self
    }

    /// Add a date updated to the filter.
    #[must_use]
    pub const fn date_updated(mut self, date_updated: DateRange) -> Self {
        self.date_updated = Some(date_updated);
        self
    }
}

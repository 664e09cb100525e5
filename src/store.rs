//! Storage layer: the ordered KV wrapper (C1), the index engine (C2), the
//! message store (C3), the event log (C4), and the external data store seam,
//! plus the [`Entry`]/[`EntryType`] envelope every stored message is wrapped
//! in. See design notes §4.1-§4.4.

pub mod data;
pub mod events;
pub mod index;
pub mod kv;
pub mod message;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub use self::index::Cursor;
use crate::protocols::Configure;
use crate::records::{Delete, Write};
use crate::{Descriptor, Result, unexpected};

/// The message carried by a stored [`Entry`].
#[derive(Clone, Debug)]
pub enum EntryType {
    /// A `RecordsWrite` message.
    Write(Write),
    /// A `RecordsDelete` message.
    Delete(Delete),
    /// A `ProtocolsConfigure` message.
    Configure(Configure),
}

impl EntryType {
    /// The message's common descriptor fields.
    #[must_use]
    pub fn descriptor(&self) -> &Descriptor {
        match self {
            Self::Write(w) => &w.descriptor.base,
            Self::Delete(d) => &d.descriptor.base,
            Self::Configure(c) => &c.descriptor.base,
        }
    }
}

impl Serialize for EntryType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Write(w) => w.serialize(serializer),
            Self::Delete(d) => d.serialize(serializer),
            Self::Configure(c) => c.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for EntryType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let method = value
            .pointer("/descriptor/method")
            .and_then(Value::as_str)
            .ok_or_else(|| D::Error::custom("missing descriptor.method"))?;

        match method {
            "Write" => Ok(Self::Write(serde_json::from_value(value).map_err(D::Error::custom)?)),
            "Delete" => Ok(Self::Delete(serde_json::from_value(value).map_err(D::Error::custom)?)),
            "Configure" => {
                Ok(Self::Configure(serde_json::from_value(value).map_err(D::Error::custom)?))
            }
            other => Err(D::Error::custom(format!("unsupported stored message method `{other}`"))),
        }
    }
}

/// A stored message, paired with the flattened property index extracted from
/// it at write time (used by [`index`] for query planning and by [`events`]
/// for subscription filter matching).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    /// The stored message.
    pub message: EntryType,
    /// The flattened index properties extracted from the message.
    pub indexes: std::collections::BTreeMap<String, Value>,
}

impl Entry {
    /// The message's common descriptor fields.
    #[must_use]
    pub fn descriptor(&self) -> &Descriptor {
        self.message.descriptor()
    }

    /// The CID of the underlying message.
    ///
    /// # Errors
    /// Returns an error if the message cannot be CBOR-encoded.
    pub fn cid(&self) -> Result<String> {
        match &self.message {
            EntryType::Write(w) => crate::cid::compute_cid(w),
            EntryType::Delete(d) => crate::cid::compute_cid(d),
            EntryType::Configure(c) => crate::cid::compute_cid(c),
        }
    }

    /// Borrows the entry as a `RecordsWrite`, if that's what it holds.
    #[must_use]
    pub const fn as_write(&self) -> Option<&Write> {
        match &self.message {
            EntryType::Write(w) => Some(w),
            _ => None,
        }
    }

    /// Borrows the entry as a `RecordsDelete`, if that's what it holds.
    #[must_use]
    pub const fn as_delete(&self) -> Option<&Delete> {
        match &self.message {
            EntryType::Delete(d) => Some(d),
            _ => None,
        }
    }
}

impl TryFrom<&Entry> for Write {
    type Error = crate::Error;

    fn try_from(entry: &Entry) -> Result<Self> {
        entry.as_write().cloned().ok_or_else(|| unexpected!("expected a `RecordsWrite` entry"))
    }
}

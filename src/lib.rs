//! # `dwn-core`
//!
//! Core of a Decentralized Web Node: a per-tenant, DID-addressable message
//! store with an indexed query planner, protocol-based authorization, and
//! latest-writer-wins conflict resolution for record chains.
//!
//! The crate is organised around the data flow described in the project
//! design notes: a [`dwn::Dwn`] holds the pluggable collaborators (KV
//! engines, DID resolvers) behind a [`provider::Provider`], and
//! [`endpoint::handle`] routes a parsed [`endpoint::Message`] through
//! validation, authorization, and storage.
//!
//! Interfaces and their handlers live under [`records`], [`protocols`],
//! [`permissions`], and [`messages`]; the storage/index/event layers live
//! under [`store`] and [`event`]; DID resolution and signature verification
//! live under [`did`] and [`auth`].

pub mod auth;
pub mod cid;
pub mod data;
pub mod did;
pub mod dwn;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod messages;
pub mod permissions;
pub mod protocols;
pub mod provider;
pub mod records;
pub mod schema;
pub mod store;
pub mod utils;

pub use dwn::{Dwn, DwnConfig};
pub use endpoint::Message;
pub use error::{Error, Result};

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A value that is either a single item or a list of items, used throughout
/// the wire format wherever a field accepts one-or-many (e.g. `author`,
/// `recipient`).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// A single value.
    One(T),
    /// Multiple values.
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    /// Flatten into a `Vec`.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            Self::One(t) => vec![t.clone()],
            Self::Many(t) => t.clone(),
        }
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

/// A lower bound: inclusive (`gte`) or exclusive (`gt`).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Lower<T> {
    /// `>=`
    Inclusive(T),
    /// `>`
    Exclusive(T),
}

/// An upper bound: inclusive (`lte`) or exclusive (`lt`).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Upper<T> {
    /// `<=`
    Inclusive(T),
    /// `<`
    Exclusive(T),
}

/// A generic range filter, used both for raw values (already-encoded index
/// strings) and for dates (after conversion via [`DateRange`]).
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Range<T> {
    /// Lower bound, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lower: Option<Lower<T>>,
    /// Upper bound, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upper: Option<Upper<T>>,
}

impl<T> Range<T> {
    /// An unbounded range.
    #[must_use]
    pub const fn new() -> Self {
        Self { lower: None, upper: None }
    }
}

impl<T: PartialOrd> Range<T> {
    /// Does the range contain `val`?
    #[must_use]
    pub fn contains(&self, val: &T) -> bool {
        let lower_ok = match &self.lower {
            Some(Lower::Inclusive(l)) => val >= l,
            Some(Lower::Exclusive(l)) => val > l,
            None => true,
        };
        let upper_ok = match &self.upper {
            Some(Upper::Inclusive(u)) => val <= u,
            Some(Upper::Exclusive(u)) => val < u,
            None => true,
        };
        lower_ok && upper_ok
    }
}

/// A date range, as used by `dateCreated`/`datePublished`/`dateUpdated`
/// filters. Field names (`from`/`to`) match the wire format used by record
/// filters.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DateRange {
    /// Start of the range (inclusive).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lower: Option<DateTime<Utc>>,
    /// End of the range (inclusive).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upper: Option<DateTime<Utc>>,
}

impl DateRange {
    /// A date range with only a lower bound.
    #[must_use]
    pub const fn from(lower: DateTime<Utc>) -> Self {
        Self { lower: Some(lower), upper: None }
    }

    /// A date range with only an upper bound.
    #[must_use]
    pub const fn to(upper: DateTime<Utc>) -> Self {
        Self { lower: None, upper: Some(upper) }
    }

    /// Does the range contain the given instant?
    #[must_use]
    pub fn contains(&self, when: &DateTime<Utc>) -> bool {
        if let Some(lower) = &self.lower {
            if when < lower {
                return false;
            }
        }
        if let Some(upper) = &self.upper {
            if when > upper {
                return false;
            }
        }
        true
    }
}

/// The four top-level interfaces a message may target.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum Interface {
    /// Record storage and retrieval.
    #[default]
    Records,
    /// Protocol definitions.
    Protocols,
    /// Tenant-wide message/event lookup.
    Messages,
}

impl Display for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Records => write!(f, "Records"),
            Self::Protocols => write!(f, "Protocols"),
            Self::Messages => write!(f, "Messages"),
        }
    }
}

/// The method of a message, scoped within its [`Interface`].
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum Method {
    /// Create or update a record.
    #[default]
    Write,
    /// Query for records/messages matching a filter.
    Query,
    /// Read a single record/message.
    Read,
    /// Delete a record.
    Delete,
    /// Subscribe to matching events.
    Subscribe,
    /// Configure a protocol definition.
    Configure,
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Write => write!(f, "Write"),
            Self::Query => write!(f, "Query"),
            Self::Read => write!(f, "Read"),
            Self::Delete => write!(f, "Delete"),
            Self::Subscribe => write!(f, "Subscribe"),
            Self::Configure => write!(f, "Configure"),
        }
    }
}

/// The portion of a message descriptor common to every interface/method.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// The interface the message targets.
    pub interface: Interface,

    /// The method invoked on the interface.
    pub method: Method,

    /// The time the message was created, used for conflict resolution and
    /// sort ordering.
    pub message_timestamp: DateTime<Utc>,
}

//! # Protocols
//!
//! Protocol definitions: the rule sets record writes are authorized
//! against (C8 consumes these), configured via `ProtocolsConfigure` and
//! looked up by `ProtocolsQuery`.

pub mod configure;
mod query;

pub use self::configure::{
    Action, ActionRule, Actor, Configure, ConfigureBuilder, ConfigureDescriptor, ConfigureReply,
    PathEncryption, ProtocolDefinition, RuleSet, Tags, Type,
};
pub use self::query::{ProtocolFilter, Query, QueryBuilder, QueryDescriptor, QueryReply};

/// The protocol URI of the internal, first-class protocol DWN uses for its
/// own permission grants (requests, grants, and revocations are themselves
/// `RecordsWrite` messages under this protocol).
pub const PERMISSIONS_PROTOCOL_URI: &str = "https://tbd.website/dwn/permissions";

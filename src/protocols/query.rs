//! `ProtocolsQuery`: looks up installed protocol definitions, scoped to
//! published definitions for non-owners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::{Authorization, AuthorizationBuilder, Signer};
use crate::endpoint::{Message, Reply};
use crate::protocols::Configure;
use crate::provider::{MessageStore, Provider};
use crate::store::EntryType;
use crate::{Descriptor, Interface, Method, Result};

/// A `ProtocolsQuery` message: looks up installed protocol definitions by
/// (optional) protocol URI.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// The Query descriptor.
    pub descriptor: QueryDescriptor,

    /// The message authorization, if the caller is authenticated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

/// `ProtocolsQuery` descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// Restricts results to a single protocol URI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<ProtocolFilter>,
}

/// Filter accepted by `ProtocolsQuery`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolFilter {
    /// The protocol URI to match.
    pub protocol: String,
}

impl Message for Query {
    type Reply = QueryReply;

    fn cid(&self) -> Result<String> {
        crate::cid::compute_cid(self)
    }

    fn descriptor(&self) -> &Descriptor {
        &self.descriptor.base
    }

    fn authorization(&self) -> Option<&Authorization> {
        self.authorization.as_ref()
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

/// Handles a `ProtocolsQuery`: owners see every definition, non-owners
/// (including anonymous callers) see only published ones.
///
/// # Errors
/// Returns an error if the authorization signature is present but invalid.
pub async fn handle(owner: &str, query: Query, provider: &impl Provider) -> Result<Reply<QueryReply>> {
    let is_owner = match &query.authorization {
        Some(auth) => {
            auth.verify(provider, provider.signature_cache()).await?;
            auth.signer()? == owner
        }
        None => false,
    };

    use crate::store::index::{Filter, FilterVal, QueryOptions};
    let mut filter = Filter::default();
    filter.0.insert("method".to_string(), FilterVal::Equal(Value::String(Method::Configure.to_string())));
    if let Some(f) = &query.descriptor.filter {
        filter.0.insert("protocol".to_string(), FilterVal::Equal(Value::String(f.protocol.clone())));
    }
    let opts = QueryOptions {
        sort_property: "messageTimestamp".to_string(),
        reverse: false,
        limit: None,
        cursor: None,
    };

    let (entries, cursor) = MessageStore::query(provider, owner, &[filter], &opts).await?;
    let mut configures = Vec::new();
    for entry in entries {
        if let EntryType::Configure(configure) = entry.message {
            if is_owner || configure.descriptor.definition.published {
                configures.push(configure);
            }
        }
    }

    Ok(Reply::ok(QueryReply { entries: configures, cursor }))
}

/// Reply to a `ProtocolsQuery`: the matching definitions and a pagination
/// cursor, if the result was truncated.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReply {
    /// Matching protocol definitions.
    pub entries: Vec<Configure>,

    /// Cursor for the next page, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<crate::store::Cursor>,
}

/// Builds a `ProtocolsQuery` message.
#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    filter: Option<ProtocolFilter>,
    message_timestamp: Option<DateTime<Utc>>,
    authorize: Option<bool>,
}

impl QueryBuilder {
    /// Returns a new, empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the query to the given protocol URI.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.filter = Some(ProtocolFilter { protocol: protocol.into() });
        self
    }

    /// Specify whether to attach an authorization envelope. Defaults to
    /// `true`; set `false` to query anonymously for published protocols.
    #[must_use]
    pub const fn authorize(mut self, authorize: bool) -> Self {
        self.authorize = Some(authorize);
        self
    }

    /// Signs and builds the query message.
    ///
    /// # Errors
    /// Returns an error if the descriptor cannot be CID-encoded or signing
    /// fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Query> {
        let descriptor = QueryDescriptor {
            base: Descriptor {
                interface: Interface::Protocols,
                method: Method::Query,
                message_timestamp: self.message_timestamp.unwrap_or_else(Utc::now),
            },
            filter: self.filter,
        };

        let authorization = if self.authorize.unwrap_or(true) {
            let auth_builder = AuthorizationBuilder::new()
                .descriptor_cid(crate::cid::compute_cid(&descriptor)?);
            Some(auth_builder.build(signer).await?)
        } else {
            None
        };

        Ok(Query { descriptor, authorization })
    }
}

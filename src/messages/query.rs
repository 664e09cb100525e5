//! `MessagesQuery`: looks up the CIDs of persisted messages (of any
//! interface/method) matching a filter, since an optional cursor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MessagesFilter;
use crate::auth::{Authorization, AuthorizationBuilder, Signer};
use crate::endpoint::{Message, Reply};
use crate::permissions;
use crate::provider::{MessageStore, Provider};
use crate::store::Cursor;
use crate::store::index::QueryOptions;
use crate::{Descriptor, Interface, Method, Result, forbidden};

/// A `MessagesQuery` message: looks up message CIDs matching a filter.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// The `Query` descriptor.
    pub descriptor: QueryDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

/// `MessagesQuery` descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// Filters to apply when querying for messages; a message matching any
    /// filter in the list is included (disjunction). An empty list matches
    /// every message.
    pub filters: Vec<MessagesFilter>,

    /// The pagination cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
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
        Some(&self.authorization)
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

impl Query {
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        self.authorization.verify(provider, provider.signature_cache()).await?;

        let author = self.authorization.author()?;
        if author == owner {
            return Ok(());
        }

        let Some(grant_id) = &self.authorization.payload()?.permission_grant_id else {
            return Err(forbidden!("author has no grant"));
        };
        let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
        grant.verify(owner, &author, self.descriptor(), provider).await?;

        // a protocol-scoped grant may only be used to query within that protocol
        if let Some(protocol) = grant.data.scope.protocol() {
            for filter in &self.descriptor.filters {
                if filter.protocol.as_deref() != Some(protocol) {
                    return Err(forbidden!("filter and grant protocols do not match"));
                }
            }
        }

        Ok(())
    }
}

/// Handles a `MessagesQuery`: returns the CIDs of persisted messages matching
/// any of the request's filters, ordered by `messageTimestamp`.
///
/// # Errors
/// Returns an error if authorization fails or the store cannot be queried.
pub async fn handle(
    owner: &str, query: Query, provider: &impl Provider,
) -> Result<Reply<QueryReply>> {
    query.authorize(owner, provider).await?;

    let opts = QueryOptions {
        sort_property: "messageTimestamp".to_string(),
        reverse: false,
        limit: None,
        cursor: query.descriptor.cursor.clone(),
    };

    let store_filters: Vec<_> =
        query.descriptor.filters.iter().map(super::MessagesFilter::to_store_filter).collect();
    let (entries, cursor) = MessageStore::query(provider, owner, &store_filters, &opts).await?;

    let mut message_cids = Vec::new();
    for entry in &entries {
        let matches = query.descriptor.filters.is_empty()
            || query.descriptor.filters.iter().any(|f| f.is_match(&entry.indexes));
        if matches {
            message_cids.push(entry.cid()?);
        }
    }

    let entries = if message_cids.is_empty() { None } else { Some(message_cids) };
    Ok(Reply::ok(QueryReply { entries, cursor }))
}

/// Reply to a `MessagesQuery`: matching message CIDs and a pagination
/// cursor, if the result was truncated.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReply {
    /// The CIDs of matching messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<String>>,

    /// Cursor for the next page, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// Builds a `MessagesQuery` message.
#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    filters: Vec<MessagesFilter>,
    cursor: Option<Cursor>,
    message_timestamp: Option<DateTime<Utc>>,
    permission_grant_id: Option<String>,
}

impl QueryBuilder {
    /// Returns a new, empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a filter; a message matching any added filter is included.
    #[must_use]
    pub fn add_filter(mut self, filter: MessagesFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Specifies a pagination cursor from a previous reply.
    #[must_use]
    pub fn cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Specifies the permission grant ID authorizing this query.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
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
                interface: Interface::Messages,
                method: Method::Query,
                message_timestamp: self.message_timestamp.unwrap_or_else(Utc::now),
            },
            filters: self.filters,
            cursor: self.cursor,
        };

        let mut auth_builder =
            AuthorizationBuilder::new().descriptor_cid(crate::cid::compute_cid(&descriptor)?);
        if let Some(id) = self.permission_grant_id {
            auth_builder = auth_builder.permission_grant_id(Some(id));
        }
        let authorization = auth_builder.build(signer).await?;

        Ok(Query { descriptor, authorization })
    }
}

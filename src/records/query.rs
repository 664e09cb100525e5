//! `RecordsQuery`: searches the tenant's records for those matching a
//! filter, returning each match's latest `RecordsWrite` alongside its
//! initial write (when they differ).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::{Authorization, AuthorizationBuilder, Signer};
use crate::endpoint::{Message, Reply};
use crate::permissions;
use crate::provider::{MessageStore, Provider};
use crate::records::protocol;
use crate::records::{DelegatedGrant, RecordsFilter, Sort, Write};
use crate::store::Cursor;
use crate::store::index::QueryOptions;
use crate::{Descriptor, Interface, Method, Result, forbidden, unexpected};

/// A `RecordsQuery` message: searches for records matching `filter`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// The Query descriptor.
    pub descriptor: QueryDescriptor,

    /// The message authorization. Absent when querying only published
    /// records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

/// `RecordsQuery` descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The filter records must match.
    pub filter: RecordsFilter,

    /// How matching records should be sorted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_sort: Option<Sort>,

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
        self.authorization.as_ref()
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

impl Query {
    /// Authorizes the query: unauthenticated requests are restricted to
    /// published records by the caller at [`handle`]; authenticated
    /// requests that invoke a permission grant or protocol role are
    /// checked here. Returns whether the grant/role authorized visibility
    /// into matching records beyond what ownership/authorship alone would
    /// give — such a caller's results are not further narrowed to
    /// published-or-authored records by [`handle`].
    async fn authorize(&self, owner: &str, author: &str, provider: &impl Provider) -> Result<bool> {
        let Some(authzn) = &self.authorization else {
            return Ok(false);
        };
        if author == owner {
            return Ok(false);
        }

        let payload = authzn.payload()?;
        if let Some(role) = &payload.protocol_role {
            let protocol = self
                .descriptor
                .filter
                .protocol
                .as_deref()
                .ok_or_else(|| forbidden!("missing protocol for role-authorized query"))?;
            protocol::authorize_role(
                owner,
                protocol,
                role,
                self.descriptor.filter.context_id.as_deref(),
                author,
                provider,
            )
            .await?;
            return Ok(true);
        }
        if let Some(grant_id) = &payload.permission_grant_id {
            let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
            grant.verify(owner, author, self.descriptor(), provider).await?;
            if let Some(protocol) = grant.data.scope.protocol() {
                if self.descriptor.filter.protocol.as_deref() != Some(protocol) {
                    return Err(forbidden!("grant and filter protocols do not match"));
                }
            }
            return Ok(true);
        }
        Ok(false)
    }
}

/// Handles a `RecordsQuery`: fetches matching records, restricting
/// unauthenticated or non-owner callers to records they authored, received,
/// or hold published/protocol-role/grant visibility into.
///
/// # Errors
/// Returns an error if authorization fails or the store cannot be queried.
pub async fn handle(owner: &str, query: Query, provider: &impl Provider) -> Result<Reply<QueryReply>> {
    let author = match &query.authorization {
        Some(authzn) => {
            authzn.verify(provider, provider.signature_cache()).await?;
            Some(authzn.author()?)
        }
        None => None,
    };

    let privileged = if let Some(author) = &author {
        query.authorize(owner, author, provider).await?
    } else {
        false
    };

    let sort = query.descriptor.date_sort.clone().unwrap_or_default();
    let reverse = matches!(sort, Sort::CreatedDesc | Sort::PublishedDesc | Sort::TimestampDesc);
    let opts = QueryOptions {
        sort_property: sort.to_string(),
        reverse,
        limit: None,
        cursor: query.descriptor.cursor.clone(),
    };

    let filter = query.descriptor.filter.normalize()?;

    // an anonymous caller explicitly asking for unpublished records can never
    // be shown any, so deny outright rather than silently returning nothing
    if author.is_none() && filter.published == Some(false) {
        return Err(forbidden!("anonymous caller may not query for unpublished records"));
    }

    let store_filter = filter.to_store_filter();
    let (all, cursor) = MessageStore::query(provider, owner, &[store_filter], &opts).await?;

    let is_owner = author.as_deref() == Some(owner);

    let mut entries = Vec::new();
    for entry in &all {
        let Some(write) = entry.as_write() else { continue };
        if !filter.is_match(&entry.indexes) {
            continue;
        }
        if !is_owner && !privileged {
            let published = write.descriptor.published.unwrap_or(false);
            let visible_to_author = author.as_deref().is_some_and(|a| {
                write.authorization.author().ok().as_deref() == Some(a)
                    || write.descriptor.recipient.as_deref() == Some(a)
            });
            if !published && !visible_to_author && author.is_some() {
                continue;
            }
            if !published && author.is_none() {
                continue;
            }
        }

        let initial_write = if write.is_initial()? {
            None
        } else {
            crate::records::write::initial_write(owner, &write.descriptor.record_id, provider)
                .await?
                .map(|mut iw| {
                    iw.encoded_data = None;
                    iw
                })
        };
        entries.push(QueryReplyEntry { write: write.clone(), initial_write });
    }

    let entries = if entries.is_empty() { None } else { Some(entries) };
    Ok(Reply::ok(QueryReply { entries, cursor }))
}

/// Reply to a `RecordsQuery`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReply {
    /// Matching records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<QueryReplyEntry>>,

    /// Pagination cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// A single `RecordsQuery` reply entry.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReplyEntry {
    /// The matching `RecordsWrite` message.
    #[serde(flatten)]
    pub write: Write,

    /// The record's initial write, if `write` is not itself the initial
    /// write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_write: Option<Write>,
}

/// Builds a `RecordsQuery` message.
#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    filter: RecordsFilter,
    date_sort: Option<Sort>,
    cursor: Option<Cursor>,
    message_timestamp: Option<DateTime<Utc>>,
    permission_grant_id: Option<String>,
    protocol_role: Option<String>,
    delegated_grant: Option<DelegatedGrant>,
    authorize: Option<bool>,
}

impl QueryBuilder {
    /// Returns a new, empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Specifies the filter records must match.
    #[must_use]
    pub fn filter(mut self, filter: RecordsFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Specifies how matching records should be sorted.
    #[must_use]
    pub fn date_sort(mut self, date_sort: Sort) -> Self {
        self.date_sort = Some(date_sort);
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

    /// Specifies a protocol role authorizing this query.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// The delegated grant used to sign this query.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: DelegatedGrant) -> Self {
        self.delegated_grant = Some(delegated_grant);
        self
    }

    /// Specify whether to attach an authorization envelope. Defaults to
    /// `true`; set `false` to build an anonymous query of published records.
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
                interface: Interface::Records,
                method: Method::Query,
                message_timestamp: self.message_timestamp.unwrap_or_else(Utc::now),
            },
            filter: self.filter.normalize()?,
            date_sort: self.date_sort,
            cursor: self.cursor,
        };

        let authorization = if self.authorize.unwrap_or(true) {
            let mut auth_builder = AuthorizationBuilder::new()
                .descriptor_cid(crate::cid::compute_cid(&descriptor)?);
            if let Some(id) = self.permission_grant_id {
                auth_builder = auth_builder.permission_grant_id(Some(id));
            }
            if let Some(role) = self.protocol_role {
                auth_builder = auth_builder.protocol_role(Some(role));
            }
            if let Some(delegated_grant) = self.delegated_grant {
                let value = serde_json::to_value(&delegated_grant)
                    .map_err(|e| unexpected!("failed to encode delegated grant: {e}"))?;
                auth_builder = auth_builder.delegated_grant(Some(value));
            }
            Some(auth_builder.build(signer).await?)
        } else {
            None
        };

        Ok(Query { descriptor, authorization })
    }
}

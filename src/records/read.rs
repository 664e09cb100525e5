//! # Read
//!
//! `Read` is a message type used to read a record in the web node.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::permissions;
use crate::provider::{DataStore, MessageStore, Provider, Signer};
use crate::records::protocol;
use crate::records::{DataStream, DelegatedGrant, Delete, RecordsFilter, Write};
use crate::store::index::{Filter, FilterVal, QueryOptions};
use crate::{Descriptor, Error, Interface, Method, Result, forbidden, unexpected};

/// Process `Read` message.
///
/// # Errors
/// Returns an error if no record matches the filter, authorization fails,
/// or storage access fails.
pub async fn handle(owner: &str, read: Read, provider: &impl Provider) -> Result<Reply<ReadReply>> {
    let record_id = read
        .descriptor
        .filter
        .record_id
        .as_deref()
        .ok_or_else(|| unexpected!("read filter must specify a record id"))?;

    let mut filter = Filter::default();
    filter.0.insert("recordId".to_string(), FilterVal::Equal(Value::String(record_id.to_string())));
    let opts = QueryOptions {
        sort_property: "messageTimestamp".to_string(),
        reverse: true,
        limit: Some(1),
        cursor: None,
    };
    let (entries, _) = MessageStore::query(provider, owner, &[filter], &opts).await?;
    let Some(latest) = entries.first() else {
        return Err(Error::NotFound("no matching records found".to_string()));
    };

    // if the matched message is a `RecordsDelete`, return 404 with both the
    // delete and the record's initial write so the caller can tell a
    // "never existed" apart from a "deleted" record
    if let Some(delete) = latest.as_delete() {
        let Some(mut initial_write) =
            crate::records::write::initial_write(owner, &delete.descriptor.record_id, provider).await?
        else {
            return Err(unexpected!("initial write for deleted record not found"));
        };
        read.authorize(owner, &initial_write, provider).await?;
        initial_write.encoded_data = None;

        return Ok(Reply {
            status: Status { code: StatusCode::NOT_FOUND.as_u16(), detail: None },
            body: Some(ReadReply {
                entry: ReadReplyEntry {
                    records_write: None,
                    records_delete: Some(delete.clone()),
                    initial_write: Some(initial_write),
                    data: None,
                },
            }),
        });
    }

    let mut write = Write::try_from(latest)?;
    read.authorize(owner, &write, provider).await?;

    let data = if let Some(encoded) = write.encoded_data.take() {
        let buffer = Base64UrlUnpadded::decode_vec(&encoded)
            .map_err(|e| unexpected!("invalid base64 data: {e}"))?;
        Some(DataStream::from(buffer))
    } else if let Some(bytes) = DataStore::get(provider, owner, &write.descriptor.data_cid).await? {
        Some(DataStream::from(bytes))
    } else {
        None
    };

    // attach initial write if latest RecordsWrite is not the initial write
    let initial_write = if write.is_initial()? {
        None
    } else {
        let Some(mut initial) =
            crate::records::write::initial_write(owner, &write.descriptor.record_id, provider).await?
        else {
            return Err(unexpected!("initial write not found"));
        };
        initial.encoded_data = None;
        Some(initial)
    };

    Ok(Reply {
        status: Status { code: StatusCode::OK.as_u16(), detail: None },
        body: Some(ReadReply {
            entry: ReadReplyEntry {
                records_write: Some(write),
                records_delete: None,
                initial_write,
                data,
            },
        }),
    })
}

/// Records read message payload
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Read {
    /// Read descriptor.
    pub descriptor: ReadDescriptor,

    /// Message authorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

impl Message for Read {
    type Reply = ReadReply;

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

/// Read reply.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReply {
    /// The read reply entry.
    pub entry: ReadReplyEntry,
}

/// Read reply.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReplyEntry {
    /// The latest `RecordsWrite` message of the record if record exists
    /// (not deleted).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_write: Option<Write>,

    /// The `RecordsDelete` if the record is deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_delete: Option<Delete>,

    /// The initial write of the record if the returned `RecordsWrite` message
    /// itself is not the initial write or if a `RecordsDelete` is returned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_write: Option<Write>,

    /// The data for the record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<DataStream>,
}

impl Read {
    async fn authorize(&self, owner: &str, write: &Write, provider: &impl Provider) -> Result<()> {
        let Some(authzn) = &self.authorization else {
            // anonymous request: only published records may be returned
            if write.descriptor.published == Some(true) {
                return Ok(());
            }
            return Err(Error::NotFound("no matching record found".to_string()));
        };
        authzn.verify(provider, provider.signature_cache()).await?;
        let author = authzn.author()?;

        // authorization not required for published data
        if write.descriptor.published.unwrap_or_default() {
            return Ok(());
        }

        // owner can read records they authored
        if author == owner {
            return Ok(());
        }

        // recipient can read
        if let Some(recipient) = &write.descriptor.recipient {
            if &author == recipient {
                return Ok(());
            }
        }

        // author of the underlying write can read
        if author == write.authorization.author()? {
            return Ok(());
        }

        // verify grant
        if let Some(grant_id) = &authzn.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
            grant.permit_read(owner, &author, self, write, provider).await?;
            return Ok(());
        }

        // verify protocol role and action
        if write.descriptor.protocol.is_some() {
            return protocol::authorize_read(owner, write, &author, provider).await;
        }

        Err(forbidden!("read cannot be authorized"))
    }
}

/// Reads read descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadDescriptor {
    /// The base descriptor
    #[serde(flatten)]
    pub base: Descriptor,

    /// Defines the filter for the read.
    pub filter: RecordsFilter,
}

/// Options to use when creating a permission grant.
#[derive(Clone, Debug, Default)]
pub struct ReadBuilder {
    message_timestamp: DateTime<Utc>,
    filter: RecordsFilter,
    permission_grant_id: Option<String>,
    protocol_role: Option<String>,
    delegated_grant: Option<DelegatedGrant>,
    authorize: Option<bool>,
}

impl ReadBuilder {
    /// Returns a new [`ReadBuilder`]
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Utc::now(),
            ..Self::default()
        }
    }

    /// Specifies the filter identifying the record to read.
    #[must_use]
    pub fn filter(mut self, filter: RecordsFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Specifies the permission grant ID.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Specify whether to attach an authorization envelope. Defaults to
    /// `true`; set `false` to build an anonymous read of published records.
    #[must_use]
    pub const fn authorize(mut self, authorize: bool) -> Self {
        self.authorize = Some(authorize);
        self
    }

    /// Specify a protocol role for the record.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// The delegated grant used with this record.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: DelegatedGrant) -> Self {
        self.delegated_grant = Some(delegated_grant);
        self
    }

    /// Build the read message.
    ///
    /// # Errors
    /// Returns an error if the descriptor cannot be CID-encoded or signing
    /// fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Read> {
        let descriptor = ReadDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Read,
                message_timestamp: self.message_timestamp,
            },
            filter: self.filter.normalize()?,
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

        Ok(Read { descriptor, authorization })
    }
}

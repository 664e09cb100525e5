//! # Records Delete
//!
//! The records delete endpoint handles `RecordsDelete` messages — requests
//! to delete a [`Write`] record.
//!
//! Technically, the [`Write`] record is not deleted, but rather a new
//! [`Delete`] record is created to mark the record as deleted. The [`Delete`]
//! record is used to prune the record and its descendants from the system,
//! leaving only the [`Delete`] and initial [`Write`] records.

use std::collections::{BTreeMap, HashMap};

use async_recursion::async_recursion;
use chrono::{DateTime, SecondsFormat::Micros, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::{Authorization, AuthorizationBuilder, Signer};
use crate::endpoint::{Message, Reply, Status};
use crate::provider::{DataStore, EventLog, MessageStore, Provider};
use crate::records::{DelegatedGrant, RecordsFilter, Write, protocol};
use crate::store::index::{Filter, FilterVal, QueryOptions};
use crate::store::{Entry, EntryType};
use crate::{Descriptor, Error, Interface, Method, Result, bad_request, unexpected};

/// Handle — or process — a [`Delete`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or when
/// an issue occurs attempting to delete the specified record from the
/// [`MessageStore`].
pub async fn handle(
    owner: &str, delete: Delete, provider: &impl Provider,
) -> Result<Reply<DeleteReply>> {
    delete.authorization.verify(provider, provider.signature_cache()).await?;

    // a record must exist for delete processing, including any prior delete
    let mut filter = Filter::default();
    filter.0.insert(
        "recordId".to_string(),
        FilterVal::Equal(Value::String(delete.descriptor.record_id.clone())),
    );
    let opts = QueryOptions {
        sort_property: "messageTimestamp".to_string(),
        reverse: true,
        limit: Some(1),
        cursor: None,
    };
    let (entries, _) = MessageStore::query(provider, owner, &[filter], &opts).await?;
    let Some(latest) = entries.first() else {
        return Err(Error::NotFound("no matching record found".to_string()));
    };

    // check the latest existing message has not already been deleted
    if let Some(existing_delete) = latest.as_delete() {
        if !delete.descriptor.prune {
            return Err(Error::NotFound("cannot delete a `RecordsDelete` record".to_string()));
        }
        if existing_delete.descriptor.prune {
            return Err(Error::NotFound(
                "attempting to prune an already pruned record".to_string(),
            ));
        }
    }

    let write = Write::try_from(latest)?;
    delete.authorize(owner, &write, provider).await?;

    // ensure the delete request does not pre-date the latest existing version
    if delete.descriptor().message_timestamp < latest.descriptor().message_timestamp {
        return Err(Error::Conflict("newer record version exists".to_string()));
    }

    commit(owner, &delete, provider).await?;

    Ok(Reply { status: Status { code: StatusCode::ACCEPTED.as_u16(), detail: None }, body: None })
}

/// The [`Delete`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delete {
    /// Delete descriptor.
    pub descriptor: DeleteDescriptor,

    /// Message authorization.
    pub authorization: Authorization,
}

impl Message for Delete {
    type Reply = DeleteReply;

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

/// [`DeleteReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Debug)]
pub struct DeleteReply;

impl TryFrom<&Entry> for Delete {
    type Error = crate::Error;

    fn try_from(entry: &Entry) -> Result<Self> {
        entry.as_delete().cloned().ok_or_else(|| unexpected!("expected `RecordsDelete` message"))
    }
}

impl Delete {
    /// Build flattened indexes for the delete message.
    #[must_use]
    pub(crate) fn indexes(&self) -> Result<BTreeMap<String, Value>> {
        let mut indexes = BTreeMap::new();
        indexes.insert("interface".to_string(), Value::String(Interface::Records.to_string()));
        indexes.insert("method".to_string(), Value::String(Method::Delete.to_string()));
        indexes.insert("recordId".to_string(), Value::String(self.descriptor.record_id.clone()));
        indexes.insert(
            "messageTimestamp".to_string(),
            Value::String(self.descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true)),
        );
        indexes.insert("author".to_string(), Value::String(self.authorization.author()?));
        Ok(indexes)
    }

    /// Authorize the delete message.
    async fn authorize(&self, owner: &str, write: &Write, provider: &impl Provider) -> Result<()> {
        protocol::authorize_delete(owner, self, write, provider).await
    }
}

/// The [`Delete`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDescriptor {
    /// The base descriptor
    #[serde(flatten)]
    pub base: Descriptor,

    /// The ID of the record to delete.
    pub record_id: String,

    /// Specifies whether descendent records should be pruned or not.
    pub prune: bool,
}

/// Persists the `RecordsDelete`, then prunes or archives earlier versions of
/// the record per §4.7's lifecycle rules.
async fn commit(owner: &str, delete: &Delete, provider: &impl Provider) -> Result<()> {
    let mut filter = Filter::default();
    filter.0.insert(
        "recordId".to_string(),
        FilterVal::Equal(Value::String(delete.descriptor.record_id.clone())),
    );
    let opts = QueryOptions {
        sort_property: "messageTimestamp".to_string(),
        reverse: false,
        limit: None,
        cursor: None,
    };
    let (entries, _) = MessageStore::query(provider, owner, &[filter], &opts).await?;
    if entries.is_empty() {
        return Err(Error::NotFound("no matching records found".to_string()));
    }

    let message_cid = delete.cid()?;
    let indexes = delete.indexes()?;
    let entry = Entry { message: EntryType::Delete(delete.clone()), indexes: indexes.clone() };
    MessageStore::put(provider, owner, &message_cid, &entry).await?;
    EventLog::append(provider, owner, &message_cid, indexes).await?;

    if delete.descriptor.prune {
        delete_children(owner, &delete.descriptor.record_id, provider).await?;
    }

    archive_earlier(owner, delete.descriptor().message_timestamp, &entries, provider).await?;

    Ok(())
}

/// Purges a record's descendant records and their data.
#[async_recursion]
async fn delete_children(owner: &str, record_id: &str, provider: &impl Provider) -> Result<()> {
    let mut filter = Filter::default();
    filter.0.insert(
        "parentId".to_string(),
        FilterVal::Equal(Value::String(record_id.to_string())),
    );
    let opts = QueryOptions {
        sort_property: "messageTimestamp".to_string(),
        reverse: false,
        limit: None,
        cursor: None,
    };
    let (children, _) = MessageStore::query(provider, owner, &[filter], &opts).await?;
    if children.is_empty() {
        return Ok(());
    }

    let mut by_record_id = HashMap::<String, Vec<Entry>>::new();
    for entry in children {
        let record_id = match &entry.message {
            EntryType::Write(write) => write.descriptor.record_id.clone(),
            EntryType::Delete(delete) => delete.descriptor.record_id.clone(),
            EntryType::Configure(_) => return Err(unexpected!("unexpected message type")),
        };
        by_record_id.entry(record_id).or_default().push(entry);
    }

    for (record_id, entries) in by_record_id {
        delete_children(owner, &record_id, provider).await?;
        purge(owner, &entries, provider).await?;
    }

    Ok(())
}

/// Hard-deletes `entries` (a single record's full message history) and the
/// data of its most recent write.
async fn purge(owner: &str, entries: &[Entry], provider: &impl Provider) -> Result<()> {
    let mut writes: Vec<&Entry> =
        entries.iter().filter(|e| e.descriptor().method == Method::Write).collect();
    writes.sort_by_key(|e| e.descriptor().message_timestamp);

    if let Some(latest) = writes.pop() {
        let Some(write) = latest.as_write() else {
            return Err(unexpected!("latest record is not a `RecordsWrite`"));
        };
        DataStore::delete(provider, owner, &write.descriptor.data_cid).await?;
    }

    for entry in entries {
        let cid = entry.cid()?;
        MessageStore::delete(provider, owner, &cid).await?;
    }

    Ok(())
}

/// Removes every message in `existing` older than `latest_timestamp`, except
/// a record's initial write, which is kept (its data is reaped only once it
/// is no longer referenced by the surviving write).
async fn archive_earlier(
    owner: &str, latest_timestamp: chrono::DateTime<chrono::Utc>, existing: &[Entry],
    provider: &impl Provider,
) -> Result<()> {
    // at most there will be an initial write plus one later write/delete per
    // `record_id`
    for entry in existing {
        if entry.descriptor().message_timestamp >= latest_timestamp {
            continue;
        }
        let Some(write) = entry.as_write() else {
            continue;
        };
        if write.is_initial()? {
            continue;
        }
        delete_stale_data(owner, write, existing, provider).await?;
        let cid = entry.cid()?;
        MessageStore::delete(provider, owner, &cid).await?;
    }
    Ok(())
}

/// Deletes `write`'s data unless it is still referenced by a surviving entry
/// in `existing` (the initial write and the record's latest write may share
/// a `dataCid` with an intermediate update being pruned).
async fn delete_stale_data(
    owner: &str, write: &Write, existing: &[Entry], provider: &impl Provider,
) -> Result<()> {
    let still_referenced = existing.iter().any(|e| {
        e.as_write().is_some_and(|w| {
            w.descriptor.record_id == write.descriptor.record_id
                && w.descriptor.data_cid == write.descriptor.data_cid
                && w.descriptor.base.message_timestamp != write.descriptor.base.message_timestamp
        })
    });
    if still_referenced {
        return Ok(());
    }
    DataStore::delete(provider, owner, &write.descriptor.data_cid).await
}

/// Builds a `RecordsDelete` message.
#[derive(Clone, Debug, Default)]
pub struct DeleteBuilder {
    record_id: Option<String>,
    prune: bool,
    message_timestamp: Option<DateTime<Utc>>,
    permission_grant_id: Option<String>,
    protocol_role: Option<String>,
    delegated_grant: Option<DelegatedGrant>,
}

impl DeleteBuilder {
    /// Returns a new, empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the ID of the record to delete.
    #[must_use]
    pub fn record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Prune descendant records along with this one.
    #[must_use]
    pub const fn prune(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    /// Overrides the message timestamp. Defaults to now.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// Specifies the permission grant ID authorizing this delete.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Specifies a protocol role authorizing this delete.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// The delegated grant used to sign this delete.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: DelegatedGrant) -> Self {
        self.delegated_grant = Some(delegated_grant);
        self
    }

    /// Signs and builds the delete message.
    ///
    /// # Errors
    /// Returns an error if `record_id` is missing, the descriptor cannot be
    /// CID-encoded, or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Delete> {
        let record_id = self.record_id.ok_or_else(|| bad_request!("recordId is required"))?;

        let descriptor = DeleteDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Delete,
                message_timestamp: self.message_timestamp.unwrap_or_else(Utc::now),
            },
            record_id,
            prune: self.prune,
        };

        let mut auth_builder =
            AuthorizationBuilder::new().descriptor_cid(crate::cid::compute_cid(&descriptor)?);
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
        let authorization = auth_builder.build(signer).await?;

        Ok(Delete { descriptor, authorization })
    }
}

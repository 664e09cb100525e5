//! Record Lifecycle (C7): `RecordsWrite` parsing, content-addressed
//! identity, latest-writer-wins conflict resolution, and initial-write
//! immutability. See design notes §4.7.

use std::collections::BTreeMap;
use std::io::Read as _;

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::{Authorization, AuthorizationBuilder, Signer};
use crate::data::{DataStream, MAX_ENCODED_SIZE};
use crate::endpoint::{Message, Reply, Status};
use crate::provider::Provider;
use crate::store::{Entry, EntryType};
use crate::{Descriptor, Error, Interface, Method, Result, bad_request, unexpected};

/// A record payload, either already in memory or as a stream a builder
/// should read to completion.
pub enum Data {
    /// An in-memory byte payload.
    Bytes(Vec<u8>),
    /// A streamed payload.
    Stream(DataStream),
}

/// An independent attestation over a message's descriptor, produced by a
/// party other than the author.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    /// The CID of the descriptor being attested to.
    pub descriptor_cid: String,
}

/// A grant embedding the delegate's signing authority, attached inline to a
/// message's authorization so the chain can be verified without a storage
/// round-trip. Structurally, a delegated grant is itself a `RecordsWrite`.
pub type DelegatedGrant = Write;

pub use crate::auth::SignaturePayload;

/// The `RecordsWrite` descriptor: the immutable fields established by a
/// record's initial write, plus the mutable fields a later update may
/// change.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WriteDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The record's id. Immutable across a record's write chain.
    pub record_id: String,

    /// The record's recipient, if any. Immutable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,

    /// When the record was first created. Immutable.
    pub date_created: DateTime<Utc>,

    /// The protocol this record belongs to, if any. Immutable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// The record's path within its protocol's type tree. Immutable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_path: Option<String>,

    /// The record's data schema, if any. Immutable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// The id of the thread/conversation root this record belongs to.
    /// Immutable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// The CID of this record's parent, if any. Immutable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// The CID of the record's data payload.
    pub data_cid: String,

    /// The size, in bytes, of the record's data payload.
    pub data_size: usize,

    /// The MIME type of the record's data payload.
    pub data_format: String,

    /// Whether the record is publicly visible. Mutable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,

    /// When the record was published, if ever. Mutable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_published: Option<DateTime<Utc>>,

    /// Tag values attached to the record, checked against the protocol's
    /// `$tags` rule set, if any. Mutable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, Value>>,
}

/// Fields of [`WriteDescriptor`] that must not change across a record's
/// write chain.
const IMMUTABLE_FIELDS: &[&str] =
    &["record_id", "recipient", "date_created", "protocol", "protocol_path", "schema", "context_id", "parent_id"];

impl WriteDescriptor {
    fn immutable_eq(&self, other: &Self) -> bool {
        self.record_id == other.record_id
            && self.recipient == other.recipient
            && self.date_created == other.date_created
            && self.protocol == other.protocol
            && self.protocol_path == other.protocol_path
            && self.schema == other.schema
            && self.context_id == other.context_id
            && self.parent_id == other.parent_id
    }
}

/// A `RecordsWrite` message: creates or updates a record.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Write {
    /// The `RecordsWrite` descriptor.
    pub descriptor: WriteDescriptor,

    /// The message authorization.
    pub authorization: Authorization,

    /// The record's data, base64url-encoded, when it is small enough to
    /// store inline (<= [`MAX_ENCODED_SIZE`]).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded_data: Option<String>,
}

impl Message for Write {
    type Reply = WriteReply;

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

/// Computes the deterministic id a record's *initial* write must carry:
/// the CID of its descriptor plus author, fixed before the message itself
/// (and hence `recordId`) can be known.
///
/// `recordId` itself is excluded from the hashed descriptor so the
/// computation is idempotent whether called before `recordId` is assigned
/// (building a new record) or after (checking `is_initial` on a stored one).
///
/// # Errors
/// Returns [`crate::Error::InternalError`] if the descriptor cannot be
/// CBOR-encoded.
pub fn entry_id(descriptor: &WriteDescriptor, author: &str) -> Result<String> {
    #[derive(Serialize)]
    struct Input<'a> {
        descriptor: &'a WriteDescriptor,
        author: &'a str,
    }
    let mut descriptor = descriptor.clone();
    descriptor.record_id = String::new();
    crate::cid::compute_cid(&Input { descriptor: &descriptor, author })
}

impl Write {
    /// Whether this is the initial write of its record, i.e. its
    /// `recordId` is the deterministic [`entry_id`] of its own descriptor.
    ///
    /// # Errors
    /// Returns an error if the author cannot be derived from the
    /// authorization.
    pub fn is_initial(&self) -> Result<bool> {
        let author = self.authorization.author()?;
        Ok(self.descriptor.record_id == entry_id(&self.descriptor, &author)?)
    }

    fn indexes(&self) -> Result<BTreeMap<String, Value>> {
        let author = self.authorization.author()?;
        let mut indexes = BTreeMap::new();
        indexes.insert("interface".to_string(), Value::String(Interface::Records.to_string()));
        indexes.insert("method".to_string(), Value::String(Method::Write.to_string()));
        indexes.insert("recordId".to_string(), Value::String(self.descriptor.record_id.clone()));
        indexes.insert("author".to_string(), Value::String(author));
        if let Some(recipient) = &self.descriptor.recipient {
            indexes.insert("recipient".to_string(), Value::String(recipient.clone()));
        }
        if let Some(protocol) = &self.descriptor.protocol {
            indexes.insert("protocol".to_string(), Value::String(protocol.clone()));
        }
        if let Some(protocol_path) = &self.descriptor.protocol_path {
            indexes.insert("protocolPath".to_string(), Value::String(protocol_path.clone()));
        }
        if let Some(schema) = &self.descriptor.schema {
            indexes.insert("schema".to_string(), Value::String(schema.clone()));
        }
        if let Some(context_id) = &self.descriptor.context_id {
            indexes.insert("contextId".to_string(), Value::String(context_id.clone()));
        }
        if let Some(parent_id) = &self.descriptor.parent_id {
            indexes.insert("parentId".to_string(), Value::String(parent_id.clone()));
        }
        if let Some(attester) = self.attester()? {
            indexes.insert("attester".to_string(), Value::String(attester));
        }
        if let Some(tags) = &self.descriptor.tags {
            for (k, v) in tags {
                indexes.insert(format!("tag.{k}"), v.clone());
            }
        }
        indexes.insert("dataCid".to_string(), Value::String(self.descriptor.data_cid.clone()));
        indexes.insert("dataFormat".to_string(), Value::String(self.descriptor.data_format.clone()));
        indexes.insert("dataSize".to_string(), Value::from(self.descriptor.data_size));
        indexes.insert(
            "published".to_string(),
            Value::Bool(self.descriptor.published.unwrap_or(false)),
        );
        indexes.insert(
            "dateCreated".to_string(),
            Value::String(self.descriptor.date_created.to_rfc3339()),
        );
        if let Some(date_published) = self.descriptor.date_published {
            indexes.insert("datePublished".to_string(), Value::String(date_published.to_rfc3339()));
        }
        indexes.insert(
            "messageTimestamp".to_string(),
            Value::String(self.descriptor.base.message_timestamp.to_rfc3339()),
        );
        Ok(indexes)
    }

    /// The DID that produced the (optional) attestation, if any.
    ///
    /// # Errors
    /// Returns an error if the attestation signature's DID cannot be
    /// derived.
    pub fn attester(&self) -> Result<Option<String>> {
        let Some(attestation) = &self.authorization.attestation else {
            return Ok(None);
        };
        let Some(sig) = attestation.signatures.first() else {
            return Ok(None);
        };
        let header_bytes = Base64UrlUnpadded::decode_vec(&sig.protected)
            .map_err(|e| unexpected!("invalid attestation header: {e}"))?;
        let header: crate::auth::JwsHeader =
            serde_json::from_slice(&header_bytes).map_err(|e| unexpected!("invalid attestation header: {e}"))?;
        Ok(Some(header.kid.split('#').next().unwrap_or(&header.kid).to_string()))
    }

    fn verify_integrity(&self) -> Result<()> {
        let payload = self.authorization.payload()?;
        let descriptor_cid = crate::cid::compute_cid(&self.descriptor)?;
        if payload.descriptor_cid != descriptor_cid {
            return Err(bad_request!("descriptor CID does not match authorization payload"));
        }
        if let Some(attestation) = &self.authorization.attestation {
            if let Some(sig) = attestation.signatures.first() {
                let bytes = Base64UrlUnpadded::decode_vec(&sig.payload)
                    .map_err(|e| bad_request!("invalid attestation payload: {e}"))?;
                let attestation: Attestation =
                    serde_json::from_slice(&bytes).map_err(|e| bad_request!("invalid attestation payload: {e}"))?;
                if attestation.descriptor_cid != descriptor_cid {
                    return Err(bad_request!("attestation does not match descriptor"));
                }
            }
        }
        Ok(())
    }
}

/// Finds the current latest write for `record_id`, if any record exists.
async fn current_write(owner: &str, record_id: &str, provider: &impl Provider) -> Result<Option<(String, Write)>> {
    use crate::store::index::{Filter, FilterVal, QueryOptions};
    let mut filter = Filter::default();
    filter.0.insert("recordId".to_string(), FilterVal::Equal(Value::String(record_id.to_string())));
    filter.0.insert("method".to_string(), FilterVal::Equal(Value::String(Method::Write.to_string())));
    let opts = QueryOptions { sort_property: "messageTimestamp".to_string(), reverse: false, limit: None, cursor: None };

    let (entries, _) = crate::provider::MessageStore::query(provider, owner, &[filter], &opts).await?;
    for entry in entries {
        if let EntryType::Write(write) = entry.message {
            let cid = write.cid()?;
            return Ok(Some((cid, write)));
        }
    }
    Ok(None)
}

/// Returns the record's initial write, following deletes transparently.
///
/// # Errors
/// Returns [`crate::Error::InternalError`] if storage access fails.
pub async fn initial_write(owner: &str, record_id: &str, provider: &impl Provider) -> Result<Option<Write>> {
    use crate::store::index::{Filter, FilterVal, QueryOptions};
    let mut filter = Filter::default();
    filter.0.insert("recordId".to_string(), FilterVal::Equal(Value::String(record_id.to_string())));
    filter.0.insert("method".to_string(), FilterVal::Equal(Value::String(Method::Write.to_string())));
    let opts =
        QueryOptions { sort_property: "dateCreated".to_string(), reverse: false, limit: Some(1), cursor: None };

    let (entries, _) = crate::provider::MessageStore::query(provider, owner, &[filter], &opts).await?;
    for entry in entries {
        if let EntryType::Write(write) = entry.message {
            return Ok(Some(write));
        }
    }
    Ok(None)
}

/// `messageTimestamp`/CID ordering used by the conflict rule: higher
/// timestamp wins; ties broken by the lexicographically larger CID.
fn wins(candidate_cid: &str, candidate: &Write, current_cid: &str, current: &Write) -> bool {
    let ct = candidate.descriptor.base.message_timestamp;
    let cu = current.descriptor.base.message_timestamp;
    match ct.cmp(&cu) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => candidate_cid > current_cid,
    }
}

/// Handles a `RecordsWrite` message: authorization, conflict resolution,
/// and persistence across the message store, index, and event log.
///
/// # Errors
/// Returns [`crate::Error::BadRequest`] on integrity/schema failures,
/// [`crate::Error::Unauthorized`] on authorization failures, and
/// [`crate::Error::Conflict`] if this write loses conflict resolution.
pub async fn handle(owner: &str, write: Write, provider: &impl Provider) -> Result<Reply<WriteReply>> {
    write.verify_integrity()?;
    write.authorization.verify(provider, provider.signature_cache()).await?;

    crate::records::protocol::authorize_write(owner, &write, provider).await?;

    let message_cid = write.cid()?;

    match current_write(owner, &write.descriptor.record_id, provider).await? {
        None => {
            if !write.is_initial()? {
                return Err(bad_request!("updates must reference an existing record"));
            }
        }
        Some((current_cid, current)) => {
            if current.is_initial()? && write.is_initial()? && current_cid != message_cid {
                return Err(Error::Conflict("RecordsWriteConflict: record already exists".to_string()));
            }
            let Some(initial) = initial_write(owner, &write.descriptor.record_id, provider).await? else {
                return Err(unexpected!("record has a write but no initial write"));
            };
            if !write.descriptor.immutable_eq(&initial.descriptor) {
                return Err(bad_request!("RecordsWriteImmutablePropertyChanged"));
            }
            if !wins(&message_cid, &write, &current_cid, &current) {
                return Err(Error::Conflict("RecordsWriteConflict: superseded by a later write".to_string()));
            }

            crate::provider::MessageStore::delete(provider, owner, &current_cid).await?;
            crate::provider::EventLog::delete_by_cid(provider, owner, &[current_cid]).await?;
        }
    }

    let indexes = write.indexes()?;
    let entry = Entry { message: EntryType::Write(write), indexes: indexes.clone() };
    crate::provider::MessageStore::put(provider, owner, &message_cid, &entry).await?;
    crate::provider::EventLog::append(provider, owner, &message_cid, indexes).await?;

    Ok(Reply { status: Status { code: StatusCode::ACCEPTED.as_u16(), detail: None }, body: None })
}

/// Reply to a `RecordsWrite` message: an empty 202 on success.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct WriteReply;

/// Builds a signed [`Write`] message.
#[derive(Default)]
pub struct WriteBuilder {
    record_id: Option<String>,
    recipient: Option<String>,
    protocol: Option<String>,
    protocol_path: Option<String>,
    schema: Option<String>,
    context_id: Option<String>,
    parent_id: Option<String>,
    data: Option<Data>,
    data_format: Option<String>,
    published: Option<bool>,
    tags: Option<BTreeMap<String, Value>>,
    date_created: Option<DateTime<Utc>>,
    message_timestamp: Option<DateTime<Utc>>,
    permission_grant_id: Option<String>,
    protocol_role: Option<String>,
    delegated_grant: Option<Value>,
}

impl WriteBuilder {
    /// Starts an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the record's data payload.
    #[must_use]
    pub fn data(mut self, data: Data) -> Self {
        self.data = Some(data);
        self
    }

    /// References an existing record for an update, rather than creating a
    /// new one.
    #[must_use]
    pub fn record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Sets the record's recipient.
    #[must_use]
    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Sets the record's protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Sets the record's protocol path.
    #[must_use]
    pub fn protocol_path(mut self, protocol_path: impl Into<String>) -> Self {
        self.protocol_path = Some(protocol_path.into());
        self
    }

    /// Sets the record's schema.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Sets the record's context id.
    #[must_use]
    pub fn context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Sets the record's parent id.
    #[must_use]
    pub fn parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Sets the record's data format (MIME type).
    #[must_use]
    pub fn data_format(mut self, data_format: impl Into<String>) -> Self {
        self.data_format = Some(data_format.into());
        self
    }

    /// Marks the record published (or not).
    #[must_use]
    pub const fn published(mut self, published: bool) -> Self {
        self.published = Some(published);
        self
    }

    /// Adds a tag value.
    #[must_use]
    pub fn add_tag(mut self, key: impl Into<String>, value: Value) -> Self {
        self.tags.get_or_insert_with(BTreeMap::new).insert(key.into(), value);
        self
    }

    /// Overrides `dateCreated` (defaults to now, for an initial write).
    #[must_use]
    pub const fn date_created(mut self, date_created: DateTime<Utc>) -> Self {
        self.date_created = Some(date_created);
        self
    }

    /// Overrides `messageTimestamp` (defaults to now).
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// Invokes a permission grant when signing.
    #[must_use]
    pub fn permission_grant_id(mut self, grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(grant_id.into());
        self
    }

    /// Invokes a protocol role when signing.
    #[must_use]
    pub fn protocol_role(mut self, role: impl Into<String>) -> Self {
        self.protocol_role = Some(role.into());
        self
    }

    /// Attaches a delegated grant the signer is acting under.
    #[must_use]
    pub fn delegated_grant(mut self, grant: Value) -> Self {
        self.delegated_grant = Some(grant);
        self
    }

    /// Signs and builds the message.
    ///
    /// # Errors
    /// Returns an error if the data payload cannot be read, the descriptor
    /// cannot be CID-encoded, or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Write> {
        let bytes = match self.data {
            Some(Data::Bytes(b)) => b,
            Some(Data::Stream(mut s)) => s.read_to_end()?,
            None => Vec::new(),
        };
        let data_cid = crate::cid::compute_data_cid(&bytes);
        let now = Utc::now();
        let date_created = self.date_created.unwrap_or(now);
        let message_timestamp = self.message_timestamp.unwrap_or(now);

        let mut descriptor = WriteDescriptor {
            base: Descriptor { interface: Interface::Records, method: Method::Write, message_timestamp },
            record_id: String::new(),
            recipient: self.recipient,
            date_created,
            protocol: self.protocol,
            protocol_path: self.protocol_path,
            schema: self.schema,
            context_id: self.context_id,
            parent_id: self.parent_id,
            data_cid,
            data_size: bytes.len(),
            data_format: self.data_format.unwrap_or_else(|| "application/json".to_string()),
            published: self.published,
            date_published: if self.published == Some(true) { Some(now) } else { None },
            tags: self.tags,
        };

        let author = signer.verification_method().await?;
        let author_did = author.split('#').next().unwrap_or(&author).to_string();
        descriptor.record_id = match self.record_id {
            Some(id) => id,
            None => entry_id(&descriptor, &author_did)?,
        };

        let descriptor_cid = crate::cid::compute_cid(&descriptor)?;
        let authorization = AuthorizationBuilder::new()
            .descriptor_cid(descriptor_cid)
            .permission_grant_id(self.permission_grant_id)
            .protocol_role(self.protocol_role)
            .delegated_grant(self.delegated_grant)
            .build(signer)
            .await?;

        let encoded_data =
            if bytes.len() <= MAX_ENCODED_SIZE { Some(Base64UrlUnpadded::encode_string(&bytes)) } else { None };

        Ok(Write { descriptor, authorization, encoded_data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_id_is_deterministic() {
        let descriptor = WriteDescriptor {
            base: Descriptor { interface: Interface::Records, method: Method::Write, message_timestamp: Utc::now() },
            record_id: String::new(),
            date_created: Utc::now(),
            data_cid: "cid".to_string(),
            data_size: 0,
            data_format: "application/json".to_string(),
            ..Default::default()
        };
        let a = entry_id(&descriptor, "did:key:abc").unwrap();
        let b = entry_id(&descriptor, "did:key:abc").unwrap();
        assert_eq!(a, b);
    }
}

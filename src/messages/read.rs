//! `MessagesRead`: fetches a single persisted message (and its data, for
//! `RecordsWrite`) by message CID.

use std::str::FromStr;

use ::cid::Cid;
use base64ct::{Base64UrlUnpadded, Encoding};
use serde::{Deserialize, Serialize};

use crate::auth::Authorization;
use crate::data::DataStream;
use crate::endpoint::{Message, Reply};
use crate::permissions::{self, Scope};
use crate::protocols::PERMISSIONS_PROTOCOL_URI;
use crate::provider::{DataStore, MessageStore, Provider};
use crate::records::write;
use crate::store::{Entry, EntryType};
use crate::{Descriptor, Error, Interface, Result, forbidden, unexpected};

/// A `MessagesRead` message: fetches a single message by CID.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Read {
    /// The `Read` descriptor.
    pub descriptor: ReadDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

/// `MessagesRead` descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The CID of the message to read.
    pub message_cid: String,
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
        Some(&self.authorization)
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

impl Read {
    async fn authorize(&self, owner: &str, entry: &Entry, provider: &impl Provider) -> Result<()> {
        self.authorization.verify(provider, provider.signature_cache()).await?;

        let author = self.authorization.author()?;
        if author == owner {
            return Ok(());
        }

        let Some(grant_id) = &self.authorization.payload()?.permission_grant_id else {
            return Err(forbidden!("missing grant ID"));
        };
        let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
        grant.verify(owner, &author, self.descriptor(), provider).await?;
        verify_scope(owner, entry, &grant.data.scope, provider).await
    }
}

/// Verifies the requested message falls within the grant's scope.
async fn verify_scope(
    owner: &str, requested: &Entry, scope: &Scope, store: &impl MessageStore,
) -> Result<()> {
    let Some(protocol) = scope.protocol() else {
        return Ok(());
    };

    if requested.descriptor().interface == Interface::Protocols {
        if let EntryType::Configure(configure) = &requested.message {
            if configure.descriptor.definition.protocol == protocol {
                return Ok(());
            }
        }
        return Err(forbidden!("message failed scope authorization"));
    }

    if requested.descriptor().interface == Interface::Records {
        let write = match &requested.message {
            EntryType::Write(write) => write.clone(),
            EntryType::Delete(delete) => {
                let entry = write::initial_write(owner, &delete.descriptor.record_id, store).await?;
                let Some(write) = entry else {
                    return Err(forbidden!("message failed scope authorization"));
                };
                write
            }
            EntryType::Configure(_) => {
                return Err(forbidden!("message failed scope authorization"));
            }
        };

        if write.descriptor.protocol.as_deref() == Some(protocol) {
            return Ok(());
        }

        // grants and requests are themselves `RecordsWrite`s under the
        // internal permissions protocol; a grant scoped to protocol X also
        // covers reading grants that were themselves scoped to X
        if write.descriptor.protocol.as_deref() == Some(PERMISSIONS_PROTOCOL_URI) {
            let permission_scope = permissions::fetch_scope(owner, &write, store).await?;
            if permission_scope.protocol() == Some(protocol) {
                return Ok(());
            }
        }
    }

    Err(forbidden!("message failed scope authorization"))
}

/// Handles a `MessagesRead`: fetches the message by CID and, for
/// `RecordsWrite` messages, its associated data.
///
/// # Errors
/// Returns an error if the message does not exist or fails authorization.
pub async fn handle(owner: &str, read: Read, provider: &impl Provider) -> Result<Reply<ReadReply>> {
    let cid =
        Cid::from_str(&read.descriptor.message_cid).map_err(|e| unexpected!("invalid CID: {e}"))?;

    let Some(entry) = MessageStore::get(provider, owner, &cid.to_string()).await? else {
        return Err(Error::NotFound("message not found".to_string()));
    };

    read.authorize(owner, &entry, provider).await?;

    let mut message = entry.message;

    let data = if let EntryType::Write(ref mut write) = message {
        if let Some(encoded) = write.encoded_data.take() {
            let bytes = Base64UrlUnpadded::decode_vec(&encoded)
                .map_err(|e| unexpected!("invalid base64 data: {e}"))?;
            Some(DataStream::from(bytes))
        } else if let Some(bytes) = DataStore::get(provider, owner, &write.descriptor.data_cid).await? {
            Some(DataStream::from(bytes))
        } else {
            None
        }
    } else {
        None
    };

    Ok(Reply::ok(ReadReply {
        entry: Some(ReadReplyEntry { message_cid: read.descriptor.message_cid, message, data }),
    }))
}

/// Reply to a `MessagesRead`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReply {
    /// The matching entry, if found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<ReadReplyEntry>,
}

/// A `MessagesRead` reply entry: the message plus, for `RecordsWrite`
/// messages, its associated data.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReplyEntry {
    /// The CID of the message.
    pub message_cid: String,

    /// The message.
    pub message: EntryType,

    /// The data associated with the message, if any.
    #[serde(skip)]
    pub data: Option<DataStream>,
}

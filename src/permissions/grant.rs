//! Permission grants: a tenant authorizes a grantee to invoke a given
//! interface/method (optionally scoped to a protocol) on their behalf.
//! Grants, like requests, are `RecordsWrite`s under the internal
//! permissions protocol; revocations are child `RecordsWrite`s that
//! reference the grant as their parent.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use crate::permissions::request::{RequestBuilder, RequestData};
use crate::auth::Signer;
use crate::endpoint::Message;
use crate::permissions::Scope;
use crate::permissions::{Conditions, RecordsOptions};
use crate::protocols::PERMISSIONS_PROTOCOL_URI;
use crate::provider::MessageStore;
use crate::records::{Data, Delete, Read, Write, WriteBuilder};
use crate::store::index::{Filter, FilterVal, QueryOptions};
use crate::{Descriptor, Result, bad_request, forbidden, unexpected};

/// A resolved permission grant: a `RecordsWrite` under the internal
/// permissions protocol, decoded into its [`GrantData`] payload.
#[derive(Clone, Debug)]
pub struct Grant {
    /// The grant's record id.
    pub id: String,

    /// The DID of the tenant granting permission.
    pub grantor: String,

    /// The DID of the party permission was granted to.
    pub grantee: String,

    /// When the grant was issued.
    pub date_granted: DateTime<Utc>,

    /// The grant's payload.
    pub data: GrantData,
}

/// Payload of a `RecordsWrite` carrying a permission grant.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantData {
    /// When the grant expires.
    pub date_expires: DateTime<Utc>,

    /// Whether the grantee may act as a delegate of the grantor, i.e. sign
    /// messages as the grantor rather than as themselves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegated: Option<bool>,

    /// Describes the purpose of the grant.
    pub description: String,

    /// The scope of methods/protocols the grant authorizes.
    pub scope: Scope,

    /// Conditions that must be met when the grant is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Conditions>,
}

impl Grant {
    /// Verifies `self` authorizes `grantee` to invoke the method described
    /// by `descriptor`, and that the grant has neither expired nor been
    /// revoked.
    ///
    /// # Errors
    /// Returns an error if the grant does not cover `grantee`/`descriptor`,
    /// has expired, or has been revoked.
    pub async fn verify(
        &self, owner: &str, grantee: &str, descriptor: &Descriptor, store: &impl MessageStore,
    ) -> Result<()> {
        if self.grantee != grantee {
            return Err(forbidden!("grant was not issued to this party"));
        }
        if Utc::now() < self.date_granted {
            return Err(forbidden!("grant is not yet active"));
        }
        if Utc::now() >= self.data.date_expires {
            return Err(forbidden!("grant has expired"));
        }
        if self.data.scope.interface() != descriptor.interface
            || self.data.scope.method() != descriptor.method
        {
            return Err(forbidden!("grant scope does not cover this message"));
        }
        if is_revoked(owner, &self.id, store).await? {
            return Err(forbidden!("grant has been revoked"));
        }
        Ok(())
    }

    /// Verifies `self`'s `Records` scope (protocol, context, and protocol
    /// path restrictions) covers `write`.
    ///
    /// # Errors
    /// Returns an error if the write falls outside the grant's scope.
    pub fn verify_scope(&self, write: &Write) -> Result<()> {
        let Scope::Records { protocol, options, .. } = &self.data.scope else {
            return Ok(());
        };
        if write.descriptor.protocol.as_deref() != Some(protocol.as_str()) {
            return Err(forbidden!("grant scope protocol does not match record"));
        }
        match options {
            Some(RecordsOptions::ContextId(context_id)) => {
                if write.descriptor.context_id.as_deref() != Some(context_id.as_str()) {
                    return Err(forbidden!("grant scope context does not match record"));
                }
            }
            Some(RecordsOptions::ProtocolPath(protocol_path)) => {
                if write.descriptor.protocol_path.as_deref() != Some(protocol_path.as_str()) {
                    return Err(forbidden!("grant scope protocol path does not match record"));
                }
            }
            None => {}
        }
        Ok(())
    }

    /// Verifies `self` authorizes `grantee` to read `write` via `read`.
    ///
    /// # Errors
    /// Returns an error if the grant doesn't cover the read, or its scope
    /// doesn't match `write`.
    pub async fn permit_read(
        &self, owner: &str, grantee: &str, read: &Read, write: &Write, store: &impl MessageStore,
    ) -> Result<()> {
        self.verify(owner, grantee, read.descriptor(), store).await?;
        self.verify_scope(write)
    }

    /// Verifies `self` authorizes `grantee` to delete `write` via `delete`.
    ///
    /// # Errors
    /// Returns an error if the grant doesn't cover the delete, or its scope
    /// doesn't match `write`.
    pub async fn permit_delete(
        &self, owner: &str, grantee: &str, delete: &Delete, write: &Write, store: &impl MessageStore,
    ) -> Result<()> {
        self.verify(owner, grantee, delete.descriptor(), store).await?;
        self.verify_scope(write)
    }
}

async fn is_revoked(owner: &str, grant_id: &str, store: &impl MessageStore) -> Result<bool> {
    let mut filter = Filter::default();
    filter.0.insert(
        "protocolPath".to_string(),
        FilterVal::Equal(Value::String("grant/revocation".to_string())),
    );
    filter.0.insert("parentId".to_string(), FilterVal::Equal(Value::String(grant_id.to_string())));
    let opts = QueryOptions {
        sort_property: "messageTimestamp".to_string(),
        reverse: false,
        limit: Some(1),
        cursor: None,
    };
    let (entries, _) = store.query(owner, &[filter], &opts).await?;
    Ok(!entries.is_empty())
}

/// Builds a permission grant record.
#[derive(Default)]
pub struct GrantBuilder {
    grantee: Option<String>,
    date_expires: Option<DateTime<Utc>>,
    description: Option<String>,
    delegated: Option<bool>,
    scope: Option<Scope>,
    conditions: Option<Conditions>,
}

impl GrantBuilder {
    /// Returns a new, empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the DID being granted permission.
    #[must_use]
    pub fn grantee(mut self, grantee: impl Into<String>) -> Self {
        self.grantee = Some(grantee.into());
        self
    }

    /// Sets the scope the grant authorizes.
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Sets when the grant expires.
    #[must_use]
    pub const fn date_expires(mut self, date_expires: DateTime<Utc>) -> Self {
        self.date_expires = Some(date_expires);
        self
    }

    /// Describes the purpose of the grant.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Marks the grant as delegating the grantor's own signing authority.
    #[must_use]
    pub const fn delegated(mut self, delegated: bool) -> Self {
        self.delegated = Some(delegated);
        self
    }

    /// Sets conditions the grantee must observe.
    #[must_use]
    pub fn conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Signs and builds the grant record.
    ///
    /// # Errors
    /// Returns an error if required fields are missing, or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Write> {
        let grantee = self.grantee.ok_or_else(|| bad_request!("grantee is required"))?;
        let scope = self.scope.ok_or_else(|| bad_request!("scope is required"))?;
        let date_expires = self.date_expires.ok_or_else(|| bad_request!("dateExpires is required"))?;

        let data = GrantData {
            date_expires,
            delegated: self.delegated,
            description: self.description.unwrap_or_default(),
            scope,
            conditions: self.conditions,
        };
        let bytes = serde_json::to_vec(&data).map_err(|e| unexpected!("{e}"))?;

        WriteBuilder::new()
            .recipient(grantee)
            .protocol(PERMISSIONS_PROTOCOL_URI)
            .protocol_path("grant")
            .data_format("application/json")
            .data(Data::Bytes(bytes))
            .build(signer)
            .await
    }
}

/// Payload of a `RecordsWrite` revoking a previously issued grant. Carries
/// no scope of its own — a grant is revoked in its entirety.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationData {
    /// Describes the reason for revocation.
    pub description: String,
}

/// Builds a grant revocation record.
#[derive(Default)]
pub struct RevocationBuilder {
    grant_id: Option<String>,
    description: Option<String>,
}

impl RevocationBuilder {
    /// Returns a new, empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the record id of the grant being revoked.
    #[must_use]
    pub fn grant_id(mut self, grant_id: impl Into<String>) -> Self {
        self.grant_id = Some(grant_id.into());
        self
    }

    /// Describes the reason for revocation.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Signs and builds the revocation record.
    ///
    /// # Errors
    /// Returns an error if no grant id was set, or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Write> {
        let grant_id = self.grant_id.ok_or_else(|| bad_request!("grantId is required"))?;
        let data = RevocationData { description: self.description.unwrap_or_default() };
        let bytes = serde_json::to_vec(&data).map_err(|e| unexpected!("{e}"))?;

        WriteBuilder::new()
            .parent_id(grant_id)
            .protocol(PERMISSIONS_PROTOCOL_URI)
            .protocol_path("grant/revocation")
            .data_format("application/json")
            .data(Data::Bytes(bytes))
            .build(signer)
            .await
    }
}

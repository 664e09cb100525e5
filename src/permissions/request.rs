//! Permission requests: a grantee asks a tenant for a grant of a given
//! scope. Requests are themselves `RecordsWrite`s under the internal
//! permissions protocol and carry no authorization significance of their
//! own — they are simply surfaced to the tenant for review.

use serde::{Deserialize, Serialize};

use crate::auth::Signer;
use crate::permissions::Scope;
use crate::protocols::PERMISSIONS_PROTOCOL_URI;
use crate::records::{Data, Write, WriteBuilder};
use crate::{Result, bad_request, unexpected};

/// Payload of a `RecordsWrite` requesting a permission grant.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    /// Describes the purpose of the requested grant.
    pub description: String,

    /// The requested scope.
    pub scope: Scope,
}

/// Builds a permission request record.
#[derive(Default)]
pub struct RequestBuilder {
    description: Option<String>,
    scope: Option<Scope>,
}

impl RequestBuilder {
    /// Returns a new, empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the scope being requested.
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Describes the purpose of the request.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Builds and signs the request record.
    ///
    /// # Errors
    /// Returns an error if no scope was set, or if signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Write> {
        let data = RequestData {
            description: self.description.unwrap_or_default(),
            scope: self.scope.ok_or_else(|| bad_request!("scope is required"))?,
        };
        let bytes = serde_json::to_vec(&data).map_err(|e| unexpected!("{e}"))?;

        WriteBuilder::new()
            .protocol(PERMISSIONS_PROTOCOL_URI)
            .protocol_path("request")
            .data_format("application/json")
            .data(Data::Bytes(bytes))
            .build(signer)
            .await
    }
}

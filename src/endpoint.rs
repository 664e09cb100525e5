//! Request dispatch (C9): a single generic entry point that validates a
//! message against its JSON Schema, then hands it to its own `handle`
//! implementation.

use std::fmt::Debug;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::auth::Authorization;
use crate::provider::Provider;
use crate::{Descriptor, Result, schema};

/// Validates `message` and dispatches it to its handler.
///
/// # Errors
/// Returns [`crate::Error::BadRequest`] if schema validation fails, and
/// whatever error the message's own handler returns.
pub async fn handle<T>(
    owner: &str, message: impl Message<Reply = T>, provider: &impl Provider,
) -> Result<Reply<T>> {
    message.validate().await?;
    message.handle(owner, provider).await
}

/// Behaviour common to every interface/method's message type.
pub trait Message: Serialize + Clone + Debug + Send + Sync {
    /// The handler's reply body.
    type Reply;

    /// Computes the CID of the message (its descriptor plus authorization).
    ///
    /// # Errors
    /// Returns an error if the message cannot be CBOR-encoded.
    fn cid(&self) -> Result<String>;

    /// The component of the message descriptor common to all messages.
    fn descriptor(&self) -> &Descriptor;

    /// The message's authorization envelope, if the method requires one.
    fn authorization(&self) -> Option<&Authorization>;

    /// Authorizes, applies conflict resolution, and persists the message.
    fn handle(self, owner: &str, provider: &impl Provider) -> impl Future<Output = Result<Reply<Self::Reply>>> + Send;

    /// Generic, schema-level validation common to all messages. Handlers
    /// layer interface-specific checks on top in their own `handle`.
    fn validate(&self) -> impl Future<Output = Result<()>> + Send {
        async { schema::validate(self) }
    }
}

/// Reply envelope returned by every endpoint.
#[derive(Debug, Default, Deserialize, Serialize)]
#[allow(clippy::module_name_repetitions)]
pub struct Reply<T> {
    /// Status accompanying the reply.
    pub status: Status,

    /// Endpoint-specific reply body, flattened into the envelope.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(flatten)]
    pub body: Option<T>,
}

impl<T> Reply<T> {
    /// Builds a `202 Accepted` reply carrying no body.
    #[must_use]
    pub fn accepted() -> Self {
        Self { status: Status { code: 202, detail: Some("Accepted".to_string()) }, body: None }
    }

    /// Builds a `200 OK` reply carrying `body`.
    #[must_use]
    pub fn ok(body: T) -> Self {
        Self { status: Status { code: 200, detail: None }, body: Some(body) }
    }
}

/// Reply status, modeled after an HTTP status line.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Status code.
    pub code: u16,

    /// Status detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

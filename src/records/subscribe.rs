//! `RecordsSubscribe`: opens a live tail of `RecordsWrite`/`RecordsDelete`
//! events matching a filter, restricted to what the subscriber may see.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::auth::{Authorization, AuthorizationBuilder, Signer};
use crate::endpoint::{Message, Reply};
use crate::event::{Event, SubscribeFilter, Subscriber};
use crate::permissions;
use crate::provider::{EventStream, Provider};
use crate::records::protocol;
use crate::records::{DelegatedGrant, RecordsFilter};
use crate::{Descriptor, Interface, Method, Result, forbidden, unexpected};

/// A `RecordsSubscribe` message: subscribes to records matching `filter`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscribe {
    /// The Subscribe descriptor.
    pub descriptor: SubscribeDescriptor,

    /// The message authorization. Absent when subscribing only to published
    /// records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

/// `RecordsSubscribe` descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The filter records must match.
    pub filter: RecordsFilter,
}

impl Message for Subscribe {
    type Reply = SubscribeReply;

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

impl Subscribe {
    /// Authorizes the subscription request, mirroring [`super::query::Query`]'s
    /// grant/role checks.
    async fn authorize(&self, owner: &str, author: &str, provider: &impl Provider) -> Result<()> {
        let Some(authzn) = &self.authorization else {
            return Ok(());
        };
        if author == owner {
            return Ok(());
        }
        let payload = authzn.payload()?;
        if let Some(role) = &payload.protocol_role {
            let protocol = self
                .descriptor
                .filter
                .protocol
                .as_deref()
                .ok_or_else(|| forbidden!("missing protocol for role-authorized subscription"))?;
            return protocol::authorize_role(
                owner,
                protocol,
                role,
                self.descriptor.filter.context_id.as_deref(),
                author,
                provider,
            )
            .await;
        }
        if let Some(grant_id) = &payload.permission_grant_id {
            let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
            grant.verify(owner, author, self.descriptor(), provider).await?;
            if let Some(protocol) = grant.data.scope.protocol() {
                if self.descriptor.filter.protocol.as_deref() != Some(protocol) {
                    return Err(forbidden!("grant and filter protocols do not match"));
                }
            }
        }
        Ok(())
    }
}

/// Whether `event` should be visible to `author` (`None` for anonymous),
/// given the subscription isn't owner-scoped.
fn visible_to(event: &Event, author: Option<&str>) -> bool {
    let published = event.indexes.get("published").and_then(serde_json::Value::as_bool).unwrap_or(false);
    if published {
        return true;
    }
    author.is_some_and(|a| {
        event.indexes.get("author").and_then(serde_json::Value::as_str) == Some(a)
            || event.indexes.get("recipient").and_then(serde_json::Value::as_str) == Some(a)
    })
}

/// Handles a `RecordsSubscribe`: authorizes the caller, then opens a live
/// tail of matching events filtered to what they may see.
///
/// # Errors
/// Returns an error if authorization fails.
pub async fn handle(
    owner: &str, subscribe: Subscribe, provider: &impl Provider,
) -> Result<Reply<SubscribeReply>> {
    let author = match &subscribe.authorization {
        Some(authzn) => {
            authzn.verify(provider, provider.signature_cache()).await?;
            Some(authzn.author()?)
        }
        None => None,
    };
    if let Some(author) = &author {
        subscribe.authorize(owner, author, provider).await?;
    }

    let filter = subscribe.descriptor.filter.normalize()?;
    let is_owner = author.as_deref() == Some(owner);
    let rx = EventStream::subscribe(provider, owner).await?;

    let stream = futures::stream::unfold(rx, move |mut rx| {
        let filter = filter.clone();
        let author = author.clone();
        async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if !SubscribeFilter::Records(filter.clone()).is_match(&event) {
                            continue;
                        }
                        if !is_owner && !visible_to(&event, author.as_deref()) {
                            continue;
                        }
                        return Some((event, rx));
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        }
    });

    Ok(Reply::ok(SubscribeReply { subscription: Subscriber::new(Box::pin(stream)) }))
}

/// Reply to a `RecordsSubscribe`.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SubscribeReply {
    /// The live subscription to matching events.
    #[serde(skip)]
    pub subscription: Subscriber,
}

/// Builds a `RecordsSubscribe` message.
#[derive(Clone, Debug, Default)]
pub struct SubscribeBuilder {
    filter: RecordsFilter,
    message_timestamp: Option<DateTime<Utc>>,
    permission_grant_id: Option<String>,
    protocol_role: Option<String>,
    delegated_grant: Option<DelegatedGrant>,
    authorize: Option<bool>,
}

impl SubscribeBuilder {
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

    /// Specifies the permission grant ID authorizing this subscription.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Specifies a protocol role authorizing this subscription.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// The delegated grant used to sign this subscription.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: DelegatedGrant) -> Self {
        self.delegated_grant = Some(delegated_grant);
        self
    }

    /// Specify whether to attach an authorization envelope. Defaults to
    /// `true`; set `false` to subscribe only to published records.
    #[must_use]
    pub const fn authorize(mut self, authorize: bool) -> Self {
        self.authorize = Some(authorize);
        self
    }

    /// Signs and builds the subscribe message.
    ///
    /// # Errors
    /// Returns an error if the descriptor cannot be CID-encoded or signing
    /// fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Subscribe> {
        let descriptor = SubscribeDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Subscribe,
                message_timestamp: self.message_timestamp.unwrap_or_else(Utc::now),
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

        Ok(Subscribe { descriptor, authorization })
    }
}

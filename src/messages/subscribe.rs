//! `MessagesSubscribe`: opens a live tail of every interface's events
//! matching a filter, tenant-wide (as opposed to `RecordsSubscribe`, which
//! is scoped to `RecordsWrite`/`RecordsDelete`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use super::MessagesFilter;
use crate::auth::{Authorization, AuthorizationBuilder, Signer};
use crate::endpoint::{Message, Reply};
use crate::event::{Event, SubscribeFilter, Subscriber};
use crate::permissions;
use crate::provider::{EventStream, Provider};
use crate::{Descriptor, Interface, Method, Result, forbidden};

/// A `MessagesSubscribe` message: subscribes to messages matching any of
/// `filters`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscribe {
    /// The Subscribe descriptor.
    pub descriptor: SubscribeDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

/// `MessagesSubscribe` descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// Filters to apply; a message matching any filter in the list is
    /// included (disjunction). An empty list matches every message.
    pub filters: Vec<MessagesFilter>,
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
        Some(&self.authorization)
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

impl Subscribe {
    async fn authorize(&self, owner: &str, author: &str, provider: &impl Provider) -> Result<()> {
        if author == owner {
            return Ok(());
        }
        let Some(grant_id) = &self.authorization.payload()?.permission_grant_id else {
            return Err(forbidden!("author has no grant"));
        };
        let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
        grant.verify(owner, author, self.descriptor(), provider).await?;
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

/// Handles a `MessagesSubscribe`: authorizes the caller, then opens a live
/// tail of every event matching any of the request's filters.
///
/// # Errors
/// Returns an error if authorization fails.
pub async fn handle(
    owner: &str, subscribe: Subscribe, provider: &impl Provider,
) -> Result<Reply<SubscribeReply>> {
    subscribe.authorization.verify(provider, provider.signature_cache()).await?;
    let author = subscribe.authorization.author()?;
    subscribe.authorize(owner, &author, provider).await?;

    let rx = EventStream::subscribe(provider, owner).await?;
    let filters = subscribe.descriptor.filters;

    let stream = futures::stream::unfold(rx, move |mut rx| {
        let filters = filters.clone();
        async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let matches = filters.is_empty()
                            || filters.iter().any(|f| SubscribeFilter::Messages(vec![f.clone()]).is_match(&event));
                        if !matches {
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

/// Reply to a `MessagesSubscribe`.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SubscribeReply {
    /// The live subscription to matching events.
    #[serde(skip)]
    pub subscription: Subscriber,
}

/// Builds a `MessagesSubscribe` message.
#[derive(Clone, Debug, Default)]
pub struct SubscribeBuilder {
    filters: Vec<MessagesFilter>,
    message_timestamp: Option<DateTime<Utc>>,
    permission_grant_id: Option<String>,
}

impl SubscribeBuilder {
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

    /// Specifies the permission grant ID authorizing this subscription.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
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
                interface: Interface::Messages,
                method: Method::Subscribe,
                message_timestamp: self.message_timestamp.unwrap_or_else(Utc::now),
            },
            filters: self.filters,
        };

        let mut auth_builder =
            AuthorizationBuilder::new().descriptor_cid(crate::cid::compute_cid(&descriptor)?);
        if let Some(id) = self.permission_grant_id {
            auth_builder = auth_builder.permission_grant_id(Some(id));
        }
        let authorization = auth_builder.build(signer).await?;

        Ok(Subscribe { descriptor, authorization })
    }
}

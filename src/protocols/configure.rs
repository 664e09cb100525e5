//! `ProtocolsConfigure`: installs a protocol definition — the rule set tree
//! [`crate::records::protocol`] authorizes record writes and queries
//! against.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::{Authorization, AuthorizationBuilder, Signer};
use crate::did::PublicKeyJwk;
use crate::endpoint::{Message, Reply};
use crate::permissions;
use crate::provider::{EventLog, MessageStore, Provider};
use crate::records::{SizeRange, Write};
use crate::store::{Entry, EntryType};
use crate::{Descriptor, Error, Interface, Method, Result, bad_request, forbidden, utils};

/// A `ProtocolsConfigure` message: installs or replaces a protocol
/// definition for the tenant.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Configure {
    /// The Configure descriptor.
    pub descriptor: ConfigureDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

impl Message for Configure {
    type Reply = ConfigureReply;

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

/// Handles a `ProtocolsConfigure` message: the tenant may always configure
/// its own protocols; a non-owner must invoke an active permission grant
/// scoped to `{interface: Protocols, method: Configure}`. Newest
/// `messageTimestamp` wins; losers (and the records written under them,
/// out of scope here) are reaped.
///
/// # Errors
/// Returns [`crate::Error::Unauthorized`] if the signer is not the tenant
/// and holds no valid grant, and [`crate::Error::Conflict`] if a newer
/// definition already exists.
pub async fn handle(owner: &str, configure: Configure, provider: &impl Provider) -> Result<Reply<ConfigureReply>> {
    configure.authorization.verify(provider, provider.signature_cache()).await?;
    let author = configure.authorization.author()?;
    if author != owner {
        let grant_id = configure
            .authorization
            .payload()?
            .permission_grant_id
            .ok_or_else(|| forbidden!("only the tenant may configure its own protocols"))?;
        let grant = permissions::fetch_grant(owner, &grant_id, provider).await?;
        grant.verify(owner, &author, configure.descriptor(), provider).await?;
    }

    let protocol = &configure.descriptor.definition.protocol;
    let existing = current_configure(owner, protocol, provider).await?;
    if let Some((_, current)) = &existing {
        if current.descriptor.base.message_timestamp >= configure.descriptor.base.message_timestamp {
            return Err(Error::Conflict("ProtocolsConfigureConflict: newer definition exists".to_string()));
        }
    }

    let message_cid = configure.cid()?;
    if let Some((current_cid, _)) = existing {
        MessageStore::delete(provider, owner, &current_cid).await?;
        EventLog::delete_by_cid(provider, owner, &[current_cid]).await?;
    }

    let indexes = BTreeMap::from([
        ("interface".to_string(), Value::String(Interface::Protocols.to_string())),
        ("method".to_string(), Value::String(Method::Configure.to_string())),
        ("protocol".to_string(), Value::String(protocol.clone())),
        (
            "messageTimestamp".to_string(),
            Value::String(configure.descriptor.base.message_timestamp.to_rfc3339()),
        ),
    ]);
    let entry = Entry { message: EntryType::Configure(configure), indexes: indexes.clone() };
    MessageStore::put(provider, owner, &message_cid, &entry).await?;
    EventLog::append(provider, owner, &message_cid, indexes).await?;

    Ok(Reply::accepted())
}

/// Finds the tenant's current definition for `protocol`, if any.
pub(crate) async fn current_configure(
    owner: &str, protocol: &str, provider: &impl Provider,
) -> Result<Option<(String, Configure)>> {
    use crate::store::index::{Filter, FilterVal, QueryOptions};
    let mut filter = Filter::default();
    filter.0.insert("protocol".to_string(), FilterVal::Equal(Value::String(protocol.to_string())));
    filter.0.insert("method".to_string(), FilterVal::Equal(Value::String(Method::Configure.to_string())));
    let opts =
        QueryOptions { sort_property: "messageTimestamp".to_string(), reverse: true, limit: Some(1), cursor: None };

    let (entries, _) = MessageStore::query(provider, owner, &[filter], &opts).await?;
    for entry in entries {
        if let EntryType::Configure(configure) = entry.message {
            let cid = crate::cid::compute_cid(&configure)?;
            return Ok(Some((cid, configure)));
        }
    }
    Ok(None)
}

/// Reply to a `ProtocolsConfigure` message: an empty 202 on success.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ConfigureReply;

/// `ProtocolsConfigure` descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The protocol definition.
    pub definition: ProtocolDefinition,
}

/// A protocol definition: the rooted tree of allowed record types and the
/// action rules that govern them.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolDefinition {
    /// Protocol URI.
    pub protocol: String,

    /// Whether the definition itself may be returned by an unauthorized
    /// `ProtocolsQuery`.
    pub published: bool,

    /// Allowed record types, keyed by type name.
    pub types: BTreeMap<String, Type>,

    /// Rule sets, keyed by top-level protocol path segment.
    pub structure: BTreeMap<String, RuleSet>,
}

/// A record type allowed by a protocol.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Type {
    /// The record's data schema, if constrained.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Data formats the record's payload may take.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_formats: Option<Vec<String>>,
}

/// The rule set governing a protocol path: action rules, role/size/tag
/// constraints, encryption config, and nested child rule sets.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RuleSet {
    /// Path-scoped encryption config.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$encryption")]
    pub encryption: Option<PathEncryption>,

    /// Action rules governing this path.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$actions")]
    pub actions: Option<Vec<ActionRule>>,

    /// Marks this path as a role record.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$role")]
    pub role: Option<bool>,

    /// Record size constraint for this path.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$size")]
    pub size: Option<SizeRange>,

    /// Tag constraints for this path.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$tags")]
    pub tags: Option<Tags>,

    /// Child rule sets, keyed by child type name.
    #[serde(flatten)]
    pub nested: BTreeMap<String, RuleSet>,
}

/// Path encryption config.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathEncryption {
    /// The id of the root key this path's key is derived from.
    pub root_key_id: String,

    /// Public key used to encrypt the symmetric data-encryption key.
    pub public_key_jwk: PublicKeyJwk,
}

/// A single action rule: who can perform which actions at this path.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRule {
    /// The actor this rule grants to. Mutually exclusive with `role`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub who: Option<Actor>,

    /// The protocol path of a `$role: true` record granting this rule.
    /// Mutually exclusive with `who`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// The protocol path this rule is relative to. Required when `who` is
    /// `author` or `recipient`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub of: Option<String>,

    /// The actions the actor/role may perform.
    pub can: Vec<Action>,
}

/// The actor an [`ActionRule`] grants to.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Actor {
    /// Anyone may perform the action.
    #[default]
    Anyone,
    /// The author of the record at `of`.
    Author,
    /// The recipient of the record at `of`.
    Recipient,
}

/// An action an [`ActionRule`] may grant.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    /// Create a new record.
    Create,
    /// Delete a record.
    Delete,
    /// Prune a record and its descendants.
    Prune,
    /// Query for records.
    Query,
    /// Subscribe to matching records.
    Subscribe,
    /// Read a record.
    #[default]
    Read,
    /// Update an existing record.
    Update,
    /// Delete on behalf of the owner.
    #[serde(rename = "co-delete")]
    CoDelete,
    /// Prune on behalf of the owner.
    #[serde(rename = "co-prune")]
    CoPrune,
    /// Update on behalf of the owner.
    #[serde(rename = "co-update")]
    CoUpdate,
}

/// Tag constraints for a protocol path.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tags {
    /// Tag keys every record at this path must carry.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$requiredTags")]
    pub required_tags: Option<Vec<String>>,

    /// Whether tags outside those explicitly listed are permitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$allowUndefinedTags")]
    pub allow_undefined_tags: Option<bool>,

    /// Per-tag JSON Schema constraints.
    #[serde(flatten)]
    pub defined_tags: BTreeMap<String, Value>,
}

/// Builds a signed [`Configure`] message.
#[derive(Clone, Debug, Default)]
pub struct ConfigureBuilder {
    definition: Option<ProtocolDefinition>,
    delegated_grant: Option<Write>,
    permission_grant_id: Option<String>,
}

impl ConfigureBuilder {
    /// Starts an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the protocol definition to install.
    #[must_use]
    pub fn definition(mut self, definition: ProtocolDefinition) -> Self {
        self.definition = Some(definition);
        self
    }

    /// Attaches a delegated grant the signer is acting under.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: Write) -> Self {
        self.delegated_grant = Some(delegated_grant);
        self
    }

    /// Invokes a permission grant when signing.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Normalizes and structurally validates the definition, then signs and
    /// builds the message.
    ///
    /// # Errors
    /// Returns [`crate::Error::BadRequest`] if the definition is missing or
    /// structurally invalid, or an error if signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Configure> {
        let mut definition =
            self.definition.ok_or_else(|| bad_request!("protocol definition is required"))?;
        definition.protocol = utils::clean_url(&definition.protocol)?;
        for t in definition.types.values_mut() {
            if let Some(schema) = &t.schema {
                t.schema = Some(utils::clean_url(schema)?);
            }
        }
        verify_structure(&definition)?;

        let descriptor = ConfigureDescriptor {
            base: Descriptor { interface: Interface::Protocols, method: Method::Configure, message_timestamp: Utc::now() },
            definition,
        };
        let descriptor_cid = crate::cid::compute_cid(&descriptor)?;

        let mut builder = AuthorizationBuilder::new().descriptor_cid(descriptor_cid);
        if let Some(id) = self.permission_grant_id {
            builder = builder.permission_grant_id(Some(id));
        }
        let authorization = builder.build(signer).await?;

        Ok(Configure { descriptor, authorization })
    }
}

/// Structurally validates a protocol definition: rule-set invariants,
/// `$size` bounds, role paths, nesting depth.
///
/// # Errors
/// Returns [`crate::Error::BadRequest`] naming the offending rule.
fn verify_structure(definition: &ProtocolDefinition) -> Result<()> {
    let types: Vec<&String> = definition.types.keys().collect();
    for rule_set in definition.structure.values() {
        let roles = role_paths("", rule_set, Vec::new())?;
        verify_rule_set(rule_set, "", &types, &roles)?;
    }
    Ok(())
}

fn verify_rule_set(
    rule_set: &RuleSet, protocol_path: &str, types: &[&String], roles: &[String],
) -> Result<()> {
    if let Some(size) = &rule_set.size {
        if let (Some(min), Some(max)) = (size.min, size.max) {
            if min > max {
                return Err(bad_request!("invalid $size range at '{protocol_path}'"));
            }
        }
    }

    let actions = rule_set.actions.as_deref().unwrap_or(&[]);
    for (i, action) in actions.iter().enumerate() {
        if let Some(role) = &action.role {
            if !roles.iter().any(|r| r == role) {
                return Err(bad_request!("missing role '{role}' in action for '{protocol_path}'"));
            }
            let read_like = [Action::Read, Action::Query, Action::Subscribe];
            if !read_like.iter().all(|ra| action.can.contains(ra)) {
                return Err(bad_request!("role '{role}' missing read-like action(s) for '{protocol_path}'"));
            }
        }

        if action.who == Some(Actor::Anyone) && action.of.is_some() {
            return Err(bad_request!("`of` must not be set when `who` is 'anyone' for '{protocol_path}'"));
        }
        if action.who == Some(Actor::Recipient) && action.of.is_none() {
            let allowed = [Action::CoUpdate, Action::CoDelete, Action::CoPrune];
            if !allowed.iter().any(|ra| action.can.contains(ra)) {
                return Err(bad_request!(
                    "recipient action without `of` must contain only co-update, co-delete, co-prune"
                ));
            }
        }
        if action.who == Some(Actor::Author) && action.of.is_none() {
            return Err(bad_request!("`of` must be set when `who` is 'author' for '{protocol_path}'"));
        }
        if action.can.contains(&Action::Update) && !action.can.contains(&Action::Create) {
            return Err(bad_request!("action rule contains 'update' but no 'create' at '{protocol_path}'"));
        }
        if action.can.contains(&Action::Delete) && !action.can.contains(&Action::Create) {
            return Err(bad_request!("action rule contains 'delete' but no 'create' at '{protocol_path}'"));
        }

        for other in &actions[i + 1..] {
            if action.who.is_some() {
                if action.who == other.who && action.of == other.of {
                    return Err(bad_request!(
                        "more than one action rule for the same actor/of at '{protocol_path}'"
                    ));
                }
            } else if action.role == other.role {
                return Err(bad_request!("more than one action rule for the same role at '{protocol_path}'"));
            }
        }
    }

    for (name, nested) in &rule_set.nested {
        if !types.iter().any(|t| *t == name) {
            return Err(bad_request!("rule set '{name}' is not a declared type"));
        }
        let child_path =
            if protocol_path.is_empty() { name.clone() } else { format!("{protocol_path}/{name}") };
        verify_rule_set(nested, &child_path, types, roles)?;
    }

    Ok(())
}

/// Collects every role (`$role: true`) path under `rule_set`.
fn role_paths(protocol_path: &str, rule_set: &RuleSet, mut roles: Vec<String>) -> Result<Vec<String>> {
    if protocol_path.split('/').filter(|s| !s.is_empty()).count() > 10 {
        return Err(bad_request!("record nesting depth exceeded 10 levels"));
    }
    for (name, nested) in &rule_set.nested {
        let child_path =
            if protocol_path.is_empty() { name.clone() } else { format!("{protocol_path}/{name}") };
        if nested.role == Some(true) {
            roles.push(child_path);
        } else {
            roles = role_paths(&child_path, nested, roles)?;
        }
    }
    Ok(roles)
}

//! Protocol-based authorization (C8): resolves the installed protocol
//! definition for a record, walks its rule-set tree to the record's
//! protocol path, and checks type/size/tag constraints plus the `$actions`
//! rules that decide whether a non-owner may write, delete, or read it.

use serde_json::Value;

use crate::protocols::configure::current_configure;
use crate::protocols::{Action, ActionRule, Actor, ProtocolDefinition, RuleSet};
use crate::provider::{MessageStore, Provider};
use crate::records::write::initial_write;
use crate::records::{Delete, Write};
use crate::store::index::{Filter, FilterVal, QueryOptions};
use crate::{Result, bad_request, forbidden};

/// Authorizes a `RecordsWrite`: resolves the record's protocol definition,
/// checks the declared type/size/tag constraints, and (for non-owners)
/// the `$actions` rule permitting the create/update.
///
/// # Errors
/// Returns [`crate::Error::Unauthorized`] if no rule permits the write, and
/// [`crate::Error::BadRequest`] if the record violates its protocol's
/// structural constraints.
pub(crate) async fn authorize_write(
    owner: &str, write: &Write, provider: &impl Provider,
) -> Result<()> {
    let author = write.authorization.author()?;

    let Some(protocol) = &write.descriptor.protocol else {
        return if author == owner { Ok(()) } else { Err(forbidden!("write request failed authorization")) };
    };

    if protocol == crate::protocols::PERMISSIONS_PROTOCOL_URI {
        return if author == owner { Ok(()) } else { Err(forbidden!("write request failed authorization")) };
    }

    let definition = fetch_definition(owner, protocol, provider).await?;
    let protocol_path = write
        .descriptor
        .protocol_path
        .as_deref()
        .ok_or_else(|| bad_request!("missing protocol path"))?;

    verify_type(&definition, protocol_path, write)?;
    verify_protocol_path(owner, write, provider).await?;

    let rule_set = rule_set(&definition, protocol_path)
        .ok_or_else(|| bad_request!("no rule set found for protocol path `{protocol_path}`"))?;

    if let Some(size) = &rule_set.size {
        if !size.contains(write.descriptor.data_size) {
            return Err(forbidden!("record size outside of protocol's allowed range"));
        }
    }
    verify_tags(rule_set, write)?;

    if author == owner {
        return Ok(());
    }

    let action = if write.is_initial()? { Action::Create } else { Action::Update };
    verify_actions(owner, &author, action, write, rule_set, provider).await
}

/// Authorizes a non-owner `RecordsDelete` of `write`: checks the `$actions`
/// rule permitting `delete`/`prune` (or `co-delete`/`co-prune`).
///
/// # Errors
/// Returns [`crate::Error::Unauthorized`] if no rule permits the delete.
pub(crate) async fn authorize_delete(
    owner: &str, delete: &Delete, write: &Write, provider: &impl Provider,
) -> Result<()> {
    let author = delete.authorization.author()?;
    if author == owner {
        return Ok(());
    }

    let Some(protocol) = &write.descriptor.protocol else {
        return Err(forbidden!("delete request failed authorization"));
    };
    let definition = fetch_definition(owner, protocol, provider).await?;
    let protocol_path = write.descriptor.protocol_path.as_deref().unwrap_or_default();
    let rule_set = rule_set(&definition, protocol_path)
        .ok_or_else(|| forbidden!("no rule set found for protocol path `{protocol_path}`"))?;

    let action = if delete.descriptor.prune { Action::Prune } else { Action::Delete };
    if verify_actions(owner, &author, action, write, rule_set, provider).await.is_ok() {
        return Ok(());
    }
    let co_action = if delete.descriptor.prune { Action::CoPrune } else { Action::CoDelete };
    verify_actions(owner, &author, co_action, write, rule_set, provider).await
}

/// Authorizes a non-owner `RecordsRead`/`MessagesRead` of `write`: checks
/// the `$actions` rule permitting `read`.
///
/// # Errors
/// Returns [`crate::Error::Unauthorized`] if no rule permits the read.
pub(crate) async fn authorize_read(
    owner: &str, write: &Write, reader: &str, provider: &impl Provider,
) -> Result<()> {
    let Some(protocol) = &write.descriptor.protocol else {
        return Err(forbidden!("read request failed authorization"));
    };
    let definition = fetch_definition(owner, protocol, provider).await?;
    let protocol_path = write.descriptor.protocol_path.as_deref().unwrap_or_default();
    let rule_set = rule_set(&definition, protocol_path)
        .ok_or_else(|| forbidden!("no rule set found for protocol path `{protocol_path}`"))?;
    verify_actions(owner, reader, Action::Read, write, rule_set, provider).await
}

/// Authorizes a non-owner `RecordsQuery`/`RecordsSubscribe` invoking a
/// protocol role, i.e. checks `participant` holds an active `$role` record
/// at `role` granting them visibility within `context_id` (or globally, if
/// `role` names a top-level role).
///
/// # Errors
/// Returns [`crate::Error::Unauthorized`] if `participant` does not hold
/// the role.
pub(crate) async fn authorize_role(
    owner: &str, protocol: &str, role: &str, context_id: Option<&str>, participant: &str,
    provider: &impl Provider,
) -> Result<()> {
    if verify_role(owner, protocol, role, context_id, participant, provider).await? {
        Ok(())
    } else {
        Err(forbidden!("role `{role}` not held by `{participant}`"))
    }
}

async fn fetch_definition(
    owner: &str, protocol: &str, provider: &impl Provider,
) -> Result<ProtocolDefinition> {
    let Some((_, configure)) = current_configure(owner, protocol, provider).await? else {
        return Err(forbidden!("unable to find protocol definition for `{protocol}`"));
    };
    Ok(configure.descriptor.definition)
}

fn rule_set<'a>(definition: &'a ProtocolDefinition, protocol_path: &str) -> Option<&'a RuleSet> {
    let mut segments = protocol_path.split('/');
    let mut current = definition.structure.get(segments.next()?)?;
    for segment in segments {
        current = current.nested.get(segment)?;
    }
    Some(current)
}

fn verify_type(definition: &ProtocolDefinition, protocol_path: &str, write: &Write) -> Result<()> {
    let type_name = protocol_path.rsplit('/').next().unwrap_or(protocol_path);
    let Some(type_def) = definition.types.get(type_name) else {
        return Err(bad_request!("record type `{type_name}` not declared by protocol"));
    };
    if let Some(schema) = &type_def.schema {
        if write.descriptor.schema.as_deref() != Some(schema.as_str()) {
            return Err(bad_request!("schema does not match protocol type `{type_name}`"));
        }
    }
    if let Some(formats) = &type_def.data_formats {
        if !formats.iter().any(|f| f == &write.descriptor.data_format) {
            return Err(bad_request!("data format not permitted for protocol type `{type_name}`"));
        }
    }
    Ok(())
}

async fn verify_protocol_path(owner: &str, write: &Write, provider: &impl Provider) -> Result<()> {
    let own_path = write.descriptor.protocol_path.clone().unwrap_or_default();

    let Some(parent_id) = &write.descriptor.parent_id else {
        if own_path.contains('/') {
            return Err(bad_request!("root record's protocol path must not be nested"));
        }
        return Ok(());
    };
    let Some(parent) = initial_write(owner, parent_id, provider).await? else {
        return Err(bad_request!("parent record not found"));
    };
    let parent_path = parent.descriptor.protocol_path.clone().unwrap_or_default();
    let expected_prefix = format!("{parent_path}/");
    if !own_path.starts_with(&expected_prefix) || own_path[expected_prefix.len()..].contains('/') {
        return Err(bad_request!("protocol path does not match parent record"));
    }
    if write.descriptor.context_id != parent.descriptor.context_id {
        return Err(bad_request!("context id does not match parent record"));
    }
    Ok(())
}

fn verify_tags(rule_set: &RuleSet, write: &Write) -> Result<()> {
    let Some(tag_rules) = &rule_set.tags else {
        return Ok(());
    };
    let tags = write.descriptor.tags.clone().unwrap_or_default();
    if let Some(required) = &tag_rules.required_tags {
        for tag in required {
            if !tags.contains_key(tag) {
                return Err(bad_request!("missing required tag `{tag}`"));
            }
        }
    }
    if tag_rules.allow_undefined_tags != Some(true) {
        for key in tags.keys() {
            if !tag_rules.defined_tags.contains_key(key) {
                return Err(bad_request!("tag `{key}` not permitted by protocol"));
            }
        }
    }
    Ok(())
}

async fn record_chain(owner: &str, write: &Write, provider: &impl Provider) -> Result<Vec<Write>> {
    let mut chain = vec![write.clone()];
    let mut parent_id = write.descriptor.parent_id.clone();
    while let Some(pid) = parent_id {
        let Some(parent) = initial_write(owner, &pid, provider).await? else {
            break;
        };
        parent_id = parent.descriptor.parent_id.clone();
        chain.push(parent);
    }
    chain.reverse();
    Ok(chain)
}

async fn verify_actions(
    owner: &str, author: &str, action: Action, write: &Write, rule_set: &RuleSet,
    provider: &impl Provider,
) -> Result<()> {
    let rules = rule_set.actions.as_deref().unwrap_or(&[]);
    for rule in rules {
        if !rule.can.contains(&action) {
            continue;
        }
        if check_actor(owner, author, rule, write, provider).await? {
            return Ok(());
        }
    }
    Err(forbidden!("no protocol rule permits this action"))
}

async fn check_actor(
    owner: &str, author: &str, rule: &ActionRule, write: &Write, provider: &impl Provider,
) -> Result<bool> {
    if let Some(who) = rule.who {
        let Some(of) = &rule.of else {
            return Ok(matches!(who, Actor::Anyone));
        };
        let chain = record_chain(owner, write, provider).await?;
        return Ok(chain.iter().any(|w| {
            if w.descriptor.protocol_path.as_deref() != Some(of.as_str()) {
                return false;
            }
            match who {
                Actor::Anyone => true,
                Actor::Author => w.authorization.author().ok().as_deref() == Some(author),
                Actor::Recipient => w.descriptor.recipient.as_deref() == Some(author),
            }
        }));
    }
    if let Some(role) = &rule.role {
        return verify_role(
            owner,
            write.descriptor.protocol.as_deref().unwrap_or_default(),
            role,
            write.descriptor.context_id.as_deref(),
            author,
            provider,
        )
        .await;
    }
    Ok(false)
}

async fn verify_role(
    owner: &str, protocol: &str, role_path: &str, context_id: Option<&str>, participant: &str,
    provider: &impl Provider,
) -> Result<bool> {
    let mut filter = Filter::default();
    filter.0.insert("protocol".to_string(), FilterVal::Equal(Value::String(protocol.to_string())));
    filter.0.insert(
        "protocolPath".to_string(),
        FilterVal::Equal(Value::String(role_path.to_string())),
    );
    filter.0.insert(
        "recipient".to_string(),
        FilterVal::Equal(Value::String(participant.to_string())),
    );
    if role_path.contains('/') {
        let Some(cid) = context_id else {
            return Ok(false);
        };
        filter.0.insert("contextId".to_string(), FilterVal::Equal(Value::String(cid.to_string())));
    }
    let opts = QueryOptions {
        sort_property: "messageTimestamp".to_string(),
        reverse: false,
        limit: Some(1),
        cursor: None,
    };
    let (entries, _) = MessageStore::query(provider, owner, &[filter], &opts).await?;
    Ok(!entries.is_empty())
}

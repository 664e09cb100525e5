//! Index Engine (C2): property-indexed and reverse-lookup entries per
//! tenant; equality/set/range filter queries with sort+cursor pagination,
//! tiebroken by message CID. See design notes §4.2.
//!
//! Keyspace, within a tenant-scoped [`Kv`]:
//! ```text
//! __<property>__/<encoded-value>\x00<itemId>  ->  JSON IndexEntry
//! /index/<itemId>                              ->  JSON IndexEntry (reverse lookup)
//! ```
//! `\x00` never appears inside an encoded value, so the property partition
//! sorts by value first and item id second, matching the sort+tiebreak rule.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::kv::{KeyRange, Kv, Op};
use crate::{Result, bad_request, unexpected};

/// A single indexed item, as stored at both the property and reverse-lookup
/// keys.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct IndexEntry {
    /// The id of the indexed item (a message CID, in this crate's usage).
    pub item_id: String,
    /// The CID of the message that produced this entry, used as the final
    /// sort tiebreak. For most entries this equals `item_id`.
    pub message_cid: String,
    /// The full flattened index map extracted from the item at write time.
    pub indexes: BTreeMap<String, Value>,
}

/// A single property condition within a [`Filter`].
#[derive(Clone, Debug)]
pub enum FilterVal {
    /// Exact match.
    Equal(Value),
    /// Match any of the given values.
    OneOf(Vec<Value>),
    /// Match within a (possibly open) range.
    Range(ValueRange),
}

/// A bound on an indexed value. Comparisons use the same byte-ordering
/// encoding as the keyspace, so ranges over numbers and strings both sort
/// correctly.
#[derive(Clone, Debug, Default)]
pub struct ValueRange {
    /// Exclusive lower bound.
    pub gt: Option<Value>,
    /// Inclusive lower bound.
    pub gte: Option<Value>,
    /// Exclusive upper bound.
    pub lt: Option<Value>,
    /// Inclusive upper bound.
    pub lte: Option<Value>,
}

/// A conjunction (AND) of property conditions. A query's overall filter is a
/// disjunction (OR) of these — see [`query`].
#[derive(Clone, Debug, Default)]
pub struct Filter(pub BTreeMap<String, FilterVal>);

impl Filter {
    fn matches(&self, indexes: &BTreeMap<String, Value>) -> bool {
        self.0.iter().all(|(property, cond)| match cond {
            FilterVal::Equal(v) => indexes.get(property) == Some(v),
            FilterVal::OneOf(vs) => indexes.get(property).is_some_and(|iv| vs.contains(iv)),
            FilterVal::Range(r) => indexes.get(property).is_some_and(|iv| value_in_range(iv, r)),
        })
    }
}

/// Sort + pagination options for a [`query`] call.
#[derive(Clone, Debug)]
pub struct QueryOptions {
    /// The indexed property to sort results by.
    pub sort_property: String,
    /// Sort newest/largest first when `true`.
    pub reverse: bool,
    /// Maximum number of entries to return.
    pub limit: Option<usize>,
    /// Resume after this position, from a previous page's returned cursor.
    pub cursor: Option<Cursor>,
}

/// An opaque pagination cursor: the sort key and ids of the last item
/// returned by the previous page.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Cursor {
    /// The encoded sort-property value of the last item on the prior page.
    pub sort_key: String,
    /// The item id of the last item on the prior page.
    pub item_id: String,
    /// The message CID of the last item on the prior page.
    pub message_cid: String,
}

/// Priority list used to pick each filter's most selective search property.
const SEARCH_PRIORITY: &[&str] =
    &["recordId", "permissionsGrantId", "contextId", "schema", "protocolPath", "protocol"];

/// The subset of [`SEARCH_PRIORITY`] eligible to be a *common* search
/// property shared across every filter in a disjunction.
const COMMON_PRIORITY: &[&str] = &["contextId", "schema", "protocolPath", "protocol"];

/// Encodes a value into its byte-order-preserving string form (§6).
///
/// Strings are quoted so they always sort after numbers and booleans.
/// Numbers are sign-prefixed, zero-padded decimal strings, offset so that
/// negative numbers compare correctly below non-negative ones.
#[must_use]
pub fn encode_value(value: &Value) -> String {
    const WIDTH: usize = 16;
    const OFFSET: i64 = 9_007_199_254_740_991; // Number.MAX_SAFE_INTEGER

    match value {
        Value::String(s) => format!("\"{s}\""),
        Value::Bool(b) => (if *b { "true" } else { "false" }).to_string(),
        Value::Null => "null".to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i >= 0 {
                    format!("1{i:0width$}", width = WIDTH)
                } else {
                    format!("0{:0width$}", OFFSET + i, width = WIDTH)
                }
            } else if let Some(f) = n.as_f64() {
                #[allow(clippy::cast_possible_truncation)]
                let i = f.round() as i64;
                encode_value(&Value::Number(i.into()))
            } else {
                String::new()
            }
        }
        _ => String::new(),
    }
}

fn value_in_range(v: &Value, range: &ValueRange) -> bool {
    let enc = encode_value(v);
    if let Some(b) = &range.gte {
        if enc < encode_value(b) {
            return false;
        }
    }
    if let Some(b) = &range.gt {
        if enc <= encode_value(b) {
            return false;
        }
    }
    if let Some(b) = &range.lte {
        if enc > encode_value(b) {
            return false;
        }
    }
    if let Some(b) = &range.lt {
        if enc >= encode_value(b) {
            return false;
        }
    }
    true
}

fn property_prefix(property: &str) -> Vec<u8> {
    format!("__{property}__/").into_bytes()
}

fn reverse_key(item_id: &str) -> Vec<u8> {
    format!("/index/{item_id}").into_bytes()
}

/// Smallest byte string greater than every string with the given prefix,
/// used to bound a scan to exactly that prefix's subtree.
fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut v = prefix.to_vec();
    while let Some(last) = v.pop() {
        if last < 0xff {
            v.push(last + 1);
            return v;
        }
    }
    vec![0xff; prefix.len() + 1]
}

/// Builds the `[gte, lt)` key bound covering exactly the keys for one
/// property's value range (or, when both ends are the same `Equal` bound,
/// exactly the keys equal to that value).
fn property_keyrange(property: &str, range: &ValueRange) -> KeyRange {
    let prefix = property_prefix(property);

    let lower = if let Some(v) = &range.gte {
        let mut b = prefix.clone();
        b.extend(encode_value(v).into_bytes());
        b.push(0x00);
        b
    } else if let Some(v) = &range.gt {
        let mut b = prefix.clone();
        b.extend(encode_value(v).into_bytes());
        b.push(0x01);
        b
    } else {
        prefix.clone()
    };

    let upper = if let Some(v) = &range.lte {
        let mut b = prefix.clone();
        b.extend(encode_value(v).into_bytes());
        b.push(0x01);
        b
    } else if let Some(v) = &range.lt {
        let mut b = prefix.clone();
        b.extend(encode_value(v).into_bytes());
        b.push(0x00);
        b
    } else {
        prefix_upper_bound(&prefix)
    };

    KeyRange { gte: Some(lower), lt: Some(upper), ..Default::default() }
}

fn equality_keyrange(property: &str, value: &Value) -> KeyRange {
    property_keyrange(property, &ValueRange { gte: Some(value.clone()), lte: Some(value.clone()), ..Default::default() })
}

/// Writes (or overwrites) the indexed entry for `item_id`. Requires at least
/// one index property.
///
/// # Errors
/// Returns [`crate::Error::BadRequest`] if `indexes` is empty, or
/// [`crate::Error::InternalError`] if the batch write fails.
pub async fn put(
    kv: &impl Kv, item_id: &str, message_cid: &str, indexes: &BTreeMap<String, Value>,
) -> Result<()> {
    if indexes.is_empty() {
        return Err(bad_request!("an indexed item must have at least one index"));
    }

    let entry = IndexEntry {
        item_id: item_id.to_string(),
        message_cid: message_cid.to_string(),
        indexes: indexes.clone(),
    };
    let bytes = serde_json::to_vec(&entry).map_err(|e| unexpected!("failed to encode index entry: {e}"))?;

    let mut ops = vec![Op::Put(reverse_key(item_id), bytes.clone())];
    for (property, value) in indexes {
        let mut key = property_prefix(property);
        key.extend(encode_value(value).into_bytes());
        key.push(0x00);
        key.extend(item_id.as_bytes());
        ops.push(Op::Put(key, bytes.clone()));
    }
    kv.batch(ops).await
}

/// Removes the indexed entry for `item_id`, recovering its prior indexes via
/// the reverse lookup. A missing `item_id` is a no-op.
///
/// # Errors
/// Returns [`crate::Error::InternalError`] if the stored entry is corrupt or
/// the batch delete fails.
pub async fn delete(kv: &impl Kv, item_id: &str) -> Result<()> {
    let Some(bytes) = kv.get(&reverse_key(item_id)).await? else {
        return Ok(());
    };
    let entry: IndexEntry =
        serde_json::from_slice(&bytes).map_err(|e| unexpected!("corrupt index entry: {e}"))?;

    let mut ops = vec![Op::Del(reverse_key(item_id))];
    for (property, value) in &entry.indexes {
        let mut key = property_prefix(property);
        key.extend(encode_value(value).into_bytes());
        key.push(0x00);
        key.extend(item_id.as_bytes());
        ops.push(Op::Del(key));
    }
    kv.batch(ops).await
}

/// Fetches the current index entry for `item_id`, if any, via the reverse
/// lookup.
///
/// # Errors
/// Returns [`crate::Error::InternalError`] if the stored entry is corrupt.
pub async fn get(kv: &impl Kv, item_id: &str) -> Result<Option<IndexEntry>> {
    let Some(bytes) = kv.get(&reverse_key(item_id)).await? else {
        return Ok(None);
    };
    let entry =
        serde_json::from_slice(&bytes).map_err(|e| unexpected!("corrupt index entry: {e}"))?;
    Ok(Some(entry))
}

fn common_search_property(filters: &[Filter]) -> Option<String> {
    if filters.is_empty() {
        return None;
    }
    for property in COMMON_PRIORITY {
        let mut common_value: Option<&Value> = None;
        let mut all_agree = true;
        for filter in filters {
            match filter.0.get(*property) {
                Some(FilterVal::Equal(v)) => match common_value {
                    Some(existing) if existing == v => {}
                    Some(_) => {
                        all_agree = false;
                        break;
                    }
                    None => common_value = Some(v),
                },
                _ => {
                    all_agree = false;
                    break;
                }
            }
        }
        if all_agree && common_value.is_some() {
            return Some((*property).to_string());
        }
    }
    None
}

fn per_filter_search_property(filter: &Filter) -> Option<String> {
    SEARCH_PRIORITY.iter().find(|p| filter.0.contains_key(**p)).map(|p| (*p).to_string())
}

async fn candidates_for_filter(
    kv: &impl Kv, filter: &Filter, search_property: &str,
) -> Result<Vec<IndexEntry>> {
    let keyranges = match filter.0.get(search_property) {
        Some(FilterVal::Equal(v)) => vec![equality_keyrange(search_property, v)],
        Some(FilterVal::OneOf(vs)) => {
            vs.iter().map(|v| equality_keyrange(search_property, v)).collect()
        }
        Some(FilterVal::Range(r)) => vec![property_keyrange(search_property, r)],
        None => return Ok(Vec::new()),
    };

    let mut seen = HashMap::new();
    for keyrange in keyranges {
        for (_, bytes) in kv.range(keyrange).await? {
            let entry: IndexEntry =
                serde_json::from_slice(&bytes).map_err(|e| unexpected!("corrupt index entry: {e}"))?;
            seen.entry(entry.item_id.clone()).or_insert(entry);
        }
    }
    Ok(seen.into_values().filter(|entry| filter.matches(&entry.indexes)).collect())
}

async fn sorted_scan(kv: &impl Kv, filters: &[Filter], sort_property: &str) -> Result<Vec<IndexEntry>> {
    let keyrange = KeyRange {
        gte: Some(property_prefix(sort_property)),
        lt: Some(prefix_upper_bound(&property_prefix(sort_property))),
        ..Default::default()
    };
    let mut out = Vec::new();
    for (_, bytes) in kv.range(keyrange).await? {
        let entry: IndexEntry =
            serde_json::from_slice(&bytes).map_err(|e| unexpected!("corrupt index entry: {e}"))?;
        if filters.is_empty() || filters.iter().any(|f| f.matches(&entry.indexes)) {
            out.push(entry);
        }
    }
    Ok(out)
}

fn sort_key(entry: &IndexEntry, sort_property: &str) -> Result<(String, String, String)> {
    let value = entry.indexes.get(sort_property).ok_or_else(|| {
        unexpected!("IndexInvalidSortProperty: candidate `{}` missing `{sort_property}`", entry.item_id)
    })?;
    Ok((encode_value(value), entry.item_id.clone(), entry.message_cid.clone()))
}

/// Executes a disjunctive (OR of AND) query against the index, returning a
/// page of matching entries and the cursor for the next page, if any.
///
/// # Errors
/// Returns [`crate::Error::InternalError`] (`IndexInvalidSortProperty`) if a
/// matched candidate lacks the requested sort property. A cursor pointing to
/// an item no longer present yields an empty page, not an error.
pub async fn query(
    kv: &impl Kv, filters: &[Filter], opts: &QueryOptions,
) -> Result<(Vec<IndexEntry>, Option<Cursor>)> {
    let common = common_search_property(filters);

    let mut merged: HashMap<String, IndexEntry> = HashMap::new();
    if filters.is_empty() {
        for entry in sorted_scan(kv, filters, &opts.sort_property).await? {
            merged.insert(entry.item_id.clone(), entry);
        }
    } else {
        for filter in filters {
            let search_property = common.clone().or_else(|| per_filter_search_property(filter));
            let found = if let Some(property) = search_property {
                candidates_for_filter(kv, filter, &property).await?
            } else {
                sorted_scan(kv, std::slice::from_ref(filter), &opts.sort_property).await?
            };
            for entry in found {
                merged.entry(entry.item_id.clone()).or_insert(entry);
            }
        }
    }

    let mut keyed = Vec::with_capacity(merged.len());
    for entry in merged.into_values() {
        keyed.push((sort_key(&entry, &opts.sort_property)?, entry));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    if opts.reverse {
        keyed.reverse();
    }

    let after_cursor = if let Some(cursor) = &opts.cursor {
        let cursor_key = (cursor.sort_key.clone(), cursor.item_id.clone(), cursor.message_cid.clone());
        match keyed.iter().position(|(k, _)| *k == cursor_key) {
            Some(i) => keyed.split_off(i + 1),
            None => Vec::new(),
        }
    } else {
        keyed
    };

    let limit = opts.limit.unwrap_or(after_cursor.len());
    let has_more = after_cursor.len() > limit;
    let page: Vec<IndexEntry> = after_cursor.into_iter().take(limit).map(|(_, e)| e).collect();
    let next_cursor = if has_more {
        page.last()
            .map(|e| sort_key(e, &opts.sort_property))
            .transpose()?
            .map(|(sort_key, item_id, message_cid)| Cursor { sort_key, item_id, message_cid })
    } else {
        None
    };

    Ok((page, next_cursor))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::kv::MemKv;

    fn indexes(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn equality_query_excludes_non_matching() {
        let kv = MemKv::new();
        put(&kv, "a", "a", &indexes(&[("schema", json!("s1")), ("messageTimestamp", json!(1))])).await.unwrap();
        put(&kv, "b", "b", &indexes(&[("schema", json!("s2")), ("messageTimestamp", json!(2))])).await.unwrap();
        put(&kv, "c", "c", &indexes(&[("schema", json!("s2")), ("messageTimestamp", json!(3))])).await.unwrap();

        let mut filter = Filter::default();
        filter.0.insert("schema".to_string(), FilterVal::Equal(json!("s2")));
        let opts = QueryOptions { sort_property: "messageTimestamp".to_string(), reverse: false, limit: None, cursor: None };

        let (page, cursor) = query(&kv, &[filter], &opts).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(page.iter().all(|e| e.indexes["schema"] == json!("s2")));
        assert!(cursor.is_none());
    }

    #[tokio::test]
    async fn range_closure_equals_bounds() {
        let kv = MemKv::new();
        for i in 0..5 {
            put(&kv, &format!("item{i}"), &format!("item{i}"), &indexes(&[("n", json!(i))])).await.unwrap();
        }
        let mut filter = Filter::default();
        filter.0.insert(
            "n".to_string(),
            FilterVal::Range(ValueRange { gte: Some(json!(2)), lte: Some(json!(2)), ..Default::default() }),
        );
        let opts = QueryOptions { sort_property: "n".to_string(), reverse: false, limit: None, cursor: None };
        let (page, _) = query(&kv, &[filter], &opts).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].item_id, "item2");
    }

    #[tokio::test]
    async fn cursor_pagination_matches_single_page() {
        let kv = MemKv::new();
        for i in 0..6 {
            put(&kv, &format!("item{i}"), &format!("item{i}"), &indexes(&[("n", json!(i))])).await.unwrap();
        }
        let mut cursor = None;
        let mut collected = Vec::new();
        loop {
            let opts = QueryOptions {
                sort_property: "n".to_string(),
                reverse: false,
                limit: Some(2),
                cursor: cursor.clone(),
            };
            let (page, next) = query(&kv, &[], &opts).await.unwrap();
            if page.is_empty() {
                break;
            }
            collected.extend(page.into_iter().map(|e| e.item_id));
            cursor = next;
            if cursor.is_none() {
                break;
            }
        }
        assert_eq!(collected, vec!["item0", "item1", "item2", "item3", "item4", "item5"]);
    }

    #[tokio::test]
    async fn deleted_item_drops_from_query() {
        let kv = MemKv::new();
        put(&kv, "a", "a", &indexes(&[("schema", json!("s1"))])).await.unwrap();
        delete(&kv, "a").await.unwrap();
        assert!(get(&kv, "a").await.unwrap().is_none());

        let opts = QueryOptions { sort_property: "schema".to_string(), reverse: false, limit: None, cursor: None };
        let (page, _) = query(&kv, &[], &opts).await.unwrap();
        assert!(page.is_empty());
    }
}

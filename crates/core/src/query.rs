use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::permissions::PermissionView;
use crate::stream::StreamTree;
use crate::system_streams::SystemStreamsModel;
use crate::types::{StreamId, LOCAL_STORE};

/// Which lifecycle states a read addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    #[default]
    Default,
    Trashed,
    All,
}

/// One parsed disjunct of a stream query, before expansion.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawConjunct {
    pub any: Vec<String>,
    pub all: Vec<String>,
    pub not: Vec<String>,
}

/// Parse the accepted input forms: a single id, an array of ids (implicit
/// `any`), a query object, or an array of query objects.
pub fn parse(value: &Value) -> Result<Vec<RawConjunct>, ApiError> {
    match value {
        Value::String(s) => Ok(vec![RawConjunct {
            any: vec![s.clone()],
            ..RawConjunct::default()
        }]),
        Value::Object(_) => Ok(vec![conjunct_from_object(value)?]),
        Value::Array(items) => {
            if items.is_empty() {
                return Err(ApiError::invalid_request_structure(
                    "Stream query must not be empty",
                ));
            }
            if items.iter().all(Value::is_string) {
                return Ok(vec![RawConjunct {
                    any: items
                        .iter()
                        .map(|v| v.as_str().expect("checked").to_owned())
                        .collect(),
                    ..RawConjunct::default()
                }]);
            }
            if items.iter().all(Value::is_object) {
                return items.iter().map(conjunct_from_object).collect();
            }
            Err(ApiError::invalid_request_structure(
                "Stream query array must hold only ids or only query objects",
            ))
        }
        _ => Err(ApiError::invalid_request_structure(
            "Stream query must be an id, an array of ids, or query objects",
        )),
    }
}

/// Parse the `streams` query parameter: JSON when it looks like JSON,
/// otherwise a single stream id.
pub fn parse_query_param(raw: &str) -> Result<Vec<RawConjunct>, ApiError> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') || trimmed.starts_with('{') || trimmed.starts_with('"') {
        let value: Value = serde_json::from_str(raw).map_err(|e| {
            ApiError::invalid_request_structure(format!("Malformed streams parameter: {e}"))
        })?;
        return parse(&value);
    }
    parse(&Value::String(raw.to_owned()))
}

fn string_array(value: &Value, key: &str) -> Result<Vec<String>, ApiError> {
    let Some(items) = value.as_array() else {
        return Err(ApiError::invalid_request_structure(format!(
            "Stream query \"{key}\" must be an array of stream ids"
        )));
    };
    items
        .iter()
        .map(|v| {
            v.as_str().map(str::to_owned).ok_or_else(|| {
                ApiError::invalid_request_structure(format!(
                    "Stream query \"{key}\" must hold only strings"
                ))
            })
        })
        .collect()
}

fn conjunct_from_object(value: &Value) -> Result<RawConjunct, ApiError> {
    let obj = value.as_object().expect("caller checked");
    for key in obj.keys() {
        if key != "any" && key != "all" && key != "not" {
            return Err(ApiError::invalid_request_structure(format!(
                "Unknown stream query property \"{key}\""
            )));
        }
    }
    let Some(any_value) = obj.get("any") else {
        return Err(ApiError::invalid_request_structure(
            "Stream query must contain \"any\"",
        ));
    };
    let any = string_array(any_value, "any")?;
    if any.is_empty() {
        return Err(ApiError::invalid_request_structure(
            "Stream query \"any\" must not be empty",
        ));
    }
    let all = obj.get("all").map(|v| string_array(v, "all")).transpose()?;
    let not = obj.get("not").map(|v| string_array(v, "not")).transpose()?;

    let has_star = any.iter().any(|s| s == "*");
    if has_star && any.len() > 1 {
        return Err(ApiError::invalid_request_structure(
            "\"*\" cannot be mixed with other stream ids in \"any\"",
        ));
    }
    if has_star && all.as_ref().is_some_and(|a| !a.is_empty()) {
        return Err(ApiError::invalid_request_structure(
            "\"*\" cannot be combined with \"all\"",
        ));
    }

    Ok(RawConjunct {
        any,
        all: all.unwrap_or_default(),
        not: not.unwrap_or_default(),
    })
}

/// A conjunct after expansion and masking; all ids belong to `store_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledConjunct {
    pub store_id: String,
    pub any: Vec<StreamId>,
    pub all: Vec<StreamId>,
    pub not: Vec<StreamId>,
}

impl CompiledConjunct {
    /// Whether an event carrying `stream_ids` satisfies this conjunct.
    #[must_use]
    pub fn matches(&self, stream_ids: &[StreamId]) -> bool {
        stream_ids.iter().any(|s| self.any.contains(s))
            && self.all.iter().all(|a| stream_ids.contains(a))
            && !stream_ids.iter().any(|s| self.not.contains(s))
    }
}

/// The canonical compiled form: a disjunction of conjuncts. An empty
/// disjunction matches nothing (a fully masked query yields an empty event
/// set, not an error).
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CompiledQuery {
    pub conjuncts: Vec<CompiledConjunct>,
}

impl CompiledQuery {
    #[must_use]
    pub fn matches_nothing(&self) -> bool {
        self.conjuncts.is_empty()
    }

    /// Whether an event carrying `stream_ids` satisfies any conjunct.
    #[must_use]
    pub fn matches(&self, stream_ids: &[StreamId]) -> bool {
        self.conjuncts.iter().any(|c| c.matches(stream_ids))
    }

    /// Emit the store-level filter tree consumed by document-store
    /// adapters: `{$or: [{$and: [{streamIds: {$in: any}}, {streamIds:
    /// {$eq: all[i]}}…, {streamIds: {$nin: not}}?]} …]}`.
    #[must_use]
    pub fn to_store_filter(&self) -> Value {
        let disjuncts: Vec<Value> = self
            .conjuncts
            .iter()
            .map(|c| {
                let mut clauses = vec![json!({ "streamIds": { "$in": c.any } })];
                for a in &c.all {
                    clauses.push(json!({ "streamIds": { "$eq": a } }));
                }
                if !c.not.is_empty() {
                    clauses.push(json!({ "streamIds": { "$nin": c.not } }));
                }
                json!({ "$and": clauses })
            })
            .collect();
        json!({ "$or": disjuncts })
    }
}

/// The store a raw id belongs to, with the `!` suffix already stripped.
fn split_id(raw: &str) -> (StreamId, bool) {
    match raw.strip_suffix('!') {
        Some(bare) => (StreamId::new(bare), false),
        None => (StreamId::new(raw), true),
    }
}

/// Compile raw conjuncts against a user's stream forest and an access.
///
/// Pipeline per conjunct: resolve the store (all ids of a conjunct must
/// agree), expand ids to their non-trashed descendants (`!` suppresses
/// expansion, explicit naming keeps trashed streams reachable), mask out
/// streams the access cannot read, and drop conjuncts whose `any` side
/// masked to nothing. Naming an id that exists nowhere fails with
/// `unknown-referenced-resource`.
pub fn compile(
    raw: &[RawConjunct],
    tree: &StreamTree,
    system: &SystemStreamsModel,
    perms: &PermissionView<'_>,
    state: ItemState,
) -> Result<CompiledQuery, ApiError> {
    let include_trashed = state == ItemState::All;
    let mut conjuncts = Vec::with_capacity(raw.len());

    for conjunct in raw {
        let store_id = conjunct_store(conjunct)?;
        if store_id != LOCAL_STORE {
            // External stores receive the conjunct verbatim; expansion and
            // masking happen behind the store boundary.
            conjuncts.push(CompiledConjunct {
                store_id,
                any: conjunct.any.iter().map(|s| split_id(s).0).collect(),
                all: conjunct.all.iter().map(|s| split_id(s).0).collect(),
                not: conjunct.not.iter().map(|s| split_id(s).0).collect(),
            });
            continue;
        }

        let mut any: Vec<StreamId> = Vec::new();
        for raw_id in &conjunct.any {
            if raw_id == "*" {
                for id in tree.expand_star(include_trashed) {
                    push_unique(&mut any, id);
                }
                continue;
            }
            let (id, expand) = split_id(raw_id);
            let expanded = expand_known(&id, expand, tree, system, include_trashed)?;
            // Naming a stream whose whole scope is unreadable is a
            // permission failure, not a silent mask.
            if !expanded
                .iter()
                .any(|e| perms.can_get_events_on_stream(e))
            {
                return Err(ApiError::forbidden(format!(
                    "Access lacks read permission on stream \"{id}\""
                )));
            }
            for e in expanded {
                push_unique(&mut any, e);
            }
        }

        // Mask by access: unreadable streams silently drop out (this is how
        // `*` and partially-readable expansions narrow).
        any.retain(|id| perms.can_get_events_on_stream(id));

        let mut all = Vec::new();
        for raw_id in &conjunct.all {
            let (id, _) = split_id(raw_id);
            require_known(&id, tree, system)?;
            push_unique(&mut all, id);
        }

        let mut not = Vec::new();
        for raw_id in &conjunct.not {
            let (id, expand) = split_id(raw_id);
            for expanded in expand_known(&id, expand, tree, system, true)? {
                push_unique(&mut not, expanded);
            }
        }

        if any.is_empty() {
            continue;
        }
        conjuncts.push(CompiledConjunct {
            store_id,
            any,
            all,
            not,
        });
    }

    Ok(CompiledQuery { conjuncts })
}

fn push_unique(ids: &mut Vec<StreamId>, id: StreamId) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

fn conjunct_store(conjunct: &RawConjunct) -> Result<String, ApiError> {
    let mut store: Option<String> = None;
    for raw_id in conjunct
        .any
        .iter()
        .chain(&conjunct.all)
        .chain(&conjunct.not)
    {
        let (id, _) = split_id(raw_id);
        let sid = id.store_id().to_owned();
        match &store {
            None => store = Some(sid),
            Some(existing) if *existing == sid => {}
            Some(existing) => {
                return Err(ApiError::invalid_request_structure(format!(
                    "Stream query mixes stores \"{existing}\" and \"{sid}\" in one conjunct"
                )));
            }
        }
    }
    Ok(store.unwrap_or_else(|| LOCAL_STORE.to_owned()))
}

fn require_known(
    id: &StreamId,
    tree: &StreamTree,
    system: &SystemStreamsModel,
) -> Result<(), ApiError> {
    if tree.contains(id) || system.contains(id) {
        return Ok(());
    }
    Err(ApiError::unknown_referenced_resource("stream", id.as_str()))
}

fn expand_known(
    id: &StreamId,
    expand: bool,
    tree: &StreamTree,
    system: &SystemStreamsModel,
    include_trashed: bool,
) -> Result<Vec<StreamId>, ApiError> {
    if tree.contains(id) {
        if expand {
            return Ok(tree.expand(id, include_trashed));
        }
        return Ok(vec![id.clone()]);
    }
    if system.contains(id) {
        // System streams have no user-visible descendants to expand.
        return Ok(vec![id.clone()]);
    }
    Err(ApiError::unknown_referenced_resource("stream", id.as_str()))
}

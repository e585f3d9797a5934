use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use trove_core::{
    event_digest, ApiError, Event, EventId, ItemState, StreamId,
};
use trove_store::EventsQuery;

use crate::bus::{Notification, Topic};
use crate::context::MethodContext;
use crate::engine::{archive_head, delete_event_head};
use crate::error::StoreResultExt;
use crate::methods::{from_value, obj, opt_bool, opt_f64, opt_str, opt_usize, require_str};
use crate::registry::{step, Api, Params, StepFuture};
use crate::result::MethodResult;

/// Update fields owned by the server; clients cannot write them.
const PROTECTED_FIELDS: &[&str] = &[
    "id",
    "attachments",
    "created",
    "createdBy",
    "modified",
    "modifiedBy",
    "integrity",
    "headId",
];

pub fn register(api: &mut Api) {
    api.register("events.get", vec![step(get_validate), step(get_find)]);
    api.register("events.getOne", vec![step(get_one)]);
    api.register(
        "events.create",
        vec![step(create_validate), step(create_apply)],
    );
    api.register("events.update", vec![step(update)]);
    api.register("events.delete", vec![step(delete)]);
    api.register("events.deleteAttachment", vec![step(delete_attachment)]);
}

fn event_to_wire(ctx: &MethodContext, event: &Event) -> Result<Value, ApiError> {
    let mut value = serde_json::to_value(event).map_err(ApiError::unexpected)?;
    ctx.services
        .compat
        .egress_event(&mut value, ctx.compat_disabled);
    Ok(value)
}

fn parse_state(params: &Value) -> Result<ItemState, ApiError> {
    match opt_str(params, "state")? {
        None | Some("default") => Ok(ItemState::Default),
        Some("trashed") => Ok(ItemState::Trashed),
        Some("all") => Ok(ItemState::All),
        Some(other) => Err(ApiError::invalid_parameters_format(format!(
            "Unknown state \"{other}\""
        ))),
    }
}

fn get_validate<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    _result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        obj(params)?;
        parse_state(params)?;
        opt_f64(params, "fromTime")?;
        opt_f64(params, "toTime")?;
        opt_f64(params, "modifiedSince")?;
        opt_usize(params, "skip")?;
        opt_usize(params, "limit")?;
        opt_bool(params, "sortAscending")?;
        opt_bool(params, "includeDeletions")?;

        // Legacy `tags` fold into tag-stream ids right at ingress.
        if let Some(tags) = params.get("tags") {
            let tags: Vec<String> = from_value(tags.clone())?;
            let ids: Vec<String> = tags
                .iter()
                .map(|t| trove_core::tag_stream_id(t).to_string())
                .collect();
            params["_tagStreamIds"] = json!(ids);
        }
        let _ = ctx;
        Ok(())
    })
}

fn get_find<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let state = parse_state(params)?;
        let perms = ctx.permissions()?;

        // Parse the streams parameter (absent means `*`), translating
        // legacy ids before compilation.
        let raw = match params.get("streams") {
            None | Some(Value::Null) => trove_core::parse(&json!("*"))?,
            Some(Value::String(s)) => trove_core::parse_query_param(s)?,
            Some(other) => trove_core::parse(other)?,
        };
        let raw: Vec<trove_core::RawConjunct> = raw
            .into_iter()
            .map(|mut c| {
                for id in c.any.iter_mut().chain(&mut c.all).chain(&mut c.not) {
                    *id = ctx.services.compat.ingress_stream_id(id).to_string();
                }
                c
            })
            .collect();

        let compiled = trove_core::compile(
            &raw,
            ctx.tree(),
            &ctx.services.system,
            &perms,
            state,
        )?;

        let query = EventsQuery {
            streams: Some(compiled),
            from_time: opt_f64(params, "fromTime")?,
            to_time: opt_f64(params, "toTime")?,
            types: match params.get("types") {
                Some(v) => from_value(v.clone())?,
                None => Vec::new(),
            },
            state,
            modified_since: opt_f64(params, "modifiedSince")?,
            sort_ascending: opt_bool(params, "sortAscending")?.unwrap_or(false),
            skip: opt_usize(params, "skip")?,
            limit: opt_usize(params, "limit")?,
        };

        let mut events = ctx
            .services
            .storage
            .events_find(&ctx.username, &query)
            .await
            .api_err()?;

        // Legacy tag filter: the event must carry one of the tag streams.
        if let Some(tag_ids) = params.get("_tagStreamIds") {
            let tag_ids: Vec<StreamId> = from_value(tag_ids.clone())?;
            events.retain(|e| e.stream_ids.iter().any(|s| tag_ids.contains(s)));
        }

        let wire: Result<Vec<Value>, ApiError> =
            events.iter().map(|e| event_to_wire(ctx, e)).collect();
        result.set("events", Value::Array(wire?));

        if opt_bool(params, "includeDeletions")?.unwrap_or(false) {
            let since = opt_f64(params, "modifiedSince")?;
            let deletions = ctx
                .services
                .storage
                .event_deletions(&ctx.username, since)
                .await
                .api_err()?;
            let wire: Vec<Value> = deletions
                .iter()
                .map(|d| serde_json::to_value(d).expect("deletion serializes"))
                .collect();
            result.set("eventDeletions", Value::Array(wire));
        }
        Ok(())
    })
}

fn get_one<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let id = EventId::new(require_str(params, "id")?);
        let event = ctx
            .services
            .storage
            .event_get(&ctx.username, &id)
            .await
            .api_err()?
            .ok_or_else(|| ApiError::unknown_resource("event", id.as_str()))?;

        let perms = ctx.permissions()?;
        if !perms.can_read_event(&event.stream_ids) {
            return Err(ApiError::forbidden(
                "Access lacks read permission on this event's streams",
            ));
        }

        result.set("event", event_to_wire(ctx, &event)?);

        if opt_bool(params, "includeHistory")?.unwrap_or(false) {
            let history = ctx
                .services
                .storage
                .history_for(&ctx.username, &id)
                .await
                .api_err()?;
            let wire: Result<Vec<Value>, ApiError> =
                history.iter().map(|e| event_to_wire(ctx, e)).collect();
            result.set("history", Value::Array(wire?));
        }
        Ok(())
    })
}

fn create_validate<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    _result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        obj(params)?;
        // Normalize the legacy singular `streamId` form.
        if params.get("streamIds").is_none()
            && let Some(single) = params.get("streamId").cloned()
        {
            params["streamIds"] = json!([single]);
        }
        if let Some(map) = params.as_object_mut() {
            map.remove("streamId");
        }
        // Legacy prefixes and `tags` are canonicalized before validation.
        ctx.services.compat.ingress_event(params);
        require_str(params, "type")?;
        params
            .get("streamIds")
            .and_then(Value::as_array)
            .filter(|ids| !ids.is_empty())
            .ok_or_else(|| {
                ApiError::invalid_parameters_format("Event must reference at least one stream")
            })?;
        Ok(())
    })
}

/// Invariant (f): duration-bearing events on a `singleActivity` stream may
/// not overlap other such events on that stream.
async fn check_single_activity_overlap(
    ctx: &MethodContext,
    event: &Event,
) -> Result<(), ApiError> {
    if !event.has_duration() {
        return Ok(());
    }
    for stream_id in &event.stream_ids {
        let single = ctx
            .tree()
            .get(stream_id)
            .is_some_and(|s| s.single_activity);
        if !single {
            continue;
        }
        let others = ctx
            .services
            .storage
            .events_find(
                &ctx.username,
                &EventsQuery {
                    streams: Some(trove_core::CompiledQuery {
                        conjuncts: vec![trove_core::CompiledConjunct {
                            store_id: trove_core::LOCAL_STORE.to_owned(),
                            any: vec![stream_id.clone()],
                            all: Vec::new(),
                            not: Vec::new(),
                        }],
                    }),
                    ..EventsQuery::default()
                },
            )
            .await
            .api_err()?;
        let overlapping: Vec<&str> = others
            .iter()
            .filter(|other| other.id != event.id && event.overlaps(other))
            .map(|other| other.id.as_str())
            .collect();
        if !overlapping.is_empty() {
            return Err(ApiError::invalid_operation(format!(
                "Event overlaps other activity on single-activity stream \"{stream_id}\""
            ))
            .with_data(json!({ "overlappedIds": overlapping })));
        }
    }
    Ok(())
}

/// Every referenced stream must resolve (user tree or system tree); system
/// streams alone cannot host a client event.
fn check_stream_refs(ctx: &MethodContext, event: &Event) -> Result<(), ApiError> {
    for stream_id in &event.stream_ids {
        if stream_id.store_id() != trove_core::LOCAL_STORE {
            continue;
        }
        if !ctx.tree().contains(stream_id) && !ctx.services.system.contains(stream_id) {
            return Err(ApiError::unknown_referenced_resource(
                "stream",
                stream_id.as_str(),
            ));
        }
    }
    Ok(())
}

fn create_apply<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let now = ctx.now();
        let stream_ids: Vec<StreamId> = from_value(params["streamIds"].clone())?;

        let mut event = Event {
            id: match opt_str(params, "id")? {
                Some(s) => EventId::new(s),
                None => EventId::new(Uuid::new_v4().to_string()),
            },
            stream_ids,
            event_type: require_str(params, "type")?.to_owned(),
            time: opt_f64(params, "time")?.unwrap_or(now),
            duration: opt_f64(params, "duration")?,
            content: params.get("content").cloned(),
            attachments: Vec::new(),
            tags: Vec::new(),
            client_data: params.get("clientData").cloned(),
            trashed: false,
            integrity: None,
            deleted: None,
            head_id: None,
            tracking: ctx.init_tracking(),
        };
        event.validate_shape()?;
        check_stream_refs(ctx, &event)?;

        let perms = ctx.permissions()?;
        if !perms.can_create_event(&event.stream_ids) {
            return Err(ApiError::forbidden(
                "Access lacks create permission on this event's streams",
            ));
        }
        drop(perms);
        check_single_activity_overlap(ctx, &event).await?;

        if ctx.services.settings.integrity_events {
            event.integrity = Some(event_digest(&event));
        }

        ctx.services
            .storage
            .event_insert(&ctx.username, &event)
            .await
            .api_err()?;
        ctx.services
            .bus
            .publish(Notification::for_user(Topic::EventsChanged, &ctx.username));

        result.set("event", event_to_wire(ctx, &event)?);
        Ok(())
    })
}

fn update<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let id = EventId::new(require_str(params, "id")?);
        let mut update = params
            .get("update")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| ApiError::invalid_parameters_format("Missing \"update\" object"))?;

        for field in PROTECTED_FIELDS {
            if update.contains_key(*field) {
                if ctx.services.settings.ignore_protected_fields {
                    warn!(field, "ignoring protected field in event update");
                    update.remove(*field);
                } else {
                    return Err(ApiError::forbidden(format!(
                        "Field \"{field}\" is read-only"
                    )));
                }
            }
        }
        let mut update = Value::Object(update);
        ctx.services.compat.ingress_event(&mut update);

        let head = ctx
            .services
            .storage
            .event_get(&ctx.username, &id)
            .await
            .api_err()?
            .ok_or_else(|| ApiError::unknown_resource("event", id.as_str()))?;

        let perms = ctx.permissions()?;
        if !perms.can_update_event(&head.stream_ids) {
            return Err(ApiError::forbidden(
                "Access lacks update permission on this event's streams",
            ));
        }

        let mut updated = head.clone();
        if let Some(ids) = update.get("streamIds") {
            updated.stream_ids = from_value(ids.clone())?;
            // Moving between streams: the create capability is needed on
            // every stream the update adds.
            let added: Vec<StreamId> = updated
                .stream_ids
                .iter()
                .filter(|s| !head.stream_ids.contains(s))
                .cloned()
                .collect();
            if !perms.can_move_event_to(&added) {
                return Err(ApiError::forbidden(
                    "Access lacks permission on the added streams",
                ));
            }
        }
        drop(perms);

        if let Some(t) = update.get("time").and_then(Value::as_f64) {
            updated.time = t;
        }
        if let Some(duration) = update.get("duration") {
            updated.duration = duration.as_f64();
        }
        if let Some(event_type) = update.get("type").and_then(Value::as_str) {
            updated.event_type = event_type.to_owned();
        }
        if let Some(content) = update.get("content") {
            updated.content = Some(content.clone());
        }
        if let Some(client_data) = update.get("clientData") {
            updated.client_data = Some(client_data.clone());
        }
        if let Some(trashed) = update.get("trashed").and_then(Value::as_bool) {
            updated.trashed = trashed;
        }
        updated.validate_shape()?;
        check_stream_refs(ctx, &updated)?;
        check_single_activity_overlap(ctx, &updated).await?;

        archive_head(&ctx.services, &ctx.username, &head).await?;
        updated.tracking.touch(ctx.now(), &ctx.actor());
        if ctx.services.settings.integrity_events {
            updated.integrity = Some(event_digest(&updated));
        }
        ctx.services
            .storage
            .event_update(&ctx.username, &updated)
            .await
            .api_err()?;
        ctx.services
            .bus
            .publish(Notification::for_user(Topic::EventsChanged, &ctx.username));

        result.set("event", event_to_wire(ctx, &updated)?);
        Ok(())
    })
}

fn delete<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let id = EventId::new(require_str(params, "id")?);
        let head = ctx
            .services
            .storage
            .event_get(&ctx.username, &id)
            .await
            .api_err()?
            .ok_or_else(|| ApiError::unknown_resource("event", id.as_str()))?;

        let perms = ctx.permissions()?;
        if !perms.can_update_event(&head.stream_ids) {
            return Err(ApiError::forbidden(
                "Access lacks delete permission on this event's streams",
            ));
        }
        drop(perms);

        let now = ctx.now();
        if head.trashed {
            // Second delete: the head becomes a tombstone per deletion mode.
            let deletion = delete_event_head(&ctx.services, &ctx.username, head, now).await?;
            result.set(
                "eventDeletion",
                serde_json::to_value(&deletion).map_err(ApiError::unexpected)?,
            );
        } else {
            // First delete trashes the event.
            archive_head(&ctx.services, &ctx.username, &head).await?;
            let mut trashed = head;
            trashed.trashed = true;
            trashed.tracking.touch(now, &ctx.actor());
            if ctx.services.settings.integrity_events {
                trashed.integrity = Some(event_digest(&trashed));
            }
            ctx.services
                .storage
                .event_update(&ctx.username, &trashed)
                .await
                .api_err()?;
            result.set("event", event_to_wire(ctx, &trashed)?);
        }

        ctx.services
            .bus
            .publish(Notification::for_user(Topic::EventsChanged, &ctx.username));
        Ok(())
    })
}

fn delete_attachment<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let id = EventId::new(require_str(params, "id")?);
        let file_id = require_str(params, "fileId")?.to_owned();

        let head = ctx
            .services
            .storage
            .event_get(&ctx.username, &id)
            .await
            .api_err()?
            .ok_or_else(|| ApiError::unknown_resource("event", id.as_str()))?;
        let perms = ctx.permissions()?;
        if !perms.can_update_event(&head.stream_ids) {
            return Err(ApiError::forbidden(
                "Access lacks update permission on this event's streams",
            ));
        }
        drop(perms);
        if !head.attachments.iter().any(|a| a.id == file_id) {
            return Err(ApiError::unknown_resource("attachment", &file_id));
        }

        archive_head(&ctx.services, &ctx.username, &head).await?;
        ctx.services
            .files
            .remove(&ctx.username, &id, &file_id)
            .await
            .api_err()?;

        let mut updated = head;
        updated.attachments.retain(|a| a.id != file_id);
        updated.tracking.touch(ctx.now(), &ctx.actor());
        if ctx.services.settings.integrity_events {
            updated.integrity = Some(event_digest(&updated));
        }
        ctx.services
            .storage
            .event_update(&ctx.username, &updated)
            .await
            .api_err()?;
        ctx.services
            .bus
            .publish(Notification::for_user(Topic::EventsChanged, &ctx.username));

        result.set("event", event_to_wire(ctx, &updated)?);
        Ok(())
    })
}

/// Attach uploaded file bodies to an existing event (the multipart
/// create/update path). Each file is `(file name, content type, body)`.
///
/// The caller must hold update access on the event, or create access when
/// it just created the event (the create-only level can attach to its own
/// fresh creations).
pub async fn attach_uploaded_files(
    ctx: &mut MethodContext,
    event_id: &EventId,
    files: Vec<(String, String, bytes::Bytes)>,
) -> Result<Value, ApiError> {
    let head = ctx
        .services
        .storage
        .event_get(&ctx.username, event_id)
        .await
        .api_err()?
        .ok_or_else(|| ApiError::unknown_resource("event", event_id.as_str()))?;

    let perms = ctx.permissions()?;
    if !perms.can_update_event(&head.stream_ids) && !perms.can_create_event(&head.stream_ids) {
        return Err(ApiError::forbidden(
            "Access lacks permission to attach files to this event",
        ));
    }
    drop(perms);

    archive_head(&ctx.services, &ctx.username, &head).await?;
    let mut updated = head;
    for (file_name, content_type, data) in files {
        crate::attachments::index_attachment(
            &ctx.services,
            &ctx.username,
            &mut updated,
            &file_name,
            &content_type,
            data,
        )
        .await?;
    }
    updated.tracking.touch(ctx.now(), &ctx.actor());
    if ctx.services.settings.integrity_events {
        updated.integrity = Some(event_digest(&updated));
    }
    ctx.services
        .storage
        .event_update(&ctx.username, &updated)
        .await
        .api_err()?;
    ctx.services
        .bus
        .publish(Notification::for_user(Topic::EventsChanged, &ctx.username));

    event_to_wire(ctx, &updated)
}

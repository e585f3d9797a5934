use serde_json::{json, Value};
use uuid::Uuid;

use trove_core::{ApiError, ItemState, PermissionView, Stream, StreamId};

use crate::bus::{Notification, Topic};
use crate::context::MethodContext;
use crate::engine::{archive_head, delete_event_head};
use crate::error::StoreResultExt;
use crate::methods::{obj, opt_bool, opt_f64, opt_str, require_str};
use crate::registry::{step, Api, Params, StepFuture};
use crate::result::MethodResult;

pub fn register(api: &mut Api) {
    api.register("streams.get", vec![step(get)]);
    api.register(
        "streams.create",
        vec![step(create_validate), step(create_apply)],
    );
    api.register("streams.update", vec![step(update)]);
    api.register("streams.delete", vec![step(delete)]);
}

/// Reject writes addressing the immutable system tree.
fn reject_system(ctx: &MethodContext, id: &StreamId) -> Result<(), ApiError> {
    if id.is_system() || ctx.services.system.contains(id) {
        return Err(ApiError::invalid_operation(format!(
            "Stream \"{id}\" belongs to the system tree and cannot be modified"
        )));
    }
    Ok(())
}

/// Serialize the visible forest under `parent`. Hidden streams are elided;
/// their visible descendants are promoted to the elided stream's position.
fn visible_forest(
    ctx: &MethodContext,
    perms: &PermissionView<'_>,
    parent: Option<&StreamId>,
    include_trashed: bool,
) -> Vec<Value> {
    let children: Vec<&Stream> = match parent {
        Some(pid) => ctx.tree().children_of(pid),
        None => ctx
            .tree()
            .iter()
            .filter(|s| s.parent_id.is_none())
            .collect(),
    };

    let mut out = Vec::new();
    for child in children {
        if child.trashed && !include_trashed {
            continue;
        }
        let nested = visible_forest(ctx, perms, Some(&child.id), include_trashed);
        if perms.can_list_stream(&child.id) {
            let mut obj = serde_json::to_value(child).expect("stream serializes");
            ctx.services
                .compat
                .egress_stream(&mut obj, ctx.compat_disabled);
            obj["children"] = Value::Array(nested);
            out.push(obj);
        } else {
            out.extend(nested);
        }
    }
    out
}

fn get<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let state = match opt_str(params, "state")? {
            None | Some("default") => ItemState::Default,
            Some("all") => ItemState::All,
            Some(other) => {
                return Err(ApiError::invalid_parameters_format(format!(
                    "Unknown state \"{other}\""
                )));
            }
        };
        let parent_id = opt_str(params, "parentId")?
            .map(|raw| ctx.services.compat.ingress_stream_id(raw));
        if let Some(pid) = &parent_id
            && !ctx.tree().contains(pid)
        {
            return Err(ApiError::unknown_referenced_resource("stream", pid.as_str()));
        }

        let perms = ctx.permissions()?;
        let forest = visible_forest(ctx, &perms, parent_id.as_ref(), state == ItemState::All);
        result.set("streams", Value::Array(forest));

        if let Some(since) = opt_f64(params, "includeDeletionsSince")? {
            let deletions: Vec<Value> = ctx
                .services
                .storage
                .stream_deletions(&ctx.username, Some(since))
                .await
                .api_err()?
                .into_iter()
                .map(|(id, deleted)| json!({ "id": id.as_str(), "deleted": deleted }))
                .collect();
            result.set("streamDeletions", Value::Array(deletions));
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
        require_str(params, "name")?;
        if let Some(raw) = opt_str(params, "id")? {
            let id = ctx.services.compat.ingress_stream_id(raw);
            if !id.is_valid_for_creation() {
                return Err(ApiError::invalid_operation(format!(
                    "Stream id \"{raw}\" is reserved"
                )));
            }
            reject_system(ctx, &id)?;
            params["id"] = json!(id.as_str());
        }
        if let Some(raw) = opt_str(params, "parentId")? {
            let parent = ctx.services.compat.ingress_stream_id(raw);
            reject_system(ctx, &parent)?;
            params["parentId"] = json!(parent.as_str());
        }
        Ok(())
    })
}

fn create_apply<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let id = match opt_str(params, "id")? {
            Some(s) => StreamId::new(s),
            None => StreamId::new(Uuid::new_v4().to_string()),
        };
        let parent_id = opt_str(params, "parentId")?.map(StreamId::new);

        if let Some(pid) = &parent_id {
            let Some(parent) = ctx.tree().get(pid) else {
                return Err(ApiError::unknown_referenced_resource("stream", pid.as_str()));
            };
            // Parents must live in the same store as the new stream.
            if parent.id.store_id() != id.store_id() {
                return Err(ApiError::invalid_operation(
                    "Parent stream belongs to a different store",
                ));
            }
        }

        // Creating a root stream takes forest-wide manage; below a parent,
        // manage on that parent.
        let required_scope = parent_id.clone().unwrap_or_else(StreamId::star);
        if !ctx.can_manage_stream(&required_scope) {
            return Err(ApiError::forbidden(format!(
                "Access lacks manage permission on \"{required_scope}\""
            )));
        }

        let name = require_str(params, "name")?.to_owned();
        if ctx
            .tree()
            .sibling_name_taken(parent_id.as_ref(), &name, None)
        {
            return Err(ApiError::item_already_exists(
                "stream",
                json!({ "name": name }),
            ));
        }

        let stream = Stream {
            id,
            name,
            parent_id,
            trashed: false,
            single_activity: opt_bool(params, "singleActivity")?.unwrap_or(false),
            client_data: params.get("clientData").cloned(),
            tracking: ctx.init_tracking(),
        };
        stream.validate_shape()?;

        ctx.services
            .storage
            .stream_insert(&ctx.username, &stream)
            .await
            .api_err()?;
        ctx.refresh_tree().await?;
        ctx.services
            .bus
            .publish(Notification::for_user(Topic::StreamsChanged, &ctx.username));

        let mut wire = serde_json::to_value(&stream).map_err(ApiError::unexpected)?;
        ctx.services
            .compat
            .egress_stream(&mut wire, ctx.compat_disabled);
        result.set("stream", wire);
        Ok(())
    })
}

fn update<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let id = ctx
            .services
            .compat
            .ingress_stream_id(require_str(params, "id")?);
        reject_system(ctx, &id)?;
        let update = params
            .get("update")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| ApiError::invalid_parameters_format("Missing \"update\" object"))?;

        let mut stream = ctx
            .tree()
            .get(&id)
            .cloned()
            .ok_or_else(|| ApiError::unknown_resource("stream", id.as_str()))?;
        if !ctx.can_manage_stream(&id) {
            return Err(ApiError::forbidden(format!(
                "Access lacks manage permission on \"{id}\""
            )));
        }

        let mut new_parent = stream.parent_id.clone();
        if let Some(parent_value) = update.get("parentId") {
            new_parent = match parent_value {
                Value::Null => None,
                Value::String(raw) => {
                    let pid = ctx.services.compat.ingress_stream_id(raw);
                    if pid == id {
                        return Err(ApiError::invalid_operation(
                            "A stream cannot be its own parent",
                        ));
                    }
                    if !ctx.tree().contains(&pid) {
                        return Err(ApiError::unknown_referenced_resource(
                            "stream",
                            pid.as_str(),
                        ));
                    }
                    if ctx.tree().would_cycle(&id, &pid) {
                        return Err(ApiError::invalid_operation(
                            "Moving the stream under one of its descendants would create a cycle",
                        ));
                    }
                    Some(pid)
                }
                _ => {
                    return Err(ApiError::invalid_parameters_format(
                        "\"parentId\" must be a string or null",
                    ));
                }
            };
        }

        let new_name = match update.get("name") {
            Some(Value::String(name)) => name.clone(),
            None => stream.name.clone(),
            Some(_) => {
                return Err(ApiError::invalid_parameters_format(
                    "\"name\" must be a string",
                ));
            }
        };
        if ctx
            .tree()
            .sibling_name_taken(new_parent.as_ref(), &new_name, Some(&id))
        {
            return Err(ApiError::item_already_exists(
                "stream",
                json!({ "name": new_name }),
            ));
        }

        stream.name = new_name;
        stream.parent_id = new_parent;
        if let Some(trashed) = update.get("trashed").and_then(Value::as_bool) {
            stream.trashed = trashed;
        }
        if let Some(single) = update.get("singleActivity").and_then(Value::as_bool) {
            stream.single_activity = single;
        }
        if let Some(client_data) = update.get("clientData") {
            stream.client_data = Some(client_data.clone());
        }
        stream.tracking.touch(ctx.now(), &ctx.actor());

        ctx.services
            .storage
            .stream_update(&ctx.username, &stream)
            .await
            .api_err()?;
        ctx.refresh_tree().await?;
        ctx.services
            .bus
            .publish(Notification::for_user(Topic::StreamsChanged, &ctx.username));

        let mut wire = serde_json::to_value(&stream).map_err(ApiError::unexpected)?;
        ctx.services
            .compat
            .egress_stream(&mut wire, ctx.compat_disabled);
        result.set("stream", wire);
        Ok(())
    })
}

fn delete<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let id = ctx
            .services
            .compat
            .ingress_stream_id(require_str(params, "id")?);
        reject_system(ctx, &id)?;
        let merge = opt_bool(params, "mergeEventsWithParent")?.unwrap_or(false);

        let stream = ctx
            .tree()
            .get(&id)
            .cloned()
            .ok_or_else(|| ApiError::unknown_resource("stream", id.as_str()))?;
        if !ctx.can_manage_stream(&id) {
            return Err(ApiError::forbidden(format!(
                "Access lacks manage permission on \"{id}\""
            )));
        }
        if !stream.trashed {
            return Err(ApiError::invalid_parameters_format(
                "The stream must be trashed before deletion",
            ));
        }
        if merge && stream.parent_id.is_none() {
            return Err(ApiError::invalid_operation(
                "A root stream cannot be merged into a parent",
            ));
        }

        let doomed = ctx.tree().expand(&id, true);
        let now = ctx.now();

        // Rewrite or delete every event linked to the doomed subtree.
        let events = ctx
            .services
            .storage
            .events_find(
                &ctx.username,
                &trove_store::EventsQuery {
                    state: ItemState::All,
                    ..trove_store::EventsQuery::default()
                },
            )
            .await
            .api_err()?;
        let mut events_touched = false;

        for mut event in events {
            if !event.stream_ids.iter().any(|s| doomed.contains(s)) {
                continue;
            }
            events_touched = true;
            archive_head(&ctx.services, &ctx.username, &event).await?;

            let mut kept: Vec<StreamId> = event
                .stream_ids
                .iter()
                .filter(|s| !doomed.contains(s))
                .cloned()
                .collect();
            if merge {
                let parent = stream.parent_id.clone().expect("checked above");
                if !kept.contains(&parent) {
                    kept.push(parent);
                }
            }

            if kept.is_empty() {
                delete_event_head(&ctx.services, &ctx.username, event, now).await?;
            } else {
                event.stream_ids = kept;
                event.tracking.touch(now, &ctx.actor());
                ctx.services
                    .storage
                    .event_update(&ctx.username, &event)
                    .await
                    .api_err()?;
            }
        }

        for doomed_id in &doomed {
            ctx.services
                .storage
                .stream_delete(&ctx.username, doomed_id, now)
                .await
                .api_err()?;
        }
        ctx.refresh_tree().await?;

        ctx.services
            .bus
            .publish(Notification::for_user(Topic::StreamsChanged, &ctx.username));
        if events_touched {
            ctx.services
                .bus
                .publish(Notification::for_user(Topic::EventsChanged, &ctx.username));
        }

        result.set(
            "streamDeletion",
            json!({ "id": id.as_str(), "deleted": now }),
        );
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use trove_core::{EventId, Tracking};
    use trove_store::Storage;

    async fn api_and_ctx() -> (Api, MethodContext) {
        let mut api = Api::new();
        register(&mut api);
        (api, crate::testing::context().await)
    }

    async fn create(api: &Api, ctx: &mut MethodContext, body: Value) -> Value {
        api.call("streams.create", ctx, body)
            .await
            .unwrap()
            .get("stream")
            .unwrap()
            .clone()
    }

    async fn seed_event(ctx: &MethodContext, id: &str, streams: &[&str]) {
        ctx.services
            .storage
            .event_insert(
                &ctx.username,
                &trove_core::Event {
                    id: EventId::new(id),
                    stream_ids: streams.iter().map(|s| StreamId::from(*s)).collect(),
                    event_type: "note/txt".to_owned(),
                    time: 10.0,
                    duration: None,
                    content: None,
                    attachments: Vec::new(),
                    tags: Vec::new(),
                    client_data: None,
                    trashed: false,
                    integrity: None,
                    deleted: None,
                    head_id: None,
                    tracking: Tracking::init(10.0, &trove_core::AccessId::new("t")),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_nests_and_rejects_duplicates() {
        let (api, mut ctx) = api_and_ctx().await;
        let root = create(&api, &mut ctx, json!({ "id": "a", "name": "A" })).await;
        assert_eq!(root["id"], "a");
        create(&api, &mut ctx, json!({ "id": "b", "name": "B", "parentId": "a" })).await;

        // Sibling name collision.
        let err = api
            .call("streams.create", &mut ctx, json!({ "name": "B", "parentId": "a" }))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 409);

        // Unknown parent.
        let err = api
            .call(
                "streams.create",
                &mut ctx,
                json!({ "name": "X", "parentId": "ghost" }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.id.as_str(), "unknown-referenced-resource");

        // Reserved id.
        let err = api
            .call("streams.create", &mut ctx, json!({ "id": "*", "name": "Star" }))
            .await
            .unwrap_err();
        assert_eq!(err.id.as_str(), "invalid-operation");

        let listed = api.call("streams.get", &mut ctx, json!({})).await.unwrap();
        let streams = listed.get("streams").unwrap().as_array().unwrap().clone();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0]["children"][0]["id"], "b");
    }

    #[tokio::test]
    async fn system_streams_are_immutable() {
        let (api, mut ctx) = api_and_ctx().await;
        for body in [
            json!({ "id": ":system:email", "name": "Email" }),
            json!({ "name": "X", "parentId": ":system:account" }),
        ] {
            let err = api.call("streams.create", &mut ctx, body).await.unwrap_err();
            assert_eq!(err.id.as_str(), "invalid-operation");
        }
        let err = api
            .call(
                "streams.update",
                &mut ctx,
                json!({ "id": ":system:email", "update": { "name": "X" } }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.id.as_str(), "invalid-operation");
        let err = api
            .call("streams.delete", &mut ctx, json!({ "id": ".email" }))
            .await
            .unwrap_err();
        assert_eq!(err.id.as_str(), "invalid-operation");
    }

    #[tokio::test]
    async fn update_moves_and_rejects_cycles() {
        let (api, mut ctx) = api_and_ctx().await;
        create(&api, &mut ctx, json!({ "id": "a", "name": "A" })).await;
        create(&api, &mut ctx, json!({ "id": "b", "name": "B", "parentId": "a" })).await;
        create(&api, &mut ctx, json!({ "id": "c", "name": "C", "parentId": "b" })).await;

        // a under its own descendant is a cycle.
        let err = api
            .call(
                "streams.update",
                &mut ctx,
                json!({ "id": "a", "update": { "parentId": "c" } }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.id.as_str(), "invalid-operation");

        // parentId == id.
        let err = api
            .call(
                "streams.update",
                &mut ctx,
                json!({ "id": "a", "update": { "parentId": "a" } }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.id.as_str(), "invalid-operation");

        // Valid move: c to the root.
        let moved = api
            .call(
                "streams.update",
                &mut ctx,
                json!({ "id": "c", "update": { "parentId": null } }),
            )
            .await
            .unwrap();
        assert!(moved.get("stream").unwrap().get("parentId").is_none());
    }

    #[tokio::test]
    async fn delete_requires_trash_first() {
        let (api, mut ctx) = api_and_ctx().await;
        create(&api, &mut ctx, json!({ "id": "a", "name": "A" })).await;

        let err = api
            .call("streams.delete", &mut ctx, json!({ "id": "a" }))
            .await
            .unwrap_err();
        assert_eq!(err.id.as_str(), "invalid-parameters-format");

        api.call(
            "streams.update",
            &mut ctx,
            json!({ "id": "a", "update": { "trashed": true } }),
        )
        .await
        .unwrap();
        let result = api
            .call("streams.delete", &mut ctx, json!({ "id": "a" }))
            .await
            .unwrap();
        assert_eq!(result.get("streamDeletion").unwrap()["id"], "a");
        assert!(!ctx.tree().contains(&StreamId::from("a")));
    }

    #[tokio::test]
    async fn delete_with_merge_reparents_events() {
        let (api, mut ctx) = api_and_ctx().await;
        create(&api, &mut ctx, json!({ "id": "parent", "name": "P" })).await;
        create(&api, &mut ctx, json!({ "id": "child", "name": "C", "parentId": "parent" })).await;
        seed_event(&ctx, "e1", &["child"]).await;

        api.call(
            "streams.update",
            &mut ctx,
            json!({ "id": "child", "update": { "trashed": true } }),
        )
        .await
        .unwrap();
        api.call(
            "streams.delete",
            &mut ctx,
            json!({ "id": "child", "mergeEventsWithParent": true }),
        )
        .await
        .unwrap();

        let event = ctx
            .services
            .storage
            .event_get(&ctx.username, &EventId::new("e1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.stream_ids, vec![StreamId::from("parent")]);
    }

    #[tokio::test]
    async fn delete_without_merge_deletes_orphaned_events() {
        let (api, mut ctx) = api_and_ctx().await;
        create(&api, &mut ctx, json!({ "id": "a", "name": "A" })).await;
        create(&api, &mut ctx, json!({ "id": "keep", "name": "K" })).await;
        seed_event(&ctx, "only-a", &["a"]).await;
        seed_event(&ctx, "both", &["a", "keep"]).await;

        api.call(
            "streams.update",
            &mut ctx,
            json!({ "id": "a", "update": { "trashed": true } }),
        )
        .await
        .unwrap();
        api.call("streams.delete", &mut ctx, json!({ "id": "a" }))
            .await
            .unwrap();

        // The single-stream event became a tombstone.
        assert!(ctx
            .services
            .storage
            .event_get(&ctx.username, &EventId::new("only-a"))
            .await
            .unwrap()
            .is_none());
        // The multi-stream event just lost the deleted stream id.
        let both = ctx
            .services
            .storage
            .event_get(&ctx.username, &EventId::new("both"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(both.stream_ids, vec![StreamId::from("keep")]);
    }

    #[tokio::test]
    async fn root_merge_is_rejected() {
        let (api, mut ctx) = api_and_ctx().await;
        create(&api, &mut ctx, json!({ "id": "a", "name": "A" })).await;
        api.call(
            "streams.update",
            &mut ctx,
            json!({ "id": "a", "update": { "trashed": true } }),
        )
        .await
        .unwrap();
        let err = api
            .call(
                "streams.delete",
                &mut ctx,
                json!({ "id": "a", "mergeEventsWithParent": true }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.id.as_str(), "invalid-operation");
    }
}

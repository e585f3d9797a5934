use serde_json::{json, Value};
use uuid::Uuid;

use trove_core::{
    inherit_features, verify_subset, Access, AccessId, AccessType, ApiError, Permission, Token,
};

use crate::bus::{Notification, Topic};
use crate::context::MethodContext;
use crate::error::StoreResultExt;
use crate::methods::{from_value, obj, opt_bool, require_str};
use crate::registry::{step, Api, Params, StepFuture};
use crate::result::MethodResult;

pub fn register(api: &mut Api) {
    api.register("accesses.get", vec![step(get)]);
    api.register(
        "accesses.create",
        vec![step(create_validate), step(create_apply)],
    );
    api.register("accesses.update", vec![step(update_gone)]);
    api.register("accesses.delete", vec![step(delete)]);
    api.register("accesses.checkApp", vec![step(check_app)]);
}

fn access_to_wire(ctx: &MethodContext, access: &Access) -> Result<Value, ApiError> {
    let mut value = serde_json::to_value(access).map_err(ApiError::unexpected)?;
    if let Some(perms) = value.get_mut("permissions") {
        ctx.services
            .compat
            .egress_permissions(perms, ctx.compat_disabled);
    }
    Ok(value)
}

fn get<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let include_expired = opt_bool(params, "includeExpired")?.unwrap_or(false);
        let include_deletions = opt_bool(params, "includeDeletions")?.unwrap_or(false);

        let caller = ctx.access()?.clone();
        let now = ctx.now();
        let all = ctx
            .services
            .storage
            .access_list(&ctx.username)
            .await
            .api_err()?;

        let visible: Vec<&Access> = if caller.is_personal() {
            all.iter()
                .filter(|a| !a.is_deleted())
                .filter(|a| include_expired || !a.is_expired(now))
                .collect()
        } else {
            // App callers see only live accesses they created themselves,
            // whose permissions they still hold.
            let perms = ctx.permissions()?;
            all.iter()
                .filter(|a| a.created_by() == &caller.id)
                .filter(|a| a.is_live(now))
                .filter(|a| verify_subset(&a.permissions, &perms).is_ok())
                .collect()
        };

        let wire: Result<Vec<Value>, ApiError> =
            visible.iter().map(|a| access_to_wire(ctx, a)).collect();
        result.set("accesses", Value::Array(wire?));

        if include_deletions && caller.is_personal() {
            let deletions: Result<Vec<Value>, ApiError> = all
                .iter()
                .filter(|a| a.is_deleted())
                .map(|a| access_to_wire(ctx, a))
                .collect();
            result.set("accessDeletions", Value::Array(deletions?));
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
        if params.get("deleted").is_some() {
            return Err(ApiError::invalid_parameters_format(
                "\"deleted\" cannot be set on creation",
            ));
        }
        match params.get("type").and_then(Value::as_str) {
            None => {
                params["type"] = json!("shared");
            }
            Some("shared" | "app") => {}
            Some("personal") => {
                return Err(ApiError::invalid_operation(
                    "Personal accesses are only created through login",
                ));
            }
            Some(other) => {
                return Err(ApiError::invalid_parameters_format(format!(
                    "Unknown access type \"{other}\""
                )));
            }
        }
        // Legacy prefixes on permission stream ids are canonicalized here,
        // before any evaluator sees them.
        if let Some(perms) = params.get_mut("permissions") {
            ctx.services.compat.ingress_permissions(perms);
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
        let caller = ctx.access()?.clone();
        if matches!(caller.access_type, AccessType::Shared) {
            return Err(ApiError::forbidden(
                "Shared accesses cannot create further accesses",
            ));
        }

        let permissions: Vec<Permission> = match params.get("permissions") {
            Some(value) => from_value(value.clone())?,
            None => Vec::new(),
        };
        Access::validate_permissions(&permissions)?;

        // Subset constraint against the creating access.
        let view = ctx.permissions()?;
        verify_subset(&permissions, &view)?;
        let permissions = inherit_features(&caller, permissions);

        let now = ctx.now();
        let expires = match crate::methods::opt_f64(params, "expireAfter")? {
            Some(seconds) if seconds >= 0.0 => Some(now + seconds),
            Some(_) => {
                return Err(ApiError::invalid_parameters_format(
                    "\"expireAfter\" must not be negative",
                ));
            }
            None => None,
        };

        let access = Access {
            id: AccessId::new(Uuid::new_v4().to_string()),
            token: params
                .get("token")
                .and_then(Value::as_str)
                .map_or_else(|| Token::new(Uuid::new_v4().to_string()), Token::new),
            access_type: from_value(params["type"].clone())?,
            name: require_str(params, "name")?.to_owned(),
            device_name: crate::methods::opt_str(params, "deviceName")?.map(str::to_owned),
            permissions,
            expires,
            deleted: None,
            client_data: params.get("clientData").cloned(),
            tracking: ctx.init_tracking(),
        };

        ctx.services
            .storage
            .access_insert(&ctx.username, &access)
            .await
            .api_err()?;
        ctx.services
            .bus
            .publish(Notification::for_user(Topic::AccessesChanged, &ctx.username));

        result.set("access", access_to_wire(ctx, &access)?);
        Ok(())
    })
}

fn update_gone<'a>(
    _ctx: &'a mut MethodContext,
    _params: &'a mut Params,
    _result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        Err(ApiError::gone(
            "accesses.update has been removed; delete and recreate instead",
        ))
    })
}

fn delete<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let id = AccessId::new(require_str(params, "id")?);
        let caller = ctx.access()?.clone();
        let now = ctx.now();

        let target = ctx
            .services
            .storage
            .access_get(&ctx.username, &id)
            .await
            .api_err()?
            .ok_or_else(|| ApiError::unknown_resource("access", id.as_str()))?;
        if target.is_deleted() {
            return Err(ApiError::forbidden("Access is already deleted"));
        }

        if !caller.is_personal() {
            let is_own_creation = target.created_by() == &caller.id;
            let is_self = target.id == caller.id;
            if is_self && caller.forbids_self_revoke() {
                return Err(ApiError::forbidden(
                    "This access is not allowed to revoke itself",
                ));
            }
            if !is_own_creation && !is_self {
                return Err(ApiError::forbidden(
                    "Accesses can only delete themselves or accesses they created",
                ));
            }
        }

        let mut tombstone = target.clone();
        tombstone.deleted = Some(now);
        tombstone.tracking.touch(now, &caller.id);
        ctx.services
            .storage
            .access_update(&ctx.username, &tombstone)
            .await
            .api_err()?;

        // Personal deletions cascade to the target's live descendants;
        // expired ones are left untouched.
        let mut related: Vec<Value> = Vec::new();
        if caller.is_personal() {
            let all = ctx
                .services
                .storage
                .access_list(&ctx.username)
                .await
                .api_err()?;
            for descendant in all {
                if descendant.created_by() == &target.id && descendant.is_live(now) {
                    let mut dead = descendant.clone();
                    dead.deleted = Some(now);
                    dead.tracking.touch(now, &caller.id);
                    ctx.services
                        .storage
                        .access_update(&ctx.username, &dead)
                        .await
                        .api_err()?;
                    related.push(json!({ "id": dead.id.as_str(), "deleted": now }));
                }
            }
        }

        ctx.services
            .bus
            .publish(Notification::for_user(Topic::AccessesChanged, &ctx.username));

        result.set(
            "accessDeletion",
            json!({ "id": id.as_str(), "deleted": now }),
        );
        result.set("relatedDeletions", Value::Array(related));
        Ok(())
    })
}

fn check_app<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let caller = ctx.access()?;
        if !caller.is_personal() {
            return Err(ApiError::forbidden(
                "checkApp requires a personal access",
            ));
        }
        let app_name = require_str(params, "requestingAppId")?.to_owned();
        let mut requested = params
            .get("requestedPermissions")
            .cloned()
            .unwrap_or_else(|| json!([]));
        ctx.services.compat.ingress_permissions(&mut requested);
        let requested_perms: Vec<Permission> = from_value(requested.clone())?;
        let client_data = params.get("clientData").cloned();

        let now = ctx.now();
        let candidate = ctx
            .services
            .storage
            .access_list(&ctx.username)
            .await
            .api_err()?
            .into_iter()
            .find(|a| a.is_app() && a.name == app_name && a.is_live(now));

        result.set("checkedPermissions", requested);
        if let Some(access) = candidate {
            let same_permissions = permission_sets_equal(&access.permissions, &requested_perms);
            let same_client_data = access.client_data == client_data;
            if same_permissions && same_client_data {
                result.set("matchingAccess", access_to_wire(ctx, &access)?);
            } else {
                result.set("mismatchingAccess", access_to_wire(ctx, &access)?);
            }
        }
        Ok(())
    })
}

/// Order-insensitive comparison of permission sets.
fn permission_sets_equal(a: &[Permission], b: &[Permission]) -> bool {
    a.len() == b.len() && a.iter().all(|p| b.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trove_core::{PermissionLevel, StreamId, Tracking};
    use trove_store::Storage;

    async fn api_and_ctx() -> (Api, MethodContext) {
        let mut api = Api::new();
        register(&mut api);
        let ctx = crate::testing::context().await;
        seed_stream(&ctx, "root").await;
        (api, ctx)
    }

    async fn seed_stream(ctx: &MethodContext, id: &str) {
        ctx.services
            .storage
            .stream_insert(
                &ctx.username,
                &trove_core::Stream {
                    id: StreamId::from(id),
                    name: id.to_owned(),
                    parent_id: None,
                    trashed: false,
                    single_activity: false,
                    client_data: None,
                    tracking: Tracking::init(1.0, &AccessId::new("t")),
                },
            )
            .await
            .unwrap();
        ctx.services.cache.invalidate(&ctx.username);
    }

    async fn context_for(ctx: &MethodContext, access: Access) -> MethodContext {
        MethodContext::new(ctx.services.clone(), ctx.user.clone(), access, false)
            .await
            .unwrap()
    }

    fn parse_access(result: &MethodResult) -> Access {
        serde_json::from_value(result.get("access").unwrap().clone()).unwrap()
    }

    #[tokio::test]
    async fn create_assigns_token_and_creator() {
        let (api, mut ctx) = api_and_ctx().await;
        let result = api
            .call(
                "accesses.create",
                &mut ctx,
                json!({
                    "name": "reader",
                    "permissions": [{ "streamId": "root", "level": "read" }]
                }),
            )
            .await
            .unwrap();
        let access = parse_access(&result);
        assert!(matches!(access.access_type, AccessType::Shared));
        assert!(!access.token.as_str().is_empty());
        assert_eq!(access.created_by(), &ctx.access().unwrap().id);
    }

    #[tokio::test]
    async fn duplicate_name_conflicts_until_deleted() {
        let (api, mut ctx) = api_and_ctx().await;
        let body = json!({ "name": "reader", "permissions": [] });
        let first = api
            .call("accesses.create", &mut ctx, body.clone())
            .await
            .unwrap();
        let err = api
            .call("accesses.create", &mut ctx, body.clone())
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 409);

        let id = parse_access(&first).id;
        api.call("accesses.delete", &mut ctx, json!({ "id": id.as_str() }))
            .await
            .unwrap();
        api.call("accesses.create", &mut ctx, body).await.unwrap();
    }

    #[tokio::test]
    async fn contribute_cannot_delegate_manage() {
        let (api, mut ctx) = api_and_ctx().await;
        // An app access with contribute on "root".
        let app = api
            .call(
                "accesses.create",
                &mut ctx,
                json!({
                    "name": "the-app", "type": "app",
                    "permissions": [{ "streamId": "root", "level": "contribute" }]
                }),
            )
            .await
            .unwrap();
        let mut app_ctx = context_for(&ctx, parse_access(&app)).await;

        let err = api
            .call(
                "accesses.create",
                &mut app_ctx,
                json!({
                    "name": "escalator",
                    "permissions": [{ "streamId": "root", "level": "manage" }]
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 403);

        api.call(
            "accesses.create",
            &mut app_ctx,
            json!({
                "name": "narrower",
                "permissions": [{ "streamId": "root", "level": "read" }]
            }),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn personal_delete_cascades_to_live_descendants() {
        let (api, mut ctx) = api_and_ctx().await;
        let app = api
            .call(
                "accesses.create",
                &mut ctx,
                json!({
                    "name": "the-app", "type": "app",
                    "permissions": [{ "streamId": "root", "level": "manage" }]
                }),
            )
            .await
            .unwrap();
        let app_access = parse_access(&app);
        let mut app_ctx = context_for(&ctx, app_access.clone()).await;

        let shared_a = api
            .call(
                "accesses.create",
                &mut app_ctx,
                json!({ "name": "shared-a",
                        "permissions": [{ "streamId": "root", "level": "read" }] }),
            )
            .await
            .unwrap();
        api.call(
            "accesses.create",
            &mut app_ctx,
            json!({ "name": "shared-b", "expireAfter": 0,
                    "permissions": [{ "streamId": "root", "level": "read" }] }),
        )
        .await
        .unwrap();

        let result = api
            .call(
                "accesses.delete",
                &mut ctx,
                json!({ "id": app_access.id.as_str() }),
            )
            .await
            .unwrap();
        let related = result.get("relatedDeletions").unwrap().as_array().unwrap();
        // Only the live descendant cascades; the expired one is untouched.
        assert_eq!(related.len(), 1);
        assert_eq!(related[0]["id"], parse_access(&shared_a).id.as_str());

        // Double delete is forbidden.
        let err = api
            .call(
                "accesses.delete",
                &mut ctx,
                json!({ "id": app_access.id.as_str() }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 403);
    }

    #[tokio::test]
    async fn self_revoke_feature_blocks_self_delete() {
        let (api, mut ctx) = api_and_ctx().await;
        let access = parse_access(
            &api.call(
                "accesses.create",
                &mut ctx,
                json!({
                    "name": "locked", "type": "app",
                    "permissions": [
                        { "streamId": "root", "level": "read" },
                        { "feature": "selfRevoke", "setting": "forbidden" }
                    ]
                }),
            )
            .await
            .unwrap(),
        );
        let mut locked_ctx = context_for(&ctx, access.clone()).await;
        let err = api
            .call(
                "accesses.delete",
                &mut locked_ctx,
                json!({ "id": access.id.as_str() }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 403);
    }

    #[tokio::test]
    async fn app_caller_sees_only_its_own_creations() {
        let (api, mut ctx) = api_and_ctx().await;
        let app = parse_access(
            &api.call(
                "accesses.create",
                &mut ctx,
                json!({ "name": "the-app", "type": "app",
                        "permissions": [{ "streamId": "root", "level": "manage" }] }),
            )
            .await
            .unwrap(),
        );
        let mut app_ctx = context_for(&ctx, app).await;
        api.call(
            "accesses.create",
            &mut app_ctx,
            json!({ "name": "mine",
                    "permissions": [{ "streamId": "root", "level": "read" }] }),
        )
        .await
        .unwrap();

        let personal_view = api.call("accesses.get", &mut ctx, json!({})).await.unwrap();
        assert!(personal_view.get("accesses").unwrap().as_array().unwrap().len() >= 3);

        let app_view = api
            .call("accesses.get", &mut app_ctx, json!({}))
            .await
            .unwrap();
        let names: Vec<&str> = app_view
            .get("accesses")
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["mine"]);
    }

    #[tokio::test]
    async fn check_app_matches_and_mismatches() {
        let (api, mut ctx) = api_and_ctx().await;
        api.call(
            "accesses.create",
            &mut ctx,
            json!({ "name": "the-app", "type": "app",
                    "permissions": [{ "streamId": "root", "level": "read" }] }),
        )
        .await
        .unwrap();

        let matching = api
            .call(
                "accesses.checkApp",
                &mut ctx,
                json!({ "requestingAppId": "the-app",
                        "requestedPermissions": [{ "streamId": "root", "level": "read" }] }),
            )
            .await
            .unwrap();
        assert!(matching.get("matchingAccess").is_some());
        assert!(matching.get("mismatchingAccess").is_none());

        let mismatching = api
            .call(
                "accesses.checkApp",
                &mut ctx,
                json!({ "requestingAppId": "the-app",
                        "requestedPermissions": [{ "streamId": "root", "level": "manage" }] }),
            )
            .await
            .unwrap();
        assert!(mismatching.get("mismatchingAccess").is_some());

        let neither = api
            .call(
                "accesses.checkApp",
                &mut ctx,
                json!({ "requestingAppId": "unknown-app", "requestedPermissions": [] }),
            )
            .await
            .unwrap();
        assert!(neither.get("matchingAccess").is_none());
        assert!(neither.get("mismatchingAccess").is_none());
    }

    #[tokio::test]
    async fn update_is_gone() {
        let (api, mut ctx) = api_and_ctx().await;
        let err = api
            .call("accesses.update", &mut ctx, json!({ "id": "x" }))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 410);
    }
}

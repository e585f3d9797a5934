use serde_json::{json, Value};
use uuid::Uuid;

use trove_core::{ApiError, FollowedSlice, Token};

use crate::bus::{Notification, Topic};
use crate::context::MethodContext;
use crate::error::StoreResultExt;
use crate::methods::{obj, require_str};
use crate::registry::{step, Api, Params, StepFuture};
use crate::result::MethodResult;

pub fn register(api: &mut Api) {
    api.register("followedSlices.get", vec![step(get)]);
    api.register("followedSlices.create", vec![step(create)]);
    api.register("followedSlices.update", vec![step(update)]);
    api.register("followedSlices.delete", vec![step(delete)]);
}

fn require_personal(ctx: &MethodContext) -> Result<(), ApiError> {
    if ctx.access()?.is_personal() {
        Ok(())
    } else {
        Err(ApiError::forbidden(
            "Followed slices require a personal access",
        ))
    }
}

fn get<'a>(
    ctx: &'a mut MethodContext,
    _params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        require_personal(ctx)?;
        let slices = ctx
            .services
            .storage
            .followed_slices(&ctx.username)
            .await
            .api_err()?;
        result.set(
            "followedSlices",
            serde_json::to_value(slices).map_err(ApiError::unexpected)?,
        );
        Ok(())
    })
}

fn create<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        require_personal(ctx)?;
        obj(params)?;
        let slice = FollowedSlice {
            id: Uuid::new_v4().to_string(),
            name: require_str(params, "name")?.to_owned(),
            url: require_str(params, "url")?.to_owned(),
            access_token: Token::new(require_str(params, "accessToken")?),
            tracking: ctx.init_tracking(),
        };
        ctx.services
            .storage
            .followed_slice_insert(&ctx.username, &slice)
            .await
            .api_err()?;
        ctx.services.bus.publish(Notification::for_user(
            Topic::FollowedSlicesChanged,
            &ctx.username,
        ));
        result.set(
            "followedSlice",
            serde_json::to_value(&slice).map_err(ApiError::unexpected)?,
        );
        Ok(())
    })
}

fn update<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        require_personal(ctx)?;
        let id = require_str(params, "id")?.to_owned();
        let update = params
            .get("update")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| ApiError::invalid_parameters_format("Missing \"update\" object"))?;

        let mut slice = ctx
            .services
            .storage
            .followed_slices(&ctx.username)
            .await
            .api_err()?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| ApiError::unknown_resource("followed slice", &id))?;

        if let Some(name) = update.get("name").and_then(Value::as_str) {
            slice.name = name.to_owned();
        }
        if let Some(url) = update.get("url").and_then(Value::as_str) {
            slice.url = url.to_owned();
        }
        if let Some(token) = update.get("accessToken").and_then(Value::as_str) {
            slice.access_token = Token::new(token);
        }
        slice.tracking.touch(ctx.now(), &ctx.actor());

        ctx.services
            .storage
            .followed_slice_update(&ctx.username, &slice)
            .await
            .api_err()?;
        ctx.services.bus.publish(Notification::for_user(
            Topic::FollowedSlicesChanged,
            &ctx.username,
        ));
        result.set(
            "followedSlice",
            serde_json::to_value(&slice).map_err(ApiError::unexpected)?,
        );
        Ok(())
    })
}

fn delete<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        require_personal(ctx)?;
        let id = require_str(params, "id")?.to_owned();
        let known = ctx
            .services
            .storage
            .followed_slices(&ctx.username)
            .await
            .api_err()?
            .iter()
            .any(|s| s.id == id);
        if !known {
            return Err(ApiError::unknown_resource("followed slice", &id));
        }
        ctx.services
            .storage
            .followed_slice_delete(&ctx.username, &id)
            .await
            .api_err()?;
        ctx.services.bus.publish(Notification::for_user(
            Topic::FollowedSlicesChanged,
            &ctx.username,
        ));
        result.set("followedSliceDeletion", json!({ "id": id }));
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn crud_roundtrip_with_duplicate_rejection() {
        let mut api = Api::new();
        register(&mut api);
        let mut ctx = crate::testing::context().await;

        let body = json!({ "name": "bob's diary", "url": "https://bob.local/bob/",
                           "accessToken": "tok" });
        let created = api
            .call("followedSlices.create", &mut ctx, body.clone())
            .await
            .unwrap();
        let id = created.get("followedSlice").unwrap()["id"]
            .as_str()
            .unwrap()
            .to_owned();

        let err = api
            .call("followedSlices.create", &mut ctx, body)
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 409);

        api.call(
            "followedSlices.update",
            &mut ctx,
            json!({ "id": id, "update": { "name": "bob" } }),
        )
        .await
        .unwrap();
        api.call("followedSlices.delete", &mut ctx, json!({ "id": id }))
            .await
            .unwrap();

        let listed = api
            .call("followedSlices.get", &mut ctx, json!({}))
            .await
            .unwrap();
        assert!(listed
            .get("followedSlices")
            .unwrap()
            .as_array()
            .unwrap()
            .is_empty());
    }
}

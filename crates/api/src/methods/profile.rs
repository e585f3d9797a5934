use serde_json::{Map, Value};

use trove_core::{ApiError, ProfileScope};

use crate::context::MethodContext;
use crate::error::StoreResultExt;
use crate::methods::{from_value, require_str};
use crate::registry::{step, Api, Params, StepFuture};
use crate::result::MethodResult;

pub fn register(api: &mut Api) {
    api.register("profile.get", vec![step(get)]);
    api.register("profile.update", vec![step(update)]);
}

/// Resolve the storage key for a scope, enforcing who may touch it: the
/// private scope is personal-only, the app scope belongs to the calling app
/// access, the public scope is open to any reader but personal-only to
/// write.
fn scope_key(ctx: &MethodContext, scope: ProfileScope, writing: bool) -> Result<String, ApiError> {
    let access = ctx.access()?;
    match scope {
        ProfileScope::Private => {
            if !access.is_personal() {
                return Err(ApiError::forbidden(
                    "The private profile requires a personal access",
                ));
            }
            Ok("private".to_owned())
        }
        ProfileScope::Public => {
            if writing && !access.is_personal() {
                return Err(ApiError::forbidden(
                    "Writing the public profile requires a personal access",
                ));
            }
            Ok("public".to_owned())
        }
        ProfileScope::App => {
            if !access.is_app() {
                return Err(ApiError::forbidden(
                    "The app profile requires an app access",
                ));
            }
            Ok(format!("app:{}", access.name))
        }
    }
}

fn get<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let scope: ProfileScope = from_value(Value::String(require_str(params, "scope")?.to_owned()))?;
        let key = scope_key(ctx, scope, false)?;
        let profile = ctx
            .services
            .storage
            .profile_get(&ctx.username, &key)
            .await
            .api_err()?
            .unwrap_or_else(|| Value::Object(Map::new()));
        result.set("profile", profile);
        Ok(())
    })
}

fn update<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let scope: ProfileScope = from_value(Value::String(require_str(params, "scope")?.to_owned()))?;
        let key = scope_key(ctx, scope, true)?;
        let update = params
            .get("update")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| ApiError::invalid_parameters_format("Missing \"update\" object"))?;

        let mut profile = ctx
            .services
            .storage
            .profile_get(&ctx.username, &key)
            .await
            .api_err()?
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();

        // Merge: null values delete keys, everything else replaces.
        for (k, v) in update {
            if v.is_null() {
                profile.remove(&k);
            } else {
                profile.insert(k, v);
            }
        }

        let merged = Value::Object(profile);
        ctx.services
            .storage
            .profile_set(&ctx.username, &key, merged.clone())
            .await
            .api_err()?;
        result.set("profile", merged);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn merge_semantics_with_null_deletes() {
        let mut api = Api::new();
        register(&mut api);
        let mut ctx = crate::testing::context().await;

        api.call(
            "profile.update",
            &mut ctx,
            json!({ "scope": "private", "update": { "a": 1, "b": 2 } }),
        )
        .await
        .unwrap();
        let result = api
            .call(
                "profile.update",
                &mut ctx,
                json!({ "scope": "private", "update": { "a": null, "c": 3 } }),
            )
            .await
            .unwrap();
        assert_eq!(result.get("profile").unwrap(), &json!({ "b": 2, "c": 3 }));

        let read = api
            .call("profile.get", &mut ctx, json!({ "scope": "private" }))
            .await
            .unwrap();
        assert_eq!(read.get("profile").unwrap(), &json!({ "b": 2, "c": 3 }));
    }

    #[tokio::test]
    async fn app_scope_requires_app_access() {
        let mut api = Api::new();
        register(&mut api);
        let mut ctx = crate::testing::context().await;
        let err = api
            .call("profile.get", &mut ctx, json!({ "scope": "app" }))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 403);
    }
}

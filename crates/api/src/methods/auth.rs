use serde_json::json;
use uuid::Uuid;

use trove_core::{
    Access, AccessId, AccessType, ApiError, Session, Token, Tracking,
};

use crate::context::{MethodContext, SYSTEM_ACTOR};
use crate::error::StoreResultExt;
use crate::methods::{obj, opt_str, require_str};
use crate::password::verify_password;
use crate::registry::{step, Api, Params, StepFuture};
use crate::result::MethodResult;

pub fn register(api: &mut Api) {
    api.register("auth.login", vec![step(login_validate), step(login_apply)]);
    api.register("auth.logout", vec![step(logout)]);
    api.register("getAccessInfo", vec![step(access_info)]);
}

fn login_validate<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    _result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        obj(params)?;
        let username = require_str(params, "username")?;
        require_str(params, "password")?;
        let app_id = require_str(params, "appId")?;
        if username != ctx.username.as_str() {
            return Err(ApiError::invalid_operation(
                "Login username does not match the request path",
            ));
        }
        // The frontend injects the caller's Origin (or Referer) header.
        let origin = opt_str(params, "origin")?;
        if !ctx
            .services
            .settings
            .trusted_apps
            .is_trusted(app_id, origin)
        {
            return Err(ApiError::invalid_credentials(format!(
                "App \"{app_id}\" is not trusted for this origin"
            )));
        }
        Ok(())
    })
}

fn login_apply<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let password = require_str(params, "password")?;
        let app_id = require_str(params, "appId")?.to_owned();

        if !verify_password(&ctx.user.password_hash, password) {
            return Err(ApiError::invalid_credentials("Invalid username or password"));
        }

        let now = ctx.now();
        let token = Token::new(Uuid::new_v4().to_string());
        let session = Session {
            token: token.clone(),
            username: ctx.username.clone(),
            app_id: app_id.clone(),
            expires: now + ctx.services.settings.session_max_age_seconds,
        };
        ctx.services
            .storage
            .session_insert(&session)
            .await
            .api_err()?;

        // One personal access per app; a new login rebinds it to the fresh
        // session token.
        let storage = &ctx.services.storage;
        let existing = storage
            .access_list(&ctx.username)
            .await
            .api_err()?
            .into_iter()
            .find(|a| a.is_personal() && a.name == app_id && !a.is_deleted());

        match existing {
            Some(mut access) => {
                access.token = token.clone();
                access.tracking.touch(now, &AccessId::new(SYSTEM_ACTOR));
                storage
                    .access_update(&ctx.username, &access)
                    .await
                    .api_err()?;
            }
            None => {
                let access = Access {
                    id: AccessId::new(Uuid::new_v4().to_string()),
                    token: token.clone(),
                    access_type: AccessType::Personal,
                    name: app_id,
                    device_name: None,
                    permissions: Vec::new(),
                    expires: None,
                    deleted: None,
                    client_data: None,
                    tracking: Tracking::init(now, &AccessId::new(SYSTEM_ACTOR)),
                };
                storage
                    .access_insert(&ctx.username, &access)
                    .await
                    .api_err()?;
            }
        }

        ctx.services.cache.invalidate_and_notify(&ctx.username, &ctx.services.bus);
        ctx.services.bus.publish(crate::bus::Notification::for_user(
            crate::bus::Topic::AccessesChanged,
            &ctx.username,
        ));

        let language = crate::methods::account::account_leaf_value(ctx, "language")
            .await?
            .unwrap_or_else(|| json!("en"));
        result.set("token", json!(token.as_str()));
        result.set(
            "apiEndpoint",
            json!(format!(
                "{}/{}/",
                ctx.services.settings.public_url.trim_end_matches('/'),
                ctx.username
            )),
        );
        result.set("preferredLanguage", language);
        Ok(())
    })
}

fn logout<'a>(
    ctx: &'a mut MethodContext,
    _params: &'a mut Params,
    _result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let access = ctx.access()?;
        if !access.is_personal() {
            return Err(ApiError::forbidden(
                "Only personal accesses carry a session to log out of",
            ));
        }
        let token = access.token.clone();
        ctx.services.storage.session_delete(&token).await.api_err()?;
        Ok(())
    })
}

fn access_info<'a>(
    ctx: &'a mut MethodContext,
    _params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let perms = ctx.permissions()?;
        let effective = perms.effective_permissions();
        let access = ctx.access()?;

        let mut body = serde_json::to_value(access).map_err(ApiError::unexpected)?;
        body["permissions"] = serde_json::to_value(effective).map_err(ApiError::unexpected)?;
        if let Some(perms_value) = body.get_mut("permissions") {
            ctx.services
                .compat
                .egress_permissions(perms_value, ctx.compat_disabled);
        }
        body["user"] = json!({ "username": ctx.username.as_str() });

        result.set("access", body);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MethodContext;

    async fn login_context() -> (crate::registry::Api, MethodContext) {
        let (services, fixture) = crate::testing::services_with_user().await;
        let user = services
            .storage
            .user_by_username(&fixture.username)
            .await
            .unwrap()
            .unwrap();
        let ctx = MethodContext::unauthenticated(services, user).await.unwrap();
        let mut api = Api::new();
        register(&mut api);
        (api, ctx)
    }

    #[tokio::test]
    async fn login_returns_token_and_endpoint() {
        let (api, mut ctx) = login_context().await;
        let result = api
            .call(
                "auth.login",
                &mut ctx,
                json!({ "username": "alice", "password": "pw", "appId": "trove-test" }),
            )
            .await
            .unwrap();
        let token = result.get("token").unwrap().as_str().unwrap().to_owned();
        assert!(!token.is_empty());
        assert!(result
            .get("apiEndpoint")
            .unwrap()
            .as_str()
            .unwrap()
            .ends_with("/alice/"));
        assert_eq!(result.get("preferredLanguage").unwrap(), &json!("en"));

        // The token authenticates as a personal access with a session.
        let access = ctx
            .services
            .storage
            .access_by_token(&ctx.username, &Token::new(token.clone()))
            .await
            .unwrap()
            .unwrap();
        assert!(access.is_personal());
        assert_eq!(access.name, "trove-test");
        assert!(ctx
            .services
            .storage
            .session_get(&Token::new(token))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn login_rejects_bad_password() {
        let (api, mut ctx) = login_context().await;
        let err = api
            .call(
                "auth.login",
                &mut ctx,
                json!({ "username": "alice", "password": "nope", "appId": "a" }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 401);
    }

    #[tokio::test]
    async fn relogin_rebinds_the_personal_access() {
        let (api, mut ctx) = login_context().await;
        let body = json!({ "username": "alice", "password": "pw", "appId": "trove-test" });
        let first = api.call("auth.login", &mut ctx, body.clone()).await.unwrap();
        let second = api.call("auth.login", &mut ctx, body).await.unwrap();
        assert_ne!(first.get("token"), second.get("token"));

        // Still exactly one personal access for this app.
        let personals = ctx
            .services
            .storage
            .access_list(&ctx.username)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.is_personal() && a.name == "trove-test")
            .count();
        assert_eq!(personals, 1);
    }

    #[tokio::test]
    async fn access_info_reports_star_manage_for_personal() {
        let mut ctx = crate::testing::context().await;
        let mut api = Api::new();
        register(&mut api);
        let result = api.call("getAccessInfo", &mut ctx, json!({})).await.unwrap();
        let access = result.get("access").unwrap();
        assert_eq!(access["type"], "personal");
        assert_eq!(access["permissions"][0]["streamId"], "*");
        assert_eq!(access["permissions"][0]["level"], "manage");
        assert_eq!(access["user"]["username"], "alice");
    }

    #[tokio::test]
    async fn logout_destroys_the_session() {
        let mut ctx = crate::testing::context().await;
        let mut api = Api::new();
        register(&mut api);
        let token = ctx.access().unwrap().token.clone();
        api.call("auth.logout", &mut ctx, json!({})).await.unwrap();
        assert!(ctx
            .services
            .storage
            .session_get(&token)
            .await
            .unwrap()
            .is_none());
    }
}

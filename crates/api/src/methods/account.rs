use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

use trove_core::{
    ApiError, CompiledConjunct, CompiledQuery, Event, EventId, StreamId, Token, LOCAL_STORE,
};
use trove_store::EventsQuery;

use crate::context::MethodContext;
use crate::engine::archive_head;
use crate::error::StoreResultExt;
use crate::methods::{obj, require_str};
use crate::password::{hash_password, verify_password};
use crate::registry::{step, Api, Params, StepFuture};
use crate::result::MethodResult;

pub fn register(api: &mut Api) {
    api.register("account.get", vec![step(get)]);
    api.register("account.update", vec![step(update)]);
    api.register("account.changePassword", vec![step(change_password)]);
    api.register(
        "account.requestPasswordReset",
        vec![step(request_password_reset)],
    );
    api.register("account.resetPassword", vec![step(reset_password)]);
}

/// Query for the single current event on one system stream.
fn leaf_query(stream_id: StreamId) -> EventsQuery {
    EventsQuery {
        streams: Some(CompiledQuery {
            conjuncts: vec![CompiledConjunct {
                store_id: LOCAL_STORE.to_owned(),
                any: vec![stream_id],
                all: Vec::new(),
                not: Vec::new(),
            }],
        }),
        limit: Some(1),
        ..EventsQuery::default()
    }
}

/// The current head event carrying an account leaf value, if any.
pub(crate) async fn account_leaf_event(
    ctx: &MethodContext,
    suffix: &str,
) -> Result<Option<Event>, ApiError> {
    let Some(def) = ctx.services.system.by_suffix(suffix) else {
        return Ok(None);
    };
    let mut events = ctx
        .services
        .storage
        .events_find(&ctx.username, &leaf_query(def.id()))
        .await
        .api_err()?;
    Ok(events.pop())
}

/// The current value of an account leaf, if set.
pub(crate) async fn account_leaf_value(
    ctx: &MethodContext,
    suffix: &str,
) -> Result<Option<Value>, ApiError> {
    Ok(account_leaf_event(ctx, suffix).await?.and_then(|e| e.content))
}

/// Create the event holding an account leaf value (registration path).
pub(crate) fn leaf_event(ctx: &MethodContext, stream_id: StreamId, suffix: &str, value: Value) -> Event {
    Event {
        id: EventId::new(Uuid::new_v4().to_string()),
        stream_ids: vec![stream_id],
        event_type: format!("{suffix}/string"),
        time: ctx.now(),
        duration: None,
        content: Some(value),
        attachments: Vec::new(),
        tags: Vec::new(),
        client_data: None,
        trashed: false,
        integrity: None,
        deleted: None,
        head_id: None,
        tracking: ctx.init_tracking(),
    }
}

fn require_personal(ctx: &MethodContext) -> Result<(), ApiError> {
    if ctx.access()?.is_personal() {
        Ok(())
    } else {
        Err(ApiError::forbidden(
            "Account details require a personal access",
        ))
    }
}

async fn collect_account(ctx: &MethodContext) -> Result<Value, ApiError> {
    let mut account = Map::new();
    account.insert("username".to_owned(), json!(ctx.username.as_str()));
    for def in ctx.services.system.account_leaves() {
        if let Some(value) = account_leaf_value(ctx, &def.suffix).await? {
            account.insert(def.suffix.clone(), value);
        }
    }
    Ok(Value::Object(account))
}

fn get<'a>(
    ctx: &'a mut MethodContext,
    _params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        require_personal(ctx)?;
        result.set("account", collect_account(ctx).await?);
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
        let update = params
            .get("update")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| {
                ApiError::invalid_parameters_format("Missing \"update\" object")
            })?;

        for (field, value) in &update {
            let def = ctx
                .services
                .system
                .by_suffix(field)
                .filter(|d| d.editable)
                .ok_or_else(|| {
                    ApiError::invalid_parameters_format(format!(
                        "Unknown or read-only account field \"{field}\""
                    ))
                })?;
            let stream_id = def.id();
            let new_value = value
                .as_str()
                .ok_or_else(|| {
                    ApiError::invalid_parameters_format(format!(
                        "Account field \"{field}\" must be a string"
                    ))
                })?
                .to_owned();

            let existing = account_leaf_event(ctx, field).await?;
            if def.indexed {
                ctx.services
                    .storage
                    .unique_value_claim(&stream_id, &new_value, &ctx.username)
                    .await
                    .api_err()?;
                if let Some(old) = existing.as_ref().and_then(|e| e.content.as_ref()) {
                    if let Some(old_str) = old.as_str()
                        && old_str != new_value
                    {
                        ctx.services
                            .storage
                            .unique_value_release(&stream_id, old_str, &ctx.username)
                            .await
                            .api_err()?;
                    }
                }
            }

            match existing {
                Some(mut event) => {
                    archive_head(&ctx.services, &ctx.username, &event).await?;
                    event.content = Some(json!(new_value));
                    event.tracking.touch(ctx.now(), &ctx.actor());
                    ctx.services
                        .storage
                        .event_update(&ctx.username, &event)
                        .await
                        .api_err()?;
                }
                None => {
                    let event = leaf_event(ctx, stream_id, field, json!(new_value));
                    ctx.services
                        .storage
                        .event_insert(&ctx.username, &event)
                        .await
                        .api_err()?;
                }
            }
        }

        ctx.services.bus.publish(crate::bus::Notification::for_user(
            crate::bus::Topic::EventsChanged,
            &ctx.username,
        ));
        result.set("account", collect_account(ctx).await?);
        Ok(())
    })
}

fn change_password<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    _result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        require_personal(ctx)?;
        obj(params)?;
        let old = require_str(params, "oldPassword")?;
        let new = require_str(params, "newPassword")?;

        if !verify_password(&ctx.user.password_hash, old) {
            return Err(ApiError::invalid_operation("The given password is wrong"));
        }
        set_password(ctx, new).await
    })
}

async fn set_password(ctx: &mut MethodContext, new: &str) -> Result<(), ApiError> {
    let history_len = ctx.services.settings.password_history_length;
    if history_len > 0 {
        let history = ctx
            .services
            .storage
            .password_history(&ctx.username)
            .await
            .api_err()?;
        let reused = verify_password(&ctx.user.password_hash, new)
            || history
                .iter()
                .take(history_len.saturating_sub(1))
                .any(|(hash, _)| verify_password(hash, new));
        if reused {
            return Err(ApiError::invalid_operation(
                "The new password was used recently",
            ));
        }
    }

    let now = ctx.now();
    ctx.services
        .storage
        .password_history_push(&ctx.username, &ctx.user.password_hash, now)
        .await
        .api_err()?;
    ctx.user.password_hash = hash_password(new)?;
    ctx.services
        .storage
        .user_update(&ctx.user)
        .await
        .api_err()?;
    Ok(())
}

fn request_password_reset<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    _result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        obj(params)?;
        let app_id = require_str(params, "appId")?;
        let origin = crate::methods::opt_str(params, "origin")?;
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

        let token = Token::new(Uuid::new_v4().to_string());
        ctx.services
            .storage
            .reset_token_insert(&ctx.username, &token, ctx.now())
            .await
            .api_err()?;
        // Mail delivery is out of scope; the token only surfaces in logs.
        info!(user = %ctx.username, "password reset requested");
        Ok(())
    })
}

fn reset_password<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    _result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        obj(params)?;
        let token = Token::new(require_str(params, "resetToken")?);
        let new = require_str(params, "newPassword")?.to_owned();
        let app_id = require_str(params, "appId")?;
        let origin = crate::methods::opt_str(params, "origin")?;
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

        let created = ctx
            .services
            .storage
            .reset_token_take(&ctx.username, &token)
            .await
            .api_err()?
            .ok_or_else(|| ApiError::invalid_credentials("Invalid reset token"))?;
        if ctx.now() - created > ctx.services.settings.password_reset_max_age_seconds {
            return Err(ApiError::invalid_credentials("Reset token has expired"));
        }
        set_password(ctx, &new).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn api_and_ctx() -> (Api, MethodContext) {
        let mut api = Api::new();
        register(&mut api);
        (api, crate::testing::context().await)
    }

    #[tokio::test]
    async fn account_roundtrip_via_system_streams() {
        let (api, mut ctx) = api_and_ctx().await;

        let result = api
            .call(
                "account.update",
                &mut ctx,
                json!({ "update": { "email": "alice@example.com", "language": "fr" } }),
            )
            .await
            .unwrap();
        assert_eq!(result.get("account").unwrap()["email"], "alice@example.com");

        let result = api.call("account.get", &mut ctx, json!({})).await.unwrap();
        let account = result.get("account").unwrap();
        assert_eq!(account["username"], "alice");
        assert_eq!(account["language"], "fr");

        // The value lives as an event on the system stream.
        let event = account_leaf_event(&ctx, "email").await.unwrap().unwrap();
        assert_eq!(event.stream_ids[0].as_str(), ":system:email");
    }

    #[tokio::test]
    async fn indexed_email_collides_across_users() {
        let (api, mut ctx) = api_and_ctx().await;
        api.call(
            "account.update",
            &mut ctx,
            json!({ "update": { "email": "taken@example.com" } }),
        )
        .await
        .unwrap();

        // Another user claiming the same address conflicts.
        let err = ctx
            .services
            .storage
            .unique_value_claim(
                &StreamId::new(":system:email"),
                "taken@example.com",
                &trove_core::Username::new("bob"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, trove_store::StoreError::Duplicate { .. }));

        // Changing the address releases the old claim.
        api.call(
            "account.update",
            &mut ctx,
            json!({ "update": { "email": "new@example.com" } }),
        )
        .await
        .unwrap();
        ctx.services
            .storage
            .unique_value_claim(
                &StreamId::new(":system:email"),
                "taken@example.com",
                &trove_core::Username::new("bob"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_account_field_rejected() {
        let (api, mut ctx) = api_and_ctx().await;
        let err = api
            .call(
                "account.update",
                &mut ctx,
                json!({ "update": { "shoeSize": "44" } }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn change_password_checks_old_and_history() {
        let (api, mut ctx) = api_and_ctx().await;

        let err = api
            .call(
                "account.changePassword",
                &mut ctx,
                json!({ "oldPassword": "wrong", "newPassword": "next" }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.id.as_str(), "invalid-operation");

        api.call(
            "account.changePassword",
            &mut ctx,
            json!({ "oldPassword": "pw", "newPassword": "next1" }),
        )
        .await
        .unwrap();
        assert!(verify_password(&ctx.user.password_hash, "next1"));

        // Reusing the previous password is rejected.
        let err = api
            .call(
                "account.changePassword",
                &mut ctx,
                json!({ "oldPassword": "next1", "newPassword": "pw" }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.id.as_str(), "invalid-operation");
    }

    #[tokio::test]
    async fn password_reset_flow() {
        let (api, mut ctx) = api_and_ctx().await;
        api.call(
            "account.requestPasswordReset",
            &mut ctx,
            json!({ "appId": "trove-test" }),
        )
        .await
        .unwrap();

        // Fish the token out of the store for the test.
        let token = Token::new("by-hand");
        ctx.services
            .storage
            .reset_token_insert(&ctx.username, &token, ctx.now())
            .await
            .unwrap();

        api.call(
            "account.resetPassword",
            &mut ctx,
            json!({ "resetToken": "by-hand", "newPassword": "fresh", "appId": "trove-test" }),
        )
        .await
        .unwrap();
        assert!(verify_password(&ctx.user.password_hash, "fresh"));

        // Tokens are single-use.
        let err = api
            .call(
                "account.resetPassword",
                &mut ctx,
                json!({ "resetToken": "by-hand", "newPassword": "x", "appId": "trove-test" }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 401);
    }
}

use serde_json::{json, Value};
use uuid::Uuid;

use trove_core::{ApiError, Webhook, WebhookState};

use crate::context::MethodContext;
use crate::error::StoreResultExt;
use crate::methods::{obj, require_str};
use crate::registry::{step, Api, Params, StepFuture};
use crate::result::MethodResult;

pub fn register(api: &mut Api) {
    api.register("webhooks.get", vec![step(get)]);
    api.register("webhooks.getOne", vec![step(get_one)]);
    api.register("webhooks.create", vec![step(create)]);
    api.register("webhooks.update", vec![step(update)]);
    api.register("webhooks.delete", vec![step(delete)]);
}

/// Personal accesses see every webhook; app accesses only their own.
/// Shared accesses have no webhook surface.
async fn visible_webhooks(ctx: &MethodContext) -> Result<Vec<Webhook>, ApiError> {
    let access = ctx.access()?;
    if !access.is_personal() && !access.is_app() {
        return Err(ApiError::forbidden(
            "Webhooks require a personal or app access",
        ));
    }
    let hooks = ctx.services.storage.webhooks(&ctx.username).await.api_err()?;
    Ok(if access.is_personal() {
        hooks
    } else {
        let id = access.id.clone();
        hooks.into_iter().filter(|w| w.access_id == id).collect()
    })
}

fn get<'a>(
    ctx: &'a mut MethodContext,
    _params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let hooks = visible_webhooks(ctx).await?;
        result.set(
            "webhooks",
            serde_json::to_value(hooks).map_err(ApiError::unexpected)?,
        );
        Ok(())
    })
}

fn get_one<'a>(
    ctx: &'a mut MethodContext,
    params: &'a mut Params,
    result: &'a mut MethodResult,
) -> StepFuture<'a> {
    Box::pin(async move {
        let id = require_str(params, "id")?.to_owned();
        let hook = visible_webhooks(ctx)
            .await?
            .into_iter()
            .find(|w| w.id == id)
            .ok_or_else(|| ApiError::unknown_resource("webhook", &id))?;
        result.set(
            "webhook",
            serde_json::to_value(&hook).map_err(ApiError::unexpected)?,
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
        obj(params)?;
        let access = ctx.access()?;
        if !access.is_personal() && !access.is_app() {
            return Err(ApiError::forbidden(
                "Webhooks require a personal or app access",
            ));
        }
        let url = require_str(params, "url")?.to_owned();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ApiError::invalid_parameters_format(
                "Webhook url must be http(s)",
            ));
        }

        let defaults = &ctx.services.settings.webhooks;
        let hook = Webhook {
            id: Uuid::new_v4().to_string(),
            access_id: access.id.clone(),
            url,
            state: WebhookState::Active,
            run_count: 0,
            fail_count: 0,
            runs: Vec::new(),
            runs_size: defaults.runs_size,
            current_retries: 0,
            max_retries: defaults.max_retries,
            min_interval_ms: defaults.min_interval_ms,
            last_run: None,
            tracking: ctx.init_tracking(),
        };
        ctx.services
            .storage
            .webhook_insert(&ctx.username, &hook)
            .await
            .api_err()?;
        result.set(
            "webhook",
            serde_json::to_value(&hook).map_err(ApiError::unexpected)?,
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
        let id = require_str(params, "id")?.to_owned();
        let update = params
            .get("update")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| ApiError::invalid_parameters_format("Missing \"update\" object"))?;

        let mut hook = visible_webhooks(ctx)
            .await?
            .into_iter()
            .find(|w| w.id == id)
            .ok_or_else(|| ApiError::unknown_resource("webhook", &id))?;

        // Only the state is mutable; reactivation resets the retry budget.
        if let Some(state) = update.get("state") {
            hook.state = crate::methods::from_value(state.clone())?;
            if hook.state == WebhookState::Active {
                hook.current_retries = 0;
            }
        }
        hook.tracking.touch(ctx.now(), &ctx.actor());
        ctx.services
            .storage
            .webhook_update(&ctx.username, &hook)
            .await
            .api_err()?;
        result.set(
            "webhook",
            serde_json::to_value(&hook).map_err(ApiError::unexpected)?,
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
        let id = require_str(params, "id")?.to_owned();
        let known = visible_webhooks(ctx).await?.into_iter().any(|w| w.id == id);
        if !known {
            return Err(ApiError::unknown_resource("webhook", &id));
        }
        ctx.services
            .storage
            .webhook_delete(&ctx.username, &id)
            .await
            .api_err()?;
        result.set("webhookDeletion", json!({ "id": id }));
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_applies_tenant_defaults() {
        let mut api = Api::new();
        register(&mut api);
        let mut ctx = crate::testing::context().await;

        let created = api
            .call(
                "webhooks.create",
                &mut ctx,
                json!({ "url": "https://example.com/hook" }),
            )
            .await
            .unwrap();
        let hook = created.get("webhook").unwrap();
        assert_eq!(hook["state"], "active");
        assert_eq!(hook["maxRetries"], 5);

        let err = api
            .call("webhooks.create", &mut ctx, json!({ "url": "ftp://nope" }))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn reactivation_resets_retries() {
        let mut api = Api::new();
        register(&mut api);
        let mut ctx = crate::testing::context().await;
        let created = api
            .call(
                "webhooks.create",
                &mut ctx,
                json!({ "url": "https://example.com/hook" }),
            )
            .await
            .unwrap();
        let id = created.get("webhook").unwrap()["id"].as_str().unwrap().to_owned();

        // Deactivate, then reactivate.
        api.call(
            "webhooks.update",
            &mut ctx,
            json!({ "id": id, "update": { "state": "inactive" } }),
        )
        .await
        .unwrap();
        let updated = api
            .call(
                "webhooks.update",
                &mut ctx,
                json!({ "id": id, "update": { "state": "active" } }),
            )
            .await
            .unwrap();
        assert_eq!(updated.get("webhook").unwrap()["currentRetries"], 0);
    }
}

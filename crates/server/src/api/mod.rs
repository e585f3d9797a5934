pub mod accesses;
pub mod account;
pub mod auth;
pub mod batch;
pub mod events;
pub mod followed_slices;
pub mod profile;
pub mod streams;
pub mod system;
pub mod webhooks;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::Router;
use bytes::Bytes;
use secrecy::SecretString;
use serde_json::{json, Map, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use trove_api::{Api, AuthSource, MethodContext, MethodResult, Services};
use trove_core::{ApiError, Username};

use crate::error::ServerError;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// The wired service bundle.
    pub services: Arc<Services>,
    /// The method registry.
    pub api: Arc<Api>,
    /// Key gating `/system/*`; `None` disables that surface.
    pub admin_access_key: Option<Arc<SecretString>>,
    /// Domain attribute for the SSO cookie.
    pub sso_cookie_domain: Option<String>,
}

/// The response envelope's `meta` object.
#[must_use]
pub fn meta() -> Value {
    json!({
        "apiVersion": env!("CARGO_PKG_VERSION"),
        "serverTime": trove_core::unix_now(),
    })
}

/// Serialize a method result as the response body, appending `meta`.
pub(crate) fn respond(result: MethodResult, status: StatusCode) -> Response {
    let mut body = result.into_body();
    body["meta"] = meta();
    (status, axum::Json(body)).into_response()
}

/// Parse a request body as JSON; an empty body is an empty object.
pub(crate) fn parse_json_body(bytes: &Bytes) -> Result<Value, ApiError> {
    if bytes.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_slice(bytes)
        .map_err(|e| ApiError::invalid_request_structure(format!("Malformed JSON body: {e}")))
}

/// Merge query-string parameters into a params object (strings; the
/// method-side validators coerce types).
pub(crate) fn merge_query(params: &mut Value, query: &HashMap<String, String>) {
    for (k, v) in query {
        if k == "auth" {
            continue; // credential, not a parameter
        }
        params[k] = Value::String(v.clone());
    }
}

/// Extract the `sso` cookie value from the `Cookie` header.
fn sso_cookie(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|part| {
        part.trim()
            .strip_prefix("sso=")
            .map(str::to_owned)
    })
}

/// Whether the request opts out of backward-compatibility prefixes.
pub(crate) fn compat_disabled(headers: &HeaderMap) -> bool {
    headers
        .get(trove_core::DISABLE_COMPAT_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "true")
}

/// Authenticate the request and build the method context.
pub(crate) async fn context_from(
    state: &AppState,
    username: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<MethodContext, ApiError> {
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let cookie = sso_cookie(headers);
    let source = AuthSource {
        authorization: authorization.as_deref(),
        auth_query: query.get("auth").map(String::as_str),
        sso_cookie: cookie.as_deref(),
    };
    trove_api::authenticate(
        &state.services,
        &Username::new(username),
        source,
        compat_disabled(headers),
    )
    .await
}

/// Build the pre-auth context for login, registration, and reset flows.
pub(crate) async fn pre_auth_context(
    state: &AppState,
    username: &str,
) -> Result<MethodContext, ApiError> {
    let user = state
        .services
        .storage
        .user_by_username(&Username::new(username))
        .await
        .map_err(trove_api::map_store_error)?
        .ok_or_else(|| ApiError::unknown_resource("user", username))?;
    MethodContext::unauthenticated(state.services.clone(), user).await
}

/// Run a method under an authenticated context and wrap the result.
pub(crate) async fn run_method(
    state: &AppState,
    username: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    method: &str,
    params: Value,
    success: StatusCode,
) -> Result<Response, ServerError> {
    let mut ctx = context_from(state, username, headers, query).await?;
    let result = state.api.call(method, &mut ctx, params).await?;
    Ok(respond(result, success))
}

/// Build the Axum router with all API routes and middleware.
#[allow(clippy::too_many_lines)]
pub fn router(state: AppState) -> Router {
    Router::new()
        // Registration & availability checks (public)
        .route("/users", post(system::register_user))
        .route("/reg/user", post(system::register_user))
        .route(
            "/reg/{username}/check_username",
            get(system::check_username),
        )
        .route("/reg/{email}/check_email", get(system::check_email))
        // Admin surface (masked behind the admin key)
        .route("/system/create-user", post(system::admin_create_user))
        .route(
            "/system/user-info/{username}",
            get(system::admin_user_info),
        )
        // Auth
        .route("/{username}/auth/login", post(auth::login))
        .route("/{username}/auth/logout", post(auth::logout))
        .route("/{username}/auth/who-am-i", get(auth::who_am_i))
        .route("/{username}/access-info", get(auth::access_info))
        // Batch
        .route("/{username}", post(batch::call_batch))
        .route("/{username}/", post(batch::call_batch))
        // Events & attachments
        .route(
            "/{username}/events",
            get(events::get_events).post(events::create_event),
        )
        .route(
            "/{username}/events/{id}",
            get(events::get_one)
                .put(events::update_event)
                .delete(events::delete_event),
        )
        .route(
            "/{username}/events/{id}/{file_id}",
            get(events::get_attachment).delete(events::delete_attachment),
        )
        .route(
            "/{username}/events/{id}/{file_id}/{file_name}",
            get(events::get_attachment_named),
        )
        // Streams
        .route(
            "/{username}/streams",
            get(streams::get_streams).post(streams::create_stream),
        )
        .route(
            "/{username}/streams/{id}",
            put(streams::update_stream).delete(streams::delete_stream),
        )
        // Accesses
        .route(
            "/{username}/accesses",
            get(accesses::get_accesses).post(accesses::create_access),
        )
        .route("/{username}/accesses/check-app", post(accesses::check_app))
        .route(
            "/{username}/accesses/{id}",
            put(accesses::update_access).delete(accesses::delete_access),
        )
        // Account
        .route(
            "/{username}/account",
            get(account::get_account).put(account::update_account),
        )
        .route(
            "/{username}/account/change-password",
            post(account::change_password),
        )
        .route(
            "/{username}/account/request-password-reset",
            post(account::request_password_reset),
        )
        .route(
            "/{username}/account/reset-password",
            post(account::reset_password),
        )
        // Profile
        .route(
            "/{username}/profile/{scope}",
            get(profile::get_profile).put(profile::update_profile),
        )
        // Followed slices
        .route(
            "/{username}/followed-slices",
            get(followed_slices::get_slices).post(followed_slices::create_slice),
        )
        .route(
            "/{username}/followed-slices/{id}",
            put(followed_slices::update_slice).delete(followed_slices::delete_slice),
        )
        // Webhooks
        .route(
            "/{username}/webhooks",
            get(webhooks::get_webhooks).post(webhooks::create_webhook),
        )
        .route(
            "/{username}/webhooks/{id}",
            get(webhooks::get_webhook)
                .put(webhooks::update_webhook)
                .delete(webhooks::delete_webhook),
        )
        .layer(DefaultBodyLimit::max(32 * 1024 * 1024))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

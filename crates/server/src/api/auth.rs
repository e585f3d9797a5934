use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::Value;

use trove_core::{ApiError, Token};

use crate::error::ServerError;

use super::{context_from, parse_json_body, pre_auth_context, respond, AppState};

/// Name of the signed single-sign-on cookie.
const SSO_COOKIE: &str = "sso";

fn sso_cookie_header(state: &AppState, value: &str, max_age_seconds: i64) -> HeaderValue {
    let mut cookie = format!("{SSO_COOKIE}={value}; Path=/; HttpOnly; Max-Age={max_age_seconds}");
    if let Some(domain) = &state.sso_cookie_domain {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    HeaderValue::from_str(&cookie).expect("cookie value is ascii")
}

/// `POST /{username}/auth/login`
pub async fn login(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    let mut params = parse_json_body(&body)?;
    // The trusted-app check wants the caller's web origin.
    let origin = headers
        .get(header::ORIGIN)
        .or_else(|| headers.get(header::REFERER))
        .and_then(|v| v.to_str().ok());
    if let Some(origin) = origin {
        params["origin"] = Value::String(origin.to_owned());
    }

    let mut ctx = pre_auth_context(&state, &username).await?;
    let result = state.api.call("auth.login", &mut ctx, params).await?;

    let token = result
        .get("token")
        .and_then(Value::as_str)
        .map(Token::new)
        .ok_or_else(|| ApiError::unexpected("login produced no token"))?;
    let signed = trove_api::sign_sso_cookie(&token, &state.services.settings.sso_sign_secret);
    let max_age = state.services.settings.session_max_age_seconds as i64;

    let mut response = respond(result, StatusCode::OK);
    response
        .headers_mut()
        .insert(header::SET_COOKIE, sso_cookie_header(&state, &signed, max_age));
    Ok(response)
}

/// `POST /{username}/auth/logout`
pub async fn logout(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ServerError> {
    let mut ctx = context_from(&state, &username, &headers, &query).await?;
    let result = state
        .api
        .call("auth.logout", &mut ctx, Value::Object(serde_json::Map::new()))
        .await?;

    let mut response = respond(result, StatusCode::OK);
    response
        .headers_mut()
        .insert(header::SET_COOKIE, sso_cookie_header(&state, "", 0));
    Ok(response)
}

/// `GET /{username}/auth/who-am-i` -- removed endpoint.
pub async fn who_am_i() -> Response {
    ServerError::Api(ApiError::gone("auth/who-am-i has been removed")).into_response()
}

/// `GET /{username}/access-info`
pub async fn access_info(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ServerError> {
    super::run_method(
        &state,
        &username,
        &headers,
        &query,
        "getAccessInfo",
        Value::Object(serde_json::Map::new()),
        StatusCode::OK,
    )
    .await
}

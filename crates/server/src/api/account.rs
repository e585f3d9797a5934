use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde_json::{json, Map, Value};

use crate::error::ServerError;

use super::{parse_json_body, pre_auth_context, respond, run_method, AppState};

/// `GET /{username}/account`
pub async fn get_account(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ServerError> {
    run_method(
        &state,
        &username,
        &headers,
        &query,
        "account.get",
        Value::Object(Map::new()),
        StatusCode::OK,
    )
    .await
}

/// `PUT /{username}/account`
pub async fn update_account(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response, ServerError> {
    let body = parse_json_body(&body)?;
    let update = body.get("update").cloned().unwrap_or(body);
    run_method(
        &state,
        &username,
        &headers,
        &query,
        "account.update",
        json!({ "update": update }),
        StatusCode::OK,
    )
    .await
}

/// `POST /{username}/account/change-password`
pub async fn change_password(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response, ServerError> {
    let params = parse_json_body(&body)?;
    run_method(
        &state,
        &username,
        &headers,
        &query,
        "account.changePassword",
        params,
        StatusCode::OK,
    )
    .await
}

/// `POST /{username}/account/request-password-reset` -- pre-auth flow.
pub async fn request_password_reset(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    let mut params = parse_json_body(&body)?;
    inject_origin(&headers, &mut params);
    let mut ctx = pre_auth_context(&state, &username).await?;
    let result = state
        .api
        .call("account.requestPasswordReset", &mut ctx, params)
        .await?;
    Ok(respond(result, StatusCode::OK))
}

/// `POST /{username}/account/reset-password` -- pre-auth flow.
pub async fn reset_password(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    let mut params = parse_json_body(&body)?;
    inject_origin(&headers, &mut params);
    let mut ctx = pre_auth_context(&state, &username).await?;
    let result = state
        .api
        .call("account.resetPassword", &mut ctx, params)
        .await?;
    Ok(respond(result, StatusCode::OK))
}

fn inject_origin(headers: &HeaderMap, params: &mut Value) {
    let origin = headers
        .get(axum::http::header::ORIGIN)
        .or_else(|| headers.get(axum::http::header::REFERER))
        .and_then(|v| v.to_str().ok());
    if let Some(origin) = origin {
        params["origin"] = Value::String(origin.to_owned());
    }
}

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde_json::{json, Map, Value};

use crate::error::ServerError;

use super::{parse_json_body, run_method, AppState};

/// `GET /{username}/webhooks`
pub async fn get_webhooks(
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
        "webhooks.get",
        Value::Object(Map::new()),
        StatusCode::OK,
    )
    .await
}

/// `GET /{username}/webhooks/{id}`
pub async fn get_webhook(
    State(state): State<AppState>,
    Path((username, id)): Path<(String, String)>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ServerError> {
    run_method(
        &state,
        &username,
        &headers,
        &query,
        "webhooks.getOne",
        json!({ "id": id }),
        StatusCode::OK,
    )
    .await
}

/// `POST /{username}/webhooks`
pub async fn create_webhook(
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
        "webhooks.create",
        params,
        StatusCode::CREATED,
    )
    .await
}

/// `PUT /{username}/webhooks/{id}`
pub async fn update_webhook(
    State(state): State<AppState>,
    Path((username, id)): Path<(String, String)>,
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
        "webhooks.update",
        json!({ "id": id, "update": update }),
        StatusCode::OK,
    )
    .await
}

/// `DELETE /{username}/webhooks/{id}`
pub async fn delete_webhook(
    State(state): State<AppState>,
    Path((username, id)): Path<(String, String)>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ServerError> {
    run_method(
        &state,
        &username,
        &headers,
        &query,
        "webhooks.delete",
        json!({ "id": id }),
        StatusCode::OK,
    )
    .await
}

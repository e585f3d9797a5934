use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde_json::{json, Map, Value};

use crate::error::ServerError;

use super::{parse_json_body, run_method, AppState};

/// `GET /{username}/followed-slices`
pub async fn get_slices(
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
        "followedSlices.get",
        Value::Object(Map::new()),
        StatusCode::OK,
    )
    .await
}

/// `POST /{username}/followed-slices`
pub async fn create_slice(
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
        "followedSlices.create",
        params,
        StatusCode::CREATED,
    )
    .await
}

/// `PUT /{username}/followed-slices/{id}`
pub async fn update_slice(
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
        "followedSlices.update",
        json!({ "id": id, "update": update }),
        StatusCode::OK,
    )
    .await
}

/// `DELETE /{username}/followed-slices/{id}`
pub async fn delete_slice(
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
        "followedSlices.delete",
        json!({ "id": id }),
        StatusCode::OK,
    )
    .await
}

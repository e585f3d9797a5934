use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde_json::{json, Map, Value};

use crate::error::ServerError;

use super::{merge_query, parse_json_body, run_method, AppState};

/// `GET /{username}/streams`
pub async fn get_streams(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ServerError> {
    let mut params = Value::Object(Map::new());
    merge_query(&mut params, &query);
    run_method(
        &state,
        &username,
        &headers,
        &query,
        "streams.get",
        params,
        StatusCode::OK,
    )
    .await
}

/// `POST /{username}/streams`
pub async fn create_stream(
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
        "streams.create",
        params,
        StatusCode::CREATED,
    )
    .await
}

/// `PUT /{username}/streams/{id}`
pub async fn update_stream(
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
        "streams.update",
        json!({ "id": id, "update": update }),
        StatusCode::OK,
    )
    .await
}

/// `DELETE /{username}/streams/{id}`
pub async fn delete_stream(
    State(state): State<AppState>,
    Path((username, id)): Path<(String, String)>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ServerError> {
    let mut params = json!({ "id": id });
    merge_query(&mut params, &query);
    run_method(
        &state,
        &username,
        &headers,
        &query,
        "streams.delete",
        params,
        StatusCode::OK,
    )
    .await
}

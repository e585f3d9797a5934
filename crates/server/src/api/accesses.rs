use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde_json::{json, Map, Value};

use crate::error::ServerError;

use super::{merge_query, parse_json_body, run_method, AppState};

/// `GET /{username}/accesses`
pub async fn get_accesses(
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
        "accesses.get",
        params,
        StatusCode::OK,
    )
    .await
}

/// `POST /{username}/accesses`
pub async fn create_access(
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
        "accesses.create",
        params,
        StatusCode::CREATED,
    )
    .await
}

/// `PUT /{username}/accesses/{id}` -- permanently gone.
pub async fn update_access(
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
        "accesses.update",
        json!({ "id": id }),
        StatusCode::OK,
    )
    .await
}

/// `DELETE /{username}/accesses/{id}`
pub async fn delete_access(
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
        "accesses.delete",
        json!({ "id": id }),
        StatusCode::OK,
    )
    .await
}

/// `POST /{username}/accesses/check-app`
pub async fn check_app(
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
        "accesses.checkApp",
        params,
        StatusCode::OK,
    )
    .await
}

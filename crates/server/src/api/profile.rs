use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde_json::json;

use crate::error::ServerError;

use super::{parse_json_body, run_method, AppState};

/// `GET /{username}/profile/{scope}`
pub async fn get_profile(
    State(state): State<AppState>,
    Path((username, scope)): Path<(String, String)>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ServerError> {
    run_method(
        &state,
        &username,
        &headers,
        &query,
        "profile.get",
        json!({ "scope": scope }),
        StatusCode::OK,
    )
    .await
}

/// `PUT /{username}/profile/{scope}`
pub async fn update_profile(
    State(state): State<AppState>,
    Path((username, scope)): Path<(String, String)>,
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
        "profile.update",
        json!({ "scope": scope, "update": update }),
        StatusCode::OK,
    )
    .await
}

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;

use crate::error::ServerError;

use super::{context_from, parse_json_body, respond, AppState};

/// `POST /{username}/` -- run a batch of method calls under one context.
///
/// The batch returns 200 as long as context initialization succeeded;
/// per-call failures land inside `results`.
pub async fn call_batch(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response, ServerError> {
    let calls = parse_json_body(&body)?;
    let mut ctx = context_from(&state, &username, &headers, &query).await?;
    let result = trove_api::batch::call_batch(&state.api, &mut ctx, calls).await?;
    Ok(respond(result, StatusCode::OK))
}

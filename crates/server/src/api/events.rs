use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use axum::RequestExt;
use bytes::Bytes;
use serde_json::{json, Map, Value};
use tokio_util::io::ReaderStream;
use tracing::info;

use trove_api::{attachments, MethodContext};
use trove_core::{ApiError, EventId};

use crate::error::ServerError;

use super::{compat_disabled, context_from, merge_query, parse_json_body, respond, AppState};

/// Events are flushed to the wire in slices of this many items, so large
/// result sets never buffer as one serialized array.
const STREAM_CHUNK_ITEMS: usize = 500;

/// `GET /{username}/events` -- chunked JSON array response.
pub async fn get_events(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ServerError> {
    let mut ctx = context_from(&state, &username, &headers, &query).await?;
    let mut params = Value::Object(Map::new());
    merge_query(&mut params, &query);

    let result = state.api.call("events.get", &mut ctx, params).await?;
    let mut body = result.into_body();
    let events = match body.get_mut("events").and_then(Value::as_array_mut) {
        Some(items) => std::mem::take(items),
        None => Vec::new(),
    };
    body.as_object_mut()
        .expect("result body is an object")
        .remove("events");

    // Serialize incrementally: the events array goes out in slices, the
    // remaining result fields and meta trail it.
    let mut chunks: Vec<Bytes> = Vec::new();
    chunks.push(Bytes::from_static(b"{\"events\":["));
    for (i, slice) in events.chunks(STREAM_CHUNK_ITEMS).enumerate() {
        let mut piece = String::new();
        for (j, event) in slice.iter().enumerate() {
            if i > 0 || j > 0 {
                piece.push(',');
            }
            piece.push_str(&serde_json::to_string(event).map_err(ApiError::unexpected)?);
        }
        chunks.push(Bytes::from(piece));
    }
    let mut tail = String::from("]");
    for (key, value) in body.as_object().expect("object") {
        tail.push(',');
        tail.push_str(&serde_json::to_string(key).map_err(ApiError::unexpected)?);
        tail.push(':');
        tail.push_str(&serde_json::to_string(value).map_err(ApiError::unexpected)?);
    }
    tail.push_str(",\"meta\":");
    tail.push_str(&serde_json::to_string(&super::meta()).map_err(ApiError::unexpected)?);
    tail.push('}');
    chunks.push(Bytes::from(tail));

    let stream = futures::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

/// Collect multipart fields: the `event` JSON part plus uploaded files.
async fn split_multipart(
    mut multipart: Multipart,
) -> Result<(Value, Vec<(String, String, Bytes)>), ApiError> {
    let mut event = Value::Object(Map::new());
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::invalid_request_structure(format!("Malformed multipart body: {e}")))?
    {
        let is_file = field.file_name().is_some();
        if is_file {
            let file_name = field.file_name().unwrap_or("file").to_owned();
            let content_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_owned();
            let data = field.bytes().await.map_err(|e| {
                ApiError::invalid_request_structure(format!("Malformed multipart body: {e}"))
            })?;
            files.push((file_name, content_type, data));
        } else if field.name() == Some("event") {
            let text = field.text().await.map_err(|e| {
                ApiError::invalid_request_structure(format!("Malformed multipart body: {e}"))
            })?;
            event = serde_json::from_str(&text).map_err(|e| {
                ApiError::invalid_request_structure(format!("Malformed event part: {e}"))
            })?;
        }
    }
    Ok((event, files))
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/"))
}

async fn body_params(state: &AppState, request: Request) -> Result<(Value, Vec<(String, String, Bytes)>), ApiError> {
    if is_multipart(request.headers()) {
        let multipart: Multipart = request
            .extract_with_state(state)
            .await
            .map_err(|e| ApiError::invalid_request_structure(format!("Malformed multipart: {e}")))?;
        split_multipart(multipart).await
    } else {
        let bytes = axum::body::to_bytes(request.into_body(), 32 * 1024 * 1024)
            .await
            .map_err(|e| ApiError::invalid_request_structure(format!("Unreadable body: {e}")))?;
        Ok((parse_json_body(&bytes)?, Vec::new()))
    }
}

async fn finish_with_files(
    ctx: &mut MethodContext,
    mut result: trove_api::MethodResult,
    files: Vec<(String, String, Bytes)>,
    status: StatusCode,
) -> Result<Response, ServerError> {
    if !files.is_empty() {
        let id = result
            .get("event")
            .and_then(|e| e.get("id"))
            .and_then(Value::as_str)
            .map(EventId::new)
            .ok_or_else(|| ApiError::unexpected("event result has no id"))?;
        let updated =
            trove_api::methods::events::attach_uploaded_files(ctx, &id, files).await?;
        result.set("event", updated);
    }
    Ok(respond(result, status))
}

/// `POST /{username}/events` -- JSON body or multipart with attachments.
pub async fn create_event(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
) -> Result<Response, ServerError> {
    let headers = request.headers().clone();
    let mut ctx = context_from(&state, &username, &headers, &query).await?;
    let (params, files) = body_params(&state, request).await?;
    let result = state.api.call("events.create", &mut ctx, params).await?;
    finish_with_files(&mut ctx, result, files, StatusCode::CREATED).await
}

/// `GET /{username}/events/{id}`
pub async fn get_one(
    State(state): State<AppState>,
    Path((username, id)): Path<(String, String)>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ServerError> {
    let mut params = json!({ "id": id });
    merge_query(&mut params, &query);
    super::run_method(
        &state,
        &username,
        &headers,
        &query,
        "events.getOne",
        params,
        StatusCode::OK,
    )
    .await
}

/// `PUT /{username}/events/{id}` -- JSON update or multipart attachment add.
pub async fn update_event(
    State(state): State<AppState>,
    Path((username, id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
) -> Result<Response, ServerError> {
    let headers = request.headers().clone();
    let mut ctx = context_from(&state, &username, &headers, &query).await?;
    let (body, files) = body_params(&state, request).await?;

    // Tolerate both `{update: {...}}` and a bare update object.
    let update = body.get("update").cloned().unwrap_or(body);
    let has_field_changes = update.as_object().is_some_and(|m| !m.is_empty());

    if has_field_changes || files.is_empty() {
        let params = json!({ "id": id, "update": update });
        let result = state.api.call("events.update", &mut ctx, params).await?;
        finish_with_files(&mut ctx, result, files, StatusCode::OK).await
    } else {
        // Pure attachment upload: no field update.
        let updated =
            trove_api::methods::events::attach_uploaded_files(&mut ctx, &EventId::new(&id), files)
                .await?;
        let mut result = trove_api::MethodResult::new();
        result.set("event", updated);
        Ok(respond(result, StatusCode::OK))
    }
}

/// `DELETE /{username}/events/{id}`
pub async fn delete_event(
    State(state): State<AppState>,
    Path((username, id)): Path<(String, String)>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ServerError> {
    super::run_method(
        &state,
        &username,
        &headers,
        &query,
        "events.delete",
        json!({ "id": id }),
        StatusCode::OK,
    )
    .await
}

/// `DELETE /{username}/events/{id}/{file_id}`
pub async fn delete_attachment(
    State(state): State<AppState>,
    Path((username, id, file_id)): Path<(String, String, String)>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ServerError> {
    super::run_method(
        &state,
        &username,
        &headers,
        &query,
        "events.deleteAttachment",
        json!({ "id": id, "fileId": file_id }),
        StatusCode::OK,
    )
    .await
}

/// `GET /{username}/events/{id}/{file_id}`
pub async fn get_attachment(
    State(state): State<AppState>,
    Path((username, id, file_id)): Path<(String, String, String)>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ServerError> {
    serve_attachment(&state, &username, &id, &file_id, &headers, &query).await
}

/// `GET /{username}/events/{id}/{file_id}/{file_name}` -- the trailing file
/// name is cosmetic.
pub async fn get_attachment_named(
    State(state): State<AppState>,
    Path((username, id, file_id, _file_name)): Path<(String, String, String, String)>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ServerError> {
    serve_attachment(&state, &username, &id, &file_id, &headers, &query).await
}

async fn serve_attachment(
    state: &AppState,
    username: &str,
    id: &str,
    file_id: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<Response, ServerError> {
    // `auth` would leak into referer headers on attachment URLs.
    if query.contains_key("auth") {
        return Err(ApiError::invalid_request_structure(
            "The \"auth\" parameter is not accepted on attachment URLs; use readToken",
        )
        .into());
    }

    let event_id = EventId::new(id);
    let ctx = if let Some(read_token) = query.get("readToken") {
        let access = attachments::verify_read_token(
            &state.services,
            &trove_core::Username::new(username),
            file_id,
            read_token,
        )
        .await?;
        let user = state
            .services
            .storage
            .user_by_username(&trove_core::Username::new(username))
            .await
            .map_err(trove_api::map_store_error)?
            .ok_or_else(|| ApiError::unknown_resource("user", username))?;
        MethodContext::new(
            state.services.clone(),
            user,
            access,
            compat_disabled(headers),
        )
        .await?
    } else {
        context_from(state, username, headers, &HashMap::new()).await?
    };

    let perms = ctx.permissions()?;
    let read = attachments::open_attachment(
        &state.services,
        &ctx.username,
        &perms,
        &event_id,
        file_id,
    )
    .await?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(read.file.reader)));
    let headers_mut = response.headers_mut();
    headers_mut.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&read.attachment.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers_mut.insert(header::CONTENT_LENGTH, HeaderValue::from(read.file.size));
    headers_mut.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&attachments::content_disposition(&read.attachment.file_name))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
    if let Some(integrity) = &read.attachment.integrity
        && let Ok(digest) = HeaderValue::from_str(integrity)
    {
        headers_mut.insert("digest", digest);
    }

    info!(user = %username, event = %event_id, file = file_id, "attachment served");
    Ok(response)
}

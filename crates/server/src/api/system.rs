use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use secrecy::ExposeSecret;
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::warn;

use trove_core::Username;

use crate::error::ServerError;

use super::{meta, parse_json_body, AppState};

/// Every admin-surface failure masks as a bare 404, leaking nothing about
/// the key or the target.
fn masked_not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

fn admin_authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = &state.admin_access_key else {
        return false;
    };
    let Some(presented) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    presented
        .as_bytes()
        .ct_eq(expected.expose_secret().as_bytes())
        .into()
}

/// `POST /system/create-user`
pub async fn admin_create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !admin_authorized(&state, &headers) {
        return masked_not_found();
    }
    let Ok(params) = parse_json_body(&body) else {
        return masked_not_found();
    };
    match trove_api::users::create_user(&state.services, &params).await {
        Ok(user) => {
            let body = json!({ "user": user, "meta": meta() });
            (StatusCode::CREATED, axum::Json(body)).into_response()
        }
        Err(e) => {
            warn!(id = %e.id, "admin user creation failed");
            masked_not_found()
        }
    }
}

/// `GET /system/user-info/{username}`
pub async fn admin_user_info(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !admin_authorized(&state, &headers) {
        return masked_not_found();
    }
    match trove_api::users::user_info(&state.services, &Username::new(&username)).await {
        Ok(info) => {
            let body = json!({ "userInfo": info, "meta": meta() });
            (StatusCode::OK, axum::Json(body)).into_response()
        }
        Err(_) => masked_not_found(),
    }
}

/// `POST /users` and `POST /reg/user` -- public registration.
pub async fn register_user(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ServerError> {
    let params = parse_json_body(&body)?;
    let user = trove_api::users::create_user(&state.services, &params).await?;
    let body = json!({ "username": user["username"], "apiEndpoint": user["apiEndpoint"], "meta": meta() });
    Ok((StatusCode::CREATED, axum::Json(body)).into_response())
}

/// `GET /reg/{username}/check_username`
pub async fn check_username(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, ServerError> {
    let available = trove_api::users::check_username(&state.services, &username).await?;
    let body = json!({ "reserved": !available, "meta": meta() });
    Ok((StatusCode::OK, axum::Json(body)).into_response())
}

/// `GET /reg/{email}/check_email`
pub async fn check_email(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<Response, ServerError> {
    let taken = !trove_api::users::check_email(&state.services, &email).await?;
    let body = json!({ "exists": taken, "meta": meta() });
    Ok((StatusCode::OK, axum::Json(body)).into_response())
}

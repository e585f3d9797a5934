use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, warn};

use trove_core::ApiError;

/// Errors that can occur when running the Trove server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A configuration error (fatal at boot).
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error (e.g. binding the listener).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A typed API error surfaced to the client.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A storage error encountered during startup.
    #[error("storage error: {0}")]
    Store(#[from] trove_store::StoreError),
}

/// Strip password material from a JSON value before it reaches a log line.
#[must_use]
pub fn redact_passwords(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if k.to_ascii_lowercase().contains("password") {
                        (k.clone(), Value::String("(hidden password)".to_owned()))
                    } else {
                        (k.clone(), redact_passwords(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_passwords).collect()),
        other => other.clone(),
    }
}

/// Serialize an API error into the wire envelope with `meta` attached.
#[must_use]
pub fn error_body(e: &ApiError, meta: Value) -> Value {
    let mut body = e.to_wire();
    body["meta"] = meta;
    body
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        match self {
            Self::Api(e) => {
                let status =
                    StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    error!(id = %e.id, data = ?e.data.as_ref().map(redact_passwords), "request failed");
                } else {
                    warn!(id = %e.id, message = %e.message, "request rejected");
                }
                (status, axum::Json(error_body(&e, crate::api::meta()))).into_response()
            }
            other => {
                error!(error = %other, "internal server error");
                let wrapped = ApiError::unexpected(&other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    axum::Json(error_body(&wrapped, crate::api::meta())),
                )
                    .into_response()
            }
        }
    }
}

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

/// Machine-readable error identifiers exposed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorId {
    InvalidCredentials,
    InvalidOperation,
    InvalidParametersFormat,
    InvalidRequestStructure,
    Forbidden,
    UnknownResource,
    UnknownReferencedResource,
    ItemAlreadyExists,
    Gone,
    UnexpectedError,
}

impl ErrorId {
    /// The HTTP status code this error kind maps to.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidCredentials => 401,
            Self::InvalidOperation
            | Self::InvalidParametersFormat
            | Self::InvalidRequestStructure
            | Self::UnknownReferencedResource => 400,
            Self::Forbidden => 403,
            Self::UnknownResource => 404,
            Self::ItemAlreadyExists => 409,
            Self::Gone => 410,
            Self::UnexpectedError => 500,
        }
    }

    /// The kebab-case wire identifier.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid-credentials",
            Self::InvalidOperation => "invalid-operation",
            Self::InvalidParametersFormat => "invalid-parameters-format",
            Self::InvalidRequestStructure => "invalid-request-structure",
            Self::Forbidden => "forbidden",
            Self::UnknownResource => "unknown-resource",
            Self::UnknownReferencedResource => "unknown-referenced-resource",
            Self::ItemAlreadyExists => "item-already-exists",
            Self::Gone => "gone",
            Self::UnexpectedError => "unexpected-error",
        }
    }
}

impl std::fmt::Display for ErrorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed API error: identifier, human message, optional structured data.
///
/// Every failure surfaced to a client is one of these; anything else is
/// wrapped as `unexpected-error` at the pipeline boundary.
#[derive(Debug, Clone, Error)]
#[error("{id}: {message}")]
pub struct ApiError {
    pub id: ErrorId,
    pub message: String,
    pub data: Option<Value>,
}

impl ApiError {
    /// Build an error with no structured data.
    #[must_use]
    pub fn new(id: ErrorId, message: impl Into<String>) -> Self {
        Self {
            id,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data to the error.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        Self::new(ErrorId::InvalidCredentials, message)
    }

    #[must_use]
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(ErrorId::InvalidOperation, message)
    }

    #[must_use]
    pub fn invalid_parameters_format(message: impl Into<String>) -> Self {
        Self::new(ErrorId::InvalidParametersFormat, message)
    }

    #[must_use]
    pub fn invalid_request_structure(message: impl Into<String>) -> Self {
        Self::new(ErrorId::InvalidRequestStructure, message)
    }

    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorId::Forbidden, message)
    }

    /// The request's target resource does not exist.
    #[must_use]
    pub fn unknown_resource(kind: &str, id: &str) -> Self {
        Self::new(
            ErrorId::UnknownResource,
            format!("Unknown {kind} \"{id}\""),
        )
        .with_data(json!({ "type": kind, "id": id }))
    }

    /// A resource referenced by the request body or query does not exist.
    #[must_use]
    pub fn unknown_referenced_resource(kind: &str, id: &str) -> Self {
        Self::new(
            ErrorId::UnknownReferencedResource,
            format!("Unknown referenced {kind} \"{id}\""),
        )
        .with_data(json!({ "type": kind, "id": id }))
    }

    /// Unique-key collision; `conflicting_keys` names the offending fields.
    #[must_use]
    pub fn item_already_exists(kind: &str, conflicting_keys: Value) -> Self {
        Self::new(
            ErrorId::ItemAlreadyExists,
            format!("A {kind} with the same unique keys already exists"),
        )
        .with_data(conflicting_keys)
    }

    #[must_use]
    pub fn gone(message: impl Into<String>) -> Self {
        Self::new(ErrorId::Gone, message)
    }

    /// Wrap an unclassified failure. The source message is preserved in
    /// `data` for logs; the client-facing message stays generic.
    #[must_use]
    pub fn unexpected(source: impl std::fmt::Display) -> Self {
        Self::new(ErrorId::UnexpectedError, "Unexpected error").with_data(json!({
            "source": source.to_string(),
        }))
    }

    /// The HTTP status code for this error.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        self.id.http_status()
    }

    /// Serialize to the wire envelope: `{ "error": { id, message, data? } }`.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        let mut error = json!({
            "id": self.id.as_str(),
            "message": self.message,
        });
        if let Some(data) = &self.data {
            error["data"] = data.clone();
        }
        json!({ "error": error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError::invalid_credentials("x").http_status(), 401);
        assert_eq!(ApiError::forbidden("x").http_status(), 403);
        assert_eq!(ApiError::unknown_resource("event", "e1").http_status(), 404);
        assert_eq!(
            ApiError::unknown_referenced_resource("stream", "s1").http_status(),
            400
        );
        assert_eq!(
            ApiError::item_already_exists("access", json!({"name": "a"})).http_status(),
            409
        );
        assert_eq!(ApiError::gone("x").http_status(), 410);
        assert_eq!(ApiError::unexpected("boom").http_status(), 500);
    }

    #[test]
    fn wire_envelope_shape() {
        let wire = ApiError::unknown_resource("event", "e1").to_wire();
        assert_eq!(wire["error"]["id"], "unknown-resource");
        assert_eq!(wire["error"]["data"]["id"], "e1");
        assert!(wire["error"]["message"].is_string());
    }

    #[test]
    fn wire_without_data_omits_field() {
        let wire = ApiError::forbidden("no").to_wire();
        assert!(wire["error"].get("data").is_none());
    }
}

pub mod accesses;
pub mod account;
pub mod auth;
pub mod events;
pub mod followed_slices;
pub mod profile;
pub mod streams;
pub mod webhooks;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use trove_core::ApiError;

use crate::registry::Api;

/// Register every method of the API surface. Called once at boot.
pub fn register_all(api: &mut Api) {
    auth::register(api);
    events::register(api);
    streams::register(api);
    accesses::register(api);
    account::register(api);
    profile::register(api);
    followed_slices::register(api);
    webhooks::register(api);
}

// -- Param helpers (the validation vocabulary of first steps) -------------

pub(crate) fn obj(params: &Value) -> Result<&Map<String, Value>, ApiError> {
    params
        .as_object()
        .ok_or_else(|| ApiError::invalid_parameters_format("Parameters must be an object"))
}

pub(crate) fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, ApiError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::invalid_parameters_format(format!("Missing string \"{key}\"")))
}

pub(crate) fn opt_str<'a>(params: &'a Value, key: &str) -> Result<Option<&'a str>, ApiError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ApiError::invalid_parameters_format(format!(
            "\"{key}\" must be a string"
        ))),
    }
}

pub(crate) fn opt_bool(params: &Value, key: &str) -> Result<Option<bool>, ApiError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        // Query-string booleans arrive as strings.
        Some(Value::String(s)) if s == "true" => Ok(Some(true)),
        Some(Value::String(s)) if s == "false" => Ok(Some(false)),
        Some(_) => Err(ApiError::invalid_parameters_format(format!(
            "\"{key}\" must be a boolean"
        ))),
    }
}

pub(crate) fn opt_f64(params: &Value, key: &str) -> Result<Option<f64>, ApiError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s.parse::<f64>().map(Some).map_err(|_| {
            ApiError::invalid_parameters_format(format!("\"{key}\" must be a number"))
        }),
        Some(_) => Err(ApiError::invalid_parameters_format(format!(
            "\"{key}\" must be a number"
        ))),
    }
}

pub(crate) fn opt_usize(params: &Value, key: &str) -> Result<Option<usize>, ApiError> {
    match opt_f64(params, key)? {
        None => Ok(None),
        Some(n) if n >= 0.0 && n.fract() == 0.0 => Ok(Some(n as usize)),
        Some(_) => Err(ApiError::invalid_parameters_format(format!(
            "\"{key}\" must be a non-negative integer"
        ))),
    }
}

/// Deserialize a params value into a typed shape, mapping serde failures to
/// `invalid-parameters-format`.
pub(crate) fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value)
        .map_err(|e| ApiError::invalid_parameters_format(format!("Invalid parameters: {e}")))
}

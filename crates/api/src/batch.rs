use serde_json::{json, Value};

use trove_core::ApiError;

use crate::context::MethodContext;
use crate::registry::Api;
use crate::result::MethodResult;

/// Run an ordered list of method calls under a single context.
///
/// Each entry is `{ "method": id, "params": {...} }`. Sub-results -- success
/// or error -- are captured in order into `results`; a failing call never
/// aborts the batch, and nothing is transactional across calls.
pub async fn call_batch(
    api: &Api,
    context: &mut MethodContext,
    calls: Value,
) -> Result<MethodResult, ApiError> {
    let Some(items) = calls.as_array() else {
        return Err(ApiError::invalid_parameters_format(
            "Batch body must be an array of method calls",
        ));
    };

    let mut results: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        let Some(method) = item.get("method").and_then(Value::as_str) else {
            results.push(
                ApiError::invalid_parameters_format("Batch call is missing \"method\"").to_wire(),
            );
            continue;
        };
        let params = item.get("params").cloned().unwrap_or_else(|| json!({}));
        match api.call(method, context, params).await {
            Ok(result) => results.push(result.into_body()),
            Err(e) => results.push(e.to_wire()),
        }
    }

    let mut result = MethodResult::new();
    result.set("results", Value::Array(results));
    Ok(result)
}

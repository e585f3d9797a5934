use serde_json::json;

use trove_core::ApiError;
use trove_store::StoreError;

/// Map storage failures onto the wire taxonomy: unique-key collisions become
/// `item-already-exists`, missing documents `unknown-resource`, everything
/// else is wrapped as `unexpected-error`.
#[must_use]
pub fn map_store_error(e: StoreError) -> ApiError {
    match e {
        StoreError::Duplicate { collection, key } => {
            ApiError::item_already_exists(&collection, json!({ "key": key }))
        }
        StoreError::Missing { collection, id } => ApiError::unknown_resource(&collection, &id),
        StoreError::UnknownUser(name) => ApiError::unknown_resource("user", &name),
        other => ApiError::unexpected(other),
    }
}

/// Extension converting `Result<_, StoreError>` into `Result<_, ApiError>`.
pub trait StoreResultExt<T> {
    fn api_err(self) -> Result<T, ApiError>;
}

impl<T> StoreResultExt<T> for Result<T, StoreError> {
    fn api_err(self) -> Result<T, ApiError> {
        self.map_err(map_store_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_maps_to_conflict() {
        let err = map_store_error(StoreError::duplicate("accesses", "reader"));
        assert_eq!(err.http_status(), 409);
    }

    #[test]
    fn missing_maps_to_unknown_resource() {
        let err = map_store_error(StoreError::missing("events", "e1"));
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn io_maps_to_unexpected() {
        let err = map_store_error(StoreError::Other("disk on fire".to_owned()));
        assert_eq!(err.http_status(), 500);
    }
}

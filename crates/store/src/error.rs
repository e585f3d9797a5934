use thiserror::Error;

/// Errors surfaced by storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The addressed user space does not exist.
    #[error("unknown user \"{0}\"")]
    UnknownUser(String),

    /// A unique-key collision; `key` names the offending fields.
    #[error("duplicate {collection} ({key})")]
    Duplicate { collection: String, key: String },

    /// The addressed item does not exist.
    #[error("missing {collection} \"{id}\"")]
    Missing { collection: String, id: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    #[must_use]
    pub fn duplicate(collection: &str, key: impl Into<String>) -> Self {
        Self::Duplicate {
            collection: collection.to_owned(),
            key: key.into(),
        }
    }

    #[must_use]
    pub fn missing(collection: &str, id: impl Into<String>) -> Self {
        Self::Missing {
            collection: collection.to_owned(),
            id: id.into(),
        }
    }
}

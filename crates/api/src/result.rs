use serde_json::{Map, Value};

/// The accumulating result of a method call: named result fields filled in
/// by pipeline steps, serialized as the response body by the HTTP frontend
/// (which appends the `meta` envelope).
#[derive(Debug, Clone, Default)]
pub struct MethodResult {
    fields: Map<String, Value>,
}

impl MethodResult {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a named result field, replacing any prior value.
    pub fn set(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_owned(), value);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fields.get_mut(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Consume into the response body object.
    #[must_use]
    pub fn into_body(self) -> Value {
        Value::Object(self.fields)
    }

    /// Borrow the body object.
    #[must_use]
    pub fn body(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

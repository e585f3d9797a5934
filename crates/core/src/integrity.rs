//! Integrity digests for events and attachments.
//!
//! Digests are hex-encoded SHA-256 over a canonical serialization, prefixed
//! with the algorithm name so the scheme can evolve.

use sha2::{Digest, Sha256};
use serde_json::Value;

use crate::event::Event;

/// Compute the integrity digest of an event.
///
/// The event is serialized with its `integrity` field removed and its keys
/// in sorted order (serde_json maps preserve insertion order, so the value
/// is rebuilt through a `BTreeMap`), making the digest independent of field
/// ordering.
#[must_use]
pub fn event_digest(event: &Event) -> String {
    let mut value = serde_json::to_value(event).expect("event serializes");
    if let Some(obj) = value.as_object_mut() {
        obj.remove("integrity");
    }
    digest_value(&value)
}

/// Compute the integrity digest of an attachment body.
#[must_use]
pub fn attachment_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256-{}", hex::encode(hasher.finalize()))
}

fn digest_value(value: &Value) -> String {
    let canonical = canonicalize(value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("sha256-{}", hex::encode(hasher.finalize()))
}

/// Rebuild a JSON value with object keys sorted at every level.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            serde_json::to_value(sorted).expect("map serializes")
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccessId, EventId, StreamId, Tracking};

    fn event() -> Event {
        Event {
            id: EventId::new("e1"),
            stream_ids: vec![StreamId::from("diary")],
            event_type: "note/txt".to_owned(),
            time: 10.0,
            duration: None,
            content: Some(serde_json::json!({ "b": 2, "a": 1 })),
            attachments: Vec::new(),
            tags: Vec::new(),
            client_data: None,
            trashed: false,
            integrity: None,
            deleted: None,
            head_id: None,
            tracking: Tracking::init(10.0, &AccessId::new("author")),
        }
    }

    #[test]
    fn digest_is_stable_and_ignores_existing_integrity() {
        let mut e = event();
        let d1 = event_digest(&e);
        e.integrity = Some(d1.clone());
        let d2 = event_digest(&e);
        assert_eq!(d1, d2);
        assert!(d1.starts_with("sha256-"));
    }

    #[test]
    fn digest_changes_with_content() {
        let mut e = event();
        let d1 = event_digest(&e);
        e.content = Some(serde_json::json!("other"));
        assert_ne!(d1, event_digest(&e));
    }

    #[test]
    fn attachment_digest_is_hex_sha256() {
        let d = attachment_digest(b"hello");
        assert_eq!(d.len(), "sha256-".len() + 64);
    }
}

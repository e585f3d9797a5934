use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! newtype_string {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string value.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Return the inner string as a str slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;

            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(UserId, "Opaque user identifier.");
newtype_string!(Username, "Unique username owning a data space.");
newtype_string!(AccessId, "Identifies an access (scoped credential).");
newtype_string!(EventId, "Identifies an event head or history entry.");
newtype_string!(Token, "An opaque bearer token bound to an access or session.");

/// Identifies a stream within a user's forest.
///
/// Stream ids may carry a store prefix (`:dummy:childActivity`) or a system
/// namespace prefix (`:_system:email`, `:system:language`). The bare form
/// addresses the default `local` store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

/// The default store id for unprefixed stream ids.
pub const LOCAL_STORE: &str = "local";

/// Namespace prefix for private system streams.
pub const PRIVATE_PREFIX: &str = ":_system:";

/// Namespace prefix for customer-visible system streams.
pub const CUSTOMER_PREFIX: &str = ":system:";

impl StreamId {
    /// The wildcard id denoting the entire forest.
    #[must_use]
    pub fn star() -> Self {
        Self("*".to_owned())
    }

    /// Create a new stream id from a string value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Return the inner string as a str slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id is the `*` wildcard.
    #[must_use]
    pub fn is_star(&self) -> bool {
        self.0 == "*"
    }

    /// Whether this id lives in a system namespace (`:_system:` or `:system:`).
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.0.starts_with(PRIVATE_PREFIX) || self.0.starts_with(CUSTOMER_PREFIX)
    }

    /// Whether this id uses the legacy dot prefix (`.email`).
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        self.0.starts_with('.')
    }

    /// The store this id addresses. System-namespace ids belong to the
    /// `local` store; any other `:name:` prefix names an external store.
    #[must_use]
    pub fn store_id(&self) -> &str {
        if self.is_system() || self.is_star() {
            return LOCAL_STORE;
        }
        let Some(rest) = self.0.strip_prefix(':') else {
            return LOCAL_STORE;
        };
        match rest.find(':') {
            Some(end) if end > 0 => &rest[..end],
            _ => LOCAL_STORE,
        }
    }

    /// Reject ids that can never name a stream: `null` is unrepresentable
    /// here, so this covers `*` and the empty string.
    #[must_use]
    pub fn is_valid_for_creation(&self) -> bool {
        !self.0.is_empty() && !self.is_star()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl std::ops::Deref for StreamId {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Creation/modification tracking fields carried by every mutable item.
///
/// Timestamps are unix epoch seconds, fractional, matching the wire format
/// of `time` on events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tracking {
    pub created: f64,
    pub created_by: AccessId,
    pub modified: f64,
    pub modified_by: AccessId,
}

impl Tracking {
    /// Initialize all four fields to the same instant and actor.
    #[must_use]
    pub fn init(now: f64, actor: &AccessId) -> Self {
        Self {
            created: now,
            created_by: actor.clone(),
            modified: now,
            modified_by: actor.clone(),
        }
    }

    /// Record a modification by `actor` at `now`, preserving creation fields.
    pub fn touch(&mut self, now: f64, actor: &AccessId) {
        self.modified = now;
        self.modified_by = actor.clone();
    }
}

/// Current wall-clock time as fractional unix epoch seconds.
#[must_use]
pub fn unix_now() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_roundtrip() {
        let id = AccessId::new("acc-123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"acc-123\"");
        let back: AccessId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn stream_id_store_resolution() {
        assert_eq!(StreamId::from("diary").store_id(), "local");
        assert_eq!(StreamId::from(":dummy:childActivity").store_id(), "dummy");
        assert_eq!(StreamId::from(":_audit:access-x").store_id(), "_audit");
        // System namespaces are local-store ids, not store prefixes.
        assert_eq!(StreamId::from(":_system:email").store_id(), "local");
        assert_eq!(StreamId::from(":system:language").store_id(), "local");
        assert_eq!(StreamId::star().store_id(), "local");
    }

    #[test]
    fn stream_id_flags() {
        assert!(StreamId::star().is_star());
        assert!(StreamId::from(":_system:email").is_system());
        assert!(StreamId::from(".email").is_legacy());
        assert!(!StreamId::from("diary").is_system());
        assert!(!StreamId::from("").is_valid_for_creation());
        assert!(!StreamId::star().is_valid_for_creation());
        assert!(StreamId::from("diary").is_valid_for_creation());
    }

    #[test]
    fn tracking_touch_preserves_creation() {
        let author = AccessId::new("a1");
        let editor = AccessId::new("a2");
        let mut t = Tracking::init(100.0, &author);
        t.touch(200.0, &editor);
        assert_eq!(t.created, 100.0);
        assert_eq!(t.created_by, author);
        assert_eq!(t.modified, 200.0);
        assert_eq!(t.modified_by, editor);
    }
}

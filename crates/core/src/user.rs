use serde::{Deserialize, Serialize};

use crate::types::{Token, UserId, Username};

/// An identity owning a data space. Account attributes (email, language)
/// live as events on the system account streams; only credentials and
/// identity live here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: Username,
    /// Argon2 PHC string; never serialized to clients.
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<f64>,
}

impl User {
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }
}

/// A login session backing a personal access. Expiry slides forward on use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: Token,
    pub username: Username,
    pub app_id: String,
    /// Unix seconds; compared against the wall clock on every use.
    pub expires: f64,
}

impl Session {
    #[must_use]
    pub fn is_expired(&self, now: f64) -> bool {
        self.expires <= now
    }

    /// Slide the expiry window forward from `now`.
    pub fn touch(&mut self, now: f64, max_age_seconds: f64) {
        self.expires = now + max_age_seconds;
    }
}

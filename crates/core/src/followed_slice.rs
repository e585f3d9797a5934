use serde::{Deserialize, Serialize};

use crate::types::{Token, Tracking};

/// A pointer to a slice of another user's data, followed by this user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowedSlice {
    pub id: String,
    pub name: String,
    pub url: String,
    pub access_token: Token,
    #[serde(flatten)]
    pub tracking: Tracking,
}

/// Profile scope addressed by `/profile/{public,app,private}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileScope {
    Public,
    Private,
    /// Resolved per calling app access (namespaced by the access name).
    App,
}

impl ProfileScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::App => "app",
        }
    }
}

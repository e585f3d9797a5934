use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::types::{AccessId, StreamId, Token, Tracking};

/// Permission level of a stream permission atom. Declaration order is the
/// level order: `none < read < create-only < contribute < manage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionLevel {
    None,
    Read,
    CreateOnly,
    Contribute,
    Manage,
}

impl PermissionLevel {
    #[must_use]
    pub fn can_read(self) -> bool {
        matches!(self, Self::Read | Self::Contribute | Self::Manage)
    }

    #[must_use]
    pub fn can_create(self) -> bool {
        matches!(self, Self::CreateOnly | Self::Contribute | Self::Manage)
    }

    #[must_use]
    pub fn can_update(self) -> bool {
        matches!(self, Self::Contribute | Self::Manage)
    }

    #[must_use]
    pub fn can_manage(self) -> bool {
        matches!(self, Self::Manage)
    }
}

/// Setting of a feature permission atom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureSetting {
    Forbidden,
}

/// A permission atom: either a leveled grant on a stream subtree, or a
/// feature switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Permission {
    #[serde(rename_all = "camelCase")]
    Stream {
        stream_id: StreamId,
        level: PermissionLevel,
    },
    Feature {
        feature: String,
        setting: FeatureSetting,
    },
}

/// The feature name controlling whether an access may delete itself.
pub const FEATURE_SELF_REVOKE: &str = "selfRevoke";

/// Access type; determines scoping and lifecycle rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Personal,
    App,
    Shared,
}

/// A scoped credential binding a token to a set of permission atoms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Access {
    pub id: AccessId,
    pub token: Token,
    #[serde(rename = "type")]
    pub access_type: AccessType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_data: Option<Value>,
    #[serde(flatten)]
    pub tracking: Tracking,
}

impl Access {
    /// The access that created this one (`"system"` for personal accesses
    /// materialized at login); carried by the tracking fields.
    #[must_use]
    pub fn created_by(&self) -> &AccessId {
        &self.tracking.created_by
    }

    #[must_use]
    pub fn is_personal(&self) -> bool {
        matches!(self.access_type, AccessType::Personal)
    }

    #[must_use]
    pub fn is_app(&self) -> bool {
        matches!(self.access_type, AccessType::App)
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }

    /// Whether the access is past its `expires` timestamp at `now`.
    #[must_use]
    pub fn is_expired(&self, now: f64) -> bool {
        self.expires.is_some_and(|e| e <= now)
    }

    /// Live means usable for authentication: neither deleted nor expired.
    #[must_use]
    pub fn is_live(&self, now: f64) -> bool {
        !self.is_deleted() && !self.is_expired(now)
    }

    /// Whether a `selfRevoke=forbidden` feature atom is present.
    #[must_use]
    pub fn forbids_self_revoke(&self) -> bool {
        self.permissions.iter().any(|p| {
            matches!(
                p,
                Permission::Feature { feature, setting }
                    if feature == FEATURE_SELF_REVOKE && *setting == FeatureSetting::Forbidden
            )
        })
    }

    /// Validate permission atoms on creation: stream ids must be usable and
    /// feature atoms must be recognized.
    pub fn validate_permissions(permissions: &[Permission]) -> Result<(), ApiError> {
        for p in permissions {
            match p {
                Permission::Stream { stream_id, .. } => {
                    if stream_id.as_str().is_empty() {
                        return Err(ApiError::invalid_parameters_format(
                            "Permission streamId must not be empty",
                        ));
                    }
                }
                Permission::Feature { feature, .. } => {
                    if feature != FEATURE_SELF_REVOKE {
                        return Err(ApiError::invalid_parameters_format(format!(
                            "Unknown feature permission \"{feature}\""
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_order_is_total() {
        use PermissionLevel::{Contribute, CreateOnly, Manage, None, Read};
        assert!(None < Read);
        assert!(Read < CreateOnly);
        assert!(CreateOnly < Contribute);
        assert!(Contribute < Manage);
    }

    #[test]
    fn level_capability_table() {
        use PermissionLevel::{Contribute, CreateOnly, Manage, None, Read};
        assert!(!None.can_read() && !None.can_create());
        assert!(Read.can_read() && !Read.can_create() && !Read.can_update());
        assert!(!CreateOnly.can_read() && CreateOnly.can_create() && !CreateOnly.can_update());
        assert!(Contribute.can_read() && Contribute.can_create() && Contribute.can_update());
        assert!(!Contribute.can_manage());
        assert!(Manage.can_manage());
    }

    #[test]
    fn permission_serde_is_untagged() {
        let p: Permission = serde_json::from_value(serde_json::json!({
            "streamId": "diary",
            "level": "create-only"
        }))
        .unwrap();
        assert!(matches!(
            p,
            Permission::Stream { level: PermissionLevel::CreateOnly, .. }
        ));

        let f: Permission = serde_json::from_value(serde_json::json!({
            "feature": "selfRevoke",
            "setting": "forbidden"
        }))
        .unwrap();
        assert!(matches!(f, Permission::Feature { .. }));
    }

    #[test]
    fn unknown_feature_rejected() {
        let atoms = vec![Permission::Feature {
            feature: "teleport".to_owned(),
            setting: FeatureSetting::Forbidden,
        }];
        assert!(Access::validate_permissions(&atoms).is_err());
    }

    #[test]
    fn expiry_is_inclusive_of_now() {
        let mut a = sample_access();
        a.expires = Some(100.0);
        assert!(a.is_expired(100.0));
        assert!(!a.is_expired(99.9));
        assert!(a.is_live(99.0));
    }

    pub(crate) fn sample_access() -> Access {
        Access {
            id: AccessId::new("a1"),
            token: Token::new("t1"),
            access_type: AccessType::Shared,
            name: "reader".to_owned(),
            device_name: None,
            permissions: vec![Permission::Stream {
                stream_id: StreamId::from("diary"),
                level: PermissionLevel::Read,
            }],
            expires: None,
            deleted: None,
            client_data: None,
            tracking: Tracking::init(1.0, &AccessId::new("creator")),
        }
    }
}

use serde::Deserialize;

use trove_core::DeletionMode;

/// Versioning and deletion behavior for mutable items.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VersioningConfig {
    /// Append the prior state to history on every update.
    #[serde(default)]
    pub force_keep_history: bool,
    /// How much of a deleted item survives.
    #[serde(default)]
    pub deletion_mode: DeletionMode,
}

impl VersioningConfig {
    #[must_use]
    pub fn settings(&self) -> trove_core::VersioningSettings {
        trove_core::VersioningSettings {
            force_keep_history: self.force_keep_history,
            deletion_mode: self.deletion_mode,
        }
    }
}

/// Behavior of item updates.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdatesConfig {
    /// Silently drop protected fields from updates instead of failing.
    #[serde(default)]
    pub ignore_protected_fields: bool,
}

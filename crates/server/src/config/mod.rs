mod auth;
mod messaging;
mod server;
mod versioning;
mod webhooks;

pub use auth::AuthConfig;
pub use messaging::MessagingConfig;
pub use server::ServerConfig;
pub use versioning::{UpdatesConfig, VersioningConfig};
pub use webhooks::WebhooksConfig;

use std::path::Path;

use serde::Deserialize;

use crate::error::ServerError;

/// Root configuration, loaded from a TOML file. Every section falls back
/// to defaults so a bare file (or none at all) boots a development server.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub versioning: VersioningConfig,
    #[serde(default)]
    pub updates: UpdatesConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub attachments: AttachmentsConfig,
    #[serde(default)]
    pub integrity: IntegrityConfig,
    #[serde(default)]
    pub compat: CompatConfig,
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| ServerError::Config(format!("cannot parse {}: {e}", path.display())))
    }
}

/// Attachment file storage.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttachmentsConfig {
    /// Root directory; one subdirectory per user.
    #[serde(default = "default_attachments_dir")]
    pub directory: String,
}

impl Default for AttachmentsConfig {
    fn default() -> Self {
        Self {
            directory: default_attachments_dir(),
        }
    }
}

fn default_attachments_dir() -> String {
    "var/attachments".to_owned()
}

/// Content integrity digests.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntegrityConfig {
    /// Compute digests on event writes.
    #[serde(default)]
    pub events_active: bool,
}

/// Backward-compatibility switches.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompatConfig {
    /// Accept and emit the legacy dot-prefixed system stream ids.
    #[serde(default = "default_true")]
    pub system_streams_prefix_active: bool,
}

impl Default for CompatConfig {
    fn default() -> Self {
        Self {
            system_streams_prefix_active: true,
        }
    }
}

fn default_true() -> bool {
    true
}

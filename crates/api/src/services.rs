use std::sync::Arc;

use trove_core::{BackwardCompat, SystemStreamsModel, VersioningSettings};
use trove_store::{FileStore, Storage};

use crate::auth::TrustedApps;
use crate::bus::Bus;
use crate::cache::UserCache;

/// Per-tenant webhook behavior applied to newly created webhooks.
#[derive(Debug, Clone)]
pub struct WebhookDefaults {
    pub min_interval_ms: u64,
    pub max_retries: u32,
    pub runs_size: usize,
}

impl Default for WebhookDefaults {
    fn default() -> Self {
        Self {
            min_interval_ms: 5000,
            max_retries: 5,
            runs_size: 50,
        }
    }
}

/// Resolved API-level settings, assembled from configuration at boot.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub api_version: String,
    /// Public base URL used when building `apiEndpoint` values.
    pub public_url: String,
    pub versioning: VersioningSettings,
    /// Sliding session lifetime, seconds.
    pub session_max_age_seconds: f64,
    pub password_reset_max_age_seconds: f64,
    pub files_read_token_secret: String,
    pub sso_sign_secret: String,
    pub trusted_apps: TrustedApps,
    /// When set, updates silently drop protected fields instead of failing.
    pub ignore_protected_fields: bool,
    /// Compute integrity digests on event writes.
    pub integrity_events: bool,
    /// How many previous passwords a new password may not repeat.
    pub password_history_length: usize,
    pub webhooks: WebhookDefaults,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            api_version: env!("CARGO_PKG_VERSION").to_owned(),
            public_url: "http://localhost:3000".to_owned(),
            versioning: VersioningSettings::default(),
            session_max_age_seconds: 1209_600.0, // 14 days
            password_reset_max_age_seconds: 3600.0,
            files_read_token_secret: "insecure-dev-secret".to_owned(),
            sso_sign_secret: "insecure-dev-secret".to_owned(),
            trusted_apps: TrustedApps::parse("*@*"),
            ignore_protected_fields: false,
            integrity_events: false,
            password_history_length: 4,
            webhooks: WebhookDefaults::default(),
        }
    }
}

/// Everything the method pipeline needs, constructed once at boot and
/// passed by reference.
pub struct Services {
    pub storage: Arc<dyn Storage>,
    pub files: Arc<dyn FileStore>,
    pub bus: Bus,
    pub cache: UserCache,
    pub system: Arc<SystemStreamsModel>,
    pub compat: BackwardCompat,
    pub settings: ApiSettings,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("compat", &self.compat.is_active())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

pub mod api;
pub mod config;
pub mod error;
pub mod telemetry;

use std::sync::Arc;

use trove_api::{ApiSettings, Bus, Services, TrustedApps, UserCache, WebhookDefaults};
use trove_core::{BackwardCompat, SystemStreamsModel};
use trove_store::{FileStore, Storage};

use crate::api::AppState;
use crate::config::Config;
use crate::error::ServerError;

/// Wire the application state from configuration and backends.
pub fn build_state(
    config: &Config,
    storage: Arc<dyn Storage>,
    files: Arc<dyn FileStore>,
    transport: Option<Arc<dyn trove_api::Transport>>,
) -> Result<AppState, ServerError> {
    let system = Arc::new(SystemStreamsModel::default());
    let settings = ApiSettings {
        api_version: env!("CARGO_PKG_VERSION").to_owned(),
        public_url: config.server.public_url(),
        versioning: config.versioning.settings(),
        session_max_age_seconds: config.auth.session_max_age_ms as f64 / 1000.0,
        password_reset_max_age_seconds: config.auth.password_reset_request_max_age_ms as f64
            / 1000.0,
        files_read_token_secret: config.auth.files_secret(),
        sso_sign_secret: config.auth.sso_sign_secret(),
        trusted_apps: TrustedApps::parse(&config.auth.trusted_apps),
        ignore_protected_fields: config.updates.ignore_protected_fields,
        integrity_events: config.integrity.events_active,
        password_history_length: config.auth.password_history_length,
        webhooks: WebhookDefaults {
            min_interval_ms: config.webhooks.min_interval_ms,
            max_retries: config.webhooks.max_retries,
            runs_size: config.webhooks.runs_size,
        },
    };

    let services = Arc::new(Services {
        storage,
        files,
        bus: Bus::new(256, transport),
        cache: UserCache::new(),
        system: system.clone(),
        compat: BackwardCompat::new(config.compat.system_streams_prefix_active, system),
        settings,
    });

    Ok(AppState {
        api: Arc::new(trove_api::build_api()),
        services,
        admin_access_key: config.auth.admin_access_key.clone().map(Arc::new),
        sso_cookie_domain: config.auth.sso_cookie_domain.clone(),
    })
}

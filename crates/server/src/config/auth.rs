use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

/// Authentication and credential settings.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Key gating the `/system/*` admin surface. When unset, that surface
    /// is disabled entirely (every request 404s).
    pub admin_access_key: Option<SecretString>,
    /// Comma-separated `appId@origin` patterns; `*` wildcards allowed.
    #[serde(default = "default_trusted_apps")]
    pub trusted_apps: String,
    /// Sliding session lifetime in milliseconds.
    #[serde(default = "default_session_max_age_ms")]
    pub session_max_age_ms: u64,
    /// Password-reset request validity in milliseconds.
    #[serde(default = "default_reset_max_age_ms")]
    pub password_reset_request_max_age_ms: u64,
    /// Domain attribute of the SSO cookie.
    pub sso_cookie_domain: Option<String>,
    /// HMAC secret signing the SSO cookie.
    #[serde(default = "default_dev_secret")]
    pub sso_cookie_sign_secret: SecretString,
    /// HMAC secret signing attachment read tokens.
    #[serde(default = "default_dev_secret")]
    pub files_read_token_secret: SecretString,
    /// How many previous passwords a new one may not repeat.
    #[serde(default = "default_password_history_length")]
    pub password_history_length: usize,
}

impl AuthConfig {
    #[must_use]
    pub fn sso_sign_secret(&self) -> String {
        self.sso_cookie_sign_secret.expose_secret().to_owned()
    }

    #[must_use]
    pub fn files_secret(&self) -> String {
        self.files_read_token_secret.expose_secret().to_owned()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_access_key: None,
            trusted_apps: default_trusted_apps(),
            session_max_age_ms: default_session_max_age_ms(),
            password_reset_request_max_age_ms: default_reset_max_age_ms(),
            sso_cookie_domain: None,
            sso_cookie_sign_secret: default_dev_secret(),
            files_read_token_secret: default_dev_secret(),
            password_history_length: default_password_history_length(),
        }
    }
}

fn default_trusted_apps() -> String {
    "*@*".to_owned()
}

fn default_session_max_age_ms() -> u64 {
    1_209_600_000 // 14 days
}

fn default_reset_max_age_ms() -> u64 {
    3_600_000
}

fn default_dev_secret() -> SecretString {
    SecretString::new("insecure-dev-secret".to_owned())
}

fn default_password_history_length() -> usize {
    4
}

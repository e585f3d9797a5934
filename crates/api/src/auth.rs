use std::sync::Arc;

use base64::Engine;
use hmac::{Hmac, Mac};
use regex::Regex;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use trove_core::{unix_now, ApiError, Token, Username};

use crate::context::MethodContext;
use crate::error::StoreResultExt;
use crate::services::Services;

type HmacSha256 = Hmac<Sha256>;

/// Trusted-app patterns from `auth.trusted_apps`: comma-separated
/// `appId@origin` pairs, `*` wildcards allowed in both parts (origins may
/// wildcard paths and subdomains).
#[derive(Debug, Clone)]
pub struct TrustedApps {
    patterns: Vec<(Regex, Regex)>,
}

impl TrustedApps {
    /// Parse the configuration string. Malformed entries are skipped.
    #[must_use]
    pub fn parse(patterns: &str) -> Self {
        let patterns = patterns
            .split(',')
            .filter_map(|entry| {
                let (app_id, origin) = entry.trim().split_once('@')?;
                Some((wildcard_regex(app_id)?, wildcard_regex(origin)?))
            })
            .collect();
        Self { patterns }
    }

    /// Whether `app_id` calling from `origin` is trusted. A missing origin
    /// only matches patterns whose origin part is the `*` wildcard.
    #[must_use]
    pub fn is_trusted(&self, app_id: &str, origin: Option<&str>) -> bool {
        self.patterns.iter().any(|(app_pattern, origin_pattern)| {
            if !app_pattern.is_match(app_id) {
                return false;
            }
            match origin {
                Some(o) => origin_pattern.is_match(o),
                None => origin_pattern.as_str() == "^.*$",
            }
        })
    }
}

fn wildcard_regex(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern.trim()).replace("\\*", ".*");
    Regex::new(&format!("^{escaped}$")).ok()
}

/// Sign a session token into the SSO cookie value:
/// `base64(token).hex(hmac(secret, token))`.
#[must_use]
pub fn sign_sso_cookie(token: &Token, secret: &str) -> String {
    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(token.as_str());
    format!("{payload}.{}", hmac_hex(secret, token.as_str()))
}

/// Verify an SSO cookie value and extract the session token.
#[must_use]
pub fn verify_sso_cookie(cookie: &str, secret: &str) -> Option<Token> {
    let (payload, signature) = cookie.split_once('.')?;
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let token = String::from_utf8(raw).ok()?;
    let expected = hmac_hex(secret, &token);
    if expected.as_bytes().ct_eq(signature.as_bytes()).into() {
        Some(Token::new(token))
    } else {
        None
    }
}

pub(crate) fn hmac_hex(secret: &str, message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("any key length works");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Raw credential material extracted from the request, in resolution order.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuthSource<'a> {
    /// `Authorization` header (raw token, `Bearer ` prefix tolerated).
    pub authorization: Option<&'a str>,
    /// `auth` query parameter.
    pub auth_query: Option<&'a str>,
    /// Signed `sso` cookie value.
    pub sso_cookie: Option<&'a str>,
}

impl<'a> AuthSource<'a> {
    /// Resolve the token following the documented order: header, query
    /// parameter, SSO cookie.
    #[must_use]
    pub fn resolve(&self, sso_secret: &str) -> Option<Token> {
        if let Some(header) = self.authorization {
            let raw = header.strip_prefix("Bearer ").unwrap_or(header);
            return Some(Token::new(raw));
        }
        if let Some(q) = self.auth_query {
            return Some(Token::new(q));
        }
        self.sso_cookie
            .and_then(|cookie| verify_sso_cookie(cookie, sso_secret))
    }
}

/// Authenticate a request against `username`'s space and materialize the
/// method context.
///
/// Personal tokens must be backed by an unexpired session, whose sliding
/// expiry is pushed forward (one store write per use). App and shared
/// tokens must be neither deleted nor past `expires`.
pub async fn authenticate(
    services: &Arc<Services>,
    username: &Username,
    source: AuthSource<'_>,
    compat_disabled: bool,
) -> Result<MethodContext, ApiError> {
    let user = services
        .storage
        .user_by_username(username)
        .await
        .api_err()?
        .ok_or_else(|| ApiError::unknown_resource("user", username.as_str()))?;

    let Some(token) = source.resolve(&services.settings.sso_sign_secret) else {
        return Err(ApiError::invalid_credentials("Missing access token"));
    };

    let access = services
        .storage
        .access_by_token(username, &token)
        .await
        .api_err()?
        .ok_or_else(|| ApiError::invalid_credentials("Invalid access token"))?;

    let now = unix_now();
    if access.is_deleted() {
        return Err(ApiError::invalid_credentials("Access has been revoked"));
    }
    if access.is_expired(now) {
        return Err(ApiError::invalid_credentials("Access has expired"));
    }

    if access.is_personal() {
        let Some(mut session) = services.storage.session_get(&token).await.api_err()? else {
            return Err(ApiError::invalid_credentials("Session not found"));
        };
        if session.is_expired(now) {
            return Err(ApiError::invalid_credentials("Session has expired"));
        }
        session.touch(now, services.settings.session_max_age_seconds);
        services.storage.session_update(&session).await.api_err()?;
        debug!(user = %username, "personal session touched");
    }

    MethodContext::new(services.clone(), user, access, compat_disabled).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trusted_apps_wildcards() {
        let apps = TrustedApps::parse("trove-test@http://test.local, *@https://*.example.com");
        assert!(apps.is_trusted("trove-test", Some("http://test.local")));
        assert!(!apps.is_trusted("trove-test", Some("http://evil.local")));
        assert!(apps.is_trusted("anything", Some("https://app.example.com")));
        assert!(!apps.is_trusted("trove-test", None));

        let open = TrustedApps::parse("*@*");
        assert!(open.is_trusted("whatever", None));
        assert!(open.is_trusted("whatever", Some("http://anywhere")));
    }

    #[test]
    fn sso_cookie_roundtrip_and_tamper() {
        let token = Token::new("session-token");
        let cookie = sign_sso_cookie(&token, "secret");
        assert_eq!(verify_sso_cookie(&cookie, "secret"), Some(token));
        assert_eq!(verify_sso_cookie(&cookie, "other-secret"), None);

        let tampered = cookie.replace('.', "x");
        assert_eq!(verify_sso_cookie(&tampered, "secret"), None);
    }

    #[test]
    fn resolution_order_prefers_header() {
        let source = AuthSource {
            authorization: Some("tok-header"),
            auth_query: Some("tok-query"),
            sso_cookie: None,
        };
        assert_eq!(source.resolve("s"), Some(Token::new("tok-header")));

        let source = AuthSource {
            authorization: None,
            auth_query: Some("tok-query"),
            sso_cookie: None,
        };
        assert_eq!(source.resolve("s"), Some(Token::new("tok-query")));

        let bearer = AuthSource {
            authorization: Some("Bearer tok"),
            ..AuthSource::default()
        };
        assert_eq!(bearer.resolve("s"), Some(Token::new("tok")));
    }

    #[tokio::test]
    async fn authenticate_rejects_unknown_and_expired() {
        let (services, fixture) = crate::testing::services_with_user().await;

        // Unknown token.
        let err = authenticate(
            &services,
            &fixture.username,
            AuthSource {
                authorization: Some("no-such-token"),
                ..AuthSource::default()
            },
            false,
        )
        .await
        .unwrap_err();
        assert_eq!(err.http_status(), 401);

        // Valid personal token works.
        let ctx = authenticate(
            &services,
            &fixture.username,
            AuthSource {
                authorization: Some(fixture.personal_token.as_str()),
                ..AuthSource::default()
            },
            false,
        )
        .await
        .unwrap();
        assert!(ctx.access().unwrap().is_personal());

        // Unknown user masks as 404.
        let err = authenticate(
            &services,
            &Username::new("nobody"),
            AuthSource::default(),
            false,
        )
        .await
        .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }
}

//! User provisioning: public registration and the admin surface.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use trove_core::{unix_now, ApiError, Tracking, User, UserId, Username};

use crate::bus::{Notification, Topic};
use crate::error::StoreResultExt;
use crate::password::hash_password;
use crate::services::Services;

/// Usernames are slugs: lowercase alphanumerics and dashes, starting with
/// an alphanumeric, 4 to 60 characters.
#[must_use]
pub fn is_valid_username(candidate: &str) -> bool {
    let len_ok = (4..=60).contains(&candidate.len());
    let charset_ok = candidate
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let head_ok = candidate
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    len_ok && charset_ok && head_ok
}

/// Create a user: credentials, the per-user collections, and one event per
/// supplied account leaf on its system stream. Indexed leaves claim their
/// unique value first, so a duplicate email fails before anything is
/// written.
pub async fn create_user(services: &Arc<Services>, params: &Value) -> Result<Value, ApiError> {
    let username = params
        .get("username")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::invalid_parameters_format("Missing string \"username\""))?;
    let password = params
        .get("password")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::invalid_parameters_format("Missing string \"password\""))?;

    if !is_valid_username(username) {
        return Err(ApiError::invalid_parameters_format(format!(
            "Invalid username \"{username}\""
        )));
    }
    let username = Username::new(username);

    // Collect account leaves: required ones must be present.
    let mut leaves: Vec<(trove_core::StreamId, String, String, bool)> = Vec::new();
    for def in services.system.account_leaves() {
        match params.get(&def.suffix).and_then(Value::as_str) {
            Some(value) => leaves.push((def.id(), def.suffix.clone(), value.to_owned(), def.indexed)),
            None if def.required_at_registration => {
                return Err(ApiError::invalid_parameters_format(format!(
                    "Missing required field \"{}\"",
                    def.suffix
                )));
            }
            None => {}
        }
    }

    // Claim indexed values before creating anything.
    let mut claimed: Vec<(trove_core::StreamId, String)> = Vec::new();
    for (stream_id, _, value, indexed) in &leaves {
        if !indexed {
            continue;
        }
        if let Err(e) = services
            .storage
            .unique_value_claim(stream_id, value, &username)
            .await
        {
            for (sid, v) in &claimed {
                let _ = services.storage.unique_value_release(sid, v, &username).await;
            }
            return Err(crate::error::map_store_error(e));
        }
        claimed.push((stream_id.clone(), value.clone()));
    }

    let now = unix_now();
    let user = User {
        id: UserId::new(Uuid::new_v4().to_string()),
        username: username.clone(),
        password_hash: hash_password(password)?,
        created: now,
        deleted: None,
    };
    if let Err(e) = services.storage.user_create(&user).await {
        for (sid, v) in &claimed {
            let _ = services.storage.unique_value_release(sid, v, &username).await;
        }
        return Err(crate::error::map_store_error(e));
    }

    let actor = trove_core::AccessId::new(crate::context::SYSTEM_ACTOR);
    for (stream_id, suffix, value, _) in leaves {
        let event = trove_core::Event {
            id: trove_core::EventId::new(Uuid::new_v4().to_string()),
            stream_ids: vec![stream_id],
            event_type: format!("{suffix}/string"),
            time: now,
            duration: None,
            content: Some(json!(value)),
            attachments: Vec::new(),
            tags: Vec::new(),
            client_data: None,
            trashed: false,
            integrity: None,
            deleted: None,
            head_id: None,
            tracking: Tracking::init(now, &actor),
        };
        services
            .storage
            .event_insert(&username, &event)
            .await
            .api_err()?;
    }

    services
        .bus
        .publish(Notification::for_user(Topic::EventsChanged, &username));
    info!(user = %username, "user created");

    Ok(json!({
        "username": username.as_str(),
        "apiEndpoint": format!(
            "{}/{}/",
            services.settings.public_url.trim_end_matches('/'),
            username
        ),
    }))
}

/// Whether a username is free (and well-formed).
pub async fn check_username(services: &Arc<Services>, candidate: &str) -> Result<bool, ApiError> {
    if !is_valid_username(candidate) {
        return Ok(false);
    }
    let taken = services
        .storage
        .user_by_username(&Username::new(candidate))
        .await
        .api_err()?
        .is_some();
    Ok(!taken)
}

/// Whether an email is unclaimed among live users.
pub async fn check_email(services: &Arc<Services>, email: &str) -> Result<bool, ApiError> {
    let probe = Username::new(format!("probe-{}", Uuid::new_v4()));
    let email_stream = trove_core::StreamId::new(":system:email");
    match services
        .storage
        .unique_value_claim(&email_stream, email, &probe)
        .await
    {
        Ok(()) => {
            services
                .storage
                .unique_value_release(&email_stream, email, &probe)
                .await
                .api_err()?;
            Ok(true)
        }
        Err(trove_store::StoreError::Duplicate { .. }) => Ok(false),
        Err(e) => Err(crate::error::map_store_error(e)),
    }
}

/// Admin view of one user.
pub async fn user_info(services: &Arc<Services>, username: &Username) -> Result<Value, ApiError> {
    let user = services
        .storage
        .user_by_username(username)
        .await
        .api_err()?
        .ok_or_else(|| ApiError::unknown_resource("user", username.as_str()))?;
    Ok(json!({
        "username": user.username.as_str(),
        "id": user.id.as_str(),
        "created": user.created,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_slug_rules() {
        assert!(is_valid_username("alice"));
        assert!(is_valid_username("a-1234"));
        assert!(!is_valid_username("abc")); // too short
        assert!(!is_valid_username("Alice")); // uppercase
        assert!(!is_valid_username("-lead")); // leading dash
    }

    #[tokio::test]
    async fn registration_enforces_required_and_unique_email() {
        let (services, _) = crate::testing::services_with_user().await;

        // Missing email.
        let err = create_user(
            &services,
            &json!({ "username": "brand-new", "password": "pw" }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.http_status(), 400);

        let created = create_user(
            &services,
            &json!({ "username": "brand-new", "password": "pw",
                     "email": "new@example.com", "language": "en" }),
        )
        .await
        .unwrap();
        assert_eq!(created["username"], "brand-new");

        // The same email cannot register twice...
        let err = create_user(
            &services,
            &json!({ "username": "other-user", "password": "pw",
                     "email": "new@example.com" }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.http_status(), 409);
        assert!(!check_email(&services, "new@example.com").await.unwrap());

        // ...until its owner is deleted, then the value is reclaimable.
        services
            .storage
            .user_delete(&Username::new("brand-new"))
            .await
            .unwrap();
        create_user(
            &services,
            &json!({ "username": "other-user", "password": "pw",
                     "email": "new@example.com" }),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn availability_checks() {
        let (services, _) = crate::testing::services_with_user().await;
        assert!(!check_username(&services, "alice").await.unwrap());
        assert!(check_username(&services, "someone-else").await.unwrap());
        assert!(!check_username(&services, "NOPE").await.unwrap());
    }
}

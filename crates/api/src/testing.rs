//! Shared fixtures for the crate's unit tests.

use std::sync::Arc;

use trove_core::{
    Access, AccessId, AccessType, Session, Token, Tracking, User, UserId, Username,
};
use trove_store::{LocalFiles, MemoryStorage, Storage};

use crate::bus::Bus;
use crate::cache::UserCache;
use crate::context::MethodContext;
use crate::services::{ApiSettings, Services};

pub(crate) struct Fixture {
    pub username: Username,
    pub personal_token: Token,
    pub personal_access_id: AccessId,
}

/// A service bundle over the in-memory store with user `alice` (password
/// `pw`), a live session, and its personal access.
pub(crate) async fn services_with_user() -> (Arc<Services>, Fixture) {
    let storage = Arc::new(MemoryStorage::new());
    let files_root = std::env::temp_dir().join(format!("trove-test-{}", uuid::Uuid::new_v4()));
    let files = Arc::new(LocalFiles::new(files_root).await.unwrap());

    let username = Username::new("alice");
    let user = User {
        id: UserId::new("u-alice"),
        username: username.clone(),
        password_hash: crate::password::hash_password("pw").unwrap(),
        created: 1.0,
        deleted: None,
    };
    storage.user_create(&user).await.unwrap();

    let token = Token::new("personal-token");
    let access_id = AccessId::new("personal-access");
    let now = trove_core::unix_now();
    storage
        .session_insert(&Session {
            token: token.clone(),
            username: username.clone(),
            app_id: "test-app".to_owned(),
            expires: now + 3600.0,
        })
        .await
        .unwrap();
    storage
        .access_insert(
            &username,
            &Access {
                id: access_id.clone(),
                token: token.clone(),
                access_type: AccessType::Personal,
                name: "test-app".to_owned(),
                device_name: None,
                permissions: Vec::new(),
                expires: None,
                deleted: None,
                client_data: None,
                tracking: Tracking::init(now, &AccessId::new("system")),
            },
        )
        .await
        .unwrap();

    let system = Arc::new(trove_core::SystemStreamsModel::default());
    let services = Arc::new(Services {
        storage,
        files,
        bus: Bus::default(),
        cache: UserCache::new(),
        system: system.clone(),
        compat: trove_core::BackwardCompat::new(true, system),
        settings: ApiSettings::default(),
    });

    (
        services,
        Fixture {
            username,
            personal_token: token,
            personal_access_id: access_id,
        },
    )
}

/// A personal-access context for `alice`.
pub(crate) async fn context() -> MethodContext {
    context_with_settings(|_| {}).await
}

/// A personal-access context for `alice` with tweaked settings.
pub(crate) async fn context_with_settings(
    adjust: impl FnOnce(&mut ApiSettings),
) -> MethodContext {
    let (services, fixture) = services_with_user().await;
    let mut services = Arc::try_unwrap(services)
        .unwrap_or_else(|_| panic!("fixture services must have a sole handle"));
    adjust(&mut services.settings);
    let services = Arc::new(services);

    let user = services
        .storage
        .user_by_username(&fixture.username)
        .await
        .unwrap()
        .unwrap();
    let access = services
        .storage
        .access_get(&fixture.username, &fixture.personal_access_id)
        .await
        .unwrap()
        .unwrap();
    MethodContext::new(services, user, access, false).await.unwrap()
}

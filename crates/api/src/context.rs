use std::sync::Arc;

use trove_core::{
    unix_now, Access, AccessId, ApiError, PermissionView, StreamId, StreamTree, Tracking, User,
    Username,
};

use crate::services::Services;

/// Actor recorded on tracking fields when no access is involved
/// (registration, login, account flows).
pub const SYSTEM_ACTOR: &str = "system";

/// Per-request context: the authenticated user, the resolved access (absent
/// for pre-auth methods such as login), the cached stream tree, and the
/// capability surface consumed by method steps.
pub struct MethodContext {
    pub services: Arc<Services>,
    pub user: User,
    pub username: Username,
    access: Option<Access>,
    tree: Arc<StreamTree>,
    /// Set when the request carried `disable-backward-compatibility-prefix`.
    pub compat_disabled: bool,
}

impl MethodContext {
    /// Build a context for an authenticated access.
    pub async fn new(
        services: Arc<Services>,
        user: User,
        access: Access,
        compat_disabled: bool,
    ) -> Result<Self, ApiError> {
        let tree = services
            .cache
            .stream_tree(services.storage.as_ref(), &user.username)
            .await?;
        Ok(Self {
            username: user.username.clone(),
            services,
            user,
            access: Some(access),
            tree,
            compat_disabled,
        })
    }

    /// Build a context for pre-auth methods (login, registration).
    pub async fn unauthenticated(services: Arc<Services>, user: User) -> Result<Self, ApiError> {
        let tree = services
            .cache
            .stream_tree(services.storage.as_ref(), &user.username)
            .await?;
        Ok(Self {
            username: user.username.clone(),
            services,
            user,
            access: None,
            tree,
            compat_disabled: false,
        })
    }

    /// Wall-clock accessor used for all tracking and expiry decisions.
    #[must_use]
    pub fn now(&self) -> f64 {
        unix_now()
    }

    /// The resolved access; `invalid-credentials` when the method requires
    /// one and the request carried none.
    pub fn access(&self) -> Result<&Access, ApiError> {
        self.access
            .as_ref()
            .ok_or_else(|| ApiError::invalid_credentials("Missing access token"))
    }

    /// The actor id recorded on tracking fields.
    #[must_use]
    pub fn actor(&self) -> AccessId {
        self.access
            .as_ref()
            .map_or_else(|| AccessId::new(SYSTEM_ACTOR), |a| a.id.clone())
    }

    /// Fill `created/createdBy/modified/modifiedBy` for a new item.
    #[must_use]
    pub fn init_tracking(&self) -> Tracking {
        Tracking::init(self.now(), &self.actor())
    }

    #[must_use]
    pub fn tree(&self) -> &StreamTree {
        &self.tree
    }

    /// The permission evaluator over this access and the user's tree.
    pub fn permissions(&self) -> Result<PermissionView<'_>, ApiError> {
        Ok(PermissionView::new(self.access()?, &self.tree))
    }

    /// Reload the stream tree after a stream mutation, dropping the cached
    /// copy and broadcasting the invalidation.
    pub async fn refresh_tree(&mut self) -> Result<(), ApiError> {
        self.services
            .cache
            .invalidate_and_notify(&self.username, &self.services.bus);
        self.tree = self
            .services
            .cache
            .stream_tree(self.services.storage.as_ref(), &self.username)
            .await?;
        Ok(())
    }

    // -- Capability surface ------------------------------------------------

    #[must_use]
    pub fn can_get_events_on_stream(&self, stream_id: &StreamId) -> bool {
        self.permissions()
            .is_ok_and(|p| p.can_get_events_on_stream(stream_id))
    }

    #[must_use]
    pub fn can_create_events_on_stream(&self, stream_id: &StreamId) -> bool {
        self.permissions()
            .is_ok_and(|p| p.can_create_events_on_stream(stream_id))
    }

    #[must_use]
    pub fn can_update_events_on_stream(&self, stream_id: &StreamId) -> bool {
        self.permissions()
            .is_ok_and(|p| p.can_update_events_on_stream(stream_id))
    }

    #[must_use]
    pub fn can_manage_stream(&self, stream_id: &StreamId) -> bool {
        self.permissions()
            .is_ok_and(|p| p.can_manage_stream(stream_id))
    }
}

impl std::fmt::Debug for MethodContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodContext")
            .field("username", &self.username)
            .field("access", &self.access.as_ref().map(|a| a.id.clone()))
            .field("compat_disabled", &self.compat_disabled)
            .finish()
    }
}

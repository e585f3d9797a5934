use async_trait::async_trait;
use serde_json::Value;

use trove_core::{
    Access, AccessId, CompiledQuery, Event, EventDeletion, EventId, FollowedSlice, ItemState,
    Session, Stream, StreamId, Token, User, UserId, Username, Webhook,
};

use crate::error::StoreError;

/// Filtering applied by [`Storage::events_find`]. The stream filter is the
/// compiled query tree emitted by the stream-query compiler; the store
/// adapter interprets it against each event's `streamIds`.
#[derive(Debug, Clone, Default)]
pub struct EventsQuery {
    /// `None` means no stream constraint (all streams the caller resolved).
    pub streams: Option<CompiledQuery>,
    pub from_time: Option<f64>,
    pub to_time: Option<f64>,
    /// Exact types or `prefix/*` masks; empty means all types.
    pub types: Vec<String>,
    pub state: ItemState,
    pub modified_since: Option<f64>,
    pub sort_ascending: bool,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl EventsQuery {
    /// Whether an event passes every non-stream criterion.
    #[must_use]
    pub fn matches_scalar(&self, event: &Event) -> bool {
        match self.state {
            ItemState::Default => {
                if event.trashed {
                    return false;
                }
            }
            ItemState::Trashed => {
                if !event.trashed {
                    return false;
                }
            }
            ItemState::All => {}
        }
        if let Some(from) = self.from_time
            && event.end_time() < from
        {
            return false;
        }
        if let Some(to) = self.to_time
            && event.time > to
        {
            return false;
        }
        if let Some(since) = self.modified_since
            && event.tracking.modified <= since
        {
            return false;
        }
        if !self.types.is_empty() && !self.types.iter().any(|t| type_matches(t, &event.event_type))
        {
            return false;
        }
        true
    }
}

fn type_matches(mask: &str, event_type: &str) -> bool {
    match mask.strip_suffix("/*") {
        Some(prefix) => event_type
            .split_once('/')
            .is_some_and(|(class, _)| class == prefix),
        None => mask == event_type,
    }
}

/// The persistent key-value & document store behind the API: one document
/// collection per entity, scoped per user.
///
/// Implementations must be `Send + Sync`; per-user operations are expected
/// to serialize on the user's document space, nothing is promised across
/// users. The in-memory backend in this crate is the reference
/// implementation; persistent backends plug in behind this trait.
#[async_trait]
pub trait Storage: Send + Sync {
    // -- Users ------------------------------------------------------------

    /// Create a user and its empty collections. Fails with `Duplicate` when
    /// the username is taken by a live user.
    async fn user_create(&self, user: &User) -> Result<(), StoreError>;

    async fn user_by_username(&self, username: &Username) -> Result<Option<User>, StoreError>;

    async fn user_by_id(&self, id: &UserId) -> Result<Option<User>, StoreError>;

    async fn user_update(&self, user: &User) -> Result<(), StoreError>;

    /// Soft-delete the user and drop every per-user collection.
    async fn user_delete(&self, username: &Username) -> Result<(), StoreError>;

    // -- Indexed uniqueness (system-stream values) ------------------------

    /// Claim a unique `(stream, value)` pair for `username`. Returns
    /// `Duplicate` when another live user holds it. Re-claiming one's own
    /// value is a no-op.
    async fn unique_value_claim(
        &self,
        stream_id: &StreamId,
        value: &str,
        username: &Username,
    ) -> Result<(), StoreError>;

    /// Release a unique value previously claimed by `username`.
    async fn unique_value_release(
        &self,
        stream_id: &StreamId,
        value: &str,
        username: &Username,
    ) -> Result<(), StoreError>;

    // -- Accesses ---------------------------------------------------------

    /// Insert an access. Fails with `Duplicate` when a live access with the
    /// same `(name, type, deviceName)` exists.
    async fn access_insert(&self, username: &Username, access: &Access) -> Result<(), StoreError>;

    async fn access_get(
        &self,
        username: &Username,
        id: &AccessId,
    ) -> Result<Option<Access>, StoreError>;

    async fn access_by_token(
        &self,
        username: &Username,
        token: &Token,
    ) -> Result<Option<Access>, StoreError>;

    /// Every access, tombstones included; callers filter.
    async fn access_list(&self, username: &Username) -> Result<Vec<Access>, StoreError>;

    /// Replace an access document by id (used for tombstoning).
    async fn access_update(&self, username: &Username, access: &Access) -> Result<(), StoreError>;

    // -- Streams ----------------------------------------------------------

    /// Insert a stream. Fails with `Duplicate` on id collision with a live
    /// stream (tombstoned ids are reusable).
    async fn stream_insert(&self, username: &Username, stream: &Stream) -> Result<(), StoreError>;

    async fn stream_update(&self, username: &Username, stream: &Stream) -> Result<(), StoreError>;

    /// Drop the stream document and record a tombstone.
    async fn stream_delete(
        &self,
        username: &Username,
        id: &StreamId,
        deleted_at: f64,
    ) -> Result<(), StoreError>;

    /// The user's full flat stream list.
    async fn streams_all(&self, username: &Username) -> Result<Vec<Stream>, StoreError>;

    /// Stream deletion tombstones since `since` (all when `None`).
    async fn stream_deletions(
        &self,
        username: &Username,
        since: Option<f64>,
    ) -> Result<Vec<(StreamId, f64)>, StoreError>;

    // -- Events -----------------------------------------------------------

    /// Insert an event head. A tombstone under the same id is displaced
    /// (deleted ids are reusable).
    async fn event_insert(&self, username: &Username, event: &Event) -> Result<(), StoreError>;

    async fn event_get(
        &self,
        username: &Username,
        id: &EventId,
    ) -> Result<Option<Event>, StoreError>;

    async fn event_update(&self, username: &Username, event: &Event) -> Result<(), StoreError>;

    /// Replace a head with a deletion tombstone.
    async fn event_replace_with_tombstone(
        &self,
        username: &Username,
        id: &EventId,
        deletion: &EventDeletion,
    ) -> Result<(), StoreError>;

    /// Query event heads. Results are sorted by `time` (descending unless
    /// `sort_ascending`), ties broken by `created` descending.
    async fn events_find(
        &self,
        username: &Username,
        query: &EventsQuery,
    ) -> Result<Vec<Event>, StoreError>;

    /// Deletion tombstones modified since `since`.
    async fn event_deletions(
        &self,
        username: &Username,
        since: Option<f64>,
    ) -> Result<Vec<EventDeletion>, StoreError>;

    // -- Event history ----------------------------------------------------

    async fn history_insert(&self, username: &Username, entry: &Event) -> Result<(), StoreError>;

    /// History entries for a head, ascending by `modified`.
    async fn history_for(
        &self,
        username: &Username,
        head_id: &EventId,
    ) -> Result<Vec<Event>, StoreError>;

    async fn history_purge(&self, username: &Username, head_id: &EventId)
        -> Result<(), StoreError>;

    /// Reduce history entries of a head to authorship fields
    /// (`keep-authors` deletion mode).
    async fn history_minimize(
        &self,
        username: &Username,
        head_id: &EventId,
    ) -> Result<(), StoreError>;

    // -- Sessions ---------------------------------------------------------

    async fn session_insert(&self, session: &Session) -> Result<(), StoreError>;

    async fn session_get(&self, token: &Token) -> Result<Option<Session>, StoreError>;

    async fn session_update(&self, session: &Session) -> Result<(), StoreError>;

    async fn session_delete(&self, token: &Token) -> Result<(), StoreError>;

    // -- Followed slices --------------------------------------------------

    async fn followed_slices(&self, username: &Username) -> Result<Vec<FollowedSlice>, StoreError>;

    /// Fails with `Duplicate` when name or url collide.
    async fn followed_slice_insert(
        &self,
        username: &Username,
        slice: &FollowedSlice,
    ) -> Result<(), StoreError>;

    async fn followed_slice_update(
        &self,
        username: &Username,
        slice: &FollowedSlice,
    ) -> Result<(), StoreError>;

    async fn followed_slice_delete(&self, username: &Username, id: &str)
        -> Result<(), StoreError>;

    // -- Profile ----------------------------------------------------------

    /// `scope_key` is `public`, `private`, or `app:<access name>`.
    async fn profile_get(
        &self,
        username: &Username,
        scope_key: &str,
    ) -> Result<Option<Value>, StoreError>;

    async fn profile_set(
        &self,
        username: &Username,
        scope_key: &str,
        data: Value,
    ) -> Result<(), StoreError>;

    // -- Webhooks ---------------------------------------------------------

    async fn webhooks(&self, username: &Username) -> Result<Vec<Webhook>, StoreError>;

    async fn webhook_insert(&self, username: &Username, hook: &Webhook) -> Result<(), StoreError>;

    async fn webhook_update(&self, username: &Username, hook: &Webhook) -> Result<(), StoreError>;

    async fn webhook_delete(&self, username: &Username, id: &str) -> Result<(), StoreError>;

    // -- Password history & reset tokens ----------------------------------

    async fn password_history_push(
        &self,
        username: &Username,
        hash: &str,
        time: f64,
    ) -> Result<(), StoreError>;

    /// Prior password hashes, newest first.
    async fn password_history(&self, username: &Username) -> Result<Vec<(String, f64)>, StoreError>;

    async fn reset_token_insert(
        &self,
        username: &Username,
        token: &Token,
        created: f64,
    ) -> Result<(), StoreError>;

    /// Consume a reset token, returning its creation time.
    async fn reset_token_take(
        &self,
        username: &Username,
        token: &Token,
    ) -> Result<Option<f64>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_masks() {
        assert!(type_matches("note/txt", "note/txt"));
        assert!(type_matches("note/*", "note/txt"));
        assert!(!type_matches("note/*", "activity/plain"));
        assert!(!type_matches("note/txt", "note/html"));
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use trove_core::{
    minimized_history_entry, Access, AccessId, Event, EventDeletion, EventId, FollowedSlice,
    Session, Stream, StreamId, Token, User, UserId, Username, Webhook,
};

use crate::error::StoreError;
use crate::store::{EventsQuery, Storage};

/// All collections of a single user's data space.
#[derive(Debug, Default)]
struct UserSpace {
    user: Option<User>,
    accesses: HashMap<AccessId, Access>,
    streams: Vec<Stream>,
    stream_deletions: Vec<(StreamId, f64)>,
    events: HashMap<EventId, Event>,
    event_tombstones: HashMap<EventId, EventDeletion>,
    /// History entries (with `head_id` set) in insertion order; the
    /// `keep-authors` mode replaces entries with minimized tombstone rows.
    history: Vec<HistoryRow>,
    followed_slices: Vec<FollowedSlice>,
    profile: HashMap<String, Value>,
    webhooks: Vec<Webhook>,
    password_history: Vec<(String, f64)>,
    reset_tokens: HashMap<Token, f64>,
}

#[derive(Debug, Clone)]
enum HistoryRow {
    Full(Event),
    Minimized { head_id: EventId, row: EventDeletion },
}

impl HistoryRow {
    fn head_id(&self) -> &EventId {
        match self {
            Self::Full(e) => e.head_id.as_ref().unwrap_or(&e.id),
            Self::Minimized { head_id, .. } => head_id,
        }
    }
}

/// In-memory [`Storage`] backend over a [`DashMap`] of user spaces.
///
/// Each user's space is guarded by its map entry, which serializes
/// per-user mutations the way a document store serializes per-document
/// writes. Intended for tests and single-node development.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    spaces: DashMap<Username, parking_lot::Mutex<UserSpace>>,
    user_ids: DashMap<UserId, Username>,
    sessions: DashMap<Token, Session>,
    /// `(stream id, value)` -> owner, for indexed system-stream values.
    unique_values: DashMap<(StreamId, String), Username>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_space<T>(
        &self,
        username: &Username,
        f: impl FnOnce(&mut UserSpace) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let Some(space) = self.spaces.get(username) else {
            return Err(StoreError::UnknownUser(username.to_string()));
        };
        let mut guard = space.lock();
        f(&mut guard)
    }
}

fn sort_events(events: &mut [Event], ascending: bool) {
    events.sort_by(|a, b| {
        let primary = a.time.total_cmp(&b.time);
        let tie = a.tracking.created.total_cmp(&b.tracking.created);
        let cmp = primary.then(tie);
        if ascending { cmp } else { cmp.reverse() }
    });
}

#[async_trait]
impl Storage for MemoryStorage {
    // -- Users ------------------------------------------------------------

    async fn user_create(&self, user: &User) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.spaces.entry(user.username.clone()) {
            Entry::Occupied(occupied) => {
                // A soft-deleted space frees the username for reuse.
                let live = occupied.get().lock().user.as_ref().is_some_and(|u| !u.is_deleted());
                if live {
                    return Err(StoreError::duplicate("users", user.username.as_str()));
                }
                let mut guard = occupied.get().lock();
                *guard = UserSpace {
                    user: Some(user.clone()),
                    ..UserSpace::default()
                };
            }
            Entry::Vacant(vacant) => {
                vacant.insert(parking_lot::Mutex::new(UserSpace {
                    user: Some(user.clone()),
                    ..UserSpace::default()
                }));
            }
        }
        self.user_ids.insert(user.id.clone(), user.username.clone());
        Ok(())
    }

    async fn user_by_username(&self, username: &Username) -> Result<Option<User>, StoreError> {
        let Some(space) = self.spaces.get(username) else {
            return Ok(None);
        };
        let guard = space.lock();
        Ok(guard.user.clone().filter(|u| !u.is_deleted()))
    }

    async fn user_by_id(&self, id: &UserId) -> Result<Option<User>, StoreError> {
        let Some(username) = self.user_ids.get(id).map(|u| u.clone()) else {
            return Ok(None);
        };
        self.user_by_username(&username).await
    }

    async fn user_update(&self, user: &User) -> Result<(), StoreError> {
        self.with_space(&user.username, |space| {
            space.user = Some(user.clone());
            Ok(())
        })
    }

    async fn user_delete(&self, username: &Username) -> Result<(), StoreError> {
        // Release unique values held by this user before dropping collections.
        self.unique_values.retain(|_, owner| owner != username);
        self.sessions.retain(|_, s| &s.username != username);
        self.with_space(username, |space| {
            let user = space.user.take().map(|mut u| {
                u.deleted = Some(trove_core::unix_now());
                u
            });
            *space = UserSpace {
                user,
                ..UserSpace::default()
            };
            Ok(())
        })
    }

    // -- Indexed uniqueness -----------------------------------------------

    async fn unique_value_claim(
        &self,
        stream_id: &StreamId,
        value: &str,
        username: &Username,
    ) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        match self
            .unique_values
            .entry((stream_id.clone(), value.to_owned()))
        {
            Entry::Occupied(occupied) if occupied.get() != username => Err(StoreError::duplicate(
                "uniqueValues",
                format!("{stream_id}={value}"),
            )),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(vacant) => {
                vacant.insert(username.clone());
                Ok(())
            }
        }
    }

    async fn unique_value_release(
        &self,
        stream_id: &StreamId,
        value: &str,
        username: &Username,
    ) -> Result<(), StoreError> {
        self.unique_values
            .remove_if(&(stream_id.clone(), value.to_owned()), |_, owner| {
                owner == username
            });
        Ok(())
    }

    // -- Accesses ---------------------------------------------------------

    async fn access_insert(&self, username: &Username, access: &Access) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            let collision = space.accesses.values().any(|a| {
                !a.is_deleted()
                    && a.name == access.name
                    && a.access_type == access.access_type
                    && a.device_name == access.device_name
            });
            if collision {
                return Err(StoreError::duplicate("accesses", &access.name));
            }
            space.accesses.insert(access.id.clone(), access.clone());
            Ok(())
        })
    }

    async fn access_get(
        &self,
        username: &Username,
        id: &AccessId,
    ) -> Result<Option<Access>, StoreError> {
        self.with_space(username, |space| Ok(space.accesses.get(id).cloned()))
    }

    async fn access_by_token(
        &self,
        username: &Username,
        token: &Token,
    ) -> Result<Option<Access>, StoreError> {
        self.with_space(username, |space| {
            Ok(space
                .accesses
                .values()
                .find(|a| &a.token == token)
                .cloned())
        })
    }

    async fn access_list(&self, username: &Username) -> Result<Vec<Access>, StoreError> {
        self.with_space(username, |space| {
            let mut list: Vec<Access> = space.accesses.values().cloned().collect();
            list.sort_by(|a, b| a.tracking.created.total_cmp(&b.tracking.created));
            Ok(list)
        })
    }

    async fn access_update(&self, username: &Username, access: &Access) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            space.accesses.insert(access.id.clone(), access.clone());
            Ok(())
        })
    }

    // -- Streams ----------------------------------------------------------

    async fn stream_insert(&self, username: &Username, stream: &Stream) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            if space.streams.iter().any(|s| s.id == stream.id) {
                return Err(StoreError::duplicate("streams", stream.id.as_str()));
            }
            space.streams.push(stream.clone());
            Ok(())
        })
    }

    async fn stream_update(&self, username: &Username, stream: &Stream) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            let Some(existing) = space.streams.iter_mut().find(|s| s.id == stream.id) else {
                return Err(StoreError::missing("streams", stream.id.as_str()));
            };
            *existing = stream.clone();
            Ok(())
        })
    }

    async fn stream_delete(
        &self,
        username: &Username,
        id: &StreamId,
        deleted_at: f64,
    ) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            space.streams.retain(|s| &s.id != id);
            space.stream_deletions.push((id.clone(), deleted_at));
            Ok(())
        })
    }

    async fn streams_all(&self, username: &Username) -> Result<Vec<Stream>, StoreError> {
        self.with_space(username, |space| Ok(space.streams.clone()))
    }

    async fn stream_deletions(
        &self,
        username: &Username,
        since: Option<f64>,
    ) -> Result<Vec<(StreamId, f64)>, StoreError> {
        self.with_space(username, |space| {
            Ok(space
                .stream_deletions
                .iter()
                .filter(|(_, at)| since.is_none_or(|s| *at > s))
                .cloned()
                .collect())
        })
    }

    // -- Events -----------------------------------------------------------

    async fn event_insert(&self, username: &Username, event: &Event) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            if space.events.contains_key(&event.id) {
                return Err(StoreError::duplicate("events", event.id.as_str()));
            }
            // A tombstoned id is reusable by a new creation.
            space.event_tombstones.remove(&event.id);
            space.events.insert(event.id.clone(), event.clone());
            Ok(())
        })
    }

    async fn event_get(
        &self,
        username: &Username,
        id: &EventId,
    ) -> Result<Option<Event>, StoreError> {
        self.with_space(username, |space| Ok(space.events.get(id).cloned()))
    }

    async fn event_update(&self, username: &Username, event: &Event) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            let Some(existing) = space.events.get_mut(&event.id) else {
                return Err(StoreError::missing("events", event.id.as_str()));
            };
            *existing = event.clone();
            Ok(())
        })
    }

    async fn event_replace_with_tombstone(
        &self,
        username: &Username,
        id: &EventId,
        deletion: &EventDeletion,
    ) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            space.events.remove(id);
            space.event_tombstones.insert(id.clone(), deletion.clone());
            Ok(())
        })
    }

    async fn events_find(
        &self,
        username: &Username,
        query: &EventsQuery,
    ) -> Result<Vec<Event>, StoreError> {
        self.with_space(username, |space| {
            let mut hits: Vec<Event> = space
                .events
                .values()
                .filter(|e| query.matches_scalar(e))
                .filter(|e| {
                    query
                        .streams
                        .as_ref()
                        .is_none_or(|q| q.matches(&e.stream_ids))
                })
                .cloned()
                .collect();
            sort_events(&mut hits, query.sort_ascending);
            let skip = query.skip.unwrap_or(0);
            let mut page: Vec<Event> = hits.into_iter().skip(skip).collect();
            if let Some(limit) = query.limit {
                page.truncate(limit);
            }
            Ok(page)
        })
    }

    async fn event_deletions(
        &self,
        username: &Username,
        since: Option<f64>,
    ) -> Result<Vec<EventDeletion>, StoreError> {
        self.with_space(username, |space| {
            let mut rows: Vec<EventDeletion> = space
                .event_tombstones
                .values()
                .filter(|d| since.is_none_or(|s| d.deleted > s))
                .cloned()
                .collect();
            rows.sort_by(|a, b| a.deleted.total_cmp(&b.deleted));
            Ok(rows)
        })
    }

    // -- Event history ----------------------------------------------------

    async fn history_insert(&self, username: &Username, entry: &Event) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            space.history.push(HistoryRow::Full(entry.clone()));
            Ok(())
        })
    }

    async fn history_for(
        &self,
        username: &Username,
        head_id: &EventId,
    ) -> Result<Vec<Event>, StoreError> {
        self.with_space(username, |space| {
            let mut entries: Vec<Event> = space
                .history
                .iter()
                .filter(|row| row.head_id() == head_id)
                .filter_map(|row| match row {
                    HistoryRow::Full(e) => Some(e.clone()),
                    HistoryRow::Minimized { .. } => None,
                })
                .collect();
            entries.sort_by(|a, b| a.tracking.modified.total_cmp(&b.tracking.modified));
            Ok(entries)
        })
    }

    async fn history_purge(
        &self,
        username: &Username,
        head_id: &EventId,
    ) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            space.history.retain(|row| row.head_id() != head_id);
            Ok(())
        })
    }

    async fn history_minimize(
        &self,
        username: &Username,
        head_id: &EventId,
    ) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            for row in &mut space.history {
                if row.head_id() != head_id {
                    continue;
                }
                if let HistoryRow::Full(e) = row {
                    *row = HistoryRow::Minimized {
                        head_id: head_id.clone(),
                        row: minimized_history_entry(e),
                    };
                }
            }
            Ok(())
        })
    }

    // -- Sessions ---------------------------------------------------------

    async fn session_insert(&self, session: &Session) -> Result<(), StoreError> {
        self.sessions.insert(session.token.clone(), session.clone());
        Ok(())
    }

    async fn session_get(&self, token: &Token) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(token).map(|s| s.clone()))
    }

    async fn session_update(&self, session: &Session) -> Result<(), StoreError> {
        self.sessions.insert(session.token.clone(), session.clone());
        Ok(())
    }

    async fn session_delete(&self, token: &Token) -> Result<(), StoreError> {
        self.sessions.remove(token);
        Ok(())
    }

    // -- Followed slices --------------------------------------------------

    async fn followed_slices(&self, username: &Username) -> Result<Vec<FollowedSlice>, StoreError> {
        self.with_space(username, |space| Ok(space.followed_slices.clone()))
    }

    async fn followed_slice_insert(
        &self,
        username: &Username,
        slice: &FollowedSlice,
    ) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            if space
                .followed_slices
                .iter()
                .any(|s| s.name == slice.name || s.url == slice.url)
            {
                return Err(StoreError::duplicate("followedSlices", &slice.name));
            }
            space.followed_slices.push(slice.clone());
            Ok(())
        })
    }

    async fn followed_slice_update(
        &self,
        username: &Username,
        slice: &FollowedSlice,
    ) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            let Some(existing) = space
                .followed_slices
                .iter_mut()
                .find(|s| s.id == slice.id)
            else {
                return Err(StoreError::missing("followedSlices", &slice.id));
            };
            *existing = slice.clone();
            Ok(())
        })
    }

    async fn followed_slice_delete(
        &self,
        username: &Username,
        id: &str,
    ) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            space.followed_slices.retain(|s| s.id != id);
            Ok(())
        })
    }

    // -- Profile ----------------------------------------------------------

    async fn profile_get(
        &self,
        username: &Username,
        scope_key: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.with_space(username, |space| Ok(space.profile.get(scope_key).cloned()))
    }

    async fn profile_set(
        &self,
        username: &Username,
        scope_key: &str,
        data: Value,
    ) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            space.profile.insert(scope_key.to_owned(), data);
            Ok(())
        })
    }

    // -- Webhooks ---------------------------------------------------------

    async fn webhooks(&self, username: &Username) -> Result<Vec<Webhook>, StoreError> {
        self.with_space(username, |space| Ok(space.webhooks.clone()))
    }

    async fn webhook_insert(&self, username: &Username, hook: &Webhook) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            space.webhooks.push(hook.clone());
            Ok(())
        })
    }

    async fn webhook_update(&self, username: &Username, hook: &Webhook) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            let Some(existing) = space.webhooks.iter_mut().find(|w| w.id == hook.id) else {
                return Err(StoreError::missing("webhooks", &hook.id));
            };
            *existing = hook.clone();
            Ok(())
        })
    }

    async fn webhook_delete(&self, username: &Username, id: &str) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            space.webhooks.retain(|w| w.id != id);
            Ok(())
        })
    }

    // -- Password history & reset tokens ----------------------------------

    async fn password_history_push(
        &self,
        username: &Username,
        hash: &str,
        time: f64,
    ) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            space.password_history.insert(0, (hash.to_owned(), time));
            Ok(())
        })
    }

    async fn password_history(
        &self,
        username: &Username,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.with_space(username, |space| Ok(space.password_history.clone()))
    }

    async fn reset_token_insert(
        &self,
        username: &Username,
        token: &Token,
        created: f64,
    ) -> Result<(), StoreError> {
        self.with_space(username, |space| {
            space.reset_tokens.insert(token.clone(), created);
            Ok(())
        })
    }

    async fn reset_token_take(
        &self,
        username: &Username,
        token: &Token,
    ) -> Result<Option<f64>, StoreError> {
        self.with_space(username, |space| Ok(space.reset_tokens.remove(token)))
    }
}

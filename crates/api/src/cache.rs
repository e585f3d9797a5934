use std::sync::Arc;

use dashmap::DashMap;

use trove_core::{ApiError, StreamTree, Username};
use trove_store::Storage;

use crate::bus::{Bus, Notification, Topic};
use crate::error::StoreResultExt;

/// Per-user cache of the materialized stream tree.
///
/// Any handler for a user may read or invalidate the entry; mutators must
/// invalidate after writing and broadcast the invalidation so other
/// processes drop their copy too.
#[derive(Debug, Default)]
pub struct UserCache {
    trees: DashMap<Username, Arc<StreamTree>>,
}

impl UserCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The user's stream tree, loading and caching it on a miss.
    pub async fn stream_tree(
        &self,
        storage: &dyn Storage,
        username: &Username,
    ) -> Result<Arc<StreamTree>, ApiError> {
        if let Some(tree) = self.trees.get(username) {
            return Ok(tree.clone());
        }
        let streams = storage.streams_all(username).await.api_err()?;
        let tree = Arc::new(StreamTree::build(streams)?);
        self.trees.insert(username.clone(), tree.clone());
        Ok(tree)
    }

    /// Drop the user's cached entries.
    pub fn invalidate(&self, username: &Username) {
        self.trees.remove(username);
    }

    /// Invalidate and broadcast so other processes follow suit.
    pub fn invalidate_and_notify(&self, username: &Username, bus: &Bus) {
        self.invalidate(username);
        bus.publish(Notification::for_user(Topic::CacheInvalidate, username));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trove_core::{AccessId, Stream, StreamId, Tracking, User, UserId};
    use trove_store::MemoryStorage;

    fn stream(id: &str) -> Stream {
        Stream {
            id: StreamId::from(id),
            name: id.to_owned(),
            parent_id: None,
            trashed: false,
            single_activity: false,
            client_data: None,
            tracking: Tracking::init(1.0, &AccessId::new("t")),
        }
    }

    #[tokio::test]
    async fn miss_loads_and_caches() {
        let store = MemoryStorage::new();
        let alice = Username::new("alice");
        store
            .user_create(&User {
                id: UserId::new("u1"),
                username: alice.clone(),
                password_hash: "h".to_owned(),
                created: 1.0,
                deleted: None,
            })
            .await
            .unwrap();
        store.stream_insert(&alice, &stream("a")).await.unwrap();

        let cache = UserCache::new();
        let tree = cache.stream_tree(&store, &alice).await.unwrap();
        assert_eq!(tree.len(), 1);

        // A write behind the cache's back stays invisible until invalidation.
        store.stream_insert(&alice, &stream("b")).await.unwrap();
        let stale = cache.stream_tree(&store, &alice).await.unwrap();
        assert_eq!(stale.len(), 1);

        cache.invalidate(&alice);
        let fresh = cache.stream_tree(&store, &alice).await.unwrap();
        assert_eq!(fresh.len(), 2);
    }
}

use uuid::Uuid;

use trove_core::{
    event_digest, head_tombstone, ApiError, DeletionMode, Event, EventDeletion, EventId, Username,
};

use crate::error::StoreResultExt;
use crate::services::Services;

/// Append the current state of a head to history before an update, when
/// history keeping is on. The archived entry gets a fresh synthetic id and
/// points back at the head.
pub async fn archive_head(
    services: &Services,
    username: &Username,
    head: &Event,
) -> Result<(), ApiError> {
    if !services.settings.versioning.force_keep_history {
        return Ok(());
    }
    let mut entry = head.clone();
    entry.head_id = Some(head.id.clone());
    entry.id = EventId::new(Uuid::new_v4().to_string());
    services
        .storage
        .history_insert(username, &entry)
        .await
        .api_err()
}

/// Delete an event head according to the configured deletion mode,
/// dropping its attachment directory in every mode.
///
/// Returns the deletion record reported to the client.
pub async fn delete_event_head(
    services: &Services,
    username: &Username,
    head: Event,
    now: f64,
) -> Result<EventDeletion, ApiError> {
    let mode = services.settings.versioning.deletion_mode;
    services
        .files
        .remove_event(username, &head.id)
        .await
        .api_err()?;

    match mode {
        DeletionMode::KeepNothing => {
            services
                .storage
                .history_purge(username, &head.id)
                .await
                .api_err()?;
        }
        DeletionMode::KeepAuthors => {
            services
                .storage
                .history_minimize(username, &head.id)
                .await
                .api_err()?;
        }
        DeletionMode::KeepEverything => {}
    }

    let deletion = head_tombstone(mode, &head, now);

    if mode == DeletionMode::KeepEverything {
        // The head keeps every field and gains the deletion timestamp.
        let mut kept = head;
        kept.deleted = Some(now);
        if services.settings.integrity_events {
            kept.integrity = Some(event_digest(&kept));
        }
        services
            .storage
            .event_update(username, &kept)
            .await
            .api_err()?;
    } else {
        services
            .storage
            .event_replace_with_tombstone(username, &deletion.id, &deletion)
            .await
            .api_err()?;
    }

    Ok(deletion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trove_core::{AccessId, StreamId, Tracking, VersioningSettings};
    use trove_store::Storage;

    fn event(id: &str) -> Event {
        Event {
            id: EventId::new(id),
            stream_ids: vec![StreamId::from("diary")],
            event_type: "note/txt".to_owned(),
            time: 10.0,
            duration: None,
            content: None,
            attachments: Vec::new(),
            tags: Vec::new(),
            client_data: None,
            trashed: true,
            integrity: None,
            deleted: None,
            head_id: None,
            tracking: Tracking::init(10.0, &AccessId::new("a")),
        }
    }

    async fn services_with_mode(
        mode: DeletionMode,
        keep_history: bool,
    ) -> (std::sync::Arc<crate::services::Services>, Username) {
        let (services, fixture) = crate::testing::services_with_user().await;
        let mut services = std::sync::Arc::try_unwrap(services).unwrap_or_else(|_| panic!());
        services.settings.versioning = VersioningSettings {
            force_keep_history: keep_history,
            deletion_mode: mode,
        };
        (std::sync::Arc::new(services), fixture.username)
    }

    #[tokio::test]
    async fn archive_respects_history_switch() {
        let (services, alice) = services_with_mode(DeletionMode::KeepNothing, false).await;
        let head = event("e1");
        services.storage.event_insert(&alice, &head).await.unwrap();
        archive_head(&services, &alice, &head).await.unwrap();
        assert!(services
            .storage
            .history_for(&alice, &head.id)
            .await
            .unwrap()
            .is_empty());

        let (services, alice) = services_with_mode(DeletionMode::KeepNothing, true).await;
        services.storage.event_insert(&alice, &head).await.unwrap();
        archive_head(&services, &alice, &head).await.unwrap();
        let history = services.storage.history_for(&alice, &head.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].head_id, Some(head.id.clone()));
        assert_ne!(history[0].id, head.id);
    }

    #[tokio::test]
    async fn keep_nothing_purges_history_and_tombstones() {
        let (services, alice) = services_with_mode(DeletionMode::KeepNothing, true).await;
        let head = event("e1");
        services.storage.event_insert(&alice, &head).await.unwrap();
        archive_head(&services, &alice, &head).await.unwrap();

        delete_event_head(&services, &alice, head.clone(), 20.0)
            .await
            .unwrap();
        assert!(services
            .storage
            .history_for(&alice, &head.id)
            .await
            .unwrap()
            .is_empty());
        assert!(services
            .storage
            .event_get(&alice, &head.id)
            .await
            .unwrap()
            .is_none());
        let deletions = services.storage.event_deletions(&alice, None).await.unwrap();
        assert_eq!(deletions.len(), 1);
        assert!(deletions[0].modified.is_none());
    }

    #[tokio::test]
    async fn keep_everything_retains_head_and_history() {
        let (services, alice) = services_with_mode(DeletionMode::KeepEverything, true).await;
        let head = event("e1");
        services.storage.event_insert(&alice, &head).await.unwrap();
        archive_head(&services, &alice, &head).await.unwrap();

        delete_event_head(&services, &alice, head.clone(), 20.0)
            .await
            .unwrap();
        let kept = services
            .storage
            .event_get(&alice, &head.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.deleted, Some(20.0));
        assert_eq!(kept.event_type, "note/txt");
        assert_eq!(
            services.storage.history_for(&alice, &head.id).await.unwrap().len(),
            1
        );
    }
}

use serde::{Deserialize, Serialize};

use crate::event::{Event, EventDeletion};

/// How much of a deleted item survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletionMode {
    /// History purged; head replaced by a bare tombstone.
    #[default]
    KeepNothing,
    /// History reduced to authorship fields; tombstone keeps authorship.
    KeepAuthors,
    /// History untouched; head keeps all fields plus a `deleted` timestamp.
    KeepEverything,
}

/// Versioning behavior, from configuration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersioningSettings {
    /// Append the prior state to history on every update of a mutable item.
    #[serde(default)]
    pub force_keep_history: bool,
    #[serde(default)]
    pub deletion_mode: DeletionMode,
}

impl VersioningSettings {
    /// Whether deleting a head purges its history entries.
    #[must_use]
    pub fn purges_history(self) -> bool {
        self.deletion_mode == DeletionMode::KeepNothing
    }

    /// Whether deleting a head reduces history entries to authorship.
    #[must_use]
    pub fn minimizes_history(self) -> bool {
        self.deletion_mode == DeletionMode::KeepAuthors
    }
}

/// Strip a history entry down to authorship (`keep-authors` mode): only the
/// head link and modification tracking survive.
#[must_use]
pub fn minimized_history_entry(entry: &Event) -> EventDeletion {
    EventDeletion {
        id: entry.head_id.clone().unwrap_or_else(|| entry.id.clone()),
        deleted: entry.tracking.modified,
        modified: Some(entry.tracking.modified),
        modified_by: Some(entry.tracking.modified_by.clone()),
        integrity: None,
    }
}

/// The tombstone replacing a deleted head in `keep-nothing` and
/// `keep-authors` modes.
#[must_use]
pub fn head_tombstone(mode: DeletionMode, head: &Event, deleted_at: f64) -> EventDeletion {
    match mode {
        DeletionMode::KeepNothing => EventDeletion {
            id: head.id.clone(),
            deleted: deleted_at,
            modified: None,
            modified_by: None,
            integrity: head.integrity.clone(),
        },
        DeletionMode::KeepAuthors | DeletionMode::KeepEverything => EventDeletion {
            id: head.id.clone(),
            deleted: deleted_at,
            modified: Some(deleted_at),
            modified_by: Some(head.tracking.modified_by.clone()),
            integrity: head.integrity.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccessId, EventId, StreamId, Tracking};

    fn head() -> Event {
        Event {
            id: EventId::new("e1"),
            stream_ids: vec![StreamId::from("diary")],
            event_type: "note/txt".to_owned(),
            time: 10.0,
            duration: None,
            content: Some(serde_json::json!("hello")),
            attachments: Vec::new(),
            tags: Vec::new(),
            client_data: None,
            trashed: true,
            integrity: Some("sha256-abc".to_owned()),
            deleted: None,
            head_id: None,
            tracking: Tracking::init(10.0, &AccessId::new("author")),
        }
    }

    #[test]
    fn keep_nothing_tombstone_is_bare() {
        let t = head_tombstone(DeletionMode::KeepNothing, &head(), 20.0);
        assert_eq!(t.deleted, 20.0);
        assert!(t.modified.is_none());
        assert!(t.modified_by.is_none());
        assert_eq!(t.integrity.as_deref(), Some("sha256-abc"));
    }

    #[test]
    fn keep_authors_tombstone_keeps_authorship() {
        let t = head_tombstone(DeletionMode::KeepAuthors, &head(), 20.0);
        assert_eq!(t.modified, Some(20.0));
        assert_eq!(t.modified_by.as_deref(), Some("author"));
    }

    #[test]
    fn minimized_history_points_at_head() {
        let mut entry = head();
        entry.id = EventId::new("hist-1");
        entry.head_id = Some(EventId::new("e1"));
        let m = minimized_history_entry(&entry);
        assert_eq!(m.id.as_str(), "e1");
        assert_eq!(m.modified_by.as_deref(), Some("author"));
    }

    #[test]
    fn mode_flags() {
        let keep_nothing = VersioningSettings {
            force_keep_history: false,
            deletion_mode: DeletionMode::KeepNothing,
        };
        assert!(keep_nothing.purges_history());
        let keep_authors = VersioningSettings {
            force_keep_history: true,
            deletion_mode: DeletionMode::KeepAuthors,
        };
        assert!(keep_authors.minimizes_history());
    }

    #[test]
    fn deletion_mode_serde_is_kebab() {
        let mode: DeletionMode = serde_json::from_str("\"keep-everything\"").unwrap();
        assert_eq!(mode, DeletionMode::KeepEverything);
    }
}
